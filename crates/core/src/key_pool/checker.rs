use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use futures_util::StreamExt;
use futures_util::stream::FuturesUnordered;
use reqwest::Url;
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep, sleep_until};
use tracing::{debug, error, info, warn};

use crate::classify::{extract_error_message, extract_error_type};
use crate::key_pool::key::{Backend, Capability, DisableReason, Key, KeyPatch};
use crate::key_pool::policy::{google_tier, openai_tier};
use crate::key_pool::store::KeyStore;
use crate::service::Service;

pub const KEY_CHECK_PERIOD: Duration = Duration::from_secs(60 * 60);
pub const MIN_CHECK_INTERVAL: Duration = Duration::from_secs(3);
const STARTUP_BATCH_SIZE: usize = 10;
const STARTUP_BATCH_SPACING: Duration = Duration::from_millis(500);
const RATE_LIMITED_RECHECK: Duration = Duration::from_secs(30);
const NETWORK_ERROR_RECHECK: Duration = Duration::from_secs(60);

fn key_check_timeout_ms() -> u64 {
    std::env::var("LLM_RELAY_KEY_CHECK_TIMEOUT_MS")
        .ok()
        .and_then(|s| s.trim().parse::<u64>().ok())
        .filter(|&n| n > 0)
        .unwrap_or(10_000)
        .clamp(500, 60_000)
}

fn shorten_err(err: &str, max: usize) -> String {
    if err.chars().count() <= max {
        return err.to_string();
    }
    err.chars().take(max.saturating_sub(1)).collect::<String>() + "…"
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeVerdict {
    /// The key works. `Some` replaces its capability flags.
    Valid {
        capabilities: Option<BTreeSet<Capability>>,
    },
    Revoked,
    OverQuota,
    RecheckIn(Duration),
    /// Logged and treated as still valid.
    Unclassified(String),
}

/// Interpret a liveness probe response.
pub fn classify_probe(service: Service, status: u16, body: &[u8]) -> ProbeVerdict {
    if (200..300).contains(&status) {
        return ProbeVerdict::Valid {
            capabilities: capabilities_from_model_list(service, body),
        };
    }

    let json = serde_json::from_slice::<Value>(body).ok();
    let err_type = json
        .as_ref()
        .and_then(extract_error_type)
        .unwrap_or_default()
        .to_ascii_lowercase();
    let err_msg = json
        .as_ref()
        .and_then(extract_error_message)
        .unwrap_or_default()
        .to_ascii_lowercase();

    match status {
        // Probes send a deliberately incomplete body; a validation error proves the key
        // authenticated.
        400 if err_type == "invalid_request_error" => ProbeVerdict::Valid { capabilities: None },
        401 | 403 => ProbeVerdict::Revoked,
        429 => match err_type.as_str() {
            "insufficient_quota" => ProbeVerdict::OverQuota,
            "billing_not_active" | "access_terminated" => ProbeVerdict::Revoked,
            "tokens" => ProbeVerdict::Valid { capabilities: None },
            "requests" | "rate_limit_error" | "rate_limit_exceeded" => {
                ProbeVerdict::RecheckIn(RATE_LIMITED_RECHECK)
            }
            _ if err_msg.contains("tokens per min") => ProbeVerdict::Valid { capabilities: None },
            _ if err_msg.contains("requests per min") || err_msg.contains("rate limit") => {
                ProbeVerdict::RecheckIn(RATE_LIMITED_RECHECK)
            }
            other => ProbeVerdict::Unclassified(format!("HTTP 429 type={other}")),
        },
        _ => ProbeVerdict::Unclassified(shorten_err(&format!("HTTP {status} {err_msg}"), 140)),
    }
}

fn capabilities_from_model_list(service: Service, body: &[u8]) -> Option<BTreeSet<Capability>> {
    let v = serde_json::from_slice::<Value>(body).ok()?;
    match service {
        Service::OpenAi => {
            let data = v.get("data")?.as_array()?;
            Some(
                data.iter()
                    .filter_map(|m| m.get("id")?.as_str())
                    .filter_map(openai_tier)
                    .collect(),
            )
        }
        Service::Google => {
            let models = v.get("models")?.as_array()?;
            Some(
                models
                    .iter()
                    .filter_map(|m| m.get("name")?.as_str())
                    .filter(|name| name.contains("gemini"))
                    .map(google_tier)
                    .collect(),
            )
        }
        _ => None,
    }
}

fn probe_url(base_url: &str, path: &str) -> anyhow::Result<Url> {
    let base = Url::parse(base_url).with_context(|| format!("invalid base_url: {base_url}"))?;
    Ok(base.join(path)?)
}

/// Background liveness prober for one vendor's keys.
pub struct KeyChecker {
    store: Arc<KeyStore>,
    client: reqwest::Client,
    base_url: String,
    last_check_at: Option<Instant>,
}

impl KeyChecker {
    pub fn new(store: Arc<KeyStore>, client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            store,
            client,
            base_url: base_url.into(),
            last_check_at: None,
        }
    }

    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let service = self.store.service();
        info!(%service, "key checker started");
        loop {
            if *shutdown.borrow() {
                break;
            }

            let batch = self.store.unchecked_ids(STARTUP_BATCH_SIZE);
            if !batch.is_empty() {
                tokio::select! {
                    _ = sleep(STARTUP_BATCH_SPACING) => {}
                    _ = shutdown.changed() => break,
                }
                self.check_batch(&batch).await;
                continue;
            }

            let (id, due) = match self.store.next_due_check(KEY_CHECK_PERIOD) {
                Some(next) => next,
                None => {
                    debug!(%service, "no active keys to check; waiting for recheck");
                    tokio::select! {
                        _ = self.store.checker_wakeup().notified() => {}
                        _ = shutdown.changed() => break,
                    }
                    continue;
                }
            };
            let at = match self.last_check_at {
                Some(last) => due.max(last + MIN_CHECK_INTERVAL),
                None => due,
            };
            tokio::select! {
                _ = sleep_until(at) => {}
                _ = self.store.checker_wakeup().notified() => continue,
                _ = shutdown.changed() => break,
            }
            self.check_batch(&[id]).await;
        }
        info!(%service, "key checker stopped");
    }

    async fn check_batch(&mut self, ids: &[String]) {
        let keys = self.store.keys_by_id(ids);
        let results = {
            let this = &*self;
            let mut futs = keys
                .iter()
                .filter(|k| k.is_active())
                .map(|key| async move { (key.id().to_string(), this.probe(key).await) })
                .collect::<FuturesUnordered<_>>();
            let mut out = Vec::new();
            while let Some(res) = futs.next().await {
                out.push(res);
            }
            out
        };
        for (id, verdict) in results {
            self.apply(&id, verdict);
        }
        self.last_check_at = Some(Instant::now());
    }

    /// Send one probe for `key` and classify the outcome.
    pub async fn probe(&self, key: &Key) -> ProbeVerdict {
        let service = key.service();
        if let Backend::Aws { region, .. } = key.backend() {
            debug!(key = %key.id(), region, "skipping liveness probe for AWS-hosted key");
            return ProbeVerdict::Valid { capabilities: None };
        }

        let timeout = Duration::from_millis(key_check_timeout_ms());
        let req = match self.build_probe(key) {
            Ok(req) => req.timeout(timeout),
            Err(err) => {
                return ProbeVerdict::Unclassified(shorten_err(&err.to_string(), 140));
            }
        };

        match req.send().await {
            Ok(resp) => {
                let status = resp.status().as_u16();
                let body = resp.bytes().await.unwrap_or_default();
                classify_probe(service, status, &body)
            }
            Err(err) => {
                warn!(%service, key = %key.id(), "key check failed: {}", shorten_err(&err.to_string(), 140));
                ProbeVerdict::RecheckIn(NETWORK_ERROR_RECHECK)
            }
        }
    }

    fn build_probe(&self, key: &Key) -> anyhow::Result<reqwest::RequestBuilder> {
        let secret = key.secret();
        let req = match key.service() {
            Service::Anthropic => self
                .client
                .post(probe_url(&self.base_url, "/v1/messages")?)
                .header("x-api-key", secret)
                .header("anthropic-version", "2023-06-01")
                .json(&serde_json::json!({ "model": "claude-3-haiku-20240307", "max_tokens": 1 })),
            Service::Google => self
                .client
                .get(probe_url(&self.base_url, "/v1beta/models")?)
                .header("x-goog-api-key", secret),
            _ => self
                .client
                .get(probe_url(&self.base_url, "/v1/models")?)
                .bearer_auth(secret),
        };
        Ok(req.header("Accept", "application/json"))
    }

    fn apply(&self, id: &str, verdict: ProbeVerdict) {
        let now = Instant::now();
        let service = self.store.service();
        match verdict {
            ProbeVerdict::Valid { capabilities } => {
                let patch = capabilities.map(|caps| KeyPatch {
                    capabilities: Some(caps),
                    ..KeyPatch::default()
                });
                self.store
                    .record_check(id, now + KEY_CHECK_PERIOD, patch.as_ref());
                debug!(%service, key = id, "key checked");
            }
            ProbeVerdict::Revoked => {
                let _ = self.store.disable(id, DisableReason::Revoked);
                self.store.record_check(id, now + KEY_CHECK_PERIOD, None);
            }
            ProbeVerdict::OverQuota => {
                let _ = self.store.disable(id, DisableReason::Quota);
                self.store.record_check(id, now + KEY_CHECK_PERIOD, None);
            }
            ProbeVerdict::RecheckIn(delay) => {
                info!(%service, key = id, delay_ms = delay.as_millis() as u64, "key check deferred");
                self.store.record_check(id, now + delay, None);
            }
            ProbeVerdict::Unclassified(reason) => {
                error!(%service, key = id, "unexpected key check result, assuming key is valid: {}", reason);
                self.store.record_check(id, now + KEY_CHECK_PERIOD, None);
            }
        }
    }
}
