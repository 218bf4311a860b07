use std::cmp::Ordering;
use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard, OnceLock};
use std::time::Duration;

use axum::http::HeaderMap;
use regex::Regex;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::PoolError;
use crate::key_pool::key::{DisableReason, Key, KeyPatch, KeySnapshot, KeyStatus, key_id};
use crate::key_pool::policy::{
    VendorPolicy, backend_serves, default_capabilities, parse_credential, required_capability,
};
use crate::service::Service;

/// Upper bound for lockouts derived from `x-ratelimit-reset-*` headers.
const MAX_HEADER_RESET: Duration = Duration::from_secs(10);

/// Owns every key of one vendor. Each method holds the lock for a short synchronous section
/// and never across an `.await`, so select/sort/pick/stamp is one atomic step.
pub struct KeyStore {
    service: Service,
    policy: VendorPolicy,
    keys: Mutex<Vec<Key>>,
    wake_checker: Notify,
}

impl KeyStore {
    pub fn new(service: Service) -> Self {
        Self::with_policy(service, VendorPolicy::for_service(service))
    }

    pub fn with_policy(service: Service, policy: VendorPolicy) -> Self {
        Self {
            service,
            policy,
            keys: Mutex::new(Vec::new()),
            wake_checker: Notify::new(),
        }
    }

    pub fn service(&self) -> Service {
        self.service
    }

    pub fn policy(&self) -> VendorPolicy {
        self.policy
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Key>> {
        match self.keys.lock() {
            Ok(g) => g,
            Err(e) => e.into_inner(),
        }
    }

    /// Parse a comma-separated credential list. Duplicates and malformed entries are skipped.
    /// Returns the number of keys added.
    pub fn load(&self, credentials: &str) -> usize {
        let mut added = 0;
        for raw in credentials.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            match self.add(raw) {
                Ok(_) => added += 1,
                Err(PoolError::DuplicateKey) => {}
                Err(err) => warn!(service = %self.service, "skipping credential: {}", err),
            }
        }
        if added > 0 {
            info!(service = %self.service, count = added, "loaded keys");
        }
        added
    }

    pub fn add(&self, raw: &str) -> Result<String, PoolError> {
        let (secret, backend) =
            parse_credential(self.service, raw).ok_or(PoolError::UnrecognizedCredential)?;
        let key = Key::new(
            self.service,
            secret,
            backend,
            default_capabilities(self.service),
        );
        let id = key.id.clone();
        {
            let mut keys = self.lock();
            if keys.iter().any(|k| k.id == id) {
                return Err(PoolError::DuplicateKey);
            }
            keys.push(key);
        }
        self.wake_checker.notify_one();
        Ok(id)
    }

    pub fn delete(&self, id: &str) -> bool {
        let mut keys = self.lock();
        let before = keys.len();
        keys.retain(|k| k.id != id);
        let removed = keys.len() != before;
        if removed {
            info!(service = %self.service, key = id, "key deleted");
        }
        removed
    }

    pub fn contains_secret(&self, secret: &str) -> bool {
        let id = key_id(self.service, secret);
        self.lock().iter().any(|k| k.id == id)
    }

    fn eligible(&self, key: &Key, model: &str) -> bool {
        if !key.is_active() {
            return false;
        }
        if let Some(cap) = required_capability(self.service, model)
            && !key.has_capability(cap)
        {
            return false;
        }
        backend_serves(&key.backend, model)
    }

    /// Pick the best key for `model`.
    ///
    /// Keys outside a lockout window come first, least recently used first; locked-out keys
    /// follow, earliest expiry first. With `apply_lockout` the chosen key is stamped as used
    /// and locked for the vendor's reuse delay before the copy is returned.
    pub fn select(&self, model: &str, apply_lockout: bool) -> Result<Key, PoolError> {
        let now = Instant::now();
        let mut keys = self.lock();
        let idx = keys
            .iter()
            .enumerate()
            .filter(|(_, k)| self.eligible(k, model))
            .min_by(|(_, a), (_, b)| selection_order(a, b, now))
            .map(|(idx, _)| idx)
            .ok_or_else(|| PoolError::NoKeysAvailable {
                service: self.service,
                model: model.to_string(),
            })?;

        let key = &mut keys[idx];
        if apply_lockout {
            key.last_used = Some(now);
            key.rate_limited_at = Some(now);
            key.rate_limited_until = Some(now + self.policy.reuse_delay);
            key.touch();
        }
        debug!(service = %self.service, key = %key.id, model, "selected key");
        Ok(key.clone())
    }

    pub fn mark_rate_limited(&self, id: &str) -> Result<(), PoolError> {
        let now = Instant::now();
        self.with_key(id, |key| {
            key.rate_limited_at = Some(now);
            key.rate_limited_until = Some(now + self.policy.lockout);
            key.touch();
            warn!(service = %key.service, key = %key.id, "key rate limited");
        })
    }

    /// Idempotent. A revoked key stays revoked even when later disabled for quota.
    pub fn disable(&self, id: &str, reason: DisableReason) -> Result<(), PoolError> {
        let changed = self.with_key(id, |key| {
            let target = match reason {
                DisableReason::Revoked => KeyStatus::Revoked,
                DisableReason::Quota if key.status == KeyStatus::Revoked => KeyStatus::Revoked,
                DisableReason::Quota => KeyStatus::Disabled,
            };
            let target_reason = if target == KeyStatus::Revoked {
                DisableReason::Revoked
            } else {
                reason
            };
            if key.status == target && key.disable_reason == Some(target_reason) {
                return false;
            }
            key.status = target;
            key.disable_reason = Some(target_reason);
            key.touch();
            warn!(service = %key.service, key = %key.id, reason = ?target_reason, "key disabled");
            true
        })?;
        if changed && self.available() == 0 {
            warn!(service = %self.service, "no active keys left");
        }
        Ok(())
    }

    /// Apply `patch` to a key. When `expected_version` is given the update only lands if the
    /// key has not changed since that version was observed. Returns the new version.
    pub fn update(
        &self,
        id: &str,
        expected_version: Option<u64>,
        patch: &KeyPatch,
    ) -> Result<u64, PoolError> {
        let mut keys = self.lock();
        let key = keys
            .iter_mut()
            .find(|k| k.id == id)
            .ok_or_else(|| PoolError::KeyNotFound(id.to_string()))?;
        if let Some(expected) = expected_version
            && expected != key.version
        {
            return Err(PoolError::StaleVersion {
                id: id.to_string(),
                expected,
                actual: key.version,
            });
        }
        if !patch.is_empty() {
            patch.apply(key);
            key.touch();
        }
        Ok(key.version)
    }

    /// Extend a key's lockout from the vendor's `x-ratelimit-reset-*` response headers.
    pub fn update_rate_limits(&self, id: &str, headers: &HeaderMap) -> Result<(), PoolError> {
        let reset = ["x-ratelimit-reset-requests", "x-ratelimit-reset-tokens"]
            .iter()
            .filter_map(|name| headers.get(*name)?.to_str().ok())
            .filter_map(parse_reset_duration)
            .max();
        let Some(reset) = reset else {
            return Ok(());
        };
        let reset = reset.min(MAX_HEADER_RESET);
        let now = Instant::now();
        self.with_key(id, |key| {
            let until = key.rate_limited_at.unwrap_or(now) + reset;
            if key.rate_limited_until.is_none_or(|cur| cur < until) {
                key.rate_limited_until = Some(until);
                key.touch();
            }
        })
    }

    pub fn increment_prompt(&self, id: &str) -> Result<(), PoolError> {
        self.with_key(id, |key| {
            key.prompt_count = key.prompt_count.saturating_add(1);
            key.touch();
        })
    }

    /// Zero when some eligible key is free, or when no key is eligible at all (so the
    /// request goes through and fails with a clear error instead of waiting forever).
    pub fn lockout_period(&self, model: &str) -> Duration {
        let now = Instant::now();
        let keys = self.lock();
        let mut soonest: Option<Duration> = None;
        for key in keys.iter().filter(|k| self.eligible(k, model)) {
            let remaining = key
                .rate_limited_until
                .map(|until| until.saturating_duration_since(now))
                .unwrap_or(Duration::ZERO);
            if remaining.is_zero() {
                return Duration::ZERO;
            }
            soonest = Some(soonest.map_or(remaining, |s| s.min(remaining)));
        }
        soonest.unwrap_or(Duration::ZERO)
    }

    /// Re-activate every key and forget previous check results so the checker probes them
    /// again.
    pub fn recheck(&self) {
        {
            let mut keys = self.lock();
            for key in keys.iter_mut() {
                key.status = KeyStatus::Active;
                key.disable_reason = None;
                key.last_checked = None;
                key.next_check_at = None;
                key.touch();
            }
            info!(service = %self.service, count = keys.len(), "keys queued for recheck");
        }
        self.wake_checker.notify_one();
    }

    pub fn available(&self) -> usize {
        self.lock().iter().filter(|k| k.is_active()).count()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn any_unchecked(&self) -> bool {
        self.lock()
            .iter()
            .any(|k| k.is_active() && k.last_checked.is_none())
    }

    pub fn get(&self, id: &str) -> Option<KeySnapshot> {
        let now = Instant::now();
        self.lock().iter().find(|k| k.id == id).map(|k| k.snapshot(now))
    }

    pub fn list(&self) -> Vec<KeySnapshot> {
        let now = Instant::now();
        self.lock().iter().map(|k| k.snapshot(now)).collect()
    }

    pub(crate) fn checker_wakeup(&self) -> &Notify {
        &self.wake_checker
    }

    /// Copies of the given keys, skipping ids that disappeared meanwhile.
    pub(crate) fn keys_by_id(&self, ids: &[String]) -> Vec<Key> {
        let wanted: HashSet<&str> = ids.iter().map(String::as_str).collect();
        self.lock()
            .iter()
            .filter(|k| wanted.contains(k.id.as_str()))
            .cloned()
            .collect()
    }

    pub(crate) fn unchecked_ids(&self, limit: usize) -> Vec<String> {
        self.lock()
            .iter()
            .filter(|k| k.is_active() && k.last_checked.is_none())
            .take(limit)
            .map(|k| k.id.clone())
            .collect()
    }

    /// The active key whose next periodic check is due first.
    pub(crate) fn next_due_check(&self, period: Duration) -> Option<(String, Instant)> {
        self.lock()
            .iter()
            .filter(|k| k.is_active())
            .filter_map(|k| {
                let due = k.next_check_at.or_else(|| k.last_checked.map(|t| t + period))?;
                Some((k.id.clone(), due))
            })
            .min_by_key(|(_, due)| *due)
    }

    pub(crate) fn record_check(&self, id: &str, next_check_at: Instant, patch: Option<&KeyPatch>) {
        let now = Instant::now();
        let _ = self.with_key(id, |key| {
            key.last_checked = Some(now);
            key.next_check_at = Some(next_check_at);
            if let Some(patch) = patch {
                patch.apply(key);
            }
            key.touch();
        });
    }

    fn with_key<T>(&self, id: &str, f: impl FnOnce(&mut Key) -> T) -> Result<T, PoolError> {
        let mut keys = self.lock();
        let key = keys
            .iter_mut()
            .find(|k| k.id == id)
            .ok_or_else(|| PoolError::KeyNotFound(id.to_string()))?;
        Ok(f(key))
    }
}

fn selection_order(a: &Key, b: &Key, now: Instant) -> Ordering {
    match (a.is_locked_out(now), b.is_locked_out(now)) {
        (false, true) => Ordering::Less,
        (true, false) => Ordering::Greater,
        (true, true) => a.rate_limited_until.cmp(&b.rate_limited_until),
        (false, false) => a.last_used.cmp(&b.last_used),
    }
}

/// Parse reset hints such as `21.0032s`, `250ms`, or `1m30s`.
pub fn parse_reset_duration(raw: &str) -> Option<Duration> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"(\d+(?:\.\d+)?)(ms|h|m|s)").expect("reset regex is valid"));
    let mut total_ms = 0f64;
    let mut matched = false;
    for cap in re.captures_iter(raw.trim()) {
        let value: f64 = cap[1].parse().ok()?;
        let unit_ms = match &cap[2] {
            "ms" => 1.0,
            "s" => 1_000.0,
            "m" => 60_000.0,
            "h" => 3_600_000.0,
            _ => return None,
        };
        total_ms += value * unit_ms;
        matched = true;
    }
    matched.then(|| Duration::from_millis(total_ms.round() as u64))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use pretty_assertions::assert_eq;

    fn store_with(service: Service, secrets: &[&str]) -> (KeyStore, Vec<String>) {
        let store = KeyStore::new(service);
        let ids = secrets
            .iter()
            .map(|s| store.add(s).expect("add key"))
            .collect();
        (store, ids)
    }

    #[test]
    fn load_dedupes_and_skips_malformed_entries() {
        let store = KeyStore::new(Service::Mistral);
        let added = store.load("k1, k2 ,k1,,bad key,k3");
        assert_eq!(added, 3);
        assert_eq!(store.len(), 3);
    }

    #[test]
    fn disabling_one_of_three_keys_leaves_two_available() {
        let (store, ids) = store_with(Service::Mistral, &["a", "b", "c"]);
        store.disable(&ids[1], DisableReason::Quota).unwrap();
        assert_eq!(store.available(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn fresh_keys_are_selected_in_insertion_order() {
        let (store, ids) = store_with(Service::Mistral, &["a", "b", "c"]);
        let key = store.select("mistral-large-latest", false).unwrap();
        assert_eq!(key.id(), ids[0]);
    }

    #[tokio::test(start_paused = true)]
    async fn selection_rotates_least_recently_used() {
        let (store, ids) = store_with(Service::Mistral, &["a", "b", "c"]);
        let model = "mistral-large-latest";
        let picked: Vec<String> = (0..3)
            .map(|_| store.select(model, true).unwrap().id().to_string())
            .collect();
        assert_eq!(picked, ids);

        // Every key is now inside its reuse window; the one that expires first wins.
        let again = store.select(model, true).unwrap();
        assert_eq!(again.id(), ids[0]);
    }

    #[tokio::test(start_paused = true)]
    async fn inactive_keys_are_never_selected() {
        let (store, ids) = store_with(Service::Mistral, &["a", "b"]);
        store.disable(&ids[0], DisableReason::Revoked).unwrap();
        store.mark_rate_limited(&ids[1]).unwrap();
        for _ in 0..5 {
            let key = store.select("mistral-small", true).unwrap();
            assert_eq!(key.id(), ids[1]);
        }
        store.disable(&ids[1], DisableReason::Quota).unwrap();
        assert_eq!(
            store.select("mistral-small", true).unwrap_err(),
            PoolError::NoKeysAvailable {
                service: Service::Mistral,
                model: "mistral-small".to_string()
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn lockout_period_tracks_rate_limit_window() {
        let (store, ids) = store_with(Service::Anthropic, &["sk-ant-1"]);
        let model = "claude-3-haiku-20240307";
        assert_eq!(store.lockout_period(model), Duration::ZERO);

        store.mark_rate_limited(&ids[0]).unwrap();
        assert_eq!(store.lockout_period(model), Duration::from_millis(400));

        tokio::time::advance(Duration::from_millis(150)).await;
        assert_eq!(store.lockout_period(model), Duration::from_millis(250));

        tokio::time::advance(Duration::from_millis(250)).await;
        assert_eq!(store.lockout_period(model), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn lockout_is_zero_without_active_keys() {
        let (store, ids) = store_with(Service::Anthropic, &["sk-ant-1"]);
        store.mark_rate_limited(&ids[0]).unwrap();
        store.disable(&ids[0], DisableReason::Revoked).unwrap();
        assert_eq!(store.lockout_period("claude-2"), Duration::ZERO);

        let empty = KeyStore::new(Service::Cohere);
        assert_eq!(empty.lockout_period("command-r"), Duration::ZERO);
    }

    #[test]
    fn disable_is_idempotent() {
        let (store, ids) = store_with(Service::Cohere, &["a"]);
        store.disable(&ids[0], DisableReason::Quota).unwrap();
        let once = store.get(&ids[0]).unwrap();
        store.disable(&ids[0], DisableReason::Quota).unwrap();
        let twice = store.get(&ids[0]).unwrap();
        assert_eq!(once, twice);
        assert_eq!(twice.status, KeyStatus::Disabled);
        assert_eq!(twice.disable_reason, Some(DisableReason::Quota));
    }

    #[test]
    fn quota_does_not_downgrade_a_revoked_key() {
        let (store, ids) = store_with(Service::Cohere, &["a"]);
        store.disable(&ids[0], DisableReason::Revoked).unwrap();
        store.disable(&ids[0], DisableReason::Quota).unwrap();
        assert_eq!(store.get(&ids[0]).unwrap().status, KeyStatus::Revoked);
    }

    #[test]
    fn recheck_reactivates_keys() {
        let (store, ids) = store_with(Service::Cohere, &["a", "b"]);
        store.disable(&ids[0], DisableReason::Revoked).unwrap();
        store.disable(&ids[1], DisableReason::Quota).unwrap();
        assert_eq!(store.available(), 0);
        store.recheck();
        assert_eq!(store.available(), 2);
        assert!(store.any_unchecked());
    }

    #[tokio::test(start_paused = true)]
    async fn capability_gating_filters_google_keys() {
        let (store, ids) = store_with(Service::Google, &["AIza-1", "AIza-2"]);
        let patch = KeyPatch {
            remove_capability: Some(crate::Capability::GeminiExp),
            ..KeyPatch::default()
        };
        store.update(&ids[0], None, &patch).unwrap();

        let key = store.select("gemini-2.0-pro-exp", false).unwrap();
        assert_eq!(key.id(), ids[1]);
        let key = store.select("gemini-1.5-pro", false).unwrap();
        assert_eq!(key.id(), ids[0]);
    }

    #[tokio::test(start_paused = true)]
    async fn aws_keys_are_filtered_by_model_region() {
        let (store, ids) = store_with(
            Service::Anthropic,
            &["AKIAEAST:secret:us-east-1", "AKIAWEST:secret:us-west-2"],
        );
        let key = store.select("anthropic.claude-3-opus-20240229-v1:0", false).unwrap();
        assert_eq!(key.id(), ids[1]);
        let key = store.select("claude-3-haiku-20240307", false).unwrap();
        assert_eq!(key.id(), ids[0]);
    }

    #[test]
    fn update_rejects_stale_versions() {
        let (store, ids) = store_with(Service::Anthropic, &["sk-ant-1"]);
        let v0 = store.get(&ids[0]).unwrap().version;
        let patch = KeyPatch {
            requires_preamble: Some(true),
            ..KeyPatch::default()
        };
        let v1 = store.update(&ids[0], Some(v0), &patch).unwrap();
        assert!(v1 > v0);
        let err = store.update(&ids[0], Some(v0), &patch).unwrap_err();
        assert_eq!(
            err,
            PoolError::StaleVersion {
                id: ids[0].clone(),
                expected: v0,
                actual: v1
            }
        );
        assert!(store.get(&ids[0]).unwrap().requires_preamble);
    }

    #[tokio::test(start_paused = true)]
    async fn reset_headers_extend_the_lockout() {
        let (store, ids) = store_with(Service::Grok, &["xai-1"]);
        let mut headers = HeaderMap::new();
        headers.insert("x-ratelimit-reset-requests", HeaderValue::from_static("2.5s"));
        headers.insert("x-ratelimit-reset-tokens", HeaderValue::from_static("40s"));
        store.update_rate_limits(&ids[0], &headers).unwrap();
        assert_eq!(store.lockout_period("grok-2"), Duration::from_secs(10));
    }

    #[test]
    fn parses_reset_durations() {
        assert_eq!(parse_reset_duration("21.0032s"), Some(Duration::from_millis(21_003)));
        assert_eq!(parse_reset_duration("21ms"), Some(Duration::from_millis(21)));
        assert_eq!(parse_reset_duration("1m30s"), Some(Duration::from_secs(90)));
        assert_eq!(parse_reset_duration("soon"), None);
    }
}
