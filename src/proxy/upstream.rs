//! Seams to the collaborators that sit outside the queue: body transformation, request
//! signing for cloud-hosted keys, and prompt token counting.

use anyhow::{Result, anyhow};
use axum::body::Bytes;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method};
use llm_relay_core::{Backend, Key, Service};

/// A client request after gatekeeping, ready to be pointed at a vendor.
#[derive(Debug, Clone)]
pub struct InboundRequest {
    pub method: Method,
    /// Vendor-relative path, e.g. `/v1/chat/completions`.
    pub path: String,
    pub query: Option<String>,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub model: String,
    pub streaming: bool,
}

#[derive(Debug, Clone)]
pub struct OutboundRequest {
    pub method: Method,
    pub url: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

pub trait RequestTransformer: Send + Sync {
    fn transform(
        &self,
        inbound: &InboundRequest,
        service: Service,
        key: &Key,
        base_url: &str,
    ) -> Result<OutboundRequest>;
}

/// Signs requests for keys that are not plain bearer credentials (AWS Bedrock).
pub trait KeySigner: Send + Sync {
    fn sign(&self, request: &mut OutboundRequest, key: &Key) -> Result<()>;
}

pub trait Tokenizer: Send + Sync {
    fn count_tokens(&self, service: Service, body: &[u8]) -> u64;
}

/// Roughly four bytes per token.
pub struct ApproxTokenizer;

impl Tokenizer for ApproxTokenizer {
    fn count_tokens(&self, _service: Service, body: &[u8]) -> u64 {
        (body.len() as u64).div_ceil(4)
    }
}

const ANTHROPIC_VERSION: &str = "2023-06-01";
const HUMAN_PREAMBLE: &str = "\n\nHuman:";

/// Forwards the body unchanged and swaps in the key's credentials.
pub struct PassthroughTransformer;

impl RequestTransformer for PassthroughTransformer {
    fn transform(
        &self,
        inbound: &InboundRequest,
        service: Service,
        key: &Key,
        base_url: &str,
    ) -> Result<OutboundRequest> {
        let mut headers = inbound.headers.clone();
        for name in ["authorization", "x-api-key", "x-goog-api-key"] {
            headers.remove(name);
        }

        let mut body = inbound.body.clone();
        if service == Service::Anthropic && key.requires_preamble() {
            body = with_human_preamble(&body).unwrap_or(body);
        }

        let url = match key.backend() {
            Backend::Aws { region, .. } => {
                let action = if inbound.streaming {
                    "invoke-with-response-stream"
                } else {
                    "invoke"
                };
                format!(
                    "https://bedrock-runtime.{region}.amazonaws.com/model/{}/{action}",
                    inbound.model
                )
            }
            Backend::Direct => {
                let mut url = format!("{}{}", base_url.trim_end_matches('/'), inbound.path);
                if let Some(q) = strip_key_param(inbound.query.as_deref()) {
                    url.push('?');
                    url.push_str(&q);
                }
                set_auth(&mut headers, service, key.secret())?;
                url
            }
        };

        Ok(OutboundRequest {
            method: inbound.method.clone(),
            url,
            headers,
            body,
        })
    }
}

fn set_auth(headers: &mut HeaderMap, service: Service, secret: &str) -> Result<()> {
    let value = |s: String| {
        HeaderValue::from_str(&s).map_err(|_| anyhow!("credential is not a valid header value"))
    };
    match service {
        Service::Anthropic => {
            headers.insert(HeaderName::from_static("x-api-key"), value(secret.to_string())?);
            if !headers.contains_key("anthropic-version") {
                headers.insert(
                    HeaderName::from_static("anthropic-version"),
                    HeaderValue::from_static(ANTHROPIC_VERSION),
                );
            }
        }
        Service::Google => {
            headers.insert(
                HeaderName::from_static("x-goog-api-key"),
                value(secret.to_string())?,
            );
        }
        _ => {
            headers.insert(
                axum::http::header::AUTHORIZATION,
                value(format!("Bearer {secret}"))?,
            );
        }
    }
    Ok(())
}

/// Drop the client's `key=` query parameter; it authenticated against the relay, not the vendor.
fn strip_key_param(query: Option<&str>) -> Option<String> {
    let kept: Vec<&str> = query?
        .split('&')
        .filter(|p| !p.is_empty() && !p.starts_with("key="))
        .collect();
    (!kept.is_empty()).then(|| kept.join("&"))
}

/// Text-completion prompts for keys that insist on a leading Human turn.
fn with_human_preamble(body: &[u8]) -> Option<Bytes> {
    let mut v: serde_json::Value = serde_json::from_slice(body).ok()?;
    let prompt = v.get("prompt")?.as_str()?;
    if prompt.starts_with(HUMAN_PREAMBLE) {
        return None;
    }
    let patched = format!("{HUMAN_PREAMBLE} {prompt}");
    v.as_object_mut()?
        .insert("prompt".to_string(), serde_json::Value::String(patched));
    serde_json::to_vec(&v).ok().map(Bytes::from)
}
