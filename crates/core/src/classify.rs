//! Turns a failed upstream response into either a key-state change plus a silent retry, or a
//! terminal error for the client. The queue never looks inside responses; everything
//! vendor-specific about failures lives here.

use std::sync::OnceLock;

use axum::http::HeaderMap;
use regex::Regex;
use serde_json::Value;

use crate::key_pool::policy::google_tier;
use crate::key_pool::{Capability, DisableReason};
use crate::service::Service;

/// What to do to the key that produced a retryable failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyAction {
    MarkRateLimited,
    Disable(DisableReason),
    RequirePreamble,
    RevokeCapability(Capability),
    Delete,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpstreamVerdict {
    Retry {
        action: KeyAction,
        reason: &'static str,
    },
    Fatal {
        class: Option<String>,
        message: String,
    },
}

impl UpstreamVerdict {
    pub fn is_retry(&self) -> bool {
        matches!(self, UpstreamVerdict::Retry { .. })
    }
}

fn header_value_str(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
}

fn contains_bytes(haystack: &[u8], needle: &[u8]) -> bool {
    needle.is_empty() || haystack.windows(needle.len()).any(|w| w == needle)
}

fn looks_like_cloudflare_challenge_html(headers: &HeaderMap, body: &[u8]) -> bool {
    let ct = header_value_str(headers, "content-type")
        .unwrap_or_default()
        .to_ascii_lowercase();
    ct.starts_with("text/html")
        && (contains_bytes(body, b"/cdn-cgi/")
            || contains_bytes(body, b"challenge-platform")
            || contains_bytes(body, b"cf-chl-"))
}

fn json_get_str<'a>(v: &'a Value, key: &str) -> Option<&'a str> {
    v.get(key).and_then(|x| x.as_str())
}

pub(crate) fn extract_error_message(v: &Value) -> Option<String> {
    if let Some(err) = v.get("error") {
        if let Some(msg) = json_get_str(err, "message") {
            return Some(msg.to_string());
        }
        if let Some(msg) = err.as_str() {
            return Some(msg.to_string());
        }
    }
    json_get_str(v, "message").map(|s| s.to_string())
}

pub(crate) fn extract_error_type(v: &Value) -> Option<String> {
    let err = v.get("error")?;
    // OpenAI: error.type / error.code; Anthropic: error.type; Google: error.status.
    ["type", "code", "status"]
        .iter()
        .find_map(|k| json_get_str(err, k))
        .map(|s| s.to_string())
}

/// Replace OpenAI organisation ids in upstream messages before they reach a client.
pub fn redact_org_ids(msg: &str) -> String {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"org-[A-Za-z0-9]+").expect("org id regex is valid"));
    re.replace_all(msg, "org-xxxxxxxxxxxxxxxxxxx").into_owned()
}

fn upstream_message(json: Option<&Value>, body: &[u8]) -> String {
    let raw = json
        .and_then(extract_error_message)
        .unwrap_or_else(|| String::from_utf8_lossy(body).trim().to_string());
    let raw: String = raw.chars().take(1_000).collect();
    redact_org_ids(&raw)
}

/// Classify a non-2xx upstream response.
pub fn classify_upstream_failure(
    service: Service,
    model: &str,
    status: u16,
    headers: &HeaderMap,
    body: &[u8],
) -> UpstreamVerdict {
    let json = serde_json::from_slice::<Value>(body).ok();
    let err_type = json
        .as_ref()
        .and_then(extract_error_type)
        .unwrap_or_default()
        .to_ascii_lowercase();
    let message = upstream_message(json.as_ref(), body);
    let msg = message.to_ascii_lowercase();

    if service == Service::Google
        && (msg.contains("api key expired")
            || msg.contains("api key not valid")
            || msg.contains("api key not found"))
    {
        return UpstreamVerdict::Retry {
            action: KeyAction::Delete,
            reason: "google key rejected",
        };
    }

    match status {
        401 | 402 | 403 => {
            return UpstreamVerdict::Retry {
                action: KeyAction::Disable(DisableReason::Revoked),
                reason: "key rejected",
            };
        }
        429 => return classify_rate_limit(service, model, &err_type, &msg),
        529 if service == Service::Anthropic => {
            return UpstreamVerdict::Retry {
                action: KeyAction::MarkRateLimited,
                reason: "vendor overloaded",
            };
        }
        400 if service == Service::Anthropic
            && msg.contains("prompt must start with")
            && msg.contains("human:") =>
        {
            return UpstreamVerdict::Retry {
                action: KeyAction::RequirePreamble,
                reason: "key requires preamble",
            };
        }
        _ => {}
    }

    let server = header_value_str(headers, "server")
        .unwrap_or_default()
        .to_ascii_lowercase();
    let looks_cf = server.contains("cloudflare") || headers.contains_key("cf-ray");
    let class = if looks_cf && status == 524 {
        Some("cloudflare_timeout".to_string())
    } else if looks_like_cloudflare_challenge_html(headers, body) {
        Some("cloudflare_challenge".to_string())
    } else if !err_type.is_empty() {
        Some(err_type)
    } else {
        None
    };
    UpstreamVerdict::Fatal { class, message }
}

fn classify_rate_limit(service: Service, model: &str, err_type: &str, msg: &str) -> UpstreamVerdict {
    let (action, reason) = match err_type {
        "insufficient_quota" => (KeyAction::Disable(DisableReason::Quota), "quota exhausted"),
        "billing_not_active" | "access_terminated" => {
            (KeyAction::Disable(DisableReason::Revoked), "account inactive")
        }
        _ if service == Service::Grok && msg.contains("monthly spending limit") => {
            (KeyAction::Disable(DisableReason::Quota), "spending limit reached")
        }
        "resource_exhausted" if service == Service::Google && msg.contains("per day") => (
            KeyAction::RevokeCapability(google_tier(model)),
            "daily model quota exhausted",
        ),
        _ => (KeyAction::MarkRateLimited, "rate limited"),
    };
    UpstreamVerdict::Retry { action, reason }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use pretty_assertions::assert_eq;

    fn classify(service: Service, status: u16, body: &str) -> UpstreamVerdict {
        classify_upstream_failure(service, "model", status, &HeaderMap::new(), body.as_bytes())
    }

    fn action_of(v: UpstreamVerdict) -> Option<KeyAction> {
        match v {
            UpstreamVerdict::Retry { action, .. } => Some(action),
            UpstreamVerdict::Fatal { .. } => None,
        }
    }

    #[test]
    fn openai_rate_limits_and_quota() {
        let rl = r#"{"error":{"type":"requests","message":"Rate limit reached for requests"}}"#;
        assert_eq!(action_of(classify(Service::OpenAi, 429, rl)), Some(KeyAction::MarkRateLimited));

        let quota = r#"{"error":{"type":"insufficient_quota","message":"You exceeded your current quota"}}"#;
        assert_eq!(
            action_of(classify(Service::OpenAi, 429, quota)),
            Some(KeyAction::Disable(DisableReason::Quota))
        );

        let billing = r#"{"error":{"type":"billing_not_active"}}"#;
        assert_eq!(
            action_of(classify(Service::OpenAi, 429, billing)),
            Some(KeyAction::Disable(DisableReason::Revoked))
        );
    }

    #[test]
    fn auth_failures_revoke_the_key() {
        assert_eq!(
            action_of(classify(Service::Mistral, 401, "{}")),
            Some(KeyAction::Disable(DisableReason::Revoked))
        );
    }

    #[test]
    fn anthropic_preamble_requirement_is_retryable() {
        let body = r#"{"type":"error","error":{"type":"invalid_request_error","message":"prompt must start with \"\n\nHuman:\" turn"}}"#;
        assert_eq!(
            action_of(classify(Service::Anthropic, 400, body)),
            Some(KeyAction::RequirePreamble)
        );
    }

    #[test]
    fn google_key_errors_delete_and_daily_quota_revokes_tier() {
        let expired = r#"{"error":{"code":400,"message":"API key expired. Please renew the API key.","status":"INVALID_ARGUMENT"}}"#;
        assert_eq!(action_of(classify(Service::Google, 400, expired)), Some(KeyAction::Delete));

        let daily = r#"{"error":{"code":429,"message":"Quota exceeded for quota metric 'Generate Content requests per day'","status":"RESOURCE_EXHAUSTED"}}"#;
        let v = classify_upstream_failure(
            Service::Google,
            "gemini-1.5-pro",
            429,
            &HeaderMap::new(),
            daily.as_bytes(),
        );
        assert_eq!(action_of(v), Some(KeyAction::RevokeCapability(Capability::Gemini15)));
    }

    #[test]
    fn grok_spending_limit_disables_key() {
        let body = r#"{"error":"Your team has reached its monthly spending limit"}"#;
        assert_eq!(
            action_of(classify(Service::Grok, 429, body)),
            Some(KeyAction::Disable(DisableReason::Quota))
        );
    }

    #[test]
    fn other_failures_are_fatal_and_redacted() {
        let body = r#"{"error":{"type":"invalid_request_error","message":"bad request for org-AbC123"}}"#;
        assert_eq!(
            classify(Service::OpenAi, 400, body),
            UpstreamVerdict::Fatal {
                class: Some("invalid_request_error".to_string()),
                message: "bad request for org-xxxxxxxxxxxxxxxxxxx".to_string(),
            }
        );
    }

    #[test]
    fn cloudflare_pages_get_a_class() {
        let mut headers = HeaderMap::new();
        headers.insert("content-type", HeaderValue::from_static("text/html; charset=utf-8"));
        let v = classify_upstream_failure(
            Service::OpenAi,
            "gpt-4",
            403,
            &headers,
            b"<html>/cdn-cgi/challenge-platform</html>",
        );
        // Auth-shaped statuses still win: the key is the first suspect.
        assert!(v.is_retry());

        let v = classify_upstream_failure(
            Service::OpenAi,
            "gpt-4",
            503,
            &headers,
            b"<html>/cdn-cgi/challenge-platform</html>",
        );
        assert!(matches!(
            v,
            UpstreamVerdict::Fatal { class: Some(ref c), .. } if c == "cloudflare_challenge"
        ));
    }
}
