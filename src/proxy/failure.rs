use axum::body::{Body, Bytes};
use axum::http::{HeaderValue, Response, StatusCode, header};
use llm_relay_core::{QueueError, Service};
use serde_json::json;

/// A terminal, client-visible error for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyFailure {
    pub status: StatusCode,
    /// Types starting with `proxy` are raised by the relay itself; anything else came from
    /// the vendor.
    pub kind: String,
    pub message: String,
    pub proxy_note: String,
}

impl ProxyFailure {
    pub fn proxy(status: StatusCode, kind: &str, message: impl Into<String>) -> Self {
        let kind = if kind.starts_with("proxy") {
            kind.to_string()
        } else {
            format!("proxy_{kind}")
        };
        Self {
            status,
            kind,
            message: message.into(),
            proxy_note: "This error was raised by the relay, not by the upstream vendor."
                .to_string(),
        }
    }

    pub fn upstream(status: StatusCode, kind: Option<String>, message: String, service: Service) -> Self {
        Self {
            status,
            kind: kind.unwrap_or_else(|| "upstream_error".to_string()),
            message,
            proxy_note: format!("The {service} API returned an error; the relay forwarded it unchanged."),
        }
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.proxy_note = note.into();
        self
    }

    pub fn is_proxy_side(&self) -> bool {
        self.kind.starts_with("proxy")
    }

    pub fn json_body(&self) -> serde_json::Value {
        json!({
            "error": {
                "type": self.kind,
                "message": self.message,
                "proxy_note": self.proxy_note,
            }
        })
    }

    pub fn into_response(self) -> Response<Body> {
        json_response(self.status, &self.json_body())
    }

    /// The frames written to a streaming client whose headers are already sent: one
    /// vendor-shaped event carrying the error text, then the `[DONE]` sentinel.
    pub fn sse_frames(&self, service: Service, model: &str) -> Bytes {
        let text = format!(
            "\n\n**Relay error ({})**\n{}\n\n_{}_",
            self.kind, self.message, self.proxy_note
        );
        let event = match service {
            Service::Anthropic => format!(
                "event: content_block_delta\ndata: {}\n\n",
                json!({
                    "type": "content_block_delta",
                    "index": 0,
                    "delta": { "type": "text_delta", "text": text },
                })
            ),
            _ => format!(
                "data: {}\n\n",
                json!({
                    "id": format!("relay-error-{}", uuid::Uuid::new_v4()),
                    "object": "chat.completion.chunk",
                    "model": model,
                    "choices": [{
                        "index": 0,
                        "delta": { "content": text },
                        "finish_reason": "stop",
                    }],
                })
            ),
        };
        Bytes::from(format!("{event}data: [DONE]\n\n"))
    }
}

impl From<QueueError> for ProxyFailure {
    fn from(err: QueueError) -> Self {
        let note = err.proxy_note();
        ProxyFailure::proxy(StatusCode::TOO_MANY_REQUESTS, "proxy_error", err.to_string())
            .with_note(note)
    }
}

/// Admission rejections use the flat `{type, message, proxy_note}` body.
pub fn queue_rejection(err: QueueError) -> Response<Body> {
    let failure = ProxyFailure::from(err);
    json_response(
        failure.status,
        &json!({
            "type": failure.kind,
            "message": failure.message,
            "proxy_note": failure.proxy_note,
        }),
    )
}

pub fn json_response(status: StatusCode, body: &serde_json::Value) -> Response<Body> {
    let mut resp = Response::new(Body::from(body.to_string()));
    *resp.status_mut() = status;
    resp.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    resp
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn proxy_kinds_are_prefixed() {
        let f = ProxyFailure::proxy(StatusCode::BAD_REQUEST, "unknown_model", "nope");
        assert_eq!(f.kind, "proxy_unknown_model");
        assert!(f.is_proxy_side());
        let f = ProxyFailure::upstream(
            StatusCode::BAD_REQUEST,
            Some("invalid_request_error".into()),
            "bad".into(),
            Service::OpenAi,
        );
        assert!(!f.is_proxy_side());
    }

    #[test]
    fn sse_frames_end_with_done() {
        let f = ProxyFailure::proxy(StatusCode::BAD_GATEWAY, "proxy_error", "boom");
        for service in [Service::OpenAi, Service::Anthropic] {
            let frames = String::from_utf8(f.sse_frames(service, "m").to_vec()).unwrap();
            assert!(frames.contains("boom"));
            assert!(frames.ends_with("data: [DONE]\n\n"));
        }
    }

    #[test]
    fn queue_rejection_is_a_flat_429() {
        let resp = queue_rejection(QueueError::IdentityBusy {
            queued: 1,
            allowance: 1,
        });
        assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
    }
}
