use std::time::Duration;

use thiserror::Error;

use crate::service::Service;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RouteError {
    #[error("unknown model '{0}': no vendor serves it")]
    UnknownModel(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PoolError {
    #[error("no keys available for {service} model '{model}'")]
    NoKeysAvailable { service: Service, model: String },
    #[error("key {0} not found")]
    KeyNotFound(String),
    #[error("key {id} changed concurrently (expected version {expected}, found {actual})")]
    StaleVersion { id: String, expected: u64, actual: u64 },
    #[error("credential does not match any known vendor format")]
    UnrecognizedCredential,
    #[error("key already present in the pool")]
    DuplicateKey,
    #[error(transparent)]
    Route(#[from] RouteError),
}

/// Admission failures raised synchronously by `RequestQueue::enqueue`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueueError {
    #[error("Your IP or user token already has {queued} request(s) queued (limit {allowance}).")]
    IdentityBusy { queued: usize, allowance: usize },
    #[error("You have reached your prompt limit of {limit} for this temporary user token.")]
    PromptBudgetExhausted { limit: u64 },
    #[error("Due to heavy traffic on this proxy, you must enable streaming for your request.")]
    StreamingRequired { load: usize },
    #[error("All keys for this model are busy; retry in {}.", format_retry(.retry_in))]
    LaneBusy { retry_in: Duration },
}

fn format_retry(d: &Duration) -> String {
    humantime::format_duration(Duration::from_millis(d.as_millis() as u64)).to_string()
}

impl QueueError {
    pub fn proxy_note(&self) -> &'static str {
        match self {
            QueueError::IdentityBusy { .. } => {
                "Only one request can be queued at a time. If you don't have another request queued, your IP or user token might be in use by another request."
            }
            QueueError::PromptBudgetExhausted { .. } => {
                "Temporary user tokens expire after a fixed number of prompts."
            }
            QueueError::StreamingRequired { .. } => {
                "Non-streaming requests are rejected while the proxy is under heavy load."
            }
            QueueError::LaneBusy { .. } => "This proxy does not queue requests.",
        }
    }
}
