use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::time::Instant;

use crate::service::Service;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyStatus {
    Active,
    /// Administrative or quota-driven; cleared by `recheck`.
    Disabled,
    /// The credential itself is invalid.
    Revoked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisableReason {
    Quota,
    Revoked,
}

/// Provisioned access to one model tier, discovered by probing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Gpt4,
    #[serde(rename = "gpt4_32k")]
    Gpt4x32k,
    Gpt4Turbo,
    GptO,
    GeminiFlash,
    #[serde(rename = "gemini_15")]
    Gemini15,
    #[serde(rename = "gemini_20_flash")]
    Gemini20Flash,
    #[serde(rename = "gemini_20_pro")]
    Gemini20Pro,
    GeminiFlashLite,
    GeminiThinking,
    GeminiExp,
}

impl Capability {
    pub fn as_str(self) -> &'static str {
        match self {
            Capability::Gpt4 => "gpt4",
            Capability::Gpt4x32k => "gpt4_32k",
            Capability::Gpt4Turbo => "gpt4_turbo",
            Capability::GptO => "gpt_o",
            Capability::GeminiFlash => "gemini_flash",
            Capability::Gemini15 => "gemini_15",
            Capability::Gemini20Flash => "gemini_20_flash",
            Capability::Gemini20Pro => "gemini_20_pro",
            Capability::GeminiFlashLite => "gemini_flash_lite",
            Capability::GeminiThinking => "gemini_thinking",
            Capability::GeminiExp => "gemini_exp",
        }
    }
}

/// How a key reaches its vendor.
#[derive(Clone, PartialEq, Eq)]
pub enum Backend {
    Direct,
    /// Anthropic models served through AWS Bedrock.
    Aws {
        access_key_id: String,
        secret_access_key: String,
        region: String,
    },
}

impl Backend {
    pub fn region(&self) -> Option<&str> {
        match self {
            Backend::Direct => None,
            Backend::Aws { region, .. } => Some(region.as_str()),
        }
    }
}

impl fmt::Debug for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Backend::Direct => f.write_str("Direct"),
            Backend::Aws { region, .. } => f.debug_struct("Aws").field("region", region).finish(),
        }
    }
}

pub fn key_id(service: Service, secret: &str) -> String {
    let digest = Sha256::digest(secret.as_bytes());
    format!("{}-{:x}", service.hash_prefix(), digest)
}

/// A credential plus its scheduling state. Copies handed out by the store are snapshots;
/// mutations only happen through `KeyStore`.
#[derive(Clone)]
pub struct Key {
    pub(crate) id: String,
    pub(crate) secret: String,
    pub(crate) service: Service,
    pub(crate) backend: Backend,
    pub(crate) status: KeyStatus,
    pub(crate) disable_reason: Option<DisableReason>,
    pub(crate) capabilities: BTreeSet<Capability>,
    pub(crate) requires_preamble: bool,
    pub(crate) rate_limited_at: Option<Instant>,
    pub(crate) rate_limited_until: Option<Instant>,
    pub(crate) last_used: Option<Instant>,
    pub(crate) last_checked: Option<Instant>,
    pub(crate) next_check_at: Option<Instant>,
    pub(crate) prompt_count: u64,
    pub(crate) version: u64,
}

impl Key {
    pub(crate) fn new(
        service: Service,
        secret: String,
        backend: Backend,
        capabilities: BTreeSet<Capability>,
    ) -> Self {
        Self {
            id: key_id(service, &secret),
            secret,
            service,
            backend,
            status: KeyStatus::Active,
            disable_reason: None,
            capabilities,
            requires_preamble: false,
            rate_limited_at: None,
            rate_limited_until: None,
            last_used: None,
            last_checked: None,
            next_check_at: None,
            prompt_count: 0,
            version: 0,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn secret(&self) -> &str {
        &self.secret
    }

    pub fn service(&self) -> Service {
        self.service
    }

    pub fn backend(&self) -> &Backend {
        &self.backend
    }

    pub fn status(&self) -> KeyStatus {
        self.status
    }

    pub fn is_active(&self) -> bool {
        self.status == KeyStatus::Active
    }

    pub fn has_capability(&self, cap: Capability) -> bool {
        self.capabilities.contains(&cap)
    }

    pub fn requires_preamble(&self) -> bool {
        self.requires_preamble
    }

    pub fn prompt_count(&self) -> u64 {
        self.prompt_count
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn last_used(&self) -> Option<Instant> {
        self.last_used
    }

    pub fn rate_limited_until(&self) -> Option<Instant> {
        self.rate_limited_until
    }

    pub fn is_locked_out(&self, now: Instant) -> bool {
        self.rate_limited_until.is_some_and(|until| until > now)
    }

    pub fn snapshot(&self, now: Instant) -> KeySnapshot {
        let ago = |t: Option<Instant>| t.map(|t| now.saturating_duration_since(t).as_millis() as u64);
        KeySnapshot {
            id: self.id.clone(),
            service: self.service,
            status: self.status,
            disable_reason: self.disable_reason,
            capabilities: self.capabilities.iter().copied().collect(),
            region: self.backend.region().map(str::to_string),
            requires_preamble: self.requires_preamble,
            prompt_count: self.prompt_count,
            locked_out_for_ms: self
                .rate_limited_until
                .map(|until| until.saturating_duration_since(now).as_millis() as u64)
                .unwrap_or(0),
            last_used_ms_ago: ago(self.last_used),
            last_checked_ms_ago: ago(self.last_checked),
            version: self.version,
        }
    }

    pub(crate) fn touch(&mut self) {
        self.version = self.version.wrapping_add(1);
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Key")
            .field("id", &self.id)
            .field("service", &self.service)
            .field("backend", &self.backend)
            .field("status", &self.status)
            .field("capabilities", &self.capabilities)
            .field("version", &self.version)
            .finish_non_exhaustive()
    }
}

/// Serializable view of a key; never carries the secret.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KeySnapshot {
    pub id: String,
    pub service: Service,
    pub status: KeyStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disable_reason: Option<DisableReason>,
    pub capabilities: Vec<Capability>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    pub requires_preamble: bool,
    pub prompt_count: u64,
    pub locked_out_for_ms: u64,
    pub last_used_ms_ago: Option<u64>,
    pub last_checked_ms_ago: Option<u64>,
    pub version: u64,
}

/// Field-level changes applied by `KeyStore::update`. `None` leaves a field untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyPatch {
    pub capabilities: Option<BTreeSet<Capability>>,
    pub remove_capability: Option<Capability>,
    pub requires_preamble: Option<bool>,
}

impl KeyPatch {
    pub fn is_empty(&self) -> bool {
        self.capabilities.is_none()
            && self.remove_capability.is_none()
            && self.requires_preamble.is_none()
    }

    pub(crate) fn apply(&self, key: &mut Key) {
        if let Some(caps) = &self.capabilities {
            key.capabilities = caps.clone();
        }
        if let Some(cap) = self.remove_capability {
            key.capabilities.remove(&cap);
        }
        if let Some(flag) = self.requires_preamble {
            key.requires_preamble = flag;
        }
    }
}
