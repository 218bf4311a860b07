use std::collections::BTreeSet;
use std::time::Duration;

use crate::key_pool::key::{Backend, Capability};
use crate::service::Service;

/// Per-vendor lockout windows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VendorPolicy {
    /// Applied after an upstream 429.
    pub lockout: Duration,
    /// Applied pessimistically on every selection.
    pub reuse_delay: Duration,
}

impl VendorPolicy {
    pub fn for_service(service: Service) -> Self {
        let (lockout_ms, reuse_ms) = match service {
            Service::Anthropic => (400, 300),
            Service::Google => (1_000, 30_000),
            Service::Mistral => (1_000, 500),
            Service::Grok => (60_000, 1_000),
            _ => (1_000, 500),
        };
        Self {
            lockout: Duration::from_millis(lockout_ms),
            reuse_delay: Duration::from_millis(reuse_ms),
        }
    }
}

const GOOGLE_TIERS: [Capability; 7] = [
    Capability::GeminiFlash,
    Capability::Gemini15,
    Capability::Gemini20Flash,
    Capability::Gemini20Pro,
    Capability::GeminiFlashLite,
    Capability::GeminiThinking,
    Capability::GeminiExp,
];

const OPENAI_TIERS: [Capability; 4] = [
    Capability::Gpt4,
    Capability::Gpt4x32k,
    Capability::Gpt4Turbo,
    Capability::GptO,
];

/// Flags a freshly loaded key starts with, before the checker narrows them down.
pub fn default_capabilities(service: Service) -> BTreeSet<Capability> {
    match service {
        Service::OpenAi => OPENAI_TIERS.into_iter().collect(),
        Service::Google => GOOGLE_TIERS.into_iter().collect(),
        _ => BTreeSet::new(),
    }
}

pub fn openai_tier(model: &str) -> Option<Capability> {
    let m = model.to_ascii_lowercase();
    if m.contains("gpt-4-32k") {
        Some(Capability::Gpt4x32k)
    } else if m.starts_with("o1") || m.starts_with("o3") {
        Some(Capability::GptO)
    } else if m.contains("4o") || m.contains("gpt-4-turbo") || m.contains("gpt-4.") {
        Some(Capability::Gpt4Turbo)
    } else if m.starts_with("gpt-4") {
        Some(Capability::Gpt4)
    } else {
        None
    }
}

/// Every Gemini model falls into exactly one quota tier; unrecognised names land in 1.5.
pub fn google_tier(model: &str) -> Capability {
    let m = model.to_ascii_lowercase();
    if m.contains("thinking") {
        Capability::GeminiThinking
    } else if m.contains("exp") {
        Capability::GeminiExp
    } else if m.contains("flash-lite") {
        Capability::GeminiFlashLite
    } else if m.contains("2.0-pro") {
        Capability::Gemini20Pro
    } else if m.contains("2.0-flash") {
        Capability::Gemini20Flash
    } else if m.contains("flash") {
        Capability::GeminiFlash
    } else {
        Capability::Gemini15
    }
}

pub fn required_capability(service: Service, model: &str) -> Option<Capability> {
    match service {
        Service::OpenAi => openai_tier(model),
        Service::Google => Some(google_tier(model)),
        _ => None,
    }
}

const CLAUDE2_REGIONS: &[&str] = &["us-east-1", "us-west-2", "ap-northeast-1", "eu-central-1"];
const CLAUDE3_HAIKU_REGIONS: &[&str] = &[
    "us-east-1",
    "us-west-2",
    "ap-south-1",
    "ap-northeast-1",
    "ap-southeast-2",
    "ca-central-1",
    "eu-central-1",
    "eu-west-2",
    "eu-west-3",
    "sa-east-1",
];
const CLAUDE3_SONNET_REGIONS: &[&str] = &[
    "us-east-1",
    "us-west-2",
    "ap-south-1",
    "ap-southeast-2",
    "ca-central-1",
    "eu-central-1",
    "eu-west-2",
    "eu-west-3",
    "sa-east-1",
];
const CLAUDE35_SONNET_REGIONS: &[&str] =
    &["us-east-1", "us-west-2", "ap-northeast-1", "eu-central-1"];
const CLAUDE3_OPUS_REGIONS: &[&str] = &["us-west-2"];

/// Bedrock regions that host the given Claude model.
pub fn aws_regions_for(model: &str) -> &'static [&'static str] {
    let m = model.to_ascii_lowercase();
    if m.contains("claude-3-opus") {
        CLAUDE3_OPUS_REGIONS
    } else if m.contains("claude-3-5-sonnet") || m.contains("claude-3.5-sonnet") {
        CLAUDE35_SONNET_REGIONS
    } else if m.contains("claude-3-sonnet") {
        CLAUDE3_SONNET_REGIONS
    } else if m.contains("claude-3-haiku") {
        CLAUDE3_HAIKU_REGIONS
    } else {
        CLAUDE2_REGIONS
    }
}

/// Whether a key's backend can serve `model` at all.
pub fn backend_serves(backend: &Backend, model: &str) -> bool {
    match backend {
        Backend::Direct => true,
        Backend::Aws { region, .. } => aws_regions_for(model).contains(&region.as_str()),
    }
}

/// Split one configured credential into its secret and backend.
///
/// Anthropic credentials of the form `AKIA...:secret:region` are Bedrock keys. Returns
/// `None` for entries that cannot be a credential for `service`.
pub fn parse_credential(service: Service, raw: &str) -> Option<(String, Backend)> {
    let raw = raw.trim();
    if raw.is_empty() || raw.chars().any(char::is_whitespace) {
        return None;
    }
    if service == Service::Anthropic && raw.starts_with("AKIA") {
        let mut parts = raw.split(':');
        let (Some(id), Some(secret), Some(region), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return None;
        };
        if secret.is_empty() || region.is_empty() {
            return None;
        }
        return Some((
            raw.to_string(),
            Backend::Aws {
                access_key_id: id.to_string(),
                secret_access_key: secret.to_string(),
                region: region.to_string(),
            },
        ));
    }
    Some((raw.to_string(), Backend::Direct))
}

/// Guess which vendor issued a credential from its shape.
pub fn detect_service(secret: &str) -> Option<Service> {
    let s = secret.trim();
    if s.starts_with("sk-ant-") || s.starts_with("AKIA") {
        return Some(Service::Anthropic);
    }
    if s.starts_with("AIza") {
        return Some(Service::Google);
    }
    if s.starts_with("xai-") {
        return Some(Service::Grok);
    }
    if let Some(rest) = s.strip_prefix("sk-") {
        let deepseek_shaped = rest.len() == 32
            && rest
                .chars()
                .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c));
        return Some(if deepseek_shaped {
            Service::DeepSeek
        } else {
            Service::OpenAi
        });
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn google_tiers_prefer_the_most_specific_match() {
        assert_eq!(google_tier("gemini-2.0-flash-thinking-exp"), Capability::GeminiThinking);
        assert_eq!(google_tier("gemini-2.0-pro-exp"), Capability::GeminiExp);
        assert_eq!(google_tier("gemini-2.0-flash-lite"), Capability::GeminiFlashLite);
        assert_eq!(google_tier("gemini-2.0-pro"), Capability::Gemini20Pro);
        assert_eq!(google_tier("gemini-2.0-flash"), Capability::Gemini20Flash);
        assert_eq!(google_tier("gemini-1.5-flash"), Capability::GeminiFlash);
        assert_eq!(google_tier("gemini-1.5-pro"), Capability::Gemini15);
    }

    #[test]
    fn openai_tiers() {
        assert_eq!(openai_tier("gpt-4-32k-0613"), Some(Capability::Gpt4x32k));
        assert_eq!(openai_tier("gpt-4o-mini"), Some(Capability::Gpt4Turbo));
        assert_eq!(openai_tier("gpt-4-turbo"), Some(Capability::Gpt4Turbo));
        assert_eq!(openai_tier("gpt-4"), Some(Capability::Gpt4));
        assert_eq!(openai_tier("o3-mini"), Some(Capability::GptO));
        assert_eq!(openai_tier("gpt-3.5-turbo"), None);
    }

    #[test]
    fn aws_credentials_carry_region() {
        let (_, backend) = parse_credential(Service::Anthropic, "AKIA123:s3cr3t:us-west-2").unwrap();
        assert_eq!(backend.region(), Some("us-west-2"));
        assert!(backend_serves(&backend, "anthropic.claude-3-opus-20240229-v1:0"));
        assert!(backend_serves(&backend, "claude-3-sonnet-20240229"));

        let (_, east) = parse_credential(Service::Anthropic, "AKIA123:s3cr3t:us-east-1").unwrap();
        assert!(!backend_serves(&east, "claude-3-opus-20240229"));
        assert!(backend_serves(&Backend::Direct, "claude-3-opus-20240229"));
    }

    #[test]
    fn malformed_credentials_are_skipped() {
        assert_eq!(parse_credential(Service::OpenAi, "   "), None);
        assert_eq!(parse_credential(Service::OpenAi, "sk with space"), None);
        assert_eq!(parse_credential(Service::Anthropic, "AKIA123:only-two"), None);
    }

    #[test]
    fn detects_vendor_from_credential_shape() {
        assert_eq!(detect_service("sk-ant-api03-xyz"), Some(Service::Anthropic));
        assert_eq!(detect_service("AIzaSyD-abc"), Some(Service::Google));
        assert_eq!(detect_service("xai-abc"), Some(Service::Grok));
        assert_eq!(
            detect_service("sk-0123456789abcdef0123456789abcdef"),
            Some(Service::DeepSeek)
        );
        assert_eq!(detect_service("sk-proj-ABCdef"), Some(Service::OpenAi));
        assert_eq!(detect_service("mystery"), None);
    }
}
