use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::RouteError;

/// Upstream vendors the relay can hold keys for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Service {
    #[serde(alias = "open_ai")]
    OpenAi,
    Anthropic,
    Google,
    Mistral,
    Cohere,
    Grok,
    #[serde(alias = "deep_seek")]
    DeepSeek,
    Together,
    Ai21,
}

impl Service {
    pub const ALL: [Service; 9] = [
        Service::OpenAi,
        Service::Anthropic,
        Service::Google,
        Service::Mistral,
        Service::Cohere,
        Service::Grok,
        Service::DeepSeek,
        Service::Together,
        Service::Ai21,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Service::OpenAi => "openai",
            Service::Anthropic => "anthropic",
            Service::Google => "google",
            Service::Mistral => "mistral",
            Service::Cohere => "cohere",
            Service::Grok => "grok",
            Service::DeepSeek => "deepseek",
            Service::Together => "together",
            Service::Ai21 => "ai21",
        }
    }

    /// Prefix of key ids, so a hash alone tells which vendor it belongs to.
    pub fn hash_prefix(self) -> &'static str {
        match self {
            Service::OpenAi => "oai",
            Service::Anthropic => "ant",
            Service::Google => "google",
            Service::Mistral => "mist",
            Service::Cohere => "coh",
            Service::Grok => "xai",
            Service::DeepSeek => "dee",
            Service::Together => "togt",
            Service::Ai21 => "ai21",
        }
    }

    /// Environment variable holding the comma-separated credentials for this vendor.
    pub fn credentials_env(self) -> &'static str {
        match self {
            Service::OpenAi => "OPENAI_KEY",
            Service::Anthropic => "ANTHROPIC_KEY",
            Service::Google => "GOOGLE_KEY",
            Service::Mistral => "MISTRAL_KEY",
            Service::Cohere => "COHERE_KEY",
            Service::Grok => "GROK_KEY",
            Service::DeepSeek => "DEEPSEEK_KEY",
            Service::Together => "TOGETHER_KEY",
            Service::Ai21 => "AI21_KEY",
        }
    }

    pub fn default_base_url(self) -> &'static str {
        match self {
            Service::OpenAi => "https://api.openai.com",
            Service::Anthropic => "https://api.anthropic.com",
            Service::Google => "https://generativelanguage.googleapis.com",
            Service::Mistral => "https://api.mistral.ai",
            Service::Cohere => "https://api.cohere.com",
            Service::Grok => "https://api.x.ai",
            Service::DeepSeek => "https://api.deepseek.com",
            Service::Together => "https://api.together.xyz",
            Service::Ai21 => "https://api.ai21.com",
        }
    }
}

impl fmt::Display for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Service {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lowered = s.trim().to_ascii_lowercase();
        Service::ALL
            .into_iter()
            .find(|svc| svc.as_str() == lowered)
            .ok_or_else(|| format!("unknown service '{s}'"))
    }
}

/// Classify a model identifier into the vendor that serves it.
///
/// Names with an organisation segment (`meta-llama/Llama-3-70b`) belong to Together; a
/// leading `models/` (Google's resource form) is ignored.
pub fn route_to_service(model: &str) -> Result<Service, RouteError> {
    let trimmed = model.trim();
    let m = trimmed.strip_prefix("models/").unwrap_or(trimmed);
    let m = m.to_ascii_lowercase();

    if m.is_empty() {
        return Err(RouteError::UnknownModel(model.to_string()));
    }
    if m.contains('/') {
        return Ok(Service::Together);
    }
    if m.contains("gemini") || m.contains("bison") || m.contains("learnlm") {
        return Ok(Service::Google);
    }
    if m.starts_with("j2-") || m.starts_with("jamba") {
        return Ok(Service::Ai21);
    }
    if ["gpt", "o1", "o3", "dall-", "text-embedding-", "chatgpt", "tts-"]
        .iter()
        .any(|p| m.starts_with(p))
    {
        return Ok(Service::OpenAi);
    }
    if m.starts_with("claude-") || m.starts_with("anthropic.") {
        return Ok(Service::Anthropic);
    }
    if m.contains("mistral") || m.contains("mixtral") || m.starts_with("open-") {
        return Ok(Service::Mistral);
    }
    if m.starts_with("grok") {
        return Ok(Service::Grok);
    }
    if m.starts_with("deepseek") {
        return Ok(Service::DeepSeek);
    }
    if m.starts_with("command") || m.starts_with("c4ai") {
        return Ok(Service::Cohere);
    }
    Err(RouteError::UnknownModel(model.to_string()))
}
