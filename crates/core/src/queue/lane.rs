use std::fmt;

use serde::Serialize;

use crate::error::RouteError;
use crate::key_pool::Capability;
use crate::key_pool::policy::{google_tier, openai_tier};
use crate::service::{Service, route_to_service};

/// A scheduling partition: requests in one lane compete for the same class of key capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(into = "&'static str")]
pub enum Lane {
    Claude,
    Turbo,
    Gpt4,
    Gpt4x32k,
    Gpt4Turbo,
    GptO,
    GoogleExp,
    Google15,
    GoogleFlash,
    Google20Flash,
    Google20Pro,
    GoogleFlashLite,
    GoogleThinking,
    Ai21,
    Grok,
    Mistral,
    DeepSeek,
    Cohere,
    Together,
}

impl Lane {
    pub const ALL: [Lane; 19] = [
        Lane::Claude,
        Lane::Turbo,
        Lane::Gpt4,
        Lane::Gpt4x32k,
        Lane::Gpt4Turbo,
        Lane::GptO,
        Lane::GoogleExp,
        Lane::Google15,
        Lane::GoogleFlash,
        Lane::Google20Flash,
        Lane::Google20Pro,
        Lane::GoogleFlashLite,
        Lane::GoogleThinking,
        Lane::Ai21,
        Lane::Grok,
        Lane::Mistral,
        Lane::DeepSeek,
        Lane::Cohere,
        Lane::Together,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Lane::Claude => "claude",
            Lane::Turbo => "turbo",
            Lane::Gpt4 => "gpt-4",
            Lane::Gpt4x32k => "gpt-4-32k",
            Lane::Gpt4Turbo => "gpt-4-turbo",
            Lane::GptO => "gpt-o",
            Lane::GoogleExp => "google-exp",
            Lane::Google15 => "google-15",
            Lane::GoogleFlash => "google-flash",
            Lane::Google20Flash => "google-20-flash",
            Lane::Google20Pro => "google-20-pro",
            Lane::GoogleFlashLite => "google-flash-lite",
            Lane::GoogleThinking => "google-thinking",
            Lane::Ai21 => "ai21",
            Lane::Grok => "grok",
            Lane::Mistral => "mistral",
            Lane::DeepSeek => "deepseek",
            Lane::Cohere => "cohere",
            Lane::Together => "together",
        }
    }

    pub fn service(self) -> Service {
        match self {
            Lane::Claude => Service::Anthropic,
            Lane::Turbo | Lane::Gpt4 | Lane::Gpt4x32k | Lane::Gpt4Turbo | Lane::GptO => {
                Service::OpenAi
            }
            Lane::GoogleExp
            | Lane::Google15
            | Lane::GoogleFlash
            | Lane::Google20Flash
            | Lane::Google20Pro
            | Lane::GoogleFlashLite
            | Lane::GoogleThinking => Service::Google,
            Lane::Ai21 => Service::Ai21,
            Lane::Grok => Service::Grok,
            Lane::Mistral => Service::Mistral,
            Lane::DeepSeek => Service::DeepSeek,
            Lane::Cohere => Service::Cohere,
            Lane::Together => Service::Together,
        }
    }

    /// The model name the scheduler asks the key pool about when computing this lane's
    /// lockout. It must route back to the same lane.
    pub fn representative_model(self) -> &'static str {
        match self {
            Lane::Claude => "claude-3-haiku-20240307",
            Lane::Turbo => "gpt-3.5-turbo",
            Lane::Gpt4 => "gpt-4",
            Lane::Gpt4x32k => "gpt-4-32k",
            Lane::Gpt4Turbo => "gpt-4o",
            Lane::GptO => "o1",
            Lane::GoogleExp => "gemini-exp-1206",
            Lane::Google15 => "gemini-1.5-pro",
            Lane::GoogleFlash => "gemini-1.5-flash",
            Lane::Google20Flash => "gemini-2.0-flash",
            Lane::Google20Pro => "gemini-2.0-pro",
            Lane::GoogleFlashLite => "gemini-2.0-flash-lite",
            Lane::GoogleThinking => "gemini-2.0-flash-thinking",
            Lane::Ai21 => "jamba-1.5-large",
            Lane::Grok => "grok-2",
            Lane::Mistral => "mistral-large-latest",
            Lane::DeepSeek => "deepseek-chat",
            Lane::Cohere => "command-r-plus",
            Lane::Together => "meta-llama/Llama-3-70b-chat-hf",
        }
    }

    /// The capability flag keys must hold to serve this lane, if any.
    pub fn capability(self) -> Option<Capability> {
        match self.service() {
            Service::OpenAi => openai_tier(self.representative_model()),
            Service::Google => Some(google_tier(self.representative_model())),
            _ => None,
        }
    }

    pub fn for_model(model: &str) -> Result<Lane, RouteError> {
        let lane = match route_to_service(model)? {
            Service::Anthropic => Lane::Claude,
            Service::OpenAi => match openai_tier(model) {
                Some(Capability::Gpt4) => Lane::Gpt4,
                Some(Capability::Gpt4x32k) => Lane::Gpt4x32k,
                Some(Capability::Gpt4Turbo) => Lane::Gpt4Turbo,
                Some(Capability::GptO) => Lane::GptO,
                _ => Lane::Turbo,
            },
            Service::Google => match google_tier(model) {
                Capability::GeminiExp => Lane::GoogleExp,
                Capability::GeminiFlash => Lane::GoogleFlash,
                Capability::Gemini20Flash => Lane::Google20Flash,
                Capability::Gemini20Pro => Lane::Google20Pro,
                Capability::GeminiFlashLite => Lane::GoogleFlashLite,
                Capability::GeminiThinking => Lane::GoogleThinking,
                _ => Lane::Google15,
            },
            Service::Ai21 => Lane::Ai21,
            Service::Grok => Lane::Grok,
            Service::Mistral => Lane::Mistral,
            Service::DeepSeek => Lane::DeepSeek,
            Service::Cohere => Lane::Cohere,
            Service::Together => Lane::Together,
        };
        Ok(lane)
    }
}

impl From<Lane> for &'static str {
    fn from(lane: Lane) -> Self {
        lane.as_str()
    }
}

impl fmt::Display for Lane {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn representative_models_route_back_to_their_lane() {
        for lane in Lane::ALL {
            assert_eq!(Lane::for_model(lane.representative_model()), Ok(lane), "{lane}");
        }
    }

    #[test]
    fn model_tiers_get_separate_lanes() {
        assert_eq!(Lane::for_model("gpt-4-0613"), Ok(Lane::Gpt4));
        assert_eq!(Lane::for_model("gpt-4o-mini"), Ok(Lane::Gpt4Turbo));
        assert_eq!(Lane::for_model("claude-3-opus-20240229"), Ok(Lane::Claude));
        assert_eq!(Lane::for_model("models/gemini-1.5-flash-002"), Ok(Lane::GoogleFlash));
        assert!(Lane::for_model("llama-local").is_err());
    }

    #[test]
    fn lanes_serialize_by_name() {
        let json = serde_json::to_string(&Lane::Google20Pro).unwrap();
        assert_eq!(json, "\"google-20-pro\"");
    }
}
