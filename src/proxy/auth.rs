use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use axum::http::{HeaderMap, StatusCode};
use llm_relay_core::queue::PromptBudget;
use tracing::debug;

use crate::config::{GatekeeperMode, UserConfig, UserKind};
use crate::proxy::failure::ProxyFailure;

/// What the relay knows about an authenticated caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserInfo {
    pub token: String,
    pub kind: UserKind,
    pub prompt_limit: Option<u64>,
    pub prompt_count: u64,
    pub disabled: bool,
}

impl UserInfo {
    /// Only temporary tokens are budgeted.
    pub fn budget(&self) -> Option<PromptBudget> {
        match (self.kind, self.prompt_limit) {
            (UserKind::Temporary, Some(limit)) => Some(PromptBudget {
                used: self.prompt_count,
                limit,
            }),
            _ => None,
        }
    }
}

pub trait UserStore: Send + Sync {
    fn lookup(&self, token: &str) -> Option<UserInfo>;
    fn increment_prompt(&self, token: &str);
}

/// In-memory users loaded from the config file. Prompt counts reset on restart.
#[derive(Default)]
pub struct StaticUserStore {
    users: Mutex<HashMap<String, UserInfo>>,
}

impl StaticUserStore {
    pub fn from_config(users: &[UserConfig]) -> Self {
        let users = users
            .iter()
            .filter(|u| !u.token.trim().is_empty())
            .map(|u| {
                let token = u.token.trim().to_string();
                let info = UserInfo {
                    token: token.clone(),
                    kind: u.kind,
                    prompt_limit: u.prompt_limit,
                    prompt_count: 0,
                    disabled: u.disabled,
                };
                (token, info)
            })
            .collect();
        Self {
            users: Mutex::new(users),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, UserInfo>> {
        match self.users.lock() {
            Ok(g) => g,
            Err(e) => e.into_inner(),
        }
    }
}

impl UserStore for StaticUserStore {
    fn lookup(&self, token: &str) -> Option<UserInfo> {
        self.lock().get(token).cloned()
    }

    fn increment_prompt(&self, token: &str) {
        if let Some(user) = self.lock().get_mut(token) {
            user.prompt_count = user.prompt_count.saturating_add(1);
        }
    }
}

/// Caller token from `Authorization: Bearer`, `x-api-key`, or a `key=` query parameter.
pub fn extract_token(headers: &HeaderMap, query: Option<&str>) -> Option<String> {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|s| !s.is_empty())
    };
    if let Some(auth) = header("authorization") {
        let token = auth
            .strip_prefix("Bearer ")
            .or_else(|| auth.strip_prefix("bearer "))
            .unwrap_or(auth)
            .trim();
        if !token.is_empty() {
            return Some(token.to_string());
        }
    }
    if let Some(key) = header("x-api-key") {
        return Some(key.to_string());
    }
    query?
        .split('&')
        .find_map(|pair| pair.strip_prefix("key="))
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

pub struct Gatekeeper {
    mode: GatekeeperMode,
    proxy_key: Option<String>,
    users: Arc<dyn UserStore>,
}

impl Gatekeeper {
    pub fn new(mode: GatekeeperMode, proxy_key: Option<String>, users: Arc<dyn UserStore>) -> Self {
        Self {
            mode,
            proxy_key,
            users,
        }
    }

    pub fn users(&self) -> &Arc<dyn UserStore> {
        &self.users
    }

    /// `Ok(Some(user))` for user-token mode, `Ok(None)` when the caller needs no identity.
    pub fn check(
        &self,
        headers: &HeaderMap,
        query: Option<&str>,
    ) -> Result<Option<UserInfo>, ProxyFailure> {
        let unauthorized = || {
            ProxyFailure::proxy(
                StatusCode::UNAUTHORIZED,
                "proxy_unauthorized",
                "Missing or invalid proxy token.",
            )
        };
        match self.mode {
            GatekeeperMode::None => Ok(None),
            GatekeeperMode::ProxyKey => {
                let token = extract_token(headers, query).ok_or_else(unauthorized)?;
                match self.proxy_key.as_deref() {
                    Some(expected) if expected == token => Ok(None),
                    _ => Err(unauthorized()),
                }
            }
            GatekeeperMode::UserToken => {
                let token = extract_token(headers, query).ok_or_else(unauthorized)?;
                let user = self.users.lookup(&token).ok_or_else(unauthorized)?;
                if user.disabled {
                    debug!("rejected disabled user token");
                    return Err(ProxyFailure::proxy(
                        StatusCode::FORBIDDEN,
                        "proxy_forbidden",
                        "This user token has been disabled.",
                    ));
                }
                Ok(Some(user))
            }
        }
    }
}
