use std::collections::BTreeMap;
use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use llm_relay_core::queue::{HeartbeatSettings, QueueMode, QueueSettings};
use llm_relay_core::Service;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::warn;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum GatekeeperMode {
    /// Anyone may use the relay.
    #[default]
    None,
    /// One shared secret (`proxy_key`).
    ProxyKey,
    /// Per-user tokens from `users`.
    UserToken,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum UserKind {
    #[default]
    Normal,
    Special,
    /// Guest tokens limited to `prompt_limit` prompts.
    Temporary,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct UserConfig {
    pub token: String,
    #[serde(default, rename = "type")]
    pub kind: UserKind,
    #[serde(default)]
    pub prompt_limit: Option<u64>,
    #[serde(default)]
    pub disabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct HeartbeatConfig {
    /// Humantime string, e.g. `5s`.
    pub interval: String,
    /// Above this load heartbeats grow and non-streaming requests are refused.
    pub load_threshold: usize,
    pub payload_scale_factor: usize,
    pub max_payload_kb: usize,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: "5s".to_string(),
            load_threshold: 50,
            payload_scale_factor: 6,
            max_payload_kb: 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RelayConfig {
    pub version: Option<u32>,
    pub bind: String,
    pub port: u16,
    pub gatekeeper: GatekeeperMode,
    pub proxy_key: Option<String>,
    pub users: Vec<UserConfig>,
    pub queue_mode: QueueMode,
    /// Probe keys at startup and hourly afterwards.
    pub check_keys: bool,
    /// Shared/proxy IPs that get a larger queue allowance.
    pub shared_ips: Vec<String>,
    pub heartbeat: HeartbeatConfig,
    pub max_queue_residency: String,
    pub max_context_tokens: BTreeMap<Service, u64>,
    /// Comma-separated credentials per vendor; the `*_KEY` environment variables win.
    pub keys: BTreeMap<Service, String>,
    /// Base URL overrides per vendor.
    pub upstreams: BTreeMap<Service, String>,
    pub log_dir: Option<PathBuf>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            version: Some(CONFIG_VERSION),
            bind: "127.0.0.1".to_string(),
            port: 7860,
            gatekeeper: GatekeeperMode::None,
            proxy_key: None,
            users: Vec::new(),
            queue_mode: QueueMode::Fair,
            check_keys: true,
            shared_ips: Vec::new(),
            heartbeat: HeartbeatConfig::default(),
            max_queue_residency: "5m".to_string(),
            max_context_tokens: BTreeMap::new(),
            keys: BTreeMap::new(),
            upstreams: BTreeMap::new(),
            log_dir: None,
        }
    }
}

fn parse_u64_env(key: &str) -> Option<u64> {
    env::var(key)
        .ok()
        .and_then(|s| s.trim().parse::<u64>().ok())
        .filter(|&n| n > 0)
}

fn parse_human(field: &str, raw: &str) -> Result<Duration> {
    humantime::parse_duration(raw.trim())
        .with_context(|| format!("invalid duration for `{field}`: {raw:?}"))
}

impl RelayConfig {
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.bind.trim(), self.port)
            .parse()
            .with_context(|| format!("invalid bind address {}:{}", self.bind, self.port))
    }

    pub fn heartbeat_settings(&self) -> Result<HeartbeatSettings> {
        let mut interval = parse_human("heartbeat.interval", &self.heartbeat.interval)?;
        if let Some(secs) = parse_u64_env("HEARTBEAT_INTERVAL_SEC") {
            interval = Duration::from_secs(secs);
        }
        let max_kb = parse_u64_env("MAX_HEARTBEAT_SIZE_KB")
            .map(|kb| kb as usize)
            .unwrap_or(self.heartbeat.max_payload_kb);
        if interval.is_zero() {
            return Err(anyhow!("heartbeat.interval must be positive"));
        }
        Ok(HeartbeatSettings {
            interval,
            load_threshold: self.heartbeat.load_threshold,
            scale_factor: self.heartbeat.payload_scale_factor,
            max_payload_bytes: max_kb.saturating_mul(1024),
        })
    }

    pub fn queue_settings(&self) -> Result<QueueSettings> {
        Ok(QueueSettings {
            mode: self.queue_mode,
            max_residency: parse_human("max_queue_residency", &self.max_queue_residency)?,
            load_threshold: self.heartbeat.load_threshold,
            ..QueueSettings::default()
        })
    }

    /// Credential list per vendor. A non-empty environment variable replaces the file entry.
    pub fn credentials(&self) -> Vec<(Service, String)> {
        Service::ALL
            .into_iter()
            .filter_map(|svc| {
                let from_env = env::var(svc.credentials_env())
                    .ok()
                    .filter(|v| !v.trim().is_empty());
                let list = from_env.or_else(|| self.keys.get(&svc).cloned())?;
                Some((svc, list))
            })
            .collect()
    }

    pub fn base_url(&self, service: Service) -> String {
        self.upstreams
            .get(&service)
            .map(|u| u.trim().trim_end_matches('/').to_string())
            .filter(|u| !u.is_empty())
            .unwrap_or_else(|| service.default_base_url().to_string())
    }

    fn validate(&self) -> Result<()> {
        if self.gatekeeper == GatekeeperMode::ProxyKey
            && self.proxy_key.as_deref().is_none_or(|k| k.trim().is_empty())
        {
            return Err(anyhow!("gatekeeper = \"proxy_key\" requires `proxy_key` to be set"));
        }
        if self.gatekeeper == GatekeeperMode::UserToken && self.users.is_empty() {
            warn!("gatekeeper = \"user_token\" but no users are configured; every request will be rejected");
        }
        self.heartbeat_settings()?;
        self.queue_settings()?;
        Ok(())
    }
}

const CONFIG_VERSION: u32 = 1;

/// Home directory for config and logs: `LLM_RELAY_HOME`, else `~/.llm-relay`.
pub fn proxy_home_dir() -> PathBuf {
    if let Ok(dir) = env::var("LLM_RELAY_HOME") {
        let trimmed = dir.trim();
        if !trimmed.is_empty() {
            return PathBuf::from(trimmed);
        }
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".llm-relay")
}

fn config_toml_path() -> PathBuf {
    proxy_home_dir().join("config.toml")
}

fn config_json_path() -> PathBuf {
    proxy_home_dir().join("config.json")
}

/// The file `load_config()` reads, or would create.
pub fn config_file_path() -> PathBuf {
    let toml_path = config_toml_path();
    if toml_path.exists() {
        toml_path
    } else if config_json_path().exists() {
        config_json_path()
    } else {
        toml_path
    }
}

pub async fn load_config() -> Result<RelayConfig> {
    let toml_path = config_toml_path();
    let json_path = config_json_path();
    let mut cfg = if toml_path.exists() {
        let text = fs::read_to_string(&toml_path)
            .await
            .with_context(|| format!("read {}", toml_path.display()))?;
        toml::from_str::<RelayConfig>(&text)
            .with_context(|| format!("parse {}", toml_path.display()))?
    } else if json_path.exists() {
        let bytes = fs::read(&json_path)
            .await
            .with_context(|| format!("read {}", json_path.display()))?;
        serde_json::from_slice::<RelayConfig>(&bytes)
            .with_context(|| format!("parse {}", json_path.display()))?
    } else {
        RelayConfig::default()
    };
    if cfg.version.is_none() {
        cfg.version = Some(CONFIG_VERSION);
    }
    cfg.validate()?;
    Ok(cfg)
}

pub const CONFIG_TOML_TEMPLATE: &str = r#"# llm-relay config.toml
#
# Optional. When present it is read instead of config.json.
# Prefer the *_KEY environment variables (OPENAI_KEY, ANTHROPIC_KEY, ...) over
# writing credentials into this file.

version = 1

bind = "127.0.0.1"
port = 7860

# none | proxy_key | user_token
gatekeeper = "none"
# proxy_key = "change-me"

# fair | random | none
queue_mode = "fair"

# Probe every key on startup and once an hour afterwards.
check_keys = true

# Requests from these IPs share one identity with five queue slots.
shared_ips = []

max_queue_residency = "5m"

# log_dir = "/var/log/llm-relay"

[heartbeat]
interval = "5s"
load_threshold = 50
payload_scale_factor = 6
max_payload_kb = 1024

# [max_context_tokens]
# openai = 128000
# anthropic = 200000

# [keys]
# mistral = "key-one,key-two"

# [upstreams]
# openai = "https://api.openai.com"

# [[users]]
# token = "guest-token"
# type = "temporary"
# prompt_limit = 20
"#;

/// Write the commented template. An existing file is kept unless `force`, in which case it is
/// copied to `config.toml.bak` first.
pub async fn init_config_template(force: bool) -> Result<PathBuf> {
    let dir = proxy_home_dir();
    fs::create_dir_all(&dir)
        .await
        .with_context(|| format!("create {}", dir.display()))?;
    let path = config_toml_path();
    if path.exists() {
        if !force {
            return Err(anyhow!(
                "{} already exists (use --force to overwrite)",
                path.display()
            ));
        }
        let backup = dir.join("config.toml.bak");
        if let Err(err) = fs::copy(&path, &backup).await {
            warn!("failed to backup {:?} to {:?}: {}", path, backup, err);
        }
    }
    let tmp_path = dir.join("config.tmp");
    fs::write(&tmp_path, CONFIG_TOML_TEMPLATE.as_bytes()).await?;
    fs::rename(&tmp_path, &path).await?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::path::Path;
    use std::sync::{Mutex, OnceLock};

    struct ScopedEnv {
        saved: Vec<(String, Option<String>)>,
    }

    impl ScopedEnv {
        fn new() -> Self {
            Self { saved: Vec::new() }
        }

        unsafe fn set(&mut self, key: &str, value: impl AsRef<std::ffi::OsStr>) {
            self.saved.push((key.to_string(), env::var(key).ok()));
            unsafe { env::set_var(key, value) };
        }
    }

    impl Drop for ScopedEnv {
        fn drop(&mut self) {
            for (key, old) in self.saved.drain(..).rev() {
                unsafe {
                    match old {
                        Some(v) => env::set_var(&key, v),
                        None => env::remove_var(&key),
                    }
                }
            }
        }
    }

    fn env_lock() -> std::sync::MutexGuard<'static, ()> {
        static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
        match LOCK.get_or_init(|| Mutex::new(())).lock() {
            Ok(g) => g,
            Err(e) => e.into_inner(),
        }
    }

    struct TestEnv {
        _lock: std::sync::MutexGuard<'static, ()>,
        env: ScopedEnv,
        home: PathBuf,
    }

    fn setup_temp_home() -> TestEnv {
        let lock = env_lock();
        let home = env::temp_dir().join(format!("llm-relay-test-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&home).expect("create temp home");
        let mut scoped = ScopedEnv::new();
        unsafe {
            scoped.set("LLM_RELAY_HOME", &home);
            for svc in Service::ALL {
                scoped.set(svc.credentials_env(), "");
            }
            scoped.set("HEARTBEAT_INTERVAL_SEC", "");
            scoped.set("MAX_HEARTBEAT_SIZE_KB", "");
        }
        TestEnv {
            _lock: lock,
            env: scoped,
            home,
        }
    }

    fn write_file(path: &Path, content: &str) {
        std::fs::write(path, content).expect("write test file");
    }

    fn block_on<F: std::future::Future>(f: F) -> F::Output {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("build tokio runtime")
            .block_on(f)
    }

    #[test]
    fn missing_file_yields_defaults() {
        let _env = setup_temp_home();
        let cfg = block_on(load_config()).expect("load_config");
        assert_eq!(cfg, RelayConfig::default());
        assert_eq!(cfg.queue_settings().unwrap().max_residency, Duration::from_secs(300));
    }

    #[test]
    fn toml_takes_precedence_over_json() {
        let env = setup_temp_home();
        write_file(&env.home.join("config.json"), r#"{"port": 1111}"#);
        write_file(
            &env.home.join("config.toml"),
            r#"
port = 2222
queue_mode = "random"
shared_ips = ["10.0.0.1"]

[keys]
mistral = "m1,m2"

[upstreams]
openai = "http://127.0.0.1:9999/"
"#,
        );
        let cfg = block_on(load_config()).expect("load_config");
        assert_eq!(cfg.port, 2222);
        assert_eq!(cfg.queue_mode, QueueMode::Random);
        assert_eq!(cfg.base_url(Service::OpenAi), "http://127.0.0.1:9999");
        assert_eq!(cfg.base_url(Service::Cohere), "https://api.cohere.com");
        assert_eq!(
            cfg.credentials(),
            vec![(Service::Mistral, "m1,m2".to_string())]
        );
        assert_eq!(config_file_path(), env.home.join("config.toml"));
    }

    #[test]
    fn env_credentials_and_heartbeat_overrides_win() {
        let mut env = setup_temp_home();
        unsafe {
            env.env.set("MISTRAL_KEY", "from-env");
            env.env.set("HEARTBEAT_INTERVAL_SEC", "2");
            env.env.set("MAX_HEARTBEAT_SIZE_KB", "64");
        }
        let cfg = RelayConfig {
            keys: BTreeMap::from([(Service::Mistral, "from-file".to_string())]),
            ..RelayConfig::default()
        };
        assert_eq!(
            cfg.credentials(),
            vec![(Service::Mistral, "from-env".to_string())]
        );
        let hb = cfg.heartbeat_settings().unwrap();
        assert_eq!(hb.interval, Duration::from_secs(2));
        assert_eq!(hb.max_payload_bytes, 64 * 1024);
    }

    #[test]
    fn proxy_key_gatekeeper_requires_a_key() {
        let env = setup_temp_home();
        write_file(&env.home.join("config.toml"), "gatekeeper = \"proxy_key\"\n");
        let err = block_on(load_config()).unwrap_err();
        assert!(err.to_string().contains("proxy_key"), "{err}");
    }

    #[test]
    fn init_writes_a_loadable_template() {
        let env = setup_temp_home();
        let path = block_on(init_config_template(false)).expect("init");
        assert_eq!(path, env.home.join("config.toml"));
        assert!(block_on(init_config_template(false)).is_err());
        block_on(init_config_template(true)).expect("forced init");
        assert!(env.home.join("config.toml.bak").exists());

        let cfg = block_on(load_config()).expect("template parses");
        assert_eq!(cfg.heartbeat, HeartbeatConfig::default());
    }
}
