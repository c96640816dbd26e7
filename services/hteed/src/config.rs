//! Daemon configuration loading.
//!
//! Three layers, later wins: a TOML file (`--config`), `HTEED_*`
//! environment variables, CLI flags.  The upstream web URL and token are
//! required; everything else has a default.
//!
//! # TOML layout
//! ```toml
//! testing = false
//!
//! [bind]
//! address = "127.0.0.1"
//! port = 4000
//!
//! [redis]
//! url = "redis://127.0.0.1:6379"
//! key_prefix = ""
//!
//! [web]
//! url = "http://127.0.0.1:3000"
//! token = "deadbeef"
//! ```

use serde::Deserialize;
use std::path::Path;

// ---------------------------------------------------------------------------
// Resolved configuration
// ---------------------------------------------------------------------------

/// Fully-resolved daemon configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub bind_address: String,
    pub bind_port: u16,
    pub redis_url: String,
    pub web_url: String,
    pub web_token: String,
    pub key_prefix: String,
    pub testing: bool,
}

/// One layer of optional settings (env vars or CLI flags).
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub bind_address: Option<String>,
    pub bind_port: Option<u16>,
    pub redis_url: Option<String>,
    pub web_url: Option<String>,
    pub web_token: Option<String>,
    pub key_prefix: Option<String>,
    pub testing: Option<bool>,
}

// ---------------------------------------------------------------------------
// Raw TOML deserialization types (with Option for optional fields)
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
struct RawConfig {
    bind: Option<RawBind>,
    redis: Option<RawRedis>,
    web: Option<RawWeb>,
    testing: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
struct RawBind {
    address: Option<String>,
    port: Option<u16>,
}

#[derive(Debug, Default, Deserialize)]
struct RawRedis {
    url: Option<String>,
    key_prefix: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawWeb {
    url: Option<String>,
    token: Option<String>,
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Load configuration: optional TOML file, then the environment, then
/// `flags` on top.
pub fn load(path: Option<&Path>, flags: Overrides) -> Result<Config, ConfigError> {
    let raw = match path {
        Some(p) => {
            let toml_str = std::fs::read_to_string(p).map_err(|e| {
                ConfigError::Io(format!("reading config file '{}': {}", p.display(), e))
            })?;
            toml::from_str(&toml_str).map_err(|e| ConfigError::Parse(e.to_string()))?
        }
        None => RawConfig::default(),
    };
    let env = overrides_from_env()?;
    resolve(raw, env, flags)
}

fn overrides_from_env() -> Result<Overrides, ConfigError> {
    let var = |name: &str| std::env::var(name).ok();

    let bind_port = match var("HTEED_BIND_PORT") {
        Some(v) => Some(v.parse::<u16>().map_err(|_| {
            ConfigError::InvalidValue(format!("HTEED_BIND_PORT must be a port number, got '{v}'"))
        })?),
        None => None,
    };
    let testing = match var("HTEED_TESTING") {
        Some(v) => Some(v.parse::<bool>().map_err(|_| {
            ConfigError::InvalidValue(format!("HTEED_TESTING must be true or false, got '{v}'"))
        })?),
        None => None,
    };

    Ok(Overrides {
        bind_address: var("HTEED_BIND_ADDRESS"),
        bind_port,
        redis_url: var("HTEED_REDIS_URL"),
        web_url: var("HTEED_WEB_URL"),
        web_token: var("HTEED_WEB_TOKEN"),
        key_prefix: var("HTEED_KEY_PREFIX"),
        testing,
    })
}

fn resolve(file: RawConfig, env: Overrides, flags: Overrides) -> Result<Config, ConfigError> {
    let bind = file.bind.unwrap_or_default();
    let redis = file.redis.unwrap_or_default();
    let web = file.web.unwrap_or_default();

    let web_url = flags
        .web_url
        .or(env.web_url)
        .or(web.url)
        .ok_or_else(|| ConfigError::MissingField("web.url".to_owned()))?;
    url::Url::parse(&web_url)
        .map_err(|e| ConfigError::InvalidValue(format!("web.url '{web_url}': {e}")))?;

    let web_token = flags
        .web_token
        .or(env.web_token)
        .or(web.token)
        .ok_or_else(|| ConfigError::MissingField("web.token".to_owned()))?;

    Ok(Config {
        bind_address: flags
            .bind_address
            .or(env.bind_address)
            .or(bind.address)
            .unwrap_or_else(|| "127.0.0.1".to_owned()),
        bind_port: flags.bind_port.or(env.bind_port).or(bind.port).unwrap_or(4000),
        redis_url: flags
            .redis_url
            .or(env.redis_url)
            .or(redis.url)
            .unwrap_or_else(|| "redis://127.0.0.1:6379".to_owned()),
        web_url,
        web_token,
        key_prefix: flags
            .key_prefix
            .or(env.key_prefix)
            .or(redis.key_prefix)
            .unwrap_or_default(),
        testing: flags.testing.or(env.testing).or(file.testing).unwrap_or(false),
    })
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum ConfigError {
    Io(String),
    Parse(String),
    MissingField(String),
    InvalidValue(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(s) => write!(f, "IO error: {}", s),
            ConfigError::Parse(s) => write!(f, "Parse error: {}", s),
            ConfigError::MissingField(s) => write!(f, "Missing required field: {}", s),
            ConfigError::InvalidValue(s) => write!(f, "Invalid config value: {}", s),
        }
    }
}

impl std::error::Error for ConfigError {}
