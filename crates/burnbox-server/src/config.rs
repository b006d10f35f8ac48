//! Server configuration: TOML file, then `BURNBOX_*` environment overlay,
//! then [`Config::validate`] into a [`ValidatedConfig`].

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::captcha::TURNSTILE_VERIFY_URL;
use crate::service::SecretPolicy;

/// File looked for in the working directory when no path is given.
pub const DEFAULT_CONFIG_FILE: &str = "burnbox.toml";

const REDACTED: &str = "<redacted>";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub security: SecuritySection,
    #[serde(default)]
    pub secrets: SecretsSection,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub cors: CorsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".into()
}

fn default_port() -> u16 {
    8080
}

#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SecuritySection {
    /// Wrap stored payloads in the server envelope.
    #[serde(default = "default_true")]
    pub server_side_encryption: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_key: Option<String>,
    #[serde(default = "default_true")]
    pub captcha_enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub captcha_secret: Option<String>,
    #[serde(default = "default_captcha_verify_url")]
    pub captcha_verify_url: String,
    #[serde(default = "default_captcha_timeout_secs")]
    pub captcha_timeout_secs: u64,
}

impl Default for SecuritySection {
    fn default() -> Self {
        Self {
            server_side_encryption: true,
            server_key: None,
            captcha_enabled: true,
            captcha_secret: None,
            captcha_verify_url: default_captcha_verify_url(),
            captcha_timeout_secs: default_captcha_timeout_secs(),
        }
    }
}

impl fmt::Debug for SecuritySection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecuritySection")
            .field("server_side_encryption", &self.server_side_encryption)
            .field("server_key", &self.server_key.as_ref().map(|_| REDACTED))
            .field("captcha_enabled", &self.captcha_enabled)
            .field("captcha_secret", &self.captcha_secret.as_ref().map(|_| REDACTED))
            .field("captcha_verify_url", &self.captcha_verify_url)
            .field("captcha_timeout_secs", &self.captcha_timeout_secs)
            .finish()
    }
}

fn default_true() -> bool {
    true
}

fn default_captcha_verify_url() -> String {
    TURNSTILE_VERIFY_URL.into()
}

fn default_captcha_timeout_secs() -> u64 {
    10
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SecretsSection {
    /// Defaults to `<platform data dir>/secrets`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_path: Option<PathBuf>,
    #[serde(default = "default_max_secret_size")]
    pub max_secret_size_bytes: usize,
    #[serde(default = "default_max_custom_name_length")]
    pub max_custom_name_length: usize,
    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,
    /// Durations in `humantime` syntax.
    #[serde(default = "default_allowed_expiry")]
    pub allowed_expiry: Vec<String>,
    #[serde(default = "default_expiry")]
    pub default_expiry: String,
}

impl Default for SecretsSection {
    fn default() -> Self {
        Self {
            storage_path: None,
            max_secret_size_bytes: default_max_secret_size(),
            max_custom_name_length: default_max_custom_name_length(),
            cleanup_interval_secs: default_cleanup_interval_secs(),
            allowed_expiry: default_allowed_expiry(),
            default_expiry: default_expiry(),
        }
    }
}

fn default_max_secret_size() -> usize {
    1024 * 1024
}

fn default_max_custom_name_length() -> usize {
    32
}

fn default_cleanup_interval_secs() -> u64 {
    300
}

fn default_allowed_expiry() -> Vec<String> {
    ["10m", "30m", "1h", "24h", "7d"].map(String::from).to_vec()
}

fn default_expiry() -> String {
    "10m".into()
}

/// Hourly and per-minute ceilings for one route.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RouteLimit {
    pub requests_per_hour: u32,
    pub requests_per_minute: u32,
}

impl Default for RouteLimit {
    fn default() -> Self {
        Self {
            requests_per_hour: 100,
            requests_per_minute: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RateLimitConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Counters live in process memory when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redis_url: Option<String>,
    #[serde(default)]
    pub default: RouteLimit,
    /// Overrides keyed by `create_secret`, `view_secret`, `view_secret_by_name`.
    #[serde(default)]
    pub routes: HashMap<String, RouteLimit>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            redis_url: None,
            default: RouteLimit::default(),
            routes: HashMap::new(),
        }
    }
}

impl RateLimitConfig {
    pub fn limits_for(&self, route_key: Option<&str>) -> RouteLimit {
        route_key
            .and_then(|k| self.routes.get(k))
            .copied()
            .unwrap_or(self.default)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CorsConfig {
    /// Empty grants no cross-origin access.
    #[serde(default)]
    pub allowed_origins: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".into()
}

/// Read a key from a file, trimming surrounding whitespace.
/// Fails if the file cannot be read or is empty after trimming.
pub fn read_key_file(path: &Path) -> Result<String> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("read key file: {}", path.display()))?;
    let key = content.trim().to_string();
    if key.is_empty() {
        bail!("key file is empty: {}", path.display());
    }
    Ok(key)
}

impl Config {
    /// Load from `path` if given (must exist), else from [`DEFAULT_CONFIG_FILE`]
    /// when present, else defaults. Does not apply the environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_file(path),
            None => {
                let fallback = Path::new(DEFAULT_CONFIG_FILE);
                if fallback.exists() {
                    Self::from_file(fallback)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("read config file: {}", path.display()))?;
        Self::from_toml(&text).with_context(|| format!("parse config file: {}", path.display()))
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Overlay `BURNBOX_*` variables from the process environment. Returns
    /// warnings for the caller to log once tracing is up.
    pub fn apply_env(&mut self) -> Result<Vec<String>> {
        self.apply_env_from(|name| std::env::var(name).ok())
    }

    /// Overlay using `lookup` in place of the process environment.
    pub fn apply_env_from(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Vec<String>> {
        let mut warnings = Vec::new();
        let var = |name: &str| lookup(name).filter(|v| !v.is_empty());

        if let Some(host) = var("BURNBOX_HOST") {
            self.server.host = host;
        }
        if let Some(port) = var("BURNBOX_PORT") {
            self.server.port = port
                .parse()
                .with_context(|| format!("BURNBOX_PORT is not a port number: {port:?}"))?;
        }
        if let Some(dir) = var("BURNBOX_DATA_DIR") {
            self.secrets.storage_path = Some(PathBuf::from(dir).join("secrets"));
        }
        if let Some(level) = var("BURNBOX_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(path) = var("BURNBOX_SERVER_KEY_FILE") {
            if var("BURNBOX_SERVER_KEY").is_some() {
                warnings.push(
                    "both BURNBOX_SERVER_KEY and BURNBOX_SERVER_KEY_FILE are set; using file".to_string(),
                );
            }
            self.security.server_key = Some(read_key_file(Path::new(&path))?);
        } else if let Some(key) = var("BURNBOX_SERVER_KEY") {
            self.security.server_key = Some(key);
        }
        if let Some(secret) = var("BURNBOX_CAPTCHA_SECRET") {
            self.security.captcha_secret = Some(secret);
        }
        if let Some(url) = var("BURNBOX_REDIS_URL") {
            self.rate_limit.redis_url = Some(url);
        }
        if let Some(origins) = var("BURNBOX_CORS_ORIGINS") {
            self.cors.allowed_origins = origins
                .split(',')
                .map(str::trim)
                .filter(|o| !o.is_empty())
                .map(String::from)
                .collect();
        }
        Ok(warnings)
    }

    /// Copy with credentials masked, for printing.
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        let mask = |v: &mut Option<String>| {
            if v.is_some() {
                *v = Some(REDACTED.into());
            }
        };
        mask(&mut copy.security.server_key);
        mask(&mut copy.security.captcha_secret);
        mask(&mut copy.rate_limit.redis_url);
        copy
    }

    pub fn validate(self) -> Result<ValidatedConfig> {
        if self.server.port == 0 {
            bail!("server.port must be non-zero");
        }
        let secrets = &self.secrets;
        if secrets.max_custom_name_length == 0 {
            bail!("secrets.max_custom_name_length must be positive");
        }
        if secrets.max_secret_size_bytes == 0 {
            bail!("secrets.max_secret_size_bytes must be positive");
        }
        if secrets.cleanup_interval_secs == 0 {
            bail!("secrets.cleanup_interval_secs must be positive");
        }
        if secrets.allowed_expiry.is_empty() {
            bail!("secrets.allowed_expiry must list at least one duration");
        }
        let allowed_expiry = secrets
            .allowed_expiry
            .iter()
            .map(|s| parse_expiry(s))
            .collect::<Result<Vec<_>>>()?;
        let default_expiry = parse_expiry(&secrets.default_expiry)?;
        if !allowed_expiry.contains(&default_expiry) {
            bail!(
                "secrets.default_expiry {:?} is not one of secrets.allowed_expiry",
                secrets.default_expiry
            );
        }

        if self.cors.allowed_origins.iter().any(|o| o == "*") {
            bail!("cors.allowed_origins does not accept \"*\"; list each origin");
        }

        if self.rate_limit.enabled {
            let limits = std::iter::once(("default", &self.rate_limit.default))
                .chain(self.rate_limit.routes.iter().map(|(k, v)| (k.as_str(), v)));
            for (route, limit) in limits {
                if limit.requests_per_hour == 0 || limit.requests_per_minute == 0 {
                    bail!("rate_limit for {route:?} must have non-zero ceilings");
                }
            }
        }

        let server_key = self.security.server_key.filter(|k| !k.is_empty());
        if self.security.server_side_encryption && server_key.is_none() {
            bail!("server-side encryption is enabled but no server key is set (BURNBOX_SERVER_KEY or BURNBOX_SERVER_KEY_FILE)");
        }

        let captcha = if self.security.captcha_enabled {
            let secret = self
                .security
                .captcha_secret
                .filter(|s| !s.is_empty())
                .context("CAPTCHA is enabled but no secret is set (BURNBOX_CAPTCHA_SECRET)")?;
            Some(CaptchaSettings {
                secret,
                verify_url: self.security.captcha_verify_url,
                timeout: Duration::from_secs(self.security.captcha_timeout_secs),
            })
        } else {
            None
        };

        let storage_path = match self.secrets.storage_path {
            Some(path) => path,
            None => crate::dirs::data_dir()?.join("secrets"),
        };

        Ok(ValidatedConfig {
            host: self.server.host,
            port: self.server.port,
            storage_path,
            cleanup_interval: Duration::from_secs(self.secrets.cleanup_interval_secs),
            policy: SecretPolicy {
                max_secret_size_bytes: self.secrets.max_secret_size_bytes,
                max_custom_name_length: self.secrets.max_custom_name_length,
                allowed_expiry,
                default_expiry,
            },
            server_side_encryption: self.security.server_side_encryption,
            server_key,
            captcha,
            rate_limit: self.rate_limit.enabled.then_some(self.rate_limit),
            cors_origins: self.cors.allowed_origins,
            logging: self.logging,
        })
    }
}

fn parse_expiry(s: &str) -> Result<Duration> {
    let d = humantime::parse_duration(s).with_context(|| format!("invalid expiry duration {s:?}"))?;
    if d.is_zero() {
        bail!("expiry duration {s:?} must be positive");
    }
    Ok(d)
}

#[derive(Clone)]
pub struct CaptchaSettings {
    pub secret: String,
    pub verify_url: String,
    pub timeout: Duration,
}

/// Configuration that passed [`Config::validate`], with durations parsed.
#[derive(Clone)]
pub struct ValidatedConfig {
    pub host: String,
    pub port: u16,
    pub storage_path: PathBuf,
    pub cleanup_interval: Duration,
    pub policy: SecretPolicy,
    pub server_side_encryption: bool,
    /// Set whenever a key was supplied, even with encryption off, so older
    /// sealed records stay readable.
    pub server_key: Option<String>,
    /// `None` when CAPTCHA checks are disabled.
    pub captcha: Option<CaptchaSettings>,
    /// `None` when rate limiting is disabled.
    pub rate_limit: Option<RateLimitConfig>,
    pub cors_origins: Vec<String>,
    pub logging: LoggingConfig,
}

impl fmt::Debug for ValidatedConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ValidatedConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("storage_path", &self.storage_path)
            .field("cleanup_interval", &self.cleanup_interval)
            .field("policy", &self.policy)
            .field("server_side_encryption", &self.server_side_encryption)
            .field("server_key", &self.server_key.as_ref().map(|_| REDACTED))
            .field("captcha", &self.captcha.as_ref().map(|c| &c.verify_url))
            .field("rate_limit", &self.rate_limit)
            .field("cors_origins", &self.cors_origins)
            .field("logging", &self.logging)
            .finish()
    }
}
