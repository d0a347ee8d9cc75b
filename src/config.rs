use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::classifier::Tier;

// ---------------------------------------------------------------------------
// Main configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub tokenomics: TokenomicsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            cors_origins: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AuthConfig {
    /// Master switch: when false, all API routes are accessible without auth.
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_admin_name")]
    pub default_admin_name: String,
    /// Allow provider sessions that present no (or an invalid) credential.
    /// Anonymous providers serve traffic but never earn MULE.
    #[serde(default)]
    pub allow_anonymous_providers: bool,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            default_admin_name: default_admin_name(),
            allow_anonymous_providers: false,
        }
    }
}

/// Timing and load tunables for provider sessions and request routing.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DispatchConfig {
    /// Interval between keep-alive probes to each provider session.
    #[serde(default = "default_ping_interval")]
    pub ping_interval_secs: u64,
    /// A session silent for longer than this is removed.
    #[serde(default = "default_session_timeout")]
    pub session_timeout_secs: u64,
    /// Default deadline for a forwarded completion request.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    /// Hard cap on any per-request timeout override.
    #[serde(default = "default_request_timeout_cap")]
    pub request_timeout_cap_secs: u64,
    /// A provider with this many in-flight requests receives no new work.
    #[serde(default = "default_load_threshold")]
    pub load_threshold: u32,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            ping_interval_secs: default_ping_interval(),
            session_timeout_secs: default_session_timeout(),
            request_timeout_secs: default_request_timeout(),
            request_timeout_cap_secs: default_request_timeout_cap(),
            load_threshold: default_load_threshold(),
        }
    }
}

/// Pricing constants. Loaded once at startup and treated as constants
/// thereafter; all MULE values carry six decimal places.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TokenomicsConfig {
    #[serde(default = "default_welcome_amount")]
    pub welcome_amount: f64,
    #[serde(default = "default_platform_fee_rate")]
    pub platform_fee_rate: f64,
    #[serde(default)]
    pub conversion_rates: ConversionRates,
}

impl Default for TokenomicsConfig {
    fn default() -> Self {
        Self {
            welcome_amount: default_welcome_amount(),
            platform_fee_rate: default_platform_fee_rate(),
            conversion_rates: ConversionRates::default(),
        }
    }
}

/// Tokens per MULE for each capability tier.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ConversionRates {
    #[serde(default = "default_rate_small")]
    pub small: u64,
    #[serde(default = "default_rate_medium")]
    pub medium: u64,
    #[serde(default = "default_rate_large")]
    pub large: u64,
    #[serde(default = "default_rate_xl")]
    pub xl: u64,
}

impl Default for ConversionRates {
    fn default() -> Self {
        Self {
            small: default_rate_small(),
            medium: default_rate_medium(),
            large: default_rate_large(),
            xl: default_rate_xl(),
        }
    }
}

impl ConversionRates {
    /// Tokens per MULE for the given tier.
    pub fn rate(&self, tier: Tier) -> u64 {
        match tier {
            Tier::Small => self.small,
            Tier::Medium => self.medium,
            Tier::Large => self.large,
            Tier::Xl => self.xl,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
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

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

impl Config {
    /// Load configuration from a TOML file, falling back to defaults when
    /// the file does not exist. Environment variables override file values.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let mut config = if path.exists() {
            let raw = std::fs::read_to_string(path)?;
            toml::from_str(&raw)?
        } else {
            Config::default()
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// The address the HTTP server binds to.
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(host) = std::env::var("LLMULE_HOST") {
            self.server.host = host;
        }
        if let Some(port) = env_parse("LLMULE_PORT") {
            self.server.port = port;
        }
        if let Ok(path) = std::env::var("LLMULE_DB_PATH") {
            self.database.path = PathBuf::from(path);
        }
        if let Some(v) = env_parse("LLMULE_PING_INTERVAL") {
            self.dispatch.ping_interval_secs = v;
        }
        if let Some(v) = env_parse("LLMULE_SESSION_TIMEOUT") {
            self.dispatch.session_timeout_secs = v;
        }
        if let Some(v) = env_parse("LLMULE_REQUEST_TIMEOUT") {
            self.dispatch.request_timeout_secs = v;
        }
        if let Some(v) = env_parse("LLMULE_LOAD_THRESHOLD") {
            self.dispatch.load_threshold = v;
        }
        if let Some(v) = env_parse("LLMULE_PLATFORM_FEE_RATE") {
            self.tokenomics.platform_fee_rate = v;
        }
        if let Some(v) = env_parse("LLMULE_WELCOME_AMOUNT") {
            self.tokenomics.welcome_amount = v;
        }
        if let Ok(level) = std::env::var("LLMULE_LOG_LEVEL") {
            self.logging.level = level;
        }
    }

    fn validate(&self) -> anyhow::Result<()> {
        if !(0.0..1.0).contains(&self.tokenomics.platform_fee_rate) {
            anyhow::bail!(
                "platform_fee_rate must be in [0, 1), got {}",
                self.tokenomics.platform_fee_rate
            );
        }
        if self.tokenomics.welcome_amount < 0.0 {
            anyhow::bail!("welcome_amount must be non-negative");
        }
        let rates = &self.tokenomics.conversion_rates;
        if rates.small == 0 || rates.medium == 0 || rates.large == 0 || rates.xl == 0 {
            anyhow::bail!("conversion rates must be positive");
        }
        if self.dispatch.load_threshold == 0 {
            anyhow::bail!("load_threshold must be positive");
        }
        if self.dispatch.request_timeout_secs > self.dispatch.request_timeout_cap_secs {
            anyhow::bail!(
                "request_timeout_secs ({}) exceeds the hard cap ({})",
                self.dispatch.request_timeout_secs,
                self.dispatch.request_timeout_cap_secs
            );
        }
        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8585
}

fn default_db_path() -> PathBuf {
    PathBuf::from("llmule.db")
}

fn default_true() -> bool {
    true
}

fn default_admin_name() -> String {
    "admin".to_string()
}

fn default_ping_interval() -> u64 {
    15
}

fn default_session_timeout() -> u64 {
    45
}

fn default_request_timeout() -> u64 {
    180
}

fn default_request_timeout_cap() -> u64 {
    300
}

fn default_load_threshold() -> u32 {
    5
}

fn default_welcome_amount() -> f64 {
    1.0
}

fn default_platform_fee_rate() -> f64 {
    0.10
}

fn default_rate_small() -> u64 {
    1_000_000
}

fn default_rate_medium() -> u64 {
    500_000
}

fn default_rate_large() -> u64 {
    250_000
}

fn default_rate_xl() -> u64 {
    125_000
}

fn default_log_level() -> String {
    "info".to_string()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
