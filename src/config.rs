use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub twilio: TwilioConfig,
    pub records: RecordsConfig,
    #[serde(default)]
    pub controller: ControllerConfig,
    #[serde(default)]
    pub api: ApiConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub external_url: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TwilioConfig {
    pub account_sid: String,
    pub auth_token: String,
    /// Caller id used for outbound calls.
    pub phone_number: String,
    /// Where the agent picks up: phone number or `client:` identity.
    pub agent_number: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RecordsConfig {
    pub base_url: String,
    pub api_key: String,
    #[serde(default = "default_records_table")]
    pub table: String,
}

fn default_records_table() -> String {
    "calls".to_string()
}

/// Timing knobs of the call lifecycle controller.
#[derive(Debug, Deserialize, Clone)]
pub struct ControllerConfig {
    #[serde(default = "default_tick_ms")]
    pub tick_interval_ms: u64,
    #[serde(default = "default_watchdog_ms")]
    pub watchdog_interval_ms: u64,
    /// Consecutive dead polls before the watchdog ends the call.
    #[serde(default = "default_watchdog_misses")]
    pub watchdog_miss_threshold: u32,
    #[serde(default = "default_latch_release_ms")]
    pub latch_release_ms: u64,
    #[serde(default = "default_hydration_retry_ms")]
    pub hydration_retry_ms: u64,
    #[serde(default = "default_hydration_attempts")]
    pub hydration_attempts: u32,
}

fn default_tick_ms() -> u64 {
    1000
}

fn default_watchdog_ms() -> u64 {
    1000
}

fn default_watchdog_misses() -> u32 {
    2
}

fn default_latch_release_ms() -> u64 {
    500
}

fn default_hydration_retry_ms() -> u64 {
    300
}

fn default_hydration_attempts() -> u32 {
    10
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: default_tick_ms(),
            watchdog_interval_ms: default_watchdog_ms(),
            watchdog_miss_threshold: default_watchdog_misses(),
            latch_release_ms: default_latch_release_ms(),
            hydration_retry_ms: default_hydration_retry_ms(),
            hydration_attempts: default_hydration_attempts(),
        }
    }
}

impl ControllerConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn watchdog_interval(&self) -> Duration {
        Duration::from_millis(self.watchdog_interval_ms)
    }

    pub fn latch_release(&self) -> Duration {
        Duration::from_millis(self.latch_release_ms)
    }

    pub fn hydration_retry(&self) -> Duration {
        Duration::from_millis(self.hydration_retry_ms)
    }
    /// Periods drive `tokio::time::interval`, which panics on zero.
    pub fn validate(&self) -> Result<(), String> {
        let periods = [
            ("tick_interval_ms", self.tick_interval_ms),
            ("watchdog_interval_ms", self.watchdog_interval_ms),
            ("hydration_retry_ms", self.hydration_retry_ms),
        ];
        for (name, ms) in periods {
            if ms == 0 {
                return Err(format!("controller.{name} must be greater than zero"));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct ApiConfig {
    /// Bearer token required for /api/* endpoints. If empty, all requests are rejected.
    #[serde(default)]
    pub token: String,
}

impl Config {
    pub fn load() -> Result<Self, Box<dyn std::error::Error>> {
        // Load .env file from same directory as config.toml
        let env_path = config_dir().join(".env");
        match dotenvy::from_path(&env_path) {
            Ok(()) => tracing::info!("Loaded .env from {}", env_path.display()),
            Err(dotenvy::Error::Io(_)) => {
                tracing::debug!(
                    "No .env file at {}, using environment only",
                    env_path.display()
                );
            }
            Err(e) => tracing::warn!("Failed to parse .env: {e}"),
        }

        let path = config_path();
        tracing::info!("Loading config from {}", path.display());

        let contents = std::fs::read_to_string(&path).map_err(|e| {
            format!(
                "Failed to read config at {}: {}. Copy config.example.toml to {}",
                path.display(),
                e,
                path.display()
            )
        })?;

        let mut config: Config = toml::from_str(&contents)?;
        config.apply_env_overrides();
        config.controller.validate()?;
        Ok(config)
    }

    /// Secrets may come from the environment instead of the file.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("TWILIO_ACCOUNT_SID") {
            self.twilio.account_sid = v;
        }
        if let Ok(v) = std::env::var("TWILIO_AUTH_TOKEN") {
            self.twilio.auth_token = v;
        }
        if let Ok(v) = std::env::var("RECORDS_API_KEY") {
            self.records.api_key = v;
        }
        if let Ok(v) = std::env::var("CALL_DESK_API_TOKEN") {
            self.api.token = v;
        }
        if let Ok(v) = std::env::var("SERVER_EXTERNAL_URL") {
            self.server.external_url = v;
        }
    }
}

fn config_dir() -> PathBuf {
    if let Ok(p) = std::env::var("CALL_DESK_CONFIG") {
        // If pointing to a file, use its parent directory
        let path = PathBuf::from(p);
        return path.parent().map(|p| p.to_path_buf()).unwrap_or(path);
    }

    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    PathBuf::from(home).join(".call-desk")
}

fn config_path() -> PathBuf {
    if let Ok(p) = std::env::var("CALL_DESK_CONFIG") {
        return PathBuf::from(p);
    }

    config_dir().join("config.toml")
}
