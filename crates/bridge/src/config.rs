//! TOML config file loading, environment overrides, and validation.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::env;
use std::path::Path;
use std::time::Duration;

use crate::retry::Backoff;

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub mqtt: MqttConfig,
    pub storage: StorageConfig,
    pub web: WebConfig,
    pub telemetry: TelemetryConfig,
    pub ingest: IngestConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub topic: String,
    pub keep_alive_sec: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub db_url: String,
    /// JSON document holding the control record.
    pub control_path: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WebConfig {
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Readings returned when the client does not ask for a count.
    pub default_window: u32,
    pub max_window: u32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    pub store_attempts: u32,
    pub store_retry_ms: u64,
    pub store_retry_max_ms: u64,
    pub reconnect_initial_ms: u64,
    pub reconnect_max_ms: u64,
    pub drain_timeout_sec: u64,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 1883,
            client_id: "device-bridge".into(),
            topic: "device/telemetry".into(),
            keep_alive_sec: 60,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_url: "sqlite:telemetry.db".into(),
            control_path: "results.json".into(),
        }
    }
}

impl Default for WebConfig {
    fn default() -> Self {
        Self { port: 8080 }
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            default_window: 50,
            max_window: 500,
        }
    }
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            store_attempts: 5,
            store_retry_ms: 200,
            store_retry_max_ms: 5_000,
            reconnect_initial_ms: 1_000,
            reconnect_max_ms: 30_000,
            drain_timeout_sec: 5,
        }
    }
}

impl IngestConfig {
    pub fn store_backoff(&self) -> Backoff {
        Backoff::new(
            Duration::from_millis(self.store_retry_ms),
            Duration::from_millis(self.store_retry_max_ms),
        )
    }

    pub fn reconnect_backoff(&self) -> Backoff {
        Backoff::new(
            Duration::from_millis(self.reconnect_initial_ms),
            Duration::from_millis(self.reconnect_max_ms),
        )
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_sec)
    }

    /// Upper bound on how long the ingest task may run after shutdown: an
    /// append that exhausts its retries, then the broker drain, plus slack.
    pub fn shutdown_grace(&self) -> Duration {
        self.store_backoff().total_delay(self.store_attempts)
            + self.drain_timeout()
            + Duration::from_secs(1)
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Validate all sections. Returns `Ok(())` or an error describing every
    /// violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        self.validate_mqtt(&mut errors);
        self.validate_storage(&mut errors);
        self.validate_telemetry(&mut errors);
        self.validate_ingest(&mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    fn validate_mqtt(&self, errors: &mut Vec<String>) {
        let m = &self.mqtt;
        if m.host.trim().is_empty() {
            errors.push("mqtt.host is empty".into());
        }
        if m.port == 0 {
            errors.push("mqtt.port must be non-zero".into());
        }
        if m.client_id.trim().is_empty() {
            errors.push("mqtt.client_id is empty".into());
        }
        if m.topic.trim().is_empty() {
            errors.push("mqtt.topic is empty".into());
        } else if !is_valid_topic_filter(&m.topic) {
            errors.push(format!(
                "mqtt.topic '{}' is not a valid topic filter ('#' must be last, wildcards must fill a whole level)",
                m.topic
            ));
        }
        if m.keep_alive_sec < 5 {
            errors.push(format!(
                "mqtt.keep_alive_sec must be at least 5, got {}",
                m.keep_alive_sec
            ));
        }
    }

    fn validate_storage(&self, errors: &mut Vec<String>) {
        if !self.storage.db_url.starts_with("sqlite:") {
            errors.push(format!(
                "storage.db_url '{}' must be a sqlite: url",
                self.storage.db_url
            ));
        }
        if self.storage.control_path.trim().is_empty() {
            errors.push("storage.control_path is empty".into());
        }
    }

    fn validate_telemetry(&self, errors: &mut Vec<String>) {
        let t = &self.telemetry;
        if t.max_window == 0 {
            errors.push("telemetry.max_window must be positive".into());
        }
        if t.default_window == 0 {
            errors.push("telemetry.default_window must be positive".into());
        }
        if t.default_window > t.max_window {
            errors.push(format!(
                "telemetry.default_window ({}) exceeds telemetry.max_window ({})",
                t.default_window, t.max_window
            ));
        }
    }

    fn validate_ingest(&self, errors: &mut Vec<String>) {
        let i = &self.ingest;
        if i.store_attempts == 0 {
            errors.push("ingest.store_attempts must be at least 1".into());
        }
        if i.store_retry_ms > i.store_retry_max_ms {
            errors.push(format!(
                "ingest.store_retry_ms ({}) exceeds ingest.store_retry_max_ms ({})",
                i.store_retry_ms, i.store_retry_max_ms
            ));
        }
        if i.reconnect_initial_ms == 0 {
            errors.push("ingest.reconnect_initial_ms must be positive".into());
        }
        if i.reconnect_initial_ms > i.reconnect_max_ms {
            errors.push(format!(
                "ingest.reconnect_initial_ms ({}) exceeds ingest.reconnect_max_ms ({})",
                i.reconnect_initial_ms, i.reconnect_max_ms
            ));
        }
    }

    /// Environment variables win over the file.
    pub fn apply_env(&mut self) -> Result<()> {
        if let Ok(v) = env::var("MQTT_HOST") {
            self.mqtt.host = v;
        }
        if let Ok(v) = env::var("MQTT_PORT") {
            self.mqtt.port = v
                .parse()
                .with_context(|| format!("MQTT_PORT '{v}' is not a port number"))?;
        }
        if let Ok(v) = env::var("MQTT_TOPIC") {
            self.mqtt.topic = v;
        }
        if let Ok(v) = env::var("DB_URL") {
            self.storage.db_url = v;
        }
        if let Ok(v) = env::var("CONTROL_PATH") {
            self.storage.control_path = v;
        }
        if let Ok(v) = env::var("WEB_PORT") {
            self.web.port = v
                .parse()
                .with_context(|| format!("WEB_PORT '{v}' is not a port number"))?;
        }
        Ok(())
    }
}

fn is_valid_topic_filter(filter: &str) -> bool {
    let levels: Vec<&str> = filter.split('/').collect();
    levels.iter().enumerate().all(|(i, level)| match *level {
        "#" => i == levels.len() - 1,
        "+" => true,
        l => !l.contains('#') && !l.contains('+'),
    })
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

/// Parse a TOML config string without env overrides or validation.
pub fn parse(contents: &str) -> Result<Config> {
    toml::from_str(contents).context("failed to parse config")
}

/// Read the config file (defaults if it does not exist), apply env
/// overrides, and validate.
pub fn load(path: &str) -> Result<Config> {
    let mut config = if Path::new(path).exists() {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config: {path}"))?;
        parse(&contents).with_context(|| format!("failed to parse config: {path}"))?
    } else {
        tracing::info!(path, "no config file, using defaults");
        Config::default()
    };

    config.apply_env()?;
    config
        .validate()
        .with_context(|| format!("invalid config: {path}"))?;
    Ok(config)
}

// ===========================================================================
// Tests
// ===========================================================================
