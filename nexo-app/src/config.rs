//! Nexo configuration loader.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct NexoConfig {
    pub general: GeneralConfig,
    #[serde(default)]
    pub keys: KeysConfig,
    pub store: StoreConfig,
    pub platform: PlatformConfig,
    #[serde(default)]
    pub debounce: DebounceConfig,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GeneralConfig {
    #[serde(default = "default_model")]
    pub model: String,
    /// Optional replacement for the assistant's default persona instructions.
    #[serde(default)]
    pub persona: Option<String>,
}

fn default_model() -> String {
    "gemini-1.5-flash".to_string()
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct KeysConfig {
    pub gemini_api_key: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    /// Base URL of the path-addressed store (Realtime-Database-style REST).
    pub base_url: String,
    #[serde(default)]
    pub auth_token: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PlatformConfig {
    /// Base URL of the WhatsApp bridge service.
    pub bridge_url: String,
    #[serde(default)]
    pub api_token: Option<String>,
    #[serde(default = "default_platform_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_platform_poll_interval_ms() -> u64 {
    1000
}

#[derive(Debug, Clone, Deserialize)]
pub struct DebounceConfig {
    /// Sliding window: restarts on every new message from the same end-user.
    #[serde(default = "default_debounce_window_seconds")]
    pub window_seconds: u64,
}

fn default_debounce_window_seconds() -> u64 {
    15
}

impl Default for DebounceConfig {
    fn default() -> Self {
        Self {
            window_seconds: default_debounce_window_seconds(),
        }
    }
}

impl DebounceConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_seconds)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReconnectConfig {
    #[serde(default = "default_reconnect_max_attempts")]
    pub max_attempts: u32,
    /// Fixed delay between attempts; intentionally not exponential.
    #[serde(default = "default_reconnect_delay_seconds")]
    pub delay_seconds: u64,
}

fn default_reconnect_max_attempts() -> u32 {
    5
}

fn default_reconnect_delay_seconds() -> u64 {
    3
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_reconnect_max_attempts(),
            delay_seconds: default_reconnect_delay_seconds(),
        }
    }
}

impl ReconnectConfig {
    pub fn delay(&self) -> Duration {
        Duration::from_secs(self.delay_seconds)
    }
}

impl NexoConfig {
    pub async fn load(path: Option<PathBuf>) -> anyhow::Result<Self> {
        let path = path.unwrap_or_else(default_config_path);
        let contents = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| anyhow::anyhow!("read config {}: {e}", path.display()))?;

        let mut cfg: NexoConfig = toml::from_str(&contents)
            .map_err(|e| anyhow::anyhow!("parse config {}: {e}", path.display()))?;

        cfg.apply_env_overrides();
        cfg.validate()?;
        Ok(cfg)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("NEXO_MODEL") {
            if !v.trim().is_empty() {
                self.general.model = v;
            }
        }
        if let Ok(v) = std::env::var("NEXO_PERSONA") {
            if !v.trim().is_empty() {
                self.general.persona = Some(v);
            }
        }
        if let Ok(v) = std::env::var("GEMINI_API_KEY") {
            if !v.trim().is_empty() {
                self.keys.gemini_api_key = Some(v);
            }
        }
        if let Ok(v) = std::env::var("NEXO_STORE_URL") {
            if !v.trim().is_empty() {
                self.store.base_url = v;
            }
        }
        if let Ok(v) = std::env::var("NEXO_STORE_AUTH_TOKEN") {
            if !v.trim().is_empty() {
                self.store.auth_token = Some(v);
            }
        }
        if let Ok(v) = std::env::var("NEXO_BRIDGE_URL") {
            if !v.trim().is_empty() {
                self.platform.bridge_url = v;
            }
        }
        if let Ok(v) = std::env::var("NEXO_BRIDGE_API_TOKEN") {
            if !v.trim().is_empty() {
                self.platform.api_token = Some(v);
            }
        }
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.general.model.trim().is_empty() {
            return Err(anyhow::anyhow!("general.model is required"));
        }
        if self.store.base_url.trim().is_empty() {
            return Err(anyhow::anyhow!("store.base_url is required"));
        }
        if self.platform.bridge_url.trim().is_empty() {
            return Err(anyhow::anyhow!("platform.bridge_url is required"));
        }
        if self.platform.poll_interval_ms == 0 {
            return Err(anyhow::anyhow!("platform.poll_interval_ms must be > 0"));
        }
        if self.debounce.window_seconds == 0 {
            return Err(anyhow::anyhow!("debounce.window_seconds must be > 0"));
        }
        if self.reconnect.max_attempts == 0 {
            return Err(anyhow::anyhow!("reconnect.max_attempts must be > 0"));
        }
        Ok(())
    }
}

pub fn default_config_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    Path::new(&home).join(".nexo").join("config.toml")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(contents: &str) -> NexoConfig {
        toml::from_str(contents).expect("config should parse")
    }

    #[test]
    fn minimal_config_gets_defaults() {
        let cfg = parse(
            r#"
[general]

[store]
base_url = "https://db.example.test"

[platform]
bridge_url = "http://localhost:8044"
"#,
        );
        assert_eq!(cfg.general.model, "gemini-1.5-flash");
        assert_eq!(cfg.debounce.window_seconds, 15);
        assert_eq!(cfg.reconnect.max_attempts, 5);
        assert_eq!(cfg.reconnect.delay_seconds, 3);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn zero_debounce_window_is_rejected() {
        let cfg = parse(
            r#"
[general]

[store]
base_url = "https://db.example.test"

[platform]
bridge_url = "http://localhost:8044"

[debounce]
window_seconds = 0
"#,
        );
        assert!(cfg.validate().is_err());
    }
}
