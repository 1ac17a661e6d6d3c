use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use super::platform;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub playback: PlaybackConfig,
    #[serde(default)]
    pub spectrum: SpectrumConfig,
    #[serde(default)]
    pub tuning: TuningConfig,
    #[serde(default)]
    pub http: HttpConfig,
}

/// Registry node the tuner follows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaybackConfig {
    #[serde(default = "default_volume")]
    pub default_volume: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpectrumConfig {
    /// Display refresh cadence for the level sampler.
    #[serde(default = "default_frame_interval_ms")]
    pub frame_interval_ms: u64,
    /// FFT window of the audio tap; the tap exposes `fft_size / 2` bins.
    #[serde(default = "default_fft_size")]
    pub fft_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TuningConfig {
    /// How long the transient "tuning" flag stays raised after a tune step.
    #[serde(default = "default_flash_ms")]
    pub flash_ms: u64,
}

/// Local control surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_http_enabled")]
    pub enabled: bool,
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
        }
    }
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            default_volume: default_volume(),
        }
    }
}

impl Default for SpectrumConfig {
    fn default() -> Self {
        Self {
            frame_interval_ms: default_frame_interval_ms(),
            fft_size: default_fft_size(),
        }
    }
}

impl Default for TuningConfig {
    fn default() -> Self {
        Self {
            flash_ms: default_flash_ms(),
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            enabled: default_http_enabled(),
            bind_address: default_bind_address(),
            port: default_port(),
        }
    }
}

fn default_base_url() -> String {
    "http://127.0.0.1:8080".to_string()
}

fn default_volume() -> f32 {
    0.5
}

fn default_frame_interval_ms() -> u64 {
    16
}

fn default_fft_size() -> usize {
    2048
}

fn default_flash_ms() -> u64 {
    200
}

fn default_http_enabled() -> bool {
    true
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8991
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        let config_path = Self::config_path();

        if !config_path.exists() {
            let config = Self::default();
            config.save()?;
            return Ok(config);
        }

        let content = std::fs::read_to_string(&config_path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let mut config: Self = toml::from_str(content)?;
        config.playback.default_volume = config.playback.default_volume.clamp(0.0, 1.0);
        config.spectrum.frame_interval_ms = config.spectrum.frame_interval_ms.max(1);
        Ok(config)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let config_path = Self::config_path();
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(&config_path, content)?;
        Ok(())
    }

    pub fn config_path() -> PathBuf {
        platform::config_dir().join("config.toml")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.http.enabled);
        assert_eq!(config.http.port, 8991);
        assert_eq!(config.http.bind_address, "127.0.0.1");
        assert_eq!(config.server.base_url, "http://127.0.0.1:8080");
        assert_eq!(config.tuning.flash_ms, 200);
        assert_eq!(config.spectrum.frame_interval_ms, 16);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let config = Config::from_toml_str(
            "[server]\nbase_url = \"https://radio.example.com\"\n\n[playback]\ndefault_volume = 3.0\n",
        )
        .unwrap();
        assert_eq!(config.server.base_url, "https://radio.example.com");
        assert_eq!(config.playback.default_volume, 1.0);
        assert_eq!(config.spectrum.fft_size, 2048);
        assert!(config.http.enabled);
    }

    #[test]
    fn test_config_path_under_config_dir() {
        assert!(Config::config_path().ends_with("shortwave-tuner/config.toml"));
    }
}
