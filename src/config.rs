use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use log::info;
use serde::{Deserialize, Serialize};

use crate::channel_map::{ChannelMap, default_overrides};
use crate::device::{DEFAULT_CHIP, DEFAULT_PERIOD_NS};
use crate::fade::{DEFAULT_FADE_SPEED, DEFAULT_TICK};

/// Startup configuration, read once from a JSON file. Every field has a
/// default so a partial file (or none at all) works.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub channel_count: u16,
    /// Logical -> physical exceptions to the identity mapping.
    pub channel_overrides: BTreeMap<u16, u16>,
    pub tick_ms: u64,
    pub fade_speed: u16,
    pub period_ns: u32,
    pub http_listen: String,
    pub ws_listen: Option<String>,
    pub ws_interval_ms: u64,
    pub frontend_dir: PathBuf,
    pub pwm_chip: PathBuf,
    pub device_timeout_ms: u64,
    pub provision_poll_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            channel_count: 16,
            channel_overrides: default_overrides(),
            tick_ms: DEFAULT_TICK.as_millis() as u64,
            fade_speed: DEFAULT_FADE_SPEED,
            period_ns: DEFAULT_PERIOD_NS,
            http_listen: String::from("0.0.0.0:7777"),
            ws_listen: None,
            ws_interval_ms: 40,
            frontend_dir: PathBuf::from("./frontend"),
            pwm_chip: PathBuf::from(DEFAULT_CHIP),
            device_timeout_ms: 250,
            provision_poll_ms: 10,
        }
    }
}

impl Config {
    /// Load `path`, falling back to defaults when the file does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                info!("[CONFIG] {} not found, using defaults", path.display());
                return Ok(Config::default());
            }
            Err(e) => return Err(e).with_context(|| format!("reading {}", path.display())),
        };
        let config: Config = serde_json::from_str(&content)
            .with_context(|| format!("parsing {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        let mut file =
            fs::File::create(path).with_context(|| format!("creating {}", path.display()))?;
        file.write_all(json.as_bytes())?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.tick_ms == 0 {
            bail!("tick_ms must be at least 1");
        }
        if self.period_ns == 0 {
            bail!("period_ns must be at least 1");
        }
        if self.ws_interval_ms == 0 {
            bail!("ws_interval_ms must be at least 1");
        }
        self.channel_map()?;
        Ok(())
    }

    pub fn channel_map(&self) -> Result<ChannelMap> {
        ChannelMap::new(self.channel_count, &self.channel_overrides)
            .context("invalid channel mapping")
    }

    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }

    pub fn ws_interval(&self) -> Duration {
        Duration::from_millis(self.ws_interval_ms)
    }

    pub fn device_timeout(&self) -> Duration {
        Duration::from_millis(self.device_timeout_ms)
    }

    pub fn provision_poll(&self) -> Duration {
        Duration::from_millis(self.provision_poll_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::scratch_dir;

    #[test]
    fn missing_file_gives_defaults() {
        let dir = scratch_dir("config-missing");
        let config = Config::load(&dir.join("nope.json")).unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.channel_count, 16);
        assert_eq!(config.channel_overrides.get(&9), Some(&10));
        assert_eq!(config.tick(), Duration::from_millis(30));
        assert_eq!(config.fade_speed, 100);
        assert_eq!(config.period_ns, 1_000_000);
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let dir = scratch_dir("config-partial");
        let path = dir.join("pwmfade.json");
        fs::write(&path, r#"{ "tick_ms": 10, "channel_overrides": { "0": 3, "3": 0 } }"#).unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.tick_ms, 10);
        assert_eq!(config.fade_speed, 100);
        let map = config.channel_map().unwrap();
        assert_eq!(map.physical(0), Some(3));
        assert_eq!(map.physical(3), Some(0));
        assert_eq!(map.physical(9), Some(9));
    }

    #[test]
    fn save_then_load() {
        let dir = scratch_dir("config-save");
        let path = dir.join("pwmfade.json");
        let config = Config {
            ws_listen: Some(String::from("127.0.0.1:7778")),
            fade_speed: 0,
            ..Config::default()
        };
        config.save(&path).unwrap();
        assert_eq!(Config::load(&path).unwrap(), config);
    }

    #[test]
    fn rejects_invalid_values() {
        let dir = scratch_dir("config-invalid");
        let path = dir.join("pwmfade.json");

        fs::write(&path, r#"{ "tick_ms": 0 }"#).unwrap();
        assert!(Config::load(&path).is_err());

        fs::write(&path, r#"{ "fade_speed": 70000 }"#).unwrap();
        assert!(Config::load(&path).is_err());

        fs::write(&path, r#"{ "channel_count": 8 }"#).unwrap();
        assert!(Config::load(&path).is_err(), "default overrides do not fit 8 channels");

        fs::write(&path, "{ not json").unwrap();
        assert!(Config::load(&path).is_err());
    }
}
