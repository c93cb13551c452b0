use anyhow::{Context, Result};
use serde::Deserialize;
use std::time::Duration;

use crate::commandline::CliArgs;

/// Connector settings, taken from the command line and optionally a YAML file.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub device: String,
    pub timeout: Duration,
    pub store_size: usize,
    pub interval: Duration,
}

impl From<&CliArgs> for Settings {
    fn from(args: &CliArgs) -> Self {
        Self {
            device: args.device.clone(),
            timeout: args.timeout,
            store_size: args.store_size,
            interval: args.interval,
        }
    }
}

/// Daemon configuration file, every value present overrides the command line.
#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    device: Option<String>,
    #[serde(default, with = "humantime_serde")]
    timeout: Option<Duration>,
    store_size: Option<usize>,
    #[serde(default, with = "humantime_serde")]
    interval: Option<Duration>,
}

impl ConfigFile {
    pub fn load(config_file_path: &str) -> Result<Self> {
        log::debug!("Loading config file from {config_file_path:?}");
        let config_file = std::fs::File::open(config_file_path)
            .with_context(|| format!("Cannot open config file {config_file_path:?}"))?;
        let config: Self = serde_yaml::from_reader(&config_file)
            .with_context(|| format!("Cannot read config from file: {config_file_path:?}"))?;
        Ok(config)
    }

    pub fn apply(&self, settings: &mut Settings) {
        if let Some(device) = &self.device {
            settings.device = device.clone();
        }
        if let Some(timeout) = self.timeout {
            settings.timeout = timeout;
        }
        if let Some(store_size) = self.store_size {
            settings.store_size = store_size;
        }
        if let Some(interval) = self.interval {
            settings.interval = interval;
        }
    }
}
