// SPDX-License-Identifier: BSD-3-Clause-LBNL
//! Structs used to configure the defragmentation engine and the `netdefrag` command line
//! application.
//!
//! Typically instantiated using `serde_yaml`.
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

use crate::defrag::{CollectorOptions, DefragOptions, FragmentType};
use crate::errors::{Error, Result};

const DEFAULT_CONFIG_STR: &str = include_str!("../etc/example-config.yml");

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub log: LogConfig,
    #[serde(default)]
    pub defrag: DefragConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    pub level: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefragConfig {
    #[serde(default = "default_pick_types")]
    pub pick_types: Vec<String>,

    #[serde(default = "default_collectors")]
    pub collectors: usize,

    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,

    #[serde(default = "default_output_queue_max_len")]
    pub output_queue_max_len: usize,

    #[serde(default = "default_group_expiry")]
    pub group_expiry: String,

    #[serde(default = "default_sweep_interval")]
    pub sweep_interval: String,

    #[serde(default = "default_layer_reset_threshold")]
    pub layer_reset_threshold: u32,

    #[serde(default = "default_layer_reset_interval")]
    pub layer_reset_interval: String,

    #[serde(default = "default_queue_check_interval")]
    pub queue_check_interval: String,

    #[serde(default = "default_queue_trim_grace")]
    pub queue_trim_grace: String,

    #[serde(default = "default_pool_capacity")]
    pub pool_capacity: usize,
}

fn default_pick_types() -> Vec<String> {
    FragmentType::ALL.iter().map(|t| t.to_string()).collect()
}

fn default_collectors() -> usize {
    4
}

fn default_channel_capacity() -> usize {
    1024
}

fn default_output_queue_max_len() -> usize {
    4096
}

fn default_group_expiry() -> String {
    "10s".to_string()
}

fn default_sweep_interval() -> String {
    "1s".to_string()
}

fn default_layer_reset_threshold() -> u32 {
    100
}

fn default_layer_reset_interval() -> String {
    "30s".to_string()
}

fn default_queue_check_interval() -> String {
    "5s".to_string()
}

fn default_queue_trim_grace() -> String {
    "10s".to_string()
}

fn default_pool_capacity() -> usize {
    4096
}

impl Default for DefragConfig {
    fn default() -> Self {
        Self {
            pick_types: default_pick_types(),
            collectors: default_collectors(),
            channel_capacity: default_channel_capacity(),
            output_queue_max_len: default_output_queue_max_len(),
            group_expiry: default_group_expiry(),
            sweep_interval: default_sweep_interval(),
            layer_reset_threshold: default_layer_reset_threshold(),
            layer_reset_interval: default_layer_reset_interval(),
            queue_check_interval: default_queue_check_interval(),
            queue_trim_grace: default_queue_trim_grace(),
            pool_capacity: default_pool_capacity(),
        }
    }
}

impl DefragConfig {
    fn durations(&self) -> [(&'static str, &str); 5] {
        [
            ("group_expiry", &self.group_expiry),
            ("sweep_interval", &self.sweep_interval),
            ("layer_reset_interval", &self.layer_reset_interval),
            ("queue_check_interval", &self.queue_check_interval),
            ("queue_trim_grace", &self.queue_trim_grace),
        ]
    }

    /// Picked types that name a known fragment type. Unknown names are logged and skipped.
    pub fn fragment_types(&self) -> Vec<FragmentType> {
        let mut picked = Vec::with_capacity(self.pick_types.len());
        for name in &self.pick_types {
            match name.parse::<FragmentType>() {
                Ok(t) if !picked.contains(&t) => picked.push(t),
                Ok(_) => {}
                Err(e) => warn!("skipping pick type: {e}"),
            }
        }
        picked
    }

    pub fn collector_options(&self) -> std::result::Result<CollectorOptions, ConfigError> {
        let duration = |name: &str, value: &str| {
            parse_duration(value)
                .map_err(|e| ConfigError::Invalid(format!("Invalid {name}: {e}")))
        };
        Ok(CollectorOptions {
            collectors: self.collectors,
            channel_capacity: self.channel_capacity,
            output_queue_max_len: self.output_queue_max_len,
            group_expiry: duration("group_expiry", &self.group_expiry)?,
            sweep_interval: duration("sweep_interval", &self.sweep_interval)?,
            layer_reset_threshold: self.layer_reset_threshold,
            layer_reset_interval: duration("layer_reset_interval", &self.layer_reset_interval)?,
            queue_check_interval: duration("queue_check_interval", &self.queue_check_interval)?,
            queue_trim_grace: duration("queue_trim_grace", &self.queue_trim_grace)?,
            pool_capacity: self.pool_capacity,
        })
    }
}

impl Config {
    pub fn from_yaml_str(s: &str) -> std::result::Result<Self, ConfigError> {
        let config: Config = serde_yaml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file<P: AsRef<std::path::Path>>(path: P) -> std::result::Result<Self, ConfigError> {
        match std::fs::read_to_string(path) {
            Ok(contents) => Self::from_yaml_str(&contents),
            Err(e) => {
                warn!("could not open config ({e}), using default config");
                Self::from_yaml_str(DEFAULT_CONFIG_STR)
            }
        }
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    fn validate(&self) -> std::result::Result<(), ConfigError> {
        for (name, value) in self.defrag.durations() {
            if let Err(e) = parse_duration(value) {
                return Err(ConfigError::Invalid(format!("Invalid {name}: {e}")));
            }
        }

        if self.defrag.pick_types.is_empty() {
            return Err(ConfigError::Invalid("pick_types is empty".into()));
        }

        Ok(())
    }

    /// Engine options for this configuration. Fails when no picked type is usable or an
    /// option is out of range.
    pub fn to_options(&self) -> Result<DefragOptions> {
        let pick_types = self.defrag.fragment_types();
        if pick_types.is_empty() {
            return Err(Error::NoValidFragmentType);
        }
        let collector = self.defrag.collector_options()?;
        collector.validate()?;
        Ok(DefragOptions {
            pick_types,
            collector,
        })
    }
}

pub fn parse_duration(duration_str: &str) -> std::result::Result<Duration, ConfigError> {
    let mut s = duration_str.trim().to_string();
    if s.ends_with("ms") {
        s.truncate(s.len() - 2);
        Ok(Duration::from_millis(s.parse::<u64>().map_err(|e| {
            ConfigError::Invalid(format!("Invalid milliseconds value: {e}"))
        })?))
    } else if s.ends_with('s') {
        s.truncate(s.len() - 1);
        Ok(Duration::from_secs(s.parse::<u64>().map_err(|e| {
            ConfigError::Invalid(format!("Invalid seconds value: {e}"))
        })?))
    } else if s.ends_with('h') {
        s.truncate(s.len() - 1);
        Ok(Duration::from_secs(
            s.parse::<u64>()
                .map_err(|e| ConfigError::Invalid(format!("Invalid hours value: {e}")))?
                * 3600,
        ))
    } else if s.ends_with('d') {
        s.truncate(s.len() - 1);
        Ok(Duration::from_secs(
            s.parse::<u64>()
                .map_err(|e| ConfigError::Invalid(format!("Invalid days value: {e}")))?
                * 86400,
        ))
    } else {
        Err(ConfigError::Invalid(format!(
            "invalid suffix in duration: {duration_str}"
        )))
    }
}
