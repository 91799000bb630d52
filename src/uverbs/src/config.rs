use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use uverbs_api::{DEFAULT_SOCKET_NAME, MAX_DEV_NAME_LEN};

use crate::mr;
use crate::Error;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Control {
    pub prefix: PathBuf,
    pub path: PathBuf,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

impl Control {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriverKind {
    Loopback,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DriverConfig {
    pub kind: DriverKind,
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_mr_capacity")]
    pub mr_capacity: u32,
    #[serde(default = "default_max_queue_depth")]
    pub max_queue_depth: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeviceConfig {
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub log_level: String,
    pub log_file: Option<String>,
    pub control: Control,
    pub driver: DriverConfig,
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
}

fn default_request_timeout_ms() -> u64 {
    1000
}

fn default_workers() -> usize {
    1
}

fn default_mr_capacity() -> u32 {
    mr::DEFAULT_CAPACITY
}

fn default_max_queue_depth() -> u32 {
    65536
}

impl Default for Config {
    fn default() -> Self {
        Config {
            log_level: "info".to_owned(),
            log_file: None,
            control: Control {
                prefix: PathBuf::from("/tmp/uverbs"),
                path: PathBuf::from(DEFAULT_SOCKET_NAME),
                request_timeout_ms: default_request_timeout_ms(),
            },
            driver: DriverConfig {
                kind: DriverKind::Loopback,
                workers: default_workers(),
                mr_capacity: default_mr_capacity(),
                max_queue_depth: default_max_queue_depth(),
            },
            devices: vec![DeviceConfig {
                name: "eth0".to_owned(),
            }],
        }
    }
}

impl FromStr for Config {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let config: Config = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }
}

impl Config {
    pub fn from_path<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)?;
        content.parse()
    }

    pub fn socket_path(&self) -> PathBuf {
        self.control.prefix.join(&self.control.path)
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.devices.is_empty() {
            return Err(Error::Invalid("no device configured".to_owned()));
        }
        for (i, dev) in self.devices.iter().enumerate() {
            if dev.name.is_empty() || dev.name.len() >= MAX_DEV_NAME_LEN {
                return Err(Error::Invalid(format!("bad device name {:?}", dev.name)));
            }
            if self.devices[..i].iter().any(|d| d.name == dev.name) {
                return Err(Error::Invalid(format!("duplicate device {:?}", dev.name)));
            }
        }
        if self.control.request_timeout_ms == 0 {
            return Err(Error::Invalid(
                "control.request_timeout_ms must be positive".to_owned(),
            ));
        }
        if self.driver.workers == 0 {
            return Err(Error::Invalid("driver.workers must be positive".to_owned()));
        }
        if self.driver.mr_capacity == 0 || self.driver.mr_capacity > mr::MAX_SLOTS {
            return Err(Error::Invalid(format!(
                "driver.mr_capacity must be in 1..={}",
                mr::MAX_SLOTS
            )));
        }
        if self.driver.max_queue_depth == 0 || self.driver.max_queue_depth == u32::MAX {
            return Err(Error::Invalid("bad driver.max_queue_depth".to_owned()));
        }
        Ok(())
    }
}
