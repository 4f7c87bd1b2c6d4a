use crate::addr::Address;
use mac_address::MacAddress;
use serde::{Deserialize, Deserializer};
use std::fs;
use std::io;
use std::path::Path;
use thiserror::Error;

pub const DEFAULT_PING_TRIES: u32 = 10;

/// Options as they arrive from the config file; everything optional so
/// the command line can fill the gaps.
#[derive(Debug, Default, Deserialize)]
pub struct Config {
    /// Interface the claimed addresses live on
    #[serde(default)]
    pub interface: Option<String>,
    /// Addresses to claim for the sleeping host
    #[serde(default)]
    pub address: Vec<Address>,
    /// TCP ports a connection to which wakes the host
    #[serde(default)]
    pub ports: Vec<u16>,
    /// MAC the wake-on-lan packet targets
    #[serde(default)]
    pub mac: Option<Mac>,
    /// How often to ping before giving up on the woken host
    #[serde(default)]
    pub ping_tries: Option<u32>,
}

#[derive(Debug, Error)]
pub enum ConfigLoadError {
    #[error("failed to read config file: {0}")]
    Read(#[from] io::Error),
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

impl Config {
    /// Load the config from a file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigLoadError> {
        let data = fs::read_to_string(path)?;
        Ok(toml::from_str(&data)?)
    }

    /// Validates the merged options into something an emulation run
    /// can use. Failing here means nothing has touched the system yet.
    pub fn finish(self) -> Result<HostConfig, ConfigError> {
        let interface = self
            .interface
            .filter(|name| !name.is_empty())
            .ok_or(ConfigError::NoInterface)?;
        if self.address.is_empty() {
            return Err(ConfigError::NoAddresses);
        }
        if self.ports.is_empty() {
            return Err(ConfigError::NoPorts);
        }
        let mac = self.mac.ok_or(ConfigError::NoMac)?;
        Ok(HostConfig {
            interface,
            addresses: self.address,
            ports: self.ports,
            mac: mac.0.bytes(),
            ping_tries: self.ping_tries.unwrap_or(DEFAULT_PING_TRIES),
        })
    }
}

/// Everything one impersonate-and-wake run needs.
#[derive(Clone, Debug)]
pub struct HostConfig {
    pub interface: String,
    pub addresses: Vec<Address>,
    pub ports: Vec<u16>,
    pub mac: [u8; 6],
    pub ping_tries: u32,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("no interface configured")]
    NoInterface,
    #[error("no address to impersonate configured")]
    NoAddresses,
    #[error("no tcp port to watch configured")]
    NoPorts,
    #[error("no wake-on-lan target mac configured")]
    NoMac,
}

// Unfortunately we need to define a wrapper type
#[derive(Clone, Copy, Debug)]
pub struct Mac(pub MacAddress);

impl<'de> Deserialize<'de> for Mac {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse()
            .map(Mac)
            .map_err(|_| serde::de::Error::custom("Failed to parse MAC address"))
    }
}

impl From<MacAddress> for Mac {
    fn from(mac: MacAddress) -> Self {
        Mac(mac)
    }
}
