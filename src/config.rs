//! Device inventory loaded from YAML.
//!
//! ```yaml
//! poll_interval: 100ms
//! timeout: 1s
//! devices:
//!   - name: AnalogInput_RTU_Slave2
//!     model: tpm10
//!     slave_id: 2
//!     connection: { type: rtu, port: COM4, baud_rate: 115200, parity: E }
//! ```

use crate::{
    client::Device,
    codec::WordOrder,
    error::Error,
    polling::DEFAULT_POLL_INTERVAL,
    protocol::{
        validate_slave_id, Connection, DataBits, Parity, SerialConfig, StopBits, DEFAULT_TCP_PORT,
    },
    sensors::SensorModel,
    transport::LinkOptions,
};
use serde::Deserialize;
use std::{
    collections::{HashMap, HashSet},
    fs::File,
    io,
    path::Path,
    time::Duration,
};

pub const DEFAULT_CONFIG_FILE: &str = "devices.yml";

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("cannot open {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("invalid configuration: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("device {device}: {error}")]
    Device {
        device: String,
        #[source]
        error: Error,
    },

    #[error("device name {0} is used more than once")]
    DuplicateName(String),

    #[error("port {port} is configured with {first} and {second}")]
    ConflictingSerial {
        port: String,
        first: SerialConfig,
        second: SerialConfig,
    },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default = "default_poll_interval", with = "humantime_serde")]
    pub poll_interval: Duration,
    /// Per-request I/O timeout.
    #[serde(default = "default_timeout", with = "humantime_serde")]
    pub timeout: Duration,
    /// Minimum silence between frames on one serial port.
    #[serde(default = "default_rtu_delay", with = "humantime_serde")]
    pub rtu_delay: Duration,
    /// Register read by the RTU liveness probe.
    #[serde(default = "default_probe_address")]
    pub probe_address: u16,
    pub devices: Vec<DeviceConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeviceConfig {
    pub name: String,
    pub model: SensorModel,
    pub slave_id: i64,
    #[serde(default)]
    pub word_order: Option<WordOrder>,
    pub connection: ConnectionConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ConnectionConfig {
    Tcp {
        host: String,
        #[serde(default = "default_tcp_port")]
        port: u16,
    },
    Rtu {
        port: String,
        #[serde(default = "default_baud_rate")]
        baud_rate: u32,
        #[serde(default = "default_data_bits")]
        data_bits: u8,
        #[serde(default)]
        parity: Parity,
        #[serde(default = "default_stop_bits")]
        stop_bits: u8,
    },
}

fn default_poll_interval() -> Duration {
    DEFAULT_POLL_INTERVAL
}

fn default_timeout() -> Duration {
    LinkOptions::default().timeout
}

fn default_rtu_delay() -> Duration {
    LinkOptions::default().rtu_delay
}

fn default_probe_address() -> u16 {
    LinkOptions::default().probe_address.get()
}

fn default_tcp_port() -> u16 {
    DEFAULT_TCP_PORT
}

fn default_baud_rate() -> u32 {
    SerialConfig::default().baud_rate
}

fn default_data_bits() -> u8 {
    SerialConfig::default().data_bits.into()
}

fn default_stop_bits() -> u8 {
    SerialConfig::default().stop_bits.into()
}

impl ConnectionConfig {
    fn to_connection(&self) -> Result<Connection, Error> {
        Ok(match self {
            ConnectionConfig::Tcp { host, port } => Connection::Tcp {
                host: host.clone(),
                port: *port,
            },
            ConnectionConfig::Rtu {
                port,
                baud_rate,
                data_bits,
                parity,
                stop_bits,
            } => Connection::Rtu {
                port_name: port.clone(),
                serial: SerialConfig {
                    baud_rate: *baud_rate,
                    data_bits: DataBits::try_from(*data_bits)?,
                    parity: *parity,
                    stop_bits: StopBits::try_from(*stop_bits)?,
                },
            },
        })
    }
}

impl DeviceConfig {
    pub fn to_device(&self) -> Result<Device, ConfigError> {
        let invalid = |error| ConfigError::Device {
            device: self.name.clone(),
            error,
        };
        let slave_id = validate_slave_id(self.slave_id).map_err(invalid)?;
        let connection = self.connection.to_connection().map_err(invalid)?;
        let device = Device::new(self.name.clone(), self.model, connection, slave_id);
        Ok(match self.word_order {
            Some(word_order) => device.with_word_order(word_order),
            None => device,
        })
    }
}

impl Config {
    /// Reads the inventory from `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|source| ConfigError::Open {
            path: path.display().to_string(),
            source,
        })?;
        Ok(serde_yaml::from_reader(file)?)
    }

    pub fn parse(yaml: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    pub fn link_options(&self) -> LinkOptions {
        LinkOptions {
            timeout: self.timeout,
            rtu_delay: self.rtu_delay,
            probe_address: self.probe_address.into(),
        }
    }

    /// Validates the inventory and builds the device list in file order.
    pub fn devices(&self) -> Result<Vec<Device>, ConfigError> {
        let mut names = HashSet::new();
        let mut ports: HashMap<&str, SerialConfig> = HashMap::new();
        let mut devices = Vec::with_capacity(self.devices.len());
        for entry in &self.devices {
            if !names.insert(entry.name.as_str()) {
                return Err(ConfigError::DuplicateName(entry.name.clone()));
            }
            let device = entry.to_device()?;
            if let (ConnectionConfig::Rtu { port, .. }, Connection::Rtu { serial, .. }) =
                (&entry.connection, &device.connection)
            {
                match ports.get(port.as_str()) {
                    Some(first) if first != serial => {
                        return Err(ConfigError::ConflictingSerial {
                            port: port.clone(),
                            first: *first,
                            second: *serial,
                        });
                    }
                    Some(_) => {}
                    None => {
                        ports.insert(port.as_str(), *serial);
                    }
                }
            }
            devices.push(device);
        }
        Ok(devices)
    }
}
