//! Addressing, link identity and line-parameter types.
//!
//! Every register access goes through [`validate_slave_id`] and
//! [`validate_address`] so that out-of-range values are rejected before any
//! byte reaches the wire.

use crate::error::Error;
use std::fmt;

pub const SLAVE_ID_MIN: i64 = 0;
pub const SLAVE_ID_MAX: i64 = 247;

pub const ADDRESS_MIN: i64 = 0;
pub const ADDRESS_MAX: i64 = 65535;

/// Default Modbus TCP port.
pub const DEFAULT_TCP_PORT: u16 = 502;

/// Address of a logical device on a shared medium (`0..=247`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlaveId(u8);

impl SlaveId {
    pub const fn get(self) -> u8 {
        self.0
    }
}

impl std::ops::Deref for SlaveId {
    type Target = u8;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl TryFrom<i64> for SlaveId {
    type Error = Error;
    fn try_from(value: i64) -> Result<Self, Self::Error> {
        validate_slave_id(value)
    }
}

impl fmt::Display for SlaveId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Holding register address (`0..=65535`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RegisterAddress(u16);

impl RegisterAddress {
    pub const fn get(self) -> u16 {
        self.0
    }
}

impl std::ops::Deref for RegisterAddress {
    type Target = u16;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

/// Every 16-bit value is a valid address.
impl From<u16> for RegisterAddress {
    fn from(value: u16) -> Self {
        Self(value)
    }
}

impl TryFrom<i64> for RegisterAddress {
    type Error = Error;
    fn try_from(value: i64) -> Result<Self, Self::Error> {
        validate_address(value)
    }
}

impl fmt::Display for RegisterAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

fn check_range(what: &'static str, value: i64, min: i64, max: i64) -> Result<i64, Error> {
    if (min..=max).contains(&value) {
        Ok(value)
    } else {
        Err(Error::OutOfRange {
            what,
            value,
            min,
            max,
        })
    }
}

/// Checks that `value` is a valid slave id.
pub fn validate_slave_id(value: i64) -> Result<SlaveId, Error> {
    check_range("slave id", value, SLAVE_ID_MIN, SLAVE_ID_MAX).map(|v| SlaveId(v as u8))
}

/// Checks that `value` is a valid holding register address.
pub fn validate_address(value: i64) -> Result<RegisterAddress, Error> {
    check_range("register address", value, ADDRESS_MIN, ADDRESS_MAX)
        .map(|v| RegisterAddress(v as u16))
}

/// Checks a register count against the span left above `address`.
pub(crate) fn validate_count(address: RegisterAddress, count: u16) -> Result<u16, Error> {
    let max = (ADDRESS_MAX - *address as i64 + 1).min(125);
    check_range("register count", count as i64, 1, max).map(|v| v as u16)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataBits {
    Five,
    Six,
    Seven,
    Eight,
}

impl TryFrom<u8> for DataBits {
    type Error = Error;
    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            5 => Ok(DataBits::Five),
            6 => Ok(DataBits::Six),
            7 => Ok(DataBits::Seven),
            8 => Ok(DataBits::Eight),
            _ => Err(Error::OutOfRange {
                what: "data bits",
                value: value as i64,
                min: 5,
                max: 8,
            }),
        }
    }
}

impl From<DataBits> for u8 {
    fn from(value: DataBits) -> Self {
        match value {
            DataBits::Five => 5,
            DataBits::Six => 6,
            DataBits::Seven => 7,
            DataBits::Eight => 8,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Deserialize)]
pub enum Parity {
    #[default]
    #[serde(rename = "N", alias = "none")]
    None,
    #[serde(rename = "E", alias = "even")]
    Even,
    #[serde(rename = "O", alias = "odd")]
    Odd,
}

impl fmt::Display for Parity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Parity::None => "N",
            Parity::Even => "E",
            Parity::Odd => "O",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopBits {
    One,
    Two,
}

impl TryFrom<u8> for StopBits {
    type Error = Error;
    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(StopBits::One),
            2 => Ok(StopBits::Two),
            _ => Err(Error::OutOfRange {
                what: "stop bits",
                value: value as i64,
                min: 1,
                max: 2,
            }),
        }
    }
}

impl From<StopBits> for u8 {
    fn from(value: StopBits) -> Self {
        match value {
            StopBits::One => 1,
            StopBits::Two => 2,
        }
    }
}

/// Serial line parameters of an RTU link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SerialConfig {
    pub baud_rate: u32,
    pub data_bits: DataBits,
    pub parity: Parity,
    pub stop_bits: StopBits,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            baud_rate: 9600,
            data_bits: DataBits::Eight,
            parity: Parity::None,
            stop_bits: StopBits::One,
        }
    }
}

impl fmt::Display for SerialConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}{}{}",
            self.baud_rate,
            u8::from(self.data_bits),
            self.parity,
            u8::from(self.stop_bits)
        )
    }
}

/// Identity of a physical medium.
///
/// Devices with equal keys share one transport and never have overlapping
/// requests on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum LinkKey {
    Tcp { host: String, port: u16 },
    Rtu { port_name: String },
}

impl fmt::Display for LinkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkKey::Tcp { host, port } => write!(f, "tcp://{host}:{port}"),
            LinkKey::Rtu { port_name } => write!(f, "rtu://{port_name}"),
        }
    }
}

/// How a device is reached: the link plus its transport parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Connection {
    Tcp { host: String, port: u16 },
    Rtu { port_name: String, serial: SerialConfig },
}

impl Connection {
    pub fn link_key(&self) -> LinkKey {
        match self {
            Connection::Tcp { host, port } => LinkKey::Tcp {
                host: host.clone(),
                port: *port,
            },
            Connection::Rtu { port_name, .. } => LinkKey::Rtu {
                port_name: port_name.clone(),
            },
        }
    }
}

impl fmt::Display for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Connection::Tcp { .. } => write!(f, "{}", self.link_key()),
            Connection::Rtu { serial, .. } => write!(f, "{} ({serial})", self.link_key()),
        }
    }
}

/// Lifecycle of a transport. There is no implicit transition back to
/// `Connected`: callers have to connect again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connected,
    Failed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connected => "connected",
            ConnectionState::Failed => "failed",
        })
    }
}
