//! Register maps of the supported sensor models.
//!
//! A model is described by a static table: the register holding the
//! configured sensor type of a channel plus the value registers read for a
//! present channel. Multi-channel models repeat the table every
//! `channel_stride` registers.

use crate::{
    client::ModbusMasterClient,
    codec::{RegisterValue, ValueKind, WordOrder},
    error::{DeviceError, Error},
    polling::PollTarget,
};
use std::{fmt, ops::RangeInclusive};

/// Sensor type codes reported by a connected input.
pub const SENSOR_TYPE_RANGE: RangeInclusive<i32> = 0..=40;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Deserialize)]
pub enum SensorModel {
    /// Eight channel analog input module.
    #[serde(rename = "mb210-101")]
    Mb210,
    /// Single channel process controller.
    #[serde(rename = "tpm10")]
    Tpm10,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelRegister {
    pub name: &'static str,
    /// Address on the first channel.
    pub address: u16,
    pub kind: ValueKind,
}

#[derive(Debug)]
pub struct RegisterMap {
    pub channels: u8,
    pub channel_stride: u16,
    pub sensor_type: ChannelRegister,
    pub values: &'static [ChannelRegister],
}

const MB210_101: RegisterMap = RegisterMap {
    channels: 8,
    channel_stride: 3,
    sensor_type: ChannelRegister {
        name: "sensor type",
        address: 4100,
        kind: ValueKind::I32,
    },
    values: &[
        ChannelRegister {
            name: "value",
            address: 4000,
            kind: ValueKind::F32,
        },
        ChannelRegister {
            name: "cycle time",
            address: 4002,
            kind: ValueKind::U16,
        },
        ChannelRegister {
            name: "integer value",
            address: 4064,
            kind: ValueKind::U16,
        },
    ],
};

const TPM10: RegisterMap = RegisterMap {
    channels: 1,
    channel_stride: 0,
    sensor_type: ChannelRegister {
        name: "sensor type",
        address: 4,
        kind: ValueKind::U16,
    },
    values: &[
        ChannelRegister {
            name: "measured value",
            address: 0,
            kind: ValueKind::F32,
        },
        ChannelRegister {
            name: "input value",
            address: 2,
            kind: ValueKind::F32,
        },
    ],
};

impl SensorModel {
    pub fn register_map(self) -> &'static RegisterMap {
        match self {
            SensorModel::Mb210 => &MB210_101,
            SensorModel::Tpm10 => &TPM10,
        }
    }

    /// Float word order the model uses unless a device overrides it.
    pub fn word_order(self) -> WordOrder {
        match self {
            SensorModel::Mb210 | SensorModel::Tpm10 => WordOrder::LowWordFirst,
        }
    }

    /// First value of the first channel, used for continuous monitoring.
    pub fn primary_target(self) -> PollTarget {
        let map = self.register_map();
        let register = map.values[0];
        PollTarget {
            address: register.address as u32,
            kind: register.kind,
        }
    }
}

impl fmt::Display for SensorModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SensorModel::Mb210 => "mb210-101",
            SensorModel::Tpm10 => "tpm10",
        })
    }
}

impl RegisterMap {
    /// Address of `register` on the 1-based `channel`.
    pub fn address(&self, register: &ChannelRegister, channel: u8) -> u32 {
        register.address as u32 + self.channel_stride as u32 * (channel.max(1) as u32 - 1)
    }
}

/// Decoded values of one channel.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelReading {
    pub channel: u8,
    /// `None` when the sensor type register could not be read.
    pub sensor_type: Option<i32>,
    pub values: Vec<(&'static str, RegisterValue)>,
}

impl ChannelReading {
    pub fn is_present(&self) -> bool {
        self.sensor_type
            .is_some_and(|code| SENSOR_TYPE_RANGE.contains(&code))
    }
}

/// Reads every channel of the device behind `client`.
///
/// Channels whose sensor type is outside [`SENSOR_TYPE_RANGE`], or whose
/// sensor type register answers with a Modbus exception, are reported as
/// absent without reading their values. Any other failure aborts the scan.
pub async fn read_sensor(client: &ModbusMasterClient) -> Result<Vec<ChannelReading>, DeviceError> {
    let map = client.device().model.register_map();
    let mut readings = Vec::with_capacity(map.channels as usize);
    for channel in 1..=map.channels {
        let address = map.address(&map.sensor_type, channel);
        let sensor_type = match client.read_value(address, map.sensor_type.kind).await {
            Ok(value) => value.as_int(),
            Err(DeviceError {
                error: Error::Protocol(code),
                ..
            }) => {
                log::debug!(
                    "{}: channel {channel} sensor type unavailable: {code}",
                    client.device().name
                );
                None
            }
            Err(err) => return Err(err),
        };

        let mut reading = ChannelReading {
            channel,
            sensor_type,
            values: Vec::new(),
        };
        if reading.is_present() {
            for register in map.values {
                let value = client
                    .read_value(map.address(register, channel), register.kind)
                    .await?;
                reading.values.push((register.name, value));
            }
        } else {
            log::debug!("{}: channel {channel} absent", client.device().name);
        }
        readings.push(reading);
    }
    Ok(readings)
}
