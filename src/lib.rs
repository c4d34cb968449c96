//! A Modbus master for TCP and RTU devices that share physical links.
//!
//! Several logical devices (slave ids) are often reached through one TCP
//! gateway or one RS485 chain. This crate keeps exactly one transport per
//! physical link and lets every device take its turn on it, in arrival
//! order, so that requests never interleave on the wire.
//!
//! The main building blocks are:
//!
//! 1.  **Register codec and validation**: [`codec`] converts register words to
//!     `u16`, `i32` and `f32` values with a configurable [`codec::WordOrder`];
//!     [`protocol`] checks slave ids and register addresses before any I/O.
//!
//! 2.  **Transports and link arbitration**: [`transport::ModbusTransport`]
//!     wraps a `tokio-modbus` TCP or RTU context; [`arbiter::LinkArbiter`]
//!     owns one transport per [`protocol::LinkKey`], serializes access to it
//!     and reconnects once after an I/O failure.
//!
//! 3.  **Device facades**: [`client::ModbusMasterClient`] offers typed reads
//!     and writes for one [`client::Device`]; [`polling::PollingSession`]
//!     polls it until cancelled; [`dispatcher::DeviceDispatcher`] owns the
//!     inventory and monitors all devices concurrently.
//!
//! ## Quick Start
//!
//! ```no_run
//! use modbus_master_lib::{
//!     arbiter::LinkArbiter,
//!     client::{Device, ModbusMasterClient},
//!     observer::LogObserver,
//!     protocol::{validate_slave_id, Connection},
//!     sensors::SensorModel,
//!     transport::{LinkOptions, ModbusTransportFactory},
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let arbiter = Arc::new(LinkArbiter::new(
//!         Arc::new(ModbusTransportFactory::new(LinkOptions::default())),
//!         Arc::new(LogObserver),
//!     ));
//!     let device = Device::new(
//!         "AnalogInput",
//!         SensorModel::Tpm10,
//!         Connection::Tcp { host: "192.168.1.100".into(), port: 502 },
//!         validate_slave_id(2)?,
//!     );
//!     let client = ModbusMasterClient::new(Arc::new(device), arbiter);
//!
//!     let value = client.read_float(0, 2).await?;
//!     println!("Measured value: {value}");
//!
//!     Ok(())
//! }
//! ```

pub mod arbiter;
pub mod client;
pub mod codec;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod observer;
pub mod polling;
pub mod protocol;
pub mod sensors;
pub mod tokio_common;
pub mod transport;

#[cfg(test)]
mod mock;
