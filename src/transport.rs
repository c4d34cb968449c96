//! Physical link transports.
//!
//! A [`Transport`] owns one socket or serial port and speaks Modbus function
//! codes 0x03 (read holding registers) and 0x10 (write multiple registers)
//! over it through `tokio-modbus`. The slave id is chosen per request, so one
//! transport serves every logical device behind a gateway or on an RS485
//! chain.
//!
//! Liveness differs per variant:
//!
//! * **TCP**: [`Transport::is_connected`] reports the link state without any
//!   I/O. `tokio-modbus` exposes no socket health query, so a peer that hung
//!   up is only noticed by the next request, which then marks the link
//!   `Failed`.
//! * **RTU**: a serial port has no passive liveness signal, so
//!   [`Transport::is_connected`] issues a one register probe read against
//!   the asking slave. Every check costs a round trip on the bus.
//!
//! Requests never probe first; callers that only need to know whether the
//! link is usable check [`Transport::state`].

use crate::{
    error::{Error, Result},
    protocol::{
        Connection, ConnectionState, LinkKey, RegisterAddress, SerialConfig,
        SlaveId,
    },
    tokio_common,
};
use async_trait::async_trait;
use std::{io, time::Duration};
use tokio::time::Instant;
use tokio_modbus::{
    client::{Client, Context, Reader, Writer},
    slave::SlaveContext,
    Slave,
};

/// Connection lifecycle and register access on one physical link.
#[async_trait]
pub trait Transport: Send {
    fn link(&self) -> &LinkKey;

    fn state(&self) -> ConnectionState;

    /// Opens the link. Fails with [`Error::Connect`].
    async fn connect(&mut self) -> Result<()>;

    async fn disconnect(&mut self) -> Result<()>;

    /// Checks liveness on behalf of `slave`.
    async fn is_connected(&mut self, slave: SlaveId) -> bool;

    /// Returns exactly `count` words in device response order.
    async fn read_holding_registers(
        &mut self,
        slave: SlaveId,
        address: RegisterAddress,
        count: u16,
    ) -> Result<Vec<u16>>;

    async fn write_registers(
        &mut self,
        slave: SlaveId,
        address: RegisterAddress,
        values: &[u16],
    ) -> Result<()>;
}

/// Settings applied to every link created by a [`ModbusTransportFactory`].
#[derive(Debug, Clone)]
pub struct LinkOptions {
    /// I/O timeout of a single request, including connect.
    pub timeout: Duration,
    /// Minimum silence between two frames on an RTU port.
    pub rtu_delay: Duration,
    /// Register read by the RTU liveness probe.
    pub probe_address: RegisterAddress,
}

impl Default for LinkOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(1),
            rtu_delay: Duration::from_millis(50),
            probe_address: RegisterAddress::from(1),
        }
    }
}

/// Creates the transport of a link the first time a device uses it.
pub trait TransportFactory: Send + Sync {
    fn create(&self, connection: &Connection) -> Box<dyn Transport>;
}

/// Builds [`ModbusTransport`]s.
#[derive(Debug, Clone, Default)]
pub struct ModbusTransportFactory {
    options: LinkOptions,
}

impl ModbusTransportFactory {
    pub fn new(options: LinkOptions) -> Self {
        Self { options }
    }
}

impl TransportFactory for ModbusTransportFactory {
    fn create(&self, connection: &Connection) -> Box<dyn Transport> {
        Box::new(ModbusTransport::new(connection, self.options.clone()))
    }
}

enum Variant {
    Tcp {
        host: String,
        port: u16,
    },
    Rtu {
        port_name: String,
        serial: SerialConfig,
        probe_address: RegisterAddress,
        delay: Duration,
        last_frame: Option<Instant>,
    },
}

/// `tokio-modbus` backed transport for TCP and RTU links.
pub struct ModbusTransport {
    link: LinkKey,
    variant: Variant,
    timeout: Duration,
    ctx: Option<Context>,
    state: ConnectionState,
}

/// Helper function to map tokio result to our result.
fn map_tokio_result<T>(result: tokio_modbus::Result<T>) -> Result<T> {
    match result {
        Ok(Ok(result)) => Ok(result),
        Ok(Err(err)) => Err(err.into()), // Modbus exception
        Err(err) => Err(err.into()),     // IO error
    }
}

fn timed_out(link: &LinkKey, timeout: Duration) -> io::Error {
    io::Error::new(
        io::ErrorKind::TimedOut,
        format!("no response from {link} within {timeout:?}"),
    )
}

impl ModbusTransport {
    pub fn new(connection: &Connection, options: LinkOptions) -> Self {
        let variant = match connection {
            Connection::Tcp { host, port } => Variant::Tcp {
                host: host.clone(),
                port: *port,
            },
            Connection::Rtu { port_name, serial } => Variant::Rtu {
                port_name: port_name.clone(),
                serial: *serial,
                probe_address: options.probe_address,
                delay: tokio_common::check_rtu_delay(options.rtu_delay, serial.baud_rate),
                last_frame: None,
            },
        };
        Self {
            link: connection.link_key(),
            variant,
            timeout: options.timeout,
            ctx: None,
            state: ConnectionState::Disconnected,
        }
    }

    async fn open_tcp(host: &str, port: u16) -> io::Result<Context> {
        let socket_addr = tokio::net::lookup_host((host, port))
            .await?
            .next()
            .ok_or_else(|| {
                io::Error::new(io::ErrorKind::NotFound, format!("cannot resolve {host}"))
            })?;
        tokio_modbus::client::tcp::connect(socket_addr).await
    }

    fn open_rtu(port_name: &str, serial: &SerialConfig) -> io::Result<Context> {
        let builder = tokio_common::serial_port_builder(port_name, serial);
        let port = tokio_serial::SerialStream::open(&builder)?;
        Ok(tokio_modbus::client::rtu::attach(port))
    }

    /// Earliest instant the next RTU frame may be sent.
    fn bus_free_at(&self) -> Option<Instant> {
        match &self.variant {
            Variant::Rtu {
                delay,
                last_frame: Some(at),
                ..
            } => Some(*at + *delay),
            _ => None,
        }
    }

    async fn wait_for_bus(&mut self) {
        if let Some(deadline) = self.bus_free_at() {
            tokio::time::sleep_until(deadline).await;
        }
    }

    fn context(&mut self, slave: SlaveId) -> Result<&mut Context> {
        let ctx = match (self.state, self.ctx.as_mut()) {
            (ConnectionState::Connected, Some(ctx)) => ctx,
            _ => return Err(Error::NotConnected(self.link.clone())),
        };
        ctx.set_slave(Slave(*slave));
        Ok(ctx)
    }

    /// Records the end of a request and drops the link on transport failure.
    fn finish<T>(
        &mut self,
        result: std::result::Result<tokio_modbus::Result<T>, tokio::time::error::Elapsed>,
    ) -> Result<T> {
        if let Variant::Rtu { last_frame, .. } = &mut self.variant {
            *last_frame = Some(Instant::now());
        }
        let result = match result {
            Ok(result) => map_tokio_result(result),
            Err(_) => Err(Error::Io(timed_out(&self.link, self.timeout))),
        };
        if let Err(Error::Io(err)) = &result {
            log::warn!("I/O failure on {}: {err}", self.link);
            // The stream may hold a partial or late response.
            self.ctx = None;
            self.state = ConnectionState::Failed;
        }
        result
    }

    async fn read(
        &mut self,
        slave: SlaveId,
        address: RegisterAddress,
        count: u16,
    ) -> Result<Vec<u16>> {
        self.wait_for_bus().await;
        let timeout = self.timeout;
        let ctx = self.context(slave)?;
        log::debug!("read_holding_registers slave={slave} address={address} count={count}");
        let result =
            tokio::time::timeout(timeout, ctx.read_holding_registers(*address, count)).await;
        let words = self.finish(result)?;
        if words.len() != count as usize {
            return Err(Error::invalid_data(format!(
                "expected {count} registers from slave {slave}, got {}",
                words.len()
            )));
        }
        Ok(words)
    }
}

#[async_trait]
impl Transport for ModbusTransport {
    fn link(&self) -> &LinkKey {
        &self.link
    }

    fn state(&self) -> ConnectionState {
        self.state
    }

    async fn connect(&mut self) -> Result<()> {
        if let Some(mut ctx) = self.ctx.take() {
            if let Err(err) = ctx.disconnect().await {
                log::debug!("Closing stale connection to {} failed: {err}", self.link);
            }
        }
        let timeout = self.timeout;
        let opened = match &self.variant {
            Variant::Tcp { host, port } => {
                log::info!("Connecting via TCP to {host}:{port}...");
                match tokio::time::timeout(timeout, Self::open_tcp(host, *port)).await {
                    Ok(result) => result,
                    Err(_) => Err(timed_out(&self.link, timeout)),
                }
            }
            Variant::Rtu {
                port_name, serial, ..
            } => {
                log::info!("Opening serial port {port_name} ({serial})...");
                Self::open_rtu(port_name, serial)
            }
        };
        match opened {
            Ok(ctx) => {
                self.ctx = Some(ctx);
                self.state = ConnectionState::Connected;
                Ok(())
            }
            Err(source) => {
                if self.state == ConnectionState::Connected {
                    self.state = ConnectionState::Disconnected;
                }
                Err(Error::Connect {
                    link: self.link.clone(),
                    source,
                })
            }
        }
    }

    async fn disconnect(&mut self) -> Result<()> {
        self.state = ConnectionState::Disconnected;
        if let Some(mut ctx) = self.ctx.take() {
            ctx.disconnect().await?;
        }
        Ok(())
    }

    async fn is_connected(&mut self, slave: SlaveId) -> bool {
        if self.state != ConnectionState::Connected || self.ctx.is_none() {
            return false;
        }
        let probe_address = match &self.variant {
            Variant::Tcp { .. } => return true,
            Variant::Rtu { probe_address, .. } => *probe_address,
        };
        match self.read(slave, probe_address, 1).await {
            // An exception is still an answer from the bus.
            Ok(_) | Err(Error::Protocol(_)) => true,
            Err(err) => {
                log::debug!("Liveness probe on {} failed: {err}", self.link);
                false
            }
        }
    }

    async fn read_holding_registers(
        &mut self,
        slave: SlaveId,
        address: RegisterAddress,
        count: u16,
    ) -> Result<Vec<u16>> {
        self.read(slave, address, count).await
    }

    async fn write_registers(
        &mut self,
        slave: SlaveId,
        address: RegisterAddress,
        values: &[u16],
    ) -> Result<()> {
        self.wait_for_bus().await;
        let timeout = self.timeout;
        let ctx = self.context(slave)?;
        log::debug!(
            "write_multiple_registers slave={slave} address={address} values={values:04X?}"
        );
        let result =
            tokio::time::timeout(timeout, ctx.write_multiple_registers(*address, values)).await;
        self.finish(result)
    }
}
