//! Typed register access for one device.

use crate::{
    arbiter::LinkArbiter,
    codec::{RegisterValue, ValueKind, WordOrder},
    error::{DeviceError, Error, Operation, Result},
    observer::Observer,
    protocol::{
        validate_address, validate_count, validate_slave_id, Connection, ConnectionState,
        RegisterAddress, SlaveId,
    },
    sensors::SensorModel,
    transport::Transport,
};
use std::sync::Arc;

type DeviceResult<T> = std::result::Result<T, DeviceError>;

/// Fails fast on a link known to be down. Does no I/O.
fn ensure_usable(transport: &dyn Transport) -> Result<()> {
    match transport.state() {
        ConnectionState::Connected => Ok(()),
        _ => Err(Error::NotConnected(transport.link().clone())),
    }
}

/// A configured device. Immutable once built.
#[derive(Debug, Clone, PartialEq)]
pub struct Device {
    pub name: String,
    pub model: SensorModel,
    pub connection: Connection,
    pub slave_id: SlaveId,
    pub word_order: WordOrder,
}

impl Device {
    /// Creates a device using the model's word order.
    pub fn new(
        name: impl Into<String>,
        model: SensorModel,
        connection: Connection,
        slave_id: SlaveId,
    ) -> Self {
        Self {
            name: name.into(),
            model,
            connection,
            slave_id,
            word_order: model.word_order(),
        }
    }

    pub fn with_word_order(mut self, word_order: WordOrder) -> Self {
        self.word_order = word_order;
        self
    }
}

/// Read/write facade over one [`Device`].
///
/// Every operation validates its arguments, then runs on the device's link
/// through the [`LinkArbiter`]. A link already known to be down fails with
/// [`Error::NotConnected`] without touching the wire. Failures are returned
/// as [`DeviceError`], naming the device and operation.
#[derive(Clone)]
pub struct ModbusMasterClient {
    device: Arc<Device>,
    arbiter: Arc<LinkArbiter>,
    observer: Arc<dyn Observer>,
}

impl ModbusMasterClient {
    pub fn new(device: Arc<Device>, arbiter: Arc<LinkArbiter>) -> Self {
        let observer = arbiter.observer();
        Self {
            device,
            arbiter,
            observer,
        }
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    fn error(&self, operation: Operation, error: Error) -> DeviceError {
        DeviceError {
            device: self.device.name.clone(),
            operation,
            error,
        }
    }

    fn rejected(&self, operation: Operation, error: Error) -> DeviceError {
        self.observer.on_validation_failure(&self.device.name, &error);
        self.error(operation, error)
    }

    /// Validates the request arguments before any I/O.
    fn validate(
        &self,
        operation: Operation,
        address: u32,
        count: u16,
    ) -> DeviceResult<(SlaveId, RegisterAddress)> {
        let check = || -> Result<(SlaveId, RegisterAddress)> {
            let slave = validate_slave_id(self.device.slave_id.get() as i64)?;
            let address = validate_address(address as i64)?;
            validate_count(address, count)?;
            Ok((slave, address))
        };
        check().map_err(|err| self.rejected(operation, err))
    }

    async fn read_words(
        &self,
        operation: Operation,
        address: u32,
        count: u16,
    ) -> DeviceResult<Vec<u16>> {
        let (slave, address) = self.validate(operation, address, count)?;
        log::debug!(
            "{}: reading {count} register(s) at {address} from slave {slave}",
            self.device.name
        );
        self.arbiter
            .with_link(&self.device.connection, move |transport| {
                Box::pin(async move {
                    ensure_usable(&*transport)?;
                    transport.read_holding_registers(slave, address, count).await
                })
            })
            .await
            .map_err(|err| self.error(operation, err))
    }

    async fn write_words(
        &self,
        operation: Operation,
        address: u32,
        words: Vec<u16>,
    ) -> DeviceResult<()> {
        let (slave, address) = self.validate(operation, address, words.len() as u16)?;
        log::debug!(
            "{}: writing {} register(s) at {address} to slave {slave}",
            self.device.name,
            words.len()
        );
        self.arbiter
            .with_link(&self.device.connection, move |transport| {
                let words = words.clone();
                Box::pin(async move {
                    ensure_usable(&*transport)?;
                    transport.write_registers(slave, address, &words).await
                })
            })
            .await
            .map_err(|err| self.error(operation, err))
    }

    fn decode(
        &self,
        operation: Operation,
        address: u32,
        kind: ValueKind,
        words: &[u16],
    ) -> DeviceResult<RegisterValue> {
        let value = RegisterValue::decode(kind, words, self.device.word_order).ok_or_else(|| {
            self.error(
                operation,
                Error::invalid_data(format!("{} words cannot hold a {kind}", words.len())),
            )
        })?;
        self.observer
            .on_value(&self.device.name, address as u16, &value);
        Ok(value)
    }

    /// Reads `kind` from the registers starting at `address`.
    pub async fn read_value(
        &self,
        address: u32,
        kind: ValueKind,
    ) -> DeviceResult<RegisterValue> {
        let words = self
            .read_words(Operation::ReadValue, address, kind.word_count())
            .await?;
        self.decode(Operation::ReadValue, address, kind, &words)
    }

    /// Reads an integer: one register as an unsigned 16-bit value, two
    /// registers as a signed 32-bit value.
    pub async fn read_int(&self, address: u32, count: u16) -> DeviceResult<i32> {
        let kind = ValueKind::int_for_count(count).ok_or_else(|| {
            self.rejected(
                Operation::ReadInt,
                Error::OutOfRange {
                    what: "integer register count",
                    value: count as i64,
                    min: 1,
                    max: 2,
                },
            )
        })?;
        let words = self.read_words(Operation::ReadInt, address, count).await?;
        let value = self.decode(Operation::ReadInt, address, kind, &words)?;
        // Integer kinds always have an integer view.
        Ok(value.as_int().unwrap_or_default())
    }

    /// Reads a 32-bit float from `count` registers; `count` must be 2.
    pub async fn read_float(&self, address: u32, count: u16) -> DeviceResult<f32> {
        if count != ValueKind::F32.word_count() {
            return Err(self.rejected(
                Operation::ReadFloat,
                Error::OutOfRange {
                    what: "float register count",
                    value: count as i64,
                    min: 2,
                    max: 2,
                },
            ));
        }
        let words = self.read_words(Operation::ReadFloat, address, count).await?;
        match self.decode(Operation::ReadFloat, address, ValueKind::F32, &words)? {
            RegisterValue::F32(value) => Ok(value),
            other => Ok(other.as_f64() as f32),
        }
    }

    /// Writes `value` as a signed 32-bit integer into two registers.
    pub async fn write_int(&self, address: u32, value: i32) -> DeviceResult<()> {
        let words = RegisterValue::I32(value).encode(self.device.word_order);
        self.write_words(Operation::WriteInt, address, words).await
    }

    /// Writes a single register.
    pub async fn write_u16(&self, address: u32, value: u16) -> DeviceResult<()> {
        self.write_words(Operation::WriteU16, address, vec![value])
            .await
    }

    pub async fn write_float(&self, address: u32, value: f32) -> DeviceResult<()> {
        let words = RegisterValue::F32(value).encode(self.device.word_order);
        self.write_words(Operation::WriteFloat, address, words).await
    }

    pub async fn write_value(
        &self,
        address: u32,
        value: RegisterValue,
    ) -> DeviceResult<()> {
        let words = value.encode(self.device.word_order);
        self.write_words(Operation::WriteValue, address, words).await
    }

    /// Opens the device's link, or reopens it after a failure.
    pub async fn connect(&self) -> DeviceResult<()> {
        self.arbiter
            .connect(&self.device.connection)
            .await
            .map_err(|err| self.error(Operation::Connect, err))
    }

    /// Closes the device's link. Other devices on the same link are
    /// disconnected too.
    pub async fn disconnect(&self) -> DeviceResult<()> {
        self.arbiter
            .disconnect(&self.device.connection.link_key())
            .await
            .map_err(|err| self.error(Operation::Disconnect, err))
    }

    /// Checks the link liveness. For RTU links this costs one probe read
    /// addressed to this device.
    pub async fn is_connected(&self) -> bool {
        let slave = self.device.slave_id;
        self.arbiter
            .with_link(&self.device.connection, move |transport| {
                Box::pin(async move { Ok(transport.is_connected(slave).await) })
            })
            .await
            .unwrap_or(false)
    }

    /// Link state without any I/O.
    pub async fn state(&self) -> ConnectionState {
        self.arbiter
            .state(&self.device.connection.link_key())
            .await
            .unwrap_or_default()
    }
}
