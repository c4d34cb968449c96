//! Scripted in-memory transport for tests.
//!
//! Every request marks the link busy for its whole duration and panics if
//! another request enters at the same time, so tests can prove that access
//! to one link is serialized.

use crate::{
    arbiter::LinkArbiter,
    client::{Device, ModbusMasterClient},
    error::{Error, Result},
    observer::NoopObserver,
    protocol::{Connection, ConnectionState, LinkKey, RegisterAddress, SlaveId},
    transport::{Transport, TransportFactory},
};
use async_trait::async_trait;
use std::{
    collections::{HashMap, HashSet},
    io,
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio_modbus::ExceptionCode;

#[derive(Debug, Clone, Copy)]
pub(crate) enum Fault {
    Io,
    Exception(ExceptionCode),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Call {
    Read {
        slave: u8,
        address: u16,
        count: u16,
    },
    Write {
        slave: u8,
        address: u16,
        count: u16,
    },
}

#[derive(Default)]
pub(crate) struct MockState {
    /// Register image keyed by `(slave, address)`; missing cells read as 0.
    pub registers: HashMap<(u8, u16), u16>,
    pub calls: Vec<Call>,
    pub reads: usize,
    pub connects: usize,
    pub disconnects: usize,
    pub in_flight: usize,
    /// Faults injected into the n-th read (1-based).
    pub faults: HashMap<usize, Fault>,
    /// Every read from the n-th one on fails with an I/O error.
    pub fail_from: Option<usize>,
    /// Exceptions returned for reads of `(slave, address)`.
    pub exceptions: HashMap<(u8, u16), ExceptionCode>,
    pub refuse_connect: bool,
    /// Slaves that never answer; requests to them time out.
    pub absent: HashSet<u8>,
    /// Liveness checks as `(slave, answered)`.
    pub probes: Vec<(u8, bool)>,
    pub latency: Duration,
}

#[derive(Clone, Default)]
pub(crate) struct MockHandle(Arc<Mutex<MockState>>);

impl MockHandle {
    pub fn with<R>(&self, f: impl FnOnce(&mut MockState) -> R) -> R {
        f(&mut self.0.lock().unwrap())
    }

    pub fn set_registers(&self, slave: u8, address: u16, words: &[u16]) {
        self.with(|state| {
            for (offset, word) in words.iter().enumerate() {
                state
                    .registers
                    .insert((slave, address + offset as u16), *word);
            }
        });
    }

    pub fn calls(&self) -> Vec<Call> {
        self.with(|state| state.calls.clone())
    }

    fn enter(&self, call: Call) -> (InFlight, Duration) {
        let latency = self.with(|state| {
            state.in_flight += 1;
            assert_eq!(state.in_flight, 1, "overlapping requests on one link");
            state.calls.push(call);
            state.latency
        });
        (InFlight(self.clone()), latency)
    }
}

/// Marks the link busy until dropped, including when a request is cancelled.
struct InFlight(MockHandle);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.with(|state| state.in_flight -= 1);
    }
}

pub(crate) struct MockTransport {
    link: LinkKey,
    state: ConnectionState,
    handle: MockHandle,
}

impl MockTransport {
    pub fn new(link: LinkKey, handle: MockHandle) -> Self {
        Self {
            link,
            state: ConnectionState::Disconnected,
            handle,
        }
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.state == ConnectionState::Connected {
            Ok(())
        } else {
            Err(Error::NotConnected(self.link.clone()))
        }
    }

    fn fail(&mut self) -> Error {
        self.state = ConnectionState::Failed;
        Error::Io(io::Error::new(io::ErrorKind::BrokenPipe, "mock link lost"))
    }

    fn time_out(&mut self, slave: SlaveId) -> Error {
        self.state = ConnectionState::Failed;
        Error::Io(io::Error::new(
            io::ErrorKind::TimedOut,
            format!("no response from slave {slave}"),
        ))
    }

    fn is_absent(&self, slave: SlaveId) -> bool {
        self.handle.with(|state| state.absent.contains(&*slave))
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn link(&self) -> &LinkKey {
        &self.link
    }

    fn state(&self) -> ConnectionState {
        self.state
    }

    async fn connect(&mut self) -> Result<()> {
        let refused = self.handle.with(|state| {
            state.connects += 1;
            state.refuse_connect
        });
        if refused {
            return Err(Error::Connect {
                link: self.link.clone(),
                source: io::Error::new(io::ErrorKind::ConnectionRefused, "mock refused"),
            });
        }
        self.state = ConnectionState::Connected;
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        self.handle.with(|state| state.disconnects += 1);
        self.state = ConnectionState::Disconnected;
        Ok(())
    }

    async fn is_connected(&mut self, slave: SlaveId) -> bool {
        if self.state != ConnectionState::Connected {
            return false;
        }
        let answered = !self.is_absent(slave);
        self.handle
            .with(|state| state.probes.push((*slave, answered)));
        if !answered {
            self.time_out(slave);
        }
        answered
    }

    async fn read_holding_registers(
        &mut self,
        slave: SlaveId,
        address: RegisterAddress,
        count: u16,
    ) -> Result<Vec<u16>> {
        self.ensure_connected()?;
        let (_busy, latency) = self.handle.enter(Call::Read {
            slave: *slave,
            address: *address,
            count,
        });
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        if self.is_absent(slave) {
            self.handle.with(|state| state.reads += 1);
            return Err(self.time_out(slave));
        }
        let (fault, words) = self.handle.with(|state| {
            state.reads += 1;
            let fault = match state.fail_from {
                Some(from) if state.reads >= from => Some(Fault::Io),
                _ => state.faults.get(&state.reads).copied(),
            }
            .or_else(|| {
                state
                    .exceptions
                    .get(&(*slave, *address))
                    .map(|code| Fault::Exception(*code))
            });
            let words = (0..count)
                .map(|offset| {
                    state
                        .registers
                        .get(&(*slave, *address + offset))
                        .copied()
                        .unwrap_or(0)
                })
                .collect::<Vec<_>>();
            (fault, words)
        });
        match fault {
            Some(Fault::Io) => Err(self.fail()),
            Some(Fault::Exception(code)) => Err(Error::Protocol(code)),
            None => Ok(words),
        }
    }

    async fn write_registers(
        &mut self,
        slave: SlaveId,
        address: RegisterAddress,
        values: &[u16],
    ) -> Result<()> {
        self.ensure_connected()?;
        let (_busy, latency) = self.handle.enter(Call::Write {
            slave: *slave,
            address: *address,
            count: values.len() as u16,
        });
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        if self.is_absent(slave) {
            return Err(self.time_out(slave));
        }
        self.handle.set_registers(*slave, *address, values);
        Ok(())
    }
}

/// Hands out one [`MockHandle`] per link key.
#[derive(Default)]
pub(crate) struct MockFactory {
    handles: Mutex<HashMap<LinkKey, MockHandle>>,
    created: Mutex<Vec<LinkKey>>,
}

impl MockFactory {
    pub fn handle(&self, link: &LinkKey) -> MockHandle {
        self.handles
            .lock()
            .unwrap()
            .entry(link.clone())
            .or_default()
            .clone()
    }

    pub fn created(&self) -> Vec<LinkKey> {
        self.created.lock().unwrap().clone()
    }
}

impl TransportFactory for MockFactory {
    fn create(&self, connection: &Connection) -> Box<dyn Transport> {
        let link = connection.link_key();
        self.created.lock().unwrap().push(link.clone());
        Box::new(MockTransport::new(link.clone(), self.handle(&link)))
    }
}

/// A client for `device` on a fresh arbiter over `factory`.
pub(crate) fn client_on(factory: Arc<MockFactory>, device: Device) -> ModbusMasterClient {
    let arbiter = Arc::new(LinkArbiter::new(factory, Arc::new(NoopObserver)));
    ModbusMasterClient::new(Arc::new(device), arbiter)
}
