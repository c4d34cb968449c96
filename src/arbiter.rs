//! Serialized access to shared physical links.
//!
//! All devices reached over the same [`LinkKey`] share one [`Transport`].
//! Each link sits behind its own `tokio::sync::Mutex`, whose waiters are
//! served in arrival order: a request holds the link for its whole
//! request/response exchange and the next device in line goes after it.
//! Different links never block each other.

use crate::{
    error::Result,
    observer::Observer,
    protocol::{Connection, ConnectionState, LinkKey},
    transport::{Transport, TransportFactory},
};
use std::{
    collections::HashMap,
    future::Future,
    pin::Pin,
    sync::{Arc, Mutex, PoisonError},
};

/// Future returned by a [`LinkArbiter::with_link`] closure.
pub type LinkFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

struct Link {
    transport: Box<dyn Transport>,
    /// Not opened yet; the first holder connects.
    fresh: bool,
}

type SharedLink = Arc<tokio::sync::Mutex<Link>>;

pub struct LinkArbiter {
    factory: Arc<dyn TransportFactory>,
    observer: Arc<dyn Observer>,
    links: Mutex<HashMap<LinkKey, SharedLink>>,
}

impl LinkArbiter {
    pub fn new(factory: Arc<dyn TransportFactory>, observer: Arc<dyn Observer>) -> Self {
        Self {
            factory,
            observer,
            links: Mutex::new(HashMap::new()),
        }
    }

    pub fn observer(&self) -> Arc<dyn Observer> {
        self.observer.clone()
    }

    /// Returns the link for `connection`, creating its transport on first use.
    fn link(&self, connection: &Connection) -> SharedLink {
        let key = connection.link_key();
        let mut links = self.links.lock().unwrap_or_else(PoisonError::into_inner);
        links
            .entry(key)
            .or_insert_with(|| {
                log::debug!("Creating transport for {connection}");
                Arc::new(tokio::sync::Mutex::new(Link {
                    transport: self.factory.create(connection),
                    fresh: true,
                }))
            })
            .clone()
    }

    fn existing(&self, key: &LinkKey) -> Option<SharedLink> {
        self.links
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    /// Number of distinct links created so far.
    pub fn link_count(&self) -> usize {
        self.links
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    async fn open(&self, transport: &mut dyn Transport) -> Result<()> {
        transport.connect().await?;
        self.observer.on_connect(transport.link());
        Ok(())
    }

    /// Runs `f` with exclusive access to the link of `connection`.
    ///
    /// The first caller on a fresh link opens it. If `f` fails with an I/O
    /// error the link is reopened once and `f` runs once more; if reopening
    /// fails the original error is returned and the link stays down.
    /// Protocol exceptions and validation failures are returned unchanged.
    ///
    /// The link is released when the returned future completes or is dropped.
    pub async fn with_link<T, F>(&self, connection: &Connection, mut f: F) -> Result<T>
    where
        F: for<'t> FnMut(&'t mut (dyn Transport + 'static)) -> LinkFuture<'t, T>,
    {
        let shared = self.link(connection);
        let mut link = shared.lock().await;
        if link.fresh {
            link.fresh = false;
            self.open(link.transport.as_mut()).await?;
        }

        match f(link.transport.as_mut()).await {
            Err(err) if err.is_io() => {
                let key = link.transport.link().clone();
                log::warn!("{key}: {err}, reconnecting");
                self.observer.on_disconnect(&key);
                if let Err(reconnect) = self.open(link.transport.as_mut()).await {
                    log::error!("{key}: reconnect failed: {reconnect}");
                    return Err(err);
                }
                f(link.transport.as_mut()).await
            }
            result => result,
        }
    }

    /// Opens (or reopens) the link of `connection`.
    pub async fn connect(&self, connection: &Connection) -> Result<()> {
        let shared = self.link(connection);
        let mut link = shared.lock().await;
        link.fresh = false;
        self.open(link.transport.as_mut()).await
    }

    /// Closes the link behind `key`, if one exists. Later requests fail with
    /// `NotConnected` until the link is connected again.
    pub async fn disconnect(&self, key: &LinkKey) -> Result<()> {
        let Some(shared) = self.existing(key) else {
            return Ok(());
        };
        let mut link = shared.lock().await;
        link.fresh = false;
        if link.transport.state() == ConnectionState::Disconnected {
            return Ok(());
        }
        let result = link.transport.disconnect().await;
        self.observer.on_disconnect(key);
        result
    }

    /// Closes every link, reporting the first failure.
    pub async fn disconnect_all(&self) -> Result<()> {
        let keys = self
            .links
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect::<Vec<_>>();
        let mut first_err = None;
        for key in keys {
            if let Err(err) = self.disconnect(&key).await {
                log::warn!("{key}: {err}");
                first_err.get_or_insert(err);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    /// Current state of the link behind `key`; waits for an in-flight
    /// request on that link to finish.
    pub async fn state(&self, key: &LinkKey) -> Option<ConnectionState> {
        let shared = self.existing(key)?;
        let link = shared.lock().await;
        Some(link.transport.state())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        error::Error,
        mock::{Call, Fault, MockFactory},
        observer::NoopObserver,
        protocol::{validate_address, validate_slave_id, RegisterAddress, SerialConfig, SlaveId},
    };
    use assert_matches::assert_matches;
    use std::time::Duration;

    fn rtu(port: &str) -> Connection {
        Connection::Rtu {
            port_name: port.into(),
            serial: SerialConfig::default(),
        }
    }

    fn tcp(host: &str) -> Connection {
        Connection::Tcp {
            host: host.into(),
            port: 502,
        }
    }

    fn slave(id: i64) -> SlaveId {
        validate_slave_id(id).unwrap()
    }

    fn arbiter() -> (Arc<MockFactory>, Arc<LinkArbiter>) {
        let factory = Arc::new(MockFactory::default());
        let arbiter = Arc::new(LinkArbiter::new(factory.clone(), Arc::new(NoopObserver)));
        (factory, arbiter)
    }

    async fn read(
        arbiter: &LinkArbiter,
        connection: &Connection,
        slave: SlaveId,
        address: RegisterAddress,
    ) -> Result<Vec<u16>> {
        arbiter
            .with_link(connection, move |transport| {
                Box::pin(async move { transport.read_holding_registers(slave, address, 2).await })
            })
            .await
    }

    #[tokio::test]
    async fn links_are_created_once_per_key() {
        let (factory, arbiter) = arbiter();
        let address = validate_address(0).unwrap();

        read(&arbiter, &rtu("COM2"), slave(1), address).await.unwrap();
        read(&arbiter, &rtu("COM2"), slave(2), address).await.unwrap();
        read(&arbiter, &tcp("10.0.0.5"), slave(1), address).await.unwrap();

        assert_eq!(arbiter.link_count(), 2);
        let created = factory.created();
        assert_eq!(created, vec![rtu("COM2").link_key(), tcp("10.0.0.5").link_key()]);
        let handle = factory.handle(&rtu("COM2").link_key());
        assert_eq!(handle.with(|s| s.connects), 1);
        assert_eq!(handle.calls().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn devices_on_one_link_never_overlap() {
        let (factory, arbiter) = arbiter();
        let link = rtu("COM4");
        factory
            .handle(&link.link_key())
            .with(|s| s.latency = Duration::from_millis(20));

        let mut tasks = tokio::task::JoinSet::new();
        for id in 1..=4 {
            let arbiter = arbiter.clone();
            let link = link.clone();
            tasks.spawn(async move {
                for address in 0..5 {
                    let address = validate_address(address).unwrap();
                    read(&arbiter, &link, slave(id), address).await.unwrap();
                }
            });
        }
        while let Some(joined) = tasks.join_next().await {
            // A panic inside the mock means two requests overlapped.
            joined.unwrap();
        }

        assert_eq!(factory.handle(&link.link_key()).calls().len(), 20);
    }

    #[tokio::test(start_paused = true)]
    async fn waiters_are_served_in_arrival_order() {
        let (factory, arbiter) = arbiter();
        let link = tcp("plc");
        let handle = factory.handle(&link.link_key());
        handle.with(|s| s.latency = Duration::from_millis(10));

        let mut tasks = Vec::new();
        for id in 1..=3 {
            let arbiter = arbiter.clone();
            let link = link.clone();
            tasks.push(tokio::spawn(async move {
                read(&arbiter, &link, slave(id), RegisterAddress::from(7))
                    .await
                    .unwrap();
            }));
            // Let the task queue up before spawning the next one.
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        for task in tasks {
            task.await.unwrap();
        }

        let slaves = handle
            .calls()
            .into_iter()
            .map(|call| match call {
                Call::Read { slave, .. } | Call::Write { slave, .. } => slave,
            })
            .collect::<Vec<_>>();
        assert_eq!(slaves, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn io_error_reconnects_and_retries_once() {
        let (factory, arbiter) = arbiter();
        let link = tcp("plc");
        let handle = factory.handle(&link.link_key());
        handle.set_registers(1, 10, &[0x1234, 0x5678]);
        handle.with(|s| {
            s.faults.insert(1, Fault::Io);
        });

        let words = read(&arbiter, &link, slave(1), RegisterAddress::from(10))
            .await
            .unwrap();

        assert_eq!(words, vec![0x1234, 0x5678]);
        assert_eq!(handle.with(|s| (s.connects, s.reads)), (2, 2));
    }

    #[tokio::test]
    async fn failed_reconnect_returns_original_error() {
        let (factory, arbiter) = arbiter();
        let link = tcp("plc");
        let handle = factory.handle(&link.link_key());
        read(&arbiter, &link, slave(1), RegisterAddress::from(0))
            .await
            .unwrap();
        handle.with(|s| {
            s.fail_from = Some(2);
            s.refuse_connect = true;
        });

        let err = read(&arbiter, &link, slave(1), RegisterAddress::from(0))
            .await
            .unwrap_err();
        assert_matches!(err, Error::Io(_));
        assert_eq!(
            arbiter.state(&link.link_key()).await,
            Some(ConnectionState::Failed)
        );

        // No implicit reconnect: the next caller fails fast.
        let err = read(&arbiter, &link, slave(2), RegisterAddress::from(0))
            .await
            .unwrap_err();
        assert_matches!(err, Error::NotConnected(_));
        assert_eq!(handle.with(|s| s.reads), 2);
    }

    #[tokio::test]
    async fn exceptions_are_not_retried() {
        let (factory, arbiter) = arbiter();
        let link = rtu("COM2");
        let handle = factory.handle(&link.link_key());
        handle.with(|s| {
            s.faults
                .insert(1, Fault::Exception(tokio_modbus::ExceptionCode::IllegalDataAddress));
        });

        let err = read(&arbiter, &link, slave(3), RegisterAddress::from(0))
            .await
            .unwrap_err();

        assert_matches!(
            err,
            Error::Protocol(tokio_modbus::ExceptionCode::IllegalDataAddress)
        );
        assert_eq!(handle.with(|s| (s.connects, s.reads)), (1, 1));
    }

    #[tokio::test]
    async fn explicit_disconnect_and_connect() {
        let (factory, arbiter) = arbiter();
        let link = tcp("plc");
        let key = link.link_key();

        // Unknown links are a no-op.
        arbiter.disconnect(&key).await.unwrap();
        assert_eq!(arbiter.state(&key).await, None);

        arbiter.connect(&link).await.unwrap();
        assert_eq!(arbiter.state(&key).await, Some(ConnectionState::Connected));

        arbiter.disconnect_all().await.unwrap();
        assert_eq!(factory.handle(&key).with(|s| s.disconnects), 1);
        assert_eq!(
            arbiter.state(&key).await,
            Some(ConnectionState::Disconnected)
        );
        let err = read(&arbiter, &link, slave(1), RegisterAddress::from(0))
            .await
            .unwrap_err();
        assert_matches!(err, Error::NotConnected(_));

        arbiter.connect(&link).await.unwrap();
        read(&arbiter, &link, slave(1), RegisterAddress::from(0))
            .await
            .unwrap();
        assert_eq!(factory.handle(&key).with(|s| s.connects), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn aborted_request_releases_the_link() {
        let (factory, arbiter) = arbiter();
        let link = rtu("COM3");
        let handle = factory.handle(&link.link_key());
        handle.with(|s| s.latency = Duration::from_millis(100));
        handle.set_registers(2, 0, &[0xABCD, 0x0001]);

        let first = tokio::spawn({
            let arbiter = arbiter.clone();
            let link = link.clone();
            async move { read(&arbiter, &link, slave(1), RegisterAddress::from(0)).await }
        });
        // Abort while the first request is on the wire.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(handle.with(|s| s.in_flight), 1);
        let second = tokio::spawn({
            let arbiter = arbiter.clone();
            let link = link.clone();
            async move { read(&arbiter, &link, slave(2), RegisterAddress::from(0)).await }
        });
        first.abort();
        assert!(first.await.unwrap_err().is_cancelled());

        let words = second.await.unwrap().unwrap();
        assert_eq!(words, vec![0xABCD, 0x0001]);
        assert_eq!(handle.with(|s| s.in_flight), 0);
        assert_eq!(
            arbiter.state(&link.link_key()).await,
            Some(ConnectionState::Connected)
        );
    }

    #[tokio::test]
    async fn refused_first_connect_is_reported() {
        let (factory, arbiter) = arbiter();
        let link = rtu("COM9");
        factory
            .handle(&link.link_key())
            .with(|s| s.refuse_connect = true);

        let err = read(&arbiter, &link, slave(1), RegisterAddress::from(0))
            .await
            .unwrap_err();
        assert_matches!(err, Error::Connect { .. });
    }
}
