//! Continuous monitoring of a single device.

use crate::{
    client::ModbusMasterClient,
    codec::{RegisterValue, ValueKind},
    error::DeviceDisconnectedError,
};
use std::{fmt, time::Duration};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollingState {
    Running,
    StoppedByRequest,
    StoppedByDisconnection,
}

impl PollingState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, PollingState::Running)
    }
}

impl fmt::Display for PollingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PollingState::Running => "running",
            PollingState::StoppedByRequest => "stopped by request",
            PollingState::StoppedByDisconnection => "stopped by disconnection",
        })
    }
}

/// The value read on every tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollTarget {
    pub address: u32,
    pub kind: ValueKind,
}

/// One successful poll.
#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    pub device: String,
    pub address: u32,
    /// 1-based tick number within the session.
    pub sequence: u64,
    pub value: RegisterValue,
}

/// Reads one target from one device every `interval` until cancelled or
/// until a read fails.
///
/// Cancellation is observed between reads only: a read that is already on
/// the wire completes before the session stops.
pub struct PollingSession {
    client: ModbusMasterClient,
    target: PollTarget,
    interval: Duration,
    state: PollingState,
    emitted: u64,
}

impl PollingSession {
    pub fn new(client: ModbusMasterClient, target: PollTarget, interval: Duration) -> Self {
        Self {
            client,
            target,
            interval,
            state: PollingState::Running,
            emitted: 0,
        }
    }

    pub fn state(&self) -> PollingState {
        self.state
    }

    /// Number of readings emitted so far.
    pub fn emitted(&self) -> u64 {
        self.emitted
    }

    pub fn client(&self) -> &ModbusMasterClient {
        &self.client
    }

    /// Drives the session, handing every reading to `emit`.
    ///
    /// Returns [`PollingState::StoppedByRequest`] once `cancel` fires. A
    /// failed read ends the session in
    /// [`PollingState::StoppedByDisconnection`] and is returned as
    /// [`DeviceDisconnectedError`]. A session that already stopped returns
    /// its terminal state immediately.
    pub async fn run<F>(
        &mut self,
        cancel: &CancellationToken,
        mut emit: F,
    ) -> Result<PollingState, DeviceDisconnectedError>
    where
        F: FnMut(Reading),
    {
        if self.state.is_terminal() {
            return Ok(self.state);
        }
        let name = self.client.device().name.clone();
        log::debug!(
            "{name}: polling {} at {} every {:?}",
            self.target.kind,
            self.target.address,
            self.interval
        );

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    self.state = PollingState::StoppedByRequest;
                    log::info!("{name}: monitoring stopped after {} readings", self.emitted);
                    return Ok(self.state);
                }
                _ = ticker.tick() => {}
            }

            // Not raced against `cancel`: the exchange runs to completion.
            match self
                .client
                .read_value(self.target.address, self.target.kind)
                .await
            {
                Ok(value) => {
                    self.emitted += 1;
                    emit(Reading {
                        device: name.clone(),
                        address: self.target.address,
                        sequence: self.emitted,
                        value,
                    });
                }
                Err(error) => {
                    self.state = PollingState::StoppedByDisconnection;
                    log::error!("{error}");
                    return Err(DeviceDisconnectedError {
                        device: name,
                        error,
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        client::Device,
        error::Error,
        mock::{client_on, MockFactory, MockHandle},
        protocol::{validate_slave_id, Connection},
        sensors::SensorModel,
    };
    use assert_matches::assert_matches;
    use std::sync::Arc;
    use tokio::time::Instant;

    fn session(interval: Duration) -> (PollingSession, MockHandle) {
        let factory = Arc::new(MockFactory::default());
        let device = Device::new(
            "Pump",
            SensorModel::Tpm10,
            Connection::Tcp {
                host: "pump".into(),
                port: 502,
            },
            validate_slave_id(3).unwrap(),
        );
        let handle = factory.handle(&device.connection.link_key());
        let target = PollTarget {
            address: 40,
            kind: ValueKind::U16,
        };
        (
            PollingSession::new(client_on(factory, device), target, interval),
            handle,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn failure_on_fifth_tick_stops_after_four_readings() {
        let (mut session, handle) = session(DEFAULT_POLL_INTERVAL);
        handle.set_registers(3, 40, &[17]);
        handle.with(|s| s.fail_from = Some(5));

        let mut readings = Vec::new();
        let err = session
            .run(&CancellationToken::new(), |reading| readings.push(reading))
            .await
            .unwrap_err();

        assert_eq!(readings.len(), 4);
        assert_eq!(readings[3].sequence, 4);
        assert!(readings
            .iter()
            .all(|r| r.value == RegisterValue::U16(17) && r.device == "Pump"));
        assert_eq!(session.state(), PollingState::StoppedByDisconnection);
        assert_eq!(err.device, "Pump");
        assert_matches!(err.error.error, Error::Io(_));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_stops_within_one_tick() {
        let (mut session, _handle) = session(DEFAULT_POLL_INTERVAL);
        let cancel = CancellationToken::new();

        let task = tokio::spawn({
            let cancel = cancel.clone();
            async move {
                let mut count = 0;
                let state = session.run(&cancel, |_| count += 1).await;
                (state, count)
            }
        });
        tokio::time::sleep(Duration::from_millis(350)).await;
        let requested = Instant::now();
        cancel.cancel();
        let (state, count) = task.await.unwrap();

        assert!(requested.elapsed() <= DEFAULT_POLL_INTERVAL);
        assert_matches!(state, Ok(PollingState::StoppedByRequest));
        // Ticks at 0, 100, 200 and 300 ms.
        assert_eq!(count, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn ticks_follow_the_interval() {
        let (mut session, handle) = session(Duration::from_millis(250));
        let cancel = CancellationToken::new();
        let started = Instant::now();

        let mut stamps = Vec::new();
        let result = session
            .run(&cancel, |reading| {
                stamps.push(started.elapsed());
                if reading.sequence == 3 {
                    cancel.cancel();
                }
            })
            .await;

        assert_matches!(result, Ok(PollingState::StoppedByRequest));
        assert_eq!(
            stamps,
            vec![
                Duration::ZERO,
                Duration::from_millis(250),
                Duration::from_millis(500)
            ]
        );
        assert_eq!(handle.calls().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn in_flight_read_completes_before_stopping() {
        let (mut session, handle) = session(DEFAULT_POLL_INTERVAL);
        handle.with(|s| s.latency = Duration::from_millis(30));
        let cancel = CancellationToken::new();

        let task = tokio::spawn({
            let cancel = cancel.clone();
            async move {
                let mut count = 0;
                let state = session.run(&cancel, |_| count += 1).await;
                (state, count)
            }
        });
        // The first read is on the wire from 0 to 30 ms.
        tokio::time::sleep(Duration::from_millis(10)).await;
        cancel.cancel();
        let (state, count) = task.await.unwrap();

        assert_matches!(state, Ok(PollingState::StoppedByRequest));
        assert_eq!(count, 1);
        assert_eq!(handle.with(|s| s.in_flight), 0);
    }

    #[tokio::test]
    async fn stopped_session_does_not_restart() {
        let (mut session, handle) = session(DEFAULT_POLL_INTERVAL);
        let cancel = CancellationToken::new();
        cancel.cancel();

        assert_matches!(
            session.run(&cancel, |_| {}).await,
            Ok(PollingState::StoppedByRequest)
        );
        assert_matches!(
            session.run(&CancellationToken::new(), |_| {}).await,
            Ok(PollingState::StoppedByRequest)
        );
        assert!(handle.calls().is_empty());
    }
}
