//! Device inventory and per-model routing.

use crate::{
    arbiter::LinkArbiter,
    client::{Device, ModbusMasterClient},
    error::{DeviceDisconnectedError, DeviceError},
    polling::{PollingSession, PollingState, Reading},
    sensors::{self, ChannelReading},
};
use std::{sync::Arc, time::Duration};
use tokio::{sync::mpsc, task::JoinSet};
use tokio_util::sync::CancellationToken;

/// How a monitoring session of one device ended.
#[derive(Debug)]
pub struct MonitorOutcome {
    pub device: String,
    pub result: Result<PollingState, DeviceDisconnectedError>,
}

pub struct DeviceDispatcher {
    devices: Vec<Arc<Device>>,
    arbiter: Arc<LinkArbiter>,
}

impl DeviceDispatcher {
    pub fn new(devices: Vec<Device>, arbiter: Arc<LinkArbiter>) -> Self {
        Self {
            devices: devices.into_iter().map(Arc::new).collect(),
            arbiter,
        }
    }

    /// Devices in configuration order.
    pub fn devices(&self) -> impl Iterator<Item = &Device> {
        self.devices.iter().map(|device| device.as_ref())
    }

    pub fn device(&self, name: &str) -> Option<&Device> {
        self.find(name).map(|device| device.as_ref())
    }

    fn find(&self, name: &str) -> Option<&Arc<Device>> {
        self.devices.iter().find(|device| device.name == name)
    }

    pub fn arbiter(&self) -> &Arc<LinkArbiter> {
        &self.arbiter
    }

    pub fn client(&self, name: &str) -> Option<ModbusMasterClient> {
        self.find(name)
            .map(|device| ModbusMasterClient::new(device.clone(), self.arbiter.clone()))
    }

    /// Reads all channels of `client`'s device using its model's register map.
    pub async fn read_sensor(
        &self,
        client: &ModbusMasterClient,
    ) -> Result<Vec<ChannelReading>, DeviceError> {
        log::debug!(
            "{}: reading {} channels",
            client.device().name,
            client.device().model
        );
        sensors::read_sensor(client).await
    }

    /// Polls the primary target of each named device (all devices when
    /// `names` is empty) in its own task until `cancel` fires or the device
    /// fails. Readings are sent to `sink`; outcomes come back in
    /// configuration order.
    pub async fn monitor(
        &self,
        names: &[String],
        interval: Duration,
        cancel: CancellationToken,
        sink: mpsc::UnboundedSender<Reading>,
    ) -> Vec<MonitorOutcome> {
        let selected = self
            .devices
            .iter()
            .filter(|device| names.is_empty() || names.contains(&device.name))
            .cloned()
            .collect::<Vec<_>>();

        let mut sessions = JoinSet::new();
        for (index, device) in selected.iter().enumerate() {
            let target = device.model.primary_target();
            let client = ModbusMasterClient::new(device.clone(), self.arbiter.clone());
            let mut session = PollingSession::new(client, target, interval);
            let cancel = cancel.clone();
            let sink = sink.clone();
            sessions.spawn(async move {
                let result = session
                    .run(&cancel, |reading| {
                        // A dropped receiver only means nobody is listening.
                        let _ = sink.send(reading);
                    })
                    .await;
                (index, result)
            });
        }
        drop(sink);

        let mut results = Vec::with_capacity(selected.len());
        while let Some(joined) = sessions.join_next().await {
            match joined {
                Ok(result) => results.push(result),
                Err(err) => log::error!("Monitoring task failed: {err}"),
            }
        }
        results.sort_by_key(|(index, _)| *index);
        results
            .into_iter()
            .map(|(index, result)| MonitorOutcome {
                device: selected[index].name.clone(),
                result,
            })
            .collect()
    }
}
