//! Observability hooks.
//!
//! The master reports link lifecycle changes, rejected register accesses and
//! decoded values to an [`Observer`]. The sink is injected into the
//! [`LinkArbiter`](crate::arbiter::LinkArbiter) and every
//! [`ModbusMasterClient`](crate::client::ModbusMasterClient); its lifetime is
//! owned by whoever builds them.

use crate::{codec::RegisterValue, error::Error, protocol::LinkKey};

pub trait Observer: Send + Sync {
    fn on_connect(&self, _link: &LinkKey) {}

    fn on_disconnect(&self, _link: &LinkKey) {}

    fn on_validation_failure(&self, _device: &str, _error: &Error) {}

    fn on_value(&self, _device: &str, _address: u16, _value: &RegisterValue) {}
}

/// Discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl Observer for NoopObserver {}

/// Forwards events to the `log` facade.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogObserver;

impl Observer for LogObserver {
    fn on_connect(&self, link: &LinkKey) {
        log::info!("Connected to {link}");
    }

    fn on_disconnect(&self, link: &LinkKey) {
        log::info!("Disconnected from {link}");
    }

    fn on_validation_failure(&self, device: &str, error: &Error) {
        log::warn!("{device}: rejected register access: {error}");
    }

    fn on_value(&self, device: &str, address: u16, value: &RegisterValue) {
        log::debug!("{device}: register {address} = {value}");
    }
}
