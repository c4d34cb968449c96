//! Serial line helpers for the `tokio-serial` based RTU transport.

use crate::protocol::{DataBits, Parity, SerialConfig, StopBits};
use std::time::Duration;

impl From<DataBits> for tokio_serial::DataBits {
    fn from(value: DataBits) -> Self {
        match value {
            DataBits::Five => tokio_serial::DataBits::Five,
            DataBits::Six => tokio_serial::DataBits::Six,
            DataBits::Seven => tokio_serial::DataBits::Seven,
            DataBits::Eight => tokio_serial::DataBits::Eight,
        }
    }
}

impl From<Parity> for tokio_serial::Parity {
    fn from(value: Parity) -> Self {
        match value {
            Parity::None => tokio_serial::Parity::None,
            Parity::Even => tokio_serial::Parity::Even,
            Parity::Odd => tokio_serial::Parity::Odd,
        }
    }
}

impl From<StopBits> for tokio_serial::StopBits {
    fn from(value: StopBits) -> Self {
        match value {
            StopBits::One => tokio_serial::StopBits::One,
            StopBits::Two => tokio_serial::StopBits::Two,
        }
    }
}

/// Creates a `tokio_serial::SerialPortBuilder` with the specified settings.
///
/// # Arguments
///
/// * `device` - The path to the serial port device (e.g., `/dev/ttyUSB0` or `COM4`).
/// * `serial` - Baud rate, data bits, parity and stop bits of the line.
pub fn serial_port_builder(device: &str, serial: &SerialConfig) -> tokio_serial::SerialPortBuilder {
    tokio_serial::new(device, serial.baud_rate)
        .parity(serial.parity.into())
        .stop_bits(serial.stop_bits.into())
        .data_bits(serial.data_bits.into())
        .flow_control(tokio_serial::FlowControl::None)
}

/// Modbus silence between frames is at least 1.75 ms.
const PRACTICAL_MIN_INTER_FRAME_DELAY_MICROS: u64 = 1_750;

/// Calculates the minimum inter-frame delay for Modbus RTU: 3.5 character
/// times at `baud_rate`, an 11 bit character assumed.
pub fn minimum_rtu_delay(baud_rate: u32) -> Duration {
    let bits_per_char = 11.0;
    let rate = baud_rate as f64;
    if rate == 0.0 {
        return Duration::from_millis(16);
    }

    let char_time_secs = bits_per_char / rate;
    let inter_frame_delay_secs = 3.5 * char_time_secs;
    let delay_micros = (inter_frame_delay_secs * 1_000_000.0) as u64;

    Duration::from_micros(delay_micros.max(PRACTICAL_MIN_INTER_FRAME_DELAY_MICROS))
}

/// Checks if the configured RTU delay is sufficient; if not, uses the calculated minimum.
pub fn check_rtu_delay(delay: Duration, baud_rate: u32) -> Duration {
    let min_rtu_delay = minimum_rtu_delay(baud_rate);
    if delay < min_rtu_delay {
        log::warn!(
            "RTU delay of {delay:?} is below the minimum of {min_rtu_delay:?} for {baud_rate} baud. Using minimum."
        );
        min_rtu_delay
    } else {
        delay
    }
}
