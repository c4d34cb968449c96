use clap::{Parser, Subcommand};
use clap_verbosity_flag::{Verbosity, WarnLevel};
use modbus_master_lib::{
    codec::{RegisterValue, ValueKind},
    config::DEFAULT_CONFIG_FILE,
    protocol::{self as proto, RegisterAddress},
};
use std::time::Duration;

fn parse_address(s: &str) -> Result<RegisterAddress, String> {
    let address =
        clap_num::maybe_hex::<u32>(s).map_err(|e| format!("Invalid register address format: {e}"))?;
    proto::validate_address(address as i64).map_err(|e| e.to_string())
}

fn parse_kind(s: &str) -> Result<ValueKind, String> {
    match s.to_ascii_lowercase().as_str() {
        "u16" => Ok(ValueKind::U16),
        "i32" => Ok(ValueKind::I32),
        "f32" => Ok(ValueKind::F32),
        other => Err(format!("Unknown value kind '{other}', expected u16, i32 or f32")),
    }
}

/// Parses `s` as a value of `kind`. 16-bit values may be given in hex.
pub fn parse_value(kind: ValueKind, s: &str) -> Result<RegisterValue, String> {
    match kind {
        ValueKind::U16 => clap_num::maybe_hex::<u16>(s)
            .map(RegisterValue::U16)
            .map_err(|e| format!("Invalid 16-bit value: {e}")),
        ValueKind::I32 => s
            .parse::<i32>()
            .map(RegisterValue::I32)
            .map_err(|e| format!("Invalid 32-bit integer: {e}")),
        ValueKind::F32 => s
            .parse::<f32>()
            .map(RegisterValue::F32)
            .map_err(|e| format!("Invalid float: {e}")),
    }
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum CliCommands {
    /// List the configured devices and their links.
    Devices,

    /// List the serial ports of this host.
    Ports,

    /// List the network interfaces of this host.
    Interfaces,

    /// Read one value from a device.
    Read {
        /// Device name as configured.
        device: String,
        /// Start register address (0 to 65535).
        /// Can be specified in decimal or hexadecimal (e.g., "0x0FA0").
        #[arg(value_parser = parse_address, verbatim_doc_comment)]
        address: RegisterAddress,
        /// Value encoding: u16 (one register), i32 or f32 (two registers).
        #[arg(short, long, default_value = "u16", value_parser = parse_kind)]
        kind: ValueKind,
    },

    /// Write one value to a device.
    Write {
        /// Device name as configured.
        device: String,
        /// Start register address (0 to 65535).
        #[arg(value_parser = parse_address)]
        address: RegisterAddress,
        /// The value, interpreted according to `--kind`.
        #[arg(allow_hyphen_values = true)]
        value: String,
        /// Value encoding: u16 (one register), i32 or f32 (two registers).
        #[arg(short, long, default_value = "u16", value_parser = parse_kind)]
        kind: ValueKind,
    },

    /// Read all channels of a device using its model's register map.
    Info {
        /// Device name as configured.
        device: String,
    },

    /// Continuously poll devices until Ctrl-C is pressed.
    /// Each device is polled in its own task; devices sharing a link take turns.
    #[clap(verbatim_doc_comment)]
    Monitor {
        /// Device to monitor; may be repeated. All devices when omitted.
        #[arg(short, long = "device")]
        devices: Vec<String>,
        /// Poll interval (e.g., "100ms", "2s"). Defaults to the configured interval.
        #[arg(short, long, value_parser = humantime::parse_duration)]
        interval: Option<Duration>,
    },
}

const fn about_text() -> &'static str {
    "Modbus master CLI - Read, write and monitor Modbus TCP/RTU devices from a device inventory."
}

#[derive(Parser, Debug)]
#[command(name="mbmaster", author, version, about=about_text(), long_about = None, propagate_version = true)]
pub struct CliArgs {
    /// Configure verbosity of logging output.
    /// -v for info, -vv for debug, -vvv for trace. Default is off.
    #[command(flatten)]
    pub verbose: Verbosity<WarnLevel>,

    /// Device inventory (YAML).
    #[arg(global = true, short, long, default_value = DEFAULT_CONFIG_FILE)]
    pub config: String,

    /// Modbus I/O timeout for read/write operations, overriding the configuration.
    /// Examples: "1s", "500ms".
    #[arg(global = true, long, value_parser = humantime::parse_duration, verbatim_doc_comment)]
    pub timeout: Option<Duration>,

    #[command(subcommand)]
    pub command: CliCommands,
}
