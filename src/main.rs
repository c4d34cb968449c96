//! Modbus Master CLI
//!
//! A command-line interface (CLI) application for reading, writing and
//! monitoring Modbus TCP and Modbus RTU devices listed in a YAML device
//! inventory.
//!
//! This tool allows users to:
//! - List the configured devices and the serial ports and network
//!   interfaces of the host.
//! - Read and write single register values (u16, i32, f32).
//! - Read all channels of a device through its model's register map.
//! - Monitor devices continuously until Ctrl-C is pressed.
//!
//! Devices sharing a TCP gateway or a serial port are serialized by the
//! `modbus_master_lib` link arbiter, so any number of them can be monitored
//! at once.

use anyhow::{bail, Context, Result};
use clap::Parser;
use flexi_logger::{Logger, LoggerHandle};
use log::*;
use modbus_master_lib::{
    arbiter::LinkArbiter,
    client::ModbusMasterClient,
    config::Config,
    dispatcher::DeviceDispatcher,
    observer::LogObserver,
    polling::Reading,
    transport::ModbusTransportFactory,
};
use std::{panic, sync::Arc, time::Duration};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

mod commandline;

fn logging_init(loglevel: LevelFilter) -> Result<LoggerHandle> {
    let log_handle = Logger::try_with_env_or_str(loglevel.as_str())
        .context("Cannot init logging")?
        .start()
        .context("Cannot start logging")?;

    panic::set_hook(Box::new(|panic_info| {
        let (filename, line, column) = panic_info
            .location()
            .map(|loc| (loc.file(), loc.line(), loc.column()))
            .unwrap_or(("<unknown_file>", 0, 0));

        let cause_str = if let Some(s) = panic_info.payload().downcast_ref::<&str>() {
            *s
        } else if let Some(s) = panic_info.payload().downcast_ref::<String>() {
            s.as_str()
        } else {
            "<unknown_panic_cause>"
        };

        error!(
            target: "panic",
            "Thread '{}' panicked at '{}': {}:{} - Cause: {}",
            std::thread::current().name().unwrap_or("<unnamed>"),
            filename,
            line,
            column,
            cause_str
        );
    }));
    Ok(log_handle)
}

fn handle_ports() -> Result<()> {
    let ports = tokio_serial::available_ports().context("Cannot enumerate serial ports")?;
    if ports.is_empty() {
        println!("No serial ports found.");
    }
    for port in ports {
        let kind = match port.port_type {
            tokio_serial::SerialPortType::UsbPort(usb) => format!(
                "USB {:04x}:{:04x} {}",
                usb.vid,
                usb.pid,
                usb.product.unwrap_or_default()
            ),
            tokio_serial::SerialPortType::PciPort => "PCI".to_string(),
            tokio_serial::SerialPortType::BluetoothPort => "Bluetooth".to_string(),
            tokio_serial::SerialPortType::Unknown => "unknown".to_string(),
        };
        println!("{}: {kind}", port.port_name);
    }
    Ok(())
}

fn handle_interfaces() -> Result<()> {
    let interfaces = if_addrs::get_if_addrs().context("Cannot enumerate network interfaces")?;
    for interface in interfaces {
        let loopback = if interface.is_loopback() { " (loopback)" } else { "" };
        println!("{}: {}{loopback}", interface.name, interface.ip());
    }
    Ok(())
}

fn client_for(dispatcher: &DeviceDispatcher, name: &str) -> Result<ModbusMasterClient> {
    match dispatcher.client(name) {
        Some(client) => Ok(client),
        None => bail!("Unknown device '{name}', see the 'devices' command"),
    }
}

fn print_reading(reading: &Reading) {
    println!(
        "{} #{} register {}: {}",
        reading.device, reading.sequence, reading.address, reading.value
    );
}

/// Handles the monitor command.
///
/// Polls the selected devices until Ctrl-C is pressed or every session has
/// ended, and fails if any device was lost.
async fn handle_monitor(
    dispatcher: &DeviceDispatcher,
    devices: &[String],
    interval: Duration,
) -> Result<()> {
    for name in devices {
        if dispatcher.device(name).is_none() {
            bail!("Unknown device '{name}', see the 'devices' command");
        }
    }

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!("Ctrl-C received, stopping monitoring"),
                Err(err) => error!("Cannot listen for Ctrl-C: {err}"),
            }
            cancel.cancel();
        }
    });

    let (sink, mut readings) = mpsc::unbounded_channel();
    let printer = tokio::spawn(async move {
        while let Some(reading) = readings.recv().await {
            print_reading(&reading);
        }
    });

    info!("Starting monitoring: interval={interval:?}");
    let outcomes = dispatcher.monitor(devices, interval, cancel, sink).await;
    printer.await.context("Output task failed")?;

    let mut lost = 0;
    for outcome in &outcomes {
        match &outcome.result {
            Ok(state) => println!("{}: {state}", outcome.device),
            Err(error) => {
                lost += 1;
                println!("{}: {error}", outcome.device);
            }
        }
    }
    if lost > 0 {
        bail!("{lost} of {} device(s) disconnected", outcomes.len());
    }
    Ok(())
}

async fn run(
    command: &commandline::CliCommands,
    dispatcher: &DeviceDispatcher,
    config: &Config,
) -> Result<()> {
    match command {
        commandline::CliCommands::Devices => {
            for device in dispatcher.devices() {
                println!(
                    "{}: {} slave {} on {} ({})",
                    device.name, device.model, device.slave_id, device.connection, device.word_order
                );
            }
        }
        commandline::CliCommands::Ports => handle_ports()?,
        commandline::CliCommands::Interfaces => handle_interfaces()?,
        commandline::CliCommands::Read {
            device,
            address,
            kind,
        } => {
            info!("Executing: Read {kind} at {address} from {device}");
            let client = client_for(dispatcher, device)?;
            let value = client
                .read_value(address.get() as u32, *kind)
                .await
                .with_context(|| format!("Cannot read {kind} at register {address}"))?;
            println!("{device} register {address}: {value}");
        }
        commandline::CliCommands::Write {
            device,
            address,
            value,
            kind,
        } => {
            let value = commandline::parse_value(*kind, value).map_err(anyhow::Error::msg)?;
            info!("Executing: Write {value} to {address} on {device}");
            let client = client_for(dispatcher, device)?;
            client
                .write_value(address.get() as u32, value)
                .await
                .with_context(|| format!("Cannot write {value} to register {address}"))?;
            println!("{device} register {address} set to {value}.");
        }
        commandline::CliCommands::Info { device } => {
            info!("Executing: Read all channels of {device}");
            let client = client_for(dispatcher, device)?;
            let readings = dispatcher
                .read_sensor(&client)
                .await
                .with_context(|| format!("Cannot read channels of {device}"))?;
            for reading in readings {
                if !reading.is_present() {
                    println!("Channel {}: absent", reading.channel);
                    continue;
                }
                let values = reading
                    .values
                    .iter()
                    .map(|(name, value)| format!("{name}={value}"))
                    .collect::<Vec<_>>()
                    .join(", ");
                println!(
                    "Channel {} (sensor type {}): {values}",
                    reading.channel,
                    reading.sensor_type.unwrap_or_default()
                );
            }
        }
        commandline::CliCommands::Monitor { devices, interval } => {
            handle_monitor(dispatcher, devices, interval.unwrap_or(config.poll_interval)).await?;
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = commandline::CliArgs::parse();

    // 1. Initialize logging as early as possible
    let _log_handle = logging_init(args.verbose.log_level_filter())?;
    info!(
        "mbmaster started. Log level: {}",
        args.verbose.log_level_filter()
    );

    // 2. Host introspection needs no inventory
    match args.command {
        commandline::CliCommands::Ports => return handle_ports(),
        commandline::CliCommands::Interfaces => return handle_interfaces(),
        _ => {}
    }

    // 3. Load the inventory and set up the shared links
    let config = Config::load(&args.config)
        .with_context(|| format!("Cannot load device configuration '{}'", args.config))?;
    let mut options = config.link_options();
    if let Some(timeout) = args.timeout {
        options.timeout = timeout;
    }
    let devices = config
        .devices()
        .with_context(|| format!("Invalid device configuration '{}'", args.config))?;
    let arbiter = Arc::new(LinkArbiter::new(
        Arc::new(ModbusTransportFactory::new(options)),
        Arc::new(LogObserver),
    ));
    let dispatcher = DeviceDispatcher::new(devices, arbiter.clone());

    // 4. Execute the command
    let result = run(&args.command, &dispatcher, &config).await;
    if let Err(err) = arbiter.disconnect_all().await {
        warn!("Cannot close links: {err}");
    }
    result
}
