//! BitLink command line
//!
//! Connects to a peripheral and either streams its sensor state or issues a
//! single block-level command.

use anyhow::{anyhow, bail, Result};
use bitlink::domain::models::{AppEvent, ConnectionStatus, SensorSnapshot};
use bitlink::domain::settings::{DeviceVariant, Settings, SettingsService};
use bitlink::infrastructure::bluetooth::protocol::{
    default_program, parse_address, parse_byte_list, DeviceProfile, OutboundCommand,
    DEFAULT_PROGRAM_ADDRESS,
};
use bitlink::infrastructure::bluetooth::{BluetoothService, ServiceHandle};
use bitlink::infrastructure::logging::init_logger;
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::info;

#[derive(Parser)]
#[command(name = "bitlink")]
#[command(about = "Talk to a BLE block-programming peripheral")]
struct Args {
    /// Settings file (defaults to the per-user config directory)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the configured device variant
    #[arg(short, long, value_enum)]
    variant: Option<VariantArg>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    #[command(flatten)]
    Device(DeviceCommand),
    /// Write the effective settings to the settings file
    Config,
}

/// Commands that need a connected peripheral
#[derive(Subcommand)]
enum DeviceCommand {
    /// Stream sensor state, gestures and green-flag presses until Ctrl-C
    Monitor,
    /// Switch one LED pin
    Led {
        index: u8,
        #[arg(value_parser = ["on", "off"])]
        state: String,
    },
    /// Erase the flash page at an address
    Erase {
        #[arg(default_value = "0x30000")]
        address: String,
    },
    /// Read a memory range in stride-sized requests
    Dump { address: String, length: u32 },
    /// Write a byte list such as "0xFC, 0x00, 12", or the bundled program
    Flash { bytes: Option<String> },
}

#[derive(Clone, Copy, ValueEnum)]
enum VariantArg {
    Gen1,
    Gen2,
}

impl From<VariantArg> for DeviceVariant {
    fn from(arg: VariantArg) -> Self {
        match arg {
            VariantArg::Gen1 => DeviceVariant::Gen1,
            VariantArg::Gen2 => DeviceVariant::Gen2,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut settings_service = match args.config {
        Some(path) => SettingsService::from_path(path),
        None => SettingsService::new()?,
    };
    if let Some(variant) = args.variant {
        settings_service.get_mut().device.variant = variant.into();
    }
    let settings = settings_service.get().clone();

    let _log_guard = init_logger(&settings.log_settings)?;

    let command = match args.command {
        Command::Device(command) => command,
        Command::Config => {
            settings_service.save()?;
            println!("{}", settings_service.path().display());
            return Ok(());
        }
    };

    let profile = DeviceProfile::from_settings(&settings.device)?;
    info!("Using {:?} profile, service {}", profile.variant, profile.service);

    let (event_tx, mut events) = mpsc::unbounded_channel();
    let (service, handle) = BluetoothService::with_ble(&settings, profile, event_tx);
    let service_task = tokio::spawn(service.run());

    handle.scan()?;
    let connect_timeout = Duration::from_millis(settings.link.scan_timeout_ms + 5000);
    wait_connected(&mut events, connect_timeout).await?;

    let linger = Duration::from_millis(settings.link.settle_delay_ms);
    match command {
        DeviceCommand::Monitor => monitor(&handle, &mut events).await?,
        DeviceCommand::Led { index, state } => {
            let on = state == "on";
            handle
                .send_command(OutboundCommand::SetLed { index, on })
                .await?;
            drain_events(&mut events, linger, false).await;
        }
        DeviceCommand::Erase { address } => {
            let address = parse_address(&address)?;
            handle
                .send_command(OutboundCommand::EraseFlash { address })
                .await?;
            drain_events(&mut events, linger, false).await;
        }
        DeviceCommand::Dump { address, length } => {
            let address = parse_address(&address)?;
            handle.read_memory(address, length).await?;
            drain_events(&mut events, dump_duration(&settings, length), true).await;
        }
        DeviceCommand::Flash { bytes } => {
            let payload = match bytes {
                Some(text) => parse_byte_list(&text)?,
                None => {
                    info!("Flashing bundled program for {:#X}", DEFAULT_PROGRAM_ADDRESS);
                    default_program()
                }
            };
            let chunks = payload.len().div_ceil(settings.link.packet_size.max(1)) as u64;
            handle
                .send_command(OutboundCommand::WriteFlash(payload))
                .await?;
            let pacing = Duration::from_millis(settings.link.chunk_interval_ms * chunks);
            drain_events(&mut events, pacing + linger, false).await;
        }
    }

    drop(handle);
    service_task.await?;
    Ok(())
}

/// Time for every stride of a memory dump to go out and be answered
fn dump_duration(settings: &Settings, length: u32) -> Duration {
    let stride = settings.link.read_memory_stride.max(1) as u32;
    let strides = length.div_ceil(stride) as u64;
    Duration::from_millis(settings.link.chunk_interval_ms * strides + settings.link.settle_delay_ms)
}

async fn wait_connected(
    events: &mut mpsc::UnboundedReceiver<AppEvent>,
    timeout: Duration,
) -> Result<()> {
    let connected = async {
        while let Some(event) = events.recv().await {
            print_event(&event, false);
            match event {
                AppEvent::ConnectionStatus(ConnectionStatus::Connected) => return Ok(()),
                AppEvent::ConnectionStatus(ConnectionStatus::Error) => {
                    bail!("Connection failed")
                }
                _ => {}
            }
        }
        Err(anyhow!("Bluetooth service stopped"))
    };

    tokio::time::timeout(timeout, connected)
        .await
        .map_err(|_| anyhow!("Timed out waiting for connection"))?
}

async fn monitor(handle: &ServiceHandle, events: &mut mpsc::UnboundedReceiver<AppEvent>) -> Result<()> {
    let mut snapshots = handle.subscribe();
    println!("Monitoring, press Ctrl-C to stop");

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(event) => {
                    print_event(&event, false);
                    if matches!(
                        event,
                        AppEvent::ConnectionStatus(ConnectionStatus::Disconnected | ConnectionStatus::Error)
                    ) {
                        break;
                    }
                }
                None => break,
            },
            changed = snapshots.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = snapshots.borrow_and_update().clone();
                print_snapshot(&snapshot);
            }
            _ = tokio::signal::ctrl_c() => {
                handle.disconnect()?;
                break;
            }
        }
    }

    Ok(())
}

/// Print whatever arrives within `duration`
async fn drain_events(
    events: &mut mpsc::UnboundedReceiver<AppEvent>,
    duration: Duration,
    show_raw: bool,
) {
    let deadline = tokio::time::Instant::now() + duration;
    while let Ok(Some(event)) = tokio::time::timeout_at(deadline, events.recv()).await {
        print_event(&event, show_raw);
    }
}

/// Raw payloads arrive with every frame, so they are only printed on request
fn print_event(event: &AppEvent, show_raw: bool) {
    match event {
        AppEvent::Notification(bytes) => {
            if show_raw {
                println!("received: {:02X?}", bytes);
            }
        }
        AppEvent::GreenFlag => println!("green flag"),
        AppEvent::Gesture(kind) => println!("gesture: {}", kind.name()),
        AppEvent::ConnectionStatus(status) => println!("status: {:?}", status),
        AppEvent::LogMessage(message) => println!("[{:?}] {}", message.severity, message.message),
    }
}

fn print_snapshot(s: &SensorSnapshot) {
    println!(
        "tilt=({:4},{:4}) light={:3} accel={:.3} moving={} button={} spin={:?} speed={:?}",
        s.tilt_x,
        s.tilt_y,
        s.brightness,
        s.accel_magnitude,
        s.moving,
        s.button_pressed,
        s.spin,
        s.speed
    );
}
