//! modlink - Modbus command-line tool for VoltageEMS
//!
//! Reads and writes a remote device, runs a simulated device, or runs a TCP
//! front end that forwards every request to a backend link.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use colored::*;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use voltage_modlink::{
    load_link_config, logging, Coil, DeviceHandler, DeviceIdentificationCategory, DeviceIdentity,
    HoldingRegister, LinkConfig, ModbusClient, ModbusTcpServer, ProtocolKind, ProxyHandler,
    RegisterStore, RequestHandler, WriteNotification,
};

#[derive(Parser)]
#[command(name = "modlink")]
#[command(about = "Modbus RTU/ASCII/TCP client, simulator and proxy")]
#[command(long_about = "Modbus RTU/ASCII/TCP client, simulator and proxy

Examples:
  modlink --host 10.0.0.5 read-holding-registers 1 0 10
  modlink --device /dev/ttyUSB0 --baud 19200 write-coil 3 12 on
  modlink --config link.yaml device-id 1 --category extended
  modlink --protocol rtu serve --bind 0.0.0.0:1502 --unit 1
  modlink --config backend.yaml proxy --bind 0.0.0.0:502")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Link configuration file (YAML, TOML or JSON)
    #[arg(short = 'c', long, global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error); RUST_LOG wins
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,

    /// Wire protocol: rtu, ascii or tcp
    #[arg(long, global = true)]
    protocol: Option<ProtocolKind>,

    /// TCP host of the device
    #[arg(long, global = true)]
    host: Option<String>,

    /// TCP port of the device
    #[arg(long, global = true, default_value_t = 502)]
    port: u16,

    /// Serial device path; selects a serial link
    #[arg(long, global = true)]
    device: Option<String>,

    /// Serial baud rate
    #[arg(long, global = true, default_value_t = 9600)]
    baud: u32,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Read coils (FC 0x01)
    ReadCoils { unit: u8, start: u16, count: u16 },

    /// Read discrete inputs (FC 0x02)
    ReadDiscreteInputs { unit: u8, start: u16, count: u16 },

    /// Read holding registers (FC 0x03)
    ReadHoldingRegisters { unit: u8, start: u16, count: u16 },

    /// Read input registers (FC 0x04)
    ReadInputRegisters { unit: u8, start: u16, count: u16 },

    /// Write a single coil (FC 0x05)
    WriteCoil {
        unit: u8,
        address: u16,
        state: CoilState,
    },

    /// Write a single holding register (FC 0x06)
    WriteRegister { unit: u8, address: u16, value: u16 },

    /// Read device identification (FC 0x2B / MEI 0x0E)
    DeviceId {
        unit: u8,

        /// basic, regular or extended
        #[arg(long, default_value = "basic")]
        category: DeviceIdentificationCategory,
    },

    /// Run a simulated device
    Serve {
        /// Listen address
        #[arg(long, default_value = "127.0.0.1:1502")]
        bind: String,

        /// Unit id the simulator answers
        #[arg(long, default_value_t = 1)]
        unit: u8,
    },

    /// Forward requests received on a TCP port to the configured link
    Proxy {
        /// Listen address
        #[arg(long, default_value = "127.0.0.1:1502")]
        bind: String,

        /// Protocol spoken by front-end clients
        #[arg(long, default_value = "tcp")]
        listen_protocol: ProtocolKind,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum CoilState {
    On,
    Off,
}

/// Link settings from the config file, else from the command-line flags
fn link_config(cli: &Cli) -> Result<LinkConfig> {
    let mut config = match &cli.config {
        Some(path) => load_link_config(path)
            .with_context(|| format!("Failed to load {}", path.display()))?,
        None => match &cli.device {
            Some(device) => LinkConfig::serial(ProtocolKind::Rtu, device.clone(), cli.baud),
            None => LinkConfig::tcp(
                ProtocolKind::Tcp,
                cli.host.clone().unwrap_or_else(|| "127.0.0.1".to_string()),
                cli.port,
            ),
        },
    };
    if let Some(protocol) = cli.protocol {
        config.protocol = protocol;
    }
    config.validate()?;
    debug!("Link: {} over {:?}", config.protocol, config.transport);
    Ok(config)
}

fn print_bits(kind: &str, bits: impl Iterator<Item = (u16, bool)>) {
    println!("{}", kind.bright_cyan());
    for (address, value) in bits {
        let shown = if value { "ON".green() } else { "OFF".dimmed() };
        println!("  {address:>5}  {shown}");
    }
}

fn print_registers(kind: &str, registers: impl Iterator<Item = (u16, u16)>) {
    println!("{}", kind.bright_cyan());
    for (address, value) in registers {
        println!("  {address:>5}  {value:>5}  0x{value:04X}");
    }
}

fn print_written(ok: bool) {
    if ok {
        println!("{} write acknowledged", "OK".bright_green());
    } else {
        println!("{} device echoed different values", "WARN".yellow());
    }
}

async fn run_client(cli: &Cli, client: &ModbusClient) -> Result<()> {
    match &cli.command {
        Commands::ReadCoils { unit, start, count } => {
            let coils = client.read_coils(*unit, *start, *count).await?;
            print_bits("Coils", coils.iter().map(|c| (c.address, c.value)));
        },
        Commands::ReadDiscreteInputs { unit, start, count } => {
            let inputs = client.read_discrete_inputs(*unit, *start, *count).await?;
            print_bits("Discrete inputs", inputs.iter().map(|d| (d.address, d.value)));
        },
        Commands::ReadHoldingRegisters { unit, start, count } => {
            let registers = client.read_holding_registers(*unit, *start, *count).await?;
            print_registers(
                "Holding registers",
                registers.iter().map(|r| (r.address, r.value())),
            );
        },
        Commands::ReadInputRegisters { unit, start, count } => {
            let registers = client.read_input_registers(*unit, *start, *count).await?;
            print_registers(
                "Input registers",
                registers.iter().map(|r| (r.address, r.value())),
            );
        },
        Commands::WriteCoil {
            unit,
            address,
            state,
        } => {
            let coil = Coil::new(*address, matches!(state, CoilState::On));
            print_written(client.write_single_coil(*unit, coil).await?);
        },
        Commands::WriteRegister {
            unit,
            address,
            value,
        } => {
            let register = HoldingRegister::new(*address, *value);
            print_written(client.write_single_holding_register(*unit, register).await?);
        },
        Commands::DeviceId { unit, category } => {
            if *category == DeviceIdentificationCategory::Individual {
                bail!("Individual access is not a stream category; use basic, regular or extended");
            }
            let id = client.read_device_identification(*unit, *category).await?;
            println!("{}", "Device identification".bright_cyan());
            let fields = [
                ("Vendor", &id.vendor_name),
                ("Product code", &id.product_code),
                ("Revision", &id.major_minor_revision),
                ("Vendor URL", &id.vendor_url),
                ("Product name", &id.product_name),
                ("Model name", &id.model_name),
                ("Application", &id.user_application_name),
            ];
            for (label, value) in fields {
                if let Some(value) = value {
                    println!("  {label:<13} {value}");
                }
            }
            for (object_id, data) in &id.extended_objects {
                println!("  0x{object_id:02X}          {}", String::from_utf8_lossy(data));
            }
        },
        Commands::Serve { .. } | Commands::Proxy { .. } => {
            bail!("Server commands do not run against a client link")
        },
    }
    Ok(())
}

fn simulated_store(unit: u8) -> Result<Arc<RegisterStore>> {
    let mut identity =
        DeviceIdentity::basic("VoltageEMS", "modlink-sim", env!("CARGO_PKG_VERSION"))?;
    identity.set_object(0x04, "modlink simulator")?;
    let store = Arc::new(RegisterStore::new(identity));
    store.add_unit(unit);
    for address in 0..10u16 {
        store.set_input_register(unit, address, address * 100);
    }
    Ok(store)
}

async fn serve_until_ctrl_c(
    bind: &str,
    protocol: ProtocolKind,
    handler: Arc<dyn RequestHandler>,
) -> Result<()> {
    let server = ModbusTcpServer::bind(bind, protocol.create(), handler)
        .await
        .with_context(|| format!("Failed to bind {bind}"))?;
    println!(
        "{} {} on {} (Ctrl-C to stop)",
        "Listening".bright_green(),
        protocol,
        server.local_addr()?
    );

    let cancel: CancellationToken = server.cancellation_token();
    let task = tokio::spawn(server.run());
    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    cancel.cancel();
    task.await??;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    if cli.no_color {
        colored::control::set_override(false);
    }
    logging::init(&cli.log_level, false)?;

    match &cli.command {
        Commands::Serve { bind, unit } => {
            let store = simulated_store(*unit)?;
            let (handler, mut writes) = DeviceHandler::with_notifications(store);
            tokio::spawn(async move {
                while let Some(write) = writes.recv().await {
                    match write {
                        WriteNotification::Coils { unit_id, coils } => {
                            for coil in coils {
                                println!(
                                    "{} unit {unit_id} coil {} = {}",
                                    "WRITE".yellow(),
                                    coil.address,
                                    coil.value
                                );
                            }
                        },
                        WriteNotification::HoldingRegisters { unit_id, registers } => {
                            for register in registers {
                                println!(
                                    "{} unit {unit_id} register {} = {}",
                                    "WRITE".yellow(),
                                    register.address,
                                    register.value()
                                );
                            }
                        },
                    }
                }
            });
            let protocol = cli.protocol.unwrap_or(ProtocolKind::Tcp);
            serve_until_ctrl_c(bind, protocol, Arc::new(handler)).await
        },
        Commands::Proxy {
            bind,
            listen_protocol,
        } => {
            let backend = ModbusClient::from_config(&link_config(&cli)?)?;
            println!(
                "{} {}",
                "Backend".bright_cyan(),
                backend.connection().name()
            );
            let handler = Arc::new(ProxyHandler::new(backend.clone()));
            let result = serve_until_ctrl_c(bind, *listen_protocol, handler).await;
            backend.close().await;
            result
        },
        _ => {
            let client = ModbusClient::from_config(&link_config(&cli)?)?;
            let interrupt = CancellationToken::new();
            let on_ctrl_c = interrupt.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    on_ctrl_c.cancel();
                }
            });
            let result = run_client(&cli, &client.with_cancellation(interrupt)).await;
            client.close().await;
            result
        },
    }
}
