use anyhow::{Context, Result};
use clap::{Arg, Command, value_parser};
use std::path::PathBuf;
use std::sync::Arc;
use testbench::bus::ZooKeeperBus;
use testbench::config::{BusSettings, ControlSettings, store_arg};
use testbench::control::{CommandVmProvider, ControlService, VmCommands};
use testbench::net::utils::my_name;
use testbench::store::FsStore;
use testbench::telemetry;
use tokio::signal;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    let matches = Command::new("control")
        .about("Provisions the unit under test and drives experiments")
        .args(BusSettings::args())
        .args(ControlSettings::args())
        .args(telemetry::args())
        .arg(store_arg())
        .arg(
            Arg::new("vm-commands")
                .long("vm-commands")
                .env("TESTBENCH_VM_COMMANDS")
                .required(true)
                .value_parser(value_parser!(PathBuf))
                .help("JSON file with the build/boot/reset/delete/serial shell commands"),
        )
        .arg(
            Arg::new("image-index")
                .long("image-index")
                .value_parser(value_parser!(PathBuf))
                .default_value("./testbench-images.json")
                .help("Where built images are recorded"),
        )
        .get_matches();
    let _guard = telemetry::init_from_matches(&matches)?;

    let bus = ZooKeeperBus::connect(&BusSettings::from_matches(&matches)).await?;
    let commands_file = matches
        .get_one::<PathBuf>("vm-commands")
        .context("--vm-commands missing")?;
    let commands = VmCommands::load(commands_file).await?;
    let vms = CommandVmProvider::new(
        commands,
        matches.get_one::<PathBuf>("image-index").context("--image-index missing")?,
    );
    let store = FsStore::new(matches.get_one::<PathBuf>("store").context("--store missing")?);
    let service = ControlService::new(
        Arc::new(bus),
        Arc::new(vms),
        Arc::new(store),
        ControlSettings::from_matches(&matches)?,
    );

    let drain = service.spawn().await?;
    info!(host = %my_name().unwrap_or_default(), "control ready");
    tokio::select! {
        res = drain => {
            if let Err(e) = res {
                error!(error = %e, "control drain stopped");
            }
        }
        _ = signal::ctrl_c() => {
            info!("received Ctrl+C, shutting down");
        }
    }
    Ok(())
}
