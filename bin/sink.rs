use anyhow::{Context, Result};
use clap::Command;
use std::path::PathBuf;
use std::sync::Arc;
use testbench::bus::ZooKeeperBus;
use testbench::config::{BusSettings, StreamSettings, store_arg};
use testbench::sink::SinkService;
use testbench::store::FsStore;
use testbench::telemetry;
use tokio::signal;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    let matches = Command::new("sink")
        .about("Receives the unit under test's output stream")
        .args(BusSettings::args())
        .args(StreamSettings::args())
        .args(telemetry::args())
        .arg(store_arg())
        .get_matches();
    let _guard = telemetry::init_from_matches(&matches)?;

    let bus = ZooKeeperBus::connect(&BusSettings::from_matches(&matches)).await?;
    let store = Arc::new(FsStore::new(
        matches.get_one::<PathBuf>("store").context("--store missing")?,
    ));
    let settings = StreamSettings::from_matches(&matches);
    info!(listen = %settings.listen, "sink ready");
    let service = SinkService::new(Arc::new(bus), store, settings);

    let drain = service.spawn().await?;
    tokio::select! {
        res = drain => {
            if let Err(e) = res {
                error!(error = %e, "sink drain stopped");
            }
        }
        _ = signal::ctrl_c() => {
            info!("received Ctrl+C, shutting down");
        }
    }
    Ok(())
}
