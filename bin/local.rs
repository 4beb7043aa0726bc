//! Runs Control, Source, Sink and an emulated unit in one process, wired
//! through an in-memory bus.

use anyhow::{Context, Result, anyhow};
use clap::{Arg, Command, value_parser};
use core::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use testbench::bus::{Message, MessageBus, MemoryBus, Topic};
use testbench::config::{ControlSettings, StreamSettings, store_arg};
use testbench::control::{ControlService, LocalVmProvider};
use testbench::experiment::{ExperimentConfig, Role};
use testbench::sink::SinkService;
use testbench::source::SourceService;
use testbench::store::FsStore;
use testbench::telemetry;
use tokio::signal;
use tracing::info;

const RESULT_POLL: Duration = Duration::from_millis(200);

fn any_port(port: u16) -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], port))
}

#[tokio::main]
async fn main() -> Result<()> {
    let matches = Command::new("local")
        .about("Runs a whole experiment on this machine against an emulated unit")
        .args(ControlSettings::args())
        .args(telemetry::args())
        .arg(store_arg())
        .arg(
            Arg::new("config")
                .required(true)
                .value_parser(value_parser!(PathBuf))
                .help("Experiment configuration (JSON)"),
        )
        .get_matches();
    let _guard = telemetry::init_from_matches(&matches)?;

    let path = matches.get_one::<PathBuf>("config").context("config missing")?;
    let raw = tokio::fs::read(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    let config: ExperimentConfig = serde_json::from_slice(&raw).context("parsing configuration")?;
    config.validate().map_err(|e| anyhow!("invalid configuration: {}", e))?;

    let bus = Arc::new(MemoryBus::new());
    let store = Arc::new(FsStore::new(
        matches.get_one::<PathBuf>("store").context("--store missing")?,
    ));
    let mut control_settings = ControlSettings::from_matches(&matches)?;
    if matches.get_one::<SocketAddr>("boot-listen").is_none() {
        control_settings.boot_listen = any_port(config.control_port);
    }

    let control = ControlService::new(
        bus.clone(),
        Arc::new(LocalVmProvider::new()),
        store.clone(),
        control_settings,
    );
    let source = SourceService::new(
        bus.clone(),
        store.clone(),
        store.clone(),
        StreamSettings {
            listen: any_port(config.source_port),
        },
    );
    let sink = SinkService::new(
        bus.clone(),
        store.clone(),
        StreamSettings {
            listen: any_port(config.sink_port),
        },
    );
    let drains = [control.spawn().await?, source.spawn().await?, sink.spawn().await?];

    let test_id = config.test_id.clone();
    bus.publish(Topic::Control, &Message::StartExperiment(config))
        .await?;
    info!(test_id, "experiment started");

    let key = Role::Control.result_key(&test_id);
    let wait = async {
        loop {
            if let Ok(bundle) = store.get_result(&key).await {
                return bundle;
            }
            tokio::time::sleep(RESULT_POLL).await;
        }
    };
    tokio::select! {
        bundle = wait => {
            println!("{}", serde_json::to_string_pretty(&bundle)?);
        }
        _ = signal::ctrl_c() => {
            info!("received Ctrl+C, shutting down");
        }
    }
    for drain in drains {
        drain.abort();
    }
    Ok(())
}
