use anyhow::{Context, Result, anyhow};
use clap::{Arg, ArgAction, Command, value_parser};
use std::path::PathBuf;
use std::time::Duration;
use testbench::bus::{AbortExperiment, Message, MessageBus, Topic, ZooKeeperBus, broadcast_abort};
use testbench::config::{BusSettings, store_arg};
use testbench::experiment::{ExperimentConfig, Role};
use testbench::store::FsStore;
use testbench::telemetry;
use tracing::info;

const RESULT_POLL: Duration = Duration::from_millis(500);

#[tokio::main]
async fn main() -> Result<()> {
    let matches = Command::new("submit")
        .about("Starts or aborts an experiment")
        .args(BusSettings::args())
        .args(telemetry::args())
        .arg(store_arg())
        .arg(
            Arg::new("config")
                .value_parser(value_parser!(PathBuf))
                .required_unless_present("abort")
                .help("Experiment configuration (JSON)"),
        )
        .arg(
            Arg::new("abort")
                .long("abort")
                .num_args(0..=1)
                .default_missing_value("")
                .conflicts_with("config")
                .help("Abort the given test id, or whatever is running"),
        )
        .arg(
            Arg::new("wait")
                .long("wait")
                .action(ArgAction::SetTrue)
                .help("Wait for the control measurements to be stored"),
        )
        .get_matches();
    let _guard = telemetry::init_from_matches(&matches)?;
    let bus = ZooKeeperBus::connect(&BusSettings::from_matches(&matches)).await?;

    if matches.contains_id("abort") {
        let abort = AbortExperiment {
            test_id: matches
                .get_one::<String>("abort")
                .filter(|id| !id.is_empty())
                .cloned(),
            reason: "aborted by operator".into(),
        };
        broadcast_abort(&bus, abort).await?;
        info!("abort published");
        return Ok(());
    }

    let path = matches.get_one::<PathBuf>("config").context("config missing")?;
    let raw = tokio::fs::read(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    let config: ExperimentConfig = serde_json::from_slice(&raw).context("parsing configuration")?;
    config.validate().map_err(|e| anyhow!("invalid configuration: {}", e))?;
    let test_id = config.test_id.clone();
    bus.publish(Topic::Control, &Message::StartExperiment(config))
        .await?;
    info!(test_id, "experiment submitted");

    if matches.get_flag("wait") {
        let store = FsStore::new(matches.get_one::<PathBuf>("store").context("--store missing")?);
        let key = Role::Control.result_key(&test_id);
        loop {
            if let Ok(bundle) = store.get_result(&key).await {
                println!("{}", serde_json::to_string_pretty(&bundle)?);
                break;
            }
            tokio::time::sleep(RESULT_POLL).await;
        }
    }
    Ok(())
}
