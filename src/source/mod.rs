pub mod engine;
pub mod measurements;

pub use self::engine::SourceEngine;
pub use self::measurements::{SourceMeasurements, SourceRound};

use crate::bus::{Message, MessageBus, ReadyForRestart, ThroughputStart, Topic};
use crate::config::StreamSettings;
use crate::error::{ExperimentError, RunResult};
use crate::experiment::{
    ExperimentSlot, Role, RoleRun, SlotGuard, StreamParams, catch_panic, drain_stream_topic,
    report_measurements, unwind_on_error,
};
use crate::protocol::Tuple;
use crate::store::{DatasetStore, ResultStore};
use anyhow::{Context, Result, anyhow};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::{Instrument, info, info_span, warn};

/// Streams the dataset into the unit under test, one connection per round.
pub struct SourceService {
    bus: Arc<dyn MessageBus>,
    datasets: Arc<dyn DatasetStore>,
    results: Arc<dyn ResultStore>,
    settings: StreamSettings,
    slot: ExperimentSlot<RoleRun>,
}

impl SourceService {
    pub fn new(
        bus: Arc<dyn MessageBus>,
        datasets: Arc<dyn DatasetStore>,
        results: Arc<dyn ResultStore>,
        settings: StreamSettings,
    ) -> Arc<Self> {
        Arc::new(Self {
            bus,
            datasets,
            results,
            settings,
            slot: ExperimentSlot::new(),
        })
    }

    pub fn slot(&self) -> &ExperimentSlot<RoleRun> {
        &self.slot
    }

    /// Subscribes to the Source/Sink topic and drains it in the background.
    pub async fn spawn(self: &Arc<Self>) -> Result<JoinHandle<()>> {
        let subscription = self.bus.subscribe(Topic::Streams).await?;
        let service = self.clone();
        Ok(tokio::spawn(async move {
            let slot = service.slot.clone();
            drain_stream_topic(Role::Source, subscription, slot, move |guard, start| {
                tokio::spawn(service.clone().run_experiment(guard, start));
            })
            .await
        }))
    }

    async fn run_experiment(self: Arc<Self>, guard: SlotGuard<RoleRun>, start: ThroughputStart) {
        let span = info_span!("experiment", test_id = %start.test_id, role = "source");
        async move {
            let mut measurements = SourceMeasurements::new(&start.test_id);
            let result = catch_panic(self.rounds(&guard, &start, &mut measurements)).await;
            if let Err(e) = &result {
                measurements.fail(e);
                unwind_on_error(&*self.bus, Role::Source, &start.test_id, e).await;
            }
            drop(guard);

            let key = Role::Source.result_key(&start.test_id);
            let bundle = serde_json::to_value(&measurements).unwrap_or_default();
            report_measurements(
                &*self.bus,
                &*self.results,
                Role::Source,
                &start.test_id,
                bundle,
                measurements.summary(&key),
            )
            .await;
        }
        .instrument(span)
        .await
    }

    async fn load_dataset(&self, start: &ThroughputStart) -> RunResult<Vec<Tuple>> {
        let mut dataset = self
            .datasets
            .load(&start.dataset_id)
            .await
            .with_context(|| format!("loading dataset {}", start.dataset_id))?;
        let batch = start.params.batch_size.max(1) as usize;
        let usable = dataset.len() - dataset.len() % batch;
        if usable != dataset.len() {
            warn!(
                len = dataset.len(),
                batch, usable, "dataset not divisible by batch size, truncating"
            );
            dataset.truncate(usable);
        }
        if dataset.is_empty() {
            return Err(anyhow!("dataset {} holds no complete packet", start.dataset_id).into());
        }
        Ok(dataset)
    }

    async fn rounds(
        &self,
        run: &RoleRun,
        start: &ThroughputStart,
        measurements: &mut SourceMeasurements,
    ) -> RunResult<()> {
        let params = start.params;
        let dataset = self.load_dataset(start).await?;
        let listener = TcpListener::bind(self.settings.listen).await?;
        info!(listen = %listener.local_addr()?, tuples = dataset.len(), "waiting for the unit under test");

        for round in 0..params.rounds() {
            if round > 0 {
                run.wait_release(round).await?;
            }
            let mut record = SourceRound::begin(round);
            let res = self
                .stream_round(&listener, run, &dataset, &params, &mut record)
                .instrument(info_span!("round", round))
                .await;
            record.finish();
            measurements.measurements.push(record);
            res?;

            if round + 1 < params.rounds() {
                let ready = Message::ReadyForRestart(ReadyForRestart {
                    test_id: start.test_id.clone(),
                    source_or_sink: Role::Source,
                    round,
                });
                self.bus.publish(Topic::Control, &ready).await?;
            }
        }
        Ok(())
    }

    async fn stream_round(
        &self,
        listener: &TcpListener,
        run: &RoleRun,
        dataset: &[Tuple],
        params: &StreamParams,
        record: &mut SourceRound,
    ) -> RunResult<()> {
        let (mut stream, peer) = accept(listener, run).await?;
        info!(%peer, "unit connected");
        SourceEngine::new(dataset, params, &run.cancel)
            .run(&mut stream, record)
            .await
    }
}

async fn accept(
    listener: &TcpListener,
    run: &RoleRun,
) -> RunResult<(TcpStream, core::net::SocketAddr)> {
    tokio::select! {
        _ = run.cancel.cancelled() => Err(ExperimentError::Aborted),
        res = listener.accept() => Ok(res?),
    }
}
