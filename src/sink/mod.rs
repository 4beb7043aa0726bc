pub mod engine;
pub mod measurements;

pub use self::engine::SinkEngine;
pub use self::measurements::{SinkMeasurements, SinkRound, Termination};

use crate::bus::{Message, MessageBus, ReadyForRestart, ThroughputStart, Topic};
use crate::config::StreamSettings;
use crate::error::RunResult;
use crate::experiment::{
    ExperimentSlot, Role, RoleRun, SlotGuard, StreamParams, catch_panic, drain_stream_topic,
    report_measurements, unwind_on_error,
};
use crate::store::ResultStore;
use anyhow::Result;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{Instrument, info, info_span};

/// Receives what the unit under test forwards, one connection per round.
pub struct SinkService {
    bus: Arc<dyn MessageBus>,
    results: Arc<dyn ResultStore>,
    settings: StreamSettings,
    slot: ExperimentSlot<RoleRun>,
}

impl SinkService {
    pub fn new(
        bus: Arc<dyn MessageBus>,
        results: Arc<dyn ResultStore>,
        settings: StreamSettings,
    ) -> Arc<Self> {
        Arc::new(Self {
            bus,
            results,
            settings,
            slot: ExperimentSlot::new(),
        })
    }

    pub fn slot(&self) -> &ExperimentSlot<RoleRun> {
        &self.slot
    }

    pub async fn spawn(self: &Arc<Self>) -> Result<JoinHandle<()>> {
        let subscription = self.bus.subscribe(Topic::Streams).await?;
        let service = self.clone();
        Ok(tokio::spawn(async move {
            let slot = service.slot.clone();
            drain_stream_topic(Role::Sink, subscription, slot, move |guard, start| {
                tokio::spawn(service.clone().run_experiment(guard, start));
            })
            .await
        }))
    }

    async fn run_experiment(self: Arc<Self>, guard: SlotGuard<RoleRun>, start: ThroughputStart) {
        let span = info_span!("experiment", test_id = %start.test_id, role = "sink");
        async move {
            let mut measurements = SinkMeasurements::new(&start.test_id);
            let result = catch_panic(self.rounds(&guard, &start, &mut measurements)).await;
            if let Err(e) = &result {
                measurements.fail(e);
                unwind_on_error(&*self.bus, Role::Sink, &start.test_id, e).await;
            }
            drop(guard);

            let key = Role::Sink.result_key(&start.test_id);
            let bundle = serde_json::to_value(&measurements).unwrap_or_default();
            report_measurements(
                &*self.bus,
                &*self.results,
                Role::Sink,
                &start.test_id,
                bundle,
                measurements.summary(&key),
            )
            .await;
        }
        .instrument(span)
        .await
    }

    async fn rounds(
        &self,
        run: &RoleRun,
        start: &ThroughputStart,
        measurements: &mut SinkMeasurements,
    ) -> RunResult<()> {
        let params = start.params;
        let listener = TcpListener::bind(self.settings.listen).await?;
        info!(listen = %listener.local_addr()?, "waiting for the unit under test");

        for round in 0..params.rounds() {
            if round > 0 {
                run.wait_release(round).await?;
            }
            let mut record = SinkRound::begin(round);
            let res = self
                .receive_round(&listener, run, &params, &mut record)
                .instrument(info_span!("round", round))
                .await;
            record.finish();
            measurements.measurements.push(record);
            res?;

            if round + 1 < params.rounds() {
                let ready = Message::ReadyForRestart(ReadyForRestart {
                    test_id: start.test_id.clone(),
                    source_or_sink: Role::Sink,
                    round,
                });
                self.bus.publish(Topic::Control, &ready).await?;
            }
        }
        Ok(())
    }

    async fn receive_round(
        &self,
        listener: &TcpListener,
        run: &RoleRun,
        params: &StreamParams,
        record: &mut SinkRound,
    ) -> RunResult<()> {
        let (mut stream, peer) = engine::accept(listener, &run.cancel).await?;
        info!(%peer, "unit connected");
        let termination = SinkEngine::new(params, &run.cancel)
            .run(&mut stream, record)
            .await?;
        record.terminated_by = Some(termination);
        Ok(())
    }
}
