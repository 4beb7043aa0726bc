pub mod command_vm;
pub mod local_vm;
pub mod measurements;
pub mod provision;
pub mod state;

pub use self::command_vm::{CommandVmProvider, VmCommands};
pub use self::local_vm::LocalVmProvider;
pub use self::measurements::{ControlMeasurements, ControlRound};
pub use self::provision::{Image, ImageSpec, Instance, InstanceGuard, VmProvider};
pub use self::state::ControlState;

use crate::bus::{Message, MessageBus, RestartExperiment, ThroughputStart, Topic};
use crate::config::ControlSettings;
use crate::error::{ExperimentError, RunResult};
use crate::experiment::{
    ExperimentConfig, ExperimentSlot, RestartBarrier, Role, SlotGuard, unwind_on_error,
};
use crate::net::{BeaconSocket, drain_stale, wait_for_beacon};
use crate::store::ResultStore;
use anyhow::{Result, anyhow};
use serde_json::Value;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};

#[derive(Default)]
struct Progress {
    barrier: RestartBarrier,
    source_done: Option<Value>,
    sink_done: Option<Value>,
}

/// State of the experiment Control is running, shared with the drain task.
pub struct ControlRun {
    pub test_id: String,
    pub cancel: CancellationToken,
    signal: Notify,
    progress: Mutex<Progress>,
}

impl ControlRun {
    fn new(test_id: &str) -> Self {
        Self {
            test_id: test_id.to_string(),
            cancel: CancellationToken::new(),
            signal: Notify::new(),
            progress: Mutex::new(Progress::default()),
        }
    }

    fn update<R>(&self, f: impl FnOnce(&mut Progress) -> R) -> R {
        let mut progress = self.progress.lock().unwrap_or_else(PoisonError::into_inner);
        let res = f(&mut progress);
        drop(progress);
        self.signal.notify_one();
        res
    }

    fn check<R>(&self, f: impl FnOnce(&mut Progress) -> Option<R>) -> Option<R> {
        let mut progress = self.progress.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut progress)
    }

    /// Waits until `f` yields a value. Only the round loop waits here.
    async fn wait_until<R>(&self, mut f: impl FnMut(&mut Progress) -> Option<R>) -> RunResult<R> {
        loop {
            if self.cancel.is_cancelled() {
                return Err(ExperimentError::Aborted);
            }
            if let Some(res) = self.check(&mut f) {
                return Ok(res);
            }
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(ExperimentError::Aborted),
                _ = self.signal.notified() => {}
            }
        }
    }
}

fn instance_name(prefix: &str, framework: &str, test_id: &str) -> String {
    let suffix: String = test_id
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_lowercase())
        .collect();
    let suffix = &suffix[suffix.len().saturating_sub(8)..];
    if prefix.is_empty() {
        format!("{}-{}", framework, suffix)
    } else {
        format!("{}-{}-{}", prefix, framework, suffix)
    }
}

/// Orchestrates provisioning, boots, restarts and teardown of the unit
/// under test.
pub struct ControlService {
    bus: Arc<dyn MessageBus>,
    vms: Arc<dyn VmProvider>,
    results: Arc<dyn ResultStore>,
    settings: ControlSettings,
    slot: ExperimentSlot<ControlRun>,
    state: watch::Sender<ControlState>,
}

impl ControlService {
    pub fn new(
        bus: Arc<dyn MessageBus>,
        vms: Arc<dyn VmProvider>,
        results: Arc<dyn ResultStore>,
        settings: ControlSettings,
    ) -> Arc<Self> {
        Arc::new(Self {
            bus,
            vms,
            results,
            settings,
            slot: ExperimentSlot::new(),
            state: watch::Sender::new(ControlState::Idle),
        })
    }

    pub fn state(&self) -> ControlState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ControlState> {
        self.state.subscribe()
    }

    pub fn slot(&self) -> &ExperimentSlot<ControlRun> {
        &self.slot
    }

    fn transition(&self, next: ControlState) {
        let prev = self.state.send_replace(next);
        if prev != next {
            info!(from = %prev, to = %next, "control state");
        }
    }

    /// Subscribes to the Control topic and drains it in the background.
    pub async fn spawn(self: &Arc<Self>) -> Result<JoinHandle<()>> {
        let mut subscription = self.bus.subscribe(Topic::Control).await?;
        let service = self.clone();
        Ok(tokio::spawn(async move {
            while let Some(next) = subscription.next().await {
                match next {
                    Ok(message) => service.handle(message),
                    Err(e) => warn!(error = %e, "dropping malformed message"),
                }
            }
            info!("message bus closed");
        }))
    }

    /// Applies one Control-topic message. Duplicates are harmless.
    pub fn handle(self: &Arc<Self>, message: Message) {
        match message {
            Message::StartExperiment(config) => {
                match self.slot.try_acquire(ControlRun::new(&config.test_id)) {
                    Ok(guard) => {
                        info!(test_id = %config.test_id, image = %config.image_name, "starting experiment");
                        tokio::spawn(self.clone().run_experiment(guard, config));
                    }
                    Err(e) => warn!(test_id = %config.test_id, error = %e, "rejecting start"),
                }
            }
            Message::AbortExperiment(abort) => {
                if let Some(run) = self.slot.current() {
                    if abort.matches(&run.test_id) && !run.cancel.is_cancelled() {
                        warn!(test_id = %run.test_id, reason = %abort.reason, "abort received");
                        run.cancel.cancel();
                    }
                }
            }
            Message::ReadyForRestart(ready) => {
                if let Some(run) = self.slot.current() {
                    if run.test_id == ready.test_id {
                        let counted =
                            run.update(|p| p.barrier.arrive(ready.source_or_sink, ready.round));
                        debug!(role = %ready.source_or_sink, round = ready.round, counted, "ready for restart");
                    }
                }
            }
            Message::ResponseMeasurements(response) => {
                if let Some(run) = self.slot.current() {
                    if run.test_id == response.test_id {
                        info!(role = %response.source_or_sink, "measurements received");
                        run.update(|p| match response.source_or_sink {
                            Role::Source => p.source_done = Some(response.measurements),
                            Role::Sink => p.sink_done = Some(response.measurements),
                            Role::Control => {}
                        });
                    }
                }
            }
            other => debug!(service_type = other.service_type(), "ignoring message"),
        }
    }

    async fn run_experiment(
        self: Arc<Self>,
        guard: SlotGuard<ControlRun>,
        config: ExperimentConfig,
    ) {
        let span = info_span!("experiment", test_id = %config.test_id, role = "control");
        async move {
            let mut measurements = ControlMeasurements::new(&config);
            let mut instance: Option<InstanceGuard> = None;
            let result = self
                .drive(&guard, &config, &mut measurements, &mut instance)
                .await;

            let outcome = match &result {
                Ok(()) => ControlState::Done,
                Err(ExperimentError::Aborted) => ControlState::Aborted,
                Err(_) => ControlState::Failed,
            };
            if let Err(e) = &result {
                measurements.fail(e);
                unwind_on_error(&*self.bus, Role::Control, &config.test_id, e).await;
            }
            measurements.outcome = outcome;
            self.transition(outcome);

            if let Some(instance) = instance.take() {
                let log = instance.teardown().await;
                if let Some(round) = measurements.current() {
                    round.finish();
                    if round.serial_log.is_none() {
                        round.serial_log = log;
                    }
                }
            }
            let (source, sink) = guard
                .check(|p| Some((p.source_done.take(), p.sink_done.take())))
                .unwrap_or_default();
            measurements.attach_responses(source, sink);
            self.transition(ControlState::Idle);
            drop(guard);

            self.persist(&measurements).await;
        }
        .instrument(span)
        .await
    }

    async fn persist(&self, measurements: &ControlMeasurements) {
        let key = Role::Control.result_key(&measurements.test_id);
        match serde_json::to_value(measurements) {
            Ok(bundle) => {
                if let Err(e) = self.results.store(&key, &bundle).await {
                    error!(key, error = %e, "failed to store measurements");
                }
            }
            Err(e) => error!(key, error = %e, "failed to encode measurements"),
        }
    }

    async fn provision(&self, config: &ExperimentConfig) -> RunResult<Image> {
        let failure = |what: &str, e: anyhow::Error| {
            ExperimentError::ProvisioningFailure(format!("{}: {:#}", what, e))
        };
        let spec = ImageSpec::from_config(config).map_err(|e| failure("bad image spec", e))?;
        if config.force_rebuild {
            info!("rebuild forced");
        } else if let Some(image) = self
            .vms
            .find_image(&spec)
            .await
            .map_err(|e| failure("image lookup", e))?
        {
            info!(image = %image.id, "reusing image");
            return Ok(image);
        }
        info!(image = %spec.image, "building image");
        self.vms
            .build_image(&spec)
            .await
            .map_err(|e| failure("cannot build image", e))
    }

    async fn await_boot(
        &self,
        socket: &UdpSocket,
        limit: Duration,
        run: &ControlRun,
        measurements: &mut ControlMeasurements,
    ) -> RunResult<()> {
        self.transition(ControlState::AwaitingBoot);
        let beacon = wait_for_beacon(socket, limit, &run.cancel).await?;
        if let Some(round) = measurements.current() {
            round.booted(&beacon);
        }
        Ok(())
    }

    async fn drive(
        &self,
        run: &ControlRun,
        config: &ExperimentConfig,
        measurements: &mut ControlMeasurements,
        instance: &mut Option<InstanceGuard>,
    ) -> RunResult<()> {
        self.transition(ControlState::Provisioning);
        let image = self.provision(config).await?;
        measurements.image = Some(image.clone());
        if run.cancel.is_cancelled() {
            return Err(ExperimentError::Aborted);
        }

        // bound before booting so an early beacon is not lost
        let socket = <UdpSocket as BeaconSocket>::bind(self.settings.boot_listen).await?;
        let name = instance_name(
            &self.settings.instance_prefix,
            &image.labels.get("framework").cloned().unwrap_or_else(|| "vm".into()),
            &config.test_id,
        );
        measurements.start_round(0, false).boot_requested();
        let booted = self
            .vms
            .boot(&image, &name)
            .await
            .map_err(|e| ExperimentError::ProvisioningFailure(format!("boot {}: {:#}", name, e)))?;
        info!(instance = %booted.name, "instance booted");
        *instance = Some(InstanceGuard::new(self.vms.clone(), booted));
        self.await_boot(&socket, self.settings.first_boot_timeout, run, measurements)
            .await?;

        self.transition(ControlState::Streaming);
        let start = Message::ThroughputStart(ThroughputStart {
            test_id: config.test_id.clone(),
            dataset_id: config.dataset_id.clone(),
            params: config.stream_params(),
        });
        self.bus.publish(Topic::Streams, &start).await?;

        for round in 0..config.restarts {
            self.transition(ControlState::RestartBarrier);
            run.wait_until(|p| {
                if p.barrier.take_release() {
                    Some(Ok(()))
                } else if p.source_done.is_some() || p.sink_done.is_some() {
                    Some(Err(anyhow!("a role finished before the round {} barrier", round)))
                } else {
                    None
                }
            })
            .await??;
            info!(round, "restart barrier released");

            let guard = instance
                .as_ref()
                .ok_or_else(|| anyhow!("no instance to reset"))?;
            let log = guard.serial_log().await;
            if let Some(current) = measurements.current() {
                current.serial_log = log;
                current.finish();
            }

            self.transition(ControlState::Resetting);
            measurements.start_round(round + 1, true).boot_requested();
            let target = guard
                .instance()
                .ok_or_else(|| anyhow!("instance already torn down"))?;
            let stale = drain_stale(&socket)?;
            if stale > 0 {
                warn!(stale, "discarded boot datagrams queued before the reset");
            }
            self.vms.reset(target).await.map_err(|e| {
                ExperimentError::ProvisioningFailure(format!("reset {}: {:#}", target.name, e))
            })?;
            self.await_boot(&socket, self.settings.reset_boot_timeout, run, measurements)
                .await?;

            self.transition(ControlState::Streaming);
            let restart = Message::RestartExperiment(RestartExperiment {
                test_id: config.test_id.clone(),
                round: round + 1,
            });
            self.bus.publish(Topic::Streams, &restart).await?;
        }

        self.transition(ControlState::AwaitingCompletion);
        run.wait_until(|p| (p.source_done.is_some() && p.sink_done.is_some()).then_some(()))
            .await?;
        info!("source and sink reported");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instance_name() {
        assert_eq!(instance_name("", "unikraft", "Test-1234-ABCDEFGH"), "unikraft-abcdefgh");
        assert_eq!(instance_name("tb", "mirage", "x1"), "tb-mirage-x1");
    }

    #[tokio::test]
    async fn test_wait_until_sees_updates() {
        let run = Arc::new(ControlRun::new("t"));
        let waiter = run.clone();
        let handle = tokio::spawn(async move {
            waiter
                .wait_until(|p| (p.source_done.is_some() && p.sink_done.is_some()).then_some(()))
                .await
        });
        run.update(|p| p.source_done = Some(Value::Null));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!handle.is_finished());
        run.update(|p| p.sink_done = Some(Value::Null));
        assert!(handle.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_wait_until_aborts() {
        let run = ControlRun::new("t");
        run.cancel.cancel();
        let res = run.wait_until(|_| None::<()>).await;
        assert!(matches!(res, Err(ExperimentError::Aborted)));
    }
}
