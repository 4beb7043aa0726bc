use super::{ExperimentSlot, Role, SlotGuard};
use crate::bus::{
    AbortExperiment, Message, MessageBus, ResponseMeasurements, Subscription, ThroughputStart,
    Topic, broadcast_abort,
};
use crate::error::{ExperimentError, RunResult};
use crate::store::ResultStore;
use anyhow::anyhow;
use futures::FutureExt;
use serde_json::Value;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Run state shared between a Source/Sink drain task and its round loop.
pub struct RoleRun {
    pub test_id: String,
    pub cancel: CancellationToken,
    released: watch::Sender<u32>,
}

impl RoleRun {
    pub fn new(test_id: &str) -> Self {
        Self {
            test_id: test_id.to_string(),
            cancel: CancellationToken::new(),
            released: watch::Sender::new(0),
        }
    }

    /// Lets the round loop start `round`. Releases for rounds already
    /// started are ignored.
    pub fn release(&self, round: u32) -> bool {
        self.released.send_if_modified(|current| {
            if round > *current {
                *current = round;
                true
            } else {
                false
            }
        })
    }

    pub fn released_round(&self) -> u32 {
        *self.released.borrow()
    }

    /// Blocks until `round` is released or the run is aborted.
    pub async fn wait_release(&self, round: u32) -> RunResult<()> {
        let mut rx = self.released.subscribe();
        tokio::select! {
            _ = self.cancel.cancelled() => Err(ExperimentError::Aborted),
            res = rx.wait_for(|r| *r >= round) => {
                res.map(|_| ()).map_err(|_| ExperimentError::Aborted)
            }
        }
    }

    pub fn abort(&self) {
        self.cancel.cancel();
    }

    pub fn is_aborted(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Dispatches the Source/Sink topic until the bus goes away.
///
/// A throughput start claims the slot and hands the guard to `start`; the
/// round loop owns it from then on. Restart releases and aborts are applied
/// to the active run when the test id matches.
pub async fn drain_stream_topic<F>(
    role: Role,
    mut subscription: Subscription,
    slot: ExperimentSlot<RoleRun>,
    mut start: F,
) where
    F: FnMut(SlotGuard<RoleRun>, ThroughputStart),
{
    while let Some(next) = subscription.next().await {
        let message = match next {
            Ok(message) => message,
            Err(e) => {
                warn!(%role, error = %e, "dropping malformed message");
                continue;
            }
        };
        match message {
            Message::ThroughputStart(throughput) => {
                match slot.try_acquire(RoleRun::new(&throughput.test_id)) {
                    Ok(guard) => {
                        info!(%role, test_id = %throughput.test_id, "throughput start");
                        start(guard, throughput);
                    }
                    Err(e) => {
                        warn!(%role, test_id = %throughput.test_id, error = %e, "rejecting start");
                    }
                }
            }
            Message::RestartExperiment(restart) => {
                if let Some(run) = slot.current() {
                    if run.test_id == restart.test_id && run.release(restart.round) {
                        info!(%role, test_id = %run.test_id, round = restart.round, "restart released");
                    }
                }
            }
            Message::AbortExperiment(abort) => {
                if let Some(run) = slot.current() {
                    if abort.matches(&run.test_id) && !run.is_aborted() {
                        warn!(%role, test_id = %run.test_id, reason = %abort.reason, "abort received");
                        run.abort();
                    }
                }
            }
            other => debug!(%role, service_type = other.service_type(), "ignoring message"),
        }
    }
    info!(%role, "message bus closed");
}

/// Polls a round loop and turns a panic inside it into an error, so the
/// role still unwinds its siblings and reports to Control.
pub async fn catch_panic<F>(round_loop: F) -> RunResult<()>
where
    F: Future<Output = RunResult<()>>,
{
    match AssertUnwindSafe(round_loop).catch_unwind().await {
        Ok(res) => res,
        Err(payload) => Err(anyhow!("round loop panicked: {}", panic_message(&*payload)).into()),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(msg) = payload.downcast_ref::<&'static str>() {
        msg
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg
    } else {
        "unknown panic"
    }
}

/// Logs a failed round loop and, when the failure is not a plain abort,
/// tells the other roles to unwind.
pub async fn unwind_on_error(
    bus: &dyn MessageBus,
    role: Role,
    test_id: &str,
    err: &ExperimentError,
) {
    if err.is_aborted() {
        warn!(%role, test_id, "experiment aborted");
    } else {
        error!(%role, test_id, error = %err, "experiment failed");
    }
    if err.broadcasts_abort() {
        let abort = AbortExperiment {
            test_id: Some(test_id.to_string()),
            reason: format!("{}: {}", role, err),
        };
        if let Err(e) = broadcast_abort(bus, abort).await {
            error!(%role, test_id, error = %e, "failed to broadcast abort");
        }
    }
}

/// Stores the full bundle under `<role>_<test_id>` and sends the summary
/// to Control.
pub async fn report_measurements(
    bus: &dyn MessageBus,
    results: &dyn ResultStore,
    role: Role,
    test_id: &str,
    bundle: Value,
    summary: Value,
) {
    let key = role.result_key(test_id);
    if let Err(e) = results.store(&key, &bundle).await {
        error!(%role, key, error = %e, "failed to store measurements");
    }
    let response = Message::ResponseMeasurements(ResponseMeasurements {
        test_id: test_id.to_string(),
        source_or_sink: role,
        measurements: summary,
    });
    if let Err(e) = bus.publish(Topic::Control, &response).await {
        error!(%role, test_id, error = %e, "failed to report measurements");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_release_is_monotonic() {
        let run = RoleRun::new("t");
        assert!(run.release(1));
        assert!(!run.release(1));
        assert!(!run.release(0));
        assert!(run.release(3));
        assert_eq!(run.released_round(), 3);
    }

    #[tokio::test]
    async fn test_wait_release() {
        let run = std::sync::Arc::new(RoleRun::new("t"));
        let waiter = run.clone();
        let handle = tokio::spawn(async move { waiter.wait_release(1).await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!handle.is_finished());
        run.release(1);
        assert!(handle.await.unwrap().is_ok());
        // already released rounds return at once
        assert!(run.wait_release(1).await.is_ok());
    }

    #[tokio::test]
    async fn test_catch_panic() {
        let res = catch_panic(async { panic!("delay out of range") }).await;
        match res {
            Err(err @ ExperimentError::Other(_)) => {
                assert!(err.broadcasts_abort());
                assert!(err.to_string().contains("delay out of range"));
            }
            other => panic!("unexpected {other:?}"),
        }

        assert!(catch_panic(async { Ok(()) }).await.is_ok());
        assert!(matches!(
            catch_panic(async { Err(ExperimentError::Aborted) }).await,
            Err(ExperimentError::Aborted)
        ));
    }

    #[tokio::test]
    async fn test_wait_release_aborts() {
        let run = RoleRun::new("t");
        run.abort();
        assert!(matches!(
            run.wait_release(1).await,
            Err(ExperimentError::Aborted)
        ));
    }
}
