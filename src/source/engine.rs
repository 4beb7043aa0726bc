use super::measurements::SourceRound;
use crate::clock;
use crate::error::{ExperimentError, RunResult};
use crate::experiment::StreamParams;
use crate::net::{Attempt, Backoff, retry_with_backoff};
use crate::protocol::{ACK, BACK, DONE, SEND_TUPLES, Tuple, expect_token, send_blocking};
use std::io;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Consecutive would-block sends before asking the unit to drain.
pub const BACKPRESSURE_STALLS: u32 = 20;
/// Delays below this are not worth a sleep.
pub const DELAY_FLOOR: f64 = 0.0001;
/// A ramp below 1 grows the delay without bound; pin it here.
pub const DELAY_CEILING: f64 = 60.0;

/// Streams a dataset to one connected unit under test.
pub struct SourceEngine<'a> {
    pub dataset: &'a [Tuple],
    pub params: &'a StreamParams,
    pub cancel: &'a CancellationToken,
    pub backpressure_stalls: u32,
}

/// Tuples/s between stalls, logged on the first stall of a burst.
struct Progress {
    mark: Instant,
    sent_at_mark: u64,
    total: u64,
}

impl Progress {
    fn stall(&mut self, sent: u64) {
        let elapsed = self.mark.elapsed().as_secs_f64();
        let burst = sent - self.sent_at_mark;
        if elapsed > 0.0 && burst > 0 {
            let tps = burst as f64 / elapsed;
            let percent = 100.0 * sent as f64 / self.total.max(1) as f64;
            info!(tps = tps.round() as u64, percent = %format!("{:.1}", percent), "send stalled");
        }
        self.mark = Instant::now();
        self.sent_at_mark = sent;
    }
}

impl<'a> SourceEngine<'a> {
    pub fn new(
        dataset: &'a [Tuple],
        params: &'a StreamParams,
        cancel: &'a CancellationToken,
    ) -> Self {
        Self {
            dataset,
            params,
            cancel,
            backpressure_stalls: BACKPRESSURE_STALLS,
        }
    }

    fn check_cancel(&self) -> RunResult<()> {
        if self.cancel.is_cancelled() {
            return Err(ExperimentError::Aborted);
        }
        Ok(())
    }

    /// Runs one round over an accepted connection, filling `record` as it
    /// goes so a failed round still reports what it managed to send.
    pub async fn run(&self, stream: &mut TcpStream, record: &mut SourceRound) -> RunResult<()> {
        expect_token(stream, SEND_TUPLES, self.cancel).await?;
        debug!("unit asked for tuples");

        let batch = self.params.batch_size.max(1) as usize;
        let packets = self.dataset.len() / batch;
        let total = packets as u64 * batch as u64 * u64::from(self.params.iterations);
        let mut progress = Progress {
            mark: Instant::now(),
            sent_at_mark: 0,
            total,
        };
        let mut backoff = Backoff::default();
        let mut packet = Vec::with_capacity(batch * crate::protocol::FRAME_LEN);
        let mut ids = Vec::with_capacity(batch);
        let mut delay = self.params.delay;
        let decay = 1.0 / self.params.ramp_factor;
        let mut next_id: i32 = 0;

        for _ in 0..self.params.iterations {
            for chunk in self.dataset.chunks_exact(batch) {
                self.check_cancel()?;
                packet.clear();
                ids.clear();
                for tuple in chunk {
                    let tuple = tuple.with_id(next_id);
                    next_id = next_id.wrapping_add(1);
                    tuple.encode(self.params.tuple_format, &mut packet);
                    ids.push((tuple.b, tuple.passes_filter()));
                }

                self.send_packet(stream, &packet, &mut backoff, &mut progress, record)
                    .await?;
                let now = clock::unix();
                for &(id, passes) in &ids {
                    record.record_sent(id, passes, self.params.sample_rate, now);
                }

                delay = (delay * decay).min(DELAY_CEILING);
                if delay >= DELAY_FLOOR {
                    let pause = Duration::try_from_secs_f64(delay).map_err(|_| {
                        ExperimentError::protocol(format!("unusable inter-packet delay {delay}"))
                    })?;
                    tokio::select! {
                        _ = self.cancel.cancelled() => return Err(ExperimentError::Aborted),
                        _ = tokio::time::sleep(pause) => {}
                    }
                }
            }
        }

        send_blocking(stream, DONE, self.cancel).await?;
        record.done_timestamp = Some(clock::monotonic());
        expect_token(stream, ACK, self.cancel).await?;
        record.ack_timestamp = Some(clock::monotonic());
        info!(
            sent = record.number_of_tuples_sent,
            passing = record.number_of_tuples_passing_the_filter,
            "round streamed"
        );
        Ok(())
    }

    async fn send_packet(
        &self,
        stream: &mut TcpStream,
        packet: &[u8],
        backoff: &mut Backoff,
        progress: &mut Progress,
        record: &mut SourceRound,
    ) -> RunResult<()> {
        let mut offset = 0;
        while offset < packet.len() {
            let sent = record.number_of_tuples_sent;
            let attempt = retry_with_backoff(
                self.cancel,
                backoff,
                self.backpressure_stalls,
                || stream.try_write(&packet[offset..]),
                |stalls| {
                    if stalls == 1 {
                        progress.stall(sent);
                    }
                },
            )
            .await?;
            match attempt {
                Attempt::Ready(0) => {
                    return Err(io::Error::from(io::ErrorKind::WriteZero).into());
                }
                Attempt::Ready(n) => offset += n,
                Attempt::Exhausted(stalls) => {
                    debug!(stalls, "escalating to backpressure handshake");
                    // Finish the frame first so BACK lands on a boundary.
                    send_blocking(stream, &packet[offset..], self.cancel).await?;
                    offset = packet.len();
                    let requested = clock::monotonic();
                    send_blocking(stream, BACK, self.cancel).await?;
                    expect_token(stream, ACK, self.cancel).await?;
                    record
                        .backpressure_timestamps
                        .push((requested, clock::monotonic()));
                    backoff.reset();
                }
                Attempt::Cancelled => return Err(ExperimentError::Aborted),
            }
        }
        Ok(())
    }
}
