use super::measurements::{SinkRound, Termination};
use crate::clock;
use crate::error::{ExperimentError, RunResult};
use crate::experiment::StreamParams;
use crate::net::{Attempt, Backoff, retry_with_backoff};
use crate::protocol::{self, ACK, Frame, send_blocking};
use core::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Consecutive empty reads before the connection counts as stalled.
pub const STALL_LIMIT: u32 = 30;
pub const ACCEPT_POLL: Duration = Duration::from_millis(500);
pub const RECV_CHUNK: usize = 2000;

/// Accepts one connection, looking at `cancel` between polls.
pub async fn accept(
    listener: &TcpListener,
    cancel: &CancellationToken,
) -> RunResult<(TcpStream, SocketAddr)> {
    loop {
        if cancel.is_cancelled() {
            return Err(ExperimentError::Aborted);
        }
        if let Ok(res) = tokio::time::timeout(ACCEPT_POLL, listener.accept()).await {
            return Ok(res?);
        }
    }
}

/// Consumes the tuples the unit forwards until the end-of-stream sentinel.
pub struct SinkEngine<'a> {
    pub params: &'a StreamParams,
    pub cancel: &'a CancellationToken,
    pub stall_limit: u32,
}

impl<'a> SinkEngine<'a> {
    pub fn new(params: &'a StreamParams, cancel: &'a CancellationToken) -> Self {
        Self {
            params,
            cancel,
            stall_limit: STALL_LIMIT,
        }
    }

    pub async fn run(
        &self,
        stream: &mut TcpStream,
        record: &mut SinkRound,
    ) -> RunResult<Termination> {
        let mut decoder = protocol::decoder(self.params.tuple_format, true);
        let mut backoff = Backoff::default();
        let mut buf = vec![0u8; RECV_CHUNK];

        loop {
            let attempt = retry_with_backoff(
                self.cancel,
                &mut backoff,
                self.stall_limit,
                || stream.try_read(&mut buf),
                |_| {},
            )
            .await?;
            let n = match attempt {
                Attempt::Ready(0) => {
                    warn!(
                        received = record.number_of_tuples_recv,
                        pending = decoder.pending(),
                        "unit closed the connection before DONE"
                    );
                    return Ok(Termination::Closed);
                }
                Attempt::Ready(n) => n,
                Attempt::Exhausted(stalls) => {
                    warn!(
                        stalls,
                        received = record.number_of_tuples_recv,
                        "connection stalled, ending round"
                    );
                    return Ok(Termination::Stalled);
                }
                Attempt::Cancelled => return Err(ExperimentError::Aborted),
            };

            decoder.feed(&buf[..n]);
            let now = clock::unix();
            while let Some(frame) = decoder.next_frame()? {
                match frame {
                    Frame::Tuple(tuple) => {
                        record.record_recv(&tuple, self.params.sample_rate, now)
                    }
                    Frame::Back => {
                        debug!("unit requested backpressure ack");
                        send_blocking(stream, ACK, self.cancel).await?;
                    }
                    Frame::Done => {
                        record.done_timestamp = Some(clock::monotonic());
                        send_blocking(stream, ACK, self.cancel).await?;
                        info!(received = record.number_of_tuples_recv, "round received");
                        return Ok(Termination::Done);
                    }
                }
            }
        }
    }
}
