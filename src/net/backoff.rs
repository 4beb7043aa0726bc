use std::io;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub const BACKOFF_START: Duration = Duration::from_micros(1);
/// The delay stops doubling after this many consecutive stalls.
pub const BACKOFF_MAX_DOUBLINGS: u32 = 20;

/// Exponential backoff for non-blocking socket operations.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    current: Duration,
    max_doublings: u32,
    stalls: u32,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(BACKOFF_START, BACKOFF_MAX_DOUBLINGS)
    }
}

impl Backoff {
    pub fn new(initial: Duration, max_doublings: u32) -> Self {
        Self {
            initial,
            current: initial,
            max_doublings,
            stalls: 0,
        }
    }

    /// Consecutive stalls since the last reset.
    pub fn stalls(&self) -> u32 {
        self.stalls
    }

    /// Registers a stall and returns how long to wait before retrying.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.stalls += 1;
        if self.stalls <= self.max_doublings {
            self.current = self.current.saturating_mul(2);
        }
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
        self.stalls = 0;
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum Attempt<T> {
    Ready(T),
    /// The operation would block `limit` times in a row.
    Exhausted(u32),
    Cancelled,
}

/// Retries a non-blocking operation while it reports `WouldBlock`.
///
/// Each stall is passed to `on_stall` with the consecutive stall count,
/// then the task sleeps for the next backoff delay. The sleep is cut short
/// when `cancel` fires. Once `limit` consecutive stalls have been seen the
/// combinator gives up with [`Attempt::Exhausted`] and leaves the backoff
/// state untouched so the caller can decide whether to reset it.
pub async fn retry_with_backoff<T, F, S>(
    cancel: &CancellationToken,
    backoff: &mut Backoff,
    limit: u32,
    mut op: F,
    mut on_stall: S,
) -> io::Result<Attempt<T>>
where
    F: FnMut() -> io::Result<T>,
    S: FnMut(u32),
{
    loop {
        if cancel.is_cancelled() {
            return Ok(Attempt::Cancelled);
        }
        match op() {
            Ok(value) => {
                backoff.reset();
                return Ok(Attempt::Ready(value));
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                if backoff.stalls() >= limit {
                    return Ok(Attempt::Exhausted(backoff.stalls()));
                }
                let delay = backoff.next_delay();
                on_stall(backoff.stalls());
                tokio::select! {
                    _ = cancel.cancelled() => return Ok(Attempt::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn test_backoff_doubles_then_caps() {
        let mut backoff = Backoff::new(Duration::from_micros(1), 3);
        let delays: Vec<_> = (0..6).map(|_| backoff.next_delay()).collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_micros(1),
                Duration::from_micros(2),
                Duration::from_micros(4),
                Duration::from_micros(8),
                Duration::from_micros(8),
                Duration::from_micros(8),
            ]
        );
        assert_eq!(backoff.stalls(), 6);
        backoff.reset();
        assert_eq!(backoff.stalls(), 0);
        assert_eq!(backoff.next_delay(), Duration::from_micros(1));
    }

    #[tokio::test]
    async fn test_retry_ready_after_stalls() {
        let cancel = CancellationToken::new();
        let mut backoff = Backoff::default();
        let mut calls = 0;
        let mut seen = Vec::new();
        let res = retry_with_backoff(
            &cancel,
            &mut backoff,
            20,
            || {
                calls += 1;
                if calls < 4 {
                    Err(io::ErrorKind::WouldBlock.into())
                } else {
                    Ok(calls)
                }
            },
            |n| seen.push(n),
        )
        .await
        .unwrap();
        assert_eq!(res, Attempt::Ready(4));
        assert_eq!(seen, vec![1, 2, 3]);
        assert_eq!(backoff.stalls(), 0);
    }

    #[tokio::test]
    async fn test_retry_exhausts_at_limit() {
        let cancel = CancellationToken::new();
        let mut backoff = Backoff::default();
        let res: Attempt<()> = retry_with_backoff(
            &cancel,
            &mut backoff,
            5,
            || Err(io::ErrorKind::WouldBlock.into()),
            |_| {},
        )
        .await
        .unwrap();
        assert_eq!(res, Attempt::Exhausted(5));
    }

    #[tokio::test]
    async fn test_retry_propagates_hard_errors() {
        let cancel = CancellationToken::new();
        let mut backoff = Backoff::default();
        let res: io::Result<Attempt<()>> = retry_with_backoff(
            &cancel,
            &mut backoff,
            5,
            || Err(io::ErrorKind::ConnectionReset.into()),
            |_| {},
        )
        .await;
        assert_eq!(res.unwrap_err().kind(), io::ErrorKind::ConnectionReset);
    }

    #[tokio::test]
    async fn test_cancel_interrupts_sleep() {
        let cancel = CancellationToken::new();
        // Long enough that only cancellation can end the wait.
        let mut backoff = Backoff::new(Duration::from_secs(60), 0);
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });
        let started = Instant::now();
        let res: Attempt<()> = retry_with_backoff(
            &cancel,
            &mut backoff,
            u32::MAX,
            || Err(io::ErrorKind::WouldBlock.into()),
            |_| {},
        )
        .await
        .unwrap();
        assert_eq!(res, Attempt::Cancelled);
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
