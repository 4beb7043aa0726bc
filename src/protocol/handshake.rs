use crate::error::{ExperimentError, RunResult};
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

/// Writes `bytes` in full. Only cancellation interrupts the write.
pub async fn send_blocking<W: AsyncWrite + Unpin>(
    stream: &mut W,
    bytes: &[u8],
    cancel: &CancellationToken,
) -> RunResult<()> {
    tokio::select! {
        _ = cancel.cancelled() => Err(ExperimentError::Aborted),
        res = stream.write_all(bytes) => Ok(res?),
    }
}

/// Reads exactly `expected.len()` bytes and checks they spell the token.
pub async fn expect_token<R: AsyncRead + Unpin>(
    stream: &mut R,
    expected: &[u8],
    cancel: &CancellationToken,
) -> RunResult<()> {
    let mut buf = vec![0u8; expected.len()];
    tokio::select! {
        _ = cancel.cancelled() => return Err(ExperimentError::Aborted),
        res = stream.read_exact(&mut buf) => match res {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                return Err(ExperimentError::protocol(format!(
                    "peer closed while waiting for {:?}",
                    String::from_utf8_lossy(expected)
                )));
            }
            Err(e) => return Err(e.into()),
        },
    }
    if buf != expected {
        return Err(ExperimentError::protocol(format!(
            "expected {:?}, got {:?}",
            String::from_utf8_lossy(expected),
            String::from_utf8_lossy(&buf)
        )));
    }
    Ok(())
}
