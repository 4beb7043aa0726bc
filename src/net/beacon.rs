use crate::clock;
use crate::error::{ExperimentError, RunResult};
use async_trait::async_trait;
use core::net::SocketAddr;
use std::io;
use std::time::Duration;
use tokio::net::ToSocketAddrs as TokioToSocketAddrs;
use tokio::net::UdpSocket as TokioUdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use turmoil::ToSocketAddrs as TurmoilToSocketAddrs;
use turmoil::net::UdpSocket as TurmoilUdpSocket;

/// Payload the unit under test announces itself with. Control only cares
/// about the arrival time.
pub const BOOT_BEACON: &[u8] = b"BOOTED!";

#[async_trait]
pub trait BeaconSocket: Send + Sync + Sized {
    async fn bind<T: TokioToSocketAddrs + TurmoilToSocketAddrs + Send>(
        addr: T,
    ) -> io::Result<Self>;
    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)>;
    fn try_recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)>;
    async fn send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize>;
    fn local_addr(&self) -> io::Result<SocketAddr>;
}

#[async_trait]
impl BeaconSocket for TokioUdpSocket {
    async fn bind<T: TokioToSocketAddrs + TurmoilToSocketAddrs + Send>(
        addr: T,
    ) -> io::Result<Self> {
        TokioUdpSocket::bind(addr).await
    }

    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        TokioUdpSocket::recv_from(self, buf).await
    }

    fn try_recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        TokioUdpSocket::try_recv_from(self, buf)
    }

    async fn send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize> {
        TokioUdpSocket::send_to(self, buf, target).await
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        TokioUdpSocket::local_addr(self)
    }
}

#[async_trait]
impl BeaconSocket for TurmoilUdpSocket {
    async fn bind<T: TokioToSocketAddrs + TurmoilToSocketAddrs + Send>(
        addr: T,
    ) -> io::Result<Self> {
        TurmoilUdpSocket::bind(addr).await
    }

    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        TurmoilUdpSocket::recv_from(self, buf).await
    }

    fn try_recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        TurmoilUdpSocket::try_recv_from(self, buf)
    }

    async fn send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize> {
        TurmoilUdpSocket::send_to(self, buf, target).await
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        TurmoilUdpSocket::local_addr(self)
    }
}

#[derive(Debug, Clone)]
pub struct Beacon {
    pub from: SocketAddr,
    pub payload: Vec<u8>,
    pub timestamp: f64,
    pub unix_timestamp: f64,
}

/// Blocks until a single boot datagram arrives on `socket`.
pub async fn wait_for_beacon<S: BeaconSocket>(
    socket: &S,
    limit: Duration,
    cancel: &CancellationToken,
) -> RunResult<Beacon> {
    let mut buf = [0u8; 1024];
    let recv = socket.recv_from(&mut buf);
    tokio::select! {
        _ = cancel.cancelled() => Err(ExperimentError::Aborted),
        res = tokio::time::timeout(limit, recv) => {
            let Ok(res) = res else {
                return Err(ExperimentError::BootTimeout(limit));
            };
            let (n, from) = res?;
            let beacon = Beacon {
                from,
                payload: buf[..n].to_vec(),
                timestamp: clock::monotonic(),
                unix_timestamp: clock::unix(),
            };
            info!(%from, bytes = n, "boot beacon received");
            Ok(beacon)
        }
    }
}

/// Discards every datagram already queued on `socket` so a late or
/// duplicated beacon from the previous boot cannot satisfy the next wait.
/// Returns how many were dropped.
pub fn drain_stale<S: BeaconSocket>(socket: &S) -> io::Result<usize> {
    let mut buf = [0u8; 1024];
    let mut dropped = 0;
    loop {
        match socket.try_recv_from(&mut buf) {
            Ok((_, from)) => {
                debug!(%from, "dropping stale boot datagram");
                dropped += 1;
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(dropped),
            Err(e) => return Err(e),
        }
    }
}

/// Sends the boot datagram from a fresh ephemeral socket.
pub async fn announce_boot<S: BeaconSocket>(target: SocketAddr) -> io::Result<()> {
    let any: SocketAddr = if target.is_ipv4() {
        SocketAddr::from(([0, 0, 0, 0], 0))
    } else {
        SocketAddr::from(([0u16; 8], 0))
    };
    let socket = S::bind(any).await?;
    socket.send_to(BOOT_BEACON, target).await?;
    debug!(%target, "boot beacon sent");
    Ok(())
}
