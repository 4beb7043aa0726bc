//! Emulated unit under test.
//!
//! Behaves like the real operator images on the wire: announces its boot
//! over UDP, pulls tuples from Source, forwards the ones its operator keeps
//! to Sink and relays the control tokens.

use crate::clock;
use crate::experiment::Operator;
use crate::net::announce_boot;
use crate::protocol::{self, ACK, DONE, Frame, SEND_TUPLES, TupleFormat};
use anyhow::{Context, Result, anyhow};
use core::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};

const CONNECT_RETRY: Duration = Duration::from_millis(50);
const CONNECT_ATTEMPTS: u32 = 600;

/// Captured serial console of one emulated VM.
#[derive(Debug, Clone, Default)]
pub struct Console(Arc<Mutex<String>>);

impl Console {
    pub fn line(&self, line: impl AsRef<str>) {
        let mut log = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        log.push_str(line.as_ref());
        log.push('\n');
    }

    pub fn contents(&self) -> String {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

#[derive(Debug, Clone)]
pub struct UnitConfig {
    pub control: SocketAddr,
    pub source: SocketAddr,
    pub sink: SocketAddr,
    pub tuple_format: TupleFormat,
    pub operator: Operator,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct UnitReport {
    pub received: u64,
    pub forwarded: u64,
    pub backpressure_acks: u64,
}

async fn connect_retry(addr: SocketAddr) -> Result<TcpStream> {
    let mut last = None;
    for _ in 0..CONNECT_ATTEMPTS {
        match TcpStream::connect(addr).await {
            Ok(stream) => return Ok(stream),
            Err(e) => last = Some(e),
        }
        tokio::time::sleep(CONNECT_RETRY).await;
    }
    Err(anyhow!("could not reach {}: {:?}", addr, last))
}

fn keeps(operator: Operator, tuple: &protocol::Tuple) -> bool {
    match operator {
        Operator::Filter => tuple.passes_filter(),
        Operator::Map | Operator::Average | Operator::Identity => true,
    }
}

/// Boots once: beacon, one stream from Source to Sink, then returns.
pub async fn run_unit(config: UnitConfig, console: Console) -> Result<UnitReport> {
    console.line("booting");
    announce_boot::<UdpSocket>(config.control)
        .await
        .context("sending boot beacon")?;
    console.line("BOOTED!");

    let mut sink = connect_retry(config.sink).await?;
    let mut source = connect_retry(config.source).await?;
    console.line(format!("connected source {} sink {}", config.source, config.sink));
    source.write_all(SEND_TUPLES).await?;

    let mut decoder = protocol::decoder(config.tuple_format, false);
    let mut report = UnitReport::default();
    let mut buf = vec![0u8; 4096];
    let mut out = Vec::new();
    loop {
        let n = source.read(&mut buf).await?;
        if n == 0 {
            console.line("source closed the connection");
            return Err(anyhow!("source closed before DONE"));
        }
        decoder.feed(&buf[..n]);
        while let Some(frame) = decoder.next_frame()? {
            match frame {
                Frame::Tuple(tuple) => {
                    report.received += 1;
                    if keeps(config.operator, &tuple) {
                        let tuple = match config.tuple_format {
                            TupleFormat::Json => tuple.with_ts(clock::unix_millis()),
                            TupleFormat::Binary => tuple,
                        };
                        tuple.encode(config.tuple_format, &mut out);
                        report.forwarded += 1;
                    }
                }
                Frame::Back => {
                    sink.write_all(&out).await?;
                    out.clear();
                    source.write_all(ACK).await?;
                    report.backpressure_acks += 1;
                }
                Frame::Done => {
                    sink.write_all(&out).await?;
                    sink.write_all(DONE).await?;
                    let mut ack = [0u8; 3];
                    sink.read_exact(&mut ack).await?;
                    if &ack[..] != ACK {
                        return Err(anyhow!("sink answered {:?}", String::from_utf8_lossy(&ack)));
                    }
                    source.write_all(ACK).await?;
                    console.line(format!(
                        "done: received {} forwarded {}",
                        report.received, report.forwarded
                    ));
                    return Ok(report);
                }
            }
        }
        if !out.is_empty() {
            sink.write_all(&out).await?;
            out.clear();
        }
    }
}
