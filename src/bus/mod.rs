pub mod memory;
pub mod message;
pub mod zookeeper;

pub use self::memory::MemoryBus;
pub use self::message::*;
pub use self::zookeeper::ZooKeeperBus;

use crate::error::MessageError;
use anyhow::Result;
use async_trait::async_trait;
use std::fmt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    /// Start, abort, ready-for-restart and measurement responses.
    Control,
    /// Throughput start, restart release and abort for Source and Sink.
    Streams,
}

impl Topic {
    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::Control => "control",
            Topic::Streams => "source-sink",
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// At-least-once publish/subscribe channel keyed by topic.
#[async_trait]
pub trait MessageBus: Send + Sync {
    async fn publish(&self, topic: Topic, message: &Message) -> Result<()>;
    async fn subscribe(&self, topic: Topic) -> Result<Subscription>;
}

/// Raw envelopes delivered to one subscriber, decoded on receipt.
pub struct Subscription {
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
    poller: Option<JoinHandle<()>>,
}

impl Subscription {
    pub(crate) fn new(rx: mpsc::UnboundedReceiver<Vec<u8>>) -> Self {
        Self { rx, poller: None }
    }

    pub(crate) fn with_poller(
        rx: mpsc::UnboundedReceiver<Vec<u8>>,
        poller: JoinHandle<()>,
    ) -> Self {
        Self {
            rx,
            poller: Some(poller),
        }
    }

    /// `None` once the bus side has gone away.
    pub async fn next(&mut self) -> Option<Result<Message, MessageError>> {
        let bytes = self.rx.recv().await?;
        Some(Message::from_bytes(&bytes))
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(poller) = self.poller.take() {
            poller.abort();
        }
    }
}

/// Tells every role to unwind.
pub async fn broadcast_abort(bus: &dyn MessageBus, abort: AbortExperiment) -> Result<()> {
    info!(test_id = ?abort.test_id, reason = %abort.reason, "broadcasting abort");
    let message = Message::AbortExperiment(abort);
    futures::future::try_join(
        bus.publish(Topic::Control, &message),
        bus.publish(Topic::Streams, &message),
    )
    .await?;
    Ok(())
}
