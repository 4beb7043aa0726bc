use super::{Message, MessageBus, Subscription, Topic};
use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::trace;

/// In-process fan-out bus. Every subscriber of a topic sees every message
/// published to it after it subscribed.
#[derive(Clone, Default)]
pub struct MemoryBus {
    subscribers: Arc<DashMap<Topic, Vec<mpsc::UnboundedSender<Vec<u8>>>>>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publishes bytes as they are, bypassing the typed catalogue.
    pub fn publish_raw(&self, topic: Topic, bytes: Vec<u8>) {
        if let Some(mut subscribers) = self.subscribers.get_mut(&topic) {
            // closed subscriptions are pruned here
            subscribers.retain(|tx| tx.send(bytes.clone()).is_ok());
        }
    }
}

#[async_trait]
impl MessageBus for MemoryBus {
    async fn publish(&self, topic: Topic, message: &Message) -> Result<()> {
        trace!(%topic, service_type = message.service_type(), "publish");
        self.publish_raw(topic, message.to_bytes()?);
        Ok(())
    }

    async fn subscribe(&self, topic: Topic) -> Result<Subscription> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.entry(topic).or_default().push(tx);
        Ok(Subscription::new(rx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{AbortExperiment, broadcast_abort};
    use crate::error::MessageError;

    #[tokio::test]
    async fn test_fan_out() {
        let bus = MemoryBus::new();
        let mut a = bus.subscribe(Topic::Streams).await.unwrap();
        let mut b = bus.subscribe(Topic::Streams).await.unwrap();
        let mut control = bus.subscribe(Topic::Control).await.unwrap();
        broadcast_abort(
            &bus,
            AbortExperiment {
                test_id: Some("t".into()),
                reason: "test".into(),
            },
        )
        .await
        .unwrap();
        for sub in [&mut a, &mut b, &mut control] {
            let message = sub.next().await.unwrap().unwrap();
            assert!(matches!(message, Message::AbortExperiment(_)));
        }
    }

    #[tokio::test]
    async fn test_dropped_subscriber_pruned() {
        let bus = MemoryBus::new();
        let sub = bus.subscribe(Topic::Control).await.unwrap();
        drop(sub);
        bus.publish_raw(Topic::Control, b"{}".to_vec());
        assert!(bus.subscribers.get(&Topic::Control).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_malformed_surfaces_as_error() {
        let bus = MemoryBus::new();
        let mut sub = bus.subscribe(Topic::Control).await.unwrap();
        bus.publish_raw(
            Topic::Control,
            br#"{"service_type":"READY_FOR_RESTART","data":{}}"#.to_vec(),
        );
        assert!(matches!(
            sub.next().await.unwrap(),
            Err(MessageError::Malformed { .. })
        ));
    }
}
