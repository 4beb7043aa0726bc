use super::{Message, MessageBus, Subscription, Topic};
use crate::config::BusSettings;
use crate::net::utils::my_name;
use anyhow::{Result, anyhow};
use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_zookeeper::*;
use tracing::{debug, info, warn};

/// Message bus on top of ZooKeeper.
///
/// Each topic is a persistent znode under `root`; every published message
/// becomes a persistent-sequential child. Subscribers poll the children and
/// deliver everything past their cursor in sequence order. A new
/// subscription starts at the newest existing message, so earlier traffic is
/// never replayed.
#[derive(Clone)]
pub struct ZooKeeperBus {
    client: ZooKeeper,
    root: String,
    poll_interval: Duration,
    origin: String,
}

impl ZooKeeperBus {
    pub async fn connect(settings: &BusSettings) -> Result<Self> {
        let (client, _default_watcher) = ZooKeeper::connect(&settings.zookeeper.parse()?)
            .await
            .map_err(|e| anyhow!("Failed to connect to zookeeper: {}", e))?;
        let bus = Self {
            client,
            root: settings.root.trim_end_matches('/').to_string(),
            poll_interval: settings.poll_interval,
            origin: my_name().unwrap_or_else(|_| "unknown".to_string()),
        };
        bus.ensure_node(&bus.root).await?;
        for topic in [Topic::Control, Topic::Streams] {
            bus.ensure_node(&bus.topic_path(topic)).await?;
        }
        info!(zookeeper = %settings.zookeeper, root = %bus.root, "connected message bus");
        Ok(bus)
    }

    fn topic_path(&self, topic: Topic) -> String {
        format!("{}/{}", self.root, topic)
    }

    async fn ensure_node(&self, path: &str) -> Result<()> {
        let res = self
            .client
            .create(path, &b""[..], Acl::open_unsafe(), CreateMode::Persistent)
            .await?;
        match res {
            Err(error::Create::NodeExists) => {
                debug!(path, "node already exists, skipping");
                Ok(())
            }
            _ => {
                res.map_err(|e| anyhow!("Failed to create {}: {}", path, e))?;
                Ok(())
            }
        }
    }

    async fn sorted_children(client: &ZooKeeper, path: &str) -> Result<Vec<String>> {
        let Some(mut children) = client.get_children(path).await? else {
            return Err(anyhow!("topic node {} doesn't exist", path));
        };
        // sequence suffixes are zero padded
        children.sort();
        Ok(children)
    }

    async fn poll(
        client: ZooKeeper,
        path: String,
        mut cursor: Option<String>,
        interval: Duration,
        tx: mpsc::UnboundedSender<Vec<u8>>,
    ) {
        loop {
            if tx.is_closed() {
                return;
            }
            match Self::sorted_children(&client, &path).await {
                Ok(children) => {
                    for child in children {
                        if cursor.as_ref().is_some_and(|c| &child <= c) {
                            continue;
                        }
                        match client.get_data(&format!("{}/{}", path, child)).await {
                            Ok(Some((data, _))) => {
                                if tx.send(data).is_err() {
                                    return;
                                }
                            }
                            // Deleted in between get_children and get_data
                            Ok(None) => {}
                            Err(e) => {
                                warn!(%path, %child, error = %e, "failed to read message");
                                break;
                            }
                        }
                        cursor = Some(child);
                    }
                }
                Err(e) => warn!(%path, error = %e, "failed to list messages"),
            }
            tokio::time::sleep(interval).await;
        }
    }
}

#[async_trait]
impl MessageBus for ZooKeeperBus {
    async fn publish(&self, topic: Topic, message: &Message) -> Result<()> {
        let node = self
            .client
            .create(
                &format!("{}/msg-", self.topic_path(topic)),
                message.to_bytes()?,
                Acl::open_unsafe(),
                CreateMode::PersistentSequential,
            )
            .await?
            .map_err(|e| anyhow!("Failed to publish on {}: {}", topic, e))?;
        debug!(
            %topic,
            %node,
            origin = %self.origin,
            service_type = message.service_type(),
            "published"
        );
        Ok(())
    }

    async fn subscribe(&self, topic: Topic) -> Result<Subscription> {
        let path = self.topic_path(topic);
        let cursor = Self::sorted_children(&self.client, &path).await?.pop();
        let (tx, rx) = mpsc::unbounded_channel();
        let poller = tokio::spawn(Self::poll(
            self.client.clone(),
            path,
            cursor,
            self.poll_interval,
            tx,
        ));
        Ok(Subscription::with_poller(rx, poller))
    }
}
