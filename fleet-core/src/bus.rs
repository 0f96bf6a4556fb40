use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_stream::{Stream, StreamExt, wrappers::BroadcastStream};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QoS {
    AtMostOnce,
    #[default]
    AtLeastOnce,
}

/// Per-publish options. Commands go out at least once; state and status are
/// retained so late subscribers see the last snapshot.
#[derive(Debug, Clone, Copy, Default)]
pub struct PublishOpts {
    pub qos: QoS,
    pub retain: bool,
}

impl PublishOpts {
    pub fn command() -> Self {
        Self { qos: QoS::AtLeastOnce, retain: false }
    }

    pub fn retained() -> Self {
        Self { qos: QoS::AtLeastOnce, retain: true }
    }
}

#[derive(Debug, Clone)]
pub struct Message {
    pub topic: String,
    pub payload: Bytes,
}

#[async_trait]
pub trait Bus: Send + Sync {
    async fn publish(&self, topic: &str, payload: Bytes, opts: PublishOpts) -> Result<()>;
    async fn subscribe(
        &self,
        pattern: &str,
    ) -> Result<Box<dyn Stream<Item = Message> + Unpin + Send>>;

    /// Whether the underlying transport is usable; feeds `/readyz`.
    fn healthy(&self) -> bool {
        true
    }
}

#[derive(Clone)]
pub struct InMemoryBus {
    tx: Arc<broadcast::Sender<Message>>,
}

impl Default for InMemoryBus {
    fn default() -> Self {
        let (tx, _rx) = broadcast::channel(1024);
        Self { tx: Arc::new(tx) }
    }
}

#[async_trait]
impl Bus for InMemoryBus {
    async fn publish(&self, topic: &str, payload: Bytes, _opts: PublishOpts) -> Result<()> {
        let _ = self.tx.send(Message { topic: topic.to_string(), payload });
        Ok(())
    }

    async fn subscribe(
        &self,
        pattern: &str,
    ) -> Result<Box<dyn Stream<Item = Message> + Unpin + Send>> {
        let rx = self.tx.subscribe();
        let pattern = pattern.to_string();
        let stream = BroadcastStream::new(rx).filter_map(move |item| match item {
            Ok(msg) if topic_matches(&pattern, &msg.topic) => Some(msg),
            _ => None,
        });
        Ok(Box::new(stream))
    }
}

/// MQTT-style wildcard matching: `+` matches one level, a trailing `#`
/// matches the rest.
pub fn topic_matches(pattern: &str, topic: &str) -> bool {
    let mut pat = pattern.split('/');
    let mut top = topic.split('/');
    loop {
        match (pat.next(), top.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => continue,
            (Some(p), Some(t)) if p == t => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}
