use std::{
    collections::HashMap,
    future::Future,
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};

use bytes::Bytes;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::mpsc;

/// Payloads delivered for one subscribed topic, in broker delivery order.
///
/// The stream ends when the broker link goes away.
pub type Subscription = mpsc::UnboundedReceiver<Bytes>;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("invalid broker address '{address}': {reason}")]
    InvalidAddress { address: String, reason: String },
    #[error("failed to connect to broker: {0}")]
    Connect(#[source] rumqttc::ConnectionError),
    #[error("broker refused the connection: {0:?}")]
    Refused(rumqttc::ConnectReturnCode),
    #[error("no answer from broker within {0:?}")]
    ConnectTimeout(Duration),
    #[error("broker request failed: {0}")]
    Request(#[from] rumqttc::ClientError),
    #[error("broker rejected subscription to '{0}'")]
    SubscriptionRejected(String),
    #[error("broker connection closed")]
    Closed,
}

/// Publish/subscribe capability the relays are built on.
///
/// Implementations must be usable from both relays at once.
pub trait Broker: Send + Sync + 'static {
    /// Sends `payload` to `topic` at most once, without retain.
    fn publish(
        &self,
        topic: &str,
        payload: Bytes,
    ) -> impl Future<Output = Result<(), BrokerError>> + Send;

    /// Subscribes to `topic`, resolving once the broker has accepted it.
    fn subscribe(
        &self,
        topic: &str,
    ) -> impl Future<Output = Result<Subscription, BrokerError>> + Send;
}

/// In-process broker for tests and wiring without a network.
#[derive(Debug, Default)]
pub struct LocalBroker {
    topics: Mutex<HashMap<String, Vec<mpsc::UnboundedSender<Bytes>>>>,
    reject_publish: AtomicBool,
    reject_subscribe: AtomicBool,
}

impl LocalBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every following publish fail until switched back.
    pub fn reject_publishes(&self, reject: bool) {
        self.reject_publish.store(reject, Ordering::SeqCst);
    }

    pub fn reject_subscriptions(&self, reject: bool) {
        self.reject_subscribe.store(reject, Ordering::SeqCst);
    }

    /// Drops every subscription, as if the broker link had been cut.
    pub fn disconnect(&self) {
        self.topics.lock().clear();
    }

    fn deliver(&self, topic: &str, payload: Bytes) {
        let mut topics = self.topics.lock();
        if let Some(subscribers) = topics.get_mut(topic) {
            subscribers.retain(|subscriber| subscriber.send(payload.clone()).is_ok());
        }
    }
}

impl Broker for LocalBroker {
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), BrokerError> {
        if self.reject_publish.load(Ordering::SeqCst) {
            return Err(BrokerError::Closed);
        }
        self.deliver(topic, payload);
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<Subscription, BrokerError> {
        if self.reject_subscribe.load(Ordering::SeqCst) {
            return Err(BrokerError::SubscriptionRejected(topic.to_string()));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        self.topics
            .lock()
            .entry(topic.to_string())
            .or_default()
            .push(tx);
        Ok(rx)
    }
}
