//! [`Broker`] backed by an MQTT 3.1.1 connection.
//!
//! `rumqttc` only makes progress while its event loop is polled, so after the
//! initial CONNACK the loop is moved into a dispatcher task. The dispatcher
//! routes incoming PUBLISH packets to the matching subscription channel and
//! resolves pending subscriptions as SUBACKs arrive. When the connection
//! fails the dispatcher stops for good: no reconnect, later publishes fail and
//! subscriptions end.

use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
    time::Duration,
};

use bytes::Bytes;
use parking_lot::Mutex;
use rand::Rng;
use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Packet, QoS, SubAck,
    SubscribeReasonCode,
};
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tracing::{debug, info, trace, warn};
use url::Url;

use crate::broker::{Broker, BrokerError, Subscription};

pub const DEFAULT_PORT: u16 = 1883;
pub const DEFAULT_KEEP_ALIVE: Duration = Duration::from_secs(30);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const REQUEST_CAPACITY: usize = 64;
// Fixed header, topic name and packet id on top of the payload.
const PACKET_OVERHEAD: usize = 64 * 1024 + 8;
// Largest remaining length MQTT can encode, plus the fixed header.
const PROTOCOL_MAX_PACKET: usize = 268_435_455 + 5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerAddress {
    pub host: String,
    pub port: u16,
}

impl BrokerAddress {
    /// Parses `tcp://host[:port]` or `mqtt://host[:port]`.
    pub fn parse(address: &str) -> Result<Self, BrokerError> {
        let invalid = |reason: String| BrokerError::InvalidAddress {
            address: address.to_string(),
            reason,
        };

        let url = Url::parse(address).map_err(|err| invalid(err.to_string()))?;
        match url.scheme() {
            "tcp" | "mqtt" => {}
            other => return Err(invalid(format!("unsupported scheme '{other}'"))),
        }

        let host = url
            .host_str()
            .filter(|host| !host.is_empty())
            .ok_or_else(|| invalid("missing host".to_string()))?;

        Ok(Self {
            host: host.to_string(),
            port: url.port().unwrap_or(DEFAULT_PORT),
        })
    }
}

#[derive(Debug, Clone)]
pub struct MqttSettings {
    pub address: BrokerAddress,
    pub client_id: String,
    pub keep_alive: Duration,
    /// Largest payload this client publishes.
    pub max_payload: usize,
}

/// Client id used when none is configured: `soqtt-<random>`.
pub fn generated_client_id() -> String {
    let suffix = rand::thread_rng().gen_range(0..i32::MAX);
    format!("soqtt-{suffix}")
}

pub struct MqttBroker {
    client: AsyncClient,
    routes: Arc<Routes>,
    dispatcher: JoinHandle<()>,
}

impl MqttBroker {
    /// Opens the connection and waits for the broker's CONNACK.
    pub async fn connect(settings: MqttSettings) -> Result<Self, BrokerError> {
        let MqttSettings {
            address,
            client_id,
            keep_alive,
            max_payload,
        } = settings;

        // An oversized incoming packet is a decode error that ends the
        // connection, so incoming is only capped by the protocol. The size
        // limit for inbound payloads is applied per message by the relay.
        let outgoing_limit = max_payload.saturating_add(PACKET_OVERHEAD);
        let mut options = MqttOptions::new(client_id.clone(), address.host.clone(), address.port);
        options
            .set_keep_alive(keep_alive)
            .set_clean_session(true)
            .set_max_packet_size(PROTOCOL_MAX_PACKET, outgoing_limit);

        let (client, mut eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);

        tokio::time::timeout(CONNECT_TIMEOUT, await_connack(&mut eventloop))
            .await
            .map_err(|_| BrokerError::ConnectTimeout(CONNECT_TIMEOUT))??;

        info!(host = %address.host, port = address.port, %client_id, "connected to broker");

        let routes = Arc::new(Routes::default());
        let dispatcher = tokio::spawn(dispatch(eventloop, Arc::clone(&routes)));

        Ok(Self {
            client,
            routes,
            dispatcher,
        })
    }
}

impl Drop for MqttBroker {
    fn drop(&mut self) {
        self.dispatcher.abort();
    }
}

impl Broker for MqttBroker {
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), BrokerError> {
        self.client
            .publish_bytes(topic, QoS::AtMostOnce, false, payload)
            .await?;
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<Subscription, BrokerError> {
        let (ack_tx, ack_rx) = oneshot::channel();
        let (tx, rx) = mpsc::unbounded_channel();

        // Registered before the request goes out so the SUBACK cannot overtake it.
        self.routes.register(topic, tx, ack_tx)?;

        if let Err(err) = self.client.subscribe(topic, QoS::AtMostOnce).await {
            drop(ack_rx);
            self.routes.abandon(topic);
            return Err(err.into());
        }

        match ack_rx.await {
            Ok(true) => Ok(rx),
            Ok(false) => {
                self.routes.abandon(topic);
                Err(BrokerError::SubscriptionRejected(topic.to_string()))
            }
            Err(_) => Err(BrokerError::Closed),
        }
    }
}

async fn await_connack(eventloop: &mut EventLoop) -> Result<(), BrokerError> {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                return match ack.code {
                    ConnectReturnCode::Success => Ok(()),
                    code => Err(BrokerError::Refused(code)),
                };
            }
            Ok(_) => {}
            Err(err) => return Err(BrokerError::Connect(err)),
        }
    }
}

async fn dispatch(mut eventloop: EventLoop, routes: Arc<Routes>) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                routes.deliver(&publish.topic, publish.payload);
            }
            Ok(Event::Incoming(Packet::SubAck(ack))) => routes.acknowledge(&ack),
            Ok(Event::Incoming(Packet::Disconnect)) => {
                warn!("broker closed the session");
                break;
            }
            Ok(event) => trace!(?event, "broker event"),
            Err(err) => {
                warn!(error = %err, "broker connection lost");
                break;
            }
        }
    }

    routes.close();
}

/// Subscription bookkeeping shared between the client handle and the dispatcher.
#[derive(Default)]
struct Routes {
    table: Mutex<RouteTable>,
}

#[derive(Default)]
struct RouteTable {
    subscribers: HashMap<String, mpsc::UnboundedSender<Bytes>>,
    // SUBACKs come back in request order.
    pending: VecDeque<oneshot::Sender<bool>>,
    closed: bool,
}

impl Routes {
    fn register(
        &self,
        topic: &str,
        subscriber: mpsc::UnboundedSender<Bytes>,
        ack: oneshot::Sender<bool>,
    ) -> Result<(), BrokerError> {
        let mut table = self.table.lock();
        if table.closed {
            return Err(BrokerError::Closed);
        }
        table.subscribers.insert(topic.to_string(), subscriber);
        table.pending.push_back(ack);
        Ok(())
    }

    fn abandon(&self, topic: &str) {
        let mut table = self.table.lock();
        table.subscribers.remove(topic);
        table.pending.retain(|ack| !ack.is_closed());
    }

    fn acknowledge(&self, ack: &SubAck) {
        let accepted = ack
            .return_codes
            .iter()
            .all(|code| matches!(code, SubscribeReasonCode::Success(_)));

        let waiter = self.table.lock().pending.pop_front();
        match waiter {
            Some(waiter) => {
                let _ = waiter.send(accepted);
            }
            None => debug!(pkid = ack.pkid, "suback without a pending subscription"),
        }
    }

    fn deliver(&self, topic: &str, payload: Bytes) {
        let mut table = self.table.lock();
        let Some(subscriber) = table.subscribers.get(topic) else {
            debug!(topic, "publish for a topic nobody subscribed to");
            return;
        };
        if subscriber.send(payload).is_err() {
            table.subscribers.remove(topic);
        }
    }

    fn close(&self) {
        let mut table = self.table.lock();
        table.closed = true;
        table.subscribers.clear();
        table.pending.clear();
    }
}
