//! Startup ordering and lifetime of one socket/broker pairing.

use std::{future::Future, path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::UnixStream,
    task::JoinHandle,
};
use tracing::{Instrument, error, info, info_span, warn};

use crate::{
    broker::{Broker, BrokerError},
    framing::FramingOptions,
    inbound::InboundRelay,
    mqtt::{MqttBroker, MqttSettings},
    outbound::OutboundRelay,
    topic::TopicPair,
};

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub socket: PathBuf,
    /// Broker URI as given on the command line, for logging.
    pub broker_uri: String,
    pub mqtt: MqttSettings,
    pub topics: TopicPair,
    pub framing: FramingOptions,
}

/// Connects to the broker, then the socket, and relays until Ctrl-C.
///
/// Every error returned from here happened during startup.
pub async fn run(config: BridgeConfig) -> Result<()> {
    let BridgeConfig {
        socket,
        broker_uri,
        mqtt,
        topics,
        framing,
    } = config;

    info!(
        socket = %socket.display(),
        broker = %broker_uri,
        in_topic = %topics.inbound,
        out_topic = %topics.outbound,
        "settings"
    );

    let broker = MqttBroker::connect(mqtt)
        .await
        .with_context(|| format!("failed to connect to broker {broker_uri}"))?;

    let stream = UnixStream::connect(&socket)
        .await
        .with_context(|| format!("failed to open socket {}", socket.display()))?;
    info!(socket = %socket.display(), "connected to socket");

    let (reader, writer) = stream.into_split();
    let bridge = Bridge::start(Arc::new(broker), reader, writer, &topics, framing)
        .await
        .with_context(|| format!("failed to subscribe to {}", topics.inbound))?;

    bridge.run_until_ctrl_c().await;
    Ok(())
}

/// Both relay tasks of a running bridge. Dropping it stops them.
pub struct Bridge {
    outbound: JoinHandle<()>,
    inbound: JoinHandle<()>,
}

impl Bridge {
    /// Subscribes the inbound topic, then spawns both relays.
    ///
    /// Nothing is spawned when the subscription fails.
    pub async fn start<B, R, W>(
        broker: Arc<B>,
        reader: R,
        writer: W,
        topics: &TopicPair,
        framing: FramingOptions,
    ) -> Result<Self, BrokerError>
    where
        B: Broker,
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let inbound = InboundRelay::subscribe(
            broker.as_ref(),
            &topics.inbound,
            framing.max_message_size,
        )
        .await?;
        let outbound = OutboundRelay::new(broker, topics.outbound.clone(), framing);

        let outbound_span = info_span!("outbound", topic = %topics.outbound);
        let outbound = tokio::spawn(
            async move {
                match outbound.run(reader).await {
                    Ok(()) => info!("socket closed, outbound relay stopped"),
                    Err(err) => error!(error = %err, "socket read failed, outbound relay stopped"),
                }
            }
            .instrument(outbound_span),
        );

        let inbound_span = info_span!("inbound", topic = %topics.inbound);
        let inbound = tokio::spawn(inbound.run(writer).instrument(inbound_span));

        Ok(Self { outbound, inbound })
    }

    pub async fn run_until<F>(self, shutdown: F)
    where
        F: Future<Output = ()> + Send,
    {
        shutdown.await;
        info!("shutting down");
    }

    pub async fn run_until_ctrl_c(self) {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }

    pub fn is_finished(&self) -> bool {
        self.outbound.is_finished() && self.inbound.is_finished()
    }
}

impl Drop for Bridge {
    fn drop(&mut self) {
        self.outbound.abort();
        self.inbound.abort();
    }
}
