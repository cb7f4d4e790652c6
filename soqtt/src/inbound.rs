use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::{debug, error, warn};

use crate::broker::{Broker, BrokerError, Subscription};

const NEWLINE: &[u8] = b"\n";

/// Broker to socket direction: each payload received on the inbound topic is
/// written to the socket, newline-terminated.
pub struct InboundRelay {
    subscription: Subscription,
    max_message_size: usize,
}

impl InboundRelay {
    /// Subscribes to `topic`. Failing here leaves the direction unusable.
    ///
    /// Payloads longer than `max_message_size` are dropped when they arrive.
    pub async fn subscribe<B>(
        broker: &B,
        topic: &str,
        max_message_size: usize,
    ) -> Result<Self, BrokerError>
    where
        B: Broker,
    {
        let subscription = broker.subscribe(topic).await?;
        Ok(Self {
            subscription,
            max_message_size,
        })
    }

    /// Writes payloads until the subscription ends. Write failures are
    /// logged per message.
    pub async fn run<W>(mut self, mut writer: W)
    where
        W: AsyncWrite + Unpin,
    {
        while let Some(payload) = self.subscription.recv().await {
            if payload.len() > self.max_message_size {
                warn!(
                    size = payload.len(),
                    limit = self.max_message_size,
                    "dropping broker message larger than the size limit"
                );
                continue;
            }
            debug!(payload = %String::from_utf8_lossy(&payload), "MQTT -> socket");
            write_line(&mut writer, &payload).await;
        }

        debug!("inbound subscription ended");
    }
}

/// Writes `payload`, followed by a newline unless it already ends with one.
///
/// The newline is attempted even when the payload write fails, so a partial
/// payload still ends its line. Each failure is logged on its own.
pub async fn write_line<W>(writer: &mut W, payload: &[u8])
where
    W: AsyncWrite + Unpin,
{
    if let Err(err) = writer.write_all(payload).await {
        error!(error = %err, "failed to write broker message to socket");
    }
    if !payload.ends_with(NEWLINE) {
        if let Err(err) = writer.write_all(NEWLINE).await {
            error!(error = %err, "failed to write newline to socket");
        }
    }
    if let Err(err) = writer.flush().await {
        error!(error = %err, "failed to flush socket");
    }
}
