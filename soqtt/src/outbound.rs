use std::{io, sync::Arc};

use bytes::Bytes;
use tokio::io::{AsyncRead, BufReader};
use tracing::{debug, error, warn};

use crate::{
    broker::Broker,
    framing::{Frame, FramingOptions, LineReader},
};

/// Socket to broker direction: every newline-terminated line read from the
/// socket becomes one publish on the outbound topic.
pub struct OutboundRelay<B> {
    broker: Arc<B>,
    topic: String,
    options: FramingOptions,
}

impl<B> OutboundRelay<B>
where
    B: Broker,
{
    pub fn new(broker: Arc<B>, topic: String, options: FramingOptions) -> Self {
        Self {
            broker,
            topic,
            options,
        }
    }

    /// Relays until the socket reaches end of stream.
    ///
    /// A read error ends the relay and is returned to the caller. Publish
    /// failures are logged and the next line is still relayed.
    pub async fn run<R>(self, reader: R) -> io::Result<()>
    where
        R: AsyncRead + Unpin + Send,
    {
        let reader = BufReader::with_capacity(self.options.read_buffer, reader);
        let mut lines = LineReader::new(reader, self.options.max_message_size);

        while let Some(frame) = lines.next_frame().await? {
            match frame {
                Frame::Line(message) => self.publish(message).await,
                Frame::Oversized { discarded } => warn!(
                    discarded,
                    limit = self.options.max_message_size,
                    "dropping message larger than the size limit"
                ),
                Frame::Unterminated(rest) if self.options.flush_trailing => {
                    self.publish(rest).await;
                }
                Frame::Unterminated(rest) => {
                    debug!(bytes = rest.len(), "discarding unterminated trailing bytes");
                }
            }
        }

        Ok(())
    }

    async fn publish(&self, message: Bytes) {
        debug!(payload = %String::from_utf8_lossy(&message), "MQTT <- socket");
        if let Err(err) = self.broker.publish(&self.topic, message).await {
            error!(error = %err, "failure while publishing to broker");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        pin::Pin,
        sync::atomic::{AtomicBool, Ordering},
        task::{Context, Poll},
    };

    use tokio::io::ReadBuf;

    use super::*;
    use crate::broker::{BrokerError, LocalBroker, Subscription};

    const TOPIC: &str = "bridge/out";

    async fn relay_all(
        broker: Arc<LocalBroker>,
        input: &[u8],
        options: FramingOptions,
    ) -> Vec<Bytes> {
        let mut published = broker.subscribe(TOPIC).await.expect("subscribe");
        OutboundRelay::new(broker, TOPIC.to_string(), options)
            .run(input)
            .await
            .expect("relay");
        drain(&mut published)
    }

    fn drain(subscription: &mut Subscription) -> Vec<Bytes> {
        let mut messages = Vec::new();
        while let Ok(message) = subscription.try_recv() {
            messages.push(message);
        }
        messages
    }

    #[tokio::test]
    async fn publishes_one_message_per_line() {
        let messages = relay_all(
            Arc::new(LocalBroker::new()),
            b"first\nsecond\n\nfourth\n",
            FramingOptions::default(),
        )
        .await;

        assert_eq!(
            messages,
            vec![
                Bytes::from_static(b"first"),
                Bytes::from_static(b"second"),
                Bytes::new(),
                Bytes::from_static(b"fourth"),
            ]
        );
    }

    #[tokio::test]
    async fn unterminated_tail_is_dropped_by_default() {
        let messages = relay_all(
            Arc::new(LocalBroker::new()),
            b"a\nb\nc",
            FramingOptions::default(),
        )
        .await;
        assert_eq!(
            messages,
            vec![Bytes::from_static(b"a"), Bytes::from_static(b"b")]
        );
    }

    #[tokio::test]
    async fn unterminated_tail_is_published_when_flushing() {
        let options = FramingOptions {
            flush_trailing: true,
            ..FramingOptions::default()
        };
        let messages = relay_all(Arc::new(LocalBroker::new()), b"a\nb\nc", options).await;
        assert_eq!(
            messages,
            vec![
                Bytes::from_static(b"a"),
                Bytes::from_static(b"b"),
                Bytes::from_static(b"c")
            ]
        );
    }

    #[tokio::test]
    async fn line_larger_than_read_buffer_is_one_message() {
        let options = FramingOptions {
            read_buffer: 16,
            ..FramingOptions::default()
        };
        let line = vec![b'q'; 10_000];
        let mut input = line.clone();
        input.push(b'\n');

        let messages = relay_all(Arc::new(LocalBroker::new()), &input, options).await;
        assert_eq!(messages, vec![Bytes::from(line)]);
    }

    #[tokio::test]
    async fn oversized_line_is_skipped() {
        let options = FramingOptions {
            max_message_size: 8,
            read_buffer: 4,
            flush_trailing: false,
        };
        let messages = relay_all(
            Arc::new(LocalBroker::new()),
            b"way too long for the limit\nok\n",
            options,
        )
        .await;
        assert_eq!(messages, vec![Bytes::from_static(b"ok")]);
    }

    /// Fails the first publish, then behaves like the wrapped broker.
    #[derive(Default)]
    struct FailsOnce {
        inner: LocalBroker,
        failed: AtomicBool,
    }

    impl Broker for FailsOnce {
        async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), BrokerError> {
            if !self.failed.swap(true, Ordering::SeqCst) {
                return Err(BrokerError::Closed);
            }
            self.inner.publish(topic, payload).await
        }

        async fn subscribe(&self, topic: &str) -> Result<Subscription, BrokerError> {
            self.inner.subscribe(topic).await
        }
    }

    #[tokio::test]
    async fn publish_failure_does_not_stop_the_relay() {
        let broker = Arc::new(FailsOnce::default());
        let mut published = broker.subscribe(TOPIC).await.expect("subscribe");

        OutboundRelay::new(Arc::clone(&broker), TOPIC.to_string(), FramingOptions::default())
            .run(&b"lost\nkept\n"[..])
            .await
            .expect("relay");

        assert_eq!(drain(&mut published), vec![Bytes::from_static(b"kept")]);
    }

    /// Yields one line, then fails every read with a connection reset.
    #[derive(Default)]
    struct ResetAfterOneLine {
        reads: usize,
    }

    impl AsyncRead for ResetAfterOneLine {
        fn poll_read(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            self.reads += 1;
            if self.reads == 1 {
                buf.put_slice(b"one\n");
                return Poll::Ready(Ok(()));
            }
            Poll::Ready(Err(io::Error::new(
                io::ErrorKind::ConnectionReset,
                "peer reset",
            )))
        }
    }

    #[tokio::test]
    async fn read_error_stops_the_relay() {
        let broker = Arc::new(LocalBroker::new());
        let mut published = broker.subscribe(TOPIC).await.expect("subscribe");
        let mut reader = ResetAfterOneLine::default();

        let relay = OutboundRelay::new(broker, TOPIC.to_string(), FramingOptions::default());

        let err = relay.run(&mut reader).await.expect_err("read error is returned");
        assert_eq!(err.kind(), io::ErrorKind::ConnectionReset);
        assert_eq!(drain(&mut published), vec![Bytes::from_static(b"one")]);
        assert_eq!(reader.reads, 2);
    }
}
