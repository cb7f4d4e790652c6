//! Bridge between a unix stream socket and a pair of MQTT topics.
//!
//! Lines written to the socket are published to `<prefix>/out`; payloads
//! published to `<prefix>/in` are written to the socket, newline-terminated.
//! Each module focuses on one responsibility:
//!
//! - [`cli`] parses the command line into a [`bridge::BridgeConfig`].
//! - [`bridge`] connects the broker and the socket and supervises both
//!   relays until Ctrl-C.
//! - [`outbound`] turns the socket byte stream into publishes.
//! - [`inbound`] writes subscribed payloads back to the socket.
//! - [`framing`] splits the byte stream on newlines, reassembling lines that
//!   span several reads and dropping lines over the size limit.
//! - [`broker`] defines the publish/subscribe seam plus an in-process broker.
//! - [`mqtt`] implements that seam on top of `rumqttc`.
//! - [`topic`] derives the inbound and outbound topic names from a prefix.

pub mod bridge;
pub mod broker;
pub mod cli;
pub mod framing;
pub mod inbound;
pub mod mqtt;
pub mod outbound;
pub mod topic;
