use std::{path::PathBuf, time::Duration};

use anyhow::Result;
use clap::{Parser, ValueHint, builder::RangedU64ValueParser};

use crate::{
    bridge::BridgeConfig,
    framing::{DEFAULT_MAX_MESSAGE_SIZE, DEFAULT_READ_BUFFER, FramingOptions},
    mqtt::{BrokerAddress, DEFAULT_KEEP_ALIVE, MqttSettings, generated_client_id},
    topic::TopicPair,
};

const LONG_ABOUT: &str = "\
soqtt links a unix socket to a MQTT topic.

The socket must send and receive text messages. Each message must be
ended by a newline ('\\n').
Publish messages to <prefix>/in to send them to the socket,
subscribe to <prefix>/out to receive messages from the socket.";

#[derive(Parser, Debug)]
#[command(
    name = "soqtt",
    author,
    version,
    about = "Links a unix socket to a MQTT topic",
    long_about = LONG_ABOUT
)]
pub struct Cli {
    /// Path to UNIX socket
    #[arg(short, long, value_hint = ValueHint::FilePath)]
    pub socket: PathBuf,

    /// MQTT broker to use
    #[arg(short, long, default_value = "tcp://localhost:1883")]
    pub broker: String,

    /// MQTT topic prefix
    #[arg(short, long, default_value = "my_topic_prefix")]
    pub topic: String,

    /// Print more verbose messages
    #[arg(short, long)]
    pub verbose: bool,

    /// MQTT client id. Defaults to soqtt-<random number>.
    #[arg(long)]
    pub client_id: Option<String>,

    /// MQTT keep-alive interval in seconds
    #[arg(
        long,
        default_value_t = DEFAULT_KEEP_ALIVE.as_secs(),
        value_parser = clap::value_parser!(u64).range(1..=65535)
    )]
    pub keep_alive: u64,

    /// Largest message relayed in either direction, in bytes
    #[arg(
        long,
        default_value_t = DEFAULT_MAX_MESSAGE_SIZE,
        value_parser = RangedU64ValueParser::<usize>::new().range(1..)
    )]
    pub max_message_size: usize,

    /// Capacity of the socket read buffer, in bytes
    #[arg(
        long,
        default_value_t = DEFAULT_READ_BUFFER,
        value_parser = RangedU64ValueParser::<usize>::new().range(1..)
    )]
    pub read_buffer: usize,

    /// Publish the last message even if the socket closes before its newline
    #[arg(long)]
    pub flush_trailing: bool,
}

impl Cli {
    pub fn into_config(self) -> Result<BridgeConfig> {
        let topics = TopicPair::from_prefix(&self.topic)?;
        let address = BrokerAddress::parse(&self.broker)?;

        let mqtt = MqttSettings {
            address,
            client_id: self.client_id.unwrap_or_else(generated_client_id),
            keep_alive: Duration::from_secs(self.keep_alive),
            max_payload: self.max_message_size,
        };

        Ok(BridgeConfig {
            socket: self.socket,
            broker_uri: self.broker,
            mqtt,
            topics,
            framing: FramingOptions {
                max_message_size: self.max_message_size,
                read_buffer: self.read_buffer,
                flush_trailing: self.flush_trailing,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn defaults_match_the_documented_ones() {
        let cli = Cli::try_parse_from(["soqtt", "-s", "/tmp/app.sock"]).expect("parse");
        let config = cli.into_config().expect("config");

        assert_eq!(config.socket, PathBuf::from("/tmp/app.sock"));
        assert_eq!(config.broker_uri, "tcp://localhost:1883");
        assert_eq!(config.mqtt.address.host, "localhost");
        assert_eq!(config.mqtt.address.port, 1883);
        assert!(config.mqtt.client_id.starts_with("soqtt-"));
        assert_eq!(config.topics.inbound, "my_topic_prefix/in");
        assert_eq!(config.topics.outbound, "my_topic_prefix/out");
        assert_eq!(config.framing, FramingOptions::default());
        assert_eq!(config.mqtt.keep_alive, DEFAULT_KEEP_ALIVE);
    }

    #[test]
    fn short_flags_are_accepted() {
        let cli = Cli::try_parse_from([
            "soqtt",
            "-s",
            "/run/dev.sock",
            "-b",
            "mqtt://broker:1884",
            "-t",
            "plant/line1",
            "-v",
        ])
        .expect("parse");

        assert!(cli.verbose);
        let config = cli.into_config().expect("config");
        assert_eq!(config.mqtt.address.port, 1884);
        assert_eq!(config.topics.outbound, "plant/line1/out");
    }

    #[test]
    fn socket_is_required() {
        assert!(Cli::try_parse_from(["soqtt"]).is_err());
    }

    #[test]
    fn bad_prefix_fails_config() {
        let cli = Cli::try_parse_from(["soqtt", "-s", "x.sock", "-t", "a/#"]).expect("parse");
        assert!(cli.into_config().is_err());
    }

    #[test]
    fn zero_sizes_are_rejected() {
        assert!(Cli::try_parse_from(["soqtt", "-s", "x", "--max-message-size", "0"]).is_err());
        assert!(Cli::try_parse_from(["soqtt", "-s", "x", "--keep-alive", "0"]).is_err());
    }

    #[test]
    fn keep_alive_fits_the_protocol_field() {
        assert!(Cli::try_parse_from(["soqtt", "-s", "x", "--keep-alive", "65536"]).is_err());

        let cli = Cli::try_parse_from(["soqtt", "-s", "x", "--keep-alive", "65535"]).expect("parse");
        let config = cli.into_config().expect("config");
        assert_eq!(config.mqtt.keep_alive, Duration::from_secs(65535));
    }
}
