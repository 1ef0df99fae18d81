use crate::config::{KafkaConfiguration, TopicConfiguration, BYTE_ARRAY_DESERIALIZER};
use crate::sink::{GraphWriter, SinkHandler};
use crate::{Error, Result};
use futures::StreamExt;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::Message;
use rdkafka::{Offset, TopicPartitionList};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument};

/// Consumes every configured sink topic and feeds the messages to a
/// [`SinkHandler`].
pub struct SinkConsumer {
    consumer: StreamConsumer,
    topics: Vec<String>,
    manual_commit: bool,
    async_commit: bool,
}

impl SinkConsumer {
    pub fn new(config: &KafkaConfiguration, topics: &TopicConfiguration) -> Result<Self> {
        if !config.value_is_byte_array() {
            return Err(Error::Config(format!(
                "The sink only supports `kafka.value.deserializer={}`, found `{}`",
                BYTE_ARRAY_DESERIALIZER, config.value_deserializer
            )));
        }
        let topic_names = topics.topics();
        if topic_names.is_empty() {
            return Err(Error::Config(
                "No sink topics configured, expected `streams.sink.topic.cypher.<topic>` entries".to_string(),
            ));
        }

        let mut client_config = config.client_config();
        client_config.set("enable.partition.eof", "false");
        let consumer: StreamConsumer = client_config.create().map_err(Error::Kafka)?;

        let subscription: Vec<&str> = topic_names.iter().map(String::as_str).collect();
        consumer.subscribe(&subscription).map_err(Error::Kafka)?;
        info!(topics = ?topic_names, group_id = %config.group_id, "Subscribed to sink topics");

        Ok(Self {
            consumer,
            topics: topic_names,
            manual_commit: !config.enable_auto_commit,
            async_commit: config.async_commit,
        })
    }

    pub fn topics(&self) -> &[String] {
        &self.topics
    }

    /// Runs until `shutdown` is cancelled. Failed messages are logged and
    /// their offsets committed like any other.
    #[instrument(skip_all)]
    pub async fn run<W: GraphWriter>(&self, handler: &SinkHandler<W>, shutdown: CancellationToken) -> Result<()> {
        let mut messages = self.consumer.stream();
        loop {
            let message = tokio::select! {
                _ = shutdown.cancelled() => break,
                next = messages.next() => match next {
                    Some(message) => message,
                    None => break,
                },
            };

            let (topic, partition, offset, payload) = match message {
                Ok(message) => (
                    message.topic().to_string(),
                    message.partition(),
                    message.offset(),
                    message.payload().map(<[u8]>::to_vec),
                ),
                Err(e) => {
                    error!("Error while receiving sink messages: {}", e);
                    continue;
                }
            };

            match handler.handle(&topic, payload.as_deref()).await {
                Ok(true) => debug!(topic = %topic, partition, offset, "Applied sink message"),
                Ok(false) => debug!(topic = %topic, partition, offset, "Skipped sink message"),
                Err(e) => error!(topic = %topic, partition, offset, "Cannot apply sink message: {}", e),
            }

            if self.manual_commit {
                self.commit(&topic, partition, offset)?;
            }
        }

        info!("Sink consumer stopped");
        Ok(())
    }

    fn commit(&self, topic: &str, partition: i32, offset: i64) -> Result<()> {
        let mut offsets = TopicPartitionList::new();
        offsets
            .add_partition_offset(topic, partition, Offset::Offset(offset + 1))
            .map_err(Error::Kafka)?;

        let mode = if self.async_commit {
            CommitMode::Async
        } else {
            CommitMode::Sync
        };
        self.consumer.commit(&offsets, mode).map_err(Error::Kafka)
    }
}
