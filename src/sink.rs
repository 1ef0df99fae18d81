//! Inbound side: broker messages become graph writes.

use crate::config::TopicConfiguration;
use crate::{Error, Result};
use async_trait::async_trait;
use serde_json::{Map, Value};
use tracing::{debug, info};

/// Name under which a message body is bound in the write template.
pub const EVENT_PARAMETER: &str = "event";

/// Executes a write template against the graph.
#[async_trait]
pub trait GraphWriter: Send + Sync {
    async fn write(&self, statement: &str, parameters: Map<String, Value>) -> Result<()>;
}

/// Logs statements instead of executing them.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingWriter;

#[async_trait]
impl GraphWriter for LoggingWriter {
    async fn write(&self, statement: &str, parameters: Map<String, Value>) -> Result<()> {
        let parameters = Value::Object(parameters);
        info!(statement, parameters = %parameters, "Dry run, statement not executed");
        Ok(())
    }
}

pub struct SinkHandler<W> {
    topics: TopicConfiguration,
    writer: W,
}

impl<W: GraphWriter> SinkHandler<W> {
    pub fn new(topics: TopicConfiguration, writer: W) -> Self {
        Self { topics, writer }
    }

    pub fn topics(&self) -> &TopicConfiguration {
        &self.topics
    }

    pub fn writer(&self) -> &W {
        &self.writer
    }

    /// Applies the template of `topic` to one message body. Returns `false`
    /// when the message was skipped: no template for the topic, or a
    /// tombstone.
    pub async fn handle(&self, topic: &str, payload: Option<&[u8]>) -> Result<bool> {
        let Some(template) = self.topics.template(topic) else {
            debug!(topic, "No write template for topic");
            return Ok(false);
        };
        let Some(payload) = payload else {
            debug!(topic, "Skipping message without payload");
            return Ok(false);
        };

        let body: Value = serde_json::from_slice(payload).map_err(|e| Error::Sink {
            topic: topic.to_string(),
            message: format!("message body is not valid JSON: {e}"),
        })?;

        let mut parameters = Map::new();
        parameters.insert(EVENT_PARAMETER.to_string(), body);
        self.writer.write(template, parameters).await.map_err(|e| match e {
            sink @ Error::Sink { .. } => sink,
            other => Error::Sink {
                topic: topic.to_string(),
                message: other.to_string(),
            },
        })?;
        Ok(true)
    }
}
