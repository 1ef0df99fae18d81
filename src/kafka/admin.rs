use crate::{config::KafkaConfiguration, Error, Result};
use async_trait::async_trait;
use rdkafka::admin::{AdminClient, AdminOptions, ResourceSpecifier};
use rdkafka::client::DefaultClientContext;
use rdkafka::error::KafkaError;
use rdkafka::types::RDKafkaErrorCode;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument};

const AUTO_CREATE_TOPICS: &str = "auto.create.topics.enable";

/// The two broker capabilities topic validation relies on.
#[async_trait]
pub trait TopicAdmin: Send + Sync {
    /// Names of every topic currently known to the cluster.
    async fn list_topics(&self) -> Result<HashSet<String>>;

    /// Whether the broker creates topics on first reference.
    async fn auto_create_topics_enabled(&self) -> Result<bool>;
}

pub struct KafkaTopicAdmin {
    admin_client: Arc<AdminClient<DefaultClientContext>>,
    timeout: Duration,
}

struct ClusterMetadata {
    topics: HashSet<String>,
    broker_ids: Vec<i32>,
}

impl KafkaTopicAdmin {
    pub fn new(config: &KafkaConfiguration) -> Result<Self> {
        let admin_client: AdminClient<_> = config.client_config().create().map_err(Error::Kafka)?;

        Ok(Self {
            admin_client: Arc::new(admin_client),
            timeout: Duration::from_secs(5),
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn cluster_metadata(&self) -> Result<ClusterMetadata> {
        let admin_client = Arc::clone(&self.admin_client);
        let timeout = self.timeout;

        // fetch_metadata blocks the calling thread
        tokio::task::spawn_blocking(move || -> Result<ClusterMetadata> {
            let metadata = admin_client.inner().fetch_metadata(None, timeout)?;
            Ok(ClusterMetadata {
                topics: metadata.topics().iter().map(|t| t.name().to_string()).collect(),
                broker_ids: metadata.brokers().iter().map(|b| b.id()).collect(),
            })
        })
        .await
        .map_err(|e| Error::IllegalState(format!("Metadata request did not complete: {e}")))?
    }
}

#[async_trait]
impl TopicAdmin for KafkaTopicAdmin {
    #[instrument(skip(self))]
    async fn list_topics(&self) -> Result<HashSet<String>> {
        let metadata = self.cluster_metadata().await?;
        debug!("Broker reported {} topics", metadata.topics.len());
        Ok(metadata.topics)
    }

    #[instrument(skip(self))]
    async fn auto_create_topics_enabled(&self) -> Result<bool> {
        let metadata = self.cluster_metadata().await?;
        let broker = metadata
            .broker_ids
            .first()
            .copied()
            .ok_or(Error::Kafka(KafkaError::MetadataFetch(RDKafkaErrorCode::BrokerNotAvailable)))?;

        let opts = AdminOptions::new().request_timeout(Some(self.timeout));
        let resource = ResourceSpecifier::Broker(broker);
        let results = self
            .admin_client
            .describe_configs([&resource], &opts)
            .await
            .map_err(Error::Kafka)?;

        for result in results {
            let config = result.map_err(|code| Error::Kafka(KafkaError::AdminOp(code)))?;
            if let Some(entry) = config.get(AUTO_CREATE_TOPICS) {
                debug!("Broker {} reports {}={:?}", broker, AUTO_CREATE_TOPICS, entry.value);
                return Ok(entry.value.as_deref() == Some("true"));
            }
        }

        // Kafka's own default
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RawConfig;

    #[tokio::test]
    #[ignore] // Requires running Kafka
    async fn test_list_topics() {
        let raw = RawConfig::from_iter([("kafka.bootstrap.servers", "localhost:9092")]);
        let config = KafkaConfiguration::resolve(&raw, "neo4j", true).unwrap();
        let admin = KafkaTopicAdmin::new(&config).unwrap();

        let topics = admin.list_topics().await.unwrap();
        assert!(topics.iter().all(|t| !t.is_empty()));

        // Only checks the broker answers
        admin.auto_create_topics_enabled().await.unwrap();
    }
}
