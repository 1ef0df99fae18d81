//! Commit hook and outbound routing.
//!
//! [`TransactionEventHandler::after_commit`] extracts a transaction's events
//! on the committing thread and queues them; a background task drains the
//! queue through an [`EventRouter`], which resolves topics and publishes.

use crate::events::{ChangeEvent, ChangeEventExtractor, Transaction};
use crate::kafka::{JsonSerializer, KeyStrategy, TopicValidator};
use crate::routing::{SourceConfiguration, SourceRoutes};
use crate::{Error, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Narrow publish capability of the broker client.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, topic: &str, key: Option<&str>, payload: &[u8]) -> Result<()>;
}

#[async_trait]
impl<P: EventPublisher + ?Sized> EventPublisher for Arc<P> {
    async fn publish(&self, topic: &str, key: Option<&str>, payload: &[u8]) -> Result<()> {
        (**self).publish(topic, key, payload).await
    }
}

pub struct EventRouter<P> {
    publisher: P,
    routes: SourceRoutes,
    key_strategy: KeyStrategy,
    validator: Arc<TopicValidator>,
}

impl<P: EventPublisher> EventRouter<P> {
    pub fn new(publisher: P, config: &SourceConfiguration, validator: Arc<TopicValidator>) -> Self {
        Self {
            publisher,
            routes: config.routes.clone(),
            key_strategy: config.key_strategy.clone(),
            validator,
        }
    }

    pub fn routes(&self) -> &SourceRoutes {
        &self.routes
    }

    /// Publishes every event to each of its topics and returns how many
    /// messages were delivered. Failures are logged, never returned.
    pub async fn route(&self, events: &[ChangeEvent]) -> usize {
        let mut published = 0;

        for event in events {
            for (topic, routed) in self.routes.route(event) {
                if !self.validator.is_valid_topic(&topic) {
                    warn!(
                        topic = %topic,
                        tx_id = routed.meta.tx_id,
                        tx_event_id = routed.meta.tx_event_id,
                        "Topic does not exist on the broker, skipping event"
                    );
                    continue;
                }

                let payload = match JsonSerializer::serialize(&routed) {
                    Ok(payload) => payload,
                    Err(e) => {
                        error!(topic = %topic, tx_id = routed.meta.tx_id, "Lost event, cannot serialize: {}", e);
                        continue;
                    }
                };
                let key = self.key_strategy.extract_key(&routed);

                match self.publisher.publish(&topic, key.as_deref(), &payload).await {
                    Ok(()) => published += 1,
                    Err(e) => error!(
                        topic = %topic,
                        tx_id = routed.meta.tx_id,
                        tx_event_id = routed.meta.tx_event_id,
                        "Lost event, publish failed: {}",
                        e
                    ),
                }
            }
        }

        published
    }
}

/// Events of one committed transaction.
#[derive(Debug, Clone)]
pub struct EventBatch {
    pub tx_id: u64,
    pub events: Vec<ChangeEvent>,
}

pub struct TransactionEventHandler {
    extractor: ChangeEventExtractor,
    sender: mpsc::Sender<EventBatch>,
}

impl TransactionEventHandler {
    /// Starts the dispatcher task. It runs until the handler is dropped and
    /// the queue is drained.
    pub fn spawn<P>(
        extractor: ChangeEventExtractor,
        router: EventRouter<P>,
        buffer: usize,
    ) -> (Self, JoinHandle<()>)
    where
        P: EventPublisher + 'static,
    {
        let (sender, mut receiver) = mpsc::channel::<EventBatch>(buffer.max(1));

        let handle = tokio::spawn(async move {
            while let Some(batch) = receiver.recv().await {
                let published = router.route(&batch.events).await;
                debug!(
                    tx_id = batch.tx_id,
                    events = batch.events.len(),
                    published,
                    "Dispatched transaction events"
                );
            }
            info!("Event dispatcher stopped");
        });

        (Self { extractor, sender }, handle)
    }

    /// Runs after a transaction commits. Never waits on the broker: when the
    /// queue is full the batch is dropped and reported.
    pub fn after_commit(&self, tx: &Transaction<'_>) -> Result<usize> {
        let events = match self.extractor.extract(tx) {
            Ok(events) => events,
            Err(e) => {
                error!(tx_id = tx.tx_id, "Lost events of transaction: {}", e);
                return Err(e);
            }
        };
        if events.is_empty() {
            return Ok(0);
        }

        let count = events.len();
        let batch = EventBatch {
            tx_id: tx.tx_id,
            events,
        };
        match self.sender.try_send(batch) {
            Ok(()) => Ok(count),
            Err(mpsc::error::TrySendError::Full(batch)) => {
                error!(tx_id = batch.tx_id, events = count, "Lost events, dispatch queue is full");
                Err(Error::Dispatch(format!(
                    "dispatch queue full, dropped {count} events of transaction {}",
                    batch.tx_id
                )))
            }
            Err(mpsc::error::TrySendError::Closed(batch)) => {
                error!(tx_id = batch.tx_id, events = count, "Lost events, dispatcher has stopped");
                Err(Error::Shutdown)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{MemoryGraph, Mutation, SourceInfo};
    use crate::kafka::TopicAdmin;
    use std::collections::{BTreeMap, HashSet};
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::sync::Notify;

    #[derive(Default)]
    struct RecordingPublisher {
        sent: Mutex<Vec<(String, Option<String>, serde_json::Value)>>,
        failing_topic: Option<String>,
    }

    #[async_trait]
    impl EventPublisher for RecordingPublisher {
        async fn publish(&self, topic: &str, key: Option<&str>, payload: &[u8]) -> Result<()> {
            if self.failing_topic.as_deref() == Some(topic) {
                return Err(Error::Dispatch("broker unavailable".to_string()));
            }
            let value = serde_json::from_slice(payload)?;
            self.sent
                .lock()
                .unwrap()
                .push((topic.to_string(), key.map(str::to_string), value));
            Ok(())
        }
    }

    /// Holds every publish until released.
    #[derive(Default)]
    struct StalledPublisher {
        release: Notify,
    }

    #[async_trait]
    impl EventPublisher for StalledPublisher {
        async fn publish(&self, _topic: &str, _key: Option<&str>, _payload: &[u8]) -> Result<()> {
            self.release.notified().await;
            Ok(())
        }
    }

    struct FixedAdmin(Vec<&'static str>);

    #[async_trait]
    impl TopicAdmin for FixedAdmin {
        async fn list_topics(&self) -> Result<HashSet<String>> {
            Ok(self.0.iter().map(|t| t.to_string()).collect())
        }

        async fn auto_create_topics_enabled(&self) -> Result<bool> {
            Ok(false)
        }
    }

    fn source_config(routes: SourceRoutes) -> SourceConfiguration {
        SourceConfiguration {
            enabled: true,
            key_strategy: KeyStrategy::EntityId,
            dispatch_buffer: 8,
            routes,
        }
    }

    fn two_people(graph: &MemoryGraph) -> Vec<ChangeEvent> {
        let tx = Transaction::new(
            3,
            graph,
            vec![
                Mutation::create_node(1, ["Person"], BTreeMap::new()),
                Mutation::create_node(2, ["Person"], BTreeMap::new()),
            ],
        );
        ChangeEventExtractor::new(SourceInfo::new("test")).extract(&tx).unwrap()
    }

    #[tokio::test]
    async fn test_route_publishes_with_keys() {
        let graph = MemoryGraph::new();
        let publisher = Arc::new(RecordingPublisher::default());
        let router = EventRouter::new(
            Arc::clone(&publisher),
            &source_config(SourceRoutes::single_topic("neo4j")),
            Arc::new(TopicValidator::AlwaysValid),
        );

        assert_eq!(router.route(&two_people(&graph)).await, 2);

        let sent = publisher.sent.lock().unwrap();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].0, "neo4j");
        assert_eq!(sent[0].1.as_deref(), Some("1"));
        assert_eq!(sent[1].1.as_deref(), Some("2"));
        assert_eq!(sent[1].2["meta"]["txEventId"], 1);
    }

    #[tokio::test]
    async fn test_route_skips_invalid_topics() {
        let graph = MemoryGraph::new();
        let validator = TopicValidator::polling(Arc::new(FixedAdmin(vec!["other"])), vec![], Duration::from_secs(60));
        validator.start().await.unwrap();
        validator.wait_for_polls(1).await;

        let publisher = Arc::new(RecordingPublisher::default());
        let validator = Arc::new(validator);
        let router = EventRouter::new(
            Arc::clone(&publisher),
            &source_config(SourceRoutes::single_topic("neo4j")),
            Arc::clone(&validator),
        );

        assert_eq!(router.route(&two_people(&graph)).await, 0);
        assert!(publisher.sent.lock().unwrap().is_empty());
        validator.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_publish_failure_is_not_fatal() {
        let graph = MemoryGraph::new();
        let publisher = Arc::new(RecordingPublisher {
            failing_topic: Some("neo4j".to_string()),
            ..Default::default()
        });
        let router = EventRouter::new(
            Arc::clone(&publisher),
            &source_config(SourceRoutes::single_topic("neo4j")),
            Arc::new(TopicValidator::AlwaysValid),
        );

        assert_eq!(router.route(&two_people(&graph)).await, 0);
    }

    #[tokio::test]
    async fn test_after_commit_dispatches_batch() {
        let graph = MemoryGraph::new();
        let publisher = Arc::new(RecordingPublisher::default());
        let router = EventRouter::new(
            Arc::clone(&publisher),
            &source_config(SourceRoutes::single_topic("neo4j")),
            Arc::new(TopicValidator::AlwaysValid),
        );
        let (handler, dispatcher) =
            TransactionEventHandler::spawn(ChangeEventExtractor::new(SourceInfo::new("test")), router, 4);

        let tx = Transaction::new(1, &graph, vec![Mutation::create_node(9, ["Person"], BTreeMap::new())]);
        assert_eq!(handler.after_commit(&tx).unwrap(), 1);

        let empty = Transaction::new(2, &graph, vec![]);
        assert_eq!(handler.after_commit(&empty).unwrap(), 0);

        drop(handler);
        dispatcher.await.unwrap();
        assert_eq!(publisher.sent.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_after_commit_reports_extraction_failure() {
        let graph = MemoryGraph::new();
        let router = EventRouter::new(
            Arc::new(RecordingPublisher::default()),
            &source_config(SourceRoutes::single_topic("neo4j")),
            Arc::new(TopicValidator::AlwaysValid),
        );
        let (handler, _dispatcher) =
            TransactionEventHandler::spawn(ChangeEventExtractor::new(SourceInfo::new("test")), router, 4);

        let tx = Transaction::new(5, &graph, vec![Mutation::set_node_property(404, "name", "ghost")]);
        assert!(matches!(handler.after_commit(&tx), Err(Error::Extraction { tx_id: 5, .. })));
    }

    #[tokio::test]
    async fn test_after_commit_drops_batch_when_queue_is_full() {
        let graph = MemoryGraph::new();
        let publisher = Arc::new(StalledPublisher::default());
        let router = EventRouter::new(
            Arc::clone(&publisher),
            &source_config(SourceRoutes::single_topic("neo4j")),
            Arc::new(TopicValidator::AlwaysValid),
        );
        let (handler, dispatcher) =
            TransactionEventHandler::spawn(ChangeEventExtractor::new(SourceInfo::new("test")), router, 1);

        let commit = |tx_id: u64, node: u64| {
            let tx = Transaction::new(tx_id, &graph, vec![Mutation::create_node(node, ["Person"], BTreeMap::new())]);
            handler.after_commit(&tx)
        };

        assert_eq!(commit(1, 1).unwrap(), 1);
        let started = std::time::Instant::now();
        assert!(matches!(commit(2, 2), Err(Error::Dispatch(_))));
        assert!(matches!(commit(3, 3), Err(Error::Dispatch(_))));
        assert!(started.elapsed() < Duration::from_secs(1));

        publisher.release.notify_one();
        drop(handler);
        tokio::time::timeout(Duration::from_secs(5), dispatcher)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_after_commit_reports_stopped_dispatcher() {
        let graph = MemoryGraph::new();
        let router = EventRouter::new(
            Arc::new(RecordingPublisher::default()),
            &source_config(SourceRoutes::single_topic("neo4j")),
            Arc::new(TopicValidator::AlwaysValid),
        );
        let (handler, dispatcher) =
            TransactionEventHandler::spawn(ChangeEventExtractor::new(SourceInfo::new("test")), router, 4);

        dispatcher.abort();
        assert!(dispatcher.await.unwrap_err().is_cancelled());

        let tx = Transaction::new(1, &graph, vec![Mutation::create_node(1, ["Person"], BTreeMap::new())]);
        assert!(matches!(handler.after_commit(&tx), Err(Error::Shutdown)));
    }
}
