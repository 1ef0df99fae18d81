#![allow(dead_code)]

use async_trait::async_trait;
use graph_streams::events::{
    ChangeEvent, ChangeEventExtractor, MemoryGraph, Mutation, Properties, SourceInfo, Transaction,
};
use graph_streams::router::EventPublisher;
use graph_streams::{RawConfig, Result};
use serde_json::Value;
use std::env;
use std::sync::Mutex;

/// One message handed to the broker.
#[derive(Debug, Clone)]
pub struct Published {
    pub topic: String,
    pub key: Option<String>,
    pub value: Value,
}

/// Publisher that keeps every message in memory.
#[derive(Default)]
pub struct RecordingPublisher {
    messages: Mutex<Vec<Published>>,
}

impl RecordingPublisher {
    pub fn messages(&self) -> Vec<Published> {
        self.messages.lock().unwrap().clone()
    }

    pub fn topics(&self) -> Vec<String> {
        self.messages().into_iter().map(|m| m.topic).collect()
    }
}

#[async_trait]
impl EventPublisher for RecordingPublisher {
    async fn publish(&self, topic: &str, key: Option<&str>, payload: &[u8]) -> Result<()> {
        let value = serde_json::from_slice(payload)?;
        self.messages.lock().unwrap().push(Published {
            topic: topic.to_string(),
            key: key.map(str::to_string),
            value,
        });
        Ok(())
    }
}

pub fn props(value: Value) -> Properties {
    serde_json::from_value(value).unwrap()
}

pub fn extractor() -> ChangeEventExtractor {
    ChangeEventExtractor::new(SourceInfo::new("graph-test-01"))
}

/// Extracts the events of `mutations`, then applies them to `graph`.
pub fn commit(graph: &mut MemoryGraph, mutations: Vec<Mutation>) -> Vec<ChangeEvent> {
    let tx_id = graph.next_tx_id();
    let events = {
        let tx = Transaction::new(tx_id, &*graph, mutations.clone()).with_username("neo4j");
        extractor().extract(&tx).unwrap()
    };
    graph.apply(&mutations).unwrap();
    events
}

/// Every `txEventId` is its position and every `txEventsCount` the batch size.
pub fn assert_well_formed_batch(events: &[ChangeEvent]) {
    for (position, event) in events.iter().enumerate() {
        assert_eq!(event.meta.tx_event_id, position);
        assert_eq!(event.meta.tx_events_count, events.len());
    }
}

/// Broker settings from the environment, for the ignored broker tests.
pub fn get_test_config() -> RawConfig {
    let brokers = env::var("TEST_KAFKA_BROKERS").unwrap_or_else(|_| "localhost:9092".to_string());
    RawConfig::from_iter([
        ("kafka.bootstrap.servers".to_string(), brokers),
        ("kafka.group.id".to_string(), format!("graph_streams_test_{}", std::process::id())),
        ("kafka.linger.ms".to_string(), "0".to_string()),
    ])
}

pub fn test_topic(name: &str) -> String {
    format!("test_{}_{}", std::process::id(), name)
}
