use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

pub type Properties = BTreeMap<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationType {
    Created,
    Updated,
    Deleted,
}

/// One entry of a transaction's emitted batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub meta: Meta,
    pub payload: Payload,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Meta {
    pub timestamp: i64,
    pub username: Option<String>,
    pub tx_id: u64,
    pub tx_event_id: usize,
    pub tx_events_count: usize,
    pub operation: OperationType,
    pub source: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Payload {
    Node(NodePayload),
    Relationship(RelationshipPayload),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodePayload {
    pub id: String,
    pub before: Option<NodeChange>,
    pub after: Option<NodeChange>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeChange {
    pub labels: Vec<String>,
    pub properties: Properties,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationshipPayload {
    pub id: String,
    pub label: String,
    pub start: RelationshipNodeChange,
    pub end: RelationshipNodeChange,
    pub before: Option<RelationshipChange>,
    pub after: Option<RelationshipChange>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationshipNodeChange {
    pub id: String,
    pub labels: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationshipChange {
    pub properties: Properties,
}

/// Process identity attached to every event's `meta.source`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceInfo {
    pub hostname: String,
}

impl SourceInfo {
    pub fn new(hostname: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
        }
    }

    /// Reads the machine hostname, falling back to `localhost`.
    pub fn detect() -> Self {
        let hostname = hostname::get()
            .ok()
            .and_then(|name| name.into_string().ok())
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| "localhost".to_string());
        Self { hostname }
    }

    pub fn as_map(&self) -> BTreeMap<String, String> {
        BTreeMap::from([("hostname".to_string(), self.hostname.clone())])
    }
}

impl ChangeEvent {
    pub fn operation(&self) -> OperationType {
        self.meta.operation
    }

    pub fn entity_id(&self) -> &str {
        match &self.payload {
            Payload::Node(node) => &node.id,
            Payload::Relationship(rel) => &rel.id,
        }
    }

    /// Properties of the most recent state: `after`, or `before` for deletions.
    pub fn current_properties(&self) -> Option<&Properties> {
        match &self.payload {
            Payload::Node(node) => node
                .after
                .as_ref()
                .or(node.before.as_ref())
                .map(|n| &n.properties),
            Payload::Relationship(rel) => rel
                .after
                .as_ref()
                .or(rel.before.as_ref())
                .map(|r| &r.properties),
        }
    }
}
