use chrono::{DateTime, Utc};
use serde_json::Value;

use super::types::Properties;

pub type EntityId = u64;

#[derive(Debug, Clone, PartialEq, Default)]
pub struct NodeState {
    pub labels: Vec<String>,
    pub properties: Properties,
}

impl NodeState {
    pub fn new<L, S>(labels: L, properties: Properties) -> Self
    where
        L: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            labels: labels.into_iter().map(Into::into).collect(),
            properties,
        }
    }

    pub fn has_label(&self, label: &str) -> bool {
        self.labels.iter().any(|l| l == label)
    }

    /// Same labels (ignoring order) and same properties.
    pub fn same_as(&self, other: &NodeState) -> bool {
        self.properties == other.properties
            && self.labels.len() == other.labels.len()
            && self.labels.iter().all(|l| other.has_label(l))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RelationshipState {
    pub rel_type: String,
    pub start: EntityId,
    pub end: EntityId,
    pub properties: Properties,
}

/// A single engine-level change, in the order the engine performed it.
#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
    CreateNode {
        id: EntityId,
        labels: Vec<String>,
        properties: Properties,
    },
    DeleteNode {
        id: EntityId,
    },
    AddLabel {
        node: EntityId,
        label: String,
    },
    RemoveLabel {
        node: EntityId,
        label: String,
    },
    /// A `null` value removes the property.
    SetNodeProperty {
        node: EntityId,
        key: String,
        value: Value,
    },
    RemoveNodeProperty {
        node: EntityId,
        key: String,
    },
    CreateRelationship {
        id: EntityId,
        rel_type: String,
        start: EntityId,
        end: EntityId,
        properties: Properties,
    },
    DeleteRelationship {
        id: EntityId,
    },
    SetRelationshipProperty {
        relationship: EntityId,
        key: String,
        value: Value,
    },
    RemoveRelationshipProperty {
        relationship: EntityId,
        key: String,
    },
}

impl Mutation {
    pub fn create_node<L, S>(id: EntityId, labels: L, properties: Properties) -> Self
    where
        L: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Mutation::CreateNode {
            id,
            labels: labels.into_iter().map(Into::into).collect(),
            properties,
        }
    }

    pub fn create_relationship(
        id: EntityId,
        rel_type: impl Into<String>,
        start: EntityId,
        end: EntityId,
        properties: Properties,
    ) -> Self {
        Mutation::CreateRelationship {
            id,
            rel_type: rel_type.into(),
            start,
            end,
            properties,
        }
    }

    pub fn set_node_property(node: EntityId, key: impl Into<String>, value: impl Into<Value>) -> Self {
        Mutation::SetNodeProperty {
            node,
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn set_relationship_property(
        relationship: EntityId,
        key: impl Into<String>,
        value: impl Into<Value>,
    ) -> Self {
        Mutation::SetRelationshipProperty {
            relationship,
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Read access to committed graph state as of transaction start.
pub trait GraphSnapshot {
    fn node(&self, id: EntityId) -> Option<NodeState>;
    fn relationship(&self, id: EntityId) -> Option<RelationshipState>;
}

/// A committed transaction, valid only while its commit is being processed.
pub struct Transaction<'a> {
    pub tx_id: u64,
    pub commit_time: DateTime<Utc>,
    pub username: Option<String>,
    pub mutations: Vec<Mutation>,
    snapshot: &'a dyn GraphSnapshot,
}

impl<'a> Transaction<'a> {
    pub fn new(tx_id: u64, snapshot: &'a dyn GraphSnapshot, mutations: Vec<Mutation>) -> Self {
        Self {
            tx_id,
            commit_time: Utc::now(),
            username: None,
            mutations,
            snapshot,
        }
    }

    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    pub fn with_commit_time(mut self, commit_time: DateTime<Utc>) -> Self {
        self.commit_time = commit_time;
        self
    }

    pub fn snapshot(&self) -> &dyn GraphSnapshot {
        self.snapshot
    }
}
