//! An in-memory graph that applies [`Mutation`]s the way a storage engine
//! would, and serves as the transaction-start [`GraphSnapshot`].

use std::collections::BTreeMap;

use serde_json::Value;

use super::transaction::{EntityId, GraphSnapshot, Mutation, NodeState, RelationshipState};
use crate::{Error, Result};

#[derive(Debug, Clone, Default)]
pub struct MemoryGraph {
    nodes: BTreeMap<EntityId, NodeState>,
    relationships: BTreeMap<EntityId, RelationshipState>,
    next_tx_id: u64,
}

impl MemoryGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Transaction id for the next commit.
    pub fn next_tx_id(&mut self) -> u64 {
        let id = self.next_tx_id;
        self.next_tx_id += 1;
        id
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn relationship_count(&self) -> usize {
        self.relationships.len()
    }

    /// Mutations that delete `node` and every attached relationship.
    /// Relationships come first, matching engine processing order.
    pub fn detach_delete(&self, node: EntityId) -> Vec<Mutation> {
        let mut mutations: Vec<Mutation> = self
            .relationships
            .iter()
            .filter(|(_, rel)| rel.start == node || rel.end == node)
            .map(|(id, _)| Mutation::DeleteRelationship { id: *id })
            .collect();
        mutations.push(Mutation::DeleteNode { id: node });
        mutations
    }

    /// Applies a committed transaction's mutations in order.
    pub fn apply(&mut self, mutations: &[Mutation]) -> Result<()> {
        for mutation in mutations {
            self.apply_one(mutation)?;
        }
        Ok(())
    }

    fn apply_one(&mut self, mutation: &Mutation) -> Result<()> {
        match mutation {
            Mutation::CreateNode {
                id,
                labels,
                properties,
            } => {
                let mut state = NodeState::default();
                for label in labels {
                    add_label(&mut state, label);
                }
                for (key, value) in properties {
                    set_property(&mut state.properties, key, value);
                }
                self.nodes.insert(*id, state);
            }
            Mutation::DeleteNode { id } => {
                if self
                    .relationships
                    .values()
                    .any(|rel| rel.start == *id || rel.end == *id)
                {
                    return Err(Error::IllegalState(format!(
                        "node {id} still has relationships"
                    )));
                }
                self.nodes.remove(id);
            }
            Mutation::AddLabel { node, label } => add_label(self.node_mut(*node)?, label),
            Mutation::RemoveLabel { node, label } => {
                self.node_mut(*node)?.labels.retain(|l| l != label);
            }
            Mutation::SetNodeProperty { node, key, value } => {
                set_property(&mut self.node_mut(*node)?.properties, key, value);
            }
            Mutation::RemoveNodeProperty { node, key } => {
                self.node_mut(*node)?.properties.remove(key);
            }
            Mutation::CreateRelationship {
                id,
                rel_type,
                start,
                end,
                properties,
            } => {
                for endpoint in [start, end] {
                    if !self.nodes.contains_key(endpoint) {
                        return Err(Error::IllegalState(format!("node {endpoint} does not exist")));
                    }
                }
                let mut state = RelationshipState {
                    rel_type: rel_type.clone(),
                    start: *start,
                    end: *end,
                    properties: Default::default(),
                };
                for (key, value) in properties {
                    set_property(&mut state.properties, key, value);
                }
                self.relationships.insert(*id, state);
            }
            Mutation::DeleteRelationship { id } => {
                self.relationships.remove(id);
            }
            Mutation::SetRelationshipProperty {
                relationship,
                key,
                value,
            } => {
                set_property(&mut self.relationship_mut(*relationship)?.properties, key, value);
            }
            Mutation::RemoveRelationshipProperty { relationship, key } => {
                self.relationship_mut(*relationship)?.properties.remove(key);
            }
        }
        Ok(())
    }

    fn node_mut(&mut self, id: EntityId) -> Result<&mut NodeState> {
        self.nodes
            .get_mut(&id)
            .ok_or_else(|| Error::IllegalState(format!("node {id} does not exist")))
    }

    fn relationship_mut(&mut self, id: EntityId) -> Result<&mut RelationshipState> {
        self.relationships
            .get_mut(&id)
            .ok_or_else(|| Error::IllegalState(format!("relationship {id} does not exist")))
    }
}

impl GraphSnapshot for MemoryGraph {
    fn node(&self, id: EntityId) -> Option<NodeState> {
        self.nodes.get(&id).cloned()
    }

    fn relationship(&self, id: EntityId) -> Option<RelationshipState> {
        self.relationships.get(&id).cloned()
    }
}

pub(crate) fn add_label(state: &mut NodeState, label: &str) {
    if !state.has_label(label) {
        state.labels.push(label.to_string());
    }
}

pub(crate) fn set_property(properties: &mut super::Properties, key: &str, value: &Value) {
    if value.is_null() {
        properties.remove(key);
    } else {
        properties.insert(key.to_string(), value.clone());
    }
}
