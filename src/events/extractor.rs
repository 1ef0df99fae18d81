use std::collections::hash_map::Entry;
use std::collections::HashMap;

use tracing::{debug, trace};

use super::memory::{add_label, set_property};
use super::transaction::{EntityId, Mutation, NodeState, RelationshipState, Transaction};
use super::types::{
    ChangeEvent, Meta, NodeChange, NodePayload, OperationType, Payload, RelationshipChange,
    RelationshipNodeChange, RelationshipPayload, SourceInfo,
};
use crate::{Error, Result};

/// Turns one committed transaction into its ordered batch of change events.
///
/// Node events come first, then relationship events, each group in the
/// order entities were first touched. `txEventId` is the position in that
/// sequence and `txEventsCount` its length. Intermediate states inside the
/// transaction are never reported, only the net difference between
/// transaction start and end.
#[derive(Debug, Clone)]
pub struct ChangeEventExtractor {
    source: SourceInfo,
}

#[derive(Debug, Clone)]
struct Diff<S> {
    before: Option<S>,
    after: Option<S>,
}

impl<S: Clone> Diff<S> {
    fn existing(state: S) -> Self {
        Self {
            before: Some(state.clone()),
            after: Some(state),
        }
    }

    fn created(state: S) -> Self {
        Self {
            before: None,
            after: Some(state),
        }
    }

    fn latest(&self) -> Option<&S> {
        self.after.as_ref().or(self.before.as_ref())
    }
}

/// Net per-entity state after replaying every mutation of a transaction.
#[derive(Default)]
struct TransactionDiff {
    node_order: Vec<EntityId>,
    nodes: HashMap<EntityId, Diff<NodeState>>,
    relationship_order: Vec<EntityId>,
    relationships: HashMap<EntityId, Diff<RelationshipState>>,
}

impl ChangeEventExtractor {
    pub fn new(source: SourceInfo) -> Self {
        Self { source }
    }

    pub fn source(&self) -> &SourceInfo {
        &self.source
    }

    /// Fails as a whole if any entity cannot be diffed; a partial batch
    /// would carry a wrong `txEventsCount`.
    pub fn extract(&self, tx: &Transaction<'_>) -> Result<Vec<ChangeEvent>> {
        let diff = TransactionDiff::replay(tx)?;

        let mut changes = Vec::with_capacity(diff.node_order.len() + diff.relationship_order.len());
        for id in &diff.node_order {
            if let Some(change) = diff.node_change(*id) {
                changes.push(change);
            }
        }
        for id in &diff.relationship_order {
            if let Some(change) = diff.relationship_change(tx, *id)? {
                changes.push(change);
            }
        }

        let count = changes.len();
        let timestamp = tx.commit_time.timestamp_millis();
        let source = self.source.as_map();

        let events: Vec<ChangeEvent> = changes
            .into_iter()
            .enumerate()
            .map(|(position, (operation, payload))| ChangeEvent {
                meta: Meta {
                    timestamp,
                    username: tx.username.clone(),
                    tx_id: tx.tx_id,
                    tx_event_id: position,
                    tx_events_count: count,
                    operation,
                    source: source.clone(),
                },
                payload,
            })
            .collect();

        debug!(tx_id = tx.tx_id, events = count, "Extracted change events");
        Ok(events)
    }
}

impl TransactionDiff {
    fn replay(tx: &Transaction<'_>) -> Result<Self> {
        let mut diff = Self::default();

        for mutation in &tx.mutations {
            trace!(tx_id = tx.tx_id, ?mutation, "Replaying mutation");
            match mutation {
                Mutation::CreateNode {
                    id,
                    labels,
                    properties,
                } => {
                    if diff.nodes.contains_key(id) || tx.snapshot().node(*id).is_some() {
                        return Err(extraction_error(tx, format!("node {id} created twice")));
                    }
                    let mut state = NodeState::default();
                    for label in labels {
                        add_label(&mut state, label);
                    }
                    for (key, value) in properties {
                        set_property(&mut state.properties, key, value);
                    }
                    diff.node_order.push(*id);
                    diff.nodes.insert(*id, Diff::created(state));
                }
                Mutation::DeleteNode { id } => {
                    let entry = diff.node_diff(tx, *id)?;
                    if entry.after.take().is_none() {
                        return Err(extraction_error(tx, format!("node {id} deleted twice")));
                    }
                }
                Mutation::AddLabel { node, label } => add_label(diff.node_mut(tx, *node)?, label),
                Mutation::RemoveLabel { node, label } => {
                    diff.node_mut(tx, *node)?.labels.retain(|l| l != label);
                }
                Mutation::SetNodeProperty { node, key, value } => {
                    set_property(&mut diff.node_mut(tx, *node)?.properties, key, value);
                }
                Mutation::RemoveNodeProperty { node, key } => {
                    diff.node_mut(tx, *node)?.properties.remove(key);
                }
                Mutation::CreateRelationship {
                    id,
                    rel_type,
                    start,
                    end,
                    properties,
                } => {
                    if diff.relationships.contains_key(id) || tx.snapshot().relationship(*id).is_some() {
                        return Err(extraction_error(tx, format!("relationship {id} created twice")));
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
                    diff.relationship_order.push(*id);
                    diff.relationships.insert(*id, Diff::created(state));
                }
                Mutation::DeleteRelationship { id } => {
                    let entry = diff.relationship_diff(tx, *id)?;
                    if entry.after.take().is_none() {
                        return Err(extraction_error(tx, format!("relationship {id} deleted twice")));
                    }
                }
                Mutation::SetRelationshipProperty {
                    relationship,
                    key,
                    value,
                } => {
                    set_property(
                        &mut diff.relationship_mut(tx, *relationship)?.properties,
                        key,
                        value,
                    );
                }
                Mutation::RemoveRelationshipProperty { relationship, key } => {
                    diff.relationship_mut(tx, *relationship)?.properties.remove(key);
                }
            }
        }

        Ok(diff)
    }

    fn node_diff(&mut self, tx: &Transaction<'_>, id: EntityId) -> Result<&mut Diff<NodeState>> {
        match self.nodes.entry(id) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(entry) => {
                let state = tx
                    .snapshot()
                    .node(id)
                    .ok_or_else(|| extraction_error(tx, format!("node {id} is not part of the graph")))?;
                self.node_order.push(id);
                Ok(entry.insert(Diff::existing(state)))
            }
        }
    }

    fn node_mut(&mut self, tx: &Transaction<'_>, id: EntityId) -> Result<&mut NodeState> {
        self.node_diff(tx, id)?
            .after
            .as_mut()
            .ok_or_else(|| extraction_error(tx, format!("node {id} modified after deletion")))
    }

    fn relationship_diff(
        &mut self,
        tx: &Transaction<'_>,
        id: EntityId,
    ) -> Result<&mut Diff<RelationshipState>> {
        match self.relationships.entry(id) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(entry) => {
                let state = tx.snapshot().relationship(id).ok_or_else(|| {
                    extraction_error(tx, format!("relationship {id} is not part of the graph"))
                })?;
                self.relationship_order.push(id);
                Ok(entry.insert(Diff::existing(state)))
            }
        }
    }

    fn relationship_mut(&mut self, tx: &Transaction<'_>, id: EntityId) -> Result<&mut RelationshipState> {
        self.relationship_diff(tx, id)?
            .after
            .as_mut()
            .ok_or_else(|| extraction_error(tx, format!("relationship {id} modified after deletion")))
    }

    fn node_change(&self, id: EntityId) -> Option<(OperationType, Payload)> {
        let diff = self.nodes.get(&id)?;
        let operation = match (&diff.before, &diff.after) {
            (None, None) => return None,
            (None, Some(_)) => OperationType::Created,
            (Some(_), None) => OperationType::Deleted,
            (Some(before), Some(after)) if before.same_as(after) => return None,
            (Some(_), Some(_)) => OperationType::Updated,
        };

        let to_change = |state: &NodeState| NodeChange {
            labels: state.labels.clone(),
            properties: state.properties.clone(),
        };
        let payload = Payload::Node(NodePayload {
            id: id.to_string(),
            before: diff.before.as_ref().map(to_change),
            after: diff.after.as_ref().map(to_change),
        });
        Some((operation, payload))
    }

    fn relationship_change(
        &self,
        tx: &Transaction<'_>,
        id: EntityId,
    ) -> Result<Option<(OperationType, Payload)>> {
        let Some(diff) = self.relationships.get(&id) else {
            return Ok(None);
        };
        let operation = match (&diff.before, &diff.after) {
            (None, None) => return Ok(None),
            (None, Some(_)) => OperationType::Created,
            (Some(_), None) => OperationType::Deleted,
            (Some(before), Some(after)) if before.properties == after.properties => return Ok(None),
            (Some(_), Some(_)) => OperationType::Updated,
        };

        let Some(state) = diff.latest() else {
            return Ok(None);
        };
        let to_change = |state: &RelationshipState| RelationshipChange {
            properties: state.properties.clone(),
        };
        let payload = Payload::Relationship(RelationshipPayload {
            id: id.to_string(),
            label: state.rel_type.clone(),
            start: self.endpoint(tx, id, state.start)?,
            end: self.endpoint(tx, id, state.end)?,
            before: diff.before.as_ref().map(to_change),
            after: diff.after.as_ref().map(to_change),
        });
        Ok(Some((operation, payload)))
    }

    /// Endpoint labels from the node's end state, its start state when it
    /// was deleted in this transaction, or the snapshot when untouched.
    fn endpoint(
        &self,
        tx: &Transaction<'_>,
        relationship: EntityId,
        node: EntityId,
    ) -> Result<RelationshipNodeChange> {
        let state = match self.nodes.get(&node) {
            Some(diff) => diff.latest().cloned(),
            None => tx.snapshot().node(node),
        };
        state
            .map(|state| RelationshipNodeChange {
                id: node.to_string(),
                labels: state.labels,
            })
            .ok_or_else(|| {
                extraction_error(
                    tx,
                    format!("relationship {relationship} references unknown node {node}"),
                )
            })
    }
}

fn extraction_error(tx: &Transaction<'_>, message: String) -> Error {
    Error::Extraction {
        tx_id: tx.tx_id,
        message,
    }
}
