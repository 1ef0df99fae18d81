#[cfg(test)]
mod tests {
    use super::super::extractor::ChangeEventExtractor;
    use super::super::memory::MemoryGraph;
    use super::super::transaction::{Mutation, Transaction};
    use super::super::types::*;
    use crate::Error;
    use serde_json::json;

    fn create_extractor() -> ChangeEventExtractor {
        ChangeEventExtractor::new(SourceInfo::new("test-host"))
    }

    fn props(value: serde_json::Value) -> Properties {
        serde_json::from_value(value).unwrap()
    }

    /// Extracts the events of `mutations` against `graph`, then commits them.
    fn commit(graph: &mut MemoryGraph, mutations: Vec<Mutation>) -> Vec<ChangeEvent> {
        let tx_id = graph.next_tx_id();
        let events = {
            let tx = Transaction::new(tx_id, &*graph, mutations.clone());
            create_extractor().extract(&tx).unwrap()
        };
        graph.apply(&mutations).unwrap();
        events
    }

    fn seed_people(graph: &mut MemoryGraph) {
        commit(
            graph,
            vec![
                Mutation::create_node(1, ["Person"], props(json!({"name": "Omar", "age": 30}))),
                Mutation::create_node(2, ["Person"], props(json!({"name": "Andrea", "age": 31}))),
            ],
        );
    }

    fn node(event: &ChangeEvent) -> &NodePayload {
        match &event.payload {
            Payload::Node(node) => node,
            other => panic!("expected node payload, got {:?}", other),
        }
    }

    fn relationship(event: &ChangeEvent) -> &RelationshipPayload {
        match &event.payload {
            Payload::Relationship(rel) => rel,
            other => panic!("expected relationship payload, got {:?}", other),
        }
    }

    fn assert_batch(events: &[ChangeEvent], count: usize) {
        assert_eq!(events.len(), count);
        for (position, event) in events.iter().enumerate() {
            assert_eq!(event.meta.tx_event_id, position);
            assert_eq!(event.meta.tx_events_count, count);
        }
    }

    #[test]
    fn test_created_nodes() {
        let mut graph = MemoryGraph::new();
        let events = commit(
            &mut graph,
            vec![
                Mutation::create_node(1, ["Person"], props(json!({"name": "Omar", "age": 30}))),
                Mutation::create_node(2, ["Person"], props(json!({"name": "Andrea", "age": 31}))),
            ],
        );

        assert_batch(&events, 2);
        for event in &events {
            assert_eq!(event.operation(), OperationType::Created);
            assert_eq!(event.meta.source["hostname"], "test-host");
            assert!(node(event).before.is_none());
        }
        assert_eq!(node(&events[0]).id, "1");
        assert_eq!(
            node(&events[1]).after.as_ref().unwrap().properties,
            props(json!({"name": "Andrea", "age": 31}))
        );
    }

    #[test]
    fn test_updated_nodes_report_net_change() {
        let mut graph = MemoryGraph::new();
        seed_people(&mut graph);

        let events = commit(
            &mut graph,
            vec![
                Mutation::AddLabel { node: 1, label: "Test".to_string() },
                Mutation::RemoveLabel { node: 1, label: "Person".to_string() },
                Mutation::set_node_property(1, "age", 31),
                Mutation::set_node_property(1, "surname", "unknown"),
                Mutation::RemoveNodeProperty { node: 1, key: "name".to_string() },
                Mutation::AddLabel { node: 2, label: "Marked".to_string() },
            ],
        );

        assert_batch(&events, 2);
        assert!(events.iter().all(|e| e.operation() == OperationType::Updated));

        let omar = node(&events[0]);
        let before = omar.before.as_ref().unwrap();
        let after = omar.after.as_ref().unwrap();
        assert_eq!(before.properties, props(json!({"name": "Omar", "age": 30})));
        assert_eq!(before.labels, vec!["Person"]);
        assert_eq!(after.properties, props(json!({"age": 31, "surname": "unknown"})));
        assert_eq!(after.labels, vec!["Test"]);

        let andrea = node(&events[1]);
        assert_eq!(
            andrea.before.as_ref().unwrap().properties,
            props(json!({"name": "Andrea", "age": 31}))
        );
        assert_eq!(andrea.after.as_ref().unwrap().labels, vec!["Person", "Marked"]);
    }

    #[test]
    fn test_deleted_node_carries_before_state() {
        let mut graph = MemoryGraph::new();
        seed_people(&mut graph);
        commit(
            &mut graph,
            vec![Mutation::AddLabel { node: 2, label: "Marked".to_string() }],
        );

        let events = commit(&mut graph, vec![Mutation::DeleteNode { id: 2 }]);

        assert_batch(&events, 1);
        assert_eq!(events[0].operation(), OperationType::Deleted);
        let payload = node(&events[0]);
        assert!(payload.after.is_none());
        let before = payload.before.as_ref().unwrap();
        assert_eq!(before.labels, vec!["Person", "Marked"]);
        assert_eq!(before.properties, props(json!({"name": "Andrea", "age": 31})));
    }

    #[test]
    fn test_cancelling_mutations_emit_nothing() {
        let mut graph = MemoryGraph::new();
        seed_people(&mut graph);

        let events = commit(
            &mut graph,
            vec![
                Mutation::set_node_property(1, "age", 99),
                Mutation::set_node_property(1, "age", 30),
                Mutation::AddLabel { node: 1, label: "Temp".to_string() },
                Mutation::RemoveLabel { node: 1, label: "Temp".to_string() },
                Mutation::create_node(5, ["Ghost"], Properties::new()),
                Mutation::DeleteNode { id: 5 },
            ],
        );

        assert!(events.is_empty());
    }

    #[test]
    fn test_relationship_lifecycle() {
        let mut graph = MemoryGraph::new();
        seed_people(&mut graph);

        let created = commit(
            &mut graph,
            vec![Mutation::create_relationship(10, "KNOWS", 1, 2, Properties::new())],
        );
        assert_batch(&created, 1);
        assert_eq!(created[0].operation(), OperationType::Created);
        let rel = relationship(&created[0]);
        assert_eq!(rel.label, "KNOWS");
        assert_eq!(rel.start.id, "1");
        assert_eq!(rel.end.labels, vec!["Person"]);

        let updated = commit(
            &mut graph,
            vec![Mutation::set_relationship_property(10, "touched", true)],
        );
        assert_batch(&updated, 1);
        assert_eq!(updated[0].operation(), OperationType::Updated);
        assert_eq!(
            relationship(&updated[0]).after.as_ref().unwrap().properties,
            props(json!({"touched": true}))
        );

        let deleted = commit(&mut graph, vec![Mutation::DeleteRelationship { id: 10 }]);
        assert_batch(&deleted, 1);
        assert_eq!(deleted[0].operation(), OperationType::Deleted);
        assert!(relationship(&deleted[0]).after.is_none());
    }

    #[test]
    fn test_detach_delete_orders_nodes_before_relationships() {
        let mut graph = MemoryGraph::new();
        commit(
            &mut graph,
            vec![
                Mutation::create_node(1, ["Person", "Start"], props(json!({"name": "Omar"}))),
                Mutation::create_node(2, ["Person", "End"], props(json!({"name": "Andrea"}))),
                Mutation::create_relationship(10, "KNOWS", 1, 2, props(json!({"since": 2019}))),
            ],
        );

        let mut mutations = graph.detach_delete(1);
        mutations.extend(graph.detach_delete(2).into_iter().filter(|m| {
            !matches!(m, Mutation::DeleteRelationship { id: 10 })
        }));
        assert!(matches!(mutations[0], Mutation::DeleteRelationship { id: 10 }));

        let events = commit(&mut graph, mutations);

        assert_batch(&events, 3);
        assert!(events.iter().all(|e| e.operation() == OperationType::Deleted));
        assert!(matches!(events[0].payload, Payload::Node(_)));
        assert!(matches!(events[1].payload, Payload::Node(_)));

        let rel = relationship(&events[2]);
        assert_eq!(rel.start.labels, vec!["Person", "Start"]);
        assert_eq!(rel.end.labels, vec!["Person", "End"]);
        assert_eq!(graph.node_count(), 0);
    }

    #[test]
    fn test_relationship_to_node_created_in_same_transaction() {
        let mut graph = MemoryGraph::new();
        let events = commit(
            &mut graph,
            vec![
                Mutation::create_node(1, ["Person"], Properties::new()),
                Mutation::create_relationship(10, "OWNS", 1, 1, Properties::new()),
                Mutation::create_node(2, ["Car"], Properties::new()),
            ],
        );

        assert_batch(&events, 3);
        assert!(matches!(events[1].payload, Payload::Node(_)));
        assert_eq!(relationship(&events[2]).start.labels, vec!["Person"]);
    }

    #[test]
    fn test_unknown_entity_aborts_whole_batch() {
        let mut graph = MemoryGraph::new();
        seed_people(&mut graph);

        let tx = Transaction::new(
            42,
            &graph,
            vec![
                Mutation::set_node_property(1, "age", 40),
                Mutation::set_node_property(99, "age", 1),
            ],
        );
        let err = create_extractor().extract(&tx).unwrap_err();

        match err {
            Error::Extraction { tx_id, message } => {
                assert_eq!(tx_id, 42);
                assert!(message.contains("node 99"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_mutation_after_delete_is_rejected() {
        let mut graph = MemoryGraph::new();
        seed_people(&mut graph);

        let tx = Transaction::new(
            7,
            &graph,
            vec![
                Mutation::DeleteNode { id: 1 },
                Mutation::set_node_property(1, "age", 40),
            ],
        );
        assert!(matches!(
            create_extractor().extract(&tx),
            Err(Error::Extraction { .. })
        ));
    }

    #[test]
    fn test_event_serializes_with_camel_case_meta() {
        let mut graph = MemoryGraph::new();
        let events = commit(
            &mut graph,
            vec![Mutation::create_node(1, ["Person"], props(json!({"name": "Omar"})))],
        );

        let value = serde_json::to_value(&events[0]).unwrap();
        assert_eq!(value["meta"]["txEventId"], 0);
        assert_eq!(value["meta"]["txEventsCount"], 1);
        assert_eq!(value["meta"]["operation"], "created");
        assert_eq!(value["payload"]["type"], "node");
        assert_eq!(value["payload"]["after"]["labels"], json!(["Person"]));
    }
}
