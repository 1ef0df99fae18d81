//! Source-side routing: which change events go to which topic.
//!
//! ```toml
//! "streams.source.topic.nodes.people" = "Person{name,age}"
//! "streams.source.topic.nodes.people.from.sales" = "Customer{-password}"
//! "streams.source.topic.relationships.knows" = "KNOWS{*}"
//! ```
//!
//! Per-database resolution follows the same rules as sink templates, with
//! `.from.<db>` as the database marker.

use serde::Serialize;
use std::collections::BTreeMap;

use crate::config::{resolve_topic_map, RawConfig};
use crate::events::{ChangeEvent, Payload, Properties};
use crate::kafka::KeyStrategy;
use crate::{Error, Result};

pub const SOURCE_TOPIC_NODES_PREFIX: &str = "streams.source.topic.nodes.";
pub const SOURCE_TOPIC_RELATIONSHIPS_PREFIX: &str = "streams.source.topic.relationships.";
pub const SOURCE_DATABASE_MARKER: &str = ".from.";

const SOURCE_ENABLED: &str = "streams.source.enabled";
const SOURCE_KEY_STRATEGY: &str = "streams.source.key.strategy";
const SOURCE_DISPATCH_BUFFER: &str = "streams.source.dispatch.buffer";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PropertyFilter {
    All,
    Include(Vec<String>),
    Exclude(Vec<String>),
}

impl PropertyFilter {
    fn parse(pattern: &str, body: &str) -> Result<Self> {
        let fields: Vec<&str> = body.split(',').map(str::trim).filter(|f| !f.is_empty()).collect();
        if fields.is_empty() || fields == ["*"] {
            return Ok(PropertyFilter::All);
        }

        let excluded = fields.iter().filter(|f| f.starts_with('-')).count();
        if excluded == fields.len() {
            Ok(PropertyFilter::Exclude(
                fields.iter().map(|f| f.trim_start_matches('-').to_string()).collect(),
            ))
        } else if excluded == 0 && !fields.contains(&"*") {
            Ok(PropertyFilter::Include(fields.iter().map(|f| f.to_string()).collect()))
        } else {
            Err(Error::Config(format!(
                "Pattern `{pattern}` mixes included and excluded properties"
            )))
        }
    }

    pub fn apply(&self, properties: &Properties) -> Properties {
        match self {
            PropertyFilter::All => properties.clone(),
            PropertyFilter::Include(keys) => properties
                .iter()
                .filter(|(k, _)| keys.contains(k))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            PropertyFilter::Exclude(keys) => properties
                .iter()
                .filter(|(k, _)| !keys.contains(k))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodePattern {
    pub labels: Vec<String>,
    pub properties: PropertyFilter,
}

impl NodePattern {
    pub fn matches(&self, labels: &[String]) -> bool {
        self.labels.iter().all(|l| labels.contains(l))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RelationshipPattern {
    pub rel_type: String,
    pub properties: PropertyFilter,
}

/// Splits `Head{a,b}` into `("Head", PropertyFilter)`.
fn split_pattern(pattern: &str) -> Result<(&str, PropertyFilter)> {
    let malformed = || Error::Config(format!("Malformed pattern `{pattern}`"));

    let (head, filter) = match pattern.split_once('{') {
        Some((head, rest)) => {
            let body = rest.strip_suffix('}').ok_or_else(malformed)?;
            (head.trim(), PropertyFilter::parse(pattern, body)?)
        }
        None => (pattern.trim(), PropertyFilter::All),
    };
    if head.is_empty() {
        return Err(malformed());
    }
    Ok((head, filter))
}

pub fn parse_node_patterns(spec: &str) -> Result<Vec<NodePattern>> {
    spec.split(';')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(|pattern| {
            let (head, properties) = split_pattern(pattern)?;
            let labels: Vec<String> = head
                .split(':')
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(str::to_string)
                .collect();
            Ok(NodePattern { labels, properties })
        })
        .collect()
}

pub fn parse_relationship_patterns(spec: &str) -> Result<Vec<RelationshipPattern>> {
    spec.split(';')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(|pattern| {
            let (head, properties) = split_pattern(pattern)?;
            Ok(RelationshipPattern {
                rel_type: head.to_string(),
                properties,
            })
        })
        .collect()
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SourceRoutes {
    nodes: BTreeMap<String, Vec<NodePattern>>,
    relationships: BTreeMap<String, Vec<RelationshipPattern>>,
    /// Receives every event when no route is configured.
    fallback_topic: Option<String>,
}

impl SourceRoutes {
    pub fn resolve(raw: &RawConfig, target_db: &str, is_default_db: bool) -> Result<Self> {
        let nodes = resolve_topic_map(
            raw,
            SOURCE_TOPIC_NODES_PREFIX,
            SOURCE_DATABASE_MARKER,
            target_db,
            is_default_db,
        )?
        .into_iter()
        .map(|(topic, spec)| Ok((topic, parse_node_patterns(&spec)?)))
        .collect::<Result<BTreeMap<_, _>>>()?;

        let relationships = resolve_topic_map(
            raw,
            SOURCE_TOPIC_RELATIONSHIPS_PREFIX,
            SOURCE_DATABASE_MARKER,
            target_db,
            is_default_db,
        )?
        .into_iter()
        .map(|(topic, spec)| Ok((topic, parse_relationship_patterns(&spec)?)))
        .collect::<Result<BTreeMap<_, _>>>()?;

        let fallback_topic = (nodes.is_empty() && relationships.is_empty()).then(|| target_db.to_string());

        Ok(Self {
            nodes,
            relationships,
            fallback_topic,
        })
    }

    /// Sends everything to one topic.
    pub fn single_topic(topic: impl Into<String>) -> Self {
        Self {
            fallback_topic: Some(topic.into()),
            ..Default::default()
        }
    }

    pub fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self
            .nodes
            .keys()
            .chain(self.relationships.keys())
            .chain(self.fallback_topic.iter())
            .cloned()
            .collect();
        topics.sort();
        topics.dedup();
        topics
    }

    /// Destination topics for `event`, each with the event as filtered by
    /// the first matching pattern of that topic.
    pub fn route(&self, event: &ChangeEvent) -> Vec<(String, ChangeEvent)> {
        if let Some(topic) = &self.fallback_topic {
            return vec![(topic.clone(), event.clone())];
        }

        let mut routed = Vec::new();
        match &event.payload {
            Payload::Node(node) => {
                let labels = node
                    .after
                    .as_ref()
                    .or(node.before.as_ref())
                    .map(|n| n.labels.as_slice())
                    .unwrap_or_default();
                for (topic, patterns) in &self.nodes {
                    if let Some(pattern) = patterns.iter().find(|p| p.matches(labels)) {
                        routed.push((topic.clone(), filtered(event, &pattern.properties)));
                    }
                }
            }
            Payload::Relationship(rel) => {
                for (topic, patterns) in &self.relationships {
                    if let Some(pattern) = patterns.iter().find(|p| p.rel_type == rel.label) {
                        routed.push((topic.clone(), filtered(event, &pattern.properties)));
                    }
                }
            }
        }
        routed
    }
}

fn filtered(event: &ChangeEvent, filter: &PropertyFilter) -> ChangeEvent {
    if *filter == PropertyFilter::All {
        return event.clone();
    }

    let mut event = event.clone();
    match &mut event.payload {
        Payload::Node(node) => {
            for state in node.before.iter_mut().chain(node.after.iter_mut()) {
                state.properties = filter.apply(&state.properties);
            }
        }
        Payload::Relationship(rel) => {
            for state in rel.before.iter_mut().chain(rel.after.iter_mut()) {
                state.properties = filter.apply(&state.properties);
            }
        }
    }
    event
}

/// Everything the outbound side needs for one database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceConfiguration {
    pub enabled: bool,
    pub key_strategy: KeyStrategy,
    pub dispatch_buffer: usize,
    pub routes: SourceRoutes,
}

impl SourceConfiguration {
    pub fn resolve(raw: &RawConfig, target_db: &str, is_default_db: bool) -> Result<Self> {
        let key_strategy = match raw.get(SOURCE_KEY_STRATEGY) {
            Some(value) => KeyStrategy::parse(value)?,
            None => KeyStrategy::default(),
        };
        let dispatch_buffer = raw.get_u64(SOURCE_DISPATCH_BUFFER, 1000)?;
        if dispatch_buffer == 0 {
            return Err(Error::Config(format!(
                "The `{SOURCE_DISPATCH_BUFFER}` property must be greater than zero"
            )));
        }

        Ok(Self {
            enabled: raw.get_bool(SOURCE_ENABLED, true)?,
            key_strategy,
            dispatch_buffer: dispatch_buffer as usize,
            routes: SourceRoutes::resolve(raw, target_db, is_default_db)?,
        })
    }
}
