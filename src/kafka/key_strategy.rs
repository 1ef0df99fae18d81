use crate::events::{ChangeEvent, Properties};
use crate::{Error, Result};
use serde_json::Value;
use tracing::{debug, warn};

/// How the Kafka message key is derived from a change event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum KeyStrategy {
    /// The node or relationship id.
    #[default]
    EntityId,
    /// Property values of the latest state joined with `:`.
    Properties(Vec<String>),
    None,
}

impl KeyStrategy {
    /// Parses `id`, `none` or `properties:a,b`.
    pub fn parse(value: &str) -> Result<Self> {
        let value = value.trim();
        match value {
            "id" => Ok(KeyStrategy::EntityId),
            "none" => Ok(KeyStrategy::None),
            _ => {
                let fields: Vec<String> = value
                    .strip_prefix("properties:")
                    .map(|list| {
                        list.split(',')
                            .map(str::trim)
                            .filter(|f| !f.is_empty())
                            .map(str::to_string)
                            .collect()
                    })
                    .unwrap_or_default();
                if fields.is_empty() {
                    return Err(Error::Config(format!(
                        "Unknown key strategy `{value}`, expected id, none or properties:<a,b>"
                    )));
                }
                Ok(KeyStrategy::Properties(fields))
            }
        }
    }

    pub fn extract_key(&self, event: &ChangeEvent) -> Option<String> {
        match self {
            KeyStrategy::EntityId => Some(event.entity_id().to_string()),

            KeyStrategy::Properties(fields) => match event.current_properties() {
                Some(properties) => extract_composite_key(properties, fields),
                None => {
                    warn!("No record data available for key extraction");
                    None
                }
            },

            KeyStrategy::None => None,
        }
    }
}

fn extract_field_value(properties: &Properties, field: &str) -> Option<String> {
    match properties.get(field)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Null => None,
        other => Some(other.to_string()),
    }
}

fn extract_composite_key(properties: &Properties, fields: &[String]) -> Option<String> {
    let mut key_parts = Vec::with_capacity(fields.len());

    for field in fields {
        match extract_field_value(properties, field) {
            Some(value) => key_parts.push(value),
            None => {
                debug!("Missing field '{}' for composite key", field);
                return None;
            }
        }
    }

    Some(key_parts.join(":"))
}
