use crate::{events::ChangeEvent, Result};

/// Encodes change events as compact JSON message bodies.
pub struct JsonSerializer;

impl JsonSerializer {
    pub fn serialize(event: &ChangeEvent) -> Result<Vec<u8>> {
        serde_json::to_vec(event).map_err(Into::into)
    }
}
