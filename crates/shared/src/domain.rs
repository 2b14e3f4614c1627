use serde::{Deserialize, Serialize};

use crate::error::InvalidEntityId;

/// Addressable resource identifier in `domain.name` form, e.g.
/// `light.kitchen`. The domain part selects the action table entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(String);

impl EntityId {
    pub fn parse(raw: impl Into<String>) -> Result<Self, InvalidEntityId> {
        let raw = raw.into();
        match raw.split_once('.') {
            Some((domain, name))
                if !domain.is_empty()
                    && !name.is_empty()
                    && domain.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') =>
            {
                Ok(Self(raw))
            }
            _ => Err(InvalidEntityId(raw)),
        }
    }

    pub fn domain(&self) -> &str {
        // validated in `parse`
        self.0.split_once('.').map(|(domain, _)| domain).unwrap_or("")
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for EntityId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}
