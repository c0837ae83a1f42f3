//! Message identifiers.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Suffix appended to a message id to track second-level delivery attempts.
pub const SECOND_LEVEL_SUFFIX: &str = "-2nd-level";

/// Identifier of a logical delivery chain.
///
/// Transports may hand us ids minted by other systems, so this wraps an arbitrary
/// string rather than a UUID. Ids minted locally are UUIDv7 (time-ordered).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    /// Mint a new identifier.
    pub fn new() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Identifier under which second-level attempts of this message are tracked.
    pub fn second_level(&self) -> MessageId {
        MessageId(format!("{}{}", self.0, SECOND_LEVEL_SUFFIX))
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Display for MessageId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for MessageId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for MessageId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl AsRef<str> for MessageId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_level_id_appends_suffix() {
        let id = MessageId::from("abc");
        assert_eq!(id.second_level().as_str(), "abc-2nd-level");
    }

    #[test]
    fn minted_ids_are_unique() {
        assert_ne!(MessageId::new(), MessageId::new());
    }
}
