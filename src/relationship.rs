use serde::{Deserialize, Serialize};
use std::fmt;

/// What should happen to a relationship in SpiceDB.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OperationType {
    /// Idempotent upsert.
    Touch,
    /// Removal.
    Delete,
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationType::Touch => write!(f, "touch"),
            OperationType::Delete => write!(f, "delete"),
        }
    }
}

/// A directed edge in the authorization graph: `resource#relation@subject`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Relationship {
    pub resource_type: String,
    pub resource_id: String,
    pub relation: String,
    pub subject_type: String,
    pub subject_id: String,
}

impl fmt::Display for Relationship {
    /// Renders the canonical key form, e.g. `article:1#tags@tags:2`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}#{}@{}:{}",
            self.resource_type, self.resource_id, self.relation, self.subject_type, self.subject_id
        )
    }
}

/// An operation plus the relationship it applies to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Operation {
    pub op: OperationType,
    pub rel: Relationship,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relationship_key_format() {
        let rel = Relationship {
            resource_type: "article".to_string(),
            resource_id: "1".to_string(),
            relation: "tags".to_string(),
            subject_type: "tag".to_string(),
            subject_id: "2".to_string(),
        };
        assert_eq!(rel.to_string(), "article:1#tags@tag:2");
    }

    #[test]
    fn test_operation_type_display() {
        assert_eq!(OperationType::Touch.to_string(), "touch");
        assert_eq!(OperationType::Delete.to_string(), "delete");
    }
}
