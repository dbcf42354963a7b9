//! Opaque identifier newtypes.
//!
//! All runtime identifiers are opaque strings tagged by kind. Identifiers
//! are never reused and never mutated once assigned. Generated kinds use
//! UUIDv4.

use std::fmt;

use serde::{Deserialize, Serialize};

macro_rules! opaque_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Wrap an existing identifier string.
            #[must_use]
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Returns the identifier as a string slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self(id.to_owned())
            }
        }

        impl From<String> for $name {
            fn from(id: String) -> Self {
                Self(id)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

macro_rules! generated_id {
    ($name:ident) => {
        impl $name {
            /// Generate a fresh random identifier (UUIDv4).
            #[must_use]
            pub fn generate() -> Self {
                Self(uuid::Uuid::new_v4().to_string())
            }
        }
    };
}

opaque_id! {
    /// User-assigned identifier of an agent manifest.
    AgentId
}

opaque_id! {
    /// Identifier of one top-level run, generated on fresh start.
    RunId
}

opaque_id! {
    /// Identifier of a single tool invocation within a step.
    ToolCallId
}

opaque_id! {
    /// Identifier of one pending human approval.
    ApprovalId
}

generated_id!(RunId);
generated_id!(ToolCallId);
generated_id!(ApprovalId);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_opaque_strings() {
        let id = AgentId::new("researcher");
        assert_eq!(id.as_str(), "researcher");
        assert_eq!(id.to_string(), "researcher");
    }

    #[test]
    fn generated_ids_are_unique() {
        assert_ne!(RunId::generate(), RunId::generate());
        assert_ne!(ToolCallId::generate(), ToolCallId::generate());
        assert_ne!(ApprovalId::generate(), ApprovalId::generate());
    }

    #[test]
    fn serde_is_transparent() {
        let id = RunId::new("r-123");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, r#""r-123""#);
        let parsed: RunId = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn ids_of_different_kinds_are_distinct_types() {
        // Compile-time property; the test just exercises conversions.
        let agent: AgentId = "a".into();
        let run: RunId = String::from("a").into();
        assert_eq!(agent.as_str(), run.as_str());
    }
}
