//! Opaque identifiers used throughout the gateway.

use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::fmt;

/// Generates a newtype wrapper around `String` with the usual
/// conversions (`new`, `as_str`, `Display`, `From<String>`, `From<&str>`,
/// `Borrow<str>`) that every identifier in this crate needs.
macro_rules! id_newtype {
    ($name:ident, $doc:expr) => {
        #[doc = $doc]
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(pub String);

        impl $name {
            /// Create a new identifier from any string-like value.
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Generate a fresh random identifier.
            pub fn generate() -> Self {
                Self(uuid::Uuid::new_v4().to_string())
            }

            /// The string value of this identifier.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl Borrow<str> for $name {
            fn borrow(&self) -> &str {
                &self.0
            }
        }

        impl PartialEq<str> for $name {
            fn eq(&self, other: &str) -> bool {
                self.0 == other
            }
        }
    };
}

id_newtype!(WorkerId, "Opaque identifier for a registered worker.");
id_newtype!(PromptId, "Worker-assigned execution identifier returned on submission.");
id_newtype!(GatewayJobId, "Gateway-assigned identifier for a priority-queued submission.");
id_newtype!(ClientId, "Opaque client-supplied correlation string.");

/// Identifier in the history table. Equals [`GatewayJobId`] for priority-path
/// tasks and [`PromptId`] for direct-path tasks; both are plain UUID-shaped
/// strings so the two id spaces are interchangeable at the storage layer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId(pub String);

impl TaskId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn from_prompt_id(id: &PromptId) -> Self {
        Self(id.0.clone())
    }

    pub fn from_gateway_job_id(id: &GatewayJobId) -> Self {
        Self(id.0.clone())
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for TaskId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl Borrow<str> for TaskId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_id_roundtrips_through_string() {
        let id = WorkerId::new("w-1");
        assert_eq!(id.as_str(), "w-1");
        assert_eq!(id.to_string(), "w-1");
    }

    #[test]
    fn generate_produces_distinct_ids() {
        assert_ne!(WorkerId::generate(), WorkerId::generate());
    }

    #[test]
    fn task_id_from_prompt_and_gateway_job_share_representation() {
        let prompt = PromptId::new("p-1");
        let job = GatewayJobId::new("p-1");
        assert_eq!(TaskId::from_prompt_id(&prompt), TaskId::from_gateway_job_id(&job));
    }
}
