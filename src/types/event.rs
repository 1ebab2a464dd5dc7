//! Kinds of branch notifications received from the server.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The event kind carried by the `X-Gitea-Event` header.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Push,
    Create,
    Delete,
    /// Any other event kind; treated like a push.
    Other(String),
}

impl EventKind {
    pub fn parse(header: &str) -> Self {
        match header.trim().to_ascii_lowercase().as_str() {
            "push" => EventKind::Push,
            "create" => EventKind::Create,
            "delete" => EventKind::Delete,
            other => EventKind::Other(other.to_string()),
        }
    }

    pub fn is_delete(&self) -> bool {
        matches!(self, EventKind::Delete)
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventKind::Push => f.write_str("push"),
            EventKind::Create => f.write_str("create"),
            EventKind::Delete => f.write_str("delete"),
            EventKind::Other(kind) => f.write_str(kind),
        }
    }
}
