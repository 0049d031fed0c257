//! Domain entities: core data structures

use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::extension::Extensions;

/// Side of the root a top-level branch is laid out on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    Left,
    Right,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Left => "left",
            Side::Right => "right",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "left" => Some(Side::Left),
            "right" => Some(Side::Right),
            _ => None,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payload of a map node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeData {
    /// Map-unique identifier, e.g. `ID_1723498811`
    pub id: String,
    /// Text content
    pub text: String,
    /// Subtree rendered collapsed (view hint only)
    pub folded: bool,
    /// Layout side; only meaningful for children of the root
    pub side: Option<Side>,
    /// Attached capabilities (encryption, icons, links)
    pub extensions: Extensions,
}

impl NodeData {
    pub fn new(text: impl Into<String>) -> Self {
        Self::with_id(generate_node_id(), text)
    }

    pub fn with_id(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            text: text.into(),
            folded: false,
            side: None,
            extensions: Extensions::new(),
        }
    }

    /// True unless an encryption capability is attached and currently locked.
    pub fn is_accessible(&self) -> bool {
        self.extensions
            .encryption()
            .map(|e| e.is_accessible())
            .unwrap_or(true)
    }
}

impl fmt::Display for NodeData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.text)
    }
}

/// Generate a new node id in the `ID_<digits>` form used by map documents.
pub fn generate_node_id() -> String {
    format!("ID_{}", Uuid::new_v4().as_u128() % 10_000_000_000)
}

/// Identity of the running editing session, written into lock records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionIdentity {
    pub user: String,
    pub host: String,
    pub pid: u32,
    /// Unique per session, so two sessions of one process still conflict
    pub session: String,
}

impl SessionIdentity {
    pub fn new(user: impl Into<String>, host: impl Into<String>, pid: u32) -> Self {
        Self {
            user: user.into(),
            host: host.into(),
            pid,
            session: Uuid::new_v4().to_string(),
        }
    }
}

/// Claim on a map file, stored in the lock file next to it.
///
/// `host`, `pid` and `session` are absent for legacy lock files that only
/// contain a user name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    pub user: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session: Option<String>,
    pub created_at: DateTime<Utc>,
    pub refreshed_at: DateTime<Utc>,
}

impl LockRecord {
    pub fn claim(identity: &SessionIdentity, now: DateTime<Utc>) -> Self {
        Self {
            user: identity.user.clone(),
            host: Some(identity.host.clone()),
            pid: Some(identity.pid),
            session: Some(identity.session.clone()),
            created_at: now,
            refreshed_at: now,
        }
    }

    /// Record for a lock file holding nothing but a user name.
    pub fn legacy(user: impl Into<String>, modified: DateTime<Utc>) -> Self {
        Self {
            user: user.into(),
            host: None,
            pid: None,
            session: None,
            created_at: modified,
            refreshed_at: modified,
        }
    }

    pub fn is_held_by(&self, identity: &SessionIdentity) -> bool {
        self.session.as_deref() == Some(identity.session.as_str())
    }

    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        now - self.refreshed_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn given_two_sessions_of_same_process_then_identities_differ() {
        let a = SessionIdentity::new("alice", "host", 42);
        let b = SessionIdentity::new("alice", "host", 42);
        assert_ne!(a.session, b.session);

        let record = LockRecord::claim(&a, Utc::now());
        assert!(record.is_held_by(&a));
        assert!(!record.is_held_by(&b));
    }

    #[test]
    fn given_generated_ids_then_use_document_prefix() {
        let id = generate_node_id();
        assert!(id.starts_with("ID_"));
        assert!(id[3..].chars().all(|c| c.is_ascii_digit()));
    }

    #[test]
    fn given_side_names_when_parsing_then_case_insensitive() {
        assert_eq!(Side::parse("LEFT"), Some(Side::Left));
        assert_eq!(Side::parse(" right "), Some(Side::Right));
        assert_eq!(Side::parse("up"), None);
    }
}
