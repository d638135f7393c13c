//! Identity types for the AGR mesh

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use uuid::Uuid;

/// Identity of one running kernel instance.
///
/// Assigned once at kernel start and never reused: a random token plus the
/// creation timestamp. Ordered by creation time, then token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KernelId {
    token: Uuid,
    created_at: DateTime<Utc>,
}

impl KernelId {
    pub fn generate() -> Self {
        Self {
            token: Uuid::new_v4(),
            created_at: Utc::now(),
        }
    }

    pub fn token(&self) -> Uuid {
        self.token
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// First eight hex digits of the token, for log lines.
    pub fn short(&self) -> String {
        self.token.simple().to_string()[..8].to_string()
    }
}

impl PartialOrd for KernelId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for KernelId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.created_at
            .cmp(&other.created_at)
            .then(self.token.cmp(&other.token))
    }
}

impl fmt::Display for KernelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "kernel:{}", self.short())
    }
}

/// Unique identifier of an agent, valid across the whole mesh.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AgentId(Uuid);

impl AgentId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for AgentId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "agent:{}", &self.0.simple().to_string()[..8])
    }
}

/// Unique identifier of a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(Uuid);

impl MessageId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "message:{}", self.0)
    }
}
