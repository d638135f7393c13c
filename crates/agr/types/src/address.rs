//! Role coordinates and agent addresses

use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};

use crate::ids::{AgentId, KernelId};

/// The `(community, group, role)` name triple locating a Role.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Cgr {
    pub community: String,
    pub group: String,
    pub role: String,
}

impl Cgr {
    pub fn new(
        community: impl Into<String>,
        group: impl Into<String>,
        role: impl Into<String>,
    ) -> Self {
        Self {
            community: community.into(),
            group: group.into(),
            role: role.into(),
        }
    }

    /// Whether this triple addresses a role of the given group.
    pub fn in_group(&self, community: &str, group: &str) -> bool {
        self.community == community && self.group == group
    }
}

impl fmt::Display for Cgr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{};{};{}>", self.community, self.group, self.role)
    }
}

/// Handle identifying one agent holding one role on one kernel.
///
/// Equality and hashing only consider the agent and its kernel: the same
/// agent-at-kernel compares equal whichever role the address was obtained
/// from. The role triple is carried for routing and display.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentAddress {
    agent: AgentId,
    cgr: Cgr,
    kernel: KernelId,
}

impl AgentAddress {
    pub fn new(agent: AgentId, cgr: Cgr, kernel: KernelId) -> Self {
        Self { agent, cgr, kernel }
    }

    pub fn agent(&self) -> AgentId {
        self.agent
    }

    pub fn cgr(&self) -> &Cgr {
        &self.cgr
    }

    pub fn kernel(&self) -> KernelId {
        self.kernel
    }

    pub fn is_local_to(&self, kernel: &KernelId) -> bool {
        self.kernel == *kernel
    }
}

impl PartialEq for AgentAddress {
    fn eq(&self, other: &Self) -> bool {
        self.agent == other.agent && self.kernel == other.kernel
    }
}

impl Eq for AgentAddress {}

impl Hash for AgentAddress {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.agent.hash(state);
        self.kernel.hash(state);
    }
}

impl fmt::Display for AgentAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}{}", self.agent, self.kernel, self.cgr)
    }
}
