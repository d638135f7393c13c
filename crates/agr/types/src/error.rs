use thiserror::Error;

use crate::ids::KernelId;

/// Outcome of an organization or delivery request that did not succeed.
///
/// Returned to the calling agent as a value; never a kernel-fatal fault.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OrgError {
    #[error("community not found: {0}")]
    UnknownCommunity(String),

    #[error("group not found: {community};{group}")]
    UnknownGroup { community: String, group: String },

    #[error("access denied to role {role}")]
    AccessDenied { role: String },

    #[error("role already held: {0}")]
    RoleAlreadyHeld(String),

    #[error("role not held: {0}")]
    RoleNotHeld(String),

    #[error("group already exists: {community};{group}")]
    GroupAlreadyExists { community: String, group: String },

    #[error("no live link to {0}")]
    UnreachableKernel(KernelId),

    #[error("empty identifier supplied for {0}")]
    NullIdentifier(&'static str),

    #[error("address no longer resolves: {0}")]
    NotFound(String),
}

pub type OrgResult<T> = Result<T, OrgError>;
