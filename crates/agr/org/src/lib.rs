//! AGR organization.
//!
//! The Community/Group/Role tree of one kernel:
//! - [`Organization`]: structure, membership, queries and peer synchronization
//! - [`Role`]: per-role membership under its own lock, with a cached view
//! - [`Overlooker`]: live views over one role, fed through [`RoleObserver`]
//! - [`Watcher`]: probes owned by one agent
//! - [`AccessPolicy`]: admission of role requesters

#![deny(unsafe_code)]

pub mod access;
pub mod community;
pub mod group;
mod ordered;
pub mod organization;
pub mod overlooker;
pub mod role;
pub mod watcher;

pub use access::{AccessPolicy, AllowAll, Credential, DenyAll, SharedSecret};
pub use community::Community;
pub use group::Group;
pub use organization::{CrashReport, OrgListener, Organization, Route, CRASH_REPORT_CAPACITY};
pub use overlooker::{panic_reason, NoopObserver, Overlooker, OverlookerId, RoleObserver};
pub use role::Role;
pub use watcher::Watcher;
