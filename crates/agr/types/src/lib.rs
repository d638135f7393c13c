//! AGR domain types.
//!
//! Shared primitives of the Community/Group/Role organizational model:
//! - Kernel and agent identities
//! - Agent addresses (the symbolic message destinations)
//! - Messages exchanged between agents
//! - Organization snapshots exchanged between kernels
//! - The organizational error taxonomy

#![deny(unsafe_code)]

pub mod address;
pub mod error;
pub mod ids;
pub mod message;
pub mod names;
pub mod snapshot;

pub use address::{AgentAddress, Cgr};
pub use error::{OrgError, OrgResult};
pub use ids::{AgentId, KernelId, MessageId};
pub use message::Message;
pub use snapshot::OrgSnapshot;
