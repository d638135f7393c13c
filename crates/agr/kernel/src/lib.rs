//! AGR kernel.
//!
//! Runs agents on top of an [`Organization`](agr_org::Organization):
//! - [`Kernel`]: agent lifecycle, message routing, bootstrap groups, network
//! - [`ThreadTierFactory`]: every thread, in a kernel or an agent tier
//! - [`Mailbox`]: per-agent FIFO with timed waits
//! - [`AgentContext`]: the API an [`Agent`] sees
//! - [`KernelConfig`]: layered configuration for `agrd`

#![deny(unsafe_code)]

pub mod agent;
pub mod config;
pub mod error;
pub mod factory;
pub mod kernel;
pub mod mailbox;
pub mod telemetry;
pub mod threads;

pub use agent::{from_fn, Agent, AgentContext, AgentStatus, FnAgent};
pub use config::{BootstrapConfig, BootstrapGroup, KernelConfig, LoggingConfig, NetworkConfig, ThreadsConfig};
pub use error::{KernelError, KernelResult};
pub use factory::AgentFactory;
pub use kernel::{Kernel, TERMINATED_HISTORY};
pub use mailbox::Mailbox;
pub use threads::{ThreadTier, ThreadTierFactory};
