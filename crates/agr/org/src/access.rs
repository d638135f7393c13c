//! Group access policies.
//!
//! A policy decides whether a requester may take a role, given the
//! credential it presents. Every requester goes through it, the group's
//! creator included.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use crate::overlooker::panic_reason;

/// Opaque proof presented by a requester.
pub type Credential = serde_json::Value;

pub trait AccessPolicy: Send + Sync {
    fn allow(&self, role: &str, credential: Option<&Credential>) -> bool;
}

impl<F> AccessPolicy for F
where
    F: Fn(&str, Option<&Credential>) -> bool + Send + Sync,
{
    fn allow(&self, role: &str, credential: Option<&Credential>) -> bool {
        self(role, credential)
    }
}

/// Admits everyone. The policy of groups created without one.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl AccessPolicy for AllowAll {
    fn allow(&self, _role: &str, _credential: Option<&Credential>) -> bool {
        true
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DenyAll;

impl AccessPolicy for DenyAll {
    fn allow(&self, _role: &str, _credential: Option<&Credential>) -> bool {
        false
    }
}

/// Admits a requester whose credential equals the expected value.
#[derive(Debug, Clone)]
pub struct SharedSecret(pub Credential);

impl AccessPolicy for SharedSecret {
    fn allow(&self, _role: &str, credential: Option<&Credential>) -> bool {
        credential == Some(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Verdict {
    Allowed,
    Denied,
    Panicked(String),
}

pub(crate) fn evaluate(
    policy: &Arc<dyn AccessPolicy>,
    role: &str,
    credential: Option<&Credential>,
) -> Verdict {
    match catch_unwind(AssertUnwindSafe(|| policy.allow(role, credential))) {
        Ok(true) => Verdict::Allowed,
        Ok(false) => Verdict::Denied,
        Err(panic) => Verdict::Panicked(panic_reason(panic.as_ref())),
    }
}
