//! Overlookers: live, cached views over one Role's population.
//!
//! An overlooker targets a `(community, group, role)` triple. While the role
//! exists the overlooker is attached to it and receives every membership
//! change through its [`RoleObserver`]; when the role is deleted the
//! overlooker is detached and reports an empty view until the role is
//! created again.

use std::any::Any;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use agr_types::{AgentAddress, Cgr};
use parking_lot::RwLock;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use crate::role::Role;

/// Identifier of an attached overlooker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OverlookerId(Uuid);

impl OverlookerId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for OverlookerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "overlooker:{}", self.0)
    }
}

/// Membership callbacks of an overlooker.
///
/// Called synchronously under the observed role's lock, in attachment
/// order. Reading the overlooker's own view from a callback is allowed.
pub trait RoleObserver: Send + Sync {
    /// A member joined the role (or was present when the overlooker attached).
    fn on_join(&self, member: &AgentAddress);

    /// A member left the role.
    fn on_leave(&self, member: &AgentAddress);

    /// The role was deleted; the overlooker is no longer attached.
    fn on_detached(&self, _cgr: &Cgr) {}
}

/// Observer that only relies on the overlooker's view.
pub struct NoopObserver;

impl RoleObserver for NoopObserver {
    fn on_join(&self, _member: &AgentAddress) {}
    fn on_leave(&self, _member: &AgentAddress) {}
}

/// A live view over the members of one role.
pub struct Overlooker {
    id: OverlookerId,
    cgr: Cgr,
    role: RwLock<Weak<Role>>,
    removed: AtomicBool,
    observer: Box<dyn RoleObserver>,
}

impl Overlooker {
    pub fn new(cgr: Cgr, observer: impl RoleObserver + 'static) -> Arc<Self> {
        Arc::new(Self {
            id: OverlookerId::generate(),
            cgr,
            role: RwLock::new(Weak::new()),
            removed: AtomicBool::new(false),
            observer: Box::new(observer),
        })
    }

    /// An overlooker without callbacks, used only for its view.
    pub fn passive(cgr: Cgr) -> Arc<Self> {
        Self::new(cgr, NoopObserver)
    }

    pub fn id(&self) -> OverlookerId {
        self.id
    }

    pub fn cgr(&self) -> &Cgr {
        &self.cgr
    }

    pub fn is_attached(&self) -> bool {
        self.role().is_some()
    }

    /// Current members, local and remote, in role order.
    pub fn current(&self) -> Arc<[AgentAddress]> {
        match self.role() {
            Some(role) => role.view(),
            None => Arc::from(Vec::new()),
        }
    }

    /// A freshly shuffled copy of the current members.
    pub fn shuffled(&self) -> Vec<AgentAddress> {
        let mut members = self.current().to_vec();
        members.shuffle(&mut rand::thread_rng());
        members
    }

    pub fn size(&self) -> usize {
        self.role().map(|role| role.len()).unwrap_or(0)
    }

    pub(crate) fn role(&self) -> Option<Arc<Role>> {
        self.role.read().upgrade().filter(|role| !role.is_retired())
    }

    pub(crate) fn bind(&self, role: Weak<Role>) {
        *self.role.write() = role;
    }

    pub(crate) fn unbind(&self) {
        *self.role.write() = Weak::new();
    }

    pub(crate) fn mark_removed(&self) {
        self.removed.store(true, Ordering::Release);
    }

    pub(crate) fn is_removed(&self) -> bool {
        self.removed.load(Ordering::Acquire)
    }

    /// Deliver one membership change. A panicking observer is logged and
    /// does not affect the role or the other overlookers.
    pub(crate) fn deliver(&self, member: &AgentAddress, joined: bool) {
        let outcome = catch_unwind(AssertUnwindSafe(|| {
            if joined {
                self.observer.on_join(member)
            } else {
                self.observer.on_leave(member)
            }
        }));
        if let Err(panic) = outcome {
            warn!(
                overlooker = %self.id,
                cgr = %self.cgr,
                member = %member,
                reason = %panic_reason(panic.as_ref()),
                "Overlooker callback panicked"
            );
        }
    }

    pub(crate) fn deliver_detached(&self) {
        let outcome = catch_unwind(AssertUnwindSafe(|| self.observer.on_detached(&self.cgr)));
        if let Err(panic) = outcome {
            warn!(
                overlooker = %self.id,
                cgr = %self.cgr,
                reason = %panic_reason(panic.as_ref()),
                "Overlooker detach callback panicked"
            );
        }
    }
}

impl fmt::Debug for Overlooker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Overlooker")
            .field("id", &self.id)
            .field("cgr", &self.cgr)
            .field("attached", &self.is_attached())
            .finish()
    }
}

impl fmt::Display for Overlooker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Overlooker on {} ({} agents)", self.cgr, self.size())
    }
}

/// Best-effort text of a caught panic payload.
pub fn panic_reason(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
