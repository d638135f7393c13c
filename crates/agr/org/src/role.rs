//! Role: the unit of membership and addressing.
//!
//! A role keeps the insertion-ordered set of its local players and, once
//! remote-visible state is needed, the full list of member addresses (local
//! and remote). All of it sits behind one lock per role. Overlookers are
//! notified synchronously under that lock.
//!
//! The lock is re-entrant so an overlooker callback may read the view of the
//! role it observes. No state borrow is held while callbacks run.

use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use agr_types::{AgentAddress, AgentId, Cgr, KernelId};
use parking_lot::{ReentrantMutex, ReentrantMutexGuard};
use tracing::{debug, trace};

use crate::ordered::OrderedSet;
use crate::overlooker::{Overlooker, OverlookerId};

/// Result of adding a local player.
#[derive(Debug)]
pub(crate) enum JoinOutcome {
    Joined(AgentAddress),
    AlreadyHeld,
    /// The role was emptied and is being unlinked; look it up again.
    Retired,
}

/// Result of removing a local player.
#[derive(Debug)]
pub(crate) enum LeaveOutcome {
    Left { address: AgentAddress, emptied: bool },
    NotHeld,
}

struct RoleState {
    players: OrderedSet<AgentId>,
    /// Built lazily: local players plus remote members.
    addresses: Option<OrderedSet<AgentAddress>>,
    /// Cached view; `None` when dirty.
    view: Option<Arc<[AgentAddress]>>,
    overlookers: Vec<Arc<Overlooker>>,
}

impl RoleState {
    fn is_empty(&self) -> bool {
        self.players.is_empty() && self.addresses.as_ref().map_or(true, |a| a.is_empty())
    }
}

/// A role of one group, as seen by one kernel.
pub struct Role {
    cgr: Cgr,
    kernel: KernelId,
    retired: AtomicBool,
    state: ReentrantMutex<RefCell<RoleState>>,
}

impl Role {
    fn with_state(cgr: Cgr, kernel: KernelId, state: RoleState) -> Self {
        debug!(cgr = %cgr, "Role created");
        Self {
            cgr,
            kernel,
            retired: AtomicBool::new(false),
            state: ReentrantMutex::new(RefCell::new(state)),
        }
    }

    /// A new role whose first member is the local agent `agent`.
    pub(crate) fn with_player(cgr: Cgr, kernel: KernelId, agent: AgentId) -> (Self, AgentAddress) {
        let address = AgentAddress::new(agent, cgr.clone(), kernel);
        let mut players = OrderedSet::new();
        players.insert(agent);
        let state = RoleState {
            players,
            addresses: None,
            view: None,
            overlookers: Vec::new(),
        };
        (Self::with_state(cgr, kernel, state), address)
    }

    /// A new role populated only by remote members.
    pub(crate) fn with_remote(cgr: Cgr, kernel: KernelId, members: &[AgentAddress]) -> Self {
        let addresses = members
            .iter()
            .filter(|a| !a.is_local_to(&kernel))
            .map(|a| AgentAddress::new(a.agent(), cgr.clone(), a.kernel()))
            .collect();
        let state = RoleState {
            players: OrderedSet::new(),
            addresses: Some(addresses),
            view: None,
            overlookers: Vec::new(),
        };
        Self::with_state(cgr, kernel, state)
    }

    pub fn cgr(&self) -> &Cgr {
        &self.cgr
    }

    pub fn name(&self) -> &str {
        &self.cgr.role
    }

    /// Whether the role was emptied and no longer belongs to its group.
    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::Acquire)
    }

    fn lock(&self) -> ReentrantMutexGuard<'_, RefCell<RoleState>> {
        self.state.lock()
    }

    fn local_address(&self, agent: AgentId) -> AgentAddress {
        AgentAddress::new(agent, self.cgr.clone(), self.kernel)
    }

    fn build_addresses<'a>(&self, state: &'a mut RoleState) -> &'a mut OrderedSet<AgentAddress> {
        let players = &state.players;
        state
            .addresses
            .get_or_insert_with(|| players.iter().map(|a| self.local_address(*a)).collect())
    }

    fn cached_view(&self, state: &mut RoleState) -> Arc<[AgentAddress]> {
        if let Some(view) = &state.view {
            return view.clone();
        }
        let view: Arc<[AgentAddress]> = match &state.addresses {
            Some(addresses) => addresses.iter().cloned().collect(),
            None => state.players.iter().map(|a| self.local_address(*a)).collect(),
        };
        state.view = Some(view.clone());
        view
    }

    /// Mark retired and detach every overlooker. Called with the lock held.
    fn retire(&self, guard: &ReentrantMutexGuard<'_, RefCell<RoleState>>) {
        self.retired.store(true, Ordering::Release);
        let overlookers = std::mem::take(&mut guard.borrow_mut().overlookers);
        for overlooker in &overlookers {
            overlooker.unbind();
            overlooker.deliver_detached();
        }
        debug!(cgr = %self.cgr, "Role emptied, retiring");
    }

    fn fan_out(overlookers: &[Arc<Overlooker>], members: &[AgentAddress], joined: bool) {
        for member in members {
            for overlooker in overlookers {
                overlooker.deliver(member, joined);
            }
        }
    }

    // --- Local membership ---

    pub(crate) fn add_player(&self, agent: AgentId) -> JoinOutcome {
        let guard = self.lock();
        let (address, overlookers) = {
            let mut state = guard.borrow_mut();
            if self.is_retired() {
                return JoinOutcome::Retired;
            }
            if !state.players.insert(agent) {
                return JoinOutcome::AlreadyHeld;
            }
            let address = self.local_address(agent);
            if let Some(addresses) = state.addresses.as_mut() {
                addresses.insert(address.clone());
            }
            state.view = None;
            (address, state.overlookers.clone())
        };
        trace!(agent = %agent, cgr = %self.cgr, "Agent now playing role");
        Self::fan_out(&overlookers, std::slice::from_ref(&address), true);
        JoinOutcome::Joined(address)
    }

    pub(crate) fn remove_player(&self, agent: AgentId) -> LeaveOutcome {
        let guard = self.lock();
        let (address, overlookers, emptied) = {
            let mut state = guard.borrow_mut();
            if !state.players.remove(&agent) {
                return LeaveOutcome::NotHeld;
            }
            let address = self.local_address(agent);
            if let Some(addresses) = state.addresses.as_mut() {
                addresses.remove(&address);
            }
            state.view = None;
            (address, state.overlookers.clone(), state.is_empty())
        };
        trace!(agent = %agent, cgr = %self.cgr, "Agent left role");
        Self::fan_out(&overlookers, std::slice::from_ref(&address), false);
        let emptied = emptied && guard.borrow().is_empty();
        if emptied {
            self.retire(&guard);
        }
        LeaveOutcome::Left { address, emptied }
    }

    pub fn contains_player(&self, agent: AgentId) -> bool {
        self.lock().borrow().players.contains(&agent)
    }

    /// Local players in join order.
    pub fn players(&self) -> Vec<AgentId> {
        self.lock().borrow().players.iter().copied().collect()
    }

    pub fn address_of(&self, agent: AgentId) -> Option<AgentAddress> {
        self.contains_player(agent)
            .then(|| self.local_address(agent))
    }

    // --- Remote membership ---

    /// Merge remote members. Returns `None` if the role is retired.
    pub(crate) fn add_remote(&self, members: &[AgentAddress]) -> Option<usize> {
        let guard = self.lock();
        let (added, overlookers) = {
            let mut state = guard.borrow_mut();
            if self.is_retired() {
                return None;
            }
            let addresses = self.build_addresses(&mut state);
            let mut added = Vec::new();
            for member in members.iter().filter(|m| !m.is_local_to(&self.kernel)) {
                let member = AgentAddress::new(member.agent(), self.cgr.clone(), member.kernel());
                if addresses.insert(member.clone()) {
                    added.push(member);
                }
            }
            if !added.is_empty() {
                state.view = None;
            }
            (added, state.overlookers.clone())
        };
        if !added.is_empty() {
            trace!(cgr = %self.cgr, count = added.len(), "Imported remote members");
            Self::fan_out(&overlookers, &added, true);
        }
        Some(added.len())
    }

    /// Remove one remote member. Returns `Some(emptied)` if it was present.
    pub(crate) fn remove_remote(&self, member: &AgentAddress) -> Option<bool> {
        if member.is_local_to(&self.kernel) {
            return None;
        }
        let guard = self.lock();
        let (removed, overlookers) = {
            let mut state = guard.borrow_mut();
            let removed = match state.addresses.as_mut() {
                Some(addresses) => addresses.remove(member),
                None => false,
            };
            if !removed {
                return None;
            }
            state.view = None;
            (AgentAddress::new(member.agent(), self.cgr.clone(), member.kernel()), state.overlookers.clone())
        };
        trace!(member = %removed, "Remote member left role");
        Self::fan_out(&overlookers, std::slice::from_ref(&removed), false);
        let emptied = guard.borrow().is_empty();
        if emptied {
            self.retire(&guard);
        }
        Some(emptied)
    }

    /// Remove every member hosted by `kernel`. Returns the number removed and
    /// whether the role is now empty.
    pub(crate) fn purge_kernel(&self, kernel: &KernelId) -> (usize, bool) {
        let guard = self.lock();
        let (removed, overlookers) = {
            let mut state = guard.borrow_mut();
            let removed = match state.addresses.as_mut() {
                Some(addresses) => addresses.remove_where(|a| a.kernel() == *kernel),
                None => Vec::new(),
            };
            if removed.is_empty() {
                return (0, false);
            }
            state.view = None;
            (removed, state.overlookers.clone())
        };
        Self::fan_out(&overlookers, &removed, false);
        let emptied = guard.borrow().is_empty();
        if emptied {
            self.retire(&guard);
        }
        (removed.len(), emptied)
    }

    /// Whether `address` is a member of this role, local or remote.
    pub fn contains_address(&self, address: &AgentAddress) -> bool {
        let guard = self.lock();
        let state = guard.borrow();
        if address.is_local_to(&self.kernel) {
            state.players.contains(&address.agent())
        } else {
            state
                .addresses
                .as_ref()
                .map_or(false, |addresses| addresses.contains(address))
        }
    }

    /// Addresses of the local players, as exported to peers.
    pub fn exported_addresses(&self) -> Vec<AgentAddress> {
        let guard = self.lock();
        let mut state = guard.borrow_mut();
        let kernel = self.kernel;
        self.build_addresses(&mut state)
            .iter()
            .filter(|a| a.is_local_to(&kernel))
            .cloned()
            .collect()
    }

    // --- Views ---

    /// Every member address in role order. Rebuilt at most once between
    /// two mutations.
    pub fn view(&self) -> Arc<[AgentAddress]> {
        let guard = self.lock();
        let mut state = guard.borrow_mut();
        self.cached_view(&mut state)
    }

    pub fn len(&self) -> usize {
        let guard = self.lock();
        let state = guard.borrow();
        match &state.addresses {
            Some(addresses) => addresses.len(),
            None => state.players.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.lock().borrow().is_empty()
    }

    // --- Overlookers ---

    /// Attach an overlooker and seed it with every current member.
    /// Returns false if it was already attached, removed, or the role is
    /// retired.
    pub(crate) fn attach(self: &Arc<Self>, overlooker: &Arc<Overlooker>) -> bool {
        let guard = self.lock();
        let members = {
            let mut state = guard.borrow_mut();
            if self.is_retired()
                || overlooker.is_removed()
                || state.overlookers.iter().any(|o| o.id() == overlooker.id())
            {
                return false;
            }
            state.overlookers.push(overlooker.clone());
            overlooker.bind(Arc::downgrade(self));
            self.cached_view(&mut state)
        };
        debug!(overlooker = %overlooker.id(), cgr = %self.cgr, members = members.len(), "Overlooker attached");
        for member in members.iter() {
            overlooker.deliver(member, true);
        }
        true
    }

    pub(crate) fn detach(&self, id: OverlookerId) -> bool {
        let guard = self.lock();
        let mut state = guard.borrow_mut();
        match state.overlookers.iter().position(|o| o.id() == id) {
            Some(index) => {
                let overlooker = state.overlookers.remove(index);
                overlooker.unbind();
                true
            }
            None => false,
        }
    }

    pub fn overlooker_count(&self) -> usize {
        self.lock().borrow().overlookers.len()
    }
}

impl std::fmt::Debug for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Role")
            .field("cgr", &self.cgr)
            .field("retired", &self.is_retired())
            .finish()
    }
}
