//! The organization of one kernel.
//!
//! Owns the `community → group → role` tree and answers every "who plays
//! what" question asked by agents, the kernel and the network layer.
//!
//! # Locking
//!
//! Every node carries its own lock (`RwLock` for the community and group
//! maps, one re-entrant mutex per role) and no operation holds two of them
//! at once. A node emptied by a removal is first marked retired under its
//! own lock, then unlinked from its parent by pointer identity. Callers that
//! run into a retired node resolve it again from the parent.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, OnceLock};

use agr_types::{AgentAddress, AgentId, Cgr, KernelId, OrgError, OrgResult, OrgSnapshot};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::access::{self, AccessPolicy, AllowAll, Credential, Verdict};
use crate::community::{Community, InsertError};
use crate::group::{Group, RoleJoin};
use crate::overlooker::{Overlooker, OverlookerId};
use crate::role::{LeaveOutcome, Role};

/// Record of an agent flagged for operator attention.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrashReport {
    pub agent: AgentId,
    pub cgr: Option<Cgr>,
    pub reason: String,
    pub at: DateTime<Utc>,
}

/// Where a message for an address must go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Local(AgentId),
    Remote(KernelId),
    NotFound,
}

/// Receives membership changes of local agents in distributed groups.
///
/// Called after the role lock is released.
pub trait OrgListener: Send + Sync {
    fn role_joined(&self, address: &AgentAddress);
    fn role_left(&self, address: &AgentAddress);
}

type Located = (Arc<Community>, Arc<Group>, Arc<Role>);

/// Crash reports kept before the oldest are dropped.
pub const CRASH_REPORT_CAPACITY: usize = 1024;

pub struct Organization {
    kernel: KernelId,
    communities: RwLock<HashMap<String, Arc<Community>>>,
    overlookers: Mutex<Vec<Arc<Overlooker>>>,
    crashes: Mutex<VecDeque<CrashReport>>,
    listener: OnceLock<Arc<dyn OrgListener>>,
}

fn require(value: &str, what: &'static str) -> OrgResult<()> {
    if value.is_empty() {
        Err(OrgError::NullIdentifier(what))
    } else {
        Ok(())
    }
}

impl Organization {
    pub fn new(kernel: KernelId) -> Self {
        Self {
            kernel,
            communities: RwLock::new(HashMap::new()),
            overlookers: Mutex::new(Vec::new()),
            crashes: Mutex::new(VecDeque::new()),
            listener: OnceLock::new(),
        }
    }

    pub fn kernel(&self) -> KernelId {
        self.kernel
    }

    /// Install the membership listener. Only the first call has effect.
    pub fn set_listener(&self, listener: Arc<dyn OrgListener>) -> bool {
        self.listener.set(listener).is_ok()
    }

    // --- Tree navigation ---

    fn community(&self, name: &str) -> Option<Arc<Community>> {
        self.communities
            .read()
            .get(name)
            .filter(|c| !c.is_retired())
            .cloned()
    }

    fn community_or_insert(&self, name: &str) -> Arc<Community> {
        if let Some(community) = self.community(name) {
            return community;
        }
        let mut communities = self.communities.write();
        if let Some(community) = communities.get(name).filter(|c| !c.is_retired()) {
            return community.clone();
        }
        let community = Arc::new(Community::new(name));
        communities.insert(name.to_string(), community.clone());
        community
    }

    fn communities(&self) -> Vec<Arc<Community>> {
        self.communities
            .read()
            .values()
            .filter(|c| !c.is_retired())
            .cloned()
            .collect()
    }

    fn lookup_group(&self, community: &str, group: &str) -> OrgResult<(Arc<Community>, Arc<Group>)> {
        let c = self
            .community(community)
            .ok_or_else(|| OrgError::UnknownCommunity(community.to_string()))?;
        let g = c.group(group).ok_or_else(|| OrgError::UnknownGroup {
            community: community.to_string(),
            group: group.to_string(),
        })?;
        Ok((c, g))
    }

    fn find_role(&self, cgr: &Cgr) -> Option<Located> {
        let community = self.community(&cgr.community)?;
        let group = community.group(&cgr.group)?;
        let role = group.role(&cgr.role)?;
        Some((community, group, role))
    }

    /// Every live role, collected one level at a time.
    fn all_roles(&self) -> Vec<Located> {
        let mut located = Vec::new();
        for community in self.communities() {
            for group in community.groups() {
                for role in group.roles() {
                    located.push((community.clone(), group.clone(), role));
                }
            }
        }
        located
    }

    /// Unlink an emptied role and cascade to its group and community.
    fn unlink(&self, community: &Arc<Community>, group: &Arc<Group>, role: &Arc<Role>) {
        if !group.unlink_role(role) {
            return;
        }
        if !community.unlink_group(group) {
            return;
        }
        let mut communities = self.communities.write();
        if communities
            .get(community.name())
            .map_or(false, |current| Arc::ptr_eq(current, community))
        {
            communities.remove(community.name());
            debug!(community = %community.name(), "Community removed");
        }
    }

    fn notify(&self, distributed: bool, address: &AgentAddress, joined: bool) {
        if !distributed {
            return;
        }
        if let Some(listener) = self.listener.get() {
            if joined {
                listener.role_joined(address);
            } else {
                listener.role_left(address);
            }
        }
    }

    // --- Structure ---

    /// Create a community. Idempotent.
    pub fn create_community(&self, name: &str) -> OrgResult<()> {
        require(name, "community")?;
        self.community_or_insert(name);
        Ok(())
    }

    /// Create a group and grant its creator the `manager` role.
    ///
    /// The community is created if needed. Groups created without a policy
    /// admit every requester.
    pub fn create_group(
        &self,
        creator: AgentId,
        community: &str,
        group: &str,
        distributed: bool,
        policy: Option<Arc<dyn AccessPolicy>>,
    ) -> OrgResult<AgentAddress> {
        require(community, "community")?;
        require(group, "group")?;
        let policy: Arc<dyn AccessPolicy> = policy.unwrap_or_else(|| Arc::new(AllowAll));

        loop {
            let c = self.community_or_insert(community);
            let created = c.insert_group(group, || {
                let (g, address, role) =
                    Group::with_manager(community, group, self.kernel, distributed, policy.clone(), creator);
                (g, (address, role))
            });
            match created {
                Ok((address, role)) => {
                    self.seed_pending(&role);
                    self.notify(distributed, &address, true);
                    info!(
                        community,
                        group,
                        creator = %creator,
                        distributed,
                        "Group created"
                    );
                    return Ok(address);
                }
                Err(InsertError::Exists) => {
                    return Err(OrgError::GroupAlreadyExists {
                        community: community.to_string(),
                        group: group.to_string(),
                    })
                }
                Err(InsertError::Retired) => continue,
            }
        }
    }

    /// Like [`create_group`](Self::create_group) but an existing group is not
    /// an error. Returns whether the group was created.
    pub fn create_group_if_absent(
        &self,
        creator: AgentId,
        community: &str,
        group: &str,
        distributed: bool,
        policy: Option<Arc<dyn AccessPolicy>>,
    ) -> OrgResult<bool> {
        match self.create_group(creator, community, group, distributed, policy) {
            Ok(_) => Ok(true),
            Err(OrgError::GroupAlreadyExists { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    // --- Membership ---

    /// Request `role` in `community;group` for `agent`.
    ///
    /// The group's access policy is consulted for every requester. A policy
    /// that panics denies access and records a crash report for the
    /// requester.
    pub fn request_role(
        &self,
        agent: AgentId,
        community: &str,
        group: &str,
        role: &str,
        credential: Option<&Credential>,
    ) -> OrgResult<AgentAddress> {
        let (_, g) = self.lookup_group(community, group)?;
        require(role, "role")?;

        if g.role(role).map_or(false, |r| r.contains_player(agent)) {
            return Err(OrgError::RoleAlreadyHeld(role.to_string()));
        }

        match access::evaluate(g.policy(), role, credential) {
            Verdict::Allowed => {}
            Verdict::Denied => {
                debug!(agent = %agent, community, group, role, "Access denied");
                return Err(OrgError::AccessDenied {
                    role: role.to_string(),
                });
            }
            Verdict::Panicked(reason) => {
                self.record_crash(
                    agent,
                    Some(Cgr::new(community, group, role)),
                    format!("access policy panicked: {}", reason),
                );
                return Err(OrgError::AccessDenied {
                    role: role.to_string(),
                });
            }
        }

        match g.join(role, agent) {
            RoleJoin::Joined { address, created } => {
                if let Some(created) = created {
                    self.seed_pending(&created);
                }
                debug!(agent = %agent, cgr = %address.cgr(), "Role granted");
                self.notify(g.is_distributed(), &address, true);
                Ok(address)
            }
            RoleJoin::AlreadyHeld => Err(OrgError::RoleAlreadyHeld(role.to_string())),
            RoleJoin::GroupRetired => Err(OrgError::UnknownGroup {
                community: community.to_string(),
                group: group.to_string(),
            }),
        }
    }

    /// Leave `role`. An emptied role is deleted along with an emptied group
    /// and community.
    pub fn leave_role(&self, agent: AgentId, community: &str, group: &str, role: &str) -> OrgResult<()> {
        let (c, g) = self.lookup_group(community, group)?;
        require(role, "role")?;
        let r = g
            .role(role)
            .ok_or_else(|| OrgError::RoleNotHeld(role.to_string()))?;
        self.leave(agent, &c, &g, &r)
            .ok_or_else(|| OrgError::RoleNotHeld(role.to_string()))
    }

    fn leave(&self, agent: AgentId, c: &Arc<Community>, g: &Arc<Group>, r: &Arc<Role>) -> Option<()> {
        match r.remove_player(agent) {
            LeaveOutcome::NotHeld => None,
            LeaveOutcome::Left { address, emptied } => {
                if emptied {
                    self.unlink(c, g, r);
                }
                debug!(agent = %agent, cgr = %r.cgr(), emptied, "Role left");
                self.notify(g.is_distributed(), &address, false);
                Some(())
            }
        }
    }

    /// Leave every role held in `community;group`.
    pub fn leave_group(&self, agent: AgentId, community: &str, group: &str) -> OrgResult<()> {
        let (c, g) = self.lookup_group(community, group)?;
        let left = g
            .roles()
            .iter()
            .filter(|r| r.contains_player(agent))
            .filter_map(|r| self.leave(agent, &c, &g, r))
            .count();
        if left == 0 {
            return Err(OrgError::RoleNotHeld(group.to_string()));
        }
        Ok(())
    }

    /// Leave every role held anywhere. Returns the roles that were left.
    pub fn leave_all(&self, agent: AgentId) -> Vec<Cgr> {
        let mut left = Vec::new();
        for (c, g, r) in self.all_roles() {
            if r.contains_player(agent) && self.leave(agent, &c, &g, &r).is_some() {
                left.push(r.cgr().clone());
            }
        }
        left
    }

    // --- Queries ---

    pub fn is_community(&self, community: &str) -> bool {
        self.community(community).is_some()
    }

    pub fn is_group(&self, community: &str, group: &str) -> bool {
        self.lookup_group(community, group).is_ok()
    }

    pub fn is_role(&self, community: &str, group: &str, role: &str) -> bool {
        self.find_role(&Cgr::new(community, group, role)).is_some()
    }

    pub fn community_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.communities().iter().map(|c| c.name().to_string()).collect();
        names.sort();
        names
    }

    pub fn group_names(&self, community: &str) -> Vec<String> {
        self.community(community)
            .map(|c| c.group_names())
            .unwrap_or_default()
    }

    pub fn role_names(&self, community: &str, group: &str) -> Vec<String> {
        self.lookup_group(community, group)
            .map(|(_, g)| g.role_names())
            .unwrap_or_default()
    }

    /// Whether `group` is exported to peers.
    pub fn is_distributed(&self, community: &str, group: &str) -> bool {
        self.lookup_group(community, group)
            .map_or(false, |(_, g)| g.is_distributed())
    }

    /// Roles played by a local agent.
    pub fn roles_of(&self, agent: AgentId) -> Vec<Cgr> {
        let mut roles: Vec<Cgr> = self
            .all_roles()
            .into_iter()
            .filter(|(_, _, r)| r.contains_player(agent))
            .map(|(_, _, r)| r.cgr().clone())
            .collect();
        roles.sort();
        roles
    }

    /// Every member of the role, local and remote, in role order.
    pub fn agents_with_role(&self, community: &str, group: &str, role: &str) -> Vec<AgentAddress> {
        self.find_role(&Cgr::new(community, group, role))
            .map(|(_, _, r)| r.view().to_vec())
            .unwrap_or_default()
    }

    /// A uniformly random member of the role, other than `exclude`.
    pub fn agent_with_role(
        &self,
        community: &str,
        group: &str,
        role: &str,
        exclude: Option<AgentId>,
    ) -> Option<AgentAddress> {
        let (_, _, r) = self.find_role(&Cgr::new(community, group, role))?;
        let view = r.view();
        let candidates: Vec<&AgentAddress> = view
            .iter()
            .filter(|a| Some(a.agent()) != exclude || !a.is_local_to(&self.kernel))
            .collect();
        candidates.choose(&mut rand::thread_rng()).map(|a| (*a).clone())
    }

    /// The address of a local agent in a role it plays.
    pub fn address_of(&self, agent: AgentId, community: &str, group: &str, role: &str) -> Option<AgentAddress> {
        self.find_role(&Cgr::new(community, group, role))
            .and_then(|(_, _, r)| r.address_of(agent))
    }

    /// Whether an address is still valid and where it leads. An address
    /// resolves while its agent plays any role of the addressed group.
    pub fn resolve(&self, address: &AgentAddress) -> Route {
        let cgr = address.cgr();
        let Ok((_, group)) = self.lookup_group(&cgr.community, &cgr.group) else {
            return Route::NotFound;
        };
        let member = group
            .role(&cgr.role)
            .into_iter()
            .chain(group.roles())
            .any(|r| r.contains_address(address));
        match (member, address.is_local_to(&self.kernel)) {
            (false, _) => Route::NotFound,
            (true, true) => Route::Local(address.agent()),
            (true, false) => Route::Remote(address.kernel()),
        }
    }

    // --- Peer synchronization ---

    /// Local members of every distributed group.
    pub fn snapshot(&self) -> OrgSnapshot {
        let mut snapshot = OrgSnapshot::new();
        for (_, group, role) in self.all_roles() {
            if group.is_distributed() {
                for address in role.exported_addresses() {
                    snapshot.insert(address);
                }
            }
        }
        snapshot
    }

    fn merge_remote(&self, cgr: &Cgr, members: &[AgentAddress]) -> usize {
        if cgr.community.is_empty() || cgr.group.is_empty() || cgr.role.is_empty() {
            warn!(cgr = %cgr, "Ignoring remote members with an empty name");
            return 0;
        }
        loop {
            let community = self.community_or_insert(&cgr.community);
            let Some(group) = community.group_or_insert(&cgr.group, || {
                Group::imported(&cgr.community, &cgr.group, self.kernel)
            }) else {
                continue;
            };
            if let Some(merge) = group.merge_remote(&cgr.role, members) {
                if merge.created {
                    self.seed_pending(&merge.role);
                }
                return merge.added;
            }
        }
    }

    /// Merge a peer's snapshot, creating missing communities, groups and
    /// roles. Only addresses hosted by `peer` are taken; addresses of this
    /// kernel or of third kernels are ignored. Returns the number of
    /// addresses added.
    pub fn import_remote_addresses(&self, peer: KernelId, snapshot: &OrgSnapshot) -> usize {
        if peer == self.kernel {
            return 0;
        }
        let mut added = 0;
        for (cgr, addresses) in snapshot.roles() {
            let remote: Vec<AgentAddress> = addresses
                .iter()
                .filter(|a| a.kernel() == peer)
                .cloned()
                .collect();
            if !remote.is_empty() {
                added += self.merge_remote(&cgr, &remote);
            }
        }
        info!(peer = %peer, added, "Imported peer organization");
        added
    }

    /// Apply one remote join.
    pub fn add_remote_member(&self, address: &AgentAddress) -> bool {
        if address.is_local_to(&self.kernel) {
            return false;
        }
        self.merge_remote(address.cgr(), std::slice::from_ref(address)) > 0
    }

    /// Apply one remote leave.
    pub fn remove_remote_member(&self, address: &AgentAddress) -> bool {
        let Some((c, g, r)) = self.find_role(address.cgr()) else {
            return false;
        };
        match r.remove_remote(address) {
            Some(emptied) => {
                if emptied {
                    self.unlink(&c, &g, &r);
                }
                true
            }
            None => false,
        }
    }

    /// Remove every address hosted by `kernel`. Returns how many were
    /// removed.
    pub fn purge_kernel(&self, kernel: KernelId) -> usize {
        let mut removed = 0;
        for (c, g, r) in self.all_roles() {
            let (count, emptied) = r.purge_kernel(&kernel);
            removed += count;
            if emptied {
                self.unlink(&c, &g, &r);
            }
        }
        info!(peer = %kernel, removed, "Purged peer addresses");
        removed
    }

    // --- Overlookers ---

    /// Register an overlooker. It is attached and seeded now if its role
    /// exists, or as soon as the role is created.
    pub fn add_overlooker(&self, overlooker: Arc<Overlooker>) {
        {
            let mut registry = self.overlookers.lock();
            if registry.iter().any(|o| o.id() == overlooker.id()) {
                return;
            }
            registry.push(overlooker.clone());
        }
        if let Some((_, _, role)) = self.find_role(overlooker.cgr()) {
            role.attach(&overlooker);
        }
    }

    /// Unregister and detach an overlooker.
    pub fn remove_overlooker(&self, id: OverlookerId) -> bool {
        let overlooker = {
            let mut registry = self.overlookers.lock();
            let Some(index) = registry.iter().position(|o| o.id() == id) else {
                return false;
            };
            registry.remove(index)
        };
        overlooker.mark_removed();
        if let Some(role) = overlooker.role() {
            role.detach(id);
        }
        if let Some((_, _, role)) = self.find_role(overlooker.cgr()) {
            role.detach(id);
        }
        overlooker.unbind();
        true
    }

    pub fn overlooker_count(&self) -> usize {
        self.overlookers.lock().len()
    }

    /// Attach registered overlookers waiting for a newly created role.
    fn seed_pending(&self, role: &Arc<Role>) {
        let pending: Vec<Arc<Overlooker>> = self
            .overlookers
            .lock()
            .iter()
            .filter(|o| o.cgr() == role.cgr())
            .cloned()
            .collect();
        for overlooker in pending {
            role.attach(&overlooker);
        }
    }

    // --- Crash reports ---

    /// Flag an agent for operator attention. Only the latest
    /// [`CRASH_REPORT_CAPACITY`] reports are kept.
    pub fn record_crash(&self, agent: AgentId, cgr: Option<Cgr>, reason: impl Into<String>) {
        let report = CrashReport {
            agent,
            cgr,
            reason: reason.into(),
            at: Utc::now(),
        };
        error!(
            agent = %report.agent,
            cgr = ?report.cgr,
            reason = %report.reason,
            "Agent crash recorded"
        );
        let mut crashes = self.crashes.lock();
        if crashes.len() == CRASH_REPORT_CAPACITY {
            crashes.pop_front();
        }
        crashes.push_back(report);
    }

    pub fn crash_reports(&self) -> Vec<CrashReport> {
        self.crashes.lock().iter().cloned().collect()
    }

    /// Remove and return every recorded crash report.
    pub fn take_crash_reports(&self) -> Vec<CrashReport> {
        self.crashes.lock().drain(..).collect()
    }

    pub fn has_crashed(&self, agent: AgentId) -> bool {
        self.crashes.lock().iter().any(|r| r.agent == agent)
    }
}

impl std::fmt::Debug for Organization {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Organization")
            .field("kernel", &self.kernel)
            .field("communities", &self.community_names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::DenyAll;
    use agr_types::names::GROUP_MANAGER_ROLE;

    fn org() -> Organization {
        Organization::new(KernelId::generate())
    }

    #[test]
    fn empty_names_are_rejected() {
        let org = org();
        let a = AgentId::new();
        assert_eq!(org.create_community(""), Err(OrgError::NullIdentifier("community")));
        assert_eq!(
            org.create_group(a, "c", "", false, None),
            Err(OrgError::NullIdentifier("group"))
        );
        org.create_group(a, "c", "g", false, None).unwrap();
        assert_eq!(
            org.request_role(a, "", "g", "r", None),
            Err(OrgError::UnknownCommunity(String::new()))
        );
        assert!(matches!(
            org.request_role(a, "c", "", "r", None),
            Err(OrgError::UnknownGroup { .. })
        ));
        assert_eq!(
            org.request_role(a, "c", "g", "", None),
            Err(OrgError::NullIdentifier("role"))
        );
    }

    #[test]
    fn duplicate_group_is_rejected() {
        let org = org();
        let a = AgentId::new();
        org.create_group(a, "c", "g", false, None).unwrap();
        assert!(matches!(
            org.create_group(AgentId::new(), "c", "g", false, None),
            Err(OrgError::GroupAlreadyExists { .. })
        ));
        assert_eq!(org.create_group_if_absent(a, "c", "g", false, None), Ok(false));
        assert_eq!(org.create_group_if_absent(a, "c", "h", false, None), Ok(true));
    }

    #[test]
    fn creator_also_goes_through_policy() {
        let org = org();
        let creator = AgentId::new();
        org.create_group(creator, "c", "g", false, Some(Arc::new(DenyAll)))
            .unwrap();
        assert_eq!(
            org.request_role(creator, "c", "g", "worker", None),
            Err(OrgError::AccessDenied {
                role: "worker".into()
            })
        );
        assert_eq!(
            org.request_role(creator, "c", "g", GROUP_MANAGER_ROLE, None),
            Err(OrgError::RoleAlreadyHeld(GROUP_MANAGER_ROLE.into()))
        );
    }

    #[test]
    fn leaving_manager_deletes_whole_tree() {
        let org = org();
        let creator = AgentId::new();
        org.create_group(creator, "c", "g", false, None).unwrap();
        org.leave_role(creator, "c", "g", GROUP_MANAGER_ROLE).unwrap();
        assert!(!org.is_role("c", "g", GROUP_MANAGER_ROLE));
        assert!(!org.is_group("c", "g"));
        assert!(!org.is_community("c"));
        assert_eq!(
            org.leave_role(creator, "c", "g", GROUP_MANAGER_ROLE),
            Err(OrgError::UnknownCommunity("c".into()))
        );
    }

    #[test]
    fn leave_group_and_leave_all() {
        let org = org();
        let (m, a) = (AgentId::new(), AgentId::new());
        org.create_group(m, "c", "g", false, None).unwrap();
        org.create_group(m, "c", "h", false, None).unwrap();
        org.request_role(a, "c", "g", "x", None).unwrap();
        org.request_role(a, "c", "g", "y", None).unwrap();
        org.request_role(a, "c", "h", "x", None).unwrap();

        assert_eq!(org.roles_of(a).len(), 3);
        org.leave_group(a, "c", "g").unwrap();
        assert_eq!(org.roles_of(a), vec![Cgr::new("c", "h", "x")]);
        assert_eq!(
            org.leave_group(a, "c", "g"),
            Err(OrgError::RoleNotHeld("g".into()))
        );

        assert_eq!(org.leave_all(m).len(), 2);
        assert_eq!(org.role_names("c", "h"), vec!["x".to_string()]);
        assert_eq!(org.leave_all(a), vec![Cgr::new("c", "h", "x")]);
        assert!(!org.is_community("c"));
    }

    #[test]
    fn resolve_follows_membership() {
        let org = org();
        let (m, a) = (AgentId::new(), AgentId::new());
        org.create_group(m, "c", "g", false, None).unwrap();
        let address = org.request_role(a, "c", "g", "r", None).unwrap();
        assert_eq!(org.resolve(&address), Route::Local(a));

        org.request_role(a, "c", "g", "other", None).unwrap();
        org.leave_role(a, "c", "g", "r").unwrap();
        // Still a member of the group through another role.
        assert_eq!(org.resolve(&address), Route::Local(a));

        org.leave_role(a, "c", "g", "other").unwrap();
        assert_eq!(org.resolve(&address), Route::NotFound);
    }

    #[test]
    fn agent_with_role_honours_exclusion() {
        let org = org();
        let m = AgentId::new();
        org.create_group(m, "c", "g", false, None).unwrap();
        assert!(org
            .agent_with_role("c", "g", GROUP_MANAGER_ROLE, Some(m))
            .is_none());
        let picked = org.agent_with_role("c", "g", GROUP_MANAGER_ROLE, None).unwrap();
        assert_eq!(picked.agent(), m);
        assert!(org.agent_with_role("c", "g", "nobody", None).is_none());
    }

    #[test]
    fn snapshot_exports_only_distributed_groups() {
        let org = org();
        let m = AgentId::new();
        org.create_group(m, "c", "public", true, None).unwrap();
        org.create_group(m, "c", "private", false, None).unwrap();
        let snapshot = org.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(
            snapshot
                .addresses_of(&Cgr::new("c", "public", GROUP_MANAGER_ROLE))
                .len(),
            1
        );
    }

    #[test]
    fn import_takes_only_the_peers_addresses() {
        let org = org();
        let peer = KernelId::generate();
        let cgr = Cgr::new("c", "g", "r");
        let snapshot: OrgSnapshot = vec![
            AgentAddress::new(AgentId::new(), cgr.clone(), peer),
            AgentAddress::new(AgentId::new(), cgr.clone(), org.kernel()),
            AgentAddress::new(AgentId::new(), cgr.clone(), KernelId::generate()),
        ]
        .into_iter()
        .collect();

        assert_eq!(org.import_remote_addresses(peer, &snapshot), 1);
        assert_eq!(org.agents_with_role("c", "g", "r").len(), 1);
        assert!(org.is_distributed("c", "g"));
        // Imported members are not re-exported.
        assert!(org.snapshot().is_empty());
    }

    #[test]
    fn remote_leave_deletes_emptied_role() {
        let org = org();
        let peer = KernelId::generate();
        let address = AgentAddress::new(AgentId::new(), Cgr::new("c", "g", "r"), peer);
        assert!(org.add_remote_member(&address));
        assert!(!org.add_remote_member(&address));
        assert_eq!(org.resolve(&address), Route::Remote(peer));

        assert!(org.remove_remote_member(&address));
        assert!(!org.remove_remote_member(&address));
        assert!(!org.is_community("c"));
    }

    #[test]
    fn panicking_policy_records_crash() {
        let org = org();
        let (m, a) = (AgentId::new(), AgentId::new());
        let policy: Arc<dyn AccessPolicy> =
            Arc::new(|_: &str, _: Option<&Credential>| -> bool { panic!("broken policy") });
        org.create_group(m, "c", "g", false, Some(policy)).unwrap();

        assert_eq!(
            org.request_role(a, "c", "g", "r", None),
            Err(OrgError::AccessDenied { role: "r".into() })
        );
        assert!(org.has_crashed(a));
        assert!(!org.has_crashed(m));
        let reports = org.crash_reports();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].cgr, Some(Cgr::new("c", "g", "r")));
        assert!(reports[0].reason.contains("broken policy"));
        assert!(!org.is_role("c", "g", "r"));
    }

    #[test]
    fn crash_reports_are_bounded_and_drained() {
        let org = org();
        let first = AgentId::new();
        org.record_crash(first, None, "first");
        for i in 0..CRASH_REPORT_CAPACITY {
            org.record_crash(AgentId::new(), None, format!("crash {}", i));
        }

        assert_eq!(org.crash_reports().len(), CRASH_REPORT_CAPACITY);
        assert!(!org.has_crashed(first));

        let taken = org.take_crash_reports();
        assert_eq!(taken.len(), CRASH_REPORT_CAPACITY);
        assert_eq!(taken[0].reason, "crash 0");
        assert!(org.crash_reports().is_empty());
    }

    #[test]
    fn listener_sees_only_distributed_groups() {
        #[derive(Default)]
        struct Log(Mutex<Vec<(AgentId, bool)>>);

        impl OrgListener for Log {
            fn role_joined(&self, address: &AgentAddress) {
                self.0.lock().push((address.agent(), true));
            }
            fn role_left(&self, address: &AgentAddress) {
                self.0.lock().push((address.agent(), false));
            }
        }

        let org = org();
        let log = Arc::new(Log::default());
        assert!(org.set_listener(log.clone()));
        assert!(!org.set_listener(log.clone()));

        let (m, a) = (AgentId::new(), AgentId::new());
        org.create_group(m, "c", "shared", true, None).unwrap();
        org.create_group(m, "c", "local", false, None).unwrap();
        org.request_role(a, "c", "shared", "r", None).unwrap();
        org.request_role(a, "c", "local", "r", None).unwrap();
        org.leave_role(a, "c", "shared", "r").unwrap();

        assert_eq!(*log.0.lock(), vec![(m, true), (a, true), (a, false)]);
    }
}
