use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use agr_types::names::GROUP_MANAGER_ROLE;
use agr_types::{AgentAddress, AgentId, Cgr, KernelId};
use parking_lot::RwLock;
use tracing::debug;

use crate::access::{AccessPolicy, AllowAll};
use crate::role::{JoinOutcome, Role};

/// Outcome of [`Group::join`].
#[derive(Debug)]
pub(crate) enum RoleJoin {
    /// `created` carries the role when this call created it.
    Joined {
        address: AgentAddress,
        created: Option<Arc<Role>>,
    },
    AlreadyHeld,
    GroupRetired,
}

/// Outcome of [`Group::merge_remote`].
pub(crate) struct RemoteMerge {
    pub role: Arc<Role>,
    pub created: bool,
    pub added: usize,
}

/// A group of one community: its roles, access policy and export flag.
pub struct Group {
    community: String,
    name: String,
    kernel: KernelId,
    distributed: bool,
    policy: Arc<dyn AccessPolicy>,
    creator: Option<AgentId>,
    retired: AtomicBool,
    roles: RwLock<HashMap<String, Arc<Role>>>,
}

impl Group {
    fn bare(
        community: &str,
        name: &str,
        kernel: KernelId,
        distributed: bool,
        policy: Arc<dyn AccessPolicy>,
        creator: Option<AgentId>,
    ) -> Self {
        Self {
            community: community.to_string(),
            name: name.to_string(),
            kernel,
            distributed,
            policy,
            creator,
            retired: AtomicBool::new(false),
            roles: RwLock::new(HashMap::new()),
        }
    }

    /// A new group whose only role is `manager`, held by `creator`.
    pub(crate) fn with_manager(
        community: &str,
        name: &str,
        kernel: KernelId,
        distributed: bool,
        policy: Arc<dyn AccessPolicy>,
        creator: AgentId,
    ) -> (Self, AgentAddress, Arc<Role>) {
        let group = Self::bare(community, name, kernel, distributed, policy, Some(creator));
        let (role, address) = Role::with_player(
            Cgr::new(community, name, GROUP_MANAGER_ROLE),
            kernel,
            creator,
        );
        let role = Arc::new(role);
        group
            .roles
            .write()
            .insert(GROUP_MANAGER_ROLE.to_string(), role.clone());
        debug!(community, group = name, creator = %creator, distributed, "Group created");
        (group, address, role)
    }

    /// A group learned from a peer. Allow-all and distributed; its first
    /// role is added right after by [`Group::merge_remote`].
    pub(crate) fn imported(community: &str, name: &str, kernel: KernelId) -> Self {
        debug!(community, group = name, "Group imported from peer");
        Self::bare(community, name, kernel, true, Arc::new(AllowAll), None)
    }

    pub fn community(&self) -> &str {
        &self.community
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_distributed(&self) -> bool {
        self.distributed
    }

    pub fn creator(&self) -> Option<AgentId> {
        self.creator
    }

    pub(crate) fn policy(&self) -> &Arc<dyn AccessPolicy> {
        &self.policy
    }

    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::Acquire)
    }

    fn cgr(&self, role: &str) -> Cgr {
        Cgr::new(&self.community, &self.name, role)
    }

    /// A live role of this group.
    pub fn role(&self, name: &str) -> Option<Arc<Role>> {
        self.roles
            .read()
            .get(name)
            .filter(|role| !role.is_retired())
            .cloned()
    }

    pub fn roles(&self) -> Vec<Arc<Role>> {
        self.roles
            .read()
            .values()
            .filter(|role| !role.is_retired())
            .cloned()
            .collect()
    }

    pub fn role_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.roles().iter().map(|r| r.name().to_string()).collect();
        names.sort();
        names
    }

    /// Add a local player, creating the role on demand.
    pub(crate) fn join(&self, role_name: &str, agent: AgentId) -> RoleJoin {
        loop {
            let existing = self.roles.read().get(role_name).cloned();
            if let Some(role) = existing {
                match role.add_player(agent) {
                    JoinOutcome::Joined(address) => {
                        return RoleJoin::Joined {
                            address,
                            created: None,
                        }
                    }
                    JoinOutcome::AlreadyHeld => return RoleJoin::AlreadyHeld,
                    JoinOutcome::Retired => {}
                }
            }

            let mut roles = self.roles.write();
            if self.is_retired() {
                return RoleJoin::GroupRetired;
            }
            if roles.get(role_name).map_or(false, |r| !r.is_retired()) {
                continue;
            }
            let (role, address) = Role::with_player(self.cgr(role_name), self.kernel, agent);
            let role = Arc::new(role);
            roles.insert(role_name.to_string(), role.clone());
            return RoleJoin::Joined {
                address,
                created: Some(role),
            };
        }
    }

    /// Merge remote members into a role, creating it on demand. `None` if
    /// the group is retired.
    pub(crate) fn merge_remote(
        &self,
        role_name: &str,
        members: &[AgentAddress],
    ) -> Option<RemoteMerge> {
        loop {
            let existing = self.roles.read().get(role_name).cloned();
            if let Some(role) = existing {
                if let Some(added) = role.add_remote(members) {
                    return Some(RemoteMerge {
                        role,
                        created: false,
                        added,
                    });
                }
            }

            let mut roles = self.roles.write();
            if self.is_retired() {
                return None;
            }
            if roles.get(role_name).map_or(false, |r| !r.is_retired()) {
                continue;
            }
            let role = Arc::new(Role::with_remote(self.cgr(role_name), self.kernel, members));
            let added = role.len();
            roles.insert(role_name.to_string(), role.clone());
            return Some(RemoteMerge {
                role,
                created: true,
                added,
            });
        }
    }

    /// Unlink a retired role. Returns true when this left the group without
    /// roles; the group is then retired and must be unlinked by the caller.
    pub(crate) fn unlink_role(&self, role: &Arc<Role>) -> bool {
        let mut roles = self.roles.write();
        if roles
            .get(role.name())
            .map_or(false, |current| Arc::ptr_eq(current, role))
        {
            roles.remove(role.name());
            debug!(cgr = %role.cgr(), "Role removed from group");
        }
        if roles.is_empty() && !self.is_retired() {
            self.retired.store(true, Ordering::Release);
            debug!(community = %self.community, group = %self.name, "Group has no roles left");
            return true;
        }
        false
    }
}

impl std::fmt::Debug for Group {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Group")
            .field("community", &self.community)
            .field("name", &self.name)
            .field("distributed", &self.distributed)
            .field("roles", &self.role_names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::role::LeaveOutcome;

    fn group(creator: AgentId) -> (Group, KernelId) {
        let kernel = KernelId::generate();
        let (group, _, _) =
            Group::with_manager("c", "g", kernel, true, Arc::new(AllowAll), creator);
        (group, kernel)
    }

    #[test]
    fn new_group_has_only_manager() {
        let creator = AgentId::new();
        let (group, _) = group(creator);
        assert_eq!(group.role_names(), vec![GROUP_MANAGER_ROLE.to_string()]);
        let manager = group.role(GROUP_MANAGER_ROLE).unwrap();
        assert_eq!(manager.players(), vec![creator]);
        assert_eq!(group.creator(), Some(creator));
    }

    #[test]
    fn join_creates_role_once() {
        let (group, _) = group(AgentId::new());
        let (a, b) = (AgentId::new(), AgentId::new());
        assert!(matches!(
            group.join("worker", a),
            RoleJoin::Joined { created: Some(_), .. }
        ));
        assert!(matches!(
            group.join("worker", b),
            RoleJoin::Joined { created: None, .. }
        ));
        assert!(matches!(group.join("worker", a), RoleJoin::AlreadyHeld));
        assert_eq!(group.role("worker").unwrap().len(), 2);
    }

    #[test]
    fn retired_role_is_replaced_on_join() {
        let (group, _) = group(AgentId::new());
        let a = AgentId::new();
        group.join("worker", a);
        let old = group.role("worker").unwrap();
        assert!(matches!(
            old.remove_player(a),
            LeaveOutcome::Left { emptied: true, .. }
        ));
        assert!(group.role("worker").is_none());

        let fresh = match group.join("worker", a) {
            RoleJoin::Joined { created: Some(role), .. } => role,
            other => panic!("unexpected {:?}", other),
        };
        assert!(!Arc::ptr_eq(&old, &fresh));
        // Late unlink of the old role must not remove the new one.
        assert!(!group.unlink_role(&old));
        assert!(group.role("worker").is_some());
    }

    #[test]
    fn unlinking_last_role_retires_group() {
        let creator = AgentId::new();
        let (group, _) = group(creator);
        let manager = group.role(GROUP_MANAGER_ROLE).unwrap();
        manager.remove_player(creator);
        assert!(group.unlink_role(&manager));
        assert!(group.is_retired());
        assert!(!group.unlink_role(&manager));
        assert!(matches!(
            group.join("worker", AgentId::new()),
            RoleJoin::GroupRetired
        ));
    }

    #[test]
    fn merge_remote_skips_local_addresses() {
        let kernel = KernelId::generate();
        let peer = KernelId::generate();
        let group = Group::imported("c", "g", kernel);
        assert!(group.is_distributed());

        let remote = AgentAddress::new(AgentId::new(), Cgr::new("c", "g", "r"), peer);
        let merge = group.merge_remote("r", &[remote.clone()]).unwrap();
        assert!(merge.created);
        assert_eq!(merge.added, 1);

        let again = group.merge_remote("r", &[remote]).unwrap();
        assert!(!again.created);
        assert_eq!(again.added, 0);
    }
}
