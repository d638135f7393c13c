//! Organization snapshots exchanged between kernels.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::address::{AgentAddress, Cgr};

type RoleMap = BTreeMap<String, Vec<AgentAddress>>;
type GroupMap = BTreeMap<String, RoleMap>;

/// Nested `community → group → role → [AgentAddress]` membership view.
///
/// Sent once per link right after the handshake; everything after it is
/// incremental.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OrgSnapshot {
    communities: BTreeMap<String, GroupMap>,
}

impl OrgSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one address under its own role triple.
    pub fn insert(&mut self, address: AgentAddress) {
        let cgr = address.cgr();
        let list = self
            .communities
            .entry(cgr.community.clone())
            .or_default()
            .entry(cgr.group.clone())
            .or_default()
            .entry(cgr.role.clone())
            .or_default();
        if !list.contains(&address) {
            list.push(address);
        }
    }

    /// Iterate over every role of the snapshot with its addresses.
    pub fn roles(&self) -> impl Iterator<Item = (Cgr, &[AgentAddress])> {
        self.communities.iter().flat_map(|(community, groups)| {
            groups.iter().flat_map(move |(group, roles)| {
                roles.iter().map(move |(role, addresses)| {
                    (Cgr::new(community, group, role), addresses.as_slice())
                })
            })
        })
    }

    pub fn addresses_of(&self, cgr: &Cgr) -> &[AgentAddress] {
        self.communities
            .get(&cgr.community)
            .and_then(|groups| groups.get(&cgr.group))
            .and_then(|roles| roles.get(&cgr.role))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn communities(&self) -> impl Iterator<Item = &str> {
        self.communities.keys().map(String::as_str)
    }

    /// Total number of addresses in the snapshot.
    pub fn len(&self) -> usize {
        self.roles().map(|(_, addresses)| addresses.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl FromIterator<AgentAddress> for OrgSnapshot {
    fn from_iter<I: IntoIterator<Item = AgentAddress>>(iter: I) -> Self {
        let mut snapshot = Self::new();
        for address in iter {
            snapshot.insert(address);
        }
        snapshot
    }
}
