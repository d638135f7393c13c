use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use crate::group::Group;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum InsertError {
    Exists,
    Retired,
}

/// A named set of groups.
pub struct Community {
    name: String,
    retired: AtomicBool,
    groups: RwLock<HashMap<String, Arc<Group>>>,
}

impl Community {
    pub(crate) fn new(name: &str) -> Self {
        debug!(community = name, "Community created");
        Self {
            name: name.to_string(),
            retired: AtomicBool::new(false),
            groups: RwLock::new(HashMap::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::Acquire)
    }

    pub fn group(&self, name: &str) -> Option<Arc<Group>> {
        self.groups
            .read()
            .get(name)
            .filter(|group| !group.is_retired())
            .cloned()
    }

    pub fn groups(&self) -> Vec<Arc<Group>> {
        self.groups
            .read()
            .values()
            .filter(|group| !group.is_retired())
            .cloned()
            .collect()
    }

    pub fn group_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.groups().iter().map(|g| g.name().to_string()).collect();
        names.sort();
        names
    }

    /// Insert the group built by `make` unless a live one of that name
    /// exists.
    pub(crate) fn insert_group<T>(
        &self,
        name: &str,
        make: impl FnOnce() -> (Group, T),
    ) -> Result<T, InsertError> {
        let mut groups = self.groups.write();
        if self.is_retired() {
            return Err(InsertError::Retired);
        }
        if groups.get(name).map_or(false, |g| !g.is_retired()) {
            return Err(InsertError::Exists);
        }
        let (group, extra) = make();
        groups.insert(name.to_string(), Arc::new(group));
        Ok(extra)
    }

    /// The live group `name`, inserting the one built by `make` if absent.
    /// `None` if this community is retired.
    pub(crate) fn group_or_insert(
        &self,
        name: &str,
        make: impl FnOnce() -> Group,
    ) -> Option<Arc<Group>> {
        if let Some(group) = self.group(name) {
            return Some(group);
        }
        let mut groups = self.groups.write();
        if self.is_retired() {
            return None;
        }
        if let Some(group) = groups.get(name).filter(|g| !g.is_retired()) {
            return Some(group.clone());
        }
        let group = Arc::new(make());
        groups.insert(name.to_string(), group.clone());
        Some(group)
    }

    /// Unlink a retired group. Returns true when this left the community
    /// empty; it is then retired and must be unlinked by the caller.
    pub(crate) fn unlink_group(&self, group: &Arc<Group>) -> bool {
        let mut groups = self.groups.write();
        if groups
            .get(group.name())
            .map_or(false, |current| Arc::ptr_eq(current, group))
        {
            groups.remove(group.name());
            debug!(community = %self.name, group = %group.name(), "Group removed");
        }
        if groups.is_empty() && !self.is_retired() {
            self.retired.store(true, Ordering::Release);
            debug!(community = %self.name, "Community has no groups left");
            return true;
        }
        false
    }
}

impl std::fmt::Debug for Community {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Community")
            .field("name", &self.name)
            .field("groups", &self.group_names())
            .finish()
    }
}
