//! Watchers: controllers owning a set of probes.
//!
//! A probe is an [`Overlooker`] registered on behalf of one agent. When the
//! agent terminates its watcher removes every probe it still holds.

use std::sync::Arc;

use agr_types::AgentId;
use parking_lot::Mutex;
use tracing::debug;

use crate::organization::Organization;
use crate::overlooker::{Overlooker, OverlookerId};

pub struct Watcher {
    owner: AgentId,
    org: Arc<Organization>,
    probes: Mutex<Vec<Arc<Overlooker>>>,
}

impl Watcher {
    pub fn new(owner: AgentId, org: Arc<Organization>) -> Self {
        Self {
            owner,
            org,
            probes: Mutex::new(Vec::new()),
        }
    }

    pub fn owner(&self) -> AgentId {
        self.owner
    }

    /// Register a probe. Returns false if this watcher already holds it.
    pub fn add_probe(&self, probe: Arc<Overlooker>) -> bool {
        {
            let mut probes = self.probes.lock();
            if probes.iter().any(|p| p.id() == probe.id()) {
                return false;
            }
            probes.push(probe.clone());
        }
        debug!(owner = %self.owner, probe = %probe.id(), cgr = %probe.cgr(), "Probe added");
        self.org.add_overlooker(probe);
        true
    }

    pub fn remove_probe(&self, id: OverlookerId) -> bool {
        let removed = {
            let mut probes = self.probes.lock();
            match probes.iter().position(|p| p.id() == id) {
                Some(index) => {
                    probes.remove(index);
                    true
                }
                None => false,
            }
        };
        if removed {
            self.org.remove_overlooker(id);
        }
        removed
    }

    /// Remove every probe. Returns how many were removed.
    pub fn remove_all_probes(&self) -> usize {
        let probes = std::mem::take(&mut *self.probes.lock());
        for probe in &probes {
            self.org.remove_overlooker(probe.id());
        }
        if !probes.is_empty() {
            debug!(owner = %self.owner, count = probes.len(), "Probes removed");
        }
        probes.len()
    }

    pub fn probes(&self) -> Vec<Arc<Overlooker>> {
        self.probes.lock().clone()
    }
}

impl Drop for Watcher {
    fn drop(&mut self) {
        self.remove_all_probes();
    }
}
