//! The kernel: owns the organization, the agents and the network.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use agr_net::{LinkState, LocalDelivery, NetworkCoordinator};
use agr_org::{Organization, Route};
use agr_types::names::{KERNEL_ROLE, LOCAL_COMMUNITY, SYSTEM_GROUP};
use agr_types::{AgentAddress, AgentId, KernelId, Message, OrgError, OrgResult};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::agent::{self, Agent, AgentContext, AgentStatus};
use crate::config::{BootstrapGroup, KernelConfig};
use crate::error::{KernelError, KernelResult};
use crate::factory::AgentFactory;
use crate::mailbox::Mailbox;
use crate::threads::{ThreadTier, ThreadTierFactory};

/// Terminated agents remembered for status queries.
pub const TERMINATED_HISTORY: usize = 1024;

struct AgentEntry {
    kind: String,
    status: AgentStatus,
    mailbox: Arc<Mailbox>,
}

/// Outcome of the latest terminated agents, oldest first.
#[derive(Default)]
struct Terminated {
    order: VecDeque<AgentId>,
    outcomes: HashMap<AgentId, (String, AgentStatus)>,
}

impl Terminated {
    fn record(&mut self, id: AgentId, kind: String, status: AgentStatus) {
        if self.order.len() == TERMINATED_HISTORY {
            if let Some(oldest) = self.order.pop_front() {
                self.outcomes.remove(&oldest);
            }
        }
        self.order.push_back(id);
        self.outcomes.insert(id, (kind, status));
    }
}

/// State shared by the kernel handle and every agent context.
pub(crate) struct KernelInner {
    pub(crate) id: KernelId,
    pub(crate) org: Arc<Organization>,
    pub(crate) factory: AgentFactory,
    config: KernelConfig,
    threads: Arc<ThreadTierFactory>,
    /// Agents that have not terminated.
    agents: Mutex<HashMap<AgentId, AgentEntry>>,
    terminated: Mutex<Terminated>,
    network: OnceLock<Arc<NetworkCoordinator>>,
    shutting_down: AtomicBool,
    /// Holds the bootstrap groups. Has no thread and no mailbox.
    kernel_agent: AgentId,
}

impl KernelInner {
    pub(crate) fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    pub(crate) fn launch(self: &Arc<Self>, agent: Box<dyn Agent>, kind: String) -> KernelResult<AgentId> {
        if self.is_shutting_down() {
            return Err(KernelError::ShuttingDown);
        }
        let id = AgentId::new();
        let mailbox = Arc::new(Mailbox::new());
        self.agents.lock().insert(
            id,
            AgentEntry {
                kind: kind.clone(),
                status: AgentStatus::Starting,
                mailbox: mailbox.clone(),
            },
        );

        let ctx = AgentContext::new(id, self.clone(), mailbox);
        match self
            .threads
            .spawn(ThreadTier::Agent, &kind, move || agent::run(agent, ctx))
        {
            Ok(thread) => {
                debug!(agent = %id, kind = %kind, thread = %thread, "Agent launched");
                Ok(id)
            }
            Err(e) => {
                self.agents.lock().remove(&id);
                warn!(kind = %kind, error = %e, "Agent thread could not be started");
                Err(KernelError::Spawn(e))
            }
        }
    }

    pub(crate) fn set_status(&self, id: AgentId, status: AgentStatus) {
        if let Some(entry) = self.agents.lock().get_mut(&id) {
            entry.status = status;
        }
    }

    /// Forget a terminated agent, keeping only its outcome.
    pub(crate) fn retire(&self, id: AgentId, status: AgentStatus) {
        let entry = self.agents.lock().remove(&id);
        if let Some(entry) = entry {
            self.terminated.lock().record(id, entry.kind, status);
        }
    }

    fn enqueue(&self, agent: AgentId, message: Message) -> OrgResult<()> {
        let mailbox = self.agents.lock().get(&agent).map(|e| e.mailbox.clone());
        match mailbox {
            Some(mailbox) if mailbox.enqueue(message) => Ok(()),
            _ => Err(OrgError::NotFound(agent.to_string())),
        }
    }

    /// Route a message to a local mailbox or to the receiver's kernel.
    pub(crate) fn send(&self, message: Message) -> OrgResult<()> {
        let receiver = message.receiver.clone();
        match self.org.resolve(&receiver) {
            Route::Local(agent) => self.enqueue(agent, message),
            Route::Remote(kernel) => match self.network.get() {
                Some(net) => net.send(message),
                None => Err(OrgError::UnreachableKernel(kernel)),
            },
            Route::NotFound if !receiver.is_local_to(&self.id) && !self.is_connected(receiver.kernel()) => {
                Err(OrgError::UnreachableKernel(receiver.kernel()))
            }
            Route::NotFound => Err(OrgError::NotFound(receiver.to_string())),
        }
    }

    /// Delivery of messages arriving from peers.
    fn deliver_inbound(&self, message: Message) -> OrgResult<()> {
        match self.org.resolve(&message.receiver) {
            Route::Local(agent) => self.enqueue(agent, message),
            _ => Err(OrgError::NotFound(message.receiver.to_string())),
        }
    }

    fn is_connected(&self, kernel: KernelId) -> bool {
        self.network
            .get()
            .map_or(false, |net| net.is_connected(kernel))
    }

    fn coordinator(self: &Arc<Self>) -> KernelResult<Arc<NetworkCoordinator>> {
        if self.is_shutting_down() {
            return Err(KernelError::ShuttingDown);
        }
        let net = self.network.get_or_init(|| {
            let kernel = Arc::downgrade(self);
            let delivery: Arc<dyn LocalDelivery> = Arc::new(move |message: Message| -> OrgResult<()> {
                match kernel.upgrade() {
                    Some(kernel) => kernel.deliver_inbound(message),
                    None => Err(OrgError::NotFound(message.receiver.to_string())),
                }
            });
            NetworkCoordinator::attach(
                self.org.clone(),
                delivery,
                self.threads.clone(),
                self.config.network.timeouts(),
            )
        });
        Ok(net.clone())
    }

    fn bootstrap(&self) -> KernelResult<()> {
        let system = BootstrapGroup {
            community: LOCAL_COMMUNITY.to_string(),
            group: SYSTEM_GROUP.to_string(),
            distributed: false,
        };
        for group in std::iter::once(&system).chain(&self.config.bootstrap.groups) {
            self.org.create_group_if_absent(
                self.kernel_agent,
                &group.community,
                &group.group,
                group.distributed,
                None,
            )?;
            match self.org.request_role(
                self.kernel_agent,
                &group.community,
                &group.group,
                KERNEL_ROLE,
                None,
            ) {
                Ok(_) | Err(OrgError::RoleAlreadyHeld(_)) => {}
                Err(e) => return Err(e.into()),
            }
            debug!(
                community = %group.community,
                group = %group.group,
                distributed = group.distributed,
                "Bootstrap group ready"
            );
        }
        Ok(())
    }
}

/// One AGR kernel. Dropping it shuts it down.
pub struct Kernel {
    inner: Arc<KernelInner>,
}

impl Kernel {
    /// Start a kernel: create the bootstrap groups and, when the
    /// configuration enables it, start networking.
    pub fn new(config: KernelConfig) -> KernelResult<Self> {
        let id = KernelId::generate();
        let inner = Arc::new(KernelInner {
            id,
            org: Arc::new(Organization::new(id)),
            factory: AgentFactory::new(),
            threads: Arc::new(ThreadTierFactory::new(config.threads.clone())),
            agents: Mutex::new(HashMap::new()),
            terminated: Mutex::new(Terminated::default()),
            network: OnceLock::new(),
            shutting_down: AtomicBool::new(false),
            kernel_agent: AgentId::new(),
            config,
        });
        inner.bootstrap()?;
        info!(kernel = %id, "Kernel started");

        let kernel = Self { inner };
        if kernel.inner.config.network.enabled {
            kernel.start_network()?;
        }
        Ok(kernel)
    }

    pub fn id(&self) -> KernelId {
        self.inner.id
    }

    pub fn organization(&self) -> &Arc<Organization> {
        &self.inner.org
    }

    pub fn config(&self) -> &KernelConfig {
        &self.inner.config
    }

    pub fn factory(&self) -> &AgentFactory {
        &self.inner.factory
    }

    /// The internal agent holding the bootstrap groups.
    pub fn kernel_agent(&self) -> AgentId {
        self.inner.kernel_agent
    }

    pub fn threads(&self) -> &ThreadTierFactory {
        &self.inner.threads
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.is_shutting_down()
    }

    // --- Agents ---

    pub fn launch_agent<A: Agent>(&self, agent: A) -> KernelResult<AgentId> {
        self.inner
            .launch(Box::new(agent), std::any::type_name::<A>().to_string())
    }

    /// Launch an agent registered in the [`AgentFactory`].
    pub fn launch_by_name(&self, kind: &str) -> KernelResult<AgentId> {
        let agent = self.inner.factory.create(kind)?;
        self.inner.launch(agent, kind.to_string())
    }

    /// Status of a live agent, or of one of the latest
    /// [`TERMINATED_HISTORY`] terminated agents.
    pub fn agent_status(&self, id: AgentId) -> Option<AgentStatus> {
        if let Some(entry) = self.inner.agents.lock().get(&id) {
            return Some(entry.status);
        }
        self.inner.terminated.lock().outcomes.get(&id).map(|(_, status)| *status)
    }

    pub fn agent_kind(&self, id: AgentId) -> Option<String> {
        if let Some(entry) = self.inner.agents.lock().get(&id) {
            return Some(entry.kind.clone());
        }
        self.inner.terminated.lock().outcomes.get(&id).map(|(kind, _)| kind.clone())
    }

    /// Messages waiting in an agent's mailbox. Zero once it terminated.
    pub fn pending_messages(&self, id: AgentId) -> KernelResult<usize> {
        if let Some(entry) = self.inner.agents.lock().get(&id) {
            return Ok(entry.mailbox.len());
        }
        if self.inner.terminated.lock().outcomes.contains_key(&id) {
            return Ok(0);
        }
        Err(KernelError::AgentNotFound(id))
    }

    /// Agents that have not terminated.
    pub fn live_agents(&self) -> Vec<AgentId> {
        self.inner.agents.lock().keys().copied().collect()
    }

    // --- Messaging ---

    /// Deliver a message to a local mailbox or forward it to the
    /// receiver's kernel. Fails with `NotFound` for stale addresses and
    /// `UnreachableKernel` when the receiver's kernel has no live link.
    pub fn send(&self, message: Message) -> OrgResult<()> {
        self.inner.send(message)
    }

    /// Send on behalf of the kernel, without a sender address.
    pub fn send_to(&self, receiver: &AgentAddress, payload: impl Into<Vec<u8>>) -> OrgResult<()> {
        self.inner.send(Message::new(receiver.clone(), payload))
    }

    // --- Network ---

    /// Start networking as configured: listen if a listen address is set,
    /// then connect to the configured peers. Peers that cannot be reached
    /// are logged and skipped. Returns the bound listen address.
    pub fn start_network(&self) -> KernelResult<Option<SocketAddr>> {
        let net = self.inner.coordinator()?;
        let network = &self.inner.config.network;
        let bound = match network.listen_addr {
            Some(addr) if net.listen_addr().is_none() => Some(net.listen(addr)?),
            _ => net.listen_addr(),
        };
        for peer in &network.peers {
            match net.connect(*peer) {
                Ok(kernel) => info!(peer = %kernel, addr = %peer, "Connected to peer"),
                Err(e) => warn!(addr = %peer, error = %e, "Could not connect to peer"),
            }
        }
        Ok(bound)
    }

    /// Accept peer kernels on `addr`. Returns the bound address.
    pub fn listen(&self, addr: SocketAddr) -> KernelResult<SocketAddr> {
        Ok(self.inner.coordinator()?.listen(addr)?)
    }

    /// Link with the kernel listening on `addr`. Returns its identity.
    pub fn connect(&self, addr: SocketAddr) -> KernelResult<KernelId> {
        Ok(self.inner.coordinator()?.connect(addr)?)
    }

    pub fn disconnect(&self, peer: KernelId) -> bool {
        self.inner
            .network
            .get()
            .map_or(false, |net| net.disconnect(peer))
    }

    pub fn peers(&self) -> Vec<KernelId> {
        self.inner
            .network
            .get()
            .map(|net| net.peers())
            .unwrap_or_default()
    }

    pub fn link_state(&self, peer: KernelId) -> Option<LinkState> {
        self.inner.network.get().and_then(|net| net.link_state(peer))
    }

    pub fn listen_addr(&self) -> Option<SocketAddr> {
        self.inner.network.get().and_then(|net| net.listen_addr())
    }

    // --- Shutdown ---

    /// Stop the kernel: close every link, close every mailbox so waiting
    /// agents wake up, release the bootstrap groups and join the kernel
    /// threads. Agents finish on their own threads. Runs once.
    pub fn shutdown(&self) {
        if self.inner.shutting_down.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(kernel = %self.inner.id, "Kernel shutting down");

        if let Some(net) = self.inner.network.get() {
            net.stop();
        }
        let mailboxes: Vec<Arc<Mailbox>> = self
            .inner
            .agents
            .lock()
            .values()
            .map(|e| e.mailbox.clone())
            .collect();
        for mailbox in &mailboxes {
            mailbox.close();
        }
        self.inner.org.leave_all(self.inner.kernel_agent);
        let joined = self.inner.threads.join_kernel_threads();
        info!(
            kernel = %self.inner.id,
            agents = mailboxes.len(),
            threads = joined,
            "Kernel stopped"
        );
    }
}

impl Drop for Kernel {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for Kernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Kernel")
            .field("id", &self.inner.id)
            .field("agents", &self.inner.agents.lock().len())
            .field("shutting_down", &self.is_shutting_down())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminated_history_keeps_the_latest_outcomes() {
        let mut terminated = Terminated::default();
        let first = AgentId::new();
        terminated.record(first, "first".into(), AgentStatus::Crashed);
        let mut last = first;
        for _ in 0..TERMINATED_HISTORY {
            last = AgentId::new();
            terminated.record(last, "worker".into(), AgentStatus::Ended);
        }

        assert_eq!(terminated.order.len(), TERMINATED_HISTORY);
        assert_eq!(terminated.outcomes.len(), TERMINATED_HISTORY);
        assert!(!terminated.outcomes.contains_key(&first));
        assert_eq!(
            terminated.outcomes.get(&last),
            Some(&("worker".to_string(), AgentStatus::Ended))
        );
    }
}
