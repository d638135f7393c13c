//! Agents and the API they see.
//!
//! Each agent runs on its own agent-tier thread: `activate`, then `live`,
//! then `end`. Whatever way the thread finishes, the agent leaves every
//! role it holds, its probes are removed and its mailbox is closed.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use agr_org::{panic_reason, AccessPolicy, Credential, Organization, Overlooker, OverlookerId, Watcher};
use agr_types::{AgentAddress, AgentId, Cgr, KernelId, Message, OrgError, OrgResult};
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::KernelResult;
use crate::kernel::KernelInner;
use crate::mailbox::Mailbox;

/// Behavior run by the kernel on an agent thread.
pub trait Agent: Send + 'static {
    /// First step. Typically creates groups and requests roles.
    fn activate(&mut self, ctx: &AgentContext) -> KernelResult<()>;

    /// Main behavior, run after a successful `activate`.
    fn live(&mut self, _ctx: &AgentContext) -> KernelResult<()> {
        Ok(())
    }

    /// Always run last, even after a failure or a panic.
    fn end(&mut self, _ctx: &AgentContext) {}
}

/// An agent whose whole behavior is one closure, run as `activate`.
pub struct FnAgent<F>(F);

pub fn from_fn<F>(behavior: F) -> FnAgent<F>
where
    F: FnMut(&AgentContext) -> KernelResult<()> + Send + 'static,
{
    FnAgent(behavior)
}

impl<F> Agent for FnAgent<F>
where
    F: FnMut(&AgentContext) -> KernelResult<()> + Send + 'static,
{
    fn activate(&mut self, ctx: &AgentContext) -> KernelResult<()> {
        (self.0)(ctx)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Starting,
    Running,
    Ended,
    Crashed,
}

impl AgentStatus {
    pub fn is_terminated(&self) -> bool {
        matches!(self, AgentStatus::Ended | AgentStatus::Crashed)
    }
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AgentStatus::Starting => "starting",
            AgentStatus::Running => "running",
            AgentStatus::Ended => "ended",
            AgentStatus::Crashed => "crashed",
        };
        f.write_str(s)
    }
}

/// The kernel as seen by one agent. Every operation acts on behalf of
/// that agent.
pub struct AgentContext {
    id: AgentId,
    kernel: Arc<KernelInner>,
    mailbox: Arc<Mailbox>,
    watcher: Watcher,
}

impl AgentContext {
    pub(crate) fn new(id: AgentId, kernel: Arc<KernelInner>, mailbox: Arc<Mailbox>) -> Self {
        let watcher = Watcher::new(id, kernel.org.clone());
        Self {
            id,
            kernel,
            mailbox,
            watcher,
        }
    }

    pub fn id(&self) -> AgentId {
        self.id
    }

    pub fn kernel_id(&self) -> KernelId {
        self.kernel.id
    }

    pub fn organization(&self) -> &Arc<Organization> {
        &self.kernel.org
    }

    pub fn is_shutting_down(&self) -> bool {
        self.kernel.is_shutting_down()
    }

    // --- Organization ---

    /// Create a group open to every requester. This agent becomes its
    /// manager.
    pub fn create_group(&self, community: &str, group: &str, distributed: bool) -> OrgResult<AgentAddress> {
        self.kernel
            .org
            .create_group(self.id, community, group, distributed, None)
    }

    pub fn create_group_with_policy(
        &self,
        community: &str,
        group: &str,
        distributed: bool,
        policy: Arc<dyn AccessPolicy>,
    ) -> OrgResult<AgentAddress> {
        self.kernel
            .org
            .create_group(self.id, community, group, distributed, Some(policy))
    }

    pub fn request_role(&self, community: &str, group: &str, role: &str) -> OrgResult<AgentAddress> {
        self.kernel
            .org
            .request_role(self.id, community, group, role, None)
    }

    /// Request a role, presenting a credential to the group's policy.
    pub fn request_role_with(
        &self,
        community: &str,
        group: &str,
        role: &str,
        credential: &Credential,
    ) -> OrgResult<AgentAddress> {
        self.kernel
            .org
            .request_role(self.id, community, group, role, Some(credential))
    }

    pub fn leave_role(&self, community: &str, group: &str, role: &str) -> OrgResult<()> {
        self.kernel.org.leave_role(self.id, community, group, role)
    }

    pub fn leave_group(&self, community: &str, group: &str) -> OrgResult<()> {
        self.kernel.org.leave_group(self.id, community, group)
    }

    /// Roles held by this agent.
    pub fn roles(&self) -> Vec<Cgr> {
        self.kernel.org.roles_of(self.id)
    }

    pub fn has_role(&self, community: &str, group: &str, role: &str) -> bool {
        self.kernel
            .org
            .address_of(self.id, community, group, role)
            .is_some()
    }

    fn is_me(&self, address: &AgentAddress) -> bool {
        address.agent() == self.id && address.is_local_to(&self.kernel.id)
    }

    /// Other agents playing the role, on any kernel.
    pub fn agents_with_role(&self, community: &str, group: &str, role: &str) -> Vec<AgentAddress> {
        self.kernel
            .org
            .agents_with_role(community, group, role)
            .into_iter()
            .filter(|a| !self.is_me(a))
            .collect()
    }

    /// A random other agent playing the role.
    pub fn agent_with_role(&self, community: &str, group: &str, role: &str) -> Option<AgentAddress> {
        self.kernel
            .org
            .agent_with_role(community, group, role, Some(self.id))
    }

    // --- Messaging ---

    /// This agent's address in a group, used as the sender of messages sent
    /// there.
    fn sender_in(&self, community: &str, group: &str) -> OrgResult<AgentAddress> {
        let held = self
            .roles()
            .into_iter()
            .find(|cgr| cgr.in_group(community, group))
            .and_then(|cgr| {
                self.kernel
                    .org
                    .address_of(self.id, community, group, &cgr.role)
            });
        match held {
            Some(address) => Ok(address),
            None if !self.kernel.org.is_community(community) => {
                Err(OrgError::UnknownCommunity(community.to_string()))
            }
            None if !self.kernel.org.is_group(community, group) => Err(OrgError::UnknownGroup {
                community: community.to_string(),
                group: group.to_string(),
            }),
            None => Err(OrgError::RoleNotHeld(group.to_string())),
        }
    }

    fn pick(&self, community: &str, group: &str, role: &str) -> OrgResult<AgentAddress> {
        self.agent_with_role(community, group, role)
            .ok_or_else(|| OrgError::NotFound(Cgr::new(community, group, role).to_string()))
    }

    /// Send to a random other agent playing the role. Returns the
    /// receiver. This agent must be a member of the group.
    pub fn send_message(
        &self,
        community: &str,
        group: &str,
        role: &str,
        payload: impl Into<Vec<u8>>,
    ) -> OrgResult<AgentAddress> {
        let sender = self.sender_in(community, group)?;
        let receiver = self.pick(community, group, role)?;
        self.kernel
            .send(Message::new(receiver.clone(), payload).with_sender(sender))?;
        Ok(receiver)
    }

    /// Like [`send_message`](Self::send_message), signing the message
    /// with a specific role this agent holds in the group.
    pub fn send_message_with_role(
        &self,
        community: &str,
        group: &str,
        role: &str,
        payload: impl Into<Vec<u8>>,
        sender_role: &str,
    ) -> OrgResult<AgentAddress> {
        let sender = self
            .kernel
            .org
            .address_of(self.id, community, group, sender_role)
            .ok_or_else(|| OrgError::RoleNotHeld(sender_role.to_string()))?;
        let receiver = self.pick(community, group, role)?;
        self.kernel
            .send(Message::new(receiver.clone(), payload).with_sender(sender))?;
        Ok(receiver)
    }

    /// Send to a known address.
    pub fn send_to(&self, receiver: &AgentAddress, payload: impl Into<Vec<u8>>) -> OrgResult<()> {
        let cgr = receiver.cgr();
        let sender = self.sender_in(&cgr.community, &cgr.group)?;
        self.kernel
            .send(Message::new(receiver.clone(), payload).with_sender(sender))
    }

    /// Send to every other agent playing the role. Returns how many
    /// messages were handed over.
    pub fn broadcast(
        &self,
        community: &str,
        group: &str,
        role: &str,
        payload: impl Into<Vec<u8>>,
    ) -> OrgResult<usize> {
        let sender = self.sender_in(community, group)?;
        let receivers = self.agents_with_role(community, group, role);
        if receivers.is_empty() {
            return Err(OrgError::NotFound(Cgr::new(community, group, role).to_string()));
        }
        let payload = payload.into();
        let mut sent = 0;
        for receiver in receivers {
            let message = Message::new(receiver.clone(), payload.clone()).with_sender(sender.clone());
            match self.kernel.send(message) {
                Ok(()) => sent += 1,
                Err(e) => debug!(agent = %self.id, receiver = %receiver, error = %e, "Broadcast skipped a receiver"),
            }
        }
        Ok(sent)
    }

    /// Answer the sender of `to`, signing with the address it was sent to.
    pub fn reply(&self, to: &Message, payload: impl Into<Vec<u8>>) -> OrgResult<()> {
        let receiver = to
            .sender
            .clone()
            .ok_or_else(|| OrgError::NotFound(format!("sender of {}", to.id)))?;
        self.kernel
            .send(Message::new(receiver, payload).with_sender(to.receiver.clone()))
    }

    pub fn next_message(&self) -> Option<Message> {
        self.mailbox.try_next()
    }

    /// Block for the next message. `None` on timeout or once the kernel
    /// closes the mailbox.
    pub fn wait_next_message(&self, timeout: Option<Duration>) -> Option<Message> {
        self.mailbox.wait_next(timeout)
    }

    pub fn pending_messages(&self) -> usize {
        self.mailbox.len()
    }

    // --- Probes ---

    /// Observe a role for as long as this agent lives.
    pub fn add_probe(&self, probe: Arc<Overlooker>) -> bool {
        self.watcher.add_probe(probe)
    }

    pub fn remove_probe(&self, id: OverlookerId) -> bool {
        self.watcher.remove_probe(id)
    }

    // --- Lifecycle ---

    pub fn launch_agent<A: Agent>(&self, agent: A) -> KernelResult<AgentId> {
        self.kernel
            .launch(Box::new(agent), std::any::type_name::<A>().to_string())
    }

    pub fn launch_by_name(&self, kind: &str) -> KernelResult<AgentId> {
        let agent = self.kernel.factory.create(kind)?;
        self.kernel.launch(agent, kind.to_string())
    }

    fn terminate(self, status: AgentStatus) {
        let left = self.kernel.org.leave_all(self.id);
        let probes = self.watcher.remove_all_probes();
        let dropped = self.mailbox.close();
        self.kernel.retire(self.id, status);
        debug!(
            agent = %self.id,
            status = %status,
            roles = left.len(),
            probes,
            dropped,
            "Agent terminated"
        );
    }
}

impl fmt::Debug for AgentContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentContext")
            .field("id", &self.id)
            .field("kernel", &self.kernel.id)
            .finish()
    }
}

/// Body of an agent thread.
pub(crate) fn run(mut agent: Box<dyn Agent>, ctx: AgentContext) {
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        agent.activate(&ctx)?;
        ctx.kernel.set_status(ctx.id, AgentStatus::Running);
        agent.live(&ctx)
    }));
    let ended = panic::catch_unwind(AssertUnwindSafe(|| agent.end(&ctx)));

    let status = match (outcome, ended) {
        (Ok(Ok(())), Ok(())) => AgentStatus::Ended,
        (Ok(Err(e)), Ok(())) => {
            warn!(agent = %ctx.id, error = %e, "Agent stopped on error");
            AgentStatus::Ended
        }
        (Err(panic), _) | (_, Err(panic)) => {
            ctx.kernel
                .org
                .record_crash(ctx.id, None, panic_reason(panic.as_ref()));
            AgentStatus::Crashed
        }
    };
    ctx.terminate(status);
}
