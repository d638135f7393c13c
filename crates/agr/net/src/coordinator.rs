//! Kernel-side owner of every peer link.
//!
//! The coordinator accepts and opens links, forwards outbound messages to
//! the link of the receiver's kernel and pushes local membership changes to
//! every link. There is no central coordinator between kernels: each one
//! runs its own and links are symmetric once established.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use agr_org::{OrgListener, Organization};
use agr_types::{AgentAddress, KernelId, Message, OrgError, OrgResult};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::error::{NetError, NetResult};
use crate::frame::DeltaKind;
use crate::link::{establish, CloseReason, ConnectionLink, LinkContext, LinkState};

/// Hands inbound messages to local agents.
pub trait LocalDelivery: Send + Sync {
    fn deliver(&self, message: Message) -> OrgResult<()>;
}

impl<F> LocalDelivery for F
where
    F: Fn(Message) -> OrgResult<()> + Send + Sync,
{
    fn deliver(&self, message: Message) -> OrgResult<()> {
        self(message)
    }
}

/// Spawns the long-lived threads of links and the acceptor.
pub trait LinkThreads: Send + Sync {
    fn spawn_link_thread(
        &self,
        name: &str,
        body: Box<dyn FnOnce() + Send + 'static>,
    ) -> std::io::Result<()>;
}

/// Plain named OS threads.
#[derive(Debug, Default, Clone, Copy)]
pub struct StdThreads;

impl LinkThreads for StdThreads {
    fn spawn_link_thread(
        &self,
        name: &str,
        body: Box<dyn FnOnce() + Send + 'static>,
    ) -> std::io::Result<()> {
        std::thread::Builder::new()
            .name(name.to_string())
            .spawn(body)
            .map(|_| ())
    }
}

/// Timeouts used while opening links.
#[derive(Debug, Clone, Copy)]
pub struct NetTimeouts {
    pub connect: Duration,
    pub handshake: Duration,
}

impl Default for NetTimeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(5),
            handshake: Duration::from_secs(5),
        }
    }
}

pub struct NetworkCoordinator {
    ctx: LinkContext,
    timeouts: NetTimeouts,
    listen_addr: Mutex<Option<SocketAddr>>,
}

impl NetworkCoordinator {
    pub fn new(
        org: Arc<Organization>,
        delivery: Arc<dyn LocalDelivery>,
        threads: Arc<dyn LinkThreads>,
        timeouts: NetTimeouts,
    ) -> Arc<Self> {
        Arc::new(Self {
            ctx: LinkContext {
                local: org.kernel(),
                org,
                delivery,
                threads,
                table: Arc::new(Mutex::new(HashMap::new())),
                handshake_timeout: timeouts.handshake,
                stopped: AtomicBool::new(false),
            },
            timeouts,
            listen_addr: Mutex::new(None),
        })
    }

    /// Create a coordinator and register it as the organization's listener.
    pub fn attach(
        org: Arc<Organization>,
        delivery: Arc<dyn LocalDelivery>,
        threads: Arc<dyn LinkThreads>,
        timeouts: NetTimeouts,
    ) -> Arc<Self> {
        let coordinator = Self::new(org.clone(), delivery, threads, timeouts);
        if !org.set_listener(coordinator.clone()) {
            warn!(kernel = %org.kernel(), "Organization already has a listener");
        }
        coordinator
    }

    pub fn local(&self) -> KernelId {
        self.ctx.local
    }

    pub fn listen_addr(&self) -> Option<SocketAddr> {
        *self.listen_addr.lock()
    }

    fn ensure_running(&self) -> NetResult<()> {
        if self.ctx.stopped.load(Ordering::Acquire) {
            Err(NetError::LinkClosed)
        } else {
            Ok(())
        }
    }

    /// Accept peer connections on `addr`. Returns the bound address.
    pub fn listen(self: &Arc<Self>, addr: SocketAddr) -> NetResult<SocketAddr> {
        self.ensure_running()?;
        let listener = TcpListener::bind(addr)?;
        let bound = listener.local_addr()?;
        *self.listen_addr.lock() = Some(bound);

        let coordinator = self.clone();
        self.ctx.threads.spawn_link_thread(
            "link-acceptor",
            Box::new(move || coordinator.accept_loop(listener)),
        )?;
        info!(kernel = %self.ctx.local, addr = %bound, "Listening for peers");
        Ok(bound)
    }

    fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        for stream in listener.incoming() {
            if self.ctx.stopped.load(Ordering::Acquire) {
                break;
            }
            let stream = match stream {
                Ok(stream) => stream,
                Err(e) => {
                    warn!(error = %e, "Accept failed");
                    continue;
                }
            };
            let remote = stream.peer_addr().ok();
            let coordinator = self.clone();
            let spawned = self.ctx.threads.spawn_link_thread(
                "link-inbound",
                Box::new(move || match establish(stream, &coordinator.ctx) {
                    Ok(link) => debug!(peer = %link.peer(), remote = ?remote, "Inbound link up"),
                    Err(e) => debug!(remote = ?remote, error = %e, "Inbound link refused"),
                }),
            );
            if let Err(e) = spawned {
                warn!(error = %e, "Could not spawn inbound link thread");
            }
        }
        debug!(kernel = %self.ctx.local, "Acceptor stopped");
    }

    /// Open a link to the kernel listening on `addr`. Returns the peer.
    pub fn connect(&self, addr: SocketAddr) -> NetResult<KernelId> {
        self.ensure_running()?;
        let stream = TcpStream::connect_timeout(&addr, self.timeouts.connect)?;
        let link = establish(stream, &self.ctx)?;
        Ok(link.peer())
    }

    /// Forward a message to its receiver's kernel. Fails with
    /// `UnreachableKernel` when there is no live link; nothing is queued for
    /// later.
    pub fn send(&self, message: Message) -> OrgResult<()> {
        let kernel = message.receiver.kernel();
        let link = self.link(kernel).ok_or(OrgError::UnreachableKernel(kernel))?;
        link.send_message(message)
            .map_err(|_| OrgError::UnreachableKernel(kernel))
    }

    fn link(&self, peer: KernelId) -> Option<Arc<ConnectionLink>> {
        self.ctx
            .table
            .lock()
            .get(&peer)
            .filter(|link| !link.is_closed())
            .cloned()
    }

    fn links(&self) -> Vec<Arc<ConnectionLink>> {
        self.ctx.table.lock().values().cloned().collect()
    }

    /// Kernels with a live link.
    pub fn peers(&self) -> Vec<KernelId> {
        let mut peers: Vec<KernelId> = self
            .links()
            .iter()
            .filter(|link| !link.is_closed())
            .map(|link| link.peer())
            .collect();
        peers.sort();
        peers
    }

    pub fn is_connected(&self, peer: KernelId) -> bool {
        self.link(peer).is_some()
    }

    pub fn link_state(&self, peer: KernelId) -> Option<LinkState> {
        self.ctx.table.lock().get(&peer).map(|link| link.state())
    }

    /// Close the link to `peer`, telling it we are leaving.
    pub fn disconnect(&self, peer: KernelId) -> bool {
        match self.link(peer) {
            Some(link) => {
                link.close(CloseReason::LocalStop);
                true
            }
            None => false,
        }
    }

    /// Stop accepting and close every link.
    pub fn stop(&self) {
        if self.ctx.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(addr) = self.listen_addr() {
            // Wake the acceptor so it sees the stop flag.
            let _ = TcpStream::connect_timeout(&wake_addr(addr), Duration::from_millis(200));
        }
        // Taken under the table lock, so a link registering concurrently
        // either sees the flag or is in this list.
        let links = self.links();
        for link in &links {
            link.close(CloseReason::LocalStop);
        }
        info!(kernel = %self.ctx.local, links = links.len(), "Network coordinator stopped");
    }

    fn broadcast_delta(&self, delta: DeltaKind, address: &AgentAddress) {
        if !address.is_local_to(&self.ctx.local) {
            return;
        }
        for link in self.links() {
            link.push_delta(delta, address);
        }
    }
}

impl OrgListener for NetworkCoordinator {
    fn role_joined(&self, address: &AgentAddress) {
        self.broadcast_delta(DeltaKind::Join, address);
    }

    fn role_left(&self, address: &AgentAddress) {
        self.broadcast_delta(DeltaKind::Leave, address);
    }
}

impl std::fmt::Debug for NetworkCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkCoordinator")
            .field("local", &self.ctx.local)
            .field("listen_addr", &self.listen_addr())
            .field("peers", &self.peers())
            .finish()
    }
}

/// A connectable form of a listening address.
fn wake_addr(addr: SocketAddr) -> SocketAddr {
    let ip = match addr.ip() {
        IpAddr::V4(ip) if ip.is_unspecified() => IpAddr::V4(Ipv4Addr::LOCALHOST),
        IpAddr::V6(ip) if ip.is_unspecified() => IpAddr::V6(Ipv6Addr::LOCALHOST),
        ip => ip,
    };
    SocketAddr::new(ip, addr.port())
}

#[cfg(test)]
mod tests {
    use super::*;
    use agr_types::{AgentId, Cgr};

    fn coordinator() -> Arc<NetworkCoordinator> {
        let org = Arc::new(Organization::new(KernelId::generate()));
        let delivery: Arc<dyn LocalDelivery> = Arc::new(|_: Message| -> OrgResult<()> { Ok(()) });
        NetworkCoordinator::attach(org, delivery, Arc::new(StdThreads), NetTimeouts::default())
    }

    #[test]
    fn send_without_link_is_unreachable() {
        let coordinator = coordinator();
        let peer = KernelId::generate();
        let receiver = AgentAddress::new(AgentId::new(), Cgr::new("c", "g", "r"), peer);
        assert_eq!(
            coordinator.send(Message::new(receiver, "hi")),
            Err(OrgError::UnreachableKernel(peer))
        );
        assert!(coordinator.peers().is_empty());
        assert!(!coordinator.disconnect(peer));
    }

    #[test]
    fn unspecified_listen_address_wakes_on_loopback() {
        let addr: SocketAddr = "0.0.0.0:4100".parse().unwrap();
        assert_eq!(wake_addr(addr), "127.0.0.1:4100".parse().unwrap());
        let addr: SocketAddr = "10.1.2.3:4100".parse().unwrap();
        assert_eq!(wake_addr(addr), addr);
    }

    #[test]
    fn stopped_coordinator_refuses_work() {
        let coordinator = coordinator();
        coordinator.stop();
        assert!(matches!(
            coordinator.listen("127.0.0.1:0".parse().unwrap()),
            Err(NetError::LinkClosed)
        ));
        assert!(matches!(
            coordinator.connect("127.0.0.1:1".parse().unwrap()),
            Err(NetError::LinkClosed)
        ));
    }
}
