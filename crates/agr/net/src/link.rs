//! One socket channel between two kernels.
//!
//! ```text
//! Connecting → HandshakeSent → SnapshotExchanged → Streaming → Closed
//! ```
//!
//! Outbound frames are queued and written by a dedicated writer thread;
//! inbound frames are decoded by a receiver thread. Closing is final and
//! purges the peer's addresses from the organization exactly once.

use std::fmt;
use std::io::{BufReader, BufWriter};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Weak};
use std::time::Duration;

use agr_org::Organization;
use agr_types::{AgentAddress, KernelId, Message, OrgSnapshot};
use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use tracing::{debug, info, trace, warn};

use crate::coordinator::{LinkThreads, LocalDelivery};
use crate::error::{NetError, NetResult};
use crate::frame::{Control, DeltaKind, Frame, FrameReader, FrameWriter};

/// How long a local stop waits for the writer to flush the shutdown frame.
const SHUTDOWN_FLUSH_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum LinkState {
    Connecting,
    HandshakeSent,
    SnapshotExchanged,
    Streaming,
    Closed,
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LinkState::Connecting => "connecting",
            LinkState::HandshakeSent => "handshake-sent",
            LinkState::SnapshotExchanged => "snapshot-exchanged",
            LinkState::Streaming => "streaming",
            LinkState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Why a link closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// Stopped by this kernel; the peer is told with a shutdown frame.
    LocalStop,
    PeerShutdown,
    PeerClosed,
    Failed(String),
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::LocalStop => f.write_str("local stop"),
            CloseReason::PeerShutdown => f.write_str("peer shutdown"),
            CloseReason::PeerClosed => f.write_str("peer closed the connection"),
            CloseReason::Failed(reason) => write!(f, "failure: {}", reason),
        }
    }
}

/// Registry of live links, keyed by peer kernel.
pub(crate) type LinkTable = Mutex<std::collections::HashMap<KernelId, Arc<ConnectionLink>>>;

/// Delta handling around the snapshot: changes that happen while the
/// snapshot is being taken are buffered and queued right after it.
enum Deltas {
    Off,
    Buffering(Vec<Frame>),
    Live,
}

struct Outbound {
    queue: Option<Sender<Frame>>,
    deltas: Deltas,
}

pub struct ConnectionLink {
    local: KernelId,
    peer: KernelId,
    remote_addr: Option<SocketAddr>,
    socket: TcpStream,
    org: Arc<Organization>,
    table: Weak<LinkTable>,
    state: Mutex<LinkState>,
    outbound: Mutex<Outbound>,
    writer_done: (Mutex<bool>, Condvar),
    /// Held while the peer's addresses are merged into or purged from the
    /// organization, so nothing is merged after the closing purge.
    membership: Mutex<()>,
}

impl ConnectionLink {
    fn new(
        local: KernelId,
        peer: KernelId,
        socket: TcpStream,
        org: Arc<Organization>,
        table: Weak<LinkTable>,
    ) -> Self {
        Self {
            local,
            peer,
            remote_addr: socket.peer_addr().ok(),
            socket,
            org,
            table,
            state: Mutex::new(LinkState::HandshakeSent),
            outbound: Mutex::new(Outbound {
                queue: None,
                deltas: Deltas::Off,
            }),
            writer_done: (Mutex::new(false), Condvar::new()),
            membership: Mutex::new(()),
        }
    }

    pub fn peer(&self) -> KernelId {
        self.peer
    }

    pub fn local(&self) -> KernelId {
        self.local
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    pub fn state(&self) -> LinkState {
        *self.state.lock()
    }

    pub fn is_closed(&self) -> bool {
        self.state() == LinkState::Closed
    }

    /// Move forward in the state machine. Never leaves `Closed`.
    fn advance(&self, to: LinkState) -> bool {
        let mut state = self.state.lock();
        if *state == LinkState::Closed {
            return false;
        }
        trace!(peer = %self.peer, from = %*state, to = %to, "Link state change");
        *state = to;
        true
    }

    /// Merge the peer's snapshot and move to `SnapshotExchanged`. Does
    /// nothing once the link is closed.
    fn import_snapshot(&self, snapshot: &OrgSnapshot) -> bool {
        let _membership = self.membership.lock();
        if self.is_closed() {
            return false;
        }
        self.org.import_remote_addresses(self.peer, snapshot);
        self.advance(LinkState::SnapshotExchanged)
    }

    /// Apply one membership change announced by the peer, unless the link
    /// is already closed.
    fn apply_delta(&self, delta: DeltaKind, address: &AgentAddress) {
        let _membership = self.membership.lock();
        if self.is_closed() {
            return;
        }
        match delta {
            DeltaKind::Join => self.org.add_remote_member(address),
            DeltaKind::Leave => self.org.remove_remote_member(address),
        };
    }

    fn enqueue(&self, frame: Frame) -> NetResult<()> {
        let outbound = self.outbound.lock();
        match &outbound.queue {
            Some(queue) => queue.send(frame).map_err(|_| NetError::LinkClosed),
            None => Err(NetError::LinkClosed),
        }
    }

    /// Queue a message for the peer. Never blocks on the socket.
    pub fn send_message(&self, message: Message) -> NetResult<()> {
        self.enqueue(Frame::Message { message })
    }

    /// Queue a membership change. Ignored until the snapshot exchange
    /// starts.
    pub(crate) fn push_delta(&self, delta: DeltaKind, address: &AgentAddress) {
        let frame = Frame::Delta {
            delta,
            address: address.clone(),
        };
        let mut outbound = self.outbound.lock();
        let Outbound { queue, deltas } = &mut *outbound;
        match (deltas, queue) {
            (Deltas::Buffering(pending), _) => pending.push(frame),
            (Deltas::Live, Some(queue)) => {
                let _ = queue.send(frame);
            }
            _ => {}
        }
    }

    /// Queue the snapshot of the local organization, followed by every
    /// change made while it was taken.
    fn queue_snapshot(&self, queue: Sender<Frame>) -> NetResult<()> {
        self.outbound.lock().deltas = Deltas::Buffering(Vec::new());
        let snapshot = self.org.snapshot();
        debug!(peer = %self.peer, addresses = snapshot.len(), "Sending snapshot");

        let mut outbound = self.outbound.lock();
        if self.is_closed() {
            return Err(NetError::LinkClosed);
        }
        let buffered = match std::mem::replace(&mut outbound.deltas, Deltas::Live) {
            Deltas::Buffering(buffered) => buffered,
            _ => Vec::new(),
        };
        queue
            .send(Frame::Snapshot { snapshot })
            .map_err(|_| NetError::LinkClosed)?;
        for frame in buffered {
            queue.send(frame).map_err(|_| NetError::LinkClosed)?;
        }
        outbound.queue = Some(queue);
        Ok(())
    }

    fn run_writer(self: Arc<Self>, mut writer: FrameWriter<BufWriter<TcpStream>>, queue: Receiver<Frame>) {
        for frame in queue {
            let kind = frame.kind();
            if let Err(e) = writer.write_frame(&frame) {
                self.close(CloseReason::Failed(format!("write of {} frame: {}", kind, e)));
                break;
            }
        }
        let (done, signal) = &self.writer_done;
        *done.lock() = true;
        signal.notify_all();
        trace!(peer = %self.peer, "Link writer finished");
    }

    fn run_receiver<R: std::io::Read>(self: Arc<Self>, mut reader: FrameReader<R>, delivery: Arc<dyn LocalDelivery>) {
        let reason = loop {
            let frame = match reader.read_frame() {
                Ok(Some(frame)) => frame,
                Ok(None) => break CloseReason::PeerClosed,
                Err(e) => break CloseReason::Failed(e.to_string()),
            };
            match frame {
                Frame::Message { message } => {
                    let receiver = message.receiver.clone();
                    if let Err(e) = delivery.deliver(message) {
                        debug!(peer = %self.peer, receiver = %receiver, error = %e, "Inbound message dropped");
                    }
                }
                Frame::Delta { delta, address } => {
                    if address.kernel() != self.peer {
                        warn!(peer = %self.peer, address = %address, "Ignoring delta for a third kernel");
                        continue;
                    }
                    self.apply_delta(delta, &address);
                }
                Frame::Control {
                    control: Control::Shutdown,
                } => break CloseReason::PeerShutdown,
                other => {
                    break CloseReason::Failed(format!("unexpected {} frame while streaming", other.kind()))
                }
            }
        };
        self.close(reason);
    }

    /// Close the link. The first call purges the peer's addresses and
    /// unregisters the link; later calls do nothing.
    pub fn close(&self, reason: CloseReason) {
        {
            let mut state = self.state.lock();
            if *state == LinkState::Closed {
                return;
            }
            *state = LinkState::Closed;
        }

        let queue = {
            let mut outbound = self.outbound.lock();
            outbound.deltas = Deltas::Off;
            outbound.queue.take()
        };
        if reason == CloseReason::LocalStop {
            if let Some(queue) = queue {
                let _ = queue.send(Frame::Control {
                    control: Control::Shutdown,
                });
                drop(queue);
                let (done, signal) = &self.writer_done;
                let mut finished = done.lock();
                if !*finished {
                    signal.wait_for(&mut finished, SHUTDOWN_FLUSH_TIMEOUT);
                }
            }
        } else {
            drop(queue);
        }
        let _ = self.socket.shutdown(Shutdown::Both);

        if let Some(table) = self.table.upgrade() {
            let mut links = table.lock();
            if links
                .get(&self.peer)
                .map_or(false, |current| std::ptr::eq(Arc::as_ptr(current), self))
            {
                links.remove(&self.peer);
            }
        }
        let purged = {
            let _membership = self.membership.lock();
            self.org.purge_kernel(self.peer)
        };
        info!(peer = %self.peer, reason = %reason, purged, "Link closed");
    }
}

impl fmt::Debug for ConnectionLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionLink")
            .field("local", &self.local)
            .field("peer", &self.peer)
            .field("remote_addr", &self.remote_addr)
            .field("state", &self.state())
            .finish()
    }
}

/// Everything a link needs from its coordinator.
pub(crate) struct LinkContext {
    pub local: KernelId,
    pub org: Arc<Organization>,
    pub delivery: Arc<dyn LocalDelivery>,
    pub threads: Arc<dyn LinkThreads>,
    pub table: Arc<LinkTable>,
    pub handshake_timeout: Duration,
    /// Set by the coordinator before it closes every registered link.
    pub stopped: AtomicBool,
}

/// Run the handshake and snapshot exchange over `socket`, register the link
/// and start its threads.
pub(crate) fn establish(socket: TcpStream, ctx: &LinkContext) -> NetResult<Arc<ConnectionLink>> {
    socket.set_nodelay(true)?;
    socket.set_read_timeout(Some(ctx.handshake_timeout))?;
    let mut writer = FrameWriter::new(BufWriter::new(socket.try_clone()?));
    let mut reader = FrameReader::new(BufReader::new(socket.try_clone()?));

    // Connecting
    writer.write_frame(&Frame::Handshake { kernel: ctx.local })?;
    let peer = match reader.read_frame() {
        Ok(Some(Frame::Handshake { kernel })) => kernel,
        Ok(Some(other)) => {
            let _ = socket.shutdown(Shutdown::Both);
            return Err(NetError::Handshake(format!("expected handshake, got {}", other.kind())));
        }
        Ok(None) => {
            let _ = socket.shutdown(Shutdown::Both);
            return Err(NetError::Handshake("peer closed during handshake".into()));
        }
        Err(e) => {
            let _ = socket.shutdown(Shutdown::Both);
            return Err(e);
        }
    };
    if peer == ctx.local {
        let _ = socket.shutdown(Shutdown::Both);
        return Err(NetError::SelfConnection);
    }

    let link = Arc::new(ConnectionLink::new(
        ctx.local,
        peer,
        socket,
        ctx.org.clone(),
        Arc::downgrade(&ctx.table),
    ));
    {
        let mut links = ctx.table.lock();
        if ctx.stopped.load(Ordering::Acquire) {
            drop(links);
            let _ = link.socket.shutdown(Shutdown::Both);
            return Err(NetError::LinkClosed);
        }
        if links.contains_key(&peer) {
            drop(links);
            let _ = link.socket.shutdown(Shutdown::Both);
            return Err(NetError::AlreadyConnected(peer));
        }
        links.insert(peer, link.clone());
    }
    debug!(peer = %peer, remote = ?link.remote_addr, "Handshake complete");

    // From here on a failure closes the registered link, which purges.
    let (queue, pending) = mpsc::channel();
    if let Err(e) = link.queue_snapshot(queue) {
        link.close(CloseReason::Failed(e.to_string()));
        return Err(e);
    }
    let writer_link = link.clone();
    if let Err(e) = ctx.threads.spawn_link_thread(
        &format!("link-tx-{}", peer.short()),
        Box::new(move || writer_link.run_writer(writer, pending)),
    ) {
        link.close(CloseReason::Failed(e.to_string()));
        return Err(e.into());
    }

    let snapshot = match reader.read_frame() {
        Ok(Some(Frame::Snapshot { snapshot })) => snapshot,
        Ok(Some(other)) => {
            let e = NetError::Handshake(format!("expected snapshot, got {}", other.kind()));
            link.close(CloseReason::Failed(e.to_string()));
            return Err(e);
        }
        Ok(None) => {
            link.close(CloseReason::PeerClosed);
            return Err(NetError::LinkClosed);
        }
        Err(e) => {
            link.close(CloseReason::Failed(e.to_string()));
            return Err(e);
        }
    };
    if !link.import_snapshot(&snapshot) {
        return Err(NetError::LinkClosed);
    }

    if let Err(e) = link.socket.set_read_timeout(None) {
        link.close(CloseReason::Failed(e.to_string()));
        return Err(e.into());
    }
    let receiver_link = link.clone();
    let delivery = ctx.delivery.clone();
    if let Err(e) = ctx.threads.spawn_link_thread(
        &format!("link-rx-{}", peer.short()),
        Box::new(move || receiver_link.run_receiver(reader, delivery)),
    ) {
        link.close(CloseReason::Failed(e.to_string()));
        return Err(e.into());
    }
    link.advance(LinkState::Streaming);
    info!(peer = %peer, remote = ?link.remote_addr, "Link streaming");
    Ok(link)
}
