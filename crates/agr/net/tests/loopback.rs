//! Two kernels linked over loopback TCP.

use std::io::{BufReader, BufWriter, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use agr_net::{
    DeltaKind, Frame, FrameReader, FrameWriter, LinkState, LocalDelivery, NetError, NetTimeouts,
    NetworkCoordinator, StdThreads,
};
use agr_org::Organization;
use agr_types::{AgentAddress, AgentId, Cgr, KernelId, Message, OrgError, OrgResult, OrgSnapshot};
use parking_lot::Mutex;

struct Node {
    org: Arc<Organization>,
    net: Arc<NetworkCoordinator>,
    inbox: Arc<Mutex<Vec<Message>>>,
}

fn node() -> Node {
    let org = Arc::new(Organization::new(KernelId::generate()));
    let inbox = Arc::new(Mutex::new(Vec::new()));
    let sink = inbox.clone();
    let delivery: Arc<dyn LocalDelivery> = Arc::new(move |message: Message| -> OrgResult<()> {
        sink.lock().push(message);
        Ok(())
    });
    let timeouts = NetTimeouts {
        connect: Duration::from_secs(2),
        handshake: Duration::from_secs(2),
    };
    let net = NetworkCoordinator::attach(org.clone(), delivery, Arc::new(StdThreads), timeouts);
    Node { org, net, inbox }
}

fn listening() -> (Node, SocketAddr) {
    let node = node();
    let addr = node.net.listen("127.0.0.1:0".parse().unwrap()).unwrap();
    (node, addr)
}

fn eventually(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if condition() {
            return;
        }
        thread::sleep(Duration::from_millis(10));
    }
    panic!("timed out waiting for {}", what);
}

#[test]
fn snapshot_then_deltas_converge() {
    let (k1, addr) = listening();
    let k2 = node();

    let (manager, a1, a2) = (AgentId::new(), AgentId::new(), AgentId::new());
    k1.org.create_group(manager, "c", "g", true, None).unwrap();
    k1.org.request_role(a1, "c", "g", "r", None).unwrap();
    k1.org.request_role(a2, "c", "g", "r", None).unwrap();

    let peer = k2.net.connect(addr).unwrap();
    assert_eq!(peer, k1.org.kernel());

    let listed = k2.org.agents_with_role("c", "g", "r");
    let agents: Vec<AgentId> = listed.iter().map(|a| a.agent()).collect();
    assert_eq!(agents.len(), 2);
    assert!(agents.contains(&a1) && agents.contains(&a2));
    assert!(listed.iter().all(|a| a.kernel() == k1.org.kernel()));

    k1.org.leave_role(a1, "c", "g", "r").unwrap();
    eventually("a1 to leave k2's view", || {
        let now = k2.org.agents_with_role("c", "g", "r");
        now.len() == 1 && now[0].agent() == a2
    });

    let a3 = AgentId::new();
    k1.org.request_role(a3, "c", "g", "late", None).unwrap();
    eventually("a3 to appear on k2", || k2.org.is_role("c", "g", "late"));

    // Peer members are never exported back.
    assert_eq!(k2.org.snapshot().len(), 0);
    eventually("k1 to see the link", || k1.net.peers() == vec![k2.org.kernel()]);
    assert_eq!(k2.net.link_state(peer), Some(LinkState::Streaming));
}

#[test]
fn private_groups_stay_local() {
    let (k1, addr) = listening();
    let k2 = node();
    k1.org.create_group(AgentId::new(), "c", "private", false, None).unwrap();
    k2.net.connect(addr).unwrap();

    k1.org.request_role(AgentId::new(), "c", "private", "r", None).unwrap();
    k1.org.create_group(AgentId::new(), "c", "public", true, None).unwrap();
    eventually("public group on k2", || k2.org.is_group("c", "public"));
    assert!(!k2.org.is_group("c", "private"));
}

#[test]
fn messages_reach_the_remote_agent() {
    let (k1, addr) = listening();
    let k2 = node();
    let receiver = AgentId::new();
    k1.org.create_group(receiver, "c", "g", true, None).unwrap();
    k2.net.connect(addr).unwrap();

    let target = k2.org.agent_with_role("c", "g", "manager", None).unwrap();
    assert_eq!(target.agent(), receiver);
    k2.net.send(Message::new(target.clone(), "ping")).unwrap();
    k2.net.send(Message::new(target, Vec::new())).unwrap();

    eventually("two messages on k1", || k1.inbox.lock().len() == 2);
    let inbox = k1.inbox.lock();
    assert_eq!(inbox[0].text(), Some("ping"));
    assert!(inbox[1].is_empty());
    assert_eq!(inbox[0].receiver.agent(), receiver);
}

#[test]
fn orderly_stop_purges_the_peer() {
    let (k1, addr) = listening();
    let k2 = node();
    k1.org.create_group(AgentId::new(), "c", "g", true, None).unwrap();
    k2.net.connect(addr).unwrap();
    assert!(k2.org.is_group("c", "g"));

    k1.net.stop();
    eventually("k2 to drop k1's agents", || !k2.org.is_community("c"));
    eventually("k2 to drop the link", || k2.net.peers().is_empty());

    let stale = AgentAddress::new(AgentId::new(), Cgr::new("c", "g", "manager"), k1.org.kernel());
    assert_eq!(
        k2.net.send(Message::new(stale, "late")),
        Err(OrgError::UnreachableKernel(k1.org.kernel()))
    );
}

#[test]
fn self_and_duplicate_connections_are_refused() {
    let (k1, addr) = listening();
    assert!(matches!(k1.net.connect(addr), Err(NetError::SelfConnection)));

    let k2 = node();
    k2.net.connect(addr).unwrap();
    assert!(matches!(
        k2.net.connect(addr),
        Err(NetError::AlreadyConnected(peer)) if peer == k1.org.kernel()
    ));
    assert!(k2.net.is_connected(k1.org.kernel()));
    eventually("k1 to keep exactly one link", || k1.net.peers().len() == 1);
}

/// A hand-driven peer speaking the wire protocol directly.
struct RawPeer {
    kernel: KernelId,
    writer: FrameWriter<BufWriter<TcpStream>>,
    reader: FrameReader<BufReader<TcpStream>>,
    socket: TcpStream,
}

impl RawPeer {
    fn connect(addr: SocketAddr, snapshot: impl FnOnce(KernelId) -> OrgSnapshot) -> Self {
        let socket = TcpStream::connect(addr).unwrap();
        let kernel = KernelId::generate();
        let mut writer = FrameWriter::new(BufWriter::new(socket.try_clone().unwrap()));
        let mut reader = FrameReader::new(BufReader::new(socket.try_clone().unwrap()));
        writer.write_frame(&Frame::Handshake { kernel }).unwrap();
        assert!(matches!(
            reader.read_frame().unwrap(),
            Some(Frame::Handshake { .. })
        ));
        writer
            .write_frame(&Frame::Snapshot {
                snapshot: snapshot(kernel),
            })
            .unwrap();
        assert!(matches!(
            reader.read_frame().unwrap(),
            Some(Frame::Snapshot { .. })
        ));
        Self {
            kernel,
            writer,
            reader,
            socket,
        }
    }

    fn join(&mut self, cgr: &Cgr) {
        self.writer
            .write_frame(&Frame::Delta {
                delta: DeltaKind::Join,
                address: AgentAddress::new(AgentId::new(), cgr.clone(), self.kernel),
            })
            .unwrap();
    }
}

fn members(kernel: KernelId, cgr: &Cgr, count: usize) -> OrgSnapshot {
    (0..count)
        .map(|_| AgentAddress::new(AgentId::new(), cgr.clone(), kernel))
        .collect()
}

#[test]
fn abrupt_disconnect_purges_peer_and_empty_roles() {
    let (k1, addr) = listening();
    let local = AgentId::new();
    k1.org.create_group(local, "c", "g", true, None).unwrap();
    k1.org.request_role(local, "c", "g", "shared", None).unwrap();

    let shared = Cgr::new("c", "g", "shared");
    let mut peer = RawPeer::connect(addr, |kernel| members(kernel, &shared, 2));
    peer.join(&Cgr::new("c", "g", "remote"));
    eventually("remote members on k1", || {
        k1.org.agents_with_role("c", "g", "shared").len() == 3 && k1.org.is_role("c", "g", "remote")
    });

    peer.socket.shutdown(Shutdown::Both).unwrap();

    eventually("purge of the raw peer", || !k1.org.is_role("c", "g", "remote"));
    let left = k1.org.agents_with_role("c", "g", "shared");
    assert_eq!(left.len(), 1);
    assert_eq!(left[0].agent(), local);
    assert!(k1.net.peers().is_empty());
}

#[test]
fn only_the_peers_own_members_are_imported() {
    let (k1, addr) = listening();
    let third = KernelId::generate();
    let cgr = Cgr::new("x", "y", "z");
    let mut peer = RawPeer::connect(addr, |kernel| {
        let mut snapshot = members(kernel, &cgr, 2);
        for address in members(third, &cgr, 3).roles().flat_map(|(_, a)| a.to_vec()) {
            snapshot.insert(address);
        }
        snapshot
    });
    eventually("peer snapshot imported", || k1.org.agents_with_role("x", "y", "z").len() == 2);

    // Deltas about a third kernel are ignored as well.
    peer.writer
        .write_frame(&Frame::Delta {
            delta: DeltaKind::Join,
            address: AgentAddress::new(AgentId::new(), cgr.clone(), third),
        })
        .unwrap();
    peer.join(&cgr);
    eventually("own delta applied", || k1.org.agents_with_role("x", "y", "z").len() == 3);
    assert!(k1
        .org
        .agents_with_role("x", "y", "z")
        .iter()
        .all(|a| a.kernel() == peer.kernel));
}

#[test]
fn corrupt_frame_closes_only_that_link() {
    let (k1, addr) = listening();
    let k2 = node();
    k2.org.create_group(AgentId::new(), "c", "from-k2", true, None).unwrap();
    k2.net.connect(addr).unwrap();

    let mut raw = RawPeer::connect(addr, |_| OrgSnapshot::new());
    raw.join(&Cgr::new("c", "raw", "r"));
    eventually("raw member on k1", || k1.org.is_group("c", "raw"));

    // Garbage with a valid-looking header but a broken checksum.
    let mut socket = raw.socket.try_clone().unwrap();
    let mut garbage = Vec::new();
    garbage.extend_from_slice(&4u32.to_le_bytes());
    garbage.extend_from_slice(&4u64.to_le_bytes());
    garbage.extend_from_slice(b"junk");
    garbage.extend_from_slice(&0u32.to_le_bytes());
    socket.write_all(&garbage).unwrap();

    eventually("raw peer purged", || !k1.org.is_group("c", "raw"));
    assert!(k1.org.is_group("c", "from-k2"));
    assert!(k1.net.is_connected(k2.org.kernel()));
    assert!(matches!(raw.reader.read_frame(), Ok(None) | Err(_)));
}
