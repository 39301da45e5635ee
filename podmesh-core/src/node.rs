//! Peer discovery and membership: identity rank, the accept/dial loops, and the
//! `identify`/`nodeinfo`/`endpoint` RPC handlers that keep the peer table and the
//! kernel WireGuard state converged on the observed topology.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use wireguard_control::Key;

use crate::error::{Error, Result};
use crate::hooks::Hook;
use crate::rpc::RpcChannel;
use crate::types::{ConnectionInfo, Endpoint, Node};
use crate::wg::WireGuardReconciler;

/// Fixed TCP port the overlay listens on, on every node's overlay address.
pub const SERVER_PORT: u16 = 51935;

const DIAL_POLL_INTERVAL: Duration = Duration::from_secs(2);
const DIAL_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// A public key, interpreted as a 256-bit big-endian integer, decides which of two
/// peers dials the other: the local side is the dialer iff `(local - peer) mod 2^256`
/// has its top bit set. This is the RFC 1982-style half-space split — it gives every
/// ordered pair of distinct keys exactly one dialer without any coordination, and is
/// its own inverse: swapping the arguments flips the answer (barring the one-in-2^255
/// tie where the difference lands exactly on the split point).
pub fn rank_selects_dialer(local: &Key, peer: &Key) -> bool {
    let mut borrow = 0i16;
    let mut top_byte = 0u8;
    for i in (0..32).rev() {
        let a = local.as_bytes()[i] as i16;
        let b = peer.as_bytes()[i] as i16;
        let mut diff = a - b - borrow;
        if diff < 0 {
            diff += 256;
            borrow = 1;
        } else {
            borrow = 0;
        }
        if i == 0 {
            top_byte = diff as u8;
        }
    }
    top_byte & 0x80 != 0
}

struct PeerEntry {
    channel: Arc<RpcChannel>,
    node: Node,
}

struct State {
    peers: HashMap<String, PeerEntry>,
    pending_dial: Vec<ConnectionInfo>,
}

/// Tells the accept thread and dial poller to stop at their next check, and lets
/// callers wait for both loops to actually exit.
#[derive(Clone, Default)]
pub struct Shutdown {
    flag: Arc<AtomicBool>,
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn requested(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    pub fn request(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }
}

/// Owns this node's identity, its view of the mesh (peer table + pending dials), and
/// dispatches the three discovery RPCs. All mutable membership state lives behind one
/// `Mutex` — handlers run concurrently on each channel's receive thread plus the
/// accept and dial-poll threads, so a single lock domain is what keeps the peer table
/// and pending-dial set consistent (see the concurrency notes in the crate root).
pub struct NodeManager {
    name: String,
    local_conn: Mutex<ConnectionInfo>,
    wg: Arc<dyn WireGuardReconciler>,
    state: Mutex<State>,
    /// Fired once, with the newly identified `Node`, the first time a peer identifies.
    pub on_connection_created: Hook<Node>,
    /// Fired once, with the peer's name, when its channel closes.
    pub on_connection_lost: Hook<String>,
}

impl NodeManager {
    pub fn new(
        name: impl Into<String>,
        local_conn: ConnectionInfo,
        wg: Arc<dyn WireGuardReconciler>,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            local_conn: Mutex::new(local_conn),
            wg,
            state: Mutex::new(State { peers: HashMap::new(), pending_dial: Vec::new() }),
            on_connection_created: Hook::new(),
            on_connection_lost: Hook::new(),
        })
    }

    fn local_node(&self) -> Node {
        Node { name: self.name.clone(), wg_conninfo: self.local_conn.lock().clone() }
    }

    /// The overlay address this node listens and dials from.
    pub fn overlay_addr(&self) -> std::net::IpAddr {
        self.local_conn.lock().cidr.addr()
    }

    /// Names of every peer with a live channel right now.
    pub fn peer_names(self: &Arc<Self>) -> Vec<String> {
        self.state.lock().peers.keys().cloned().collect()
    }

    /// Configures the kernel peer for `conn` and, if the rank rule selects the local
    /// side as dialer, queues it for the dial poller. Fails with `NoCommonNetwork` if
    /// the WireGuard controller can't reconcile the peer, or `DuplicateIdentity` if
    /// `conn` presents this node's own public key.
    pub fn add_peer(self: &Arc<Self>, conn: ConnectionInfo) -> Result<()> {
        if &conn.public_key == self.wg.public_key() {
            return Err(Error::DuplicateIdentity);
        }

        self.wg.update_peer(&conn)?;

        if rank_selects_dialer(self.wg.public_key(), &conn.public_key) {
            self.state.lock().pending_dial.push(conn);
        }
        Ok(())
    }

    /// Spawns the accept thread: binds the overlay listening socket and wraps every
    /// accepted connection as an RPC channel. Runs until `shutdown` is requested.
    pub fn spawn_accept_loop(self: &Arc<Self>, shutdown: Shutdown) -> std::io::Result<thread::JoinHandle<()>> {
        let listener = TcpListener::bind((self.overlay_addr(), SERVER_PORT))?;
        listener.set_nonblocking(true)?;
        let manager = Arc::clone(self);

        Ok(thread::spawn(move || {
            loop {
                if shutdown.requested() {
                    break;
                }
                match listener.accept() {
                    Ok((stream, _addr)) => {
                        if let Err(e) = stream.set_nonblocking(false) {
                            log::warn!("could not configure accepted socket: {e}");
                            continue;
                        }
                        manager.accept_peer(stream);
                    },
                    Err(e) if e.kind() == ErrorKind::WouldBlock => {
                        thread::sleep(ACCEPT_POLL_INTERVAL);
                    },
                    Err(e) => log::warn!("accept failed: {e}"),
                }
            }
        }))
    }

    /// Spawns the dial poller: every 2 seconds, attempts a 2-second-timeout connect to
    /// every entry still in `PendingDial`. Successes are wrapped and removed;
    /// failures are silently retried on the next tick. Runs until `shutdown` is
    /// requested.
    pub fn spawn_dial_poll_loop(self: &Arc<Self>, shutdown: Shutdown) -> thread::JoinHandle<()> {
        let manager = Arc::clone(self);
        thread::spawn(move || loop {
            if shutdown.requested() {
                break;
            }
            thread::sleep(DIAL_POLL_INTERVAL);
            if shutdown.requested() {
                break;
            }
            manager.dial_poll_tick();
        })
    }

    fn dial_poll_tick(self: &Arc<Self>) {
        let pending = std::mem::take(&mut self.state.lock().pending_dial);
        let mut still_pending = Vec::new();

        for conn in pending {
            let addr = std::net::SocketAddr::new(conn.cidr.addr(), SERVER_PORT);
            match TcpStream::connect_timeout(&addr, DIAL_CONNECT_TIMEOUT) {
                Ok(stream) => self.dial_peer(stream),
                Err(e) => {
                    log::debug!("dial to {addr} failed, retrying next tick: {e}");
                    still_pending.push(conn);
                },
            }
        }

        self.state.lock().pending_dial.extend(still_pending);
    }

    fn accept_peer(self: &Arc<Self>, stream: TcpStream) {
        match RpcChannel::new(stream) {
            Ok(channel) => self.register_channel(channel),
            Err(e) => log::warn!("failed to wrap accepted connection: {e}"),
        }
    }

    fn dial_peer(self: &Arc<Self>, stream: TcpStream) {
        match RpcChannel::new(stream) {
            Ok(channel) => self.register_channel(channel),
            Err(e) => log::warn!("failed to wrap dialed connection: {e}"),
        }
    }

    /// Registers the three discovery methods on a freshly connected (accepted or
    /// dialed) channel, starts its receive loop, and sends our own identity.
    fn register_channel(self: &Arc<Self>, channel: Arc<RpcChannel>) {
        let peer_addr = channel.peer_addr();

        let manager = Arc::clone(self);
        channel.register::<Node, _>("identify", move |chan, node| manager.handle_identify(chan, node));

        let manager = Arc::clone(self);
        channel.register::<Node, _>("nodeinfo", move |chan, node| manager.handle_nodeinfo(chan, node));

        let manager = Arc::clone(self);
        channel.register::<Endpoint, _>("endpoint", move |chan, ep| manager.handle_endpoint(chan, ep));

        let manager = Arc::clone(self);
        channel.on_close(move |chan| manager.handle_channel_closed(chan));

        channel.run_server();

        if let Err(e) = channel.send("identify", &self.local_node()) {
            log::warn!("failed to send initial identify to {peer_addr}: {e}");
        }
    }

    /// "This is who I am." First identify from a name inserts it into the peer table
    /// and fires `on_connection_created`; a later identify (e.g. after an endpoint
    /// change) just refreshes the stored record. Either way, if the kernel already
    /// has an endpoint on file for this peer, we report it back so they learn how we
    /// see them — the sole NAT-traversal signal in the protocol.
    fn handle_identify(self: &Arc<Self>, channel: &Arc<RpcChannel>, node: Node) {
        let is_new = {
            let mut state = self.state.lock();
            match state.peers.get_mut(&node.name) {
                Some(entry) => {
                    entry.node = node.clone();
                    entry.channel = Arc::clone(channel);
                    false
                },
                None => {
                    state.peers.insert(
                        node.name.clone(),
                        PeerEntry { channel: Arc::clone(channel), node: node.clone() },
                    );
                    true
                },
            }
        };

        if is_new {
            self.on_connection_created.fire(&node);
        }

        if let Some(addr) = self.wg.peer_endpoint(&node.wg_conninfo.public_key) {
            let ep = Endpoint::new(addr.ip(), addr.port());
            if let Err(e) = channel.send("endpoint", &ep) {
                log::warn!("failed to report observed endpoint to {}: {e}", node.name);
            }
        }
    }

    /// "Here is a node you may not have met." Gossip relay: if we don't already know
    /// this name, install its kernel peer and (if rank selects us) queue a dial.
    fn handle_nodeinfo(self: &Arc<Self>, _channel: &Arc<RpcChannel>, node: Node) {
        let already_known = self.state.lock().peers.contains_key(&node.name);
        if already_known {
            return;
        }

        if let Err(e) = self.add_peer(node.wg_conninfo) {
            log::warn!("could not add gossiped peer '{}': {e}", node.name);
        }
    }

    /// "This is how I see you on our shared network." Updates our own observed
    /// endpoint for the network shared with the reporter, and if it changed,
    /// re-identifies to every other open channel so they can update their kernel
    /// peer entry for us.
    fn handle_endpoint(self: &Arc<Self>, reporter: &Arc<RpcChannel>, ep: Endpoint) {
        let reporter_networks = {
            let state = self.state.lock();
            state
                .peers
                .values()
                .find(|entry| Arc::ptr_eq(&entry.channel, reporter))
                .map(|entry| entry.node.wg_conninfo.networks.clone())
        };

        let Some(reporter_networks) = reporter_networks else {
            log::warn!("endpoint report from an unidentified channel; ignoring");
            return;
        };

        let Some(label) = self.wg.find_common_network(&reporter_networks) else {
            return;
        };

        let changed = {
            let mut local = self.local_conn.lock();
            if local.endpoints.get(&label) == Some(&ep) {
                false
            } else {
                local.endpoints.insert(label, ep);
                true
            }
        };

        if changed {
            self.cascade_identify(reporter);
        }
    }

    /// Re-sends `identify` to every peer channel except `exclude`.
    fn cascade_identify(self: &Arc<Self>, exclude: &Arc<RpcChannel>) {
        let node = self.local_node();
        let targets: Vec<(String, Arc<RpcChannel>)> = self
            .state
            .lock()
            .peers
            .iter()
            .filter(|(_, entry)| !Arc::ptr_eq(&entry.channel, exclude))
            .map(|(name, entry)| (name.clone(), Arc::clone(&entry.channel)))
            .collect();

        for (name, channel) in targets {
            if let Err(e) = channel.send("identify", &node) {
                log::warn!("identify cascade to '{name}' failed, closing channel: {e}");
                channel.close();
            }
        }
    }

    /// Removes a closed channel's peer from the table (if it's still the live
    /// channel for that name — a reconnect may have already replaced it) and fires
    /// `on_connection_lost`.
    fn handle_channel_closed(self: &Arc<Self>, channel: &Arc<RpcChannel>) {
        let lost_name = {
            let mut state = self.state.lock();
            let name = state
                .peers
                .iter()
                .find(|(_, entry)| Arc::ptr_eq(&entry.channel, channel))
                .map(|(name, _)| name.clone());
            if let Some(name) = &name {
                state.peers.remove(name);
            }
            name
        };

        if let Some(name) = lost_name {
            self.on_connection_lost.fire(&name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wg::fake::FakeWireGuard;
    use std::net::TcpListener as StdTcpListener;
    use std::sync::atomic::AtomicU32;
    use std::time::Instant;

    fn key(byte: u8) -> Key {
        Key([byte; 32])
    }

    #[test]
    fn rank_is_antisymmetric_for_distinct_keys() {
        for a in 0u8..8 {
            for b in 0u8..8 {
                if a == b {
                    continue;
                }
                let k1 = key(a);
                let k2 = key(b);
                assert_ne!(
                    rank_selects_dialer(&k1, &k2),
                    rank_selects_dialer(&k2, &k1),
                    "a={a} b={b}"
                );
            }
        }
    }

    #[test]
    fn rank_is_false_for_identical_keys() {
        let k = key(7);
        assert!(!rank_selects_dialer(&k, &k));
    }

    #[test]
    fn rank_picks_the_higher_key_in_the_common_case() {
        // (local - peer) mod 2^256 is what's compared, not local and peer directly, so
        // the numerically smaller key can still come out as the dialer: 3 - 9 wraps to
        // a value with its top bit set, while 9 - 3 does not.
        assert!(!rank_selects_dialer(&key(9), &key(3)));
        assert!(rank_selects_dialer(&key(3), &key(9)));
    }

    fn wait_for<F: Fn() -> bool>(cond: F, timeout: Duration) -> bool {
        let start = Instant::now();
        while start.elapsed() < timeout {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(20));
        }
        cond()
    }

    fn conn(public_key: Key, cidr: &str, networks: &[&str]) -> ConnectionInfo {
        ConnectionInfo {
            public_key,
            cidr: cidr.parse().unwrap(),
            networks: networks.iter().map(|s| s.to_string()).collect(),
            endpoints: HashMap::new(),
        }
    }

    fn manager(name: &str, public_key: Key, cidr: &str, networks: &[&str]) -> Arc<NodeManager> {
        let wg = Arc::new(FakeWireGuard::new(public_key.clone(), networks.iter().map(|s| s.to_string()).collect()));
        NodeManager::new(name, conn(public_key, cidr, networks), wg)
    }

    /// Scenario A from the spec: two nodes that already know each other converge to a
    /// live channel on both sides within one poll tick, without a real listening
    /// socket — `add_peer` plus a manually-established loopback pair stands in for
    /// the accept/dial loops, which is all `register_channel` actually needs.
    #[test]
    fn two_nodes_converge_after_identify() {
        let _ = env_logger::try_init();

        let n1 = manager("n1", key(1), "10.97.0.1/24", &["public"]);
        let n2 = manager("n2", key(2), "10.97.0.2/24", &["public"]);

        n1.add_peer(conn(key(2), "10.97.0.2/24", &["public"])).unwrap();
        n2.add_peer(conn(key(1), "10.97.0.1/24", &["public"])).unwrap();

        let listener = StdTcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();

        // n1 has the higher key rank, so it's the dialer; wire its end of the
        // loopback pair as the "dial" side and n2's as the "accept" side.
        n1.register_channel(RpcChannel::new(client).unwrap());
        n2.register_channel(RpcChannel::new(server).unwrap());

        assert!(wait_for(|| n1.peer_names().contains(&"n2".to_string()), Duration::from_secs(2)));
        assert!(wait_for(|| n2.peer_names().contains(&"n1".to_string()), Duration::from_secs(2)));
    }

    #[test]
    fn on_connection_created_fires_once_for_first_identify() {
        let n1 = manager("n1", key(1), "10.97.0.1/24", &["public"]);
        let count = Arc::new(AtomicU32::new(0));
        let count_clone = Arc::clone(&count);
        n1.on_connection_created.add_callback(move |_| {
            count_clone.fetch_add(1, Ordering::SeqCst);
        });

        let listener = StdTcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();

        n1.register_channel(RpcChannel::new(server).unwrap());
        let other = RpcChannel::new(client).unwrap();
        other.register::<Node, _>("identify", |_, _| {});
        other.register::<Endpoint, _>("endpoint", |_, _| {});
        other.run_server();
        other
            .send(
                "identify",
                &Node {
                    name: "n2".to_string(),
                    wg_conninfo: conn(key(2), "10.97.0.2/24", &["public"]),
                },
            )
            .unwrap();

        assert!(wait_for(|| count.load(Ordering::SeqCst) == 1, Duration::from_secs(2)));
        // Re-identifying the same name must not fire a second time.
        other
            .send(
                "identify",
                &Node {
                    name: "n2".to_string(),
                    wg_conninfo: conn(key(2), "10.97.0.2/24", &["public"]),
                },
            )
            .unwrap();
        thread::sleep(Duration::from_millis(100));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn add_peer_rejects_own_public_key() {
        let n1 = manager("n1", key(1), "10.97.0.1/24", &["public"]);
        let result = n1.add_peer(conn(key(1), "10.97.0.9/24", &["public"]));
        assert!(matches!(result, Err(Error::DuplicateIdentity)));
    }

    #[test]
    fn channel_close_removes_peer_and_fires_lost_hook() {
        let n1 = manager("n1", key(1), "10.97.0.1/24", &["public"]);
        let lost = Arc::new(Mutex::new(None));
        let lost_clone = Arc::clone(&lost);
        n1.on_connection_lost.add_callback(move |name: &String| {
            *lost_clone.lock() = Some(name.clone());
        });

        let listener = StdTcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();

        n1.register_channel(RpcChannel::new(server).unwrap());
        let other = RpcChannel::new(client).unwrap();
        other.register::<Node, _>("identify", |_, _| {});
        other.send(
            "identify",
            &Node { name: "n2".to_string(), wg_conninfo: conn(key(2), "10.97.0.2/24", &["public"]) },
        )
        .unwrap();

        assert!(wait_for(|| n1.peer_names().contains(&"n2".to_string()), Duration::from_secs(2)));
        drop(other);

        assert!(wait_for(|| !n1.peer_names().contains(&"n2".to_string()), Duration::from_secs(2)));
        assert_eq!(*lost.lock(), Some("n2".to_string()));
    }
}
