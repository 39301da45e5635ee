//! Owns one WireGuard kernel interface and reconciles per-peer configuration against
//! gossiped `ConnectionInfo`. Kernel WG is the source of truth for the data plane; this
//! is a thin, idempotent reconciler — all overlay-topology decisions live above it.

use std::net::SocketAddr;

use ipnet::IpNet;
use wireguard_control::{Backend, Device, DeviceUpdate, InterfaceName, Key, PeerConfigBuilder};

use crate::error::{Error, Result};
use crate::types::ConnectionInfo;

const PERSISTENT_KEEPALIVE_SECS: u16 = 15;

/// Everything the node manager needs from the WireGuard layer, abstracted so the
/// discovery protocol (C4) can be unit tested without a real WireGuard-capable kernel
/// or `CAP_NET_ADMIN`.
pub trait WireGuardReconciler: Send + Sync {
    fn public_key(&self) -> &Key;

    /// Creates or replaces the kernel peer entry for `conn.public_key`.
    fn update_peer(&self, conn: &ConnectionInfo) -> Result<()>;

    /// The endpoint the kernel currently has on file for `public_key`, if any.
    fn peer_endpoint(&self, public_key: &Key) -> Option<SocketAddr>;

    /// The first network label in the local `networks` list that also appears in
    /// `peer_networks`, or `None` if the two share nothing.
    fn find_common_network(&self, peer_networks: &[String]) -> Option<String>;
}

/// A `WireGuardReconciler` backed by a real kernel WireGuard interface.
pub struct WireGuardController {
    iface: InterfaceName,
    backend: Backend,
    networks: Vec<String>,
    public_key: Key,
}

impl WireGuardController {
    /// Adopts `ifname` if it already exists, leaving its configuration untouched;
    /// otherwise creates a WireGuard-kind interface, assigns the `/16` supernet of
    /// `overlay_cidr`, brings it up, and applies `private_key`/`listen_port`.
    pub fn new(
        overlay_cidr: IpNet,
        networks: Vec<String>,
        private_key: Key,
        ifname: InterfaceName,
        listen_port: u16,
        backend: Backend,
    ) -> Result<Self> {
        if Device::get(&ifname, backend).is_err() {
            Self::create_interface(&ifname, overlay_cidr, &private_key, listen_port, backend)?;
        }

        let device = Device::get(&ifname, backend)?;
        let public_key = device
            .public_key
            .unwrap_or_else(|| private_key.get_public());

        Ok(Self { iface: ifname, backend, networks, public_key })
    }

    #[cfg(target_os = "linux")]
    fn create_interface(
        ifname: &InterfaceName,
        overlay_cidr: IpNet,
        private_key: &Key,
        listen_port: u16,
        backend: Backend,
    ) -> Result<()> {
        let supernet = IpNet::new(overlay_cidr.addr(), 16).unwrap_or(overlay_cidr);

        DeviceUpdate::new()
            .set_private_key(private_key.clone())
            .set_listen_port(listen_port)
            .apply(ifname, backend)?;

        crate::netlink::set_address(ifname, supernet)?;
        crate::netlink::set_link_up(ifname)?;
        Ok(())
    }

    #[cfg(not(target_os = "linux"))]
    fn create_interface(
        _ifname: &InterfaceName,
        _overlay_cidr: IpNet,
        _private_key: &Key,
        _listen_port: u16,
        _backend: Backend,
    ) -> Result<()> {
        Err(Error::Io(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "interface creation is only implemented on linux",
        )))
    }

    fn device(&self) -> Result<Device> {
        Ok(Device::get(&self.iface, self.backend)?)
    }
}

impl WireGuardReconciler for WireGuardController {
    fn public_key(&self) -> &Key {
        &self.public_key
    }

    fn update_peer(&self, conn: &ConnectionInfo) -> Result<()> {
        let shared = self
            .find_common_network(&conn.networks)
            .ok_or(Error::NoCommonNetwork)?;

        let mut builder = PeerConfigBuilder::new(&conn.public_key)
            .replace_allowed_ips()
            .add_allowed_ip(conn.cidr.addr(), conn.cidr.prefix_len())
            .set_persistent_keepalive_interval(PERSISTENT_KEEPALIVE_SECS);

        if let Some(endpoint) = conn.endpoints.get(&shared) {
            builder = builder.set_endpoint(SocketAddr::new(endpoint.ip, endpoint.port));
        }

        DeviceUpdate::new().add_peer(builder).apply(&self.iface, self.backend)?;
        Ok(())
    }

    fn peer_endpoint(&self, public_key: &Key) -> Option<SocketAddr> {
        self.device()
            .ok()?
            .peers
            .into_iter()
            .find(|peer| &peer.config.public_key == public_key)
            .and_then(|peer| peer.config.endpoint)
    }

    fn find_common_network(&self, peer_networks: &[String]) -> Option<String> {
        self.networks
            .iter()
            .find(|label| peer_networks.contains(label))
            .cloned()
    }
}

#[cfg(test)]
pub mod fake {
    //! An in-memory `WireGuardReconciler` for exercising the discovery protocol
    //! without a real kernel interface.

    use std::collections::HashMap;
    use std::net::SocketAddr;

    use parking_lot::Mutex;
    use wireguard_control::Key;

    use super::WireGuardReconciler;
    use crate::error::{Error, Result};
    use crate::types::ConnectionInfo;

    pub struct FakePeer {
        pub allowed_ips: Vec<wireguard_control::AllowedIp>,
        pub persistent_keepalive: u16,
        pub endpoint: Option<SocketAddr>,
    }

    pub struct FakeWireGuard {
        public_key: Key,
        networks: Vec<String>,
        peers: Mutex<HashMap<Key, FakePeer>>,
    }

    impl FakeWireGuard {
        pub fn new(public_key: Key, networks: Vec<String>) -> Self {
            Self { public_key, networks, peers: Mutex::new(HashMap::new()) }
        }

        pub fn peer(&self, key: &Key) -> Option<parking_lot::MappedMutexGuard<'_, FakePeer>> {
            parking_lot::MutexGuard::try_map(self.peers.lock(), |peers| peers.get_mut(key)).ok()
        }
    }

    impl WireGuardReconciler for FakeWireGuard {
        fn public_key(&self) -> &Key {
            &self.public_key
        }

        fn update_peer(&self, conn: &ConnectionInfo) -> Result<()> {
            let shared = self
                .find_common_network(&conn.networks)
                .ok_or(Error::NoCommonNetwork)?;

            let endpoint = conn
                .endpoints
                .get(&shared)
                .map(|e| SocketAddr::new(e.ip, e.port));

            self.peers.lock().insert(
                conn.public_key.clone(),
                FakePeer {
                    allowed_ips: vec![wireguard_control::AllowedIp {
                        address: conn.cidr.addr(),
                        cidr: conn.cidr.prefix_len(),
                    }],
                    persistent_keepalive: super::PERSISTENT_KEEPALIVE_SECS,
                    endpoint,
                },
            );
            Ok(())
        }

        fn peer_endpoint(&self, public_key: &Key) -> Option<SocketAddr> {
            self.peers.lock().get(public_key)?.endpoint
        }

        fn find_common_network(&self, peer_networks: &[String]) -> Option<String> {
            self.networks.iter().find(|label| peer_networks.contains(label)).cloned()
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::fake::FakeWireGuard;
    use super::*;
    use crate::types::Endpoint;

    fn key(byte: u8) -> Key {
        Key([byte; 32])
    }

    fn conn(public_key: Key, cidr: &str, networks: Vec<&str>) -> ConnectionInfo {
        ConnectionInfo {
            public_key,
            cidr: cidr.parse().unwrap(),
            networks: networks.into_iter().map(String::from).collect(),
            endpoints: HashMap::new(),
        }
    }

    #[test]
    fn update_peer_sets_allowed_ips_and_keepalive() {
        let wg = FakeWireGuard::new(key(1), vec!["public".to_string()]);
        let peer_conn = conn(key(2), "10.97.0.2/24", vec!["public"]);

        wg.update_peer(&peer_conn).unwrap();

        let peer = wg.peer(&key(2)).unwrap();
        assert_eq!(peer.persistent_keepalive, 15);
        assert_eq!(peer.allowed_ips[0].address.to_string(), "10.97.0.2");
        assert_eq!(peer.allowed_ips[0].cidr, 24);
    }

    #[test]
    fn update_peer_sets_endpoint_from_shared_network() {
        let wg = FakeWireGuard::new(key(1), vec!["public".to_string()]);
        let mut peer_conn = conn(key(2), "10.97.0.2/24", vec!["public"]);
        peer_conn
            .endpoints
            .insert("public".to_string(), Endpoint::new("203.0.113.5".parse().unwrap(), 51820));

        wg.update_peer(&peer_conn).unwrap();

        let endpoint = wg.peer_endpoint(&key(2)).unwrap();
        assert_eq!(endpoint.to_string(), "203.0.113.5:51820");
    }

    #[test]
    fn update_peer_fails_without_common_network() {
        let wg = FakeWireGuard::new(key(1), vec!["public".to_string()]);
        let peer_conn = conn(key(2), "10.97.0.2/24", vec!["lan-a"]);

        assert!(matches!(wg.update_peer(&peer_conn), Err(Error::NoCommonNetwork)));
    }

    #[test]
    fn find_common_network_prefers_local_order() {
        let wg = FakeWireGuard::new(key(1), vec!["lan".to_string(), "public".to_string()]);
        let found = wg.find_common_network(&["public".to_string(), "lan".to_string()]);
        assert_eq!(found, Some("lan".to_string()));
    }

    #[test]
    fn find_common_network_returns_none_when_disjoint() {
        let wg = FakeWireGuard::new(key(1), vec!["lan".to_string()]);
        assert_eq!(wg.find_common_network(&["public".to_string()]), None);
    }
}
