//! Wire-level data model: what a node gossips about itself and its peers.

use std::collections::HashMap;
use std::net::IpAddr;

use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use wireguard_control::Key;

/// An externally observed `ip:port` a node has been seen at on one transport network.
/// `ConnectionInfo::endpoints` keys these by network label, not by the observing peer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub ip: IpAddr,
    pub port: u16,
}

impl Endpoint {
    pub fn new(ip: IpAddr, port: u16) -> Self {
        Self { ip, port }
    }
}

/// (De)serializes a `wireguard_control::Key` as the base64 text the `wg` CLI uses,
/// rather than as a raw byte array.
mod key_base64 {
    use serde::{de::Error as _, Deserialize, Deserializer, Serializer};
    use wireguard_control::Key;

    pub fn serialize<S>(key: &Key, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&key.to_base64())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Key, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Key::from_base64(&s).map_err(D::Error::custom)
    }
}

/// Everything a node needs to publish about itself for peers to dial and configure it:
/// its public key, its address on the overlay, the networks it participates in, and any
/// endpoints peers have observed it at.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    #[serde(rename = "pubkey", with = "key_base64")]
    pub public_key: Key,
    pub cidr: IpNet,
    pub networks: Vec<String>,
    #[serde(default)]
    pub endpoints: HashMap<String, Endpoint>,
}

/// A named participant in the mesh, as gossiped between nodes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub name: String,
    pub wg_conninfo: ConnectionInfo,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_key() -> Key {
        Key::from_base64("4CNZorWVtohO64n6AAaH/JyFjIIgBFrfJK2SGtKjzEE=").unwrap()
    }

    #[test]
    fn connection_info_round_trips_through_json() {
        let mut endpoints = HashMap::new();
        endpoints.insert("public".to_string(), Endpoint::new("1.2.3.4".parse().unwrap(), 51820));

        let info = ConnectionInfo {
            public_key: sample_key(),
            cidr: "10.42.0.1/16".parse().unwrap(),
            networks: vec!["10.42.0.0/16".to_string()],
            endpoints,
        };

        let encoded = serde_json::to_string(&info).unwrap();
        let decoded: ConnectionInfo = serde_json::from_str(&encoded).unwrap();
        assert_eq!(info, decoded);
    }

    #[test]
    fn connection_info_serializes_pubkey_as_base64_field() {
        let info = ConnectionInfo {
            public_key: sample_key(),
            cidr: "10.42.0.1/16".parse().unwrap(),
            networks: vec![],
            endpoints: HashMap::new(),
        };

        let value: serde_json::Value = serde_json::to_value(&info).unwrap();
        assert_eq!(
            value.get("pubkey").and_then(|v| v.as_str()),
            Some("4CNZorWVtohO64n6AAaH/JyFjIIgBFrfJK2SGtKjzEE=")
        );
    }

    #[test]
    fn endpoints_default_to_empty_when_absent() {
        let json = r#"{"pubkey":"4CNZorWVtohO64n6AAaH/JyFjIIgBFrfJK2SGtKjzEE=","cidr":"10.42.0.1/16","networks":[]}"#;
        let info: ConnectionInfo = serde_json::from_str(json).unwrap();
        assert!(info.endpoints.is_empty());
    }

    #[test]
    fn node_round_trips_through_json() {
        let node = Node {
            name: "alice".to_string(),
            wg_conninfo: ConnectionInfo {
                public_key: sample_key(),
                cidr: "10.42.0.1/16".parse().unwrap(),
                networks: vec!["10.42.0.0/16".to_string()],
                endpoints: HashMap::new(),
            },
        };

        let encoded = serde_json::to_string(&node).unwrap();
        let decoded: Node = serde_json::from_str(&encoded).unwrap();
        assert_eq!(node, decoded);
    }
}
