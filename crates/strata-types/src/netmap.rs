use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use crate::{Epoch, SubnetId};

/// Length in bytes of a container identifier.
pub const CONTAINER_ID_LEN: usize = 32;

/// Attribute key prefix marking subnet membership (`__NEOFS__SUBNET_<id>`).
const SUBNET_ATTR_PREFIX: &str = "__NEOFS__SUBNET_";

/// Lifecycle state a node announced for the epoch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeState {
    #[default]
    Unspecified,
    Online,
    Offline,
}

/// A single `key = value` attribute announced by a node.
///
/// `parents` lists the keys this attribute is derived from (e.g. `City`
/// under `Country`). It is carried for collaborators and not consulted
/// during evaluation.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Attribute {
    pub key: String,
    pub value: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parents: Vec<String>,
}

impl Attribute {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Attribute { key: key.into(), value: value.into(), parents: Vec::new() }
    }
}

/// Storage node as registered in the network map for an epoch.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct NodeInfo {
    #[serde(with = "hex_bytes")]
    pub public_key: Vec<u8>,
    #[serde(default)]
    pub addresses: Vec<String>,
    #[serde(default)]
    pub attributes: Vec<Attribute>,
    #[serde(default)]
    pub state: NodeState,
}

impl NodeInfo {
    pub fn new(public_key: impl Into<Vec<u8>>, state: NodeState) -> Self {
        NodeInfo {
            public_key: public_key.into(),
            addresses: Vec::new(),
            attributes: Vec::new(),
            state,
        }
    }

    /// Builder-style helper used heavily by tests and fixtures.
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.push(Attribute::new(key, value));
        self
    }

    pub fn with_address(mut self, addr: impl Into<String>) -> Self {
        self.addresses.push(addr.into());
        self
    }

    /// Value of the attribute `key`, if the node announced it.
    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|a| a.key == key)
            .map(|a| a.value.as_str())
    }

    pub fn is_online(&self) -> bool {
        self.state == NodeState::Online
    }

    /// A node takes part in placement only when its attribute keys are
    /// unique and none of its values is empty.
    pub fn is_valid(&self) -> bool {
        let mut seen = HashSet::with_capacity(self.attributes.len());
        self.attributes
            .iter()
            .all(|a| !a.value.is_empty() && seen.insert(a.key.as_str()))
    }

    /// Subnet membership.
    ///
    /// * subnet `0`: member unless `__NEOFS__SUBNET_0` is `False`.
    /// * subnet `n > 0`: member only if `__NEOFS__SUBNET_n` is `True`.
    pub fn in_subnet(&self, subnet: SubnetId) -> bool {
        let key = format!("{SUBNET_ATTR_PREFIX}{subnet}");
        match self.attribute(&key) {
            Some(v) if v.eq_ignore_ascii_case("true") => true,
            Some(v) if v.eq_ignore_ascii_case("false") => false,
            _ => subnet == 0,
        }
    }
}

/// Read-only snapshot of every node known for an epoch.
///
/// The node list is private so a snapshot cannot be mutated once built;
/// share it across evaluations behind an `Arc`.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct NetworkMap {
    #[serde(default)]
    epoch: Epoch,
    nodes: Vec<NodeInfo>,
}

impl NetworkMap {
    pub fn new(epoch: Epoch, nodes: Vec<NodeInfo>) -> Self {
        NetworkMap { epoch, nodes }
    }

    pub fn epoch(&self) -> Epoch {
        self.epoch
    }

    pub fn nodes(&self) -> &[NodeInfo] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// Fixed-length container identifier; seeds the hash-distance ranking.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContainerId([u8; CONTAINER_ID_LEN]);

impl ContainerId {
    pub const fn from_bytes(bytes: [u8; CONTAINER_ID_LEN]) -> Self {
        ContainerId(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; CONTAINER_ID_LEN] {
        &self.0
    }
}

impl fmt::Debug for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContainerId({})", hex::encode(self.0))
    }
}

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl FromStr for ContainerId {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0u8; CONTAINER_ID_LEN];
        hex::decode_to_slice(s.trim(), &mut bytes)?;
        Ok(ContainerId(bytes))
    }
}

impl serde::Serialize for ContainerId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(self.0))
    }
}

impl<'de> serde::Deserialize<'de> for ContainerId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = <String as serde::Deserialize>::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Public keys travel as hex strings in JSON.
mod hex_bytes {
    pub fn serialize<S: serde::Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: serde::Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = <String as serde::Deserialize>::deserialize(deserializer)?;
        hex::decode(s).map_err(serde::de::Error::custom)
    }
}
