//! `NodeId`: a transport-agnostic 64-bit value naming a node (spec §3).
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u64);

impl NodeId {
    /// "not set"
    pub const UNSPECIFIED: NodeId = NodeId(0);
    /// "this process"
    pub const LOCALHOST: NodeId = NodeId(u64::MAX);

    pub fn from_raw(id: u64) -> Self {
        NodeId(id)
    }

    pub fn id(&self) -> u64 {
        self.0
    }

    pub fn is_unspecified(&self) -> bool {
        *self == NodeId::UNSPECIFIED
    }
}

impl Default for NodeId {
    fn default() -> Self {
        NodeId::UNSPECIFIED
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            NodeId::UNSPECIFIED => f.write_str("node:unspecified"),
            NodeId::LOCALHOST => f.write_str("node:localhost"),
            NodeId(id) => write!(f, "node:0x{:016x}", id),
        }
    }
}

impl From<u64> for NodeId {
    fn from(id: u64) -> Self {
        NodeId(id)
    }
}
