//! The transport capability set consumed (not specified) by the core
//! (spec §1, §6): `Connect`, `SendMsg`, `Get`, `Put`, `Atomic`,
//! `NewMessage`, `GetRdmaPtr`, `RegisterRecvCallback`. This module
//! defines the `Transport` trait plus a single concrete
//! implementation — an in-process loopback used by op state machines
//! and integration tests in place of real RDMA hardware.
mod loopback;

pub use loopback::{LoopbackNetwork, LoopbackTransport};

use crate::error::Result;
use crate::ldo::DataObject;
use crate::node::NodeId;
use crate::wire::NetBufferRemote;

/// Completion events delivered to a transport op's callback (spec
/// §4.3's `args.type`: `send_success`, `send_error`, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportEvent {
    SendSuccess,
    SendError,
    PutSuccess,
    PutError,
    GetSuccess,
    GetError,
    AtomicSuccess,
    AtomicError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AtomicOp {
    FetchAdd,
    CompareAndSwap,
    Swap,
}

pub type CompletionCallback = Box<dyn FnOnce(TransportEvent) + Send>;

/// Invoked once per inbound message with the raw bytes (fixed header
/// + body), mirroring `RegisterRecvCallback`'s role as the engine's
/// single entry point for network events (spec §6).
pub type RecvCallback = Box<dyn Fn(Vec<u8>) + Send + Sync>;

/// The capability set the core requires from a transport. Every
/// method that causes network activity completes asynchronously via
/// `on_complete`, matching spec §5's "no op blocks on a mutex during
/// a suspension — all waits are event-driven".
pub trait Transport: Send + Sync {
    fn local_node(&self) -> NodeId;

    /// Establish (or reuse) a persistent connection to `node`.
    fn connect(&self, node: NodeId) -> Result<NodeId>;

    fn send_msg(&self, peer: NodeId, msg: DataObject, on_complete: CompletionCallback) -> Result<()>;

    fn get(
        &self,
        peer: NodeId,
        remote: NetBufferRemote,
        local: DataObject,
        on_complete: CompletionCallback,
    ) -> Result<()>;

    fn put(
        &self,
        peer: NodeId,
        local: DataObject,
        remote: NetBufferRemote,
        on_complete: CompletionCallback,
    ) -> Result<()>;

    #[allow(clippy::too_many_arguments)]
    fn atomic(
        &self,
        peer: NodeId,
        op: AtomicOp,
        local: DataObject,
        local_offset: u32,
        remote: NetBufferRemote,
        remote_offset: u32,
        size: u32,
        operand: u64,
        on_complete: CompletionCallback,
    ) -> Result<()>;

    /// Allocate an LDO sized for an outgoing message.
    fn new_message(&self, size: usize) -> Result<DataObject>;

    /// Register (pinning if not already pinned) and describe `ldo` as
    /// a remotely addressable buffer.
    fn get_rdma_ptr(&self, ldo: &DataObject) -> Result<NetBufferRemote>;

    /// Install the single callback invoked for every inbound message.
    fn register_recv_callback(&self, callback: RecvCallback) -> Result<()>;
}
