//! An in-process, channel-based stand-in for an RDMA-capable
//! transport (see SPEC_FULL.md, "In-process loopback transport").
//! Every node in a test lives in the same process, so `Get`/`Put`
//! are implemented by copying bytes directly between `DataObject`s
//! instead of touching real registered memory; the capability-set
//! shape (and its asynchronous, callback-driven completion) is
//! preserved exactly so op state machines are written against the
//! `Transport` trait, not this implementation.
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;

use byteorder::{ByteOrder, LittleEndian};

use super::{AtomicOp, CompletionCallback, RecvCallback, Transport, TransportEvent};
use crate::error::{ProtocolError, Result};
use crate::ldo::allocator::HeapAllocator;
use crate::ldo::DataObject;
use crate::node::NodeId;
use crate::wire::{NetBufferRemote, NBR_SIZE};

struct RdmaRegistry {
    next_cookie: AtomicU64,
    entries: Mutex<HashMap<u64, DataObject>>,
}

impl RdmaRegistry {
    fn new() -> Self {
        RdmaRegistry {
            next_cookie: AtomicU64::new(1),
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn register(&self, ldo: DataObject) -> u64 {
        let cookie = self.next_cookie.fetch_add(1, Ordering::Relaxed);
        self.entries.lock().unwrap().insert(cookie, ldo);
        cookie
    }

    fn lookup(&self, cookie: u64) -> Option<DataObject> {
        self.entries.lock().unwrap().get(&cookie).cloned()
    }
}

fn encode_nbr(node: NodeId, cookie: u64, size: u32) -> NetBufferRemote {
    let mut buf = [0u8; NBR_SIZE];
    LittleEndian::write_u64(&mut buf[0..8], node.id());
    LittleEndian::write_u64(&mut buf[8..16], cookie);
    LittleEndian::write_u32(&mut buf[16..20], size);
    NetBufferRemote(buf)
}

fn decode_nbr(nbr: &NetBufferRemote) -> (NodeId, u64, u32) {
    let buf = &nbr.0;
    (
        NodeId::from_raw(LittleEndian::read_u64(&buf[0..8])),
        LittleEndian::read_u64(&buf[8..16]),
        LittleEndian::read_u32(&buf[16..20]),
    )
}

/// The shared in-process fabric a set of `LoopbackTransport`s connect
/// through. Create one per test/process and `register` a transport
/// for each simulated `NodeID`.
#[derive(Clone)]
pub struct LoopbackNetwork {
    senders: Arc<Mutex<HashMap<NodeId, mpsc::Sender<Vec<u8>>>>>,
    rdma: Arc<RdmaRegistry>,
}

impl LoopbackNetwork {
    pub fn new() -> Self {
        LoopbackNetwork {
            senders: Arc::new(Mutex::new(HashMap::new())),
            rdma: Arc::new(RdmaRegistry::new()),
        }
    }

    /// Register `node` with this fabric and return its transport
    /// handle. Spawns the background thread that delivers inbound
    /// messages to whatever callback is later installed with
    /// `register_recv_callback`.
    pub fn register(&self, node: NodeId) -> LoopbackTransport {
        let (tx, rx) = mpsc::channel::<Vec<u8>>();
        self.senders.lock().unwrap().insert(node, tx);

        let recv_callback: Arc<Mutex<Option<RecvCallback>>> = Arc::new(Mutex::new(None));
        let callback_for_thread = recv_callback.clone();
        thread::spawn(move || {
            while let Ok(bytes) = rx.recv() {
                if let Some(cb) = callback_for_thread.lock().unwrap().as_ref() {
                    cb(bytes);
                }
            }
        });

        LoopbackTransport {
            local: node,
            senders: self.senders.clone(),
            rdma: self.rdma.clone(),
            recv_callback,
            allocator: Arc::new(HeapAllocator::new()),
        }
    }
}

impl Default for LoopbackNetwork {
    fn default() -> Self {
        Self::new()
    }
}

pub struct LoopbackTransport {
    local: NodeId,
    senders: Arc<Mutex<HashMap<NodeId, mpsc::Sender<Vec<u8>>>>>,
    rdma: Arc<RdmaRegistry>,
    recv_callback: Arc<Mutex<Option<RecvCallback>>>,
    allocator: Arc<dyn crate::ldo::allocator::Allocator>,
}

impl Transport for LoopbackTransport {
    fn local_node(&self) -> NodeId {
        self.local
    }

    fn connect(&self, node: NodeId) -> Result<NodeId> {
        if self.senders.lock().unwrap().contains_key(&node) {
            Ok(node)
        } else {
            Err(ProtocolError::InvalidArgument("peer node is not registered with this loopback network").into())
        }
    }

    fn send_msg(&self, peer: NodeId, msg: DataObject, on_complete: CompletionCallback) -> Result<()> {
        let sender = {
            let senders = self.senders.lock().unwrap();
            senders.get(&peer).cloned()
        };
        match sender {
            Some(sender) => {
                let bytes = msg.data().unwrap_or_default();
                match sender.send(bytes) {
                    Ok(()) => {
                        on_complete(TransportEvent::SendSuccess);
                        Ok(())
                    }
                    Err(_) => {
                        on_complete(TransportEvent::SendError);
                        Err(ProtocolError::TransportError.into())
                    }
                }
            }
            None => {
                on_complete(TransportEvent::SendError);
                Err(ProtocolError::InvalidArgument("unknown peer").into())
            }
        }
    }

    fn get(&self, _peer: NodeId, remote: NetBufferRemote, local: DataObject, on_complete: CompletionCallback) -> Result<()> {
        let (_owner, cookie, _size) = decode_nbr(&remote);
        match self.rdma.lookup(cookie) {
            Some(source) => {
                let meta = source.meta().unwrap_or_default();
                let data = source.data().unwrap_or_default();
                match local.overwrite_body(&meta, &data) {
                    Ok(()) => {
                        on_complete(TransportEvent::GetSuccess);
                        Ok(())
                    }
                    Err(e) => {
                        on_complete(TransportEvent::GetError);
                        Err(e)
                    }
                }
            }
            None => {
                on_complete(TransportEvent::GetError);
                Err(ProtocolError::InvalidArgument("unknown remote buffer descriptor").into())
            }
        }
    }

    fn put(&self, _peer: NodeId, local: DataObject, remote: NetBufferRemote, on_complete: CompletionCallback) -> Result<()> {
        let (_owner, cookie, _size) = decode_nbr(&remote);
        match self.rdma.lookup(cookie) {
            Some(target) => {
                let meta = local.meta().unwrap_or_default();
                let data = local.data().unwrap_or_default();
                match target.overwrite_body(&meta, &data) {
                    Ok(()) => {
                        on_complete(TransportEvent::PutSuccess);
                        Ok(())
                    }
                    Err(e) => {
                        on_complete(TransportEvent::PutError);
                        Err(e)
                    }
                }
            }
            None => {
                on_complete(TransportEvent::PutError);
                Err(ProtocolError::InvalidArgument("unknown remote buffer descriptor").into())
            }
        }
    }

    fn atomic(
        &self,
        _peer: NodeId,
        op: AtomicOp,
        local: DataObject,
        _local_offset: u32,
        remote: NetBufferRemote,
        remote_offset: u32,
        size: u32,
        operand: u64,
        on_complete: CompletionCallback,
    ) -> Result<()> {
        let (_owner, cookie, _nbr_size) = decode_nbr(&remote);
        let target = match self.rdma.lookup(cookie) {
            Some(t) => t,
            None => {
                on_complete(TransportEvent::AtomicError);
                return Err(ProtocolError::InvalidArgument("unknown remote buffer descriptor").into());
            }
        };
        if size != 8 {
            on_complete(TransportEvent::AtomicError);
            return Err(ProtocolError::InvalidArgument("loopback atomics only support 8-byte words").into());
        }
        let mut data = target.data().unwrap_or_default();
        let off = remote_offset as usize;
        if off + 8 > data.len() {
            on_complete(TransportEvent::AtomicError);
            return Err(ProtocolError::InvalidArgument("atomic offset out of range").into());
        }
        let current = LittleEndian::read_u64(&data[off..off + 8]);
        let new_value = match op {
            AtomicOp::FetchAdd => current.wrapping_add(operand),
            AtomicOp::Swap => operand,
            AtomicOp::CompareAndSwap => {
                let expected = local.data().unwrap_or_default();
                let expected = if expected.len() >= 8 { LittleEndian::read_u64(&expected[0..8]) } else { 0 };
                if current == expected {
                    operand
                } else {
                    current
                }
            }
        };
        LittleEndian::write_u64(&mut data[off..off + 8], new_value);
        let meta = target.meta().unwrap_or_default();
        target.overwrite_body(&meta, &data)?;
        on_complete(TransportEvent::AtomicSuccess);
        Ok(())
    }

    fn new_message(&self, size: usize) -> Result<DataObject> {
        DataObject::new(&[], &vec![0u8; size], self.allocator.clone(), 0)
    }

    fn get_rdma_ptr(&self, ldo: &DataObject) -> Result<NetBufferRemote> {
        let size = ldo.wire_size()? as u32;
        let cookie = self.rdma.register(ldo.clone());
        Ok(encode_nbr(self.local, cookie, size))
    }

    fn register_recv_callback(&self, callback: RecvCallback) -> Result<()> {
        *self.recv_callback.lock().unwrap() = Some(callback);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_rejects_unregistered_peer() {
        let net = LoopbackNetwork::new();
        let a = net.register(NodeId::from_raw(1));
        assert!(a.connect(NodeId::from_raw(99)).is_err());
    }

    #[test]
    fn send_msg_delivers_to_registered_recv_callback() {
        let net = LoopbackNetwork::new();
        let a = net.register(NodeId::from_raw(1));
        let b = net.register(NodeId::from_raw(2));

        let (tx, rx) = mpsc::channel::<Vec<u8>>();
        b.register_recv_callback(Box::new(move |bytes| {
            let _ = tx.send(bytes);
        }))
        .unwrap();

        let msg = DataObject::new(&[], b"hello", a.allocator.clone(), 0).unwrap();
        let (done_tx, done_rx) = mpsc::channel::<TransportEvent>();
        a.send_msg(NodeId::from_raw(2), msg, Box::new(move |ev| {
            let _ = done_tx.send(ev);
        }))
        .unwrap();

        assert_eq!(done_rx.recv().unwrap(), TransportEvent::SendSuccess);
        let received = rx.recv_timeout(std::time::Duration::from_secs(1)).unwrap();
        assert_eq!(received, b"hello");
    }

    #[test]
    fn get_copies_registered_buffer_into_local_ldo() {
        let net = LoopbackNetwork::new();
        let a = net.register(NodeId::from_raw(1));

        let remote_source = DataObject::new(b"m", b"remote payload", a.allocator.clone(), 0).unwrap();
        let nbr = a.get_rdma_ptr(&remote_source).unwrap();

        let landing = DataObject::with_capacity(64, b"", b"", a.allocator.clone(), 0).unwrap();
        let (tx, rx) = mpsc::channel::<TransportEvent>();
        a.get(NodeId::from_raw(1), nbr, landing.clone(), Box::new(move |ev| {
            let _ = tx.send(ev);
        }))
        .unwrap();

        assert_eq!(rx.recv().unwrap(), TransportEvent::GetSuccess);
        assert_eq!(landing.data().unwrap(), b"remote payload");
    }

    #[test]
    fn atomic_fetch_add_updates_remote_word() {
        let net = LoopbackNetwork::new();
        let a = net.register(NodeId::from_raw(1));

        let mut counter_bytes = vec![0u8; 8];
        LittleEndian::write_u64(&mut counter_bytes, 5);
        let counter = DataObject::new(&[], &counter_bytes, a.allocator.clone(), 0).unwrap();
        let nbr = a.get_rdma_ptr(&counter).unwrap();

        let operand_ldo = DataObject::new(&[], &[0u8; 8], a.allocator.clone(), 0).unwrap();
        let (tx, rx) = mpsc::channel::<TransportEvent>();
        a.atomic(
            NodeId::from_raw(1),
            AtomicOp::FetchAdd,
            operand_ldo,
            0,
            nbr,
            0,
            8,
            10,
            Box::new(move |ev| {
                let _ = tx.send(ev);
            }),
        )
        .unwrap();

        assert_eq!(rx.recv().unwrap(), TransportEvent::AtomicSuccess);
        let updated = counter.data().unwrap();
        assert_eq!(LittleEndian::read_u64(&updated[0..8]), 15);
    }
}
