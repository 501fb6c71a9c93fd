//! Drop (spec §4.5): remove a key, or every key matching a row
//! wildcard, on one target. A caller that supplies no callback gets a
//! fire-and-forget send with no reply tracked at all. Grounded in
//! `original_source/src/kelpie/ops/direct/OpKelpieDrop.cpp`.
use std::sync::Arc;

use log::warn;

use crate::bucket::Bucket;
use crate::context::Context;
use crate::error::{rc, ProtocolError, Result};
use crate::key::Key;
use crate::node::NodeId;
use crate::opengine::{Mailbox, Op, OpArgs, WaitingType};
use crate::wire::{Command, SimpleBody, UserFlags};

use super::{send_command, send_status, ResultCallback};

/// Launch the origin half against a single `peer`, waiting for a
/// reply reporting how many cells it removed.
pub fn spawn(
    ctx: &Arc<Context>,
    peer: NodeId,
    bucket: Bucket,
    key_pattern: Key,
    callback: ResultCallback<usize>,
) -> Mailbox {
    let op = Box::new(DropOrigin {
        ctx: ctx.clone(),
        peer,
        bucket,
        key_pattern,
        mailbox: None,
        callback: Some(callback),
    });
    ctx.op_engine.spawn_origin(op).0
}

/// Send the command and forget it: no mailbox is registered, so any
/// reply the target sends back is silently dropped by the engine (logged
/// at `warn`, nothing more) instead of routed anywhere.
pub fn spawn_fire_and_forget(ctx: &Arc<Context>, peer: NodeId, bucket: Bucket, key_pattern: Key) -> Result<()> {
    let body = SimpleBody {
        meta_plus_data_size: 0,
        bucket: bucket.id(),
        iom_hash: 0,
        behavior: 0,
        key: key_pattern,
        fn_name: Vec::new(),
        fn_args: Vec::new(),
    }
    .to_bytes()?;
    let header = crate::wire::MessageHeader {
        src: ctx.local_node,
        dst: peer,
        src_mailbox: 0,
        dst_mailbox: 0,
        op_id: Command::Drop.op_id(),
        user_flags: UserFlags::for_command(Command::Drop),
        body_len: body.len() as u32,
    };
    let framed = ctx.frame(&header, &body);
    let msg = ctx.transport.new_message(framed.len())?;
    msg.overwrite_body(&[], &framed)?;
    ctx.transport.send_msg(peer, msg, Box::new(|_event| {}))
}

pub fn register_factory(ctx: &Arc<Context>) {
    let captured = ctx.clone();
    ctx.op_engine.register_factory(Command::Drop.op_id(), move |peer, origin_mailbox, body| {
        Box::new(DropTarget {
            ctx: captured.clone(),
            peer,
            origin_mailbox,
            body,
            mailbox: None,
        }) as Box<dyn Op>
    });
}

struct DropOrigin {
    ctx: Arc<Context>,
    peer: NodeId,
    bucket: Bucket,
    key_pattern: Key,
    mailbox: Option<Mailbox>,
    callback: Option<ResultCallback<usize>>,
}

impl DropOrigin {
    fn fail(&mut self, err: crate::error::Error) -> WaitingType {
        if let Some(cb) = self.callback.take() {
            cb(Err(err));
        }
        WaitingType::Error
    }

    fn finish(&mut self, result: Result<usize>) -> WaitingType {
        if let Some(cb) = self.callback.take() {
            cb(result);
        }
        WaitingType::DoneAndDestroy
    }
}

impl Op for DropOrigin {
    fn update(&mut self, args: OpArgs) -> WaitingType {
        match args {
            OpArgs::Start(mailbox) => {
                self.mailbox = Some(mailbox);
                let body = SimpleBody {
                    meta_plus_data_size: 0,
                    bucket: self.bucket.id(),
                    iom_hash: 0,
                    behavior: 0,
                    key: self.key_pattern.clone(),
                    fn_name: Vec::new(),
                    fn_args: Vec::new(),
                };
                let bytes = match body.to_bytes() {
                    Ok(b) => b,
                    Err(e) => return self.fail(e),
                };
                match send_command(&self.ctx, self.peer, mailbox, Command::Drop, &bytes, false) {
                    Ok(()) => WaitingType::WaitingOnCq,
                    Err(e) => self.fail(e),
                }
            }
            OpArgs::SendSuccess => WaitingType::WaitingOnCq,
            OpArgs::SendError => self.fail(ProtocolError::TransportError.into()),
            OpArgs::IncomingMessage { body, .. } => match crate::wire::StatusBody::from_bytes(&body) {
                Ok(status) => {
                    let result = if status.remote_rc == rc::OK {
                        Ok(status.object_info.row_num_columns as usize)
                    } else {
                        Err(ProtocolError::Remote(status.remote_rc).into())
                    };
                    self.finish(result)
                }
                Err(e) => self.fail(e),
            },
            _ => WaitingType::WaitingOnCq,
        }
    }
}

struct DropTarget {
    ctx: Arc<Context>,
    peer: NodeId,
    origin_mailbox: u64,
    body: Vec<u8>,
    mailbox: Option<Mailbox>,
}

impl Op for DropTarget {
    fn update(&mut self, args: OpArgs) -> WaitingType {
        match args {
            OpArgs::Start(mailbox) => {
                self.mailbox = Some(mailbox);
                let parsed = match SimpleBody::from_bytes(&self.body) {
                    Ok(p) => p,
                    Err(_) => return self.reply(false, rc::EBADRPC, 0),
                };
                let bucket = Bucket::from_raw(parsed.bucket);
                match self.ctx.localkv.drop(bucket, &parsed.key) {
                    Ok(removed) => self.reply(true, rc::OK, removed),
                    Err(e) => self.reply(false, e.to_rc(), 0),
                }
            }
            _ => WaitingType::WaitingOnCq,
        }
    }
}

impl DropTarget {
    /// `removed` rides in `object_info.row_num_columns` — Drop has no
    /// richer report to make, and that field already means "how many
    /// columns this reply concerns" for every other status reply.
    fn reply(&mut self, ack: bool, remote_rc: i32, removed: usize) -> WaitingType {
        let my_mailbox = self.mailbox.expect("start always precedes any reply");
        let info = crate::object_info::ObjectInfo {
            row_num_columns: removed as u32,
            ..Default::default()
        };
        if let Err(e) =
            send_status(&self.ctx, self.peer, my_mailbox, self.origin_mailbox, Command::Drop.op_id(), ack, remote_rc, info)
        {
            warn!("drop target failed to send its status reply: {e}");
        }
        WaitingType::DoneAndDestroy
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iom::IomRegistry;
    use crate::ldo::allocator::HeapAllocator;
    use crate::ldo::DataObject;
    use crate::localkv::LocalKv;
    use crate::opengine::OpEngine;
    use crate::pool::behavior::BehaviorFlags;
    use crate::transport::LoopbackNetwork;
    use crate::worker::{Backburner, Wakeup};
    use std::sync::mpsc;

    fn build_ctx(network: &LoopbackNetwork, node: NodeId) -> Arc<Context> {
        let transport = Arc::new(network.register(node));
        let worker = Backburner::new(2, Wakeup::SleepMs(1));
        let engine = Arc::new(OpEngine::new());
        let localkv = Arc::new(LocalKv::new(worker.clone(), engine.clone()));
        let ioms = Arc::new(IomRegistry::new());
        let ctx = Context::new(transport, engine, localkv, worker, ioms, None);
        crate::ops::register_all_target_factories(&ctx);
        ctx
    }

    fn heap_ldo(bytes: &[u8]) -> DataObject {
        DataObject::new(b"", bytes, Arc::new(HeapAllocator::new()), 0).unwrap()
    }

    #[test]
    fn drop_over_the_wire_removes_the_exact_key() {
        let network = LoopbackNetwork::new();
        let origin_node = NodeId::from_raw(1);
        let target_node = NodeId::from_raw(2);
        let origin_ctx = build_ctx(&network, origin_node);
        let target_ctx = build_ctx(&network, target_node);
        let bucket = Bucket::new("b");
        let key = Key::new("gone");
        target_ctx.localkv.put(bucket, &key, heap_ldo(b"x"), BehaviorFlags::DEFAULT_LOCAL, None).unwrap();

        let (tx, rx) = mpsc::channel();
        spawn(&origin_ctx, target_node, bucket, key.clone(), Box::new(move |result| tx.send(result).unwrap()));
        let removed = rx.recv_timeout(std::time::Duration::from_secs(5)).unwrap().unwrap();
        assert_eq!(removed, 1);
        assert!(target_ctx.localkv.get(bucket, &key, None).is_err());
    }

    #[test]
    fn drop_over_the_wire_on_a_missing_key_removes_nothing() {
        let network = LoopbackNetwork::new();
        let origin_node = NodeId::from_raw(1);
        let target_node = NodeId::from_raw(2);
        let origin_ctx = build_ctx(&network, origin_node);
        let _target_ctx = build_ctx(&network, target_node);
        let bucket = Bucket::new("b");

        let (tx, rx) = mpsc::channel();
        spawn(&origin_ctx, target_node, bucket, Key::new("missing"), Box::new(move |result| tx.send(result).unwrap()));
        let removed = rx.recv_timeout(std::time::Duration::from_secs(5)).unwrap().unwrap();
        assert_eq!(removed, 0);
    }

    #[test]
    fn drop_row_wildcard_removes_every_matching_row() {
        let network = LoopbackNetwork::new();
        let origin_node = NodeId::from_raw(1);
        let target_node = NodeId::from_raw(2);
        let origin_ctx = build_ctx(&network, origin_node);
        let target_ctx = build_ctx(&network, target_node);
        let bucket = Bucket::new("b");
        target_ctx.localkv.put(bucket, &Key::new("row1"), heap_ldo(b"a"), BehaviorFlags::DEFAULT_LOCAL, None).unwrap();
        target_ctx.localkv.put(bucket, &Key::new("row2"), heap_ldo(b"b"), BehaviorFlags::DEFAULT_LOCAL, None).unwrap();

        let (tx, rx) = mpsc::channel();
        spawn(&origin_ctx, target_node, bucket, Key::new("row*"), Box::new(move |result| tx.send(result).unwrap()));
        let removed = rx.recv_timeout(std::time::Duration::from_secs(5)).unwrap().unwrap();
        assert_eq!(removed, 2);
    }
}
