//! Info / RowInfo (spec §4.5): a single request/single reply query
//! against an exact key (column info) or a row wildcard (row info).
//! Grounded in `original_source/src/kelpie/ops/direct/OpKelpieInfo.cpp`.
use std::sync::Arc;

use log::warn;

use crate::bucket::Bucket;
use crate::context::Context;
use crate::error::{rc, ProtocolError, Result};
use crate::key::Key;
use crate::node::NodeId;
use crate::object_info::ObjectInfo;
use crate::opengine::{Mailbox, Op, OpArgs, WaitingType};
use crate::wire::{Command, SimpleBody, StatusBody};

use super::{send_command, send_status, ResultCallback};

/// Launch the origin half for an exact-key column-info query.
pub fn spawn_col_info(
    ctx: &Arc<Context>,
    peer: NodeId,
    bucket: Bucket,
    key: Key,
    callback: ResultCallback<ObjectInfo>,
) -> Mailbox {
    spawn(ctx, peer, bucket, key, Command::GetColInfo, callback)
}

/// Launch the origin half for a row-wildcard row-info query.
pub fn spawn_row_info(
    ctx: &Arc<Context>,
    peer: NodeId,
    bucket: Bucket,
    key: Key,
    callback: ResultCallback<ObjectInfo>,
) -> Mailbox {
    spawn(ctx, peer, bucket, key, Command::GetRowInfo, callback)
}

fn spawn(
    ctx: &Arc<Context>,
    peer: NodeId,
    bucket: Bucket,
    key: Key,
    cmd: Command,
    callback: ResultCallback<ObjectInfo>,
) -> Mailbox {
    let op = Box::new(InfoOrigin {
        ctx: ctx.clone(),
        peer,
        bucket,
        key,
        cmd,
        mailbox: None,
        callback: Some(callback),
    });
    ctx.op_engine.spawn_origin(op).0
}

pub fn register_factory(ctx: &Arc<Context>) {
    register_one(ctx, Command::GetColInfo);
    register_one(ctx, Command::GetRowInfo);
}

fn register_one(ctx: &Arc<Context>, cmd: Command) {
    let captured = ctx.clone();
    ctx.op_engine.register_factory(cmd.op_id(), move |peer, origin_mailbox, body| {
        Box::new(InfoTarget {
            ctx: captured.clone(),
            peer,
            origin_mailbox,
            cmd,
            body,
            mailbox: None,
        }) as Box<dyn Op>
    });
}

struct InfoOrigin {
    ctx: Arc<Context>,
    peer: NodeId,
    bucket: Bucket,
    key: Key,
    cmd: Command,
    mailbox: Option<Mailbox>,
    callback: Option<ResultCallback<ObjectInfo>>,
}

impl InfoOrigin {
    fn fail(&mut self, err: crate::error::Error) -> WaitingType {
        if let Some(cb) = self.callback.take() {
            cb(Err(err));
        }
        WaitingType::Error
    }

    fn finish(&mut self, result: Result<ObjectInfo>) -> WaitingType {
        if let Some(cb) = self.callback.take() {
            cb(result);
        }
        WaitingType::DoneAndDestroy
    }
}

impl Op for InfoOrigin {
    fn update(&mut self, args: OpArgs) -> WaitingType {
        match args {
            OpArgs::Start(mailbox) => {
                self.mailbox = Some(mailbox);
                let body = SimpleBody {
                    meta_plus_data_size: 0,
                    bucket: self.bucket.id(),
                    iom_hash: 0,
                    behavior: 0,
                    key: self.key.clone(),
                    fn_name: Vec::new(),
                    fn_args: Vec::new(),
                };
                let bytes = match body.to_bytes() {
                    Ok(b) => b,
                    Err(e) => return self.fail(e),
                };
                match send_command(&self.ctx, self.peer, mailbox, self.cmd, &bytes, false) {
                    Ok(()) => WaitingType::WaitingOnCq,
                    Err(e) => self.fail(e),
                }
            }
            OpArgs::SendSuccess => WaitingType::WaitingOnCq,
            OpArgs::SendError => self.fail(ProtocolError::TransportError.into()),
            OpArgs::IncomingMessage { body, .. } => match StatusBody::from_bytes(&body) {
                Ok(status) => {
                    let result = if status.remote_rc == rc::OK {
                        let mut info = status.object_info;
                        info.col_availability = info.col_availability.rebase_to_remote();
                        Ok(info)
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

struct InfoTarget {
    ctx: Arc<Context>,
    peer: NodeId,
    origin_mailbox: u64,
    cmd: Command,
    body: Vec<u8>,
    mailbox: Option<Mailbox>,
}

impl InfoTarget {
    fn reply(&mut self, ack: bool, remote_rc: i32, info: ObjectInfo) -> WaitingType {
        let my_mailbox = self.mailbox.expect("start always precedes any reply");
        if let Err(e) =
            send_status(&self.ctx, self.peer, my_mailbox, self.origin_mailbox, self.cmd.op_id(), ack, remote_rc, info)
        {
            warn!("info target failed to send its status reply: {e}");
        }
        WaitingType::DoneAndDestroy
    }

    fn handle_start(&mut self) -> WaitingType {
        let parsed = match SimpleBody::from_bytes(&self.body) {
            Ok(p) => p,
            Err(_) => return self.reply(false, rc::EBADRPC, ObjectInfo::default()),
        };
        let bucket = Bucket::from_raw(parsed.bucket);
        match self.ctx.localkv.info(bucket, &parsed.key, self.ctx.default_iom.as_ref()) {
            Ok(info) => self.reply(true, rc::OK, info),
            Err(e) => self.reply(false, e.to_rc(), ObjectInfo::default()),
        }
    }
}

impl Op for InfoTarget {
    fn update(&mut self, args: OpArgs) -> WaitingType {
        match args {
            OpArgs::Start(mailbox) => {
                self.mailbox = Some(mailbox);
                self.handle_start()
            }
            _ => WaitingType::WaitingOnCq,
        }
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
    fn col_info_over_the_wire_reports_published_size() {
        let network = LoopbackNetwork::new();
        let origin_node = NodeId::from_raw(1);
        let target_node = NodeId::from_raw(2);
        let origin_ctx = build_ctx(&network, origin_node);
        let target_ctx = build_ctx(&network, target_node);
        let bucket = Bucket::new("b");
        let key = Key::with_column("row", "col");
        target_ctx.localkv.put(bucket, &key, heap_ldo(b"hello"), BehaviorFlags::DEFAULT_LOCAL, None).unwrap();

        let (tx, rx) = mpsc::channel();
        spawn_col_info(&origin_ctx, target_node, bucket, key, Box::new(move |result| tx.send(result).unwrap()));
        let info = rx.recv_timeout(std::time::Duration::from_secs(5)).unwrap().unwrap();
        assert_eq!(info.col_user_bytes, 5);
        assert_eq!(info.row_num_columns, 1);
    }

    #[test]
    fn col_info_on_a_missing_key_fails() {
        let network = LoopbackNetwork::new();
        let origin_node = NodeId::from_raw(1);
        let target_node = NodeId::from_raw(2);
        let origin_ctx = build_ctx(&network, origin_node);
        let _target_ctx = build_ctx(&network, target_node);
        let bucket = Bucket::new("b");

        let (tx, rx) = mpsc::channel();
        spawn_col_info(&origin_ctx, target_node, bucket, Key::new("missing"), Box::new(move |result| tx.send(result).unwrap()));
        let err = rx.recv_timeout(std::time::Duration::from_secs(5)).unwrap().unwrap_err();
        assert_eq!(err.to_rc(), rc::ENOENT);
    }

    #[test]
    fn row_info_over_the_wire_aggregates_every_row() {
        let network = LoopbackNetwork::new();
        let origin_node = NodeId::from_raw(1);
        let target_node = NodeId::from_raw(2);
        let origin_ctx = build_ctx(&network, origin_node);
        let target_ctx = build_ctx(&network, target_node);
        let bucket = Bucket::new("b");
        target_ctx.localkv.put(bucket, &Key::new("row1"), heap_ldo(b"x"), BehaviorFlags::DEFAULT_LOCAL, None).unwrap();
        target_ctx.localkv.put(bucket, &Key::new("row2"), heap_ldo(b"yy"), BehaviorFlags::DEFAULT_LOCAL, None).unwrap();

        let (tx, rx) = mpsc::channel();
        spawn_row_info(&origin_ctx, target_node, bucket, Key::new("row*"), Box::new(move |result| tx.send(result).unwrap()));
        let info = rx.recv_timeout(std::time::Duration::from_secs(5)).unwrap().unwrap();
        assert_eq!(info.row_num_columns, 2);
        assert_eq!(info.row_user_bytes, 3);
    }
}
