//! Publish (spec §4.5): origin pushes an LDO to a target over RDMA.
//! Grounded in `original_source/src/kelpie/ops/direct/OpKelpiePublish.cpp`.
use std::sync::Arc;

use log::warn;

use crate::bucket::Bucket;
use crate::context::Context;
use crate::error::{rc, ProtocolError, Result};
use crate::key::Key;
use crate::ldo::DataObject;
use crate::node::NodeId;
use crate::object_info::ObjectInfo;
use crate::opengine::{Mailbox, Op, OpArgs, WaitingType};
use crate::pool::behavior::BehaviorFlags;
use crate::wire::{BufferBody, Command, StatusBody};

use super::{get_rdma, send_command, send_status, ResultCallback};

/// Launch the origin half: push `ldo` to `peer`, under `key`, honoring
/// `behavior` (already rebased into the remote's frame by the caller).
#[allow(clippy::too_many_arguments)]
pub fn spawn(
    ctx: &Arc<Context>,
    peer: NodeId,
    bucket: Bucket,
    key: Key,
    ldo: DataObject,
    behavior: BehaviorFlags,
    iom_hash: u32,
    callback: ResultCallback<ObjectInfo>,
) -> Mailbox {
    let op = Box::new(PublishOrigin {
        ctx: ctx.clone(),
        peer,
        bucket,
        key,
        ldo,
        behavior,
        iom_hash,
        mailbox: None,
        callback: Some(callback),
    });
    ctx.op_engine.spawn_origin(op).0
}

pub fn register_factory(ctx: &Arc<Context>) {
    let captured = ctx.clone();
    ctx.op_engine.register_factory(Command::Publish.op_id(), move |peer, origin_mailbox, body| {
        Box::new(PublishTarget {
            ctx: captured.clone(),
            peer,
            origin_mailbox,
            body,
            mailbox: None,
            parsed: None,
            landing: None,
        }) as Box<dyn Op>
    });
}

struct PublishOrigin {
    ctx: Arc<Context>,
    peer: NodeId,
    bucket: Bucket,
    key: Key,
    ldo: DataObject,
    behavior: BehaviorFlags,
    iom_hash: u32,
    mailbox: Option<Mailbox>,
    callback: Option<ResultCallback<ObjectInfo>>,
}

impl PublishOrigin {
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

impl Op for PublishOrigin {
    fn update(&mut self, args: OpArgs) -> WaitingType {
        match args {
            OpArgs::Start(mailbox) => {
                self.mailbox = Some(mailbox);
                let nbr = match self.ctx.transport.get_rdma_ptr(&self.ldo) {
                    Ok(nbr) => nbr,
                    Err(e) => return self.fail(e),
                };
                let meta_plus_data_size = match self.ldo.header() {
                    Ok(h) => h.meta_plus_data() as u64,
                    Err(e) => return self.fail(e),
                };
                let body = BufferBody {
                    nbr,
                    meta_plus_data_size,
                    bucket: self.bucket.id(),
                    iom_hash: self.iom_hash,
                    behavior: self.behavior.bits(),
                    key: self.key.clone(),
                };
                let bytes = match body.to_bytes() {
                    Ok(b) => b,
                    Err(e) => return self.fail(e),
                };
                match send_command(&self.ctx, self.peer, mailbox, Command::Publish, &bytes, false) {
                    Ok(()) => WaitingType::WaitingOnCq,
                    Err(e) => self.fail(e),
                }
            }
            OpArgs::SendSuccess => WaitingType::WaitingOnCq,
            OpArgs::SendError => self.fail(ProtocolError::TransportError.into()),
            OpArgs::IncomingMessage { body, .. } => match StatusBody::from_bytes(&body) {
                Ok(status) => {
                    let result = if status.remote_rc == rc::OK {
                        Ok(status.object_info)
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iom::IomRegistry;
    use crate::ldo::allocator::HeapAllocator;
    use crate::localkv::LocalKv;
    use crate::opengine::OpEngine;
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
    fn publish_over_the_wire_lands_in_the_target_localkv() {
        let network = LoopbackNetwork::new();
        let origin_node = NodeId::from_raw(1);
        let target_node = NodeId::from_raw(2);
        let origin_ctx = build_ctx(&network, origin_node);
        let target_ctx = build_ctx(&network, target_node);
        let bucket = Bucket::new("b");
        let key = Key::new("row");

        let (tx, rx) = mpsc::channel();
        spawn(
            &origin_ctx,
            target_node,
            bucket,
            key.clone(),
            heap_ldo(b"hello"),
            BehaviorFlags::DEFAULT_REMOTE,
            0,
            Box::new(move |result| tx.send(result).unwrap()),
        );
        let info = rx.recv_timeout(std::time::Duration::from_secs(5)).unwrap().unwrap();
        assert_eq!(info.col_user_bytes, 5);

        match target_ctx.localkv.get(bucket, &key, None).unwrap() {
            crate::localkv::GetOutcome::Available { ldo, .. } => assert_eq!(ldo.data().unwrap(), b"hello"),
            crate::localkv::GetOutcome::Waiting => panic!("expected Available"),
        }
    }

    #[test]
    fn publish_without_overwrite_rejects_duplicate_remotely() {
        let network = LoopbackNetwork::new();
        let origin_node = NodeId::from_raw(1);
        let target_node = NodeId::from_raw(2);
        let origin_ctx = build_ctx(&network, origin_node);
        let bucket = Bucket::new("b");
        let key = Key::new("row");

        let (tx, rx) = mpsc::channel();
        spawn(
            &origin_ctx,
            target_node,
            bucket,
            key.clone(),
            heap_ldo(b"first"),
            BehaviorFlags::DEFAULT_REMOTE,
            0,
            Box::new(move |result| tx.send(result).unwrap()),
        );
        rx.recv_timeout(std::time::Duration::from_secs(5)).unwrap().unwrap();

        let (tx2, rx2) = mpsc::channel();
        spawn(
            &origin_ctx,
            target_node,
            bucket,
            key,
            heap_ldo(b"second"),
            BehaviorFlags::DEFAULT_REMOTE,
            0,
            Box::new(move |result| tx2.send(result).unwrap()),
        );
        let err = rx2.recv_timeout(std::time::Duration::from_secs(5)).unwrap().unwrap_err();
        assert_eq!(err.to_rc(), rc::EEXIST);
    }
}

/// Fields parsed out of the inbound `BufferBody` during `start`, kept
/// around until the RDMA pull completes.
struct Parsed {
    bucket: Bucket,
    key: Key,
    behavior: BehaviorFlags,
}

struct PublishTarget {
    ctx: Arc<Context>,
    peer: NodeId,
    origin_mailbox: u64,
    body: Vec<u8>,
    mailbox: Option<Mailbox>,
    parsed: Option<Parsed>,
    landing: Option<DataObject>,
}

impl PublishTarget {
    fn reply(&mut self, ack: bool, remote_rc: i32, info: ObjectInfo) -> WaitingType {
        let my_mailbox = self.mailbox.expect("start always precedes any reply");
        if let Err(e) = send_status(
            &self.ctx,
            self.peer,
            my_mailbox,
            self.origin_mailbox,
            Command::Publish.op_id(),
            ack,
            remote_rc,
            info,
        ) {
            warn!("publish target failed to send its status reply: {e}");
        }
        WaitingType::DoneAndDestroy
    }

    fn handle_start(&mut self) -> WaitingType {
        let my_mailbox = self.mailbox.expect("mailbox set just before this call");
        let parsed = match BufferBody::from_bytes(&self.body) {
            Ok(p) => p,
            Err(_) => return self.reply(false, rc::EBADRPC, ObjectInfo::default()),
        };
        let bucket = Bucket::from_raw(parsed.bucket);
        let behavior = BehaviorFlags::from_bits(parsed.behavior);

        if !behavior.contains(BehaviorFlags::ENABLE_OVERWRITES) {
            if let Ok(crate::localkv::GetOutcome::Available { info, .. }) =
                self.ctx.localkv.get(bucket, &parsed.key, None)
            {
                return self.reply(true, rc::EEXIST, info);
            }
        }

        let landing = match self.ctx.transport.new_message(parsed.meta_plus_data_size as usize) {
            Ok(l) => l,
            Err(e) => return self.reply(false, e.to_rc(), ObjectInfo::default()),
        };
        self.landing = Some(landing.clone());
        self.parsed = Some(Parsed { bucket, key: parsed.key.clone(), behavior });

        match get_rdma(&self.ctx, self.peer, my_mailbox, parsed.nbr, landing) {
            Ok(()) => WaitingType::WaitingOnCq,
            Err(e) => self.reply(false, e.to_rc(), ObjectInfo::default()),
        }
    }

    fn handle_get_success(&mut self) -> WaitingType {
        let parsed = self.parsed.take().expect("parsed before rdma pull completes");
        let landing = self.landing.take().expect("landing allocated before rdma pull completes");
        let iom = if parsed.behavior.contains(BehaviorFlags::WRITE_TO_IOM) {
            self.ctx.default_iom.as_ref()
        } else {
            None
        };
        match self.ctx.localkv.put(parsed.bucket, &parsed.key, landing, parsed.behavior, iom) {
            Ok(info) => self.reply(true, rc::OK, info),
            Err(e) => self.reply(false, e.to_rc(), ObjectInfo::default()),
        }
    }
}

impl Op for PublishTarget {
    fn update(&mut self, args: OpArgs) -> WaitingType {
        match args {
            OpArgs::Start(mailbox) => {
                self.mailbox = Some(mailbox);
                self.handle_start()
            }
            OpArgs::GetSuccess => self.handle_get_success(),
            OpArgs::GetError => self.reply(false, rc::EIO, ObjectInfo::default()),
            _ => WaitingType::WaitingOnCq,
        }
    }
}
