//! Get-Unbounded (spec §4.5): origin has no landing LDO yet and pulls
//! one sized by whatever the target advertises. Grounded in
//! `original_source/src/kelpie/ops/direct/OpKelpieGetUnbounded.cpp`.
use std::sync::Arc;

use log::warn;

use crate::bucket::Bucket;
use crate::context::Context;
use crate::error::{rc, ProtocolError, Result};
use crate::key::Key;
use crate::ldo::DataObject;
use crate::localkv::GetOutcome;
use crate::node::NodeId;
use crate::object_info::{Availability, ObjectInfo};
use crate::opengine::{Mailbox, Op, OpArgs, TriggerPayload, WaitingType};
use crate::wire::{BufferBody, Command, SimpleBody, StatusBody, UserFlags};

use super::{get_rdma, send_command, send_reply, send_status, ResultCallback};

/// Launch the origin half: pull whatever is published under `key` on
/// `peer`, sized however the target says it is.
pub fn spawn(
    ctx: &Arc<Context>,
    peer: NodeId,
    bucket: Bucket,
    key: Key,
    callback: ResultCallback<(DataObject, ObjectInfo)>,
) -> Mailbox {
    let op = Box::new(GetUnboundedOrigin {
        ctx: ctx.clone(),
        peer,
        bucket,
        key,
        mailbox: None,
        pending_size: 0,
        pending_landing: None,
        callback: Some(callback),
    });
    ctx.op_engine.spawn_origin(op).0
}

pub fn register_factory(ctx: &Arc<Context>) {
    let captured = ctx.clone();
    ctx.op_engine.register_factory(Command::GetUnbounded.op_id(), move |peer, origin_mailbox, body| {
        Box::new(GetUnboundedTarget {
            ctx: captured.clone(),
            peer,
            origin_mailbox,
            body,
            mailbox: None,
        }) as Box<dyn Op>
    });
}

struct GetUnboundedOrigin {
    ctx: Arc<Context>,
    peer: NodeId,
    bucket: Bucket,
    key: Key,
    mailbox: Option<Mailbox>,
    /// Size of the pull in flight, stashed at `IncomingMessage` time so
    /// `GetSuccess` can report it without re-parsing the reply.
    pending_size: u64,
    pending_landing: Option<DataObject>,
    callback: Option<ResultCallback<(DataObject, ObjectInfo)>>,
}

impl GetUnboundedOrigin {
    fn fail(&mut self, err: crate::error::Error) -> WaitingType {
        if let Some(cb) = self.callback.take() {
            cb(Err(err));
        }
        WaitingType::Error
    }

    fn finish(&mut self, result: Result<(DataObject, ObjectInfo)>) -> WaitingType {
        if let Some(cb) = self.callback.take() {
            cb(result);
        }
        WaitingType::DoneAndDestroy
    }

    /// The only bit of `ObjectInfo` the wire's data-ready reply carries
    /// is the pulled size; see DESIGN.md, "Get-Unbounded's reply has no
    /// ObjectInfo".
    fn synthesize_info(size: u64) -> ObjectInfo {
        ObjectInfo {
            row_user_bytes: size,
            col_user_bytes: size,
            row_num_columns: 1,
            col_dependencies: 0,
            col_availability: Availability::InLocalMemory,
        }
    }

    fn handle_reply(&mut self, body: Vec<u8>, flags: UserFlags) -> WaitingType {
        if flags.is_ack() && flags.is_success() {
            let buffer = match BufferBody::from_bytes(&body) {
                Ok(b) => b,
                Err(e) => return self.fail(e),
            };
            let mailbox = self.mailbox.expect("reply only arrives after start");
            let landing = match self.ctx.transport.new_message(buffer.meta_plus_data_size as usize) {
                Ok(l) => l,
                Err(e) => return self.fail(e),
            };
            self.pending_size = buffer.meta_plus_data_size;
            self.pending_landing = Some(landing.clone());
            match get_rdma(&self.ctx, self.peer, mailbox, buffer.nbr, landing) {
                Ok(()) => WaitingType::WaitingOnCq,
                Err(e) => self.fail(e),
            }
        } else {
            match StatusBody::from_bytes(&body) {
                Ok(status) => self.fail(ProtocolError::Remote(status.remote_rc).into()),
                Err(e) => self.fail(e),
            }
        }
    }
}

impl Op for GetUnboundedOrigin {
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
                match send_command(&self.ctx, self.peer, mailbox, Command::GetUnbounded, &bytes, true) {
                    Ok(()) => WaitingType::WaitingOnCq,
                    Err(e) => self.fail(e),
                }
            }
            OpArgs::SendSuccess => WaitingType::WaitingOnCq,
            OpArgs::SendError => self.fail(ProtocolError::TransportError.into()),
            OpArgs::IncomingMessage { body, flags, .. } => self.handle_reply(body, flags),
            OpArgs::GetSuccess => {
                let landing = self.pending_landing.take().expect("get_success after a pull was issued");
                let info = Self::synthesize_info(self.pending_size);
                self.finish(Ok((landing, info)))
            }
            OpArgs::GetError => self.fail(ProtocolError::TransportError.into()),
            _ => WaitingType::WaitingOnCq,
        }
    }
}

struct GetUnboundedTarget {
    ctx: Arc<Context>,
    peer: NodeId,
    origin_mailbox: u64,
    body: Vec<u8>,
    mailbox: Option<Mailbox>,
}

impl GetUnboundedTarget {
    fn reply_nack(&mut self, remote_rc: i32) -> WaitingType {
        let my_mailbox = self.mailbox.expect("start always precedes any reply");
        if let Err(e) = send_status(
            &self.ctx,
            self.peer,
            my_mailbox,
            self.origin_mailbox,
            Command::GetUnbounded.op_id(),
            false,
            remote_rc,
            ObjectInfo::default(),
        ) {
            warn!("get-unbounded target failed to send its nack reply: {e}");
        }
        WaitingType::DoneAndDestroy
    }

    fn advertise(&mut self, ldo: DataObject) -> WaitingType {
        let my_mailbox = self.mailbox.expect("start always precedes an advertise");
        let nbr = match self.ctx.transport.get_rdma_ptr(&ldo) {
            Ok(n) => n,
            Err(e) => return self.reply_nack(e.to_rc()),
        };
        let meta_plus_data_size = match ldo.header() {
            Ok(h) => h.meta_plus_data() as u64,
            Err(e) => return self.reply_nack(e.to_rc()),
        };
        let body = BufferBody {
            nbr,
            meta_plus_data_size,
            bucket: 0,
            iom_hash: 0,
            behavior: 0,
            key: Key::with_column(Vec::new(), Vec::new()),
        };
        let bytes = match body.to_bytes() {
            Ok(b) => b,
            Err(e) => return self.reply_nack(e.to_rc()),
        };
        let flags = UserFlags::status(true, false, true);
        if let Err(e) = send_reply(
            &self.ctx,
            self.peer,
            my_mailbox,
            self.origin_mailbox,
            Command::GetUnbounded.op_id(),
            flags,
            &bytes,
        ) {
            warn!("get-unbounded target failed to send its data-ready reply: {e}");
        }
        WaitingType::DoneAndDestroy
    }

    fn handle_start(&mut self) -> WaitingType {
        let my_mailbox = self.mailbox.expect("mailbox set just before this call");
        let parsed = match SimpleBody::from_bytes(&self.body) {
            Ok(p) => p,
            Err(_) => return self.reply_nack(rc::EBADRPC),
        };
        let bucket = Bucket::from_raw(parsed.bucket);

        match self.ctx.localkv.get(bucket, &parsed.key, Some(my_mailbox)) {
            Ok(GetOutcome::Available { ldo, .. }) => self.advertise(ldo),
            Ok(GetOutcome::Waiting) => WaitingType::WaitOnUser,
            Err(e) => self.reply_nack(e.to_rc()),
        }
    }
}

impl Op for GetUnboundedTarget {
    fn update(&mut self, args: OpArgs) -> WaitingType {
        match args {
            OpArgs::Start(mailbox) => {
                self.mailbox = Some(mailbox);
                self.handle_start()
            }
            OpArgs::UserTrigger(TriggerPayload { ldo, .. }) => self.advertise(ldo),
            OpArgs::Timeout => self.reply_nack(rc::ETIMEDOUT),
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

    #[test]
    fn get_unbounded_pulls_a_landing_sized_by_the_target() {
        let network = LoopbackNetwork::new();
        let origin_node = NodeId::from_raw(1);
        let target_node = NodeId::from_raw(2);
        let origin_ctx = build_ctx(&network, origin_node);
        let target_ctx = build_ctx(&network, target_node);
        let bucket = Bucket::new("b");
        let key = Key::new("row");

        target_ctx
            .localkv
            .put(bucket, &key, DataObject::new(b"", b"hello there", Arc::new(HeapAllocator::new()), 0).unwrap(), BehaviorFlags::DEFAULT_LOCAL, None)
            .unwrap();

        let (tx, rx) = mpsc::channel();
        spawn(&origin_ctx, target_node, bucket, key, Box::new(move |result| tx.send(result).unwrap()));
        let (ldo, info) = rx.recv_timeout(std::time::Duration::from_secs(5)).unwrap().unwrap();
        assert_eq!(ldo.data().unwrap(), b"hello there");
        assert_eq!(info.col_user_bytes, 11);
        assert_eq!(info.col_availability, Availability::InLocalMemory);
    }

    #[test]
    fn get_unbounded_waits_for_a_later_publish() {
        let network = LoopbackNetwork::new();
        let origin_node = NodeId::from_raw(1);
        let target_node = NodeId::from_raw(2);
        let origin_ctx = build_ctx(&network, origin_node);
        let target_ctx = build_ctx(&network, target_node);
        let bucket = Bucket::new("b");
        let key = Key::new("not_yet");

        let (tx, rx) = mpsc::channel();
        spawn(&origin_ctx, target_node, bucket, key.clone(), Box::new(move |result| tx.send(result).unwrap()));

        std::thread::sleep(std::time::Duration::from_millis(50));
        target_ctx
            .localkv
            .put(bucket, &key, DataObject::new(b"", b"late", Arc::new(HeapAllocator::new()), 0).unwrap(), BehaviorFlags::DEFAULT_LOCAL, None)
            .unwrap();

        let (ldo, _info) = rx.recv_timeout(std::time::Duration::from_secs(5)).unwrap().unwrap();
        assert_eq!(ldo.data().unwrap(), b"late");
    }
}
