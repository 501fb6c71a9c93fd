//! Get-Bounded (spec §4.5): origin already owns a landing LDO of the
//! right size. Grounded in
//! `original_source/src/kelpie/ops/direct/OpKelpieGetBounded.cpp`.
use std::sync::Arc;

use log::warn;

use crate::bucket::Bucket;
use crate::context::Context;
use crate::error::{rc, ProtocolError, Result};
use crate::key::Key;
use crate::ldo::DataObject;
use crate::localkv::GetOutcome;
use crate::node::NodeId;
use crate::object_info::ObjectInfo;
use crate::opengine::{Mailbox, Op, OpArgs, TriggerPayload, WaitingType};
use crate::wire::{BufferBody, Command, NetBufferRemote, StatusBody};

use super::{put_rdma, send_command, send_status, ResultCallback};

/// Launch the origin half: pull `key` from `peer` directly into
/// `landing`, a caller-sized LDO.
pub fn spawn(
    ctx: &Arc<Context>,
    peer: NodeId,
    bucket: Bucket,
    key: Key,
    landing: DataObject,
    callback: ResultCallback<ObjectInfo>,
) -> Mailbox {
    let op = Box::new(GetBoundedOrigin {
        ctx: ctx.clone(),
        peer,
        bucket,
        key,
        landing,
        mailbox: None,
        callback: Some(callback),
    });
    ctx.op_engine.spawn_origin(op).0
}

pub fn register_factory(ctx: &Arc<Context>) {
    let captured = ctx.clone();
    ctx.op_engine.register_factory(Command::GetBounded.op_id(), move |peer, origin_mailbox, body| {
        Box::new(GetBoundedTarget {
            ctx: captured.clone(),
            peer,
            origin_mailbox,
            body,
            mailbox: None,
            parsed: None,
            stashed_info: None,
        }) as Box<dyn Op>
    });
}

struct GetBoundedOrigin {
    ctx: Arc<Context>,
    peer: NodeId,
    bucket: Bucket,
    key: Key,
    landing: DataObject,
    mailbox: Option<Mailbox>,
    callback: Option<ResultCallback<ObjectInfo>>,
}

impl GetBoundedOrigin {
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

impl Op for GetBoundedOrigin {
    fn update(&mut self, args: OpArgs) -> WaitingType {
        match args {
            OpArgs::Start(mailbox) => {
                self.mailbox = Some(mailbox);
                let nbr = match self.ctx.transport.get_rdma_ptr(&self.landing) {
                    Ok(n) => n,
                    Err(e) => return self.fail(e),
                };
                let meta_plus_data_size = match self.landing.header() {
                    Ok(h) => h.meta_plus_data() as u64,
                    Err(e) => return self.fail(e),
                };
                let body = BufferBody {
                    nbr,
                    meta_plus_data_size,
                    bucket: self.bucket.id(),
                    iom_hash: 0,
                    behavior: 0,
                    key: self.key.clone(),
                };
                let bytes = match body.to_bytes() {
                    Ok(b) => b,
                    Err(e) => return self.fail(e),
                };
                match send_command(&self.ctx, self.peer, mailbox, Command::GetBounded, &bytes, true) {
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

struct Parsed {
    origin_nbr: NetBufferRemote,
}

struct GetBoundedTarget {
    ctx: Arc<Context>,
    peer: NodeId,
    origin_mailbox: u64,
    body: Vec<u8>,
    mailbox: Option<Mailbox>,
    parsed: Option<Parsed>,
    stashed_info: Option<ObjectInfo>,
}

impl GetBoundedTarget {
    fn reply(&mut self, ack: bool, remote_rc: i32, info: ObjectInfo) -> WaitingType {
        let my_mailbox = self.mailbox.expect("start always precedes any reply");
        if let Err(e) = send_status(
            &self.ctx,
            self.peer,
            my_mailbox,
            self.origin_mailbox,
            Command::GetBounded.op_id(),
            ack,
            remote_rc,
            info,
        ) {
            warn!("get-bounded target failed to send its status reply: {e}");
        }
        WaitingType::DoneAndDestroy
    }

    fn push(&mut self, ldo: DataObject, info: ObjectInfo) -> WaitingType {
        let my_mailbox = self.mailbox.expect("start always precedes a push");
        let origin_nbr = self.parsed.as_ref().expect("parsed before any push").origin_nbr;
        self.stashed_info = Some(info);
        match put_rdma(&self.ctx, self.peer, my_mailbox, ldo, origin_nbr) {
            Ok(()) => WaitingType::WaitingOnCq,
            Err(e) => self.reply(false, e.to_rc(), ObjectInfo::default()),
        }
    }

    fn handle_start(&mut self) -> WaitingType {
        let my_mailbox = self.mailbox.expect("mailbox set just before this call");
        let parsed = match BufferBody::from_bytes(&self.body) {
            Ok(p) => p,
            Err(_) => return self.reply(false, rc::EBADRPC, ObjectInfo::default()),
        };
        let bucket = Bucket::from_raw(parsed.bucket);
        self.parsed = Some(Parsed { origin_nbr: parsed.nbr });

        match self.ctx.localkv.get(bucket, &parsed.key, Some(my_mailbox)) {
            Ok(GetOutcome::Available { ldo, info }) => self.push(ldo, info),
            Ok(GetOutcome::Waiting) => WaitingType::WaitOnUser,
            Err(e) => self.reply(false, e.to_rc(), ObjectInfo::default()),
        }
    }
}

impl Op for GetBoundedTarget {
    fn update(&mut self, args: OpArgs) -> WaitingType {
        match args {
            OpArgs::Start(mailbox) => {
                self.mailbox = Some(mailbox);
                self.handle_start()
            }
            OpArgs::UserTrigger(TriggerPayload { ldo, info, .. }) => self.push(ldo, info),
            OpArgs::PutSuccess => {
                let info = self.stashed_info.take().unwrap_or_default();
                self.reply(true, rc::OK, info)
            }
            OpArgs::PutError => self.reply(false, rc::EIO, ObjectInfo::default()),
            OpArgs::Timeout => self.reply(false, rc::ETIMEDOUT, ObjectInfo::default()),
            _ => WaitingType::WaitingOnCq,
        }
    }
}
