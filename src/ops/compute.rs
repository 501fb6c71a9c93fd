//! Compute (spec §4.5): run a named function against an existing cell
//! on its target and pull back a freshly synthesized LDO, the same way
//! Get-Unbounded does. Grounded in
//! `original_source/src/kelpie/ops/direct/OpKelpieCompute.cpp`; the
//! name→function registry itself mirrors `IomRegistry`
//! (`src/iom.rs`)'s name→constructor map.
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use lazy_static::lazy_static;
use log::warn;

use crate::bucket::Bucket;
use crate::context::Context;
use crate::error::{rc, ProtocolError, Result};
use crate::key::Key;
use crate::ldo::allocator::HeapAllocator;
use crate::ldo::DataObject;
use crate::localkv::GetOutcome;
use crate::node::NodeId;
use crate::object_info::{Availability, ObjectInfo};
use crate::opengine::{Mailbox, Op, OpArgs, TriggerPayload, WaitingType};
use crate::wire::{BufferBody, Command, SimpleBody, StatusBody, UserFlags};

use super::{get_rdma, send_command, send_reply, send_status, ResultCallback};

/// `(cell contents, function args) -> synthesized result`.
pub type ComputeFn = dyn Fn(&DataObject, &[u8]) -> Result<DataObject> + Send + Sync;

/// Name → function map (SPEC_FULL.md supplement: the original's
/// `OpKelpieCompute` dispatches to a fixed set of built-in reduction
/// functions; this crate makes the set open-ended and registerable,
/// the same extension shape `IomRegistry` already gives IOM drivers).
#[derive(Default)]
pub struct ComputeRegistry {
    functions: RwLock<HashMap<String, Arc<ComputeFn>>>,
}

impl ComputeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&self, name: &str, f: F)
    where
        F: Fn(&DataObject, &[u8]) -> Result<DataObject> + Send + Sync + 'static,
    {
        self.functions.write().unwrap().insert(name.to_string(), Arc::new(f));
    }

    pub fn get(&self, name: &str) -> Option<Arc<ComputeFn>> {
        self.functions.read().unwrap().get(name).cloned()
    }
}

/// Returns the cell's data-section length as an 8-byte little-endian
/// count: the one built-in function, exercised by the op's own tests
/// and useful as a smoke-test function for anything driving Compute
/// from outside this crate.
fn byte_length(ldo: &DataObject, _args: &[u8]) -> Result<DataObject> {
    let len = ldo.data()?.len() as u64;
    DataObject::new(&[], &len.to_le_bytes(), Arc::new(HeapAllocator::new()), 0)
}

lazy_static! {
    pub static ref COMPUTE_REGISTRY: ComputeRegistry = {
        let registry = ComputeRegistry::new();
        registry.register("byte_length", byte_length);
        registry
    };
}

/// Launch the origin half: run `fn_name(fn_args)` against `key` on
/// `peer` and pull back whatever LDO it produces.
#[allow(clippy::too_many_arguments)]
pub fn spawn(
    ctx: &Arc<Context>,
    peer: NodeId,
    bucket: Bucket,
    key: Key,
    fn_name: String,
    fn_args: Vec<u8>,
    callback: ResultCallback<(DataObject, ObjectInfo)>,
) -> Mailbox {
    let op = Box::new(ComputeOrigin {
        ctx: ctx.clone(),
        peer,
        bucket,
        key,
        fn_name,
        fn_args,
        mailbox: None,
        pending_size: 0,
        pending_landing: None,
        callback: Some(callback),
    });
    ctx.op_engine.spawn_origin(op).0
}

pub fn register_factory(ctx: &Arc<Context>) {
    let captured = ctx.clone();
    ctx.op_engine.register_factory(Command::Compute.op_id(), move |peer, origin_mailbox, body| {
        Box::new(ComputeTarget {
            ctx: captured.clone(),
            peer,
            origin_mailbox,
            body,
            mailbox: None,
            fn_name: None,
            fn_args: None,
        }) as Box<dyn Op>
    });
}

struct ComputeOrigin {
    ctx: Arc<Context>,
    peer: NodeId,
    bucket: Bucket,
    key: Key,
    fn_name: String,
    fn_args: Vec<u8>,
    mailbox: Option<Mailbox>,
    pending_size: u64,
    pending_landing: Option<DataObject>,
    callback: Option<ResultCallback<(DataObject, ObjectInfo)>>,
}

impl ComputeOrigin {
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

impl Op for ComputeOrigin {
    fn update(&mut self, args: OpArgs) -> WaitingType {
        match args {
            OpArgs::Start(mailbox) => {
                self.mailbox = Some(mailbox);
                if self.fn_name.len() > u8::MAX as usize {
                    return self.fail(ProtocolError::InvalidArgument("function name longer than 255 bytes").into());
                }
                let body = SimpleBody {
                    meta_plus_data_size: 0,
                    bucket: self.bucket.id(),
                    iom_hash: 0,
                    behavior: 0,
                    key: self.key.clone(),
                    fn_name: self.fn_name.clone().into_bytes(),
                    fn_args: self.fn_args.clone(),
                };
                let bytes = match body.to_bytes() {
                    Ok(b) => b,
                    Err(e) => return self.fail(e),
                };
                match send_command(&self.ctx, self.peer, mailbox, Command::Compute, &bytes, true) {
                    Ok(()) => WaitingType::WaitingOnCq,
                    Err(e) => self.fail(e),
                }
            }
            OpArgs::SendSuccess => WaitingType::WaitingOnCq,
            OpArgs::SendError => self.fail(ProtocolError::TransportError.into()),
            OpArgs::IncomingMessage { body, flags, .. } => self.handle_reply(body, flags),
            OpArgs::GetSuccess => {
                let landing = self.pending_landing.take().expect("get_success after a pull was issued");
                let size = self.pending_size;
                let info = ObjectInfo {
                    row_user_bytes: size,
                    col_user_bytes: size,
                    row_num_columns: 1,
                    col_dependencies: 0,
                    col_availability: Availability::InLocalMemory,
                };
                self.finish(Ok((landing, info)))
            }
            OpArgs::GetError => self.fail(ProtocolError::TransportError.into()),
            _ => WaitingType::WaitingOnCq,
        }
    }
}

struct ComputeTarget {
    ctx: Arc<Context>,
    peer: NodeId,
    origin_mailbox: u64,
    body: Vec<u8>,
    mailbox: Option<Mailbox>,
    fn_name: Option<String>,
    fn_args: Option<Vec<u8>>,
}

impl ComputeTarget {
    fn reply_nack(&mut self, remote_rc: i32) -> WaitingType {
        let my_mailbox = self.mailbox.expect("start always precedes any reply");
        if let Err(e) = send_status(
            &self.ctx,
            self.peer,
            my_mailbox,
            self.origin_mailbox,
            Command::Compute.op_id(),
            false,
            remote_rc,
            ObjectInfo::default(),
        ) {
            warn!("compute target failed to send its nack reply: {e}");
        }
        WaitingType::DoneAndDestroy
    }

    fn run_and_advertise(&mut self, ldo: DataObject) -> WaitingType {
        let my_mailbox = self.mailbox.expect("start always precedes a compute");
        let fn_name = self.fn_name.take().expect("fn_name parsed before any compute runs");
        let fn_args = self.fn_args.take().unwrap_or_default();

        let function = match COMPUTE_REGISTRY.get(&fn_name) {
            Some(f) => f,
            None => return self.reply_nack(ProtocolError::NoSuchFunction.to_rc()),
        };
        let result = match function(&ldo, &fn_args) {
            Ok(r) => r,
            Err(e) => return self.reply_nack(e.to_rc()),
        };

        let nbr = match self.ctx.transport.get_rdma_ptr(&result) {
            Ok(n) => n,
            Err(e) => return self.reply_nack(e.to_rc()),
        };
        let meta_plus_data_size = match result.header() {
            Ok(h) => h.meta_plus_data() as u64,
            Err(e) => return self.reply_nack(e.to_rc()),
        };
        let buffer = BufferBody {
            nbr,
            meta_plus_data_size,
            bucket: 0,
            iom_hash: 0,
            behavior: 0,
            key: Key::with_column(Vec::new(), Vec::new()),
        };
        let bytes = match buffer.to_bytes() {
            Ok(b) => b,
            Err(e) => return self.reply_nack(e.to_rc()),
        };
        let flags = UserFlags::status(true, false, true);
        if let Err(e) = send_reply(
            &self.ctx,
            self.peer,
            my_mailbox,
            self.origin_mailbox,
            Command::Compute.op_id(),
            flags,
            &bytes,
        ) {
            warn!("compute target failed to send its data-ready reply: {e}");
        }
        WaitingType::DoneAndDestroy
    }

    fn handle_start(&mut self) -> WaitingType {
        let my_mailbox = self.mailbox.expect("mailbox set just before this call");
        let parsed = match SimpleBody::from_bytes(&self.body) {
            Ok(p) => p,
            Err(_) => return self.reply_nack(rc::EBADRPC),
        };
        let fn_name = match String::from_utf8(parsed.fn_name) {
            Ok(s) => s,
            Err(_) => return self.reply_nack(rc::EBADRPC),
        };
        self.fn_name = Some(fn_name);
        self.fn_args = Some(parsed.fn_args);
        let bucket = Bucket::from_raw(parsed.bucket);

        match self.ctx.localkv.get(bucket, &parsed.key, Some(my_mailbox)) {
            Ok(GetOutcome::Available { ldo, .. }) => self.run_and_advertise(ldo),
            Ok(GetOutcome::Waiting) => WaitingType::WaitOnUser,
            Err(e) => self.reply_nack(e.to_rc()),
        }
    }
}

impl Op for ComputeTarget {
    fn update(&mut self, args: OpArgs) -> WaitingType {
        match args {
            OpArgs::Start(mailbox) => {
                self.mailbox = Some(mailbox);
                self.handle_start()
            }
            OpArgs::UserTrigger(TriggerPayload { ldo, .. }) => self.run_and_advertise(ldo),
            OpArgs::Timeout => self.reply_nack(rc::ETIMEDOUT),
            _ => WaitingType::WaitingOnCq,
        }
    }
}
