//! List (spec §4.5): enumerate keys matching a row or column wildcard
//! on one target. Fan-out across a Pool's membership is the caller's
//! job (each member gets its own `spawn` call); this module only knows
//! how to talk to one peer at a time. Grounded in
//! `original_source/src/kelpie/ops/direct/OpKelpieList.cpp`.
use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian};
use log::warn;

use crate::bucket::Bucket;
use crate::context::Context;
use crate::error::{rc, ProtocolError, Result};
use crate::key::Key;
use crate::node::NodeId;
use crate::opengine::{Mailbox, Op, OpArgs, WaitingType};
use crate::wire::{Command, SimpleBody, UserFlags};

use super::{send_command, send_reply, ResultCallback};

/// One matched key and the size of the cell behind it, as reported by
/// a single target (spec §4.4, List).
#[derive(Debug, Clone, PartialEq)]
pub struct ListEntry {
    pub key: Key,
    pub size: u64,
}

/// Hand-rolled reply shape: `{count:u32}{per entry: k1_len:u16,
/// k2_len:u16, size:u64, k1 bytes, k2 bytes}`. Not one of the spec's
/// three named envelope shapes (simple/buffer/status) — List's result
/// is an open-ended vector with no natural fixed-size encoding.
fn encode_entries(entries: &[ListEntry]) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(4 + entries.len() * 16);
    let mut count_buf = [0u8; 4];
    LittleEndian::write_u32(&mut count_buf, entries.len() as u32);
    buf.extend_from_slice(&count_buf);

    for entry in entries {
        let k1 = entry.key.k1();
        let k2 = entry.key.k2();
        if k1.len() > crate::key::MAX_KEY_BYTES || k2.len() > crate::key::MAX_KEY_BYTES {
            return Err(ProtocolError::KeyTooLong.into());
        }
        let mut fixed = [0u8; 12];
        LittleEndian::write_u16(&mut fixed[0..2], k1.len() as u16);
        LittleEndian::write_u16(&mut fixed[2..4], k2.len() as u16);
        LittleEndian::write_u64(&mut fixed[4..12], entry.size);
        buf.extend_from_slice(&fixed);
        buf.extend_from_slice(k1);
        buf.extend_from_slice(k2);
    }
    Ok(buf)
}

fn decode_entries(buf: &[u8]) -> Result<Vec<ListEntry>> {
    if buf.len() < 4 {
        return Err(ProtocolError::BadRpc("list reply shorter than its count prefix").into());
    }
    let count = LittleEndian::read_u32(&buf[0..4]) as usize;
    let mut out = Vec::with_capacity(count);
    let mut off = 4;
    for _ in 0..count {
        if buf.len() < off + 12 {
            return Err(ProtocolError::BadRpc("list reply truncated before an entry's fixed prefix").into());
        }
        let k1_len = LittleEndian::read_u16(&buf[off..off + 2]) as usize;
        let k2_len = LittleEndian::read_u16(&buf[off + 2..off + 4]) as usize;
        let size = LittleEndian::read_u64(&buf[off + 4..off + 12]);
        off += 12;
        if buf.len() < off + k1_len + k2_len {
            return Err(ProtocolError::BadRpc("list reply truncated before an entry's key bytes").into());
        }
        let k1 = buf[off..off + k1_len].to_vec();
        off += k1_len;
        let k2 = buf[off..off + k2_len].to_vec();
        off += k2_len;
        out.push(ListEntry { key: Key::with_column(k1, k2), size });
    }
    Ok(out)
}

/// Launch the origin half against a single `peer`.
pub fn spawn(
    ctx: &Arc<Context>,
    peer: NodeId,
    bucket: Bucket,
    key_pattern: Key,
    callback: ResultCallback<Vec<ListEntry>>,
) -> Mailbox {
    let op = Box::new(ListOrigin {
        ctx: ctx.clone(),
        peer,
        bucket,
        key_pattern,
        mailbox: None,
        callback: Some(callback),
    });
    ctx.op_engine.spawn_origin(op).0
}

pub fn register_factory(ctx: &Arc<Context>) {
    let captured = ctx.clone();
    ctx.op_engine.register_factory(Command::List.op_id(), move |peer, origin_mailbox, body| {
        Box::new(ListTarget {
            ctx: captured.clone(),
            peer,
            origin_mailbox,
            body,
            mailbox: None,
        }) as Box<dyn Op>
    });
}

struct ListOrigin {
    ctx: Arc<Context>,
    peer: NodeId,
    bucket: Bucket,
    key_pattern: Key,
    mailbox: Option<Mailbox>,
    callback: Option<ResultCallback<Vec<ListEntry>>>,
}

impl ListOrigin {
    fn fail(&mut self, err: crate::error::Error) -> WaitingType {
        if let Some(cb) = self.callback.take() {
            cb(Err(err));
        }
        WaitingType::Error
    }

    fn finish(&mut self, result: Result<Vec<ListEntry>>) -> WaitingType {
        if let Some(cb) = self.callback.take() {
            cb(result);
        }
        WaitingType::DoneAndDestroy
    }
}

impl Op for ListOrigin {
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
                match send_command(&self.ctx, self.peer, mailbox, Command::List, &bytes, false) {
                    Ok(()) => WaitingType::WaitingOnCq,
                    Err(e) => self.fail(e),
                }
            }
            OpArgs::SendSuccess => WaitingType::WaitingOnCq,
            OpArgs::SendError => self.fail(ProtocolError::TransportError.into()),
            OpArgs::IncomingMessage { body, flags, .. } => {
                if flags.is_nack() {
                    self.fail(ProtocolError::Remote(rc::EIO).into())
                } else {
                    match decode_entries(&body) {
                        Ok(entries) => self.finish(Ok(entries)),
                        Err(e) => self.fail(e),
                    }
                }
            }
            _ => WaitingType::WaitingOnCq,
        }
    }
}

struct ListTarget {
    ctx: Arc<Context>,
    peer: NodeId,
    origin_mailbox: u64,
    body: Vec<u8>,
    mailbox: Option<Mailbox>,
}

impl ListTarget {
    fn reply_ok(&mut self, entries: Vec<ListEntry>) -> WaitingType {
        let my_mailbox = self.mailbox.expect("start always precedes any reply");
        let bytes = match encode_entries(&entries) {
            Ok(b) => b,
            Err(e) => return self.reply_nack(e.to_rc()),
        };
        let flags = UserFlags::status(true, false, true);
        if let Err(e) =
            send_reply(&self.ctx, self.peer, my_mailbox, self.origin_mailbox, Command::List.op_id(), flags, &bytes)
        {
            warn!("list target failed to send its reply: {e}");
        }
        WaitingType::DoneAndDestroy
    }

    fn reply_nack(&mut self, remote_rc: i32) -> WaitingType {
        let my_mailbox = self.mailbox.expect("start always precedes any reply");
        let flags = UserFlags::status(false, false, false);
        let bytes = encode_entries(&[]).unwrap_or_default();
        let _ = remote_rc;
        if let Err(e) =
            send_reply(&self.ctx, self.peer, my_mailbox, self.origin_mailbox, Command::List.op_id(), flags, &bytes)
        {
            warn!("list target failed to send its nack reply: {e}");
        }
        WaitingType::DoneAndDestroy
    }
}

impl Op for ListTarget {
    fn update(&mut self, args: OpArgs) -> WaitingType {
        match args {
            OpArgs::Start(mailbox) => {
                self.mailbox = Some(mailbox);
                let parsed = match SimpleBody::from_bytes(&self.body) {
                    Ok(p) => p,
                    Err(_) => return self.reply_nack(rc::EBADRPC),
                };
                let bucket = Bucket::from_raw(parsed.bucket);
                match self.ctx.localkv.list(bucket, &parsed.key, self.ctx.default_iom.as_ref()) {
                    Ok(matches) => {
                        let entries = matches.into_iter().map(|(key, size)| ListEntry { key, size }).collect();
                        self.reply_ok(entries)
                    }
                    Err(e) => self.reply_nack(e.to_rc()),
                }
            }
            _ => WaitingType::WaitingOnCq,
        }
    }
}
