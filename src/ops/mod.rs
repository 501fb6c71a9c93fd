//! The seven op state machine pairs (spec §4.5). Each module owns an
//! origin half (constructed directly by a Pool call) and a target
//! half (instantiated by `OpEngine` via a factory keyed on the
//! command's `op_id`). Grounded in
//! `original_source/src/kelpie/ops/{OpKelpiePublish,OpKelpieGet,...}.cpp`.
pub mod compute;
pub mod drop_op;
pub mod get_bounded;
pub mod get_unbounded;
pub mod info;
pub mod list;
pub mod publish;

use std::sync::Arc;

use log::warn;

use crate::context::Context;
use crate::error::Result;
use crate::ldo::DataObject;
use crate::node::NodeId;
use crate::object_info::ObjectInfo;
use crate::opengine::Mailbox;
use crate::transport::{AtomicOp, TransportEvent};
use crate::wire::{Command, MessageHeader, NetBufferRemote, StatusBody, UserFlags, FIXED_HEADER_SIZE};

/// Every origin op's user-facing result lands here exactly once.
pub type ResultCallback<T> = Box<dyn FnOnce(Result<T>) + Send>;

/// Frame and send one envelope, wiring the transport completion back
/// into the issuing op's mailbox as a `send_success`/`send_error`
/// transition (spec §4.3).
pub fn send_command(
    ctx: &Arc<Context>,
    peer: NodeId,
    mailbox: Mailbox,
    cmd: Command,
    body: &[u8],
    can_stall: bool,
) -> Result<()> {
    let header = MessageHeader {
        src: ctx.local_node,
        dst: peer,
        src_mailbox: mailbox.raw(),
        dst_mailbox: 0,
        op_id: cmd.op_id(),
        user_flags: UserFlags::for_command(cmd).with_can_stall(can_stall),
        body_len: body.len() as u32,
    };
    send_framed(ctx, peer, mailbox, &header, body)
}

/// Frame and send a reply to an already-known destination mailbox
/// (target → origin acks/nacks).
pub fn send_reply(
    ctx: &Arc<Context>,
    peer: NodeId,
    my_mailbox: Mailbox,
    dst_mailbox: u64,
    op_id: u32,
    flags: UserFlags,
    body: &[u8],
) -> Result<()> {
    let header = MessageHeader {
        src: ctx.local_node,
        dst: peer,
        src_mailbox: my_mailbox.raw(),
        dst_mailbox,
        op_id,
        user_flags: flags,
        body_len: body.len() as u32,
    };
    send_framed(ctx, peer, my_mailbox, &header, body)
}

/// Send a status reply (target → origin): an ack carries the real
/// outcome in `remote_rc`/`info` even when that outcome is itself a
/// failure (e.g. Publish's `{ack, remote_rc=EEXIST}` short-circuit); a
/// nack is reserved for cases with no `ObjectInfo` to report at all
/// (bad rpc, transport failure, timeout while stalled).
#[allow(clippy::too_many_arguments)]
pub fn send_status(
    ctx: &Arc<Context>,
    peer: NodeId,
    my_mailbox: Mailbox,
    dst_mailbox: u64,
    op_id: u32,
    ack: bool,
    remote_rc: i32,
    info: ObjectInfo,
) -> Result<()> {
    let body = StatusBody { remote_rc, object_info: info }.to_bytes();
    let flags = UserFlags::status(ack, false, remote_rc == crate::error::rc::OK);
    send_reply(ctx, peer, my_mailbox, dst_mailbox, op_id, flags, &body)
}

fn send_framed(ctx: &Arc<Context>, peer: NodeId, mailbox: Mailbox, header: &MessageHeader, body: &[u8]) -> Result<()> {
    let framed = ctx.frame(header, body);
    let msg = ctx.transport.new_message(framed.len())?;
    msg.overwrite_body(&[], &framed)?;
    ctx.transport.send_msg(peer, msg, completion_handoff(ctx, mailbox))
}

/// Pull `remote` into a freshly allocated local LDO and hand the
/// completion back to `mailbox`'s op as a `get_success`/`get_error`
/// transition. Used by Get-Bounded's origin (pull after the target's
/// `RowInfo` reply) and Get-Unbounded's origin (pull into a buffer
/// sized from the target's advertised length).
pub fn get_rdma(
    ctx: &Arc<Context>,
    peer: NodeId,
    mailbox: Mailbox,
    remote: NetBufferRemote,
    local: DataObject,
) -> Result<()> {
    ctx.transport.get(peer, remote, local, completion_handoff(ctx, mailbox))
}

/// Push `local` out to `remote`, completing as `put_success`/`put_error`.
/// Used by the side issuing the RDMA write against a peer-advertised
/// buffer description (Publish-origin's push, Get-Bounded-target's
/// push-back when the caller's buffer was large enough).
pub fn put_rdma(
    ctx: &Arc<Context>,
    peer: NodeId,
    mailbox: Mailbox,
    local: DataObject,
    remote: NetBufferRemote,
) -> Result<()> {
    ctx.transport.put(peer, local, remote, completion_handoff(ctx, mailbox))
}

#[allow(clippy::too_many_arguments)]
pub fn atomic_rdma(
    ctx: &Arc<Context>,
    peer: NodeId,
    mailbox: Mailbox,
    op: AtomicOp,
    local: DataObject,
    local_offset: u32,
    remote: NetBufferRemote,
    remote_offset: u32,
    size: u32,
    operand: u64,
) -> Result<()> {
    ctx.transport.atomic(
        peer,
        op,
        local,
        local_offset,
        remote,
        remote_offset,
        size,
        operand,
        completion_handoff(ctx, mailbox),
    )
}

/// Build a transport completion callback that hands the event to the
/// background worker pool instead of delivering it to the `OpEngine`
/// inline.
///
/// `LoopbackTransport` completes every call synchronously, before the
/// issuing `Transport` method returns. An op's `Start` transition (the
/// only transition run with its shard's mutex held — see
/// `OpEngine::spawn_origin`) can therefore trigger a completion for
/// its own mailbox, on the same thread, before `Start` has returned:
/// calling `OpEngine::deliver_transport_event` straight from this
/// callback would try to re-lock that same (non-reentrant) mutex and
/// deadlock. Deferring the delivery onto the worker pool — the same
/// technique `LocalKv` uses to keep waiter dispatch out of a held row
/// lock — runs it on a different thread instead, where it simply
/// blocks on the mutex until `Start` releases it.
fn completion_handoff(ctx: &Arc<Context>, mailbox: Mailbox) -> crate::transport::CompletionCallback {
    let engine = ctx.op_engine.clone();
    let worker = ctx.worker.clone();
    Box::new(move |event: TransportEvent| {
        worker.submit(Box::new(move || {
            if let Err(e) = engine.deliver_transport_event(mailbox, event) {
                warn!("transport completion delivered to a dead mailbox {:?}: {}", mailbox, e);
            }
            0
        }));
    })
}

/// Register every target-side factory with the `OpEngine` (spec §4.3:
/// "factory dispatch on the header op_id"). Call once per `Context`.
pub fn register_all_target_factories(ctx: &Arc<Context>) {
    publish::register_factory(ctx);
    get_bounded::register_factory(ctx);
    get_unbounded::register_factory(ctx);
    info::register_factory(ctx);
    list::register_factory(ctx);
    drop_op::register_factory(ctx);
    compute::register_factory(ctx);
}
