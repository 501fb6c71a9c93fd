//! `Context`: the bundle of shared collaborators (transport, OpEngine,
//! LocalKV, background worker, IOM registry) that every op state
//! machine and the Pool are constructed against. Not named in
//! spec.md's component table directly, but every component in §4
//! needs exactly this set of handles — this is how this crate wires
//! them together instead of threading five separate `Arc`s everywhere.
use std::sync::Arc;

use log::{error, trace};

use crate::iom::{Iom, IomRegistry};
use crate::localkv::LocalKv;
use crate::node::NodeId;
use crate::opengine::OpEngine;
use crate::transport::Transport;
use crate::wire::{MessageHeader, FIXED_HEADER_SIZE};
use crate::worker::Backburner;

pub struct Context {
    pub local_node: NodeId,
    pub transport: Arc<dyn Transport>,
    pub op_engine: Arc<OpEngine>,
    pub localkv: Arc<LocalKv>,
    pub worker: Arc<Backburner>,
    pub ioms: Arc<IomRegistry>,
    /// The IOM a Pool binds at construction for `WriteToIOM`/column-
    /// info-miss consultation. The wire's `iom_hash` field identifies
    /// which IOM the origin had bound when it is nonzero, but nothing
    /// on the target side can reverse a hash back into a registered
    /// instance (`IomRegistry` is keyed by driver name and reference
    /// string, not by hash) — so target ops consult this single
    /// pool-wide binding instead of attempting that lookup. See
    /// DESIGN.md.
    pub default_iom: Option<Arc<dyn Iom>>,
}

impl Context {
    pub fn new(
        transport: Arc<dyn Transport>,
        op_engine: Arc<OpEngine>,
        localkv: Arc<LocalKv>,
        worker: Arc<Backburner>,
        ioms: Arc<IomRegistry>,
        default_iom: Option<Arc<dyn Iom>>,
    ) -> Arc<Self> {
        let local_node = transport.local_node();
        let ctx = Arc::new(Context { local_node, transport, op_engine, localkv, worker, ioms, default_iom });

        let engine = ctx.op_engine.clone();
        ctx.transport
            .register_recv_callback(Box::new(move |bytes: Vec<u8>| {
                if bytes.len() < FIXED_HEADER_SIZE {
                    error!("dropping inbound message shorter than the fixed header");
                    return;
                }
                let header = match MessageHeader::from_bytes(&bytes[..FIXED_HEADER_SIZE]) {
                    Ok(h) => h,
                    Err(e) => {
                        error!("dropping malformed inbound header: {e}");
                        return;
                    }
                };
                let body_start = FIXED_HEADER_SIZE;
                let body_end = body_start + header.body_len as usize;
                if bytes.len() < body_end {
                    error!("dropping inbound message shorter than its declared body_len");
                    return;
                }
                let body = bytes[body_start..body_end].to_vec();
                trace!("dispatching inbound op_id={} dst_mailbox={}", header.op_id, header.dst_mailbox);
                if let Err(e) = engine.dispatch_incoming(
                    header.op_id,
                    header.src_mailbox,
                    header.dst_mailbox,
                    header.src,
                    header.user_flags,
                    body,
                ) {
                    error!("dispatch_incoming failed: {e}");
                }
            }))
            .expect("registering the single recv callback must not fail");

        ctx
    }

    /// Frame `{fixed header}{body}` into bytes, for handing to
    /// `Transport::new_message`/`send_msg`.
    pub fn frame(&self, header: &MessageHeader, body: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(FIXED_HEADER_SIZE + body.len());
        out.extend_from_slice(&header.to_bytes());
        out.extend_from_slice(body);
        out
    }
}
