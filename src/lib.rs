//! A distributed in-memory key/value data fabric for HPC-style
//! point-to-point and RDMA-oriented workloads (spec §1).
//!
//! A process wires up a [`Context`](context::Context) — a [`Transport`]
//! impl, an [`OpEngine`], a [`LocalKv`], a background
//! [`worker::Backburner`], and an [`iom::IomRegistry`] — registers the
//! seven op factories ([`ops::register_all_target_factories`]), and
//! builds one or more [`pool::Pool`]s on top (this crate ships one
//! placement strategy, [`pool::DhtPool`]). Callers interact with a Pool;
//! everything underneath is implementation detail a caller never
//! touches directly.
//!
//! ```text
//! Pool (DhtPool)
//!   -> ops::{publish, get_bounded, get_unbounded, info, list, drop_op, compute}
//!        -> OpEngine (mailbox table, Op state machines)
//!        -> LocalKv (row/cell store, waiter dispatch)
//!        -> Transport (loopback in this crate; RDMA hardware in a real one)
//! ```
//!
//! [`Transport`]: transport::Transport
//! [`OpEngine`]: opengine::OpEngine
//! [`LocalKv`]: localkv::LocalKv
pub mod bucket;
pub mod config;
pub mod context;
pub mod error;
pub mod iom;
pub mod key;
pub mod ldo;
pub mod localkv;
pub mod node;
pub mod object_info;
pub mod opengine;
pub mod ops;
pub mod pool;
pub mod resource_url;
pub mod trace;
pub mod transport;
pub mod wire;
pub mod worker;

pub use bucket::Bucket;
pub use context::Context;
pub use error::{Error, Result};
pub use key::Key;
pub use ldo::DataObject;
pub use node::NodeId;
pub use object_info::{Availability, ObjectInfo};
pub use pool::{BehaviorFlags, DhtPool, Pool};
