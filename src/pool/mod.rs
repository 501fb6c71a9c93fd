//! Pool (spec §4.6): the caller-facing synchronous API layered over the
//! seven op state machines in `ops`. A Pool owns a placement strategy —
//! this crate implements one, `DhtPool` — and turns the op layer's
//! callback-driven `spawn` calls into calls that simply return a
//! `Result` once the underlying op has run to completion.
pub mod behavior;
pub mod dht;

use std::sync::mpsc;
use std::time::Duration;

pub use behavior::BehaviorFlags;
pub use dht::DhtPool;

use crate::error::{ProtocolError, Result};
use crate::key::Key;
use crate::ldo::DataObject;
use crate::object_info::ObjectInfo;
use crate::ops::list::ListEntry;

/// How long a blocking call waits for its op to finish before reporting
/// a timeout itself. Independent of any `OpEngine`-level stall timeout —
/// this is the ceiling on top of that for a caller who would otherwise
/// block forever on a channel nothing will ever signal (a dropped
/// callback, a leaked op).
const CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Bridge one `ops::*::spawn`-shaped call (result delivered via a
/// once-called callback) into a blocking call. `launch` is handed the
/// channel's sending half wrapped as a `ResultCallback` and must arrange
/// for it to be invoked exactly once.
pub(crate) fn block_on<T: Send + 'static>(
    launch: impl FnOnce(crate::ops::ResultCallback<T>),
) -> Result<T> {
    let (tx, rx) = mpsc::channel();
    launch(Box::new(move |result| {
        let _ = tx.send(result);
    }));
    match rx.recv_timeout(CALL_TIMEOUT) {
        Ok(result) => result,
        Err(_) => Err(ProtocolError::TimedOut.into()),
    }
}

/// The key/value operations a Pool exposes to callers (spec §4.6).
/// Every method blocks until its op completes. `behavior` arguments are
/// in the caller's own frame; a Pool rebases them to the target's frame
/// itself before dispatching remotely.
pub trait Pool: Send + Sync {
    fn publish(&self, key: Key, ldo: DataObject, behavior: BehaviorFlags) -> Result<ObjectInfo>;
    fn get_bounded(&self, key: Key, landing: DataObject) -> Result<ObjectInfo>;
    fn get_unbounded(&self, key: Key) -> Result<(DataObject, ObjectInfo)>;
    fn col_info(&self, key: Key) -> Result<ObjectInfo>;
    fn row_info(&self, key_pattern: Key) -> Result<ObjectInfo>;
    fn list(&self, key_pattern: Key) -> Result<Vec<ListEntry>>;
    fn drop(&self, key_pattern: Key) -> Result<usize>;
    fn compute(&self, key: Key, fn_name: String, fn_args: Vec<u8>) -> Result<(DataObject, ObjectInfo)>;
}
