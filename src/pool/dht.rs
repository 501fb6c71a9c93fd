//! DhtPool (spec §4.6): a single-hop hash-distributed Pool. Each row
//! maps to exactly one member by `djb2_salted(bucket, row) mod
//! members.len()`; an exact-key call goes straight to that one member —
//! locally via `LocalKv` if it happens to be this node, over the wire
//! via the matching `ops::*::spawn` otherwise. A row-wildcard call
//! (List, Drop, RowInfo) has no single owner, so it fans out to every
//! member and this module merges the per-member results. Grounded in
//! `original_source/src/kelpie/pools/DHTPool/DHTPool.cpp`.
use std::sync::Arc;

use crate::bucket::{self, Bucket};
use crate::context::Context;
use crate::error::Result;
use crate::key::Key;
use crate::ldo::DataObject;
use crate::localkv::GetOutcome;
use crate::node::NodeId;
use crate::object_info::{Availability, ObjectInfo};
use crate::ops::{self, list::ListEntry};

use super::{block_on, BehaviorFlags, Pool};

pub struct DhtPool {
    ctx: Arc<Context>,
    bucket: Bucket,
    members: Vec<NodeId>,
}

impl DhtPool {
    /// Connects to every member up front — a DHT pool's membership is
    /// fixed at construction, not discovered or extended per call.
    pub fn new(ctx: Arc<Context>, bucket: Bucket, members: Vec<NodeId>) -> Result<Arc<Self>> {
        assert!(!members.is_empty(), "a DHT pool needs at least one member");
        for &member in &members {
            if member != ctx.local_node {
                ctx.transport.connect(member)?;
            }
        }
        Ok(Arc::new(DhtPool { ctx, bucket, members }))
    }

    pub fn members(&self) -> &[NodeId] {
        &self.members
    }

    /// Which member owns `key`'s row: two processes holding the same
    /// membership list must land on the same index for the same row, so
    /// this has to be the exact `djb2_salted` used everywhere else.
    fn spot(&self, key: &Key) -> NodeId {
        let hash = bucket::djb2_salted(self.bucket, &key.k1_str());
        self.members[hash as usize % self.members.len()]
    }

    fn is_local(&self, node: NodeId) -> bool {
        node == self.ctx.local_node
    }
}

impl Pool for DhtPool {
    fn publish(&self, key: Key, ldo: DataObject, behavior: BehaviorFlags) -> Result<ObjectInfo> {
        let target = self.spot(&key);
        if self.is_local(target) {
            let iom = if behavior.contains(BehaviorFlags::WRITE_TO_IOM) {
                self.ctx.default_iom.as_ref()
            } else {
                None
            };
            self.ctx.localkv.put(self.bucket, &key, ldo, behavior, iom)
        } else {
            let ctx = self.ctx.clone();
            let bucket = self.bucket;
            let remote_behavior = behavior.rebase_to_remote();
            block_on(move |cb| {
                ops::publish::spawn(&ctx, target, bucket, key, ldo, remote_behavior, 0, cb);
            })
        }
    }

    fn get_bounded(&self, key: Key, landing: DataObject) -> Result<ObjectInfo> {
        let target = self.spot(&key);
        if self.is_local(target) {
            match self.ctx.localkv.get(self.bucket, &key, None)? {
                GetOutcome::Available { ldo, info } => {
                    landing.overwrite_body(&ldo.meta()?, &ldo.data()?)?;
                    Ok(info)
                }
                GetOutcome::Waiting => unreachable!("a local get with no waiting mailbox never returns Waiting"),
            }
        } else {
            let ctx = self.ctx.clone();
            let bucket = self.bucket;
            block_on(move |cb| {
                ops::get_bounded::spawn(&ctx, target, bucket, key, landing, cb);
            })
        }
    }

    fn get_unbounded(&self, key: Key) -> Result<(DataObject, ObjectInfo)> {
        let target = self.spot(&key);
        if self.is_local(target) {
            match self.ctx.localkv.get(self.bucket, &key, None)? {
                GetOutcome::Available { ldo, info } => Ok((ldo, info)),
                GetOutcome::Waiting => unreachable!("a local get with no waiting mailbox never returns Waiting"),
            }
        } else {
            let ctx = self.ctx.clone();
            let bucket = self.bucket;
            block_on(move |cb| {
                ops::get_unbounded::spawn(&ctx, target, bucket, key, cb);
            })
        }
    }

    fn col_info(&self, key: Key) -> Result<ObjectInfo> {
        let target = self.spot(&key);
        if self.is_local(target) {
            self.ctx.localkv.info(self.bucket, &key, self.ctx.default_iom.as_ref())
        } else {
            let ctx = self.ctx.clone();
            let bucket = self.bucket;
            block_on(move |cb| {
                ops::info::spawn_col_info(&ctx, target, bucket, key, cb);
            })
        }
    }

    /// No single member owns a wildcarded row, so every member is asked
    /// and the per-member `ObjectInfo`s are summed/aggregated here the
    /// same way `LocalKv::info` aggregates per-cell results within one
    /// node (spec §4.6, §9's `MixedConditions` reading).
    fn row_info(&self, key_pattern: Key) -> Result<ObjectInfo> {
        let mut row_user_bytes = 0u64;
        let mut col_user_bytes = 0u64;
        let mut row_num_columns = 0u32;
        let mut col_dependencies = 0u32;
        let mut availabilities = Vec::new();

        for &member in &self.members {
            let result = if self.is_local(member) {
                self.ctx.localkv.info(self.bucket, &key_pattern, self.ctx.default_iom.as_ref())
            } else {
                let ctx = self.ctx.clone();
                let bucket = self.bucket;
                let key_pattern = key_pattern.clone();
                block_on(move |cb| {
                    ops::info::spawn_row_info(&ctx, member, bucket, key_pattern, cb);
                })
            };
            match result {
                Ok(info) => {
                    row_user_bytes += info.row_user_bytes;
                    col_user_bytes += info.col_user_bytes;
                    row_num_columns += info.row_num_columns;
                    col_dependencies += info.col_dependencies;
                    availabilities.push(info.col_availability);
                }
                Err(e) if e.to_rc() == crate::error::rc::ENOENT => continue,
                Err(e) => return Err(e),
            }
        }

        if availabilities.is_empty() {
            return Err(crate::error::ProtocolError::NotFound.into());
        }

        Ok(ObjectInfo {
            row_user_bytes,
            col_user_bytes,
            row_num_columns,
            col_dependencies,
            col_availability: Availability::aggregate(availabilities),
        })
    }

    fn list(&self, key_pattern: Key) -> Result<Vec<ListEntry>> {
        let mut out = Vec::new();
        for &member in &self.members {
            let result = if self.is_local(member) {
                self.ctx
                    .localkv
                    .list(self.bucket, &key_pattern, self.ctx.default_iom.as_ref())
                    .map(|matches| matches.into_iter().map(|(key, size)| ListEntry { key, size }).collect::<Vec<_>>())
            } else {
                let ctx = self.ctx.clone();
                let bucket = self.bucket;
                let key_pattern = key_pattern.clone();
                block_on(move |cb| {
                    ops::list::spawn(&ctx, member, bucket, key_pattern, cb);
                })
            };
            out.extend(result?);
        }
        Ok(out)
    }

    fn drop(&self, key_pattern: Key) -> Result<usize> {
        let mut total = 0usize;
        for &member in &self.members {
            let removed = if self.is_local(member) {
                self.ctx.localkv.drop(self.bucket, &key_pattern)?
            } else {
                let ctx = self.ctx.clone();
                let bucket = self.bucket;
                let key_pattern = key_pattern.clone();
                block_on(move |cb| {
                    ops::drop_op::spawn(&ctx, member, bucket, key_pattern, cb);
                })?
            };
            total += removed;
        }
        Ok(total)
    }

    fn compute(&self, key: Key, fn_name: String, fn_args: Vec<u8>) -> Result<(DataObject, ObjectInfo)> {
        let target = self.spot(&key);
        if self.is_local(target) {
            match self.ctx.localkv.get(self.bucket, &key, None)? {
                GetOutcome::Available { ldo, .. } => {
                    let function = ops::compute::COMPUTE_REGISTRY
                        .get(&fn_name)
                        .ok_or_else(|| -> crate::error::Error { crate::error::ProtocolError::NoSuchFunction.into() })?;
                    let result = function(&ldo, &fn_args)?;
                    let size = result.header()?.meta_plus_data() as u64;
                    let info = ObjectInfo {
                        row_user_bytes: size,
                        col_user_bytes: size,
                        row_num_columns: 1,
                        col_dependencies: 0,
                        col_availability: Availability::InLocalMemory,
                    };
                    Ok((result, info))
                }
                GetOutcome::Waiting => unreachable!("a local get with no waiting mailbox never returns Waiting"),
            }
        } else {
            let ctx = self.ctx.clone();
            let bucket = self.bucket;
            block_on(move |cb| {
                ops::compute::spawn(&ctx, target, bucket, key, fn_name, fn_args, cb);
            })
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

    fn single_node_pool() -> Arc<DhtPool> {
        let network = LoopbackNetwork::new();
        let transport = Arc::new(network.register(NodeId::from_raw(1)));
        let worker = Backburner::new(2, Wakeup::SleepMs(1));
        let op_engine = Arc::new(OpEngine::new());
        let localkv = Arc::new(LocalKv::new(worker.clone(), op_engine.clone()));
        let ioms = Arc::new(IomRegistry::new());
        let ctx = Context::new(transport, op_engine, localkv, worker, ioms, None);
        ops::register_all_target_factories(&ctx);
        DhtPool::new(ctx, Bucket::new("test"), vec![NodeId::from_raw(1)]).unwrap()
    }

    fn heap_ldo(bytes: &[u8]) -> DataObject {
        DataObject::new(b"", bytes, Arc::new(HeapAllocator::new()), 0).unwrap()
    }

    #[test]
    fn publish_then_row_info_on_single_member() {
        let pool = single_node_pool();
        let key = Key::new("row");
        pool.publish(key.clone(), heap_ldo(b"hello"), BehaviorFlags::DEFAULT_LOCAL).unwrap();

        let info = pool.row_info(Key::new("row*")).unwrap();
        assert_eq!(info.row_num_columns, 1);
        assert_eq!(info.col_user_bytes, 5);
    }

    #[test]
    fn drop_removes_published_key() {
        let pool = single_node_pool();
        let key = Key::new("gone");
        pool.publish(key.clone(), heap_ldo(b"x"), BehaviorFlags::DEFAULT_LOCAL).unwrap();
        assert_eq!(pool.drop(key.clone()).unwrap(), 1);
        assert!(pool.col_info(key).is_err());
    }

    #[test]
    fn list_row_wildcard_finds_published_rows() {
        let pool = single_node_pool();
        pool.publish(Key::new("row1"), heap_ldo(b"a"), BehaviorFlags::DEFAULT_LOCAL).unwrap();
        pool.publish(Key::new("row2"), heap_ldo(b"bb"), BehaviorFlags::DEFAULT_LOCAL).unwrap();

        let entries = pool.list(Key::new("row*")).unwrap();
        assert_eq!(entries.len(), 2);
    }

    #[test]
    fn compute_byte_length_on_published_value() {
        let pool = single_node_pool();
        let key = Key::new("row");
        pool.publish(key.clone(), heap_ldo(b"hello"), BehaviorFlags::DEFAULT_LOCAL).unwrap();

        let (result, _info) = pool.compute(key, "byte_length".to_string(), Vec::new()).unwrap();
        assert_eq!(result.data().unwrap(), 5u64.to_le_bytes());
    }
}
