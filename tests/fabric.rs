//! End-to-end scenarios exercising a two-node fabric through the
//! `Pool` trait: publish/get across a hash-distributed membership,
//! want-before-publish, EEXIST semantics, row-wildcard list, drop with
//! an outstanding waiter, and a round trip through an on-disk LDO.
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use meshkv::bucket::Bucket;
use meshkv::iom::IomRegistry;
use meshkv::key::Key;
use meshkv::ldo::allocator::HeapAllocator;
use meshkv::ldo::DataObject;
use meshkv::localkv::LocalKv;
use meshkv::node::NodeId;
use meshkv::opengine::OpEngine;
use meshkv::ops;
use meshkv::pool::{BehaviorFlags, DhtPool, Pool};
use meshkv::transport::LoopbackNetwork;
use meshkv::worker::{Backburner, Wakeup};
use meshkv::Context;

/// Two nodes sharing one `LoopbackNetwork`, each with its own `Context`
/// and a `DhtPool` bound to the same two-member list and bucket — so a
/// call issued from either pool may resolve locally or remotely
/// depending on which row a key happens to hash to.
struct Fabric {
    pool_a: Arc<DhtPool>,
    pool_b: Arc<DhtPool>,
}

fn build_fabric() -> Fabric {
    let network = LoopbackNetwork::new();
    let node_a = NodeId::from_raw(1);
    let node_b = NodeId::from_raw(2);
    let bucket = Bucket::new("fabric_test");

    let ctx_a = build_context(&network, node_a);
    let ctx_b = build_context(&network, node_b);

    let members = vec![node_a, node_b];
    let pool_a = DhtPool::new(ctx_a, bucket, members.clone()).unwrap();
    let pool_b = DhtPool::new(ctx_b, bucket, members).unwrap();

    Fabric { pool_a, pool_b }
}

fn build_context(network: &LoopbackNetwork, node: NodeId) -> Arc<Context> {
    let transport = Arc::new(network.register(node));
    let worker = Backburner::new(2, Wakeup::SleepMs(1));
    let op_engine = Arc::new(OpEngine::new());
    let localkv = Arc::new(LocalKv::new(worker.clone(), op_engine.clone()));
    let ioms = Arc::new(IomRegistry::new());
    let ctx = Context::new(transport, op_engine, localkv, worker, ioms, None);
    ops::register_all_target_factories(&ctx);
    ctx
}

fn heap_ldo(bytes: &[u8]) -> DataObject {
    DataObject::new(b"", bytes, Arc::new(HeapAllocator::new()), 0).unwrap()
}

#[test]
fn publish_then_need() {
    let fabric = build_fabric();
    let key = Key::new("publish_then_need");

    fabric
        .pool_a
        .publish(key.clone(), heap_ldo(b"payload"), BehaviorFlags::DEFAULT_REMOTE)
        .unwrap();

    let (ldo, info) = fabric.pool_b.get_unbounded(key).unwrap();
    assert_eq!(ldo.data().unwrap(), b"payload");
    assert_eq!(info.col_user_bytes, 7);
}

#[test]
fn want_before_publish() {
    let fabric = build_fabric();
    let key = Key::new("want_before_publish");

    let waiter_pool = fabric.pool_b.clone();
    let waiter_key = key.clone();
    let waiter = thread::spawn(move || waiter_pool.get_unbounded(waiter_key));

    // Give the get a moment to register as a waiter on whichever member
    // owns this row before the publish lands.
    thread::sleep(Duration::from_millis(100));

    fabric
        .pool_a
        .publish(key, heap_ldo(b"arrived late"), BehaviorFlags::DEFAULT_REMOTE)
        .unwrap();

    let (ldo, _info) = waiter.join().unwrap().unwrap();
    assert_eq!(ldo.data().unwrap(), b"arrived late");
}

#[test]
fn publish_without_overwrite_rejects_duplicate() {
    let fabric = build_fabric();
    let key = Key::new("no_overwrite");

    fabric
        .pool_a
        .publish(key.clone(), heap_ldo(b"first"), BehaviorFlags::DEFAULT_REMOTE)
        .unwrap();

    let err = fabric
        .pool_a
        .publish(key, heap_ldo(b"second"), BehaviorFlags::DEFAULT_REMOTE)
        .unwrap_err();
    assert_eq!(err.to_rc(), meshkv::error::rc::EEXIST);
}

#[test]
fn row_wildcard_list_across_the_fabric() {
    let fabric = build_fabric();

    for (row, payload) in [("wild1", b"a" as &[u8]), ("wild2", b"bb"), ("wild3", b"ccc")] {
        fabric
            .pool_a
            .publish(Key::new(row), heap_ldo(payload), BehaviorFlags::DEFAULT_REMOTE)
            .unwrap();
    }

    let mut entries = fabric.pool_b.list(Key::new("wild*")).unwrap();
    entries.sort_by(|a, b| a.key.cmp(&b.key));
    assert_eq!(entries.len(), 3);
    assert_eq!(entries[0].size, 1);
    assert_eq!(entries[2].size, 3);
}

#[test]
fn drop_defers_while_a_waiter_is_outstanding_then_delivers() {
    let fabric = build_fabric();
    let key = Key::new("drop_with_waiter");

    let waiter_pool = fabric.pool_b.clone();
    let waiter_key = key.clone();
    let waiter = thread::spawn(move || waiter_pool.get_unbounded(waiter_key));
    thread::sleep(Duration::from_millis(100));

    // A cell with an outstanding waiter is not removed immediately.
    let removed = fabric.pool_a.drop(key.clone()).unwrap();
    assert_eq!(removed, 0);

    // Publishing afterward still satisfies the waiter; the deferred
    // drop collects the cell once its waiter list empties.
    fabric
        .pool_a
        .publish(key, heap_ldo(b"satisfies the waiter"), BehaviorFlags::DEFAULT_REMOTE)
        .unwrap();

    let (ldo, _info) = waiter.join().unwrap().unwrap();
    assert_eq!(ldo.data().unwrap(), b"satisfies the waiter");

    // The deferred drop actually collected the cell, not just the waiter.
    assert!(fabric.pool_a.col_info(key).is_err());
}

#[test]
fn round_trip_through_a_file() {
    let original = heap_ldo(b"round trip me");
    let path = std::env::temp_dir().join(format!("meshkv_test_{}.ldo", std::process::id()));

    {
        let f = std::fs::File::create(&path).unwrap();
        original.write_to_file(f).unwrap();
    }

    let loaded = DataObject::load_from_file(&path).unwrap();
    assert_eq!(loaded.data().unwrap(), original.data().unwrap());
    assert_eq!(loaded.header().unwrap(), original.header().unwrap());

    std::fs::remove_file(&path).unwrap();
}
