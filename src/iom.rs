//! The IOM (I/O Module) interface the core calls into for optional
//! persistence, plus a name→driver registry (spec §1, §6;
//! SPEC_FULL.md "IOM registry"). Grounded in
//! `original_source/src/kelpie/ioms/IomBase.hh` and `IomRegistry.cpp`
//! — the registry's `register_iom_constructor` extension point and
//! the debug in-memory driver both carry over; on-disk/DB drivers do
//! not (explicitly out of scope, spec §1).
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use crate::bucket::Bucket;
use crate::error::{ProtocolError, Result};
use crate::key::Key;
use crate::ldo::DataObject;
use crate::object_info::{Availability, ObjectInfo};

/// The interface the core calls into (spec §6: "IOM interface
/// (consumed)"). Implementations own whatever persistent medium they
/// wrap; the core only ever calls these four operations.
pub trait Iom: Send + Sync {
    fn write_object(&self, bucket: Bucket, key: &Key, ldo: &DataObject) -> Result<()>;
    fn read_object(&self, bucket: Bucket, key: &Key) -> Result<DataObject>;
    fn get_info(&self, bucket: Bucket, key: &Key) -> Result<ObjectInfo>;
    fn finish(&self) -> Result<()>;
}

type IomConstructor = dyn Fn(&str) -> Arc<dyn Iom> + Send + Sync;

/// Name → driver-constructor map (spec's IOM Registry component).
#[derive(Default)]
pub struct IomRegistry {
    constructors: RwLock<HashMap<String, Arc<IomConstructor>>>,
    instances: RwLock<HashMap<String, Arc<dyn Iom>>>,
}

impl IomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_iom_constructor<F>(&self, driver_name: &str, constructor: F)
    where
        F: Fn(&str) -> Arc<dyn Iom> + Send + Sync + 'static,
    {
        self.constructors
            .write()
            .unwrap()
            .insert(driver_name.to_string(), Arc::new(constructor));
    }

    /// Instantiate (or reuse a cached instance of) the named IOM,
    /// keyed by its fully-qualified reference string (e.g. a
    /// `ResourceUrl` pointing at it).
    pub fn get_or_create(&self, driver_name: &str, reference: &str) -> Result<Arc<dyn Iom>> {
        if let Some(existing) = self.instances.read().unwrap().get(reference) {
            return Ok(existing.clone());
        }
        let ctor = self
            .constructors
            .read()
            .unwrap()
            .get(driver_name)
            .cloned()
            .ok_or(ProtocolError::NoSuchIom)?;
        let instance = ctor(reference);
        self.instances.write().unwrap().insert(reference.to_string(), instance.clone());
        Ok(instance)
    }
}

/// The debug driver: an in-memory map standing in for a real
/// persistence backend, used to exercise write-through/read-miss
/// paths without a filesystem or database (SPEC_FULL.md supplement).
#[derive(Default)]
pub struct MemoryIom {
    entries: Mutex<HashMap<(Bucket, Key), Vec<u8>>>,
}

impl MemoryIom {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn constructor(_reference: &str) -> Arc<dyn Iom> {
        Arc::new(MemoryIom::new())
    }
}

impl Iom for MemoryIom {
    fn write_object(&self, bucket: Bucket, key: &Key, ldo: &DataObject) -> Result<()> {
        let bytes = ldo.base_bytes()?;
        self.entries.lock().unwrap().insert((bucket, key.clone()), bytes);
        Ok(())
    }

    fn read_object(&self, bucket: Bucket, key: &Key) -> Result<DataObject> {
        let entries = self.entries.lock().unwrap();
        let bytes = entries.get(&(bucket, key.clone())).ok_or(ProtocolError::NotFound)?;
        DataObject::read_from_file(std::io::Cursor::new(bytes.clone()), Arc::new(crate::ldo::allocator::HeapAllocator::new()))
    }

    fn get_info(&self, bucket: Bucket, key: &Key) -> Result<ObjectInfo> {
        let entries = self.entries.lock().unwrap();
        match entries.get(&(bucket, key.clone())) {
            Some(bytes) => {
                let header = crate::ldo::Header::from_bytes(bytes)?;
                Ok(ObjectInfo {
                    row_user_bytes: header.meta_plus_data() as u64,
                    col_user_bytes: header.data_size as u64,
                    row_num_columns: 1,
                    col_dependencies: 0,
                    col_availability: Availability::InDisk,
                })
            }
            None => Ok(ObjectInfo::default()),
        }
    }

    fn finish(&self) -> Result<()> {
        Ok(())
    }
}
