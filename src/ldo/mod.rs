//! DataObject (LDO): a reference-counted, header/meta/data buffer
//! registered for RDMA (spec §3, §4.1). Grounded in
//! `original_source/src/lunasa/DataObject.hh`; the split between the
//! "local header" (refcount, pin cookie — never on the wire) and the
//! on-wire `{header, meta, data}` segment mirrors
//! `InternalDataObject`/`DataObjectPacker` there.
pub mod allocator;

use std::fmt;
use std::io::{Read, Write};
use std::sync::{Arc, Mutex};

use byteorder::{ByteOrder, LittleEndian};

use crate::error::{ProtocolError, Result};
use allocator::{Allocator, HeapAllocator, PinCookie};

/// On-wire header: `{tag: u16, meta_size: u16, data_size: u32}`,
/// little-endian, 8 bytes (spec §4.1).
pub const HEADER_SIZE: usize = 8;
pub const MAX_META_SIZE: usize = u16::MAX as usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub tag: u16,
    pub meta_size: u16,
    pub data_size: u32,
}

impl Header {
    pub fn to_bytes(self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        LittleEndian::write_u16(&mut buf[0..2], self.tag);
        LittleEndian::write_u16(&mut buf[2..4], self.meta_size);
        LittleEndian::write_u32(&mut buf[4..8], self.data_size);
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_SIZE {
            return Err(ProtocolError::BadRpc("LDO header shorter than 8 bytes").into());
        }
        Ok(Header {
            tag: LittleEndian::read_u16(&buf[0..2]),
            meta_size: LittleEndian::read_u16(&buf[2..4]),
            data_size: LittleEndian::read_u32(&buf[4..8]),
        })
    }

    pub fn meta_plus_data(&self) -> usize {
        self.meta_size as usize + self.data_size as usize
    }
}

/// One RDMA-registered range returned by `GetRdmaHandles` (spec §4.1).
#[derive(Debug, Clone, Copy)]
pub struct Segment {
    pub handle: PinCookie,
    pub offset: u32,
    pub size: u32,
}

enum Storage {
    /// `{header, meta, data}` as one contiguous allocation. `capacity`
    /// is the meta+data room the buffer was given at construction.
    Contiguous { buf: Vec<u8>, capacity: usize },
    /// Caller-owned meta/data memory wrapped without copying;
    /// necessarily non-contiguous with each other, recorded as two
    /// RDMA segments (spec §4.1, third constructor).
    Wrapped { meta: Vec<u8>, data: Vec<u8> },
}

struct Inner {
    header: Mutex<Header>,
    storage: Mutex<Storage>,
    pin: Mutex<Option<PinCookie>>,
    allocator: Arc<dyn Allocator>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(cookie) = self.pin.lock().unwrap().take() {
            self.allocator.unpin(cookie);
        }
    }
}

/// A reference-counted handle to a `{header, meta, data}` allocation.
///
/// Cloning increments the refcount (plain `Arc::clone`); dropping the
/// last clone releases the allocation back to its allocator. The
/// "null" LDO carries no allocation at all and is `DataObject(None)`,
/// so move semantics ("move transfers refcount, leaving source null")
/// fall out of ordinary Rust ownership rather than needing a hand-
/// rolled null-the-source step.
#[derive(Clone)]
pub struct DataObject(Option<Arc<Inner>>);

impl DataObject {
    /// `(meta, data, allocator, tag)`: allocate exactly
    /// `meta.len() + data.len()` bytes.
    pub fn new(meta: &[u8], data: &[u8], allocator: Arc<dyn Allocator>, tag: u16) -> Result<Self> {
        Self::with_capacity(meta.len() + data.len(), meta, data, allocator, tag)
    }

    /// `(capacity, meta, data, allocator, tag)`: reserve `capacity`
    /// bytes of meta+data room up front, so later `modify_user_sizes`
    /// calls can grow in place.
    pub fn with_capacity(
        capacity: usize,
        meta: &[u8],
        data: &[u8],
        allocator: Arc<dyn Allocator>,
        tag: u16,
    ) -> Result<Self> {
        if meta.len() > MAX_META_SIZE || meta.len() + data.len() > capacity {
            return Err(ProtocolError::SizeOverflow.into());
        }
        let header = Header {
            tag,
            meta_size: meta.len() as u16,
            data_size: data.len() as u32,
        };
        let mut buf = allocator.allocate(HEADER_SIZE + capacity);
        buf[..HEADER_SIZE].copy_from_slice(&header.to_bytes());
        buf[HEADER_SIZE..HEADER_SIZE + meta.len()].copy_from_slice(meta);
        buf[HEADER_SIZE + meta.len()..HEADER_SIZE + meta.len() + data.len()].copy_from_slice(data);

        Ok(DataObject(Some(Arc::new(Inner {
            header: Mutex::new(header),
            storage: Mutex::new(Storage::Contiguous { buf, capacity }),
            pin: Mutex::new(None),
            allocator,
        }))))
    }

    /// `(user_buffer, meta, data, free_fn)`: wrap caller memory without
    /// copying the data section. Recorded as two RDMA segments since
    /// meta and data are not guaranteed to sit in one range.
    pub fn wrap_user_buffer(meta: Vec<u8>, data: Vec<u8>, allocator: Arc<dyn Allocator>, tag: u16) -> Result<Self> {
        if meta.len() > MAX_META_SIZE {
            return Err(ProtocolError::SizeOverflow.into());
        }
        let header = Header {
            tag,
            meta_size: meta.len() as u16,
            data_size: data.len() as u32,
        };
        Ok(DataObject(Some(Arc::new(Inner {
            header: Mutex::new(header),
            storage: Mutex::new(Storage::Wrapped { meta, data }),
            pin: Mutex::new(None),
            allocator,
        }))))
    }

    /// The "null" LDO: no allocation. Used for not-yet-arrived data and
    /// as a cell's default contents (spec §3, Cell).
    pub fn null() -> Self {
        DataObject(None)
    }

    pub fn is_null(&self) -> bool {
        self.0.is_none()
    }

    fn inner(&self) -> Result<&Inner> {
        self.0
            .as_deref()
            .ok_or_else(|| ProtocolError::InvalidArgument("operation on a null LDO").into())
    }

    pub fn header(&self) -> Result<Header> {
        Ok(*self.inner()?.header.lock().unwrap())
    }

    pub fn tag(&self) -> Result<u16> {
        Ok(self.header()?.tag)
    }

    /// Number of live handles to this allocation.
    pub fn refcount(&self) -> usize {
        self.0.as_ref().map(Arc::strong_count).unwrap_or(0)
    }

    /// `ModifyUserSizes`: succeeds iff `new_meta+new_data <= capacity`;
    /// fails without mutating on overflow. Only a contiguous LDO has
    /// spare capacity to grow into.
    pub fn modify_user_sizes(&self, new_meta: usize, new_data: usize) -> Result<()> {
        let inner = self.inner()?;
        let storage = inner.storage.lock().unwrap();
        match &*storage {
            Storage::Contiguous { capacity, .. } => {
                if new_meta > MAX_META_SIZE || new_meta + new_data > *capacity {
                    return Err(ProtocolError::SizeOverflow.into());
                }
                let mut header = inner.header.lock().unwrap();
                header.meta_size = new_meta as u16;
                header.data_size = new_data as u32;
                Ok(())
            }
            Storage::Wrapped { .. } => {
                Err(ProtocolError::InvalidArgument("cannot resize a wrapped LDO").into())
            }
        }
    }

    /// Overwrite the meta/data region in place, used by a transport
    /// landing an RDMA Get/Put into a pre-allocated LDO. Not part of
    /// the spec's DataObject API proper; it is how this crate's
    /// in-process transport moves bytes without real RDMA hardware.
    pub fn overwrite_body(&self, meta: &[u8], data: &[u8]) -> Result<()> {
        let inner = self.inner()?;
        let mut storage = inner.storage.lock().unwrap();
        match &mut *storage {
            Storage::Contiguous { buf, capacity } => {
                if meta.len() > MAX_META_SIZE || meta.len() + data.len() > *capacity {
                    return Err(ProtocolError::SizeOverflow.into());
                }
                buf[HEADER_SIZE..HEADER_SIZE + meta.len()].copy_from_slice(meta);
                buf[HEADER_SIZE + meta.len()..HEADER_SIZE + meta.len() + data.len()].copy_from_slice(data);
                let mut header = inner.header.lock().unwrap();
                header.meta_size = meta.len() as u16;
                header.data_size = data.len() as u32;
                Ok(())
            }
            Storage::Wrapped { meta: m, data: d } => {
                *m = meta.to_vec();
                *d = data.to_vec();
                let mut header = inner.header.lock().unwrap();
                header.meta_size = meta.len() as u16;
                header.data_size = data.len() as u32;
                Ok(())
            }
        }
    }

    /// `GetBasePtr`: the full on-wire segment, `{header, meta, data}`.
    /// A wrapped LDO has no single contiguous range, so this assembles
    /// one on demand.
    pub fn base_bytes(&self) -> Result<Vec<u8>> {
        let inner = self.inner()?;
        let header = *inner.header.lock().unwrap();
        let storage = inner.storage.lock().unwrap();
        match &*storage {
            Storage::Contiguous { buf, .. } => Ok(buf[..HEADER_SIZE + header.meta_plus_data()].to_vec()),
            Storage::Wrapped { meta, data } => {
                let mut out = Vec::with_capacity(HEADER_SIZE + meta.len() + data.len());
                out.extend_from_slice(&header.to_bytes());
                out.extend_from_slice(meta);
                out.extend_from_slice(data);
                Ok(out)
            }
        }
    }

    /// `GetMetaPtr`.
    pub fn meta(&self) -> Result<Vec<u8>> {
        let inner = self.inner()?;
        let header = *inner.header.lock().unwrap();
        let storage = inner.storage.lock().unwrap();
        match &*storage {
            Storage::Contiguous { buf, .. } => {
                Ok(buf[HEADER_SIZE..HEADER_SIZE + header.meta_size as usize].to_vec())
            }
            Storage::Wrapped { meta, .. } => Ok(meta.clone()),
        }
    }

    /// `GetDataPtr`.
    pub fn data(&self) -> Result<Vec<u8>> {
        let inner = self.inner()?;
        let header = *inner.header.lock().unwrap();
        let storage = inner.storage.lock().unwrap();
        match &*storage {
            Storage::Contiguous { buf, .. } => {
                let start = HEADER_SIZE + header.meta_size as usize;
                Ok(buf[start..start + header.data_size as usize].to_vec())
            }
            Storage::Wrapped { data, .. } => Ok(data.clone()),
        }
    }

    /// `GetWireSize = header + meta + data`.
    pub fn wire_size(&self) -> Result<usize> {
        Ok(HEADER_SIZE + self.header()?.meta_plus_data())
    }

    /// `writeToFile`: bit-exact `{header, meta, data}`.
    pub fn write_to_file<W: Write>(&self, mut w: W) -> Result<()> {
        w.write_all(&self.base_bytes()?)?;
        Ok(())
    }

    /// `readFromFile`/`LoadFromFile`: reads the header first, then
    /// sizes the allocation accordingly.
    pub fn read_from_file<R: Read>(mut r: R, allocator: Arc<dyn Allocator>) -> Result<Self> {
        let mut header_buf = [0u8; HEADER_SIZE];
        r.read_exact(&mut header_buf)?;
        let header = Header::from_bytes(&header_buf)?;
        let mut body = vec![0u8; header.meta_plus_data()];
        r.read_exact(&mut body)?;
        let (meta, data) = body.split_at(header.meta_size as usize);
        DataObject::new(meta, data, allocator, header.tag)
    }

    pub fn load_from_file(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let f = std::fs::File::open(path)?;
        Self::read_from_file(f, Arc::new(HeapAllocator::new()))
    }

    /// `GetRdmaHandles`: 1 segment for a contiguous allocation, 2 for a
    /// wrapped one. Pins lazily on first call.
    pub fn rdma_handles(&self) -> Result<Vec<Segment>> {
        let inner = self.inner()?;
        let header = *inner.header.lock().unwrap();
        let storage = inner.storage.lock().unwrap();
        match &*storage {
            Storage::Contiguous { buf, .. } => {
                let size = HEADER_SIZE + header.meta_plus_data();
                let handle = self.pin_whole(inner, buf.as_ptr(), size);
                Ok(vec![Segment { handle, offset: 0, size: size as u32 }])
            }
            Storage::Wrapped { meta, data } => {
                let meta_handle = inner.allocator.pin(meta.as_ptr(), meta.len());
                let data_handle = inner.allocator.pin(data.as_ptr(), data.len());
                Ok(vec![
                    Segment { handle: meta_handle, offset: 0, size: meta.len() as u32 },
                    Segment { handle: data_handle, offset: 0, size: data.len() as u32 },
                ])
            }
        }
    }

    fn pin_whole(&self, inner: &Inner, base: *const u8, len: usize) -> PinCookie {
        let mut pin = inner.pin.lock().unwrap();
        if let Some(cookie) = *pin {
            return cookie;
        }
        let cookie = inner.allocator.pin(base, len);
        *pin = Some(cookie);
        cookie
    }
}

impl fmt::Debug for DataObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0 {
            None => write!(f, "DataObject(null)"),
            Some(inner) => {
                let header = *inner.header.lock().unwrap();
                write!(
                    f,
                    "DataObject {{ tag: {}, meta_size: {}, data_size: {}, refcount: {} }}",
                    header.tag,
                    header.meta_size,
                    header.data_size,
                    Arc::strong_count(inner)
                )
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn heap() -> Arc<dyn Allocator> {
        Arc::new(HeapAllocator::new())
    }

    #[test]
    fn new_exposes_meta_and_data() {
        let ldo = DataObject::new(b"meta", b"hello world", heap(), 7).unwrap();
        assert_eq!(ldo.meta().unwrap(), b"meta");
        assert_eq!(ldo.data().unwrap(), b"hello world");
        assert_eq!(ldo.tag().unwrap(), 7);
        assert_eq!(ldo.wire_size().unwrap(), HEADER_SIZE + 4 + 11);
    }

    #[test]
    fn modify_user_sizes_succeeds_within_capacity() {
        let ldo = DataObject::with_capacity(32, b"m", b"d", heap(), 1).unwrap();
        ldo.modify_user_sizes(2, 10).unwrap();
        let header = ldo.header().unwrap();
        assert_eq!(header.meta_size, 2);
        assert_eq!(header.data_size, 10);
    }

    #[test]
    fn modify_user_sizes_rejects_overflow_without_mutating() {
        let ldo = DataObject::with_capacity(8, b"m", b"d", heap(), 1).unwrap();
        assert!(ldo.modify_user_sizes(100, 100).is_err());
        let header = ldo.header().unwrap();
        assert_eq!(header.meta_size, 1);
        assert_eq!(header.data_size, 1);
    }

    #[test]
    fn write_then_read_roundtrips_bit_exact() {
        let ldo = DataObject::new(b"meta-bytes", b"payload-bytes", heap(), 42).unwrap();
        let mut file = Vec::new();
        ldo.write_to_file(&mut file).unwrap();

        let reloaded = DataObject::read_from_file(Cursor::new(file), heap()).unwrap();
        assert_eq!(reloaded.tag().unwrap(), 42);
        assert_eq!(reloaded.meta().unwrap(), b"meta-bytes");
        assert_eq!(reloaded.data().unwrap(), b"payload-bytes");
    }

    #[test]
    fn clone_increments_refcount() {
        let ldo = DataObject::new(b"", b"x", heap(), 0).unwrap();
        assert_eq!(ldo.refcount(), 1);
        let second = ldo.clone();
        assert_eq!(ldo.refcount(), 2);
        drop(second);
        assert_eq!(ldo.refcount(), 1);
    }

    #[test]
    fn contiguous_ldo_has_one_rdma_segment() {
        let ldo = DataObject::new(b"m", b"d", heap(), 0).unwrap();
        assert_eq!(ldo.rdma_handles().unwrap().len(), 1);
    }

    #[test]
    fn wrapped_ldo_has_two_rdma_segments() {
        let ldo = DataObject::wrap_user_buffer(b"m".to_vec(), b"d".to_vec(), heap(), 0).unwrap();
        assert_eq!(ldo.rdma_handles().unwrap().len(), 2);
    }

    #[test]
    fn overwrite_body_lands_new_bytes() {
        let ldo = DataObject::with_capacity(32, b"", b"", heap(), 0).unwrap();
        ldo.overwrite_body(b"m2", b"landed data").unwrap();
        assert_eq!(ldo.meta().unwrap(), b"m2");
        assert_eq!(ldo.data().unwrap(), b"landed data");
    }

    #[test]
    fn null_ldo_rejects_accessors() {
        let ldo = DataObject::null();
        assert!(ldo.is_null());
        assert!(ldo.meta().is_err());
        assert!(ldo.header().is_err());
    }
}
