//! `Bucket`: a 32-bit namespace salt that partitions the global keyspace.
//! Grounded in `faodel::Bucket` / `StringHelpers::const_hash32` — the
//! classic djb2 hash (`5381`, `hash*33 + c`).
use std::fmt;

/// Value reserved to mean "unspecified" (spec §3).
pub const BUCKET_UNSPECIFIED: u32 = 0;

/// djb2 seed, matching `internal::BUCKET_NULL_VAL` in the original.
const DJB2_SEED: u32 = 5381;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Bucket(u32);

impl Bucket {
    pub const UNSPECIFIED: Bucket = Bucket(BUCKET_UNSPECIFIED);

    /// Build a bucket from a raw 32-bit id, e.g. one received over the wire.
    pub fn from_raw(id: u32) -> Self {
        Bucket(id)
    }

    /// Either parse a `0x...` literal or djb2-hash the namespace string,
    /// matching `faodel::UnpackHash32`.
    pub fn new(namespace: &str) -> Self {
        if let Some(hex) = namespace.strip_prefix("0x").or_else(|| namespace.strip_prefix("0X")) {
            if let Ok(v) = u32::from_str_radix(hex, 16) {
                return Bucket(v);
            }
        }
        Bucket(djb2(namespace))
    }

    pub fn id(&self) -> u32 {
        self.0
    }

    pub fn is_unspecified(&self) -> bool {
        self.0 == BUCKET_UNSPECIFIED
    }

    pub fn to_hex(&self) -> String {
        format!("0x{:08x}", self.0)
    }
}

impl Default for Bucket {
    fn default() -> Self {
        Bucket::UNSPECIFIED
    }
}

impl fmt::Display for Bucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl From<u32> for Bucket {
    fn from(id: u32) -> Self {
        Bucket(id)
    }
}

/// djb2: `hash = 5381; for c in s { hash = hash*33 + c }`
pub fn djb2(s: &str) -> u32 {
    s.bytes()
        .fold(DJB2_SEED, |hash, b| hash.wrapping_mul(33).wrapping_add(b as u32))
}

/// djb2 salted with a bucket, used by the DHT pool's placement function
/// (spec §4.6): two processes must compute the same placement index for
/// the same `(bucket, row)` and member-list length.
pub fn djb2_salted(bucket: Bucket, s: &str) -> u32 {
    let seeded = s
        .bytes()
        .fold(bucket.id() ^ DJB2_SEED, |hash, b| hash.wrapping_mul(33).wrapping_add(b as u32));
    seeded
}
