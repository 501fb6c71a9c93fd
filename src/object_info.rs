//! `Availability` and `ObjectInfo`: the per-cell/per-row report used by
//! both the local API and the Info/RowInfo wire messages (spec §3, §4.5).
//! Grounded in `original_source/src/kelpie/common/Types.hh`.
use byteorder::{ByteOrder, LittleEndian};
use std::fmt;

use crate::error::{ProtocolError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum Availability {
    Unavailable = 0,
    Requested = 1,
    MixedConditions = 2,
    InLocalMemory = 3,
    InRemoteMemory = 4,
    InNVM = 5,
    InDisk = 6,
}

impl Availability {
    pub fn to_wire(self) -> u8 {
        self as u8
    }

    pub fn from_wire(v: u8) -> Option<Self> {
        match v {
            0 => Some(Availability::Unavailable),
            1 => Some(Availability::Requested),
            2 => Some(Availability::MixedConditions),
            3 => Some(Availability::InLocalMemory),
            4 => Some(Availability::InRemoteMemory),
            5 => Some(Availability::InNVM),
            6 => Some(Availability::InDisk),
            _ => None,
        }
    }

    /// Used by the origin side of Info/RowInfo: the target reports
    /// `InLocalMemory` from its own perspective, and the origin
    /// rewrites that to `InRemoteMemory` before handing it to the
    /// caller (spec §4.5, Info/RowInfo).
    pub fn rebase_to_remote(self) -> Availability {
        match self {
            Availability::InLocalMemory => Availability::InRemoteMemory,
            other => other,
        }
    }

    /// Aggregate a row's per-column availabilities into one value
    /// (spec §9 open question: `MixedConditions` only appears in
    /// row-level aggregates). Defined here as: all columns agree, or
    /// `MixedConditions` if at least two differ.
    pub fn aggregate(values: impl IntoIterator<Item = Availability>) -> Availability {
        let mut iter = values.into_iter();
        let Some(first) = iter.next() else {
            return Availability::Unavailable;
        };
        if iter.all(|v| v == first) {
            first
        } else {
            Availability::MixedConditions
        }
    }
}

impl fmt::Display for Availability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Availability::Unavailable => "unavailable",
            Availability::Requested => "requested",
            Availability::MixedConditions => "mixed",
            Availability::InLocalMemory => "in_local_memory",
            Availability::InRemoteMemory => "in_remote_memory",
            Availability::InNVM => "in_nvm",
            Availability::InDisk => "in_disk",
        };
        f.write_str(s)
    }
}

/// Small info report per query: spec §3. Used for both a single column
/// (column info) and aggregated over a row's matching columns (row info).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ObjectInfo {
    pub row_user_bytes: u64,
    pub col_user_bytes: u64,
    pub row_num_columns: u32,
    pub col_dependencies: u32,
    pub col_availability: Availability,
}

impl Default for Availability {
    fn default() -> Self {
        Availability::Unavailable
    }
}

impl ObjectInfo {
    /// Status-reply wire packing, little-endian (spec §6: "status
    /// reply body ... object_info: 24B"): `row_user_bytes:u64,
    /// col_user_bytes:u64, row_num_columns:u32, col_dependencies:u16,
    /// col_availability:u8, reserved:u8`.
    pub const WIRE_SIZE: usize = 24;

    pub fn to_wire(&self) -> [u8; Self::WIRE_SIZE] {
        let mut buf = [0u8; Self::WIRE_SIZE];
        LittleEndian::write_u64(&mut buf[0..8], self.row_user_bytes);
        LittleEndian::write_u64(&mut buf[8..16], self.col_user_bytes);
        LittleEndian::write_u32(&mut buf[16..20], self.row_num_columns);
        LittleEndian::write_u16(&mut buf[20..22], self.col_dependencies.min(u16::MAX as u32) as u16);
        buf[22] = self.col_availability.to_wire();
        buf
    }

    pub fn from_wire(buf: &[u8]) -> Result<Self> {
        if buf.len() < Self::WIRE_SIZE {
            return Err(ProtocolError::BadRpc("object_info shorter than 24 bytes").into());
        }
        let col_availability = Availability::from_wire(buf[22])
            .ok_or(ProtocolError::BadRpc("unknown availability discriminant"))?;
        Ok(ObjectInfo {
            row_user_bytes: LittleEndian::read_u64(&buf[0..8]),
            col_user_bytes: LittleEndian::read_u64(&buf[8..16]),
            row_num_columns: LittleEndian::read_u32(&buf[16..20]),
            col_dependencies: LittleEndian::read_u16(&buf[20..22]) as u32,
            col_availability,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rebase_only_touches_local_memory() {
        assert_eq!(Availability::InLocalMemory.rebase_to_remote(), Availability::InRemoteMemory);
        assert_eq!(Availability::InDisk.rebase_to_remote(), Availability::InDisk);
    }

    #[test]
    fn aggregate_is_mixed_on_disagreement() {
        let agg = Availability::aggregate([Availability::InLocalMemory, Availability::InDisk]);
        assert_eq!(agg, Availability::MixedConditions);
    }

    #[test]
    fn aggregate_is_uniform_when_all_agree() {
        let agg = Availability::aggregate([Availability::InLocalMemory, Availability::InLocalMemory]);
        assert_eq!(agg, Availability::InLocalMemory);
    }

    #[test]
    fn wire_roundtrip() {
        let info = ObjectInfo {
            row_user_bytes: 4096,
            col_user_bytes: 128,
            row_num_columns: 3,
            col_dependencies: 1,
            col_availability: Availability::InLocalMemory,
        };
        let wire = info.to_wire();
        assert_eq!(wire.len(), ObjectInfo::WIRE_SIZE);
        assert_eq!(ObjectInfo::from_wire(&wire).unwrap(), info);
    }
}
