//! Behavior flags: an 8-bit bitmask steering how Put/Get treat local
//! storage, the remote node, and an attached IOM (spec §4.6).
use std::fmt;
use std::ops::{BitOr, BitOrAssign};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BehaviorFlags(u8);

impl BehaviorFlags {
    pub const WRITE_TO_LOCAL: BehaviorFlags = BehaviorFlags(1);
    pub const WRITE_TO_REMOTE: BehaviorFlags = BehaviorFlags(2);
    pub const WRITE_TO_IOM: BehaviorFlags = BehaviorFlags(4);
    pub const READ_TO_LOCAL: BehaviorFlags = BehaviorFlags(8);
    pub const READ_TO_REMOTE: BehaviorFlags = BehaviorFlags(16);
    pub const ENABLE_OVERWRITES: BehaviorFlags = BehaviorFlags(128);

    /// `WriteToRemote | ReadToLocal`, the common remote-publish preset.
    pub const DEFAULT_REMOTE: BehaviorFlags =
        BehaviorFlags(Self::WRITE_TO_REMOTE.0 | Self::READ_TO_LOCAL.0);

    /// `WriteToLocal | ReadToLocal`, the common local-only preset.
    pub const DEFAULT_LOCAL: BehaviorFlags =
        BehaviorFlags(Self::WRITE_TO_LOCAL.0 | Self::READ_TO_LOCAL.0);

    pub fn empty() -> Self {
        BehaviorFlags(0)
    }

    pub fn from_bits(bits: u8) -> Self {
        BehaviorFlags(bits)
    }

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn contains(self, flag: BehaviorFlags) -> bool {
        self.0 & flag.0 == flag.0
    }

    /// "Rebase to remote's frame": `ReadToRemote → ReadToLocal` and
    /// `WriteToRemote → WriteToLocal` before the remote side evaluates
    /// them against its own LKV (spec §4.6).
    pub fn rebase_to_remote(self) -> BehaviorFlags {
        let mut bits = self.0;
        if bits & Self::READ_TO_REMOTE.0 != 0 {
            bits = (bits & !Self::READ_TO_REMOTE.0) | Self::READ_TO_LOCAL.0;
        }
        if bits & Self::WRITE_TO_REMOTE.0 != 0 {
            bits = (bits & !Self::WRITE_TO_REMOTE.0) | Self::WRITE_TO_LOCAL.0;
        }
        BehaviorFlags(bits)
    }
}

impl BitOr for BehaviorFlags {
    type Output = BehaviorFlags;
    fn bitor(self, rhs: Self) -> Self::Output {
        BehaviorFlags(self.0 | rhs.0)
    }
}

impl BitOrAssign for BehaviorFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl fmt::Display for BehaviorFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0b{:08b}", self.0)
    }
}
