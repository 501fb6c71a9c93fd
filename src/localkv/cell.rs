//! A `Cell`: one `(row, column)` slot (spec §3, §4.4 invariants).
use crate::ldo::DataObject;
use crate::object_info::Availability;
use crate::opengine::Mailbox;

/// Callback used by `WantLocal` and by local (non-networked) `Get`
/// waiters: invoked exactly once, either with the arrived data or
/// with `success=false` if the implementation ever supports
/// cancellation (spec §4.4: "current design always eventually
/// succeeds or never fires").
pub type WaiterCallback = Box<dyn FnOnce(bool, DataObject, Availability) + Send>;

/// A single `(row, column)` slot. Created lazily on first touch;
/// destroyed when explicitly dropped and no waiters remain (spec §3).
pub struct Cell {
    pub(crate) ldo: DataObject,
    pub(crate) availability: Availability,
    pub(crate) created_at_ms: u64,
    pub(crate) updated_at_ms: u64,
    pub(crate) waiting_mailboxes: Vec<Mailbox>,
    pub(crate) waiting_callbacks: Vec<WaiterCallback>,
    pub(crate) drop_requested: bool,
    pub(crate) dependencies: u32,
}

impl Cell {
    pub fn new(now_ms: u64) -> Self {
        Cell {
            ldo: DataObject::null(),
            availability: Availability::Unavailable,
            created_at_ms: now_ms,
            updated_at_ms: now_ms,
            waiting_mailboxes: Vec::new(),
            waiting_callbacks: Vec::new(),
            drop_requested: false,
            dependencies: 0,
        }
    }

    pub fn ldo(&self) -> &DataObject {
        &self.ldo
    }

    pub fn availability(&self) -> Availability {
        self.availability
    }

    pub fn is_available(&self) -> bool {
        matches!(
            self.availability,
            Availability::InLocalMemory
                | Availability::InRemoteMemory
                | Availability::InNVM
                | Availability::InDisk
                | Availability::MixedConditions
        )
    }

    pub fn has_waiters(&self) -> bool {
        !self.waiting_mailboxes.is_empty() || !self.waiting_callbacks.is_empty()
    }

    pub fn user_bytes(&self) -> u64 {
        self.ldo.wire_size().map(|n| n as u64).unwrap_or(0)
    }

    /// Takes both waiter lists out of the cell, leaving it empty. Used
    /// by `dispatch` (spec §4.4: "the cell's waiter lists are moved
    /// out and handed to the background worker as a batch").
    pub fn take_waiters(&mut self) -> (Vec<Mailbox>, Vec<WaiterCallback>) {
        (
            std::mem::take(&mut self.waiting_mailboxes),
            std::mem::take(&mut self.waiting_callbacks),
        )
    }
}
