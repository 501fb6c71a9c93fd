//! LocalKV: the row→column→cell store, per-row locking, deferred
//! waiter lists, and availability tracking (spec §4.4 — "the
//! centerpiece"). Grounded in `original_source/src/kelpie/LocalKV.{hh,cpp}`.
pub mod cell;
pub mod row;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};

use log::trace;

use crate::bucket::Bucket;
use crate::error::{ProtocolError, Result};
use crate::iom::Iom;
use crate::key::Key;
use crate::ldo::DataObject;
use crate::object_info::{Availability, ObjectInfo};
use crate::opengine::{Mailbox, OpEngine, TriggerPayload};
use crate::pool::behavior::BehaviorFlags;
use crate::worker::{Backburner, WorkItem};

pub use cell::{Cell, WaiterCallback};
pub use row::Row;

fn now_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as u64).unwrap_or(0)
}

/// Outcome of a `get` call (spec §4.4, Get).
pub enum GetOutcome {
    Available { ldo: DataObject, info: ObjectInfo },
    Waiting,
}

/// Outcome of a `want_local` call (spec §4.4, WantLocal).
pub enum WantOutcome {
    /// Already available; the callback has been handed to the
    /// background worker for invocation.
    Ok,
    Waiting,
}

pub struct LocalKv {
    rows: RwLock<HashMap<(Bucket, Vec<u8>), Arc<Mutex<Row>>>>,
    worker: Arc<Backburner>,
    op_engine: Arc<OpEngine>,
}

impl LocalKv {
    pub fn new(worker: Arc<Backburner>, op_engine: Arc<OpEngine>) -> Self {
        LocalKv { rows: RwLock::new(HashMap::new()), worker, op_engine }
    }

    fn find_row(&self, bucket: Bucket, row_name: &[u8]) -> Option<Arc<Mutex<Row>>> {
        self.rows.read().unwrap().get(&(bucket, row_name.to_vec())).cloned()
    }

    fn find_or_create_row(&self, bucket: Bucket, row_name: &[u8]) -> Arc<Mutex<Row>> {
        if let Some(row) = self.find_row(bucket, row_name) {
            return row;
        }
        let mut rows = self.rows.write().unwrap();
        rows.entry((bucket, row_name.to_vec()))
            .or_insert_with(|| Arc::new(Mutex::new(Row::new(row_name.to_vec()))))
            .clone()
    }

    fn drop_row_if_empty(&self, bucket: Bucket, row_name: &[u8]) {
        let mut rows = self.rows.write().unwrap();
        if let Some(row) = rows.get(&(bucket, row_name.to_vec())) {
            if row.lock().unwrap().is_empty() {
                rows.remove(&(bucket, row_name.to_vec()));
            }
        }
    }

    /// `Put` (spec §4.4).
    pub fn put(
        &self,
        bucket: Bucket,
        key: &Key,
        ldo: DataObject,
        behavior: BehaviorFlags,
        iom: Option<&Arc<dyn Iom>>,
    ) -> Result<ObjectInfo> {
        let row_arc = self.find_or_create_row(bucket, key.k1());
        let (info, dispatch_work, collect_row) = {
            let mut row = row_arc.lock().unwrap();
            let now = now_ms();
            let cell = row.get_or_create_cell(key.k2(), now);

            if cell.availability == Availability::InLocalMemory && !behavior.contains(BehaviorFlags::ENABLE_OVERWRITES) {
                return Err(ProtocolError::AlreadyExists.into());
            }

            cell.ldo = ldo.clone();
            cell.availability = Availability::InLocalMemory;
            cell.updated_at_ms = now;

            if behavior.contains(BehaviorFlags::WRITE_TO_IOM) {
                if let Some(iom) = iom {
                    iom.write_object(bucket, key, &ldo)?;
                }
            }

            let info = ObjectInfo {
                row_user_bytes: cell.user_bytes(),
                col_user_bytes: cell.user_bytes(),
                row_num_columns: 1,
                col_dependencies: cell.dependencies,
                col_availability: cell.availability,
            };

            let (mailboxes, callbacks) = cell.take_waiters();
            let drop_requested = cell.drop_requested;
            let work = build_dispatch_batch(self.op_engine.clone(), mailboxes, callbacks, ldo.clone(), info.clone());

            // The last waiter on this cell just got serviced: if a Drop
            // arrived while waiters were outstanding (spec §4.4), this is
            // the point where the deferred removal finally happens.
            let collect_row = if drop_requested {
                row.remove_cell(key.k2());
                row.is_empty()
            } else {
                false
            };

            (info, work, collect_row)
        };

        if !dispatch_work.is_empty() {
            trace!("dispatching {} waiter(s) for {}", dispatch_work.len(), key);
            self.worker.submit_batch(dispatch_work);
        }

        if collect_row {
            self.drop_row_if_empty(bucket, key.k1());
        }

        Ok(info)
    }

    /// `Get` (spec §4.4). `waiting_mailbox` is `Some` for an op-driven
    /// caller willing to wait; `None` for a local-only caller that
    /// wants `ENOENT` on a miss instead.
    pub fn get(&self, bucket: Bucket, key: &Key, waiting_mailbox: Option<Mailbox>) -> Result<GetOutcome> {
        let row_arc = match waiting_mailbox {
            Some(_) => self.find_or_create_row(bucket, key.k1()),
            None => match self.find_row(bucket, key.k1()) {
                Some(row) => row,
                None => return Err(ProtocolError::NotFound.into()),
            },
        };

        let mut row = row_arc.lock().unwrap();
        let now = now_ms();
        let cell = match waiting_mailbox {
            Some(_) => row.get_or_create_cell(key.k2(), now),
            None => match row.get_cell_mut(key.k2()) {
                Some(cell) => cell,
                None => return Err(ProtocolError::NotFound.into()),
            },
        };

        if cell.is_available() {
            let info = ObjectInfo {
                row_user_bytes: cell.user_bytes(),
                col_user_bytes: cell.user_bytes(),
                row_num_columns: 1,
                col_dependencies: cell.dependencies,
                col_availability: cell.availability,
            };
            return Ok(GetOutcome::Available { ldo: cell.ldo.clone(), info });
        }

        match waiting_mailbox {
            Some(mailbox) => {
                if cell.availability == Availability::Unavailable {
                    cell.availability = Availability::Requested;
                }
                cell.waiting_mailboxes.push(mailbox);
                Ok(GetOutcome::Waiting)
            }
            None => Err(ProtocolError::NotFound.into()),
        }
    }

    /// `WantLocal` (spec §4.4).
    pub fn want_local(
        &self,
        bucket: Bucket,
        key: &Key,
        create_if_missing: bool,
        callback: WaiterCallback,
    ) -> Result<WantOutcome> {
        let row_arc = if create_if_missing {
            self.find_or_create_row(bucket, key.k1())
        } else {
            match self.find_row(bucket, key.k1()) {
                Some(row) => row,
                None => return Err(ProtocolError::NotFound.into()),
            }
        };

        let mut row = row_arc.lock().unwrap();
        let now = now_ms();
        let cell = if create_if_missing {
            row.get_or_create_cell(key.k2(), now)
        } else {
            match row.get_cell_mut(key.k2()) {
                Some(cell) => cell,
                None => return Err(ProtocolError::NotFound.into()),
            }
        };

        if cell.is_available() {
            let ldo = cell.ldo.clone();
            let availability = cell.availability;
            self.worker.submit(Box::new(move || {
                callback(true, ldo, availability);
                0
            }));
            return Ok(WantOutcome::Ok);
        }

        if cell.availability == Availability::Unavailable {
            cell.availability = Availability::Requested;
        }
        cell.waiting_callbacks.push(callback);
        Ok(WantOutcome::Waiting)
    }

    /// `Drop` (spec §4.4). Supports a column-prefix wildcard within a
    /// row and, generalizing the same prefix rule spec.md's List
    /// already uses, a row-prefix wildcard across rows. A cell with
    /// outstanding waiters has its `drop_requested` flag set instead
    /// of being removed immediately.
    pub fn drop(&self, bucket: Bucket, key_pattern: &Key) -> Result<usize> {
        let row_names = self.matching_row_names(bucket, key_pattern);
        let mut removed = 0;

        for row_name in row_names {
            let row_arc = match self.find_row(bucket, &row_name) {
                Some(r) => r,
                None => continue,
            };
            let mut row = row_arc.lock().unwrap();
            let col_names = matching_column_names(&row, key_pattern);
            for col in col_names {
                if let Some(cell) = row.get_cell_mut(&col) {
                    if cell.has_waiters() {
                        cell.drop_requested = true;
                    } else {
                        row.remove_cell(&col);
                        removed += 1;
                    }
                }
            }
            let empty = row.is_empty();
            drop(row);
            if empty {
                self.drop_row_if_empty(bucket, &row_name);
            }
        }

        Ok(removed)
    }

    /// `Info` (spec §4.4): column info for an exact key, row info
    /// aggregated over matching cells for a wildcard. An attached IOM
    /// is consulted on a miss only for the exact-key (column-info)
    /// case — a row-info aggregate has no single key to ask the IOM
    /// about.
    pub fn info(&self, bucket: Bucket, key_pattern: &Key, iom: Option<&Arc<dyn Iom>>) -> Result<ObjectInfo> {
        let row_names = self.matching_row_names(bucket, key_pattern);
        let mut col_user_bytes = 0u64;
        let mut row_num_columns = 0u32;
        let mut col_dependencies = 0u32;
        let mut availabilities = Vec::new();
        let mut row_user_bytes = 0u64;

        for row_name in row_names {
            let row_arc = match self.find_row(bucket, &row_name) {
                Some(r) => r,
                None => continue,
            };
            let row = row_arc.lock().unwrap();
            let matched_columns = matching_column_names(&row, key_pattern);

            // A column wildcard restricts the row totals to the matching
            // columns too; without one, the row total still covers every
            // column in the row, not just the single (possibly no-column)
            // key the pattern names.
            let row_wide_columns =
                if key_pattern.is_col_wildcard() { matched_columns.clone() } else { row.matching_columns(&[]) };
            for col in &row_wide_columns {
                if let Some(cell) = row.get_cell(col) {
                    row_user_bytes += cell.user_bytes();
                }
            }
            for col in &matched_columns {
                if let Some(cell) = row.get_cell(col) {
                    col_user_bytes += cell.user_bytes();
                    row_num_columns += 1;
                    col_dependencies += cell.dependencies;
                    availabilities.push(cell.availability);
                }
            }
        }

        if availabilities.is_empty() {
            if !key_pattern.is_row_wildcard() && !key_pattern.is_col_wildcard() {
                if let Some(iom) = iom {
                    if let Ok(info) = iom.get_info(bucket, key_pattern) {
                        return Ok(info);
                    }
                }
            }
            return Err(ProtocolError::NotFound.into());
        }

        Ok(ObjectInfo {
            row_user_bytes,
            col_user_bytes,
            row_num_columns,
            col_dependencies,
            col_availability: Availability::aggregate(availabilities),
        })
    }

    /// `List` (spec §4.4). When an IOM is attached, exact (non-row-
    /// wildcard) misses are also checked against it and unioned in;
    /// the IOM interface (spec §6) has no enumeration primitive, so a
    /// row-wildcard list only ever surfaces what LKV itself holds.
    pub fn list(&self, bucket: Bucket, key_pattern: &Key, iom: Option<&Arc<dyn Iom>>) -> Result<Vec<(Key, u64)>> {
        let mut out = Vec::new();
        let row_names = self.matching_row_names(bucket, key_pattern);

        for row_name in &row_names {
            let row_arc = match self.find_row(bucket, row_name) {
                Some(r) => r,
                None => continue,
            };
            let row = row_arc.lock().unwrap();
            for col in matching_column_names(&row, key_pattern) {
                if let Some(cell) = row.get_cell(&col) {
                    out.push((Key::with_column(row_name.clone(), col), cell.user_bytes()));
                }
            }
        }

        if let Some(iom) = iom {
            if !key_pattern.is_row_wildcard() && !key_pattern.is_col_wildcard() {
                let already_listed = out.iter().any(|(k, _)| k == key_pattern);
                if !already_listed {
                    if let Ok(info) = iom.get_info(bucket, key_pattern) {
                        out.push((key_pattern.clone(), info.col_user_bytes));
                    }
                }
            }
        }

        Ok(out)
    }

    fn matching_row_names(&self, bucket: Bucket, key_pattern: &Key) -> Vec<Vec<u8>> {
        if key_pattern.is_row_wildcard() {
            let prefix = &key_pattern.k1()[..key_pattern.k1().len() - 1];
            self.rows
                .read()
                .unwrap()
                .keys()
                .filter(|(b, name)| *b == bucket && name.starts_with(prefix))
                .map(|(_, name)| name.clone())
                .collect()
        } else {
            vec![key_pattern.k1().to_vec()]
        }
    }
}

fn matching_column_names(row: &Row, key_pattern: &Key) -> Vec<Vec<u8>> {
    if key_pattern.is_col_wildcard() {
        let prefix = &key_pattern.k2()[..key_pattern.k2().len() - 1];
        row.matching_columns(prefix)
    } else {
        vec![key_pattern.k2().to_vec()]
    }
}

fn build_dispatch_batch(
    op_engine: Arc<OpEngine>,
    mailboxes: Vec<Mailbox>,
    callbacks: Vec<WaiterCallback>,
    ldo: DataObject,
    info: ObjectInfo,
) -> Vec<WorkItem> {
    let mut items: Vec<WorkItem> = Vec::with_capacity(mailboxes.len() + callbacks.len());
    for mailbox in mailboxes {
        let engine = op_engine.clone();
        let ldo = ldo.clone();
        let info = info.clone();
        items.push(Box::new(move || {
            let payload = TriggerPayload { success: true, ldo, info };
            let _ = engine.trigger(mailbox, payload);
            0
        }));
    }
    for callback in callbacks {
        let ldo = ldo.clone();
        let availability = info.col_availability;
        items.push(Box::new(move || {
            callback(true, ldo, availability);
            0
        }));
    }
    items
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ldo::allocator::HeapAllocator;
    use std::sync::mpsc;

    fn new_kv() -> (Arc<LocalKv>, Arc<Backburner>) {
        let worker = Backburner::new(1, crate::worker::Wakeup::SleepMs(1));
        let engine = Arc::new(OpEngine::new());
        (Arc::new(LocalKv::new(worker.clone(), engine)), worker)
    }

    fn heap_ldo(bytes: &[u8]) -> DataObject {
        DataObject::new(b"", bytes, Arc::new(HeapAllocator::new()), 0).unwrap()
    }

    #[test]
    fn put_then_get_returns_available() {
        let (kv, _worker) = new_kv();
        let bucket = Bucket::new("b");
        let key = Key::with_column("r", "c");
        kv.put(bucket, &key, heap_ldo(b"hello"), BehaviorFlags::DEFAULT_LOCAL, None).unwrap();

        match kv.get(bucket, &key, None).unwrap() {
            GetOutcome::Available { ldo, .. } => assert_eq!(ldo.data().unwrap(), b"hello"),
            GetOutcome::Waiting => panic!("expected Available"),
        }
    }

    #[test]
    fn get_on_absent_key_without_mailbox_is_not_found() {
        let (kv, _worker) = new_kv();
        let key = Key::new("missing");
        assert!(kv.get(Bucket::UNSPECIFIED, &key, None).is_err());
    }

    #[test]
    fn put_without_overwrite_flag_rejects_duplicate() {
        let (kv, _worker) = new_kv();
        let key = Key::new("r");
        kv.put(Bucket::UNSPECIFIED, &key, heap_ldo(b"v1"), BehaviorFlags::DEFAULT_LOCAL, None).unwrap();
        let err = kv
            .put(Bucket::UNSPECIFIED, &key, heap_ldo(b"v2"), BehaviorFlags::DEFAULT_LOCAL, None)
            .unwrap_err();
        assert_eq!(err.to_rc(), crate::error::rc::EEXIST);
    }

    #[test]
    fn put_with_overwrite_flag_replaces_value() {
        let (kv, _worker) = new_kv();
        let key = Key::new("r");
        let flags = BehaviorFlags::DEFAULT_LOCAL | BehaviorFlags::ENABLE_OVERWRITES;
        kv.put(Bucket::UNSPECIFIED, &key, heap_ldo(b"v1"), flags, None).unwrap();
        kv.put(Bucket::UNSPECIFIED, &key, heap_ldo(b"v2"), flags, None).unwrap();
        match kv.get(Bucket::UNSPECIFIED, &key, None).unwrap() {
            GetOutcome::Available { ldo, .. } => assert_eq!(ldo.data().unwrap(), b"v2"),
            GetOutcome::Waiting => panic!("expected Available"),
        }
    }

    #[test]
    fn want_local_callback_fires_exactly_once_after_later_put() {
        let (kv, _worker) = new_kv();
        let key = Key::new("pending");
        let (tx, rx) = mpsc::channel::<bool>();
        let outcome = kv
            .want_local(Bucket::UNSPECIFIED, &key, true, Box::new(move |ok, _ldo, _av| {
                tx.send(ok).unwrap();
            }))
            .unwrap();
        assert!(matches!(outcome, WantOutcome::Waiting));

        kv.put(Bucket::UNSPECIFIED, &key, heap_ldo(b"arrived"), BehaviorFlags::DEFAULT_LOCAL, None).unwrap();
        assert!(rx.recv_timeout(std::time::Duration::from_secs(1)).unwrap());
        assert!(rx.recv_timeout(std::time::Duration::from_millis(50)).is_err());
    }

    #[test]
    fn drop_removes_key_without_waiters() {
        let (kv, _worker) = new_kv();
        let key = Key::new("gone");
        kv.put(Bucket::UNSPECIFIED, &key, heap_ldo(b"x"), BehaviorFlags::DEFAULT_LOCAL, None).unwrap();
        let removed = kv.drop(Bucket::UNSPECIFIED, &key).unwrap();
        assert_eq!(removed, 1);
        assert!(kv.get(Bucket::UNSPECIFIED, &key, None).is_err());
    }

    #[test]
    fn drop_defers_when_waiters_present() {
        let (kv, _worker) = new_kv();
        let key = Key::new("waited");
        let mailbox = Mailbox::new(1, 1);
        match kv.get(Bucket::UNSPECIFIED, &key, Some(mailbox)).unwrap() {
            GetOutcome::Waiting => {}
            GetOutcome::Available { .. } => panic!("expected Waiting"),
        }
        let removed = kv.drop(Bucket::UNSPECIFIED, &key).unwrap();
        assert_eq!(removed, 0, "cell with a waiter must not be removed immediately");
    }

    #[test]
    fn deferred_drop_collects_cell_once_waiter_satisfied() {
        let (kv, _worker) = new_kv();
        let key = Key::new("waited");
        let mailbox = Mailbox::new(1, 1);
        match kv.get(Bucket::UNSPECIFIED, &key, Some(mailbox)).unwrap() {
            GetOutcome::Waiting => {}
            GetOutcome::Available { .. } => panic!("expected Waiting"),
        }
        assert_eq!(kv.drop(Bucket::UNSPECIFIED, &key).unwrap(), 0, "waiter present, nothing removed yet");

        kv.put(Bucket::UNSPECIFIED, &key, heap_ldo(b"satisfies the waiter"), BehaviorFlags::DEFAULT_LOCAL, None)
            .unwrap();

        assert!(
            kv.get(Bucket::UNSPECIFIED, &key, None).is_err(),
            "cell must be collected once its last waiter is satisfied"
        );
    }

    #[test]
    fn row_wildcard_list_matches_prefix() {
        let (kv, _worker) = new_kv();
        kv.put(Bucket::UNSPECIFIED, &Key::new("row1"), heap_ldo(b"a"), BehaviorFlags::DEFAULT_LOCAL, None).unwrap();
        kv.put(Bucket::UNSPECIFIED, &Key::new("row2"), heap_ldo(b"bb"), BehaviorFlags::DEFAULT_LOCAL, None).unwrap();
        kv.put(Bucket::UNSPECIFIED, &Key::new("other"), heap_ldo(b"ccc"), BehaviorFlags::DEFAULT_LOCAL, None).unwrap();

        let pattern = Key::new("row*");
        let mut listed = kv.list(Bucket::UNSPECIFIED, &pattern, None).unwrap();
        listed.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(listed.len(), 2);
    }

    #[test]
    fn row_info_with_column_wildcard_restricts_row_totals_too() {
        let (kv, _worker) = new_kv();
        kv.put(Bucket::UNSPECIFIED, &Key::with_column("r", "alpha"), heap_ldo(b"aa"), BehaviorFlags::DEFAULT_LOCAL, None)
            .unwrap();
        kv.put(Bucket::UNSPECIFIED, &Key::with_column("r", "beta"), heap_ldo(b"bbb"), BehaviorFlags::DEFAULT_LOCAL, None)
            .unwrap();

        let info = kv.info(Bucket::UNSPECIFIED, &Key::with_column("r", "al*"), None).unwrap();
        assert_eq!(info.row_num_columns, 1);
        assert_eq!(info.col_user_bytes, 2);
        assert_eq!(info.row_user_bytes, 2, "row total must be restricted to the column-wildcard match, not every column");
    }

    #[test]
    fn row_info_without_column_wildcard_totals_every_column() {
        let (kv, _worker) = new_kv();
        kv.put(Bucket::UNSPECIFIED, &Key::with_column("r", "alpha"), heap_ldo(b"aa"), BehaviorFlags::DEFAULT_LOCAL, None)
            .unwrap();
        kv.put(Bucket::UNSPECIFIED, &Key::with_column("r", "beta"), heap_ldo(b"bbb"), BehaviorFlags::DEFAULT_LOCAL, None)
            .unwrap();

        let info = kv.info(Bucket::UNSPECIFIED, &Key::with_column("r", "alpha"), None).unwrap();
        assert_eq!(info.col_user_bytes, 2);
        assert_eq!(info.row_user_bytes, 5, "row total covers every column in the row when there is no column wildcard");
    }
}
