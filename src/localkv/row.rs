//! A `Row`: the row name, its columns, and a distinguished
//! "no-column" slot for keys whose column is empty (spec §3). All
//! access to any cell in the row holds the row's mutex, which at the
//! `LocalKv` level is simply the `Mutex<Row>` wrapping this struct.
use std::collections::HashMap;

use crate::localkv::cell::Cell;

pub struct Row {
    pub row_name: Vec<u8>,
    no_column_cell: Option<Cell>,
    columns: HashMap<Vec<u8>, Cell>,
}

impl Row {
    pub fn new(row_name: Vec<u8>) -> Self {
        Row {
            row_name,
            no_column_cell: None,
            columns: HashMap::new(),
        }
    }

    pub fn get_cell(&self, column: &[u8]) -> Option<&Cell> {
        if column.is_empty() {
            self.no_column_cell.as_ref()
        } else {
            self.columns.get(column)
        }
    }

    pub fn get_cell_mut(&mut self, column: &[u8]) -> Option<&mut Cell> {
        if column.is_empty() {
            self.no_column_cell.as_mut()
        } else {
            self.columns.get_mut(column)
        }
    }

    pub fn get_or_create_cell(&mut self, column: &[u8], now_ms: u64) -> &mut Cell {
        if column.is_empty() {
            self.no_column_cell.get_or_insert_with(|| Cell::new(now_ms))
        } else {
            self.columns.entry(column.to_vec()).or_insert_with(|| Cell::new(now_ms))
        }
    }

    /// Remove a cell outright. Returns `true` if something was
    /// removed. Callers must have already checked `!has_waiters()`
    /// (spec §4.4, Drop: "a cell with outstanding waiters is not
    /// destroyed").
    pub fn remove_cell(&mut self, column: &[u8]) -> bool {
        if column.is_empty() {
            self.no_column_cell.take().is_some()
        } else {
            self.columns.remove(column).is_some()
        }
    }

    /// True once both the no-column slot and every column are gone —
    /// the row itself can then be dropped from the top map.
    pub fn is_empty(&self) -> bool {
        self.no_column_cell.is_none() && self.columns.is_empty()
    }

    /// Column names matching a prefix (or all, if `prefix` is empty),
    /// including the no-column slot when it matches.
    pub fn matching_columns(&self, prefix: &[u8]) -> Vec<Vec<u8>> {
        let mut out = Vec::new();
        if prefix.is_empty() && self.no_column_cell.is_some() {
            out.push(Vec::new());
        }
        for name in self.columns.keys() {
            if name.starts_with(prefix) {
                out.push(name.clone());
            }
        }
        out
    }
}
