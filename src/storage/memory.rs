//! In-memory `SheetStore`, used by `--dry-run` and tests.
//!
//! Reads trim trailing empty cells and rows the way the Sheets API does,
//! so the sink sees the same shapes it would in production.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use super::{RowUpdate, SheetStore};
use crate::net::CallError;

#[derive(Default)]
pub struct MemorySheetStore {
    sheets: Mutex<BTreeMap<String, Vec<Vec<String>>>>,
    fail_reads: AtomicU32,
    fail_writes: AtomicU32,
    write_requests: AtomicU64,
}

/// Consume one pending injected failure, if any.
fn take_failure(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

fn trimmed(rows: &[Vec<String>]) -> Vec<Vec<String>> {
    let mut out: Vec<Vec<String>> = rows
        .iter()
        .map(|row| {
            let keep = row.iter().rposition(|c| !c.is_empty()).map_or(0, |i| i + 1);
            row[..keep].to_vec()
        })
        .collect();
    while out.last().is_some_and(Vec::is_empty) {
        out.pop();
    }
    out
}

impl MemorySheetStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a tab with rows.
    pub fn with_sheet(self, sheet: &str, rows: Vec<Vec<String>>) -> Self {
        self.lock().insert(sheet.to_string(), rows);
        self
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, Vec<Vec<String>>>> {
        self.sheets.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Current contents of a tab, as stored.
    pub fn rows(&self, sheet: &str) -> Vec<Vec<String>> {
        self.lock().get(sheet).cloned().unwrap_or_default()
    }

    /// Make the next `n` reads fail with a transient error.
    pub fn fail_next_reads(&self, n: u32) {
        self.fail_reads.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` writes (batched or append) fail with a transient error.
    pub fn fail_next_writes(&self, n: u32) {
        self.fail_writes.store(n, Ordering::SeqCst);
    }

    /// Successful batched writes so far.
    pub fn write_requests(&self) -> u64 {
        self.write_requests.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SheetStore for MemorySheetStore {
    async fn read_rows(&self, sheet: &str) -> Result<Vec<Vec<String>>, CallError> {
        if take_failure(&self.fail_reads) {
            return Err(CallError::Transient("injected read failure".to_string()));
        }
        Ok(self.lock().get(sheet).map(|rows| trimmed(rows)).unwrap_or_default())
    }

    async fn write_rows(&self, sheet: &str, updates: &[RowUpdate]) -> Result<(), CallError> {
        if take_failure(&self.fail_writes) {
            return Err(CallError::Transient("injected write failure".to_string()));
        }
        let mut sheets = self.lock();
        let table = sheets.entry(sheet.to_string()).or_default();
        for update in updates {
            if table.len() <= update.row_index {
                table.resize(update.row_index + 1, Vec::new());
            }
            let row = &mut table[update.row_index];
            for (col, value) in &update.cells {
                if row.len() <= *col {
                    row.resize(col + 1, String::new());
                }
                row[*col] = value.to_string();
            }
        }
        self.write_requests.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn append_row(&self, sheet: &str, values: &[String]) -> Result<(), CallError> {
        if take_failure(&self.fail_writes) {
            return Err(CallError::Transient("injected write failure".to_string()));
        }
        let mut sheets = self.lock();
        let table = sheets.entry(sheet.to_string()).or_default();
        let keep = trimmed(table).len();
        table.truncate(keep);
        table.push(values.to_vec());
        Ok(())
    }
}
