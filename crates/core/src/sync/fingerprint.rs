//! Fingerprint map: monotone change stamps per (table, row).
//!
//! View layers compare stamps to decide whether a dependent query must
//! recompute. Stamps combine a millisecond clock with a rolling counter so
//! successive bumps within the same millisecond still strictly increase.
//! Large bootstraps bump a table-level stamp instead of one entry per row.

use std::collections::HashMap;

use chrono::Utc;

/// Bits reserved for the same-millisecond counter.
const COUNTER_BITS: u32 = 20;
const COUNTER_MAX: u64 = (1 << COUNTER_BITS) - 1;

/// Strictly monotonic logical clock: `(millis << 20) | counter`.
#[derive(Debug, Default)]
struct MonotonicClock {
    last_millis: i64,
    counter: u64,
}

impl MonotonicClock {
    fn next(&mut self) -> u64 {
        let now = Utc::now().timestamp_millis();
        if now > self.last_millis {
            self.last_millis = now;
            self.counter = 0;
        } else {
            // Same millisecond, or the wall clock stepped backwards; keep
            // the logical clock moving forward regardless.
            self.counter += 1;
            if self.counter > COUNTER_MAX {
                self.last_millis += 1;
                self.counter = 0;
            }
        }
        ((self.last_millis as u64) << COUNTER_BITS) | self.counter
    }
}

/// In-memory map of change stamps.
#[derive(Debug, Default)]
pub struct FingerprintMap {
    clock: MonotonicClock,
    rows: HashMap<(String, String), u64>,
    tables: HashMap<String, u64>,
}

impl FingerprintMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bump the stamp for one row. Returns the new stamp.
    pub fn bump_row(&mut self, table: &str, row_id: &str) -> u64 {
        let stamp = self.clock.next();
        self.rows.insert((table.to_string(), row_id.to_string()), stamp);
        stamp
    }

    /// Bump the whole-table stamp (used for large bootstraps).
    pub fn bump_table(&mut self, table: &str) -> u64 {
        let stamp = self.clock.next();
        self.tables.insert(table.to_string(), stamp);
        stamp
    }

    /// Effective stamp for a row: the row entry or the table stamp,
    /// whichever is newer. `None` when the pair has never been bumped.
    pub fn stamp_for(&self, table: &str, row_id: &str) -> Option<u64> {
        let row = self.rows.get(&(table.to_string(), row_id.to_string())).copied();
        let table_stamp = self.tables.get(table).copied();
        match (row, table_stamp) {
            (Some(r), Some(t)) => Some(r.max(t)),
            (Some(r), None) => Some(r),
            (None, Some(t)) => Some(t),
            (None, None) => None,
        }
    }

    /// Table-level stamp, if any.
    pub fn table_stamp(&self, table: &str) -> Option<u64> {
        self.tables.get(table).copied()
    }

    /// Drop all entries for a table (reset/repair flows).
    pub fn clear_table(&mut self, table: &str) {
        self.rows.retain(|(t, _), _| t != table);
        self.tables.remove(table);
    }

    /// Drop everything.
    pub fn clear(&mut self) {
        self.rows.clear();
        self.tables.clear();
    }

    /// Number of row-level entries (diagnostics).
    pub fn row_entry_count(&self) -> usize {
        self.rows.len()
    }
}
