//! Append-only failover history and rollback lookup.
//!
//! Every promotion to active stamps a new `(uuid, seqno)` era entry.
//! A re-attaching replica presents the era it last replicated from and
//! the seqno it reached; the table answers whether (and to where) it
//! must roll back before streaming can resume.

use serde::{Deserialize, Serialize};

/// One failover era: `uuid` identifies it, `seq` is the seqno the era
/// started at.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailoverEntry {
    pub uuid: u64,
    pub seq: u64,
}

/// Bounded append-only list of failover eras, newest first.
#[derive(Debug)]
pub struct FailoverTable {
    entries: Vec<FailoverEntry>,
    max_entries: usize,
}

impl FailoverTable {
    /// Fresh table with a single era starting at seqno 0.
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: vec![FailoverEntry {
                uuid: rand::random(),
                seq: 0,
            }],
            max_entries: max_entries.max(1),
        }
    }

    /// Rebuilds a table from persisted entries (newest first).
    pub fn from_entries(entries: Vec<FailoverEntry>, max_entries: usize) -> Self {
        if entries.is_empty() {
            return Self::new(max_entries);
        }
        let mut table = Self {
            entries,
            max_entries: max_entries.max(1),
        };
        table.entries.truncate(table.max_entries);
        table
    }

    /// Starts a new era at `high_seqno` (promotion to active).
    pub fn create_entry(&mut self, high_seqno: u64) -> FailoverEntry {
        let entry = FailoverEntry {
            uuid: rand::random(),
            seq: high_seqno,
        };
        self.entries.insert(0, entry);
        self.entries.truncate(self.max_entries);
        entry
    }

    pub fn latest(&self) -> FailoverEntry {
        self.entries[0]
    }

    pub fn entries(&self) -> &[FailoverEntry] {
        &self.entries
    }

    /// Rollback decision for a replica that replicated up to
    /// `remote_seqno` within era `remote_uuid`, given this node's
    /// current high seqno.
    ///
    /// Returns `None` when the replica may resume as-is, otherwise the
    /// seqno it must roll back to (0 when the era is unknown).
    pub fn needs_rollback(
        &self,
        remote_uuid: u64,
        remote_seqno: u64,
        high_seqno: u64,
    ) -> Option<u64> {
        let Some(idx) = self.entries.iter().position(|e| e.uuid == remote_uuid) else {
            // No shared history at all.
            return Some(0);
        };
        let era_end = if idx == 0 {
            high_seqno
        } else {
            self.entries[idx - 1].seq
        };
        if remote_seqno <= era_end {
            None
        } else {
            Some(era_end)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_with_a_zero_era() {
        let table = FailoverTable::new(5);
        assert_eq!(1, table.entries().len());
        assert_eq!(0, table.latest().seq);
    }

    #[test]
    fn create_entry_prepends_and_bounds_length() {
        let mut table = FailoverTable::new(3);
        for seqno in [10, 20, 30, 40] {
            table.create_entry(seqno);
        }
        assert_eq!(3, table.entries().len());
        assert_eq!(40, table.latest().seq);
        // Oldest eras fell off the end.
        assert_eq!(20, table.entries()[2].seq);
    }

    #[test]
    fn replica_in_current_era_needs_no_rollback() {
        let table = FailoverTable::new(5);
        let uuid = table.latest().uuid;
        assert_eq!(None, table.needs_rollback(uuid, 50, 100));
        assert_eq!(None, table.needs_rollback(uuid, 100, 100));
    }

    #[test]
    fn replica_ahead_of_current_era_rolls_back_to_high_seqno() {
        let table = FailoverTable::new(5);
        let uuid = table.latest().uuid;
        assert_eq!(Some(100), table.needs_rollback(uuid, 150, 100));
    }

    #[test]
    fn replica_from_an_older_era_rolls_back_to_the_era_boundary() {
        let mut table = FailoverTable::new(5);
        let old_uuid = table.latest().uuid;
        table.create_entry(60);

        // Replicated past the takeover point within the dead era.
        assert_eq!(Some(60), table.needs_rollback(old_uuid, 80, 100));
        // Stopped before the takeover point: the prefix is still valid.
        assert_eq!(None, table.needs_rollback(old_uuid, 40, 100));
    }

    #[test]
    fn unknown_era_rolls_back_to_zero() {
        let table = FailoverTable::new(5);
        assert_eq!(Some(0), table.needs_rollback(0xdead_beef, 10, 100));
    }

    #[test]
    fn from_entries_restores_and_truncates() {
        let entries = vec![
            FailoverEntry { uuid: 3, seq: 30 },
            FailoverEntry { uuid: 2, seq: 20 },
            FailoverEntry { uuid: 1, seq: 10 },
        ];
        let table = FailoverTable::from_entries(entries, 2);
        assert_eq!(2, table.entries().len());
        assert_eq!(3, table.latest().uuid);

        let empty = FailoverTable::from_entries(Vec::new(), 2);
        assert_eq!(1, empty.entries().len());
    }
}
