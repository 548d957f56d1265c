//! Chronological index over the circular log
//!
//! Rebuilt from scratch on every query. The region holds at most
//! [`LOG_BLOCKS`](super::fram::LOG_BLOCKS) records, so a full scan is cheap.

use tracing::debug;

use crate::core::time::DateTime;

use super::fram::{log_addresses, FramError, FramStore};
use super::records::{EventKind, LogRecord};

/// One indexed record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SortEntry {
    pub addr: u16,
    pub record: LogRecord,
}

/// Log records ordered newest first
#[derive(Debug, Clone, Default)]
pub struct SortIndex {
    entries: Vec<SortEntry>,
}

impl SortIndex {
    /// Scan every log block; blocks failing CRC or decode are left out
    pub async fn build(store: &FramStore) -> Self {
        Self::build_filtered(store, None).await
    }

    /// Same as [`build`](Self::build), keeping only records of `kind`
    pub async fn build_kind(store: &FramStore, kind: EventKind) -> Self {
        Self::build_filtered(store, Some(kind)).await
    }

    async fn build_filtered(store: &FramStore, kind: Option<EventKind>) -> Self {
        let mut entries = Vec::new();
        let mut skipped = 0usize;
        for addr in log_addresses() {
            match store.read_log(addr).await {
                Ok(record) if kind.map_or(true, |k| record.kind == k) => {
                    entries.push(SortEntry { addr, record });
                },
                Ok(_) => {},
                Err(FramError::Crc) | Err(FramError::Param) => skipped += 1,
                Err(e) => {
                    debug!("Log block 0x{:04X} unreadable: {}", addr, e);
                    skipped += 1;
                },
            }
        }
        Self::from_entries(entries, skipped)
    }

    fn from_entries(mut entries: Vec<SortEntry>, skipped: usize) -> Self {
        // Equal stamps: the later write position wins
        entries.sort_by(|a, b| {
            b.record
                .timestamp
                .cmp(&a.record.timestamp)
                .then(b.addr.cmp(&a.addr))
        });
        debug!("Sort index: {} records, {} skipped", entries.len(), skipped);
        Self { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Block address of the record at `rank` (0 = newest)
    pub fn addr(&self, rank: usize) -> Option<u16> {
        self.entries.get(rank).map(|e| e.addr)
    }

    pub fn get(&self, rank: usize) -> Option<&SortEntry> {
        self.entries.get(rank)
    }

    /// The newest `limit` entries; 0 means all
    pub fn newest(&self, limit: usize) -> &[SortEntry] {
        if limit == 0 || limit >= self.entries.len() {
            &self.entries
        } else {
            &self.entries[..limit]
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &SortEntry> {
        self.entries.iter()
    }

    /// Newest record stamped on the calendar date of `date`
    pub fn newest_on(&self, date: &DateTime) -> Option<&SortEntry> {
        self.entries
            .iter()
            .find(|e| e.record.timestamp.same_date(date))
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::core::sim::{MemFram, SimRtc};
    use crate::device::state::{LeakState, ValveSnapshot};
    use crate::storage::fram::LOG_BASE;

    fn record(day: u8, hour: u8, kind: EventKind) -> LogRecord {
        LogRecord {
            timestamp: DateTime::new(day, 5, 2024, hour, 0, 0).unwrap(),
            cold: ValveSnapshot::default(),
            hot: ValveSnapshot::default(),
            counts: [u32::from(day) * 100 + u32::from(hour), 0, 0],
            pressure: [0, 0],
            leaks: LeakState::default(),
            kind,
        }
    }

    async fn store() -> (Arc<MemFram>, FramStore) {
        let bus = Arc::new(MemFram::new());
        let store = FramStore::new(bus.clone());
        let rtc = SimRtc::new(DateTime::new(1, 5, 2024, 0, 0, 0).unwrap());
        store.init(&rtc, 0).await;
        (bus, store)
    }

    #[tokio::test]
    async fn test_index_descending_by_timestamp() {
        let (_bus, store) = store().await;
        for (day, hour) in [(3, 10), (1, 23), (3, 9), (2, 0)] {
            store
                .append_log(&record(day, hour, EventKind::Data))
                .await
                .unwrap();
        }
        let index = SortIndex::build(&store).await;
        assert_eq!(index.len(), 4);
        let stamps: Vec<_> = index.iter().map(|e| e.record.timestamp).collect();
        let mut sorted = stamps.clone();
        sorted.sort_by(|a, b| b.cmp(a));
        assert_eq!(stamps, sorted);
        assert_eq!(index.addr(0), Some(LOG_BASE));
        assert_eq!(index.get(3).unwrap().record.timestamp.day(), 1);
    }

    #[tokio::test]
    async fn test_corrupt_blocks_excluded() {
        let (bus, store) = store().await;
        let mut addrs = Vec::new();
        for day in 1..=3 {
            addrs.push(
                store
                    .append_log(&record(day, 12, EventKind::Data))
                    .await
                    .unwrap(),
            );
        }
        bus.corrupt(addrs[2] + 10);
        let index = SortIndex::build(&store).await;
        assert_eq!(index.len(), 2);
        assert!(index.iter().all(|e| e.addr != addrs[2]));
    }

    #[tokio::test]
    async fn test_kind_filter_and_date_lookup() {
        let (_bus, store) = store().await;
        store
            .append_log(&record(4, 8, EventKind::Data))
            .await
            .unwrap();
        store
            .append_log(&record(4, 15, EventKind::Alarm))
            .await
            .unwrap();
        store
            .append_log(&record(4, 23, EventKind::Data))
            .await
            .unwrap();

        let all = SortIndex::build(&store).await;
        assert_eq!(all.len(), 3);
        let data = SortIndex::build_kind(&store, EventKind::Data).await;
        assert_eq!(data.len(), 2);

        let day = DateTime::new(4, 5, 2024, 0, 0, 0).unwrap();
        let hit = data.newest_on(&day).unwrap();
        assert_eq!(hit.record.timestamp.hour(), 23);
        let other = DateTime::new(5, 5, 2024, 0, 0, 0).unwrap();
        assert!(data.newest_on(&other).is_none());
    }

    #[test]
    fn test_newest_limit() {
        let entries = (1..=5)
            .map(|day| SortEntry {
                addr: LOG_BASE + u16::from(day) * 32,
                record: record(day, 0, EventKind::Data),
            })
            .collect();
        let index = SortIndex::from_entries(entries, 0);
        assert_eq!(index.newest(2).len(), 2);
        assert_eq!(index.newest(2)[0].record.timestamp.day(), 5);
        assert_eq!(index.newest(0).len(), 5);
        assert_eq!(index.newest(9).len(), 5);
    }

    #[test]
    fn test_equal_stamps_order_by_address() {
        let entries = vec![
            SortEntry {
                addr: 0x40,
                record: record(1, 0, EventKind::Data),
            },
            SortEntry {
                addr: 0x60,
                record: record(1, 0, EventKind::Data),
            },
        ];
        let index = SortIndex::from_entries(entries, 0);
        assert_eq!(index.addr(0), Some(0x60));
    }
}
