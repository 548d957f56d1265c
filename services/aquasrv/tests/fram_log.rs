#![allow(clippy::disallowed_methods)]
//! FRAM log persistence and ordering

use std::sync::Arc;

use aquasrv::core::sim::{MemFram, SimRtc};
use aquasrv::core::time::DateTime;
use aquasrv::device::state::{DeviceSnapshot, Meter};
use aquasrv::storage::fram::{BLOCK_SIZE, LOG_BASE, LOG_BLOCKS};
use aquasrv::storage::{EventKind, FramStore, LogRecord, SortIndex};

fn stamp(i: usize) -> DateTime {
    DateTime::new(1, 3, 2024, (i / 60) as u8, (i % 60) as u8, 0).unwrap()
}

async fn open(bus: Arc<MemFram>) -> FramStore {
    let store = FramStore::new(bus);
    let rtc = SimRtc::new(DateTime::new(1, 3, 2024, 0, 0, 0).unwrap());
    store.init(&rtc, 0).await;
    store
}

#[tokio::test]
async fn log_pointer_wraps_and_index_stays_ordered() {
    let store = open(Arc::new(MemFram::new())).await;
    let snapshot = DeviceSnapshot::default();
    let mut last = 0;
    for i in 0..=LOG_BLOCKS {
        let record = LogRecord::from_snapshot(&snapshot, stamp(i), EventKind::Data);
        last = store.append_log(&record).await.unwrap();
    }
    // the block after the last one reuses the start of the region
    assert_eq!(last, LOG_BASE);
    assert_eq!(store.totals().next_addr, LOG_BASE + BLOCK_SIZE);

    let index = SortIndex::build(&store).await;
    assert_eq!(index.len(), LOG_BLOCKS);
    assert_eq!(index.addr(0), Some(LOG_BASE));
    assert_eq!(index.get(0).unwrap().record.timestamp, stamp(LOG_BLOCKS));
    let stamps: Vec<DateTime> = index.iter().map(|e| e.record.timestamp).collect();
    assert!(stamps.windows(2).all(|w| w[0] > w[1]));
}

#[tokio::test]
async fn totals_survive_a_restart() {
    let bus = Arc::new(MemFram::new());
    let store = open(bus.clone()).await;
    store
        .update_totals(|t| {
            t.set_count(Meter::Cold, 123_450);
            t.set_count(Meter::Filter, 7);
        })
        .await
        .unwrap();
    let before = store.totals();
    drop(store);

    let reopened = open(bus).await;
    let after = reopened.totals();
    assert_eq!(after.counts, before.counts);
    assert_eq!(after.next_addr, before.next_addr);
    assert_eq!(after.count(Meter::Cold), 123_450);
}
