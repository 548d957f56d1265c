//! Non-volatile storage
//!
//! - **`fram`** - block store with the current totals and the circular log
//! - **`records`** - packed layouts of the totals and log blocks
//! - **`sort`** - newest-first index over the log

pub mod fram;
pub mod records;
pub mod sort;

pub use fram::{BlockKind, FramError, FramStore, InitStatus};
pub use records::{CurrentTotals, EventKind, LogRecord};
pub use sort::{SortEntry, SortIndex};
