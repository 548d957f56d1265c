//! Device control
//!
//! - **`flags`** - event flags of the valve and water tasks
//! - **`state`** - valve, meter and leak state shared between tasks
//! - **`valve`** - valve drive state machine with stroke supervision
//! - **`keys`** - debounced scan of keys, drive senses and leak inputs
//! - **`water`** - meter totals, pressure sampling and event logging

pub mod flags;
pub mod keys;
pub mod state;
pub mod valve;
pub mod water;

pub use keys::KeyScanner;
pub use valve::{DriveCommand, ValveController};
pub use water::WaterMonitor;
