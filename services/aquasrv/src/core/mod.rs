//! Core building blocks shared by every subsystem
//!
//! - **`crc`** - CRC-16 used by storage and all three links
//! - **`events`** - event flag groups connecting the tasks
//! - **`framing`** - idle-gap framing for the serial links
//! - **`hal`** - traits over the board peripherals
//! - **`sim`** - in-memory board used by tests and `--simulate`
//! - **`time`** - calendar date/time and the host clock
//! - **`context`** - the device context handed to every task

pub mod context;
pub mod crc;
pub mod events;
pub mod framing;
pub mod hal;
pub mod sim;
pub mod time;
