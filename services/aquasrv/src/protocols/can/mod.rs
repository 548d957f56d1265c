//! CAN bus link
//!
//! - **`frame`** - identifiers, bit timing, acceptance filter and command codes
//! - **`payload`** - meter, leak and log query payloads
//! - **`exchange`** - request handling, transmit queue and error statistics
//! - **`sim`** - loopback controller

pub mod exchange;
pub mod frame;
pub mod payload;
pub mod sim;

pub use exchange::{CanError, CanEvent, CanExchange, CanMessage, CanPeripheral, CanStats};
pub use frame::{AnswerId, CanAddressing, CanFrame, CanSpeed};
pub use sim::SimCan;
