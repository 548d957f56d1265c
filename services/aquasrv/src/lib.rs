//! Water meter and valve controller
//!
//! Counts pulses from the cold, hot and filter water meters, drives two
//! motorized valves, watches two leak sensors and keeps a circular event log
//! in FRAM. The state is served over a MODBUS-RTU slave, a CAN node and a
//! ZigBee radio module, and an operator console reports and configures it.

pub mod bootstrap;
pub mod config;
pub mod console;
pub mod core;
pub mod device;
pub mod error;
pub mod protocols;
pub mod runtime;
pub mod storage;

pub use error::{AquaSrvError, Result};
