//! MODBUS-RTU slave
//!
//! Twelve registers: valve and leak status, the three meter totals, the two
//! line pressures and the clock. Register 0 doubles as the valve control word,
//! registers 9..=11 set the clock.

pub mod frame;
pub mod link;
pub mod registers;
pub mod slave;

pub use frame::ModbusError;
pub use slave::{ModbusSlave, ModbusStats};
