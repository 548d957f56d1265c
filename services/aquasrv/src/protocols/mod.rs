//! External links of the controller
//!
//! - [`can`]: status and control over the CAN bus
//! - [`modbus`]: MODBUS-RTU slave on the RS-485 line
//! - [`zigbee`]: radio module command layer and the data channel to the coordinator
//!
//! Each link keeps its own counters, printed by the console `stat` verb.

pub mod can;
pub mod modbus;
pub mod zigbee;

use std::time::Duration;

use tokio_serial::{SerialPortBuilderExt, SerialStream};
use tracing::{debug, error, info};

use crate::error::{AquaSrvError, Result};

/// Read timeout handed to the serial driver
const SERIAL_TIMEOUT: Duration = Duration::from_millis(100);

/// One counter line of the `stat` output: dotted description, right-aligned value
pub fn stat_line(desc: &str, value: u32) -> String {
    format!("{:.<45}{:>6}", desc, value)
}

/// Open a serial port 8N1 without flow control
pub fn open_serial(port: &str, baud: u32) -> Result<SerialStream> {
    debug!("Opening serial port: {} @ {}", port, baud);
    let result = tokio_serial::new(port, baud)
        .data_bits(tokio_serial::DataBits::Eight)
        .parity(tokio_serial::Parity::None)
        .stop_bits(tokio_serial::StopBits::One)
        .flow_control(tokio_serial::FlowControl::None)
        .timeout(SERIAL_TIMEOUT)
        .open_native_async();

    match result {
        Ok(stream) => {
            info!("Opened serial port: {}", port);
            Ok(stream)
        },
        Err(e) => {
            let msg = format!("Failed to open serial port {}: {}", port, e);
            error!("{}", msg);
            Err(AquaSrvError::io(msg))
        },
    }
}
