//! MODBUS slave request pipeline
//!
//! CRC, slave address, function, register range, value range, then the
//! register side effect. Failures after the address check are answered with
//! an exception; CRC, address and malformed frames get no answer at all.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use tracing::{debug, info, warn};

use super::frame::{
    check_frame, exception_response, read_response, write_response, ModbusError, Request,
    RequestKind,
};
use super::registers::{
    check_read, check_values, check_write, control_events, datetime_from_registers,
    read_registers, register_image, REG_CTRL, REG_DAY_MONTH,
};
use crate::core::context::DeviceContext;
use crate::protocols::stat_line;

/// Received frame total plus one counter per outcome
#[derive(Debug, Default)]
pub struct ModbusStats {
    recv_total: AtomicU32,
    outcomes: [AtomicU32; 12],
}

impl ModbusStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn recv_total(&self) -> u32 {
        self.recv_total.load(Ordering::Relaxed)
    }

    /// Requests completed without error
    pub fn ok_count(&self) -> u32 {
        self.outcomes[0].load(Ordering::Relaxed)
    }

    pub fn error_count(&self, err: ModbusError) -> u32 {
        self.outcomes[err.index()].load(Ordering::Relaxed)
    }

    fn count_received(&self) {
        self.recv_total.fetch_add(1, Ordering::Relaxed);
    }

    fn record(&self, outcome: Result<(), ModbusError>) {
        let index = outcome.err().map_or(0, ModbusError::index);
        self.outcomes[index].fetch_add(1, Ordering::Relaxed);
    }

    pub fn lines(&self) -> Vec<String> {
        let mut lines = vec![stat_line("Total packages recv", self.recv_total())];
        lines.extend(
            ModbusError::ALL
                .iter()
                .map(|e| stat_line(&e.to_string(), self.error_count(*e))),
        );
        lines
    }
}

/// Register side of the slave
pub struct ModbusSlave {
    ctx: Arc<DeviceContext>,
}

impl ModbusSlave {
    pub fn new(ctx: Arc<DeviceContext>) -> Self {
        Self { ctx }
    }

    /// Process one received frame; `Some` carries the answer to send
    pub fn process(&self, frame: &[u8]) -> Option<Vec<u8>> {
        let stats = &self.ctx.modbus_stats;
        let header = match check_frame(frame, self.ctx.config().modbus_id()) {
            Ok(header) => header,
            Err(e) => {
                // a frame with a valid CRC counts as received
                if e == ModbusError::NotForDevice {
                    stats.count_received();
                }
                debug!("MODBUS frame dropped: {}", e);
                stats.record(Err(e));
                return None;
            },
        };
        stats.count_received();

        let result = Request::parse(frame, header).and_then(|req| self.execute(&req));
        stats.record(result.as_ref().map(|_| ()).map_err(|e| *e));
        match result {
            Ok(answer) => Some(answer),
            Err(e) => {
                warn!("MODBUS request 0x{:02X} rejected: {}", header.function, e);
                e.exception_code().map(|code| exception_response(header, code))
            },
        }
    }

    fn execute(&self, req: &Request) -> Result<Vec<u8>, ModbusError> {
        match req.kind {
            RequestKind::Read => {
                check_read(req.reg_addr, req.reg_cnt)?;
                let image = register_image(&self.ctx.snapshot(), &self.ctx.now());
                let regs = read_registers(&image, req.reg_addr, req.reg_cnt);
                Ok(read_response(req.header, &regs))
            },
            RequestKind::WriteSingle | RequestKind::WriteMultiple => {
                check_write(req.reg_addr, req.reg_cnt)?;
                check_values(req.reg_addr, &req.values)?;
                self.write(req)?;
                let echo = if req.kind == RequestKind::WriteSingle {
                    req.values.first().copied().unwrap_or_default()
                } else {
                    req.reg_cnt
                };
                Ok(write_response(req.header, req.reg_addr, echo))
            },
        }
    }

    fn write(&self, req: &Request) -> Result<(), ModbusError> {
        match req.reg_addr {
            REG_CTRL => {
                let word = req.values.first().copied().ok_or(ModbusError::Data)?;
                let events = control_events(word)?;
                info!("MODBUS valve command 0x{:04X}", word);
                self.ctx.valve_request(events);
                Ok(())
            },
            REG_DAY_MONTH => {
                let value = datetime_from_registers(&req.values)?;
                self.ctx.set_time(value);
                Ok(())
            },
            _ => Err(ModbusError::Data),
        }
    }
}
