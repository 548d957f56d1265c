//! FRAM block payloads
//!
//! Layouts are packed little-endian and never depend on Rust struct layout.

use thiserror::Error;

use crate::core::time::DateTime;
use crate::device::state::{
    split_valve_byte, valve_byte, DeviceSnapshot, LeakState, Meter, ValveSnapshot,
};

use super::fram::LOG_BASE;

/// Payload size of the totals block
pub const TOTALS_LEN: usize = 24;
/// Payload size of a log record block
pub const RECORD_LEN: usize = 26;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RecordError {
    #[error("block too short: {0} bytes")]
    Short(usize),
    #[error("bad timestamp: {0}")]
    Timestamp(String),
}

/// Cumulative meter values and the log write pointer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CurrentTotals {
    /// Liters
    pub counts: [u32; 3],
    pub next_addr: u16,
    pub reset_source: u8,
    pub power_on: DateTime,
}

impl Default for CurrentTotals {
    fn default() -> Self {
        Self {
            counts: [0; 3],
            next_addr: LOG_BASE,
            reset_source: 0,
            power_on: DateTime::default(),
        }
    }
}

impl CurrentTotals {
    pub fn count(&self, meter: Meter) -> u32 {
        self.counts[meter.index()]
    }

    pub fn set_count(&mut self, meter: Meter, value: u32) {
        self.counts[meter.index()] = value;
    }

    /// `count_cold, count_hot, count_filter, reserved u16, next_addr u16,
    /// reset_source, day, month, year u16, hour, min, sec`
    pub fn encode(&self) -> [u8; TOTALS_LEN] {
        let mut out = [0u8; TOTALS_LEN];
        out[0..4].copy_from_slice(&self.counts[0].to_le_bytes());
        out[4..8].copy_from_slice(&self.counts[1].to_le_bytes());
        out[8..12].copy_from_slice(&self.counts[2].to_le_bytes());
        out[14..16].copy_from_slice(&self.next_addr.to_le_bytes());
        out[16] = self.reset_source;
        out[17] = self.power_on.day();
        out[18] = self.power_on.month();
        out[19..21].copy_from_slice(&self.power_on.year().to_le_bytes());
        out[21] = self.power_on.hour();
        out[22] = DateTime::min(&self.power_on);
        out[23] = self.power_on.sec();
        out
    }

    /// An invalid power-on stamp decodes as the default date
    pub fn decode(data: &[u8]) -> Result<Self, RecordError> {
        if data.len() < TOTALS_LEN {
            return Err(RecordError::Short(data.len()));
        }
        let power_on = DateTime::new(
            data[17],
            data[18],
            u16::from_le_bytes([data[19], data[20]]),
            data[21],
            data[22],
            data[23],
        )
        .unwrap_or_default();
        Ok(Self {
            counts: [read_u32(data, 0), read_u32(data, 4), read_u32(data, 8)],
            next_addr: u16::from_le_bytes([data[14], data[15]]),
            reset_source: data[16],
            power_on,
        })
    }
}

/// Record kind, bit 6 of the flags byte
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// Interval data (daily rollover)
    Data,
    /// Leak alarm
    Alarm,
}

/// Snapshot written to the circular log
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogRecord {
    pub timestamp: DateTime,
    pub cold: ValveSnapshot,
    pub hot: ValveSnapshot,
    pub counts: [u32; 3],
    /// Hundredths of bar, cold then hot
    pub pressure: [u16; 2],
    pub leaks: LeakState,
    pub kind: EventKind,
}

impl LogRecord {
    pub fn from_snapshot(snapshot: &DeviceSnapshot, timestamp: DateTime, kind: EventKind) -> Self {
        Self {
            timestamp,
            cold: snapshot.cold,
            hot: snapshot.hot,
            counts: snapshot.counts,
            pressure: snapshot.pressure,
            leaks: snapshot.leaks,
            kind,
        }
    }

    /// The device state the record was taken from
    pub fn snapshot(&self) -> DeviceSnapshot {
        DeviceSnapshot {
            cold: self.cold,
            hot: self.hot,
            counts: self.counts,
            pressure: self.pressure,
            leaks: self.leaks,
        }
    }

    pub fn count(&self, meter: Meter) -> u32 {
        self.counts[meter.index()]
    }

    pub fn flags(&self) -> u8 {
        let kind = match self.kind {
            EventKind::Data => 0,
            EventKind::Alarm => 1 << 6,
        };
        self.leaks.flags() | kind
    }

    pub fn valve_byte(&self) -> u8 {
        valve_byte(self.cold, self.hot)
    }

    /// `sec, min, hour, day, month, year u16, reserved, valves, count_cold,
    /// count_hot, count_filter, pressure_cold, pressure_hot, flags`
    pub fn encode(&self) -> [u8; RECORD_LEN] {
        let ts = &self.timestamp;
        let mut out = [0u8; RECORD_LEN];
        out[0] = ts.sec();
        out[1] = ts.min();
        out[2] = ts.hour();
        out[3] = ts.day();
        out[4] = ts.month();
        out[5..7].copy_from_slice(&ts.year().to_le_bytes());
        out[8] = self.valve_byte();
        out[9..13].copy_from_slice(&self.counts[0].to_le_bytes());
        out[13..17].copy_from_slice(&self.counts[1].to_le_bytes());
        out[17..21].copy_from_slice(&self.counts[2].to_le_bytes());
        out[21..23].copy_from_slice(&self.pressure[0].to_le_bytes());
        out[23..25].copy_from_slice(&self.pressure[1].to_le_bytes());
        out[25] = self.flags();
        out
    }

    pub fn decode(data: &[u8]) -> Result<Self, RecordError> {
        if data.len() < RECORD_LEN {
            return Err(RecordError::Short(data.len()));
        }
        let timestamp = DateTime::new(
            data[3],
            data[4],
            u16::from_le_bytes([data[5], data[6]]),
            data[2],
            data[1],
            data[0],
        )
        .map_err(|e| RecordError::Timestamp(e.to_string()))?;
        let (cold, hot) = split_valve_byte(data[8]);
        let flags = data[25];
        Ok(Self {
            timestamp,
            cold,
            hot,
            counts: [read_u32(data, 9), read_u32(data, 13), read_u32(data, 17)],
            pressure: [
                u16::from_le_bytes([data[21], data[22]]),
                u16::from_le_bytes([data[23], data[24]]),
            ],
            leaks: LeakState {
                leak1: flags & 0x01 != 0,
                leak2: flags & 0x02 != 0,
                dc12_ok: flags & 0x80 != 0,
            },
            kind: if flags & 0x40 != 0 {
                EventKind::Alarm
            } else {
                EventKind::Data
            },
        })
    }
}

fn read_u32(data: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]])
}
