//! CAN data payloads

use crate::core::time::DateTime;
use crate::device::state::{DeviceSnapshot, LeakState, Meter, ValveSnapshot};

/// Meter reading payload size
pub const COUNT_LEN: usize = 7;
/// Leak broadcast payload size
pub const LEAK_LEN: usize = 2;
/// Log query payload size
pub const LOG_QUERY_LEN: usize = 4;

/// Origin of a meter reading, bit 6 of the status byte
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadingSource {
    Current,
    Log,
}

/// Meter reading with the state of its supply line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CountPayload {
    pub valve: ValveSnapshot,
    pub leaks: LeakState,
    pub source: ReadingSource,
    pub count: u32,
    pub pressure: u16,
}

impl CountPayload {
    pub fn new(snapshot: &DeviceSnapshot, meter: Meter, source: ReadingSource) -> Self {
        let line = meter.line();
        Self {
            valve: snapshot.valve(line),
            leaks: snapshot.leaks,
            source,
            count: snapshot.count(meter),
            pressure: snapshot.line_pressure(line),
        }
    }

    /// `{stat b0-1, err b2-3, leak1 b4, leak2 b5, type b6, dc12 b7}, count u32, pressure u16`
    pub fn encode(&self) -> [u8; COUNT_LEN] {
        let mut out = [0u8; COUNT_LEN];
        out[0] = self.valve.nibble()
            | (u8::from(self.leaks.leak1) << 4)
            | (u8::from(self.leaks.leak2) << 5)
            | (u8::from(self.source == ReadingSource::Log) << 6)
            | (u8::from(self.leaks.dc12_ok) << 7);
        out[1..5].copy_from_slice(&self.count.to_le_bytes());
        out[5..7].copy_from_slice(&self.pressure.to_le_bytes());
        out
    }

    pub fn decode(data: &[u8]) -> Option<Self> {
        if data.len() < COUNT_LEN {
            return None;
        }
        let status = data[0];
        Some(Self {
            valve: ValveSnapshot::from_nibble(status & 0x0F),
            leaks: LeakState {
                leak1: status & 0x10 != 0,
                leak2: status & 0x20 != 0,
                dc12_ok: status & 0x80 != 0,
            },
            source: if status & 0x40 != 0 {
                ReadingSource::Log
            } else {
                ReadingSource::Current
            },
            count: u32::from_le_bytes([data[1], data[2], data[3], data[4]]),
            pressure: u16::from_le_bytes([data[5], data[6]]),
        })
    }
}

/// Valve byte followed by the leak flags
pub fn leak_payload(snapshot: &DeviceSnapshot) -> [u8; LEAK_LEN] {
    [snapshot.valve_byte(), snapshot.leaks.flags()]
}

/// Calendar date of a log query: `day, month, year u16`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogQuery {
    pub day: u8,
    pub month: u8,
    pub year: u16,
}

impl LogQuery {
    pub fn decode(data: &[u8]) -> Option<Self> {
        if data.len() < LOG_QUERY_LEN {
            return None;
        }
        Some(Self {
            day: data[0],
            month: data[1],
            year: u16::from_le_bytes([data[2], data[3]]),
        })
    }

    /// Midnight of the requested date; `None` for an impossible date
    pub fn date(&self) -> Option<DateTime> {
        DateTime::new(self.day, self.month, self.year, 0, 0, 0).ok()
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::device::state::{ValveError, ValveStatus};

    fn snapshot() -> DeviceSnapshot {
        DeviceSnapshot {
            cold: ValveSnapshot {
                status: ValveStatus::Open,
                error: ValveError::Ok,
            },
            hot: ValveSnapshot {
                status: ValveStatus::Closed,
                error: ValveError::Timeout,
            },
            counts: [12_345, 678, 90],
            pressure: [315, 280],
            leaks: LeakState {
                leak1: true,
                leak2: false,
                dc12_ok: true,
            },
        }
    }

    #[test]
    fn test_count_payload_layout() {
        let payload = CountPayload::new(&snapshot(), Meter::Cold, ReadingSource::Current);
        let bytes = payload.encode();
        assert_eq!(bytes[0], 0b1001_0010);
        assert_eq!(&bytes[1..5], &12_345u32.to_le_bytes());
        assert_eq!(&bytes[5..7], &315u16.to_le_bytes());
        assert_eq!(CountPayload::decode(&bytes), Some(payload));
    }

    #[test]
    fn test_filter_uses_cold_line() {
        let payload = CountPayload::new(&snapshot(), Meter::Filter, ReadingSource::Log);
        assert_eq!(payload.count, 90);
        assert_eq!(payload.pressure, 315);
        assert_eq!(payload.valve.status, ValveStatus::Open);
        assert_eq!(payload.encode()[0] & 0x40, 0x40);
    }

    #[test]
    fn test_hot_reports_own_valve() {
        let payload = CountPayload::new(&snapshot(), Meter::Hot, ReadingSource::Current);
        assert_eq!(payload.valve.error, ValveError::Timeout);
        assert_eq!(payload.pressure, 280);
    }

    #[test]
    fn test_leak_payload_keeps_hot_error() {
        let bytes = leak_payload(&snapshot());
        // hot nibble: closed + timeout
        assert_eq!(bytes[0] >> 4, 0b1101);
        assert_eq!(bytes[1], 0x81);
    }

    #[test]
    fn test_log_query() {
        let query = LogQuery::decode(&[14, 6, 0xE8, 0x07]).unwrap();
        assert_eq!(query.year, 2024);
        assert_eq!(query.date().unwrap().day(), 14);
        assert!(LogQuery::decode(&[1, 2, 3]).is_none());
        assert!(LogQuery::decode(&[31, 2, 0xE8, 0x07]).unwrap().date().is_none());
    }
}
