//! Observed device state shared between the tasks
//!
//! Each field has a single writer: valve errors belong to the valve task,
//! pressures to the pressure sampler. Readers take plain atomic loads.

use std::fmt;
use std::sync::atomic::{AtomicU16, AtomicU8, Ordering};

use serde::{Deserialize, Serialize};

use crate::core::hal::{LeakSensor, SensorInputs, Valve, ValvePins};

/// Valve position derived from the two position lines
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum ValveStatus {
    Undefined = 0,
    Closed = 1,
    Open = 2,
}

impl ValveStatus {
    /// Open and close lines are active low; equal levels mean travel or a fault
    pub fn from_lines(opn: bool, cls: bool) -> Self {
        match (opn, cls) {
            (false, true) => ValveStatus::Open,
            (true, false) => ValveStatus::Closed,
            _ => ValveStatus::Undefined,
        }
    }

    pub fn from_bits(bits: u8) -> Self {
        match bits & 0x03 {
            1 => ValveStatus::Closed,
            2 => ValveStatus::Open,
            _ => ValveStatus::Undefined,
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            ValveStatus::Undefined => "UNDEF",
            ValveStatus::Closed => "CLOSE",
            ValveStatus::Open => "OPEN",
        }
    }
}

impl fmt::Display for ValveStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

/// Latched drive fault; anything but `Ok` blocks further control
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum ValveError {
    Ok = 0,
    Overload = 1,
    NoPower = 2,
    Timeout = 3,
}

impl ValveError {
    pub fn from_bits(bits: u8) -> Self {
        match bits & 0x03 {
            1 => ValveError::Overload,
            2 => ValveError::NoPower,
            3 => ValveError::Timeout,
            _ => ValveError::Ok,
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            ValveError::Ok => "OK",
            ValveError::Overload => "OVERLOAD",
            ValveError::NoPower => "NO POWER",
            ValveError::Timeout => "TIMEOUT",
        }
    }
}

impl fmt::Display for ValveError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

/// Status and error of one valve as carried in records and packets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValveSnapshot {
    pub status: ValveStatus,
    pub error: ValveError,
}

impl Default for ValveSnapshot {
    fn default() -> Self {
        Self {
            status: ValveStatus::Undefined,
            error: ValveError::Ok,
        }
    }
}

impl ValveSnapshot {
    /// `status` in bits 0-1, `error` in bits 2-3
    pub fn nibble(self) -> u8 {
        (self.status as u8) | ((self.error as u8) << 2)
    }

    pub fn from_nibble(bits: u8) -> Self {
        Self {
            status: ValveStatus::from_bits(bits),
            error: ValveError::from_bits(bits >> 2),
        }
    }
}

/// Both valves packed into one byte: cold in the low nibble, hot in the high nibble
pub fn valve_byte(cold: ValveSnapshot, hot: ValveSnapshot) -> u8 {
    cold.nibble() | (hot.nibble() << 4)
}

pub fn split_valve_byte(byte: u8) -> (ValveSnapshot, ValveSnapshot) {
    (
        ValveSnapshot::from_nibble(byte & 0x0F),
        ValveSnapshot::from_nibble(byte >> 4),
    )
}

/// Water meters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Meter {
    Cold,
    Hot,
    Filter,
}

impl Meter {
    pub const ALL: [Meter; 3] = [Meter::Cold, Meter::Hot, Meter::Filter];

    pub fn index(self) -> usize {
        match self {
            Meter::Cold => 0,
            Meter::Hot => 1,
            Meter::Filter => 2,
        }
    }

    /// Supply line the meter sits on; the filter is fed from the cold line
    pub fn line(self) -> Valve {
        match self {
            Meter::Hot => Valve::Hot,
            Meter::Cold | Meter::Filter => Valve::Cold,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Meter::Cold => "cold",
            Meter::Hot => "hot",
            Meter::Filter => "filter",
        }
    }
}

/// Leak and supply inputs sampled together
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LeakState {
    pub leak1: bool,
    pub leak2: bool,
    pub dc12_ok: bool,
}

impl LeakState {
    pub fn read(inputs: &dyn SensorInputs) -> Self {
        Self {
            leak1: inputs.leak(LeakSensor::One),
            leak2: inputs.leak(LeakSensor::Two),
            dc12_ok: inputs.dc12_ok(),
        }
    }

    pub fn any(&self) -> bool {
        self.leak1 || self.leak2
    }

    /// `leak1` b0, `leak2` b1, `dc12` b7
    pub fn flags(&self) -> u8 {
        u8::from(self.leak1) | (u8::from(self.leak2) << 1) | (u8::from(self.dc12_ok) << 7)
    }
}

/// Everything the links report about the device at one instant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeviceSnapshot {
    pub cold: ValveSnapshot,
    pub hot: ValveSnapshot,
    pub counts: [u32; 3],
    /// Hundredths of bar, cold then hot
    pub pressure: [u16; 2],
    pub leaks: LeakState,
}

impl DeviceSnapshot {
    pub fn valve(&self, valve: Valve) -> ValveSnapshot {
        match valve {
            Valve::Cold => self.cold,
            Valve::Hot => self.hot,
        }
    }

    pub fn count(&self, meter: Meter) -> u32 {
        self.counts[meter.index()]
    }

    pub fn line_pressure(&self, valve: Valve) -> u16 {
        self.pressure[valve.index()]
    }

    pub fn valve_byte(&self) -> u8 {
        valve_byte(self.cold, self.hot)
    }
}

/// Cross-task device state
#[derive(Debug, Default)]
pub struct SharedState {
    valve_error: [AtomicU8; 2],
    pressure: [AtomicU16; 2],
}

impl SharedState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn valve_error(&self, valve: Valve) -> ValveError {
        ValveError::from_bits(self.valve_error[valve.index()].load(Ordering::Acquire))
    }

    /// Owned by the valve task
    pub fn set_valve_error(&self, valve: Valve, error: ValveError) {
        self.valve_error[valve.index()].store(error as u8, Ordering::Release);
    }

    /// Pressure in hundredths of bar
    pub fn pressure(&self, valve: Valve) -> u16 {
        self.pressure[valve.index()].load(Ordering::Acquire)
    }

    /// Owned by the pressure sampler
    pub fn set_pressure(&self, valve: Valve, value: u16) {
        self.pressure[valve.index()].store(value, Ordering::Release);
    }

    pub fn valve_snapshot(&self, pins: &dyn ValvePins, valve: Valve) -> ValveSnapshot {
        let (opn, cls) = pins.position_lines(valve);
        ValveSnapshot {
            status: ValveStatus::from_lines(opn, cls),
            error: self.valve_error(valve),
        }
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    #[test]
    fn test_status_from_lines() {
        assert_eq!(ValveStatus::from_lines(false, true), ValveStatus::Open);
        assert_eq!(ValveStatus::from_lines(true, false), ValveStatus::Closed);
        assert_eq!(ValveStatus::from_lines(true, true), ValveStatus::Undefined);
        assert_eq!(
            ValveStatus::from_lines(false, false),
            ValveStatus::Undefined
        );
    }

    #[test]
    fn test_valve_byte_layout() {
        let cold = ValveSnapshot {
            status: ValveStatus::Open,
            error: ValveError::Overload,
        };
        let hot = ValveSnapshot {
            status: ValveStatus::Closed,
            error: ValveError::Timeout,
        };
        // cold: 0b01_10, hot: 0b11_01
        assert_eq!(valve_byte(cold, hot), 0xD6);
        assert_eq!(split_valve_byte(0xD6), (cold, hot));
    }

    #[test]
    fn test_leak_flags() {
        let state = LeakState {
            leak1: false,
            leak2: true,
            dc12_ok: true,
        };
        assert_eq!(state.flags(), 0x82);
        assert!(state.any());
    }

    #[test]
    fn test_filter_meter_reports_cold_line() {
        assert_eq!(Meter::Filter.line(), Valve::Cold);
        assert_eq!(Meter::Hot.line(), Valve::Hot);
        let snapshot = DeviceSnapshot {
            pressure: [250, 310],
            ..Default::default()
        };
        assert_eq!(snapshot.line_pressure(Meter::Filter.line()), 250);
    }

    #[test]
    fn test_shared_state_defaults() {
        let state = SharedState::new();
        assert_eq!(state.valve_error(Valve::Hot), ValveError::Ok);
        state.set_valve_error(Valve::Hot, ValveError::NoPower);
        assert_eq!(state.valve_error(Valve::Hot), ValveError::NoPower);
        assert_eq!(state.valve_error(Valve::Cold), ValveError::Ok);
    }
}
