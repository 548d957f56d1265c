//! Hardware abstraction traits
//!
//! Everything the controller reads from or drives on the board goes through
//! these traits. The board support in [`super::sim`] implements them in memory;
//! a hardware build supplies its own implementations.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::time::DateTime;

/// Low level bus errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HalError {
    #[error("Bus error: {0}")]
    Bus(String),
    #[error("Device busy")]
    Busy,
    #[error("Operation timed out")]
    Timeout,
}

/// Water supply line and its motorized valve
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Valve {
    Cold,
    Hot,
}

impl Valve {
    pub const ALL: [Valve; 2] = [Valve::Cold, Valve::Hot];

    pub fn index(self) -> usize {
        match self {
            Valve::Cold => 0,
            Valve::Hot => 1,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Valve::Cold => "cold",
            Valve::Hot => "hot",
        }
    }
}

impl fmt::Display for Valve {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Water leak sensor inputs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LeakSensor {
    One,
    Two,
}

impl LeakSensor {
    pub const ALL: [LeakSensor; 2] = [LeakSensor::One, LeakSensor::Two];

    pub fn number(self) -> u8 {
        match self {
            LeakSensor::One => 1,
            LeakSensor::Two => 2,
        }
    }
}

/// Cause of the last controller start, kept in the totals block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ResetSource {
    PowerOn = 0,
    Pin = 1,
    Software = 2,
    Watchdog = 3,
    LowPower = 4,
}

impl ResetSource {
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(ResetSource::PowerOn),
            1 => Some(ResetSource::Pin),
            2 => Some(ResetSource::Software),
            3 => Some(ResetSource::Watchdog),
            4 => Some(ResetSource::LowPower),
            _ => None,
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            ResetSource::PowerOn => "Power on reset",
            ResetSource::Pin => "External reset pin",
            ResetSource::Software => "Software reset",
            ResetSource::Watchdog => "Watchdog reset",
            ResetSource::LowPower => "Low power reset",
        }
    }
}

/// Front panel LEDs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Led {
    Open(Valve),
    Close(Valve),
    Radio,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedMode {
    Off,
    On,
    Blink,
    /// Single short flash (radio activity)
    Flash,
}

/// Valve drive outputs and the inputs supervising them
pub trait ValvePins: Send + Sync {
    /// Direction and enable outputs of the drive
    fn set_drive(&self, valve: Valve, direction: bool, enable: bool);

    /// Read-back of the enable output
    fn drive_enabled(&self, valve: Valve) -> bool;

    /// Drive current is flowing
    fn load_present(&self, valve: Valve) -> bool;

    /// Over-current input
    fn overload(&self, valve: Valve) -> bool;

    /// Raw levels of the open and close position lines
    fn position_lines(&self, valve: Valve) -> (bool, bool);

    /// Manual key held down
    fn key_pressed(&self, valve: Valve) -> bool;
}

/// Leak sensors and their supply check
pub trait SensorInputs: Send + Sync {
    fn leak(&self, sensor: LeakSensor) -> bool;

    /// 12 V sensor supply present
    fn dc12_ok(&self) -> bool;
}

/// Real time clock
pub trait Rtc: Send + Sync {
    fn now(&self) -> DateTime;
    fn set(&self, value: DateTime);
}

/// Two-channel pressure sensor ADC, 12-bit samples
#[async_trait]
pub trait PressureAdc: Send + Sync {
    async fn sample(&self) -> Result<[u16; 2], HalError>;
}

/// Raw FRAM access; each call completes one bus transfer
#[async_trait]
pub trait FramBus: Send + Sync {
    async fn read(&self, addr: u16, buf: &mut [u8]) -> Result<(), HalError>;
    async fn write(&self, addr: u16, data: &[u8]) -> Result<(), HalError>;
}

pub trait Indicator: Send + Sync {
    fn set_led(&self, led: Led, mode: LedMode);
}

/// Hard reset line and run status of the radio module
pub trait RadioControl: Send + Sync {
    fn set_reset(&self, asserted: bool);
    fn is_running(&self) -> bool;
}
