//! Event flags of the valve and water tasks

use crate::core::hal::{LeakSensor, Valve};
use crate::device::state::Meter;

bitflags::bitflags! {
    /// Requests and supervision events for the valve task
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ValveEvents: u32 {
        const COLD_STOP = 0x0000_0001;
        const COLD_OPN = 0x0000_0002;
        const COLD_CLS = 0x0000_0004;
        const HOT_STOP = 0x0000_0010;
        const HOT_OPN = 0x0000_0020;
        const HOT_CLS = 0x0000_0040;
        /// Load current expected by now
        const COLD_CHK1 = 0x0000_0100;
        /// Travel window elapsed
        const COLD_CHK2 = 0x0000_0200;
        const HOT_CHK1 = 0x0000_0400;
        const HOT_CHK2 = 0x0000_0800;
        /// Load current dropped: stroke finished
        const COLD_PWR = 0x0000_1000;
        const COLD_OVR = 0x0000_2000;
        const HOT_PWR = 0x0000_4000;
        const HOT_OVR = 0x0000_8000;
        const COLD_KEY = 0x0001_0000;
        const HOT_KEY = 0x0002_0000;
        /// Open/close only when the valve is in the opposite end position
        const PREV_CHECK = 0x0008_0000;
    }
}

impl ValveEvents {
    pub fn open(valve: Valve) -> Self {
        match valve {
            Valve::Cold => Self::COLD_OPN,
            Valve::Hot => Self::HOT_OPN,
        }
    }

    pub fn close(valve: Valve) -> Self {
        match valve {
            Valve::Cold => Self::COLD_CLS,
            Valve::Hot => Self::HOT_CLS,
        }
    }

    pub fn stop(valve: Valve) -> Self {
        match valve {
            Valve::Cold => Self::COLD_STOP,
            Valve::Hot => Self::HOT_STOP,
        }
    }

    pub fn load_check(valve: Valve) -> Self {
        match valve {
            Valve::Cold => Self::COLD_CHK1,
            Valve::Hot => Self::HOT_CHK1,
        }
    }

    pub fn travel_check(valve: Valve) -> Self {
        match valve {
            Valve::Cold => Self::COLD_CHK2,
            Valve::Hot => Self::HOT_CHK2,
        }
    }

    pub fn power_off(valve: Valve) -> Self {
        match valve {
            Valve::Cold => Self::COLD_PWR,
            Valve::Hot => Self::HOT_PWR,
        }
    }

    pub fn overload(valve: Valve) -> Self {
        match valve {
            Valve::Cold => Self::COLD_OVR,
            Valve::Hot => Self::HOT_OVR,
        }
    }

    pub fn key(valve: Valve) -> Self {
        match valve {
            Valve::Cold => Self::COLD_KEY,
            Valve::Hot => Self::HOT_KEY,
        }
    }

    /// Gated variant of a request
    pub fn gated(self) -> Self {
        self | Self::PREV_CHECK
    }
}

bitflags::bitflags! {
    /// Events for the water task
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct WaterEvents: u32 {
        const CNT_COLD = 0x0000_0001;
        const CNT_HOT = 0x0000_0002;
        const CNT_FILTER = 0x0000_0004;
        const LEAK1 = 0x0000_0010;
        const LEAK2 = 0x0000_0020;
        /// Once a second, daily record check
        const LOG = 0x0000_0100;
        /// Pressure sample due
        const PRESSURE = 0x0000_0200;
    }
}

impl WaterEvents {
    pub fn pulse(meter: Meter) -> Self {
        match meter {
            Meter::Cold => Self::CNT_COLD,
            Meter::Hot => Self::CNT_HOT,
            Meter::Filter => Self::CNT_FILTER,
        }
    }

    pub fn leak(sensor: LeakSensor) -> Self {
        match sensor {
            LeakSensor::One => Self::LEAK1,
            LeakSensor::Two => Self::LEAK2,
        }
    }
}
