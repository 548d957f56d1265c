//! CAN frame model, identifier filter and bit timing

use std::fmt;

use serde::{Deserialize, Serialize};

/// Low identifier bits carrying the sub-command
pub const SUB_ID_MASK: u32 = 0x03;
/// Largest 11-bit identifier
pub const MAX_STD_ID: u32 = 0x7FF;
/// Largest 29-bit identifier
pub const MAX_EXT_ID: u32 = 0x1FFF_FFFF;

/// Time quanta in segment 1 (propagation + phase 1)
pub const TIME_SEG1_TQ: u8 = 13;
/// Time quanta in segment 2
pub const TIME_SEG2_TQ: u8 = 2;

/// Identifier width
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum CanAddressing {
    Standard = 0,
    Extended = 1,
}

impl CanAddressing {
    pub fn from_bits(bits: u32) -> Option<Self> {
        match bits {
            11 => Some(CanAddressing::Standard),
            29 => Some(CanAddressing::Extended),
            _ => None,
        }
    }

    pub fn from_index(index: u8) -> Option<Self> {
        match index {
            0 => Some(CanAddressing::Standard),
            1 => Some(CanAddressing::Extended),
            _ => None,
        }
    }

    pub fn bits(self) -> u8 {
        match self {
            CanAddressing::Standard => 11,
            CanAddressing::Extended => 29,
        }
    }

    pub fn max_id(self) -> u32 {
        match self {
            CanAddressing::Standard => MAX_STD_ID,
            CanAddressing::Extended => MAX_EXT_ID,
        }
    }
}

/// Bus bit rate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[repr(u8)]
pub enum CanSpeed {
    Kbit10 = 0,
    Kbit20,
    Kbit50,
    #[default]
    Kbit125,
    Kbit250,
    Kbit500,
}

/// Speed, kbit/s, prescaler for a 32 MHz peripheral clock (sample point 87.5 %)
const TIMING_TABLE: [(CanSpeed, u16, u16); 6] = [
    (CanSpeed::Kbit10, 10, 200),
    (CanSpeed::Kbit20, 20, 100),
    (CanSpeed::Kbit50, 50, 40),
    (CanSpeed::Kbit125, 125, 16),
    (CanSpeed::Kbit250, 250, 8),
    (CanSpeed::Kbit500, 500, 4),
];

impl CanSpeed {
    pub fn from_kbit(kbit: u32) -> Option<Self> {
        TIMING_TABLE
            .iter()
            .find(|(_, k, _)| u32::from(*k) == kbit)
            .map(|(s, _, _)| *s)
    }

    pub fn from_index(index: u8) -> Option<Self> {
        TIMING_TABLE.get(usize::from(index)).map(|(s, _, _)| *s)
    }

    pub fn index(self) -> u8 {
        self as u8
    }

    pub fn kbit(self) -> u16 {
        TIMING_TABLE[self as usize].1
    }

    pub fn timing(self) -> BitTiming {
        BitTiming {
            prescaler: TIMING_TABLE[self as usize].2,
            seg1: TIME_SEG1_TQ,
            seg2: TIME_SEG2_TQ,
        }
    }
}

/// Bit timing register values
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BitTiming {
    pub prescaler: u16,
    pub seg1: u8,
    pub seg2: u8,
}

/// One frame on the bus
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct CanFrame {
    pub id: u32,
    pub extended: bool,
    /// Remote transmission request
    pub remote: bool,
    len: u8,
    data: [u8; 8],
}

impl CanFrame {
    /// Data frame; payload beyond 8 bytes is cut off
    pub fn data(id: u32, extended: bool, payload: &[u8]) -> Self {
        let len = payload.len().min(8);
        let mut data = [0u8; 8];
        data[..len].copy_from_slice(&payload[..len]);
        Self {
            id,
            extended,
            remote: false,
            len: len as u8,
            data,
        }
    }

    pub fn remote(id: u32, extended: bool) -> Self {
        Self {
            id,
            extended,
            remote: true,
            len: 0,
            data: [0; 8],
        }
    }

    pub fn payload(&self) -> &[u8] {
        &self.data[..usize::from(self.len)]
    }

    pub fn len(&self) -> usize {
        usize::from(self.len)
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Sub-command carried in the low identifier bits
    pub fn sub_id(&self) -> u32 {
        self.id & SUB_ID_MASK
    }
}

impl fmt::Debug for CanFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "CanFrame(0x{:X}{}{} [{}])",
            self.id,
            if self.extended { " ext" } else { "" },
            if self.remote { " rtr" } else { "" },
            common::hex::encode_upper(self.payload())
        )
    }
}

/// Identifier/mask acceptance filter; mask bits set to 1 must match exactly
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CanFilter {
    pub id: u32,
    pub mask: u32,
    pub extended: bool,
}

impl CanFilter {
    /// Accept the device identifier with any sub-command
    pub fn for_device(can_id: u32, addressing: CanAddressing) -> Self {
        Self {
            id: can_id & addressing.max_id(),
            mask: !SUB_ID_MASK & addressing.max_id(),
            extended: addressing == CanAddressing::Extended,
        }
    }

    pub fn accepts(&self, frame: &CanFrame) -> bool {
        frame.extended == self.extended && (frame.id & self.mask) == (self.id & self.mask)
    }
}

/// Sub-commands of received frames
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CanCommand {
    Control,
    DateTime,
    LogQuery,
}

impl CanCommand {
    pub fn from_sub_id(sub: u32) -> Option<Self> {
        match sub {
            0 => Some(CanCommand::Control),
            1 => Some(CanCommand::DateTime),
            2 => Some(CanCommand::LogQuery),
            _ => None,
        }
    }
}

/// Valve control codes in the first data byte
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CtrlCommand {
    CloseAll,
    OpenAll,
    ColdOpen,
    ColdClose,
    HotOpen,
    HotClose,
}

impl CtrlCommand {
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(CtrlCommand::CloseAll),
            1 => Some(CtrlCommand::OpenAll),
            2 => Some(CtrlCommand::ColdOpen),
            3 => Some(CtrlCommand::ColdClose),
            4 => Some(CtrlCommand::HotOpen),
            5 => Some(CtrlCommand::HotClose),
            _ => None,
        }
    }
}

/// Message identifiers of transmitted answers, OR-ed onto the device identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum AnswerId {
    /// Leak broadcast
    Leak = 0,
    DateTime = 1,
    Cold = 2,
    Hot = 3,
    Filter = 4,
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    #[test]
    fn test_speed_table() {
        assert_eq!(CanSpeed::from_kbit(125), Some(CanSpeed::Kbit125));
        assert_eq!(CanSpeed::from_kbit(100), None);
        assert_eq!(CanSpeed::Kbit10.timing().prescaler, 200);
        assert_eq!(CanSpeed::Kbit500.timing().prescaler, 4);
        assert_eq!(CanSpeed::default().kbit(), 125);
        // 32 MHz / (prescaler * 16 TQ)
        for speed in [CanSpeed::Kbit20, CanSpeed::Kbit50, CanSpeed::Kbit250] {
            let t = speed.timing();
            let tq = 1 + u32::from(t.seg1) + u32::from(t.seg2);
            assert_eq!(32_000 / (u32::from(t.prescaler) * tq), u32::from(speed.kbit()));
        }
    }

    #[test]
    fn test_filter_ignores_sub_command_bits() {
        let filter = CanFilter::for_device(0x120, CanAddressing::Standard);
        for sub in 0..4 {
            assert!(filter.accepts(&CanFrame::remote(0x120 | sub, false)));
        }
        assert!(!filter.accepts(&CanFrame::remote(0x124, false)));
        assert!(!filter.accepts(&CanFrame::remote(0x120, true)));
    }

    #[test]
    fn test_extended_filter() {
        let filter = CanFilter::for_device(0x1ABC_DE00, CanAddressing::Extended);
        assert!(filter.accepts(&CanFrame::data(0x1ABC_DE02, true, &[1])));
        assert!(!filter.accepts(&CanFrame::data(0x0ABC_DE02, true, &[1])));
    }

    #[test]
    fn test_frame_payload_truncated() {
        let frame = CanFrame::data(0x10, false, &[0; 12]);
        assert_eq!(frame.len(), 8);
        assert_eq!(frame.sub_id(), 0);
        assert_eq!(CanFrame::data(0x13, false, &[]).sub_id(), 3);
    }
}
