//! Device configuration persisted in the flash page
//!
//! The page is 128 bytes: packed little-endian fields from offset 0, zero
//! padding, and a CRC-16 over the first 126 bytes at offset 126. Every field
//! changes only through a setter that checks the same ranges the console
//! help documents.

use thiserror::Error;

use crate::core::crc::{crc16, stored_crc};
use crate::core::framing::UartSpeed;
use crate::device::state::Meter;
use crate::protocols::can::frame::{CanAddressing, CanSpeed};

/// Flash page size
pub const FLASH_PAGE: usize = 128;
/// Bytes covered by the page CRC
pub const FLASH_DATA_LEN: usize = FLASH_PAGE - 2;
/// Bytes used by the packed fields
const PACKED_LEN: usize = 50;

pub const MAX_INCREMENT: u32 = 1000;
pub const MAX_PRESSURE: f32 = 15.0;
pub const MAX_MODBUS_ID: u8 = 247;
pub const MAX_PAN_ID: u16 = 0xFFFE;
pub const MAX_NET_GROUP: u8 = 99;
pub const MAX_GATE_ADDR: u16 = 0xFFF8;
pub const NET_KEY_LEN: usize = 16;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("Parameter error: {0}")]
    Range(&'static str),
    #[error("Invalid hex value: {0}")]
    Hex(String),
    #[error("CRC error")]
    Crc,
    #[error("No data")]
    Empty,
    #[error("Invalid stored field: {0}")]
    Field(&'static str),
    #[error("Read error: {0}")]
    Read(String),
    #[error("Write error: {0}")]
    Write(String),
    #[error("Service configuration: {0}")]
    Service(String),
}

impl From<common::hex::HexError> for ConfigError {
    fn from(err: common::hex::HexError) -> Self {
        ConfigError::Hex(err.to_string())
    }
}

/// Controller configuration
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Liters per pulse, indexed by [`Meter`]
    increments: [u16; 3],
    /// Sensor full scale, atm
    pressure_max: f32,
    /// Sensor output at zero pressure, V
    press_out_min: f32,
    /// Sensor output at full scale, V
    press_out_max: f32,
    can_id: u32,
    can_addressing: CanAddressing,
    can_speed: CanSpeed,
    modbus_speed: UartSpeed,
    modbus_id: u8,
    debug_speed: UartSpeed,
    net_pan_id: u16,
    net_group: u8,
    net_key: [u8; NET_KEY_LEN],
    dev_numb: u16,
    addr_gate: u16,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            increments: [10, 10, 10],
            pressure_max: 10.0,
            press_out_min: 0.5,
            press_out_max: 4.5,
            can_id: 0x100,
            can_addressing: CanAddressing::Standard,
            can_speed: CanSpeed::Kbit125,
            modbus_speed: UartSpeed::Baud9600,
            modbus_id: 1,
            debug_speed: UartSpeed::Baud115200,
            net_pan_id: 0x1A62,
            net_group: 1,
            net_key: [0; NET_KEY_LEN],
            dev_numb: 1,
            addr_gate: 0x0000,
        }
    }
}

impl Config {
    pub fn increment(&self, meter: Meter) -> u16 {
        self.increments[meter.index()]
    }

    pub fn pressure_max(&self) -> f32 {
        self.pressure_max
    }

    pub fn press_out_min(&self) -> f32 {
        self.press_out_min
    }

    pub fn press_out_max(&self) -> f32 {
        self.press_out_max
    }

    pub fn can_id(&self) -> u32 {
        self.can_id
    }

    pub fn can_addressing(&self) -> CanAddressing {
        self.can_addressing
    }

    pub fn can_speed(&self) -> CanSpeed {
        self.can_speed
    }

    pub fn modbus_speed(&self) -> UartSpeed {
        self.modbus_speed
    }

    pub fn modbus_id(&self) -> u8 {
        self.modbus_id
    }

    pub fn debug_speed(&self) -> UartSpeed {
        self.debug_speed
    }

    pub fn net_pan_id(&self) -> u16 {
        self.net_pan_id
    }

    pub fn net_group(&self) -> u8 {
        self.net_group
    }

    pub fn net_key(&self) -> &[u8; NET_KEY_LEN] {
        &self.net_key
    }

    pub fn dev_numb(&self) -> u16 {
        self.dev_numb
    }

    pub fn addr_gate(&self) -> u16 {
        self.addr_gate
    }

    pub fn set_increment(&mut self, meter: Meter, liters: u32) -> Result<(), ConfigError> {
        if liters > MAX_INCREMENT {
            return Err(ConfigError::Range("increment"));
        }
        self.increments[meter.index()] = liters as u16;
        Ok(())
    }

    pub fn set_debug_speed(&mut self, baud: u32) -> Result<(), ConfigError> {
        self.debug_speed = UartSpeed::from_baud(baud).ok_or(ConfigError::Range("uart speed"))?;
        Ok(())
    }

    pub fn set_modbus_speed(&mut self, baud: u32) -> Result<(), ConfigError> {
        self.modbus_speed =
            UartSpeed::from_baud(baud).ok_or(ConfigError::Range("modbus speed"))?;
        Ok(())
    }

    pub fn set_modbus_id(&mut self, id: u8) -> Result<(), ConfigError> {
        if !(1..=MAX_MODBUS_ID).contains(&id) {
            return Err(ConfigError::Range("modbus id"));
        }
        self.modbus_id = id;
        Ok(())
    }

    /// The identifier must fit the current addressing width
    pub fn set_can_id(&mut self, id: u32) -> Result<(), ConfigError> {
        if id > self.can_addressing.max_id() {
            return Err(ConfigError::Range("can id"));
        }
        self.can_id = id;
        Ok(())
    }

    pub fn set_can_addressing(&mut self, bits: u32) -> Result<(), ConfigError> {
        self.can_addressing =
            CanAddressing::from_bits(bits).ok_or(ConfigError::Range("can addr"))?;
        Ok(())
    }

    pub fn set_can_speed(&mut self, kbit: u32) -> Result<(), ConfigError> {
        self.can_speed = CanSpeed::from_kbit(kbit).ok_or(ConfigError::Range("can speed"))?;
        Ok(())
    }

    pub fn set_pressure_max(&mut self, atm: f32) -> Result<(), ConfigError> {
        if !atm.is_finite() || atm > MAX_PRESSURE {
            return Err(ConfigError::Range("pres_max"));
        }
        self.pressure_max = atm;
        Ok(())
    }

    pub fn set_press_out_min(&mut self, volts: f32) -> Result<(), ConfigError> {
        if !volts.is_finite() || volts >= self.press_out_max {
            return Err(ConfigError::Range("pres_omin"));
        }
        self.press_out_min = volts;
        Ok(())
    }

    pub fn set_press_out_max(&mut self, volts: f32) -> Result<(), ConfigError> {
        if !volts.is_finite() || volts == 0.0 || volts <= self.press_out_min {
            return Err(ConfigError::Range("pres_omax"));
        }
        self.press_out_max = volts;
        Ok(())
    }

    pub fn set_net_pan_id(&mut self, pan_id: u16) -> Result<(), ConfigError> {
        if pan_id > MAX_PAN_ID {
            return Err(ConfigError::Range("panid"));
        }
        self.net_pan_id = pan_id;
        Ok(())
    }

    pub fn set_net_group(&mut self, group: u8) -> Result<(), ConfigError> {
        if !(1..=MAX_NET_GROUP).contains(&group) {
            return Err(ConfigError::Range("netgrp"));
        }
        self.net_group = group;
        Ok(())
    }

    pub fn set_net_key(&mut self, key: [u8; NET_KEY_LEN]) {
        self.net_key = key;
    }

    pub fn set_dev_numb(&mut self, numb: u16) -> Result<(), ConfigError> {
        if numb == 0 {
            return Err(ConfigError::Range("devnumb"));
        }
        self.dev_numb = numb;
        Ok(())
    }

    pub fn set_addr_gate(&mut self, addr: u16) -> Result<(), ConfigError> {
        if addr > MAX_GATE_ADDR {
            return Err(ConfigError::Range("gate"));
        }
        self.addr_gate = addr;
        Ok(())
    }

    /// Pack into a flash page with its CRC
    pub fn encode(&self) -> [u8; FLASH_PAGE] {
        let mut page = [0u8; FLASH_PAGE];
        let mut w = Writer::new(&mut page[..PACKED_LEN]);
        for inc in self.increments {
            w.put(&inc.to_le_bytes());
        }
        w.put(&self.pressure_max.to_le_bytes());
        w.put(&self.press_out_min.to_le_bytes());
        w.put(&self.press_out_max.to_le_bytes());
        w.put(&self.can_id.to_le_bytes());
        w.put(&[
            self.can_addressing as u8,
            self.can_speed.index(),
            self.modbus_speed.index(),
            self.modbus_id,
            self.debug_speed.index(),
        ]);
        w.put(&self.net_pan_id.to_le_bytes());
        w.put(&[self.net_group]);
        w.put(&self.net_key);
        w.put(&self.dev_numb.to_le_bytes());
        w.put(&self.addr_gate.to_le_bytes());
        let crc = crc16(&page[..FLASH_DATA_LEN]);
        page[FLASH_DATA_LEN..].copy_from_slice(&crc.to_le_bytes());
        page
    }

    /// Unpack a flash page; the CRC is checked first
    pub fn decode(page: &[u8]) -> Result<Self, ConfigError> {
        if page.len() < FLASH_PAGE {
            return Err(ConfigError::Empty);
        }
        let stored = stored_crc(page, FLASH_DATA_LEN).ok_or(ConfigError::Empty)?;
        if page[..FLASH_PAGE].iter().all(|&b| b == 0xFF) {
            return Err(ConfigError::Empty);
        }
        if stored != crc16(&page[..FLASH_DATA_LEN]) {
            return Err(ConfigError::Crc);
        }

        let u16_at = |at: usize| u16::from_le_bytes([page[at], page[at + 1]]);
        let f32_at =
            |at: usize| f32::from_le_bytes([page[at], page[at + 1], page[at + 2], page[at + 3]]);
        let mut net_key = [0u8; NET_KEY_LEN];
        net_key.copy_from_slice(&page[30..46]);
        Ok(Self {
            increments: [u16_at(0), u16_at(2), u16_at(4)],
            pressure_max: f32_at(6),
            press_out_min: f32_at(10),
            press_out_max: f32_at(14),
            can_id: u32::from_le_bytes([page[18], page[19], page[20], page[21]]),
            can_addressing: CanAddressing::from_index(page[22])
                .ok_or(ConfigError::Field("can addr"))?,
            can_speed: CanSpeed::from_index(page[23]).ok_or(ConfigError::Field("can speed"))?,
            modbus_speed: UartSpeed::from_index(page[24])
                .ok_or(ConfigError::Field("modbus speed"))?,
            modbus_id: page[25],
            debug_speed: UartSpeed::from_index(page[26])
                .ok_or(ConfigError::Field("uart speed"))?,
            net_pan_id: u16_at(27),
            net_group: page[29],
            net_key,
            dev_numb: u16_at(46),
            addr_gate: u16_at(48),
        })
    }
}

struct Writer<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl<'a> Writer<'a> {
    fn new(buf: &'a mut [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn put(&mut self, bytes: &[u8]) {
        self.buf[self.pos..self.pos + bytes.len()].copy_from_slice(bytes);
        self.pos += bytes.len();
    }
}

/// Parse a console hex parameter (no `0x`, even digit count) of at most
/// `max_bytes` bytes, most significant first
pub fn parse_hex_value(text: &str, max_bytes: usize) -> Result<u32, ConfigError> {
    let bytes = common::hex::decode(text)?;
    if bytes.is_empty() || bytes.len() > max_bytes || bytes.len() > 4 {
        return Err(ConfigError::Hex(text.to_string()));
    }
    Ok(bytes.iter().fold(0u32, |acc, &b| (acc << 8) | u32::from(b)))
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    #[test]
    fn test_page_layout() {
        let mut config = Config::default();
        config.set_increment(Meter::Hot, 25).unwrap();
        config.set_net_pan_id(0xABCD).unwrap();
        config.set_dev_numb(0x1234).unwrap();
        config.set_addr_gate(0x0102).unwrap();

        let page = config.encode();
        assert_eq!(&page[2..4], &[25, 0]);
        assert_eq!(&page[27..29], &[0xCD, 0xAB]);
        assert_eq!(&page[46..48], &[0x34, 0x12]);
        assert!(page[PACKED_LEN..FLASH_DATA_LEN].iter().all(|&b| b == 0));
        assert_eq!(Config::decode(&page).unwrap(), config);
    }

    #[test]
    fn test_corrupt_or_blank_page() {
        let mut page = Config::default().encode();
        page[5] ^= 0x01;
        assert_eq!(Config::decode(&page), Err(ConfigError::Crc));
        assert_eq!(Config::decode(&[0xFF; FLASH_PAGE]), Err(ConfigError::Empty));
        assert_eq!(Config::decode(&[0u8; 10]), Err(ConfigError::Empty));
    }

    #[test]
    fn test_setter_ranges() {
        let mut config = Config::default();
        assert!(config.set_increment(Meter::Cold, 1001).is_err());
        assert!(config.set_modbus_id(0).is_err());
        assert!(config.set_modbus_id(248).is_err());
        assert!(config.set_modbus_speed(9601).is_err());
        assert!(config.set_can_speed(125).is_ok());
        assert!(config.set_can_speed(100).is_err());
        assert!(config.set_pressure_max(15.5).is_err());
        assert!(config.set_net_pan_id(0xFFFF).is_err());
        assert!(config.set_net_group(100).is_err());
        assert!(config.set_addr_gate(0xFFF9).is_err());
        assert!(config.set_dev_numb(0).is_err());
        // rejected values leave the field alone
        assert_eq!(config.modbus_id(), 1);
    }

    #[test]
    fn test_can_id_follows_width() {
        let mut config = Config::default();
        assert!(config.set_can_id(0x800).is_err());
        config.set_can_addressing(29).unwrap();
        config.set_can_id(0x1000_0000).unwrap();
        assert!(config.set_can_id(0x2000_0000).is_err());
        assert!(config.set_can_addressing(16).is_err());
    }

    #[test]
    fn test_sensor_voltage_window() {
        let mut config = Config::default();
        assert!(config.set_press_out_min(4.5).is_err());
        config.set_press_out_min(0.4).unwrap();
        assert!(config.set_press_out_max(0.3).is_err());
        assert!(config.set_press_out_max(0.0).is_err());
        config.set_press_out_max(4.8).unwrap();
        assert_eq!(config.press_out_max(), 4.8);
    }

    #[test]
    fn test_hex_parameters() {
        assert_eq!(parse_hex_value("F7", 1).unwrap(), 0xF7);
        assert_eq!(parse_hex_value("1a62", 2).unwrap(), 0x1A62);
        assert_eq!(parse_hex_value("00000120", 4).unwrap(), 0x120);
        assert!(parse_hex_value("123", 2).is_err());
        assert!(parse_hex_value("123456", 2).is_err());
        assert!(parse_hex_value("zz", 1).is_err());
    }
}
