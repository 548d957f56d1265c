//! Register map, access tables and the control word

use std::ops::RangeInclusive;

use super::frame::ModbusError;
use crate::core::hal::Valve;
use crate::core::time::DateTime;
use crate::device::flags::ValveEvents;
use crate::device::state::{DeviceSnapshot, Meter};

/// Leak flags (high byte) and valve byte (low byte)
pub const REG_CTRL: u16 = 0x0000;
pub const REG_COLD_COUNT: u16 = 0x0001;
pub const REG_COLD_PRESSURE: u16 = 0x0003;
pub const REG_HOT_COUNT: u16 = 0x0004;
pub const REG_HOT_PRESSURE: u16 = 0x0006;
pub const REG_FILTER_COUNT: u16 = 0x0007;
/// `day << 8 | month`
pub const REG_DAY_MONTH: u16 = 0x0009;
pub const REG_YEAR: u16 = 0x000A;
/// `hour << 8 | min`
pub const REG_HOUR_MIN: u16 = 0x000B;
pub const REG_COUNT: usize = 12;

/// Start register with the register counts a read may ask for
const READ_TABLE: [(u16, &[u16]); 7] = [
    (REG_CTRL, &[1, 3, 4, 6, 7, 9, 12]),
    (REG_COLD_COUNT, &[2, 3, 5, 6, 8, 11]),
    (REG_COLD_PRESSURE, &[1, 3, 4, 6, 9]),
    (REG_HOT_COUNT, &[2, 3, 5, 8]),
    (REG_HOT_PRESSURE, &[1, 3, 6]),
    (REG_FILTER_COUNT, &[2, 5]),
    (REG_DAY_MONTH, &[3]),
];

const WRITE_TABLE: [(u16, &[u16]); 2] = [(REG_CTRL, &[1]), (REG_DAY_MONTH, &[3])];

const VALUE_RANGES: [(u16, RangeInclusive<u16>); 4] = [
    (REG_CTRL, 0x0000..=0x001F),
    (REG_DAY_MONTH, 0x0101..=0x1F0C),
    (REG_YEAR, 2000..=2099),
    (REG_HOUR_MIN, 0x0000..=0x173B),
];

fn check_table(table: &[(u16, &[u16])], addr: u16, cnt: u16) -> Result<(), ModbusError> {
    table
        .iter()
        .find(|(start, _)| *start == addr)
        .filter(|(_, counts)| counts.contains(&cnt))
        .map(|_| ())
        .ok_or(ModbusError::Address)
}

pub fn check_read(addr: u16, cnt: u16) -> Result<(), ModbusError> {
    check_table(&READ_TABLE, addr, cnt)
}

pub fn check_write(addr: u16, cnt: u16) -> Result<(), ModbusError> {
    check_table(&WRITE_TABLE, addr, cnt)
}

/// Every written value must fall inside the range of its register
pub fn check_values(addr: u16, values: &[u16]) -> Result<(), ModbusError> {
    for (reg, value) in (addr..).zip(values) {
        let in_range = VALUE_RANGES
            .iter()
            .find(|(r, _)| *r == reg)
            .map_or(false, |(_, range)| range.contains(value));
        if !in_range {
            return Err(ModbusError::Data);
        }
    }
    Ok(())
}

fn push_u32(regs: &mut Vec<u16>, value: u32) {
    // low word first
    regs.push((value & 0xFFFF) as u16);
    regs.push((value >> 16) as u16);
}

/// Every register in address order
pub fn register_image(snapshot: &DeviceSnapshot, now: &DateTime) -> [u16; REG_COUNT] {
    let mut regs = Vec::with_capacity(REG_COUNT);
    regs.push(u16::from(snapshot.leaks.flags()) << 8 | u16::from(snapshot.valve_byte()));
    push_u32(&mut regs, snapshot.count(Meter::Cold));
    regs.push(snapshot.line_pressure(Valve::Cold));
    push_u32(&mut regs, snapshot.count(Meter::Hot));
    regs.push(snapshot.line_pressure(Valve::Hot));
    push_u32(&mut regs, snapshot.count(Meter::Filter));
    regs.push(u16::from(now.day()) << 8 | u16::from(now.month()));
    regs.push(now.year());
    regs.push(u16::from(now.hour()) << 8 | u16::from(now.min()));

    let mut image = [0u16; REG_COUNT];
    image.copy_from_slice(&regs);
    image
}

/// Registers `addr .. addr + cnt` of an image; the range is checked by [`check_read`]
pub fn read_registers(image: &[u16; REG_COUNT], addr: u16, cnt: u16) -> Vec<u16> {
    let start = usize::from(addr);
    let end = (start + usize::from(cnt)).min(REG_COUNT);
    image.get(start..end).map(<[u16]>::to_vec).unwrap_or_default()
}

pub const CMD_ALL_CLOSE: u16 = 0x0000;
pub const CMD_COLD_OPEN: u16 = 0x0001;
pub const CMD_COLD_CLOSE: u16 = 0x0002;
pub const CMD_HOT_OPEN: u16 = 0x0004;
pub const CMD_HOT_CLOSE: u16 = 0x0008;
pub const CMD_ALL_OPEN: u16 = 0x0010;

/// Valve requests of a control word; every request is gated
pub fn control_events(word: u16) -> Result<ValveEvents, ModbusError> {
    let both = |f: fn(Valve) -> ValveEvents| f(Valve::Cold) | f(Valve::Hot);
    match word {
        CMD_ALL_CLOSE => return Ok(both(ValveEvents::close).gated()),
        CMD_ALL_OPEN => return Ok(both(ValveEvents::open).gated()),
        _ => {},
    }
    let has = |bit: u16| word & bit != 0;
    if (has(CMD_COLD_OPEN) && has(CMD_COLD_CLOSE)) || (has(CMD_HOT_OPEN) && has(CMD_HOT_CLOSE)) {
        return Err(ModbusError::Data);
    }
    let mut events = ValveEvents::PREV_CHECK;
    for (bit, request) in [
        (CMD_COLD_OPEN, ValveEvents::COLD_OPN),
        (CMD_COLD_CLOSE, ValveEvents::COLD_CLS),
        (CMD_HOT_OPEN, ValveEvents::HOT_OPN),
        (CMD_HOT_CLOSE, ValveEvents::HOT_CLS),
    ] {
        if has(bit) {
            events |= request;
        }
    }
    Ok(events)
}

/// Clock value of a date/time write `[day << 8 | month, year, hour << 8 | min]`
pub fn datetime_from_registers(values: &[u16]) -> Result<DateTime, ModbusError> {
    let [day_month, year, hour_min] = values else {
        return Err(ModbusError::Data);
    };
    let [day, month] = day_month.to_be_bytes();
    let [hour, min] = hour_min.to_be_bytes();
    DateTime::new(day, month, *year, hour, min, 0).map_err(|_| ModbusError::Data)
}
