//! Calendar date/time used by the RTC, log records and wire packets

use std::fmt;

use chrono::{Datelike, Duration, Local, NaiveDate, NaiveDateTime, Timelike};
use parking_lot::Mutex;
use thiserror::Error;

use super::hal::Rtc;

/// Size of a date/time on the wire
pub const WIRE_LEN: usize = 7;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DateTimeError {
    #[error("invalid date {day:02}.{month:02}.{year:04}")]
    Date { day: u8, month: u8, year: u16 },
    #[error("invalid time {hour:02}:{min:02}:{sec:02}")]
    Time { hour: u8, min: u8, sec: u8 },
    #[error("malformed value '{0}'")]
    Format(String),
}

/// Validated calendar date/time with second resolution
///
/// Field order makes the derived ordering chronological.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DateTime {
    year: u16,
    month: u8,
    day: u8,
    hour: u8,
    min: u8,
    sec: u8,
}

impl Default for DateTime {
    fn default() -> Self {
        Self {
            year: 2000,
            month: 1,
            day: 1,
            hour: 0,
            min: 0,
            sec: 0,
        }
    }
}

impl DateTime {
    pub fn new(
        day: u8,
        month: u8,
        year: u16,
        hour: u8,
        min: u8,
        sec: u8,
    ) -> Result<Self, DateTimeError> {
        if NaiveDate::from_ymd_opt(i32::from(year), u32::from(month), u32::from(day)).is_none() {
            return Err(DateTimeError::Date { day, month, year });
        }
        if hour > 23 || min > 59 || sec > 59 {
            return Err(DateTimeError::Time { hour, min, sec });
        }
        Ok(Self {
            year,
            month,
            day,
            hour,
            min,
            sec,
        })
    }

    pub fn from_naive(dt: &NaiveDateTime) -> Self {
        Self {
            year: dt.year().clamp(0, i32::from(u16::MAX)) as u16,
            month: dt.month() as u8,
            day: dt.day() as u8,
            hour: dt.hour() as u8,
            min: dt.minute() as u8,
            sec: dt.second() as u8,
        }
    }

    pub fn to_naive(&self) -> Option<NaiveDateTime> {
        NaiveDate::from_ymd_opt(
            i32::from(self.year),
            u32::from(self.month),
            u32::from(self.day),
        )?
        .and_hms_opt(
            u32::from(self.hour),
            u32::from(self.min),
            u32::from(self.sec),
        )
    }

    pub fn year(&self) -> u16 {
        self.year
    }

    pub fn month(&self) -> u8 {
        self.month
    }

    pub fn day(&self) -> u8 {
        self.day
    }

    pub fn hour(&self) -> u8 {
        self.hour
    }

    pub fn min(&self) -> u8 {
        self.min
    }

    pub fn sec(&self) -> u8 {
        self.sec
    }

    pub fn same_date(&self, other: &DateTime) -> bool {
        self.day == other.day && self.month == other.month && self.year == other.year
    }

    /// Last second of the day, when the daily record is written
    pub fn is_end_of_day(&self) -> bool {
        self.hour == 23 && self.min == 59 && self.sec == 59
    }

    /// Replace the calendar part, keeping the time of day
    pub fn with_date(&self, day: u8, month: u8, year: u16) -> Result<Self, DateTimeError> {
        Self::new(day, month, year, self.hour, self.min, self.sec)
    }

    /// Replace the time of day, keeping the calendar part
    pub fn with_time(&self, hour: u8, min: u8, sec: u8) -> Result<Self, DateTimeError> {
        Self::new(self.day, self.month, self.year, hour, min, sec)
    }

    /// Wire layout: `day, month, year (u16 LE), hour, min, sec`
    pub fn to_wire(&self) -> [u8; WIRE_LEN] {
        let year = self.year.to_le_bytes();
        [
            self.day, self.month, year[0], year[1], self.hour, self.min, self.sec,
        ]
    }

    pub fn from_wire(data: &[u8]) -> Result<Self, DateTimeError> {
        if data.len() < WIRE_LEN {
            return Err(DateTimeError::Format(format!("{} bytes", data.len())));
        }
        Self::new(
            data[0],
            data[1],
            u16::from_le_bytes([data[2], data[3]]),
            data[4],
            data[5],
            data[6],
        )
    }

    /// `dd.mm.yyyy`
    pub fn date_string(&self) -> String {
        format!("{:02}.{:02}.{:04}", self.day, self.month, self.year)
    }

    /// `hh:mm:ss`
    pub fn time_string(&self) -> String {
        format!("{:02}:{:02}:{:02}", self.hour, self.min, self.sec)
    }
}

impl fmt::Display for DateTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.date_string(), self.time_string())
    }
}

fn parse_fields(text: &str, min: usize, max: usize) -> Result<Vec<u16>, DateTimeError> {
    let parts: Vec<&str> = text.split(['.', ':']).collect();
    if parts.len() < min || parts.len() > max {
        return Err(DateTimeError::Format(text.to_string()));
    }
    parts
        .iter()
        .map(|p| {
            p.trim()
                .parse::<u16>()
                .map_err(|_| DateTimeError::Format(text.to_string()))
        })
        .collect()
}

/// Parse a console date `dd.mm.yy` (years 2000-2099)
pub fn parse_date(text: &str) -> Result<(u8, u8, u16), DateTimeError> {
    let f = parse_fields(text, 3, 3)?;
    if f[2] > 99 || f[0] > 31 || f[1] > 12 {
        return Err(DateTimeError::Format(text.to_string()));
    }
    Ok((f[0] as u8, f[1] as u8, 2000 + f[2]))
}

/// Parse a console time `hh:mm[:ss]`
pub fn parse_time(text: &str) -> Result<(u8, u8, u8), DateTimeError> {
    let f = parse_fields(text, 2, 3)?;
    let sec = f.get(2).copied().unwrap_or(0);
    if f[0] > 23 || f[1] > 59 || sec > 59 {
        return Err(DateTimeError::Format(text.to_string()));
    }
    Ok((f[0] as u8, f[1] as u8, sec as u8))
}

/// Host clock with a settable offset
#[derive(Debug, Default)]
pub struct HostRtc {
    offset: Mutex<Duration>,
}

impl HostRtc {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Rtc for HostRtc {
    fn now(&self) -> DateTime {
        let now = Local::now().naive_local() + *self.offset.lock();
        DateTime::from_naive(&now)
    }

    fn set(&self, value: DateTime) {
        if let Some(target) = value.to_naive() {
            *self.offset.lock() = target - Local::now().naive_local();
        }
    }
}
