//! Hex helpers for console parameters and memory dumps

use std::fmt::Write;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HexError {
    #[error("odd number of hex digits")]
    OddLength,
    #[error("invalid hex digit '{0}'")]
    InvalidDigit(char),
    #[error("expected {expected} bytes, got {actual}")]
    Length { expected: usize, actual: usize },
}

/// Encode bytes to uppercase hex string
/// Example: [0x12, 0x34, 0xAB] -> "1234AB"
pub fn encode_upper(data: &[u8]) -> String {
    let mut result = String::with_capacity(data.len() * 2);
    for byte in data {
        let _ = write!(&mut result, "{:02X}", byte);
    }
    result
}

/// Decode a hex string (no `0x` prefix, either case) into bytes
pub fn decode(text: &str) -> Result<Vec<u8>, HexError> {
    let digits = text.trim().as_bytes();
    if digits.len() % 2 != 0 {
        return Err(HexError::OddLength);
    }
    digits
        .chunks(2)
        .map(|pair| -> Result<u8, HexError> { Ok((nibble(pair[0])? << 4) | nibble(pair[1])?) })
        .collect()
}

/// Decode exactly `N` bytes, most significant first
pub fn decode_exact<const N: usize>(text: &str) -> Result<[u8; N], HexError> {
    let bytes = decode(text)?;
    bytes.try_into().map_err(|v: Vec<u8>| HexError::Length {
        expected: N,
        actual: v.len(),
    })
}

fn nibble(c: u8) -> Result<u8, HexError> {
    match c {
        b'0'..=b'9' => Ok(c - b'0'),
        b'a'..=b'f' => Ok(c - b'a' + 10),
        b'A'..=b'F' => Ok(c - b'A' + 10),
        _ => Err(HexError::InvalidDigit(c as char)),
    }
}

/// One dump row: `0020: 01 02 ... 10  ................`
pub fn dump_row(addr: u16, data: &[u8]) -> String {
    let mut row = format!("{:04X}: ", addr);
    for byte in data {
        let _ = write!(&mut row, "{:02X} ", byte);
    }
    row.push(' ');
    row.extend(data.iter().map(|&b| {
        if b.is_ascii_graphic() || b == b' ' {
            b as char
        } else {
            '.'
        }
    }));
    row
}
