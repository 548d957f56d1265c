//! CRC-16 (MODBUS polynomial) used by every wire and storage structure
//!
//! Reflected polynomial 0xA001, initial value 0xFFFF. The checksum is stored
//! little-endian as the last two bytes of the protected structure.

const POLY: u16 = 0xA001;

const fn build_table() -> [u16; 256] {
    let mut table = [0u16; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u16;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 1 != 0 { (crc >> 1) ^ POLY } else { crc >> 1 };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

static CRC_TABLE: [u16; 256] = build_table();

/// Calculate CRC-16 over `data`
pub fn crc16(data: &[u8]) -> u16 {
    data.iter().fold(0xFFFF, |crc, &byte| {
        (crc >> 8) ^ CRC_TABLE[((crc ^ u16::from(byte)) & 0xFF) as usize]
    })
}

/// Append the CRC of `buf` in wire order
pub fn append_crc(buf: &mut Vec<u8>) {
    let crc = crc16(buf);
    buf.extend_from_slice(&crc.to_le_bytes());
}

/// Read the little-endian CRC stored at `offset`
pub fn stored_crc(data: &[u8], offset: usize) -> Option<u16> {
    data.get(offset..offset + 2)
        .map(|b| u16::from_le_bytes([b[0], b[1]]))
}

/// Check a frame whose last two bytes carry the CRC of everything before them
pub fn verify_trailing(frame: &[u8]) -> bool {
    if frame.len() < 3 {
        return false;
    }
    let body = frame.len() - 2;
    stored_crc(frame, body) == Some(crc16(&frame[..body]))
}
