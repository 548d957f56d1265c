//! MODBUS-RTU request parsing and response framing
//!
//! Register fields are big-endian on the wire, the trailing CRC little-endian.

use thiserror::Error;
use tracing::debug;

use crate::core::crc::{append_crc, verify_trailing};

/// Receive buffer size
pub const MAX_FRAME: usize = 255;

pub const FUNC_READ_HOLDING: u8 = 0x03;
pub const FUNC_READ_INPUT: u8 = 0x04;
pub const FUNC_WRITE_SINGLE: u8 = 0x06;
pub const FUNC_WRITE_MULTIPLE: u8 = 0x10;

/// Function codes served by the slave
pub const SUPPORTED_FUNCTIONS: [u8; 4] = [
    FUNC_READ_HOLDING,
    FUNC_READ_INPUT,
    FUNC_WRITE_SINGLE,
    FUNC_WRITE_MULTIPLE,
];

/// Exception flag on the function code
pub const EXCEPTION_FLAG: u8 = 0x80;

/// Address, function, start, count/value, CRC
const FIXED_REQUEST_LEN: usize = 8;
/// Header of a write-multiple request up to the byte count
const WRITE_MULTIPLE_HEAD: usize = 7;

/// Request outcome; codes 1..=8 are sent back as exceptions
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ModbusError {
    #[error("Function code not supported")]
    Function = 1,
    #[error("Data address not available")]
    Address = 2,
    #[error("Invalid value in data field")]
    Data = 3,
    #[error("Unrecoverable error")]
    Device = 4,
    #[error("It takes time to process the request")]
    AckWait = 5,
    #[error("Busy processing command")]
    Busy = 6,
    #[error("The slave cannot execute the function")]
    NoAck = 7,
    #[error("Memory Parity error")]
    MemParity = 8,
    #[error("Received packet checksum error")]
    Crc = 9,
    #[error("The request is addressed to another device")]
    NotForDevice = 10,
    #[error("Errors in function call parameters")]
    Param = 11,
}

impl ModbusError {
    pub const ALL: [ModbusError; 11] = [
        ModbusError::Function,
        ModbusError::Address,
        ModbusError::Data,
        ModbusError::Device,
        ModbusError::AckWait,
        ModbusError::Busy,
        ModbusError::NoAck,
        ModbusError::MemParity,
        ModbusError::Crc,
        ModbusError::NotForDevice,
        ModbusError::Param,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    /// Exception code to answer with; `None` means the frame is dropped silently
    pub fn exception_code(self) -> Option<u8> {
        match self {
            ModbusError::Crc | ModbusError::NotForDevice | ModbusError::Param => None,
            other => Some(other as u8),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Read,
    WriteSingle,
    WriteMultiple,
}

impl RequestKind {
    pub fn from_function(function: u8) -> Option<Self> {
        match function {
            FUNC_READ_HOLDING | FUNC_READ_INPUT => Some(RequestKind::Read),
            FUNC_WRITE_SINGLE => Some(RequestKind::WriteSingle),
            FUNC_WRITE_MULTIPLE => Some(RequestKind::WriteMultiple),
            _ => None,
        }
    }
}

/// Address and function of a frame that passed the CRC and address checks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub dev_addr: u8,
    pub function: u8,
}

/// Verify the CRC and the slave address
pub fn check_frame(frame: &[u8], unit_id: u8) -> Result<FrameHeader, ModbusError> {
    if frame.len() < 4 {
        return Err(ModbusError::Param);
    }
    if !verify_trailing(frame) {
        return Err(ModbusError::Crc);
    }
    if frame[0] != unit_id {
        return Err(ModbusError::NotForDevice);
    }
    Ok(FrameHeader {
        dev_addr: frame[0],
        function: frame[1],
    })
}

/// Decoded request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub header: FrameHeader,
    pub kind: RequestKind,
    pub reg_addr: u16,
    pub reg_cnt: u16,
    /// Values to write, host order
    pub values: Vec<u16>,
}

fn be_word(frame: &[u8], offset: usize) -> u16 {
    u16::from_be_bytes([frame[offset], frame[offset + 1]])
}

impl Request {
    /// Decode a frame accepted by [`check_frame`]
    pub fn parse(frame: &[u8], header: FrameHeader) -> Result<Self, ModbusError> {
        if !SUPPORTED_FUNCTIONS.contains(&header.function) {
            return Err(ModbusError::Function);
        }
        let kind = RequestKind::from_function(header.function).ok_or(ModbusError::Param)?;
        let request = match kind {
            RequestKind::Read | RequestKind::WriteSingle => {
                if frame.len() != FIXED_REQUEST_LEN {
                    return Err(ModbusError::Param);
                }
                let reg_addr = be_word(frame, 2);
                let field = be_word(frame, 4);
                if kind == RequestKind::Read {
                    Request {
                        header,
                        kind,
                        reg_addr,
                        reg_cnt: field,
                        values: Vec::new(),
                    }
                } else {
                    Request {
                        header,
                        kind,
                        reg_addr,
                        reg_cnt: 1,
                        values: vec![field],
                    }
                }
            },
            RequestKind::WriteMultiple => {
                if frame.len() < WRITE_MULTIPLE_HEAD + 2 {
                    return Err(ModbusError::Param);
                }
                let reg_addr = be_word(frame, 2);
                let reg_cnt = be_word(frame, 4);
                let byte_cnt = usize::from(frame[6]);
                if byte_cnt != usize::from(reg_cnt) * 2
                    || frame.len() != WRITE_MULTIPLE_HEAD + byte_cnt + 2
                {
                    return Err(ModbusError::Param);
                }
                let values = frame[WRITE_MULTIPLE_HEAD..WRITE_MULTIPLE_HEAD + byte_cnt]
                    .chunks_exact(2)
                    .map(|w| u16::from_be_bytes([w[0], w[1]]))
                    .collect();
                Request {
                    header,
                    kind,
                    reg_addr,
                    reg_cnt,
                    values,
                }
            },
        };
        debug!(
            "MODBUS dev 0x{:02X} func 0x{:02X} regs 0x{:04X}+{} {:04X?}",
            request.header.dev_addr,
            request.header.function,
            request.reg_addr,
            request.reg_cnt,
            request.values
        );
        Ok(request)
    }
}

/// Response frame builder; [`finish`](Self::finish) appends the CRC
pub struct ResponseBuilder {
    buf: Vec<u8>,
}

impl ResponseBuilder {
    pub fn new(header: FrameHeader) -> Self {
        let mut buf = Vec::with_capacity(MAX_FRAME);
        buf.push(header.dev_addr);
        buf.push(header.function);
        Self { buf }
    }

    pub fn byte(mut self, b: u8) -> Self {
        self.buf.push(b);
        self
    }

    /// Big-endian register value
    pub fn word(mut self, w: u16) -> Self {
        self.buf.extend_from_slice(&w.to_be_bytes());
        self
    }

    pub fn finish(mut self) -> Vec<u8> {
        append_crc(&mut self.buf);
        self.buf
    }
}

/// Exception answer: function code with the error flag and the exception code
pub fn exception_response(header: FrameHeader, code: u8) -> Vec<u8> {
    ResponseBuilder::new(FrameHeader {
        dev_addr: header.dev_addr,
        function: header.function | EXCEPTION_FLAG,
    })
    .byte(code)
    .finish()
}

/// Register read answer
pub fn read_response(header: FrameHeader, registers: &[u16]) -> Vec<u8> {
    registers
        .iter()
        .fold(
            ResponseBuilder::new(header).byte((registers.len() * 2) as u8),
            |b, r| b.word(*r),
        )
        .finish()
}

/// Write answer: start address with the written value (single) or count (multiple)
pub fn write_response(header: FrameHeader, reg_addr: u16, value_or_count: u16) -> Vec<u8> {
    ResponseBuilder::new(header)
        .word(reg_addr)
        .word(value_or_count)
        .finish()
}
