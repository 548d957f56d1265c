//! Inactivity-delimited serial framing
//!
//! MODBUS-RTU and the radio module do not carry a length prefix: a frame ends
//! when the line stays quiet for longer than the idle gap. One task owns both
//! the byte reads and the idle timer, so a byte can never land between the timer
//! firing and the frame being handed over.

use std::time::Duration;

use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, warn};

/// Supported UART speeds with the duration of one character (11 bits) in microseconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum UartSpeed {
    Baud600 = 0,
    Baud1200,
    Baud2400,
    Baud4800,
    Baud9600,
    Baud14400,
    Baud19200,
    Baud28800,
    Baud38400,
    Baud56000,
    Baud57600,
    Baud115200,
}

const UART_TABLE: [(UartSpeed, u32, u32); 12] = [
    (UartSpeed::Baud600, 600, 16_700),
    (UartSpeed::Baud1200, 1200, 8_350),
    (UartSpeed::Baud2400, 2400, 4_200),
    (UartSpeed::Baud4800, 4800, 2_083),
    (UartSpeed::Baud9600, 9600, 1_042),
    (UartSpeed::Baud14400, 14400, 694),
    (UartSpeed::Baud19200, 19200, 521),
    (UartSpeed::Baud28800, 28800, 348),
    (UartSpeed::Baud38400, 38400, 260),
    (UartSpeed::Baud56000, 56000, 249),
    (UartSpeed::Baud57600, 57600, 174),
    (UartSpeed::Baud115200, 115200, 87),
];

impl UartSpeed {
    pub fn from_baud(baud: u32) -> Option<Self> {
        UART_TABLE
            .iter()
            .find(|(_, b, _)| *b == baud)
            .map(|(s, _, _)| *s)
    }

    pub fn from_index(index: u8) -> Option<Self> {
        UART_TABLE.get(index as usize).map(|(s, _, _)| *s)
    }

    pub fn index(self) -> u8 {
        self as u8
    }

    pub fn baud(self) -> u32 {
        UART_TABLE[self as usize].1
    }

    /// Duration of one character on the line
    pub fn char_time(self) -> Duration {
        Duration::from_micros(u64::from(UART_TABLE[self as usize].2))
    }

    /// MODBUS-RTU inter-frame gap: 3.5 characters
    pub fn frame_gap(self) -> Duration {
        self.char_time() * 7 / 2
    }
}

/// Receive buffer plus idle timer
pub struct IdleFramer {
    buf: BytesMut,
    capacity: usize,
    idle: Duration,
    overflows: u64,
    /// Set on overflow; the rest of the burst is dropped until the line goes idle
    discarding: bool,
}

impl IdleFramer {
    pub fn new(capacity: usize, idle: Duration) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
            capacity,
            idle,
            overflows: 0,
            discarding: false,
        }
    }

    pub fn idle(&self) -> Duration {
        self.idle
    }

    pub fn overflows(&self) -> u64 {
        self.overflows
    }

    /// Append one byte; on overflow the whole frame is discarded up to the next idle gap
    pub fn push(&mut self, byte: u8) -> bool {
        if self.discarding {
            return false;
        }
        if self.buf.len() >= self.capacity {
            warn!("Receive buffer overflow, frame dropped");
            self.buf.clear();
            self.discarding = true;
            self.overflows += 1;
            return false;
        }
        self.buf.extend_from_slice(&[byte]);
        true
    }

    /// Hand over the collected frame, if any
    pub fn take_frame(&mut self) -> Option<Bytes> {
        if self.buf.is_empty() {
            None
        } else {
            Some(self.buf.split().freeze())
        }
    }

    /// Read until the line goes idle with a non-empty buffer
    ///
    /// Waits without limit for the first byte of a frame. Returns `None` once the
    /// stream is closed and nothing is buffered.
    pub async fn next_frame<R>(&mut self, reader: &mut R) -> Option<Bytes>
    where
        R: AsyncRead + Unpin,
    {
        let mut byte = [0u8; 1];
        loop {
            let read = if self.buf.is_empty() && !self.discarding {
                reader.read(&mut byte).await
            } else {
                match tokio::time::timeout(self.idle, reader.read(&mut byte)).await {
                    Ok(read) => read,
                    Err(_) if self.discarding => {
                        self.discarding = false;
                        continue;
                    },
                    Err(_) => return self.take_frame(),
                }
            };
            match read {
                Ok(0) => return self.take_frame(),
                Ok(_) => {
                    self.push(byte[0]);
                },
                Err(e) => {
                    debug!("Serial read failed: {}", e);
                    return self.take_frame();
                },
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[test]
    fn test_uart_table() {
        assert_eq!(UartSpeed::from_baud(9600), Some(UartSpeed::Baud9600));
        assert_eq!(UartSpeed::from_baud(9601), None);
        assert_eq!(UartSpeed::Baud115200.baud(), 115200);
        assert_eq!(UartSpeed::from_index(4), Some(UartSpeed::Baud9600));
        assert_eq!(
            UartSpeed::Baud9600.frame_gap(),
            Duration::from_micros(3647)
        );
    }

    #[test]
    fn test_overflow_discards_partial_frame() {
        let mut framer = IdleFramer::new(2, Duration::from_millis(1));
        assert!(framer.push(1));
        assert!(framer.push(2));
        assert!(!framer.push(3));
        assert!(!framer.push(4));
        assert_eq!(framer.overflows(), 1);
        assert!(framer.take_frame().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_overflowing_burst_yields_no_tail() {
        let (mut tx, mut rx) = tokio::io::duplex(256);
        let mut framer = IdleFramer::new(80, Duration::from_millis(5));
        let mut burst = vec![0x55u8; 82];
        burst.extend_from_slice(&[0xFF, 0x00]);

        let writer = async move {
            tx.write_all(&burst).await.unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;
            tx.write_all(&[0x01, 0x02]).await.unwrap();
            tx
        };
        let (frame, _tx) = tokio::join!(framer.next_frame(&mut rx), writer);
        assert_eq!(&frame.unwrap()[..], &[0x01, 0x02]);
        assert_eq!(framer.overflows(), 1);
    }

    #[tokio::test]
    async fn test_overflow_then_close_ends_without_frame() {
        let (mut tx, mut rx) = tokio::io::duplex(256);
        let mut framer = IdleFramer::new(4, Duration::from_secs(10));
        tx.write_all(&[0x11; 7]).await.unwrap();
        drop(tx);
        assert!(framer.next_frame(&mut rx).await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_gap_splits_frames() {
        let (mut tx, mut rx) = tokio::io::duplex(64);
        let mut framer = IdleFramer::new(255, Duration::from_millis(5));

        tx.write_all(&[0x01, 0x03, 0x00]).await.unwrap();
        let first = framer.next_frame(&mut rx).await.unwrap();
        assert_eq!(&first[..], &[0x01, 0x03, 0x00]);

        tx.write_all(&[0xAA]).await.unwrap();
        let second = framer.next_frame(&mut rx).await.unwrap();
        assert_eq!(&second[..], &[0xAA]);
    }

    #[tokio::test]
    async fn test_eof_flushes_then_ends() {
        let (mut tx, mut rx) = tokio::io::duplex(64);
        let mut framer = IdleFramer::new(255, Duration::from_secs(10));
        tx.write_all(&[0x10, 0x20]).await.unwrap();
        drop(tx);

        let frame = framer.next_frame(&mut rx).await.unwrap();
        assert_eq!(&frame[..], &[0x10, 0x20]);
        assert!(framer.next_frame(&mut rx).await.is_none());
    }
}
