//! FRAM block store
//!
//! The device is split into 32-byte blocks: block 0 holds the current totals,
//! the rest form a circular log. Every block carries a CRC-16 over its 30-byte
//! payload. One lock serializes all bus traffic, and each transfer is awaited
//! under a bounded timeout.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::core::crc::{crc16, stored_crc};
use crate::core::hal::{FramBus, HalError, Rtc};

use super::records::{CurrentTotals, LogRecord};

/// Device capacity in bytes
pub const FRAM_SIZE: u16 = 2048;
/// Logical block size
pub const BLOCK_SIZE: u16 = 32;
/// Totals block address
pub const TOTALS_ADDR: u16 = 0x0000;
/// First log block
pub const LOG_BASE: u16 = 0x0020;
/// Payload bytes in front of the block CRC
pub const PAYLOAD_LEN: usize = BLOCK_SIZE as usize - 2;
/// Number of log blocks in the circular region
pub const LOG_BLOCKS: usize = ((FRAM_SIZE - LOG_BASE) / BLOCK_SIZE) as usize;

const IO_TIMEOUT: Duration = Duration::from_millis(100);
const TEST_PATTERNS: [u8; 4] = [0xFF, 0x55, 0xAA, 0x00];
const TEST_CHUNK: usize = 16;

/// Store operation status; the text is the operator-facing description
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FramError {
    #[error("Error")]
    Bus,
    #[error("Busy")]
    Busy,
    #[error("Timeout")]
    Timeout,
    #[error("CRC")]
    Crc,
    #[error("Parameter")]
    Param,
}

impl From<HalError> for FramError {
    fn from(err: HalError) -> Self {
        match err {
            HalError::Bus(_) => FramError::Bus,
            HalError::Busy => FramError::Busy,
            HalError::Timeout => FramError::Timeout,
        }
    }
}

/// `OK` or `Error: <kind>`
pub fn status_text(result: &Result<(), FramError>) -> String {
    match result {
        Ok(()) => "OK".to_string(),
        Err(e) => format!("Error: {}", e),
    }
}

/// Kind of block written by [`FramStore::write_block`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    Totals,
    Log,
}

/// Outcome of reading and rewriting the totals block at boot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InitStatus {
    pub read: Result<(), FramError>,
    pub write: Result<(), FramError>,
}

impl Default for InitStatus {
    fn default() -> Self {
        Self {
            read: Ok(()),
            write: Ok(()),
        }
    }
}

fn log_addr_valid(addr: u16) -> bool {
    (LOG_BASE..FRAM_SIZE).contains(&addr) && addr % BLOCK_SIZE == 0
}

/// Address following `addr` in the circular region
pub fn next_log_addr(addr: u16) -> u16 {
    let next = addr + BLOCK_SIZE;
    if next >= FRAM_SIZE {
        LOG_BASE
    } else {
        next
    }
}

/// Addresses of every log block
pub fn log_addresses() -> impl Iterator<Item = u16> {
    (LOG_BASE..FRAM_SIZE).step_by(BLOCK_SIZE as usize)
}

fn seal(payload: &[u8]) -> Result<[u8; BLOCK_SIZE as usize], FramError> {
    if payload.len() > PAYLOAD_LEN {
        return Err(FramError::Param);
    }
    let mut block = [0u8; BLOCK_SIZE as usize];
    block[..payload.len()].copy_from_slice(payload);
    let crc = crc16(&block[..PAYLOAD_LEN]);
    block[PAYLOAD_LEN..].copy_from_slice(&crc.to_le_bytes());
    Ok(block)
}

/// Mutex-guarded FRAM log and totals store
pub struct FramStore {
    bus: Arc<dyn FramBus>,
    lock: tokio::sync::Mutex<()>,
    totals: RwLock<CurrentTotals>,
    init_status: Mutex<InitStatus>,
}

impl FramStore {
    pub fn new(bus: Arc<dyn FramBus>) -> Self {
        Self {
            bus,
            lock: tokio::sync::Mutex::new(()),
            totals: RwLock::new(CurrentTotals::default()),
            init_status: Mutex::new(InitStatus::default()),
        }
    }

    async fn raw_read(&self, addr: u16, buf: &mut [u8]) -> Result<(), FramError> {
        match tokio::time::timeout(IO_TIMEOUT, self.bus.read(addr, buf)).await {
            Ok(result) => result.map_err(FramError::from),
            Err(_) => Err(FramError::Timeout),
        }
    }

    async fn raw_write(&self, addr: u16, data: &[u8]) -> Result<(), FramError> {
        match tokio::time::timeout(IO_TIMEOUT, self.bus.write(addr, data)).await {
            Ok(result) => result.map_err(FramError::from),
            Err(_) => Err(FramError::Timeout),
        }
    }

    /// Read the block at `addr` and return the raw bytes with the CRC verdict
    async fn read_raw_block(
        &self,
        addr: u16,
    ) -> Result<([u8; BLOCK_SIZE as usize], bool), FramError> {
        let mut block = [0u8; BLOCK_SIZE as usize];
        self.raw_read(addr, &mut block).await?;
        let valid = stored_crc(&block, PAYLOAD_LEN) == Some(crc16(&block[..PAYLOAD_LEN]));
        Ok((block, valid))
    }

    /// Read and verify one block, returning its payload
    pub async fn read_block(&self, addr: u16) -> Result<[u8; PAYLOAD_LEN], FramError> {
        if addr % BLOCK_SIZE != 0 || addr >= FRAM_SIZE {
            return Err(FramError::Param);
        }
        let _guard = self.lock.lock().await;
        let (block, valid) = self.read_raw_block(addr).await?;
        if !valid {
            return Err(FramError::Crc);
        }
        let mut payload = [0u8; PAYLOAD_LEN];
        payload.copy_from_slice(&block[..PAYLOAD_LEN]);
        Ok(payload)
    }

    /// Seal and write one block; returns the address written
    ///
    /// Log blocks go to the current write pointer, which then advances (wrapping
    /// to the log base) and is persisted with the totals.
    pub async fn write_block(&self, kind: BlockKind, payload: &[u8]) -> Result<u16, FramError> {
        let block = seal(payload)?;
        let _guard = self.lock.lock().await;
        match kind {
            BlockKind::Totals => {
                self.raw_write(TOTALS_ADDR, &block).await.inspect_err(|e| {
                    error!("Error write to FRAM: 0x{:04X} {}", TOTALS_ADDR, e);
                })?;
                Ok(TOTALS_ADDR)
            },
            BlockKind::Log => {
                let mut addr = self.totals.read().next_addr;
                if !log_addr_valid(addr) {
                    warn!("Log pointer 0x{:04X} out of range, restarting at base", addr);
                    addr = LOG_BASE;
                }
                self.raw_write(addr, &block).await.inspect_err(|e| {
                    error!("Error write to FRAM: 0x{:04X} {}", addr, e);
                })?;
                let totals = {
                    let mut totals = self.totals.write();
                    totals.next_addr = next_log_addr(addr);
                    *totals
                };
                debug!("Log record at 0x{:04X}, next 0x{:04X}", addr, totals.next_addr);
                self.persist_totals_locked(&totals).await?;
                Ok(addr)
            },
        }
    }

    async fn persist_totals_locked(&self, totals: &CurrentTotals) -> Result<(), FramError> {
        let block = seal(&totals.encode())?;
        self.raw_write(TOTALS_ADDR, &block).await.inspect_err(|e| {
            error!("Error write to FRAM: 0x{:04X} {}", TOTALS_ADDR, e);
        })
    }

    /// Load the totals at boot, stamp power-on time and reset cause, write back
    ///
    /// Unreadable totals fall back to zeroes; a stored write pointer outside
    /// the log region is reset to the log base.
    pub async fn init(&self, rtc: &dyn Rtc, reset_source: u8) -> InitStatus {
        let _guard = self.lock.lock().await;
        let read = match self.read_raw_block(TOTALS_ADDR).await {
            Ok((block, true)) => match CurrentTotals::decode(&block) {
                Ok(totals) => {
                    *self.totals.write() = totals;
                    Ok(())
                },
                Err(_) => Err(FramError::Crc),
            },
            Ok((_, false)) => Err(FramError::Crc),
            Err(e) => Err(e),
        };
        if let Err(e) = read {
            warn!("FRAM totals unreadable ({}), starting from zero", e);
            *self.totals.write() = CurrentTotals::default();
        }

        let totals = {
            let mut totals = self.totals.write();
            if !log_addr_valid(totals.next_addr) {
                totals.next_addr = LOG_BASE;
            }
            totals.power_on = rtc.now();
            totals.reset_source = reset_source;
            *totals
        };
        let write = self.persist_totals_locked(&totals).await;
        let status = InitStatus { read, write };
        *self.init_status.lock() = status;
        info!(
            "FRAM init: read {}, write {}, next log 0x{:04X}",
            status_text(&status.read),
            status_text(&status.write),
            totals.next_addr
        );
        status
    }

    pub fn init_status(&self) -> InitStatus {
        *self.init_status.lock()
    }

    /// Snapshot of the current totals
    pub fn totals(&self) -> CurrentTotals {
        *self.totals.read()
    }

    /// Mutate and persist the totals under the store lock
    pub async fn update_totals<F>(&self, f: F) -> Result<CurrentTotals, FramError>
    where
        F: FnOnce(&mut CurrentTotals),
    {
        let _guard = self.lock.lock().await;
        let totals = {
            let mut totals = self.totals.write();
            f(&mut totals);
            *totals
        };
        self.persist_totals_locked(&totals).await?;
        Ok(totals)
    }

    /// Append a record at the write pointer
    pub async fn append_log(&self, record: &LogRecord) -> Result<u16, FramError> {
        self.write_block(BlockKind::Log, &record.encode()).await
    }

    /// Read and decode the record at `addr`
    pub async fn read_log(&self, addr: u16) -> Result<LogRecord, FramError> {
        let payload = self.read_block(addr).await?;
        LogRecord::decode(&payload).map_err(|_| FramError::Param)
    }

    /// Zero every log block and rewind the write pointer
    pub async fn clear(&self) -> Result<(), FramError> {
        let _guard = self.lock.lock().await;
        let zero = [0u8; BLOCK_SIZE as usize];
        let mut first_error = None;
        for addr in log_addresses() {
            if let Err(e) = self.raw_write(addr, &zero).await {
                error!("Error write to FRAM: 0x{:04X} {}", addr, e);
                first_error.get_or_insert(e);
            }
        }
        let totals = {
            let mut totals = self.totals.write();
            totals.next_addr = LOG_BASE;
            *totals
        };
        self.persist_totals_locked(&totals).await?;
        info!("FRAM log cleared");
        first_error.map_or(Ok(()), Err)
    }

    /// Verify every block; one report line per block
    pub async fn check(&self) -> Vec<String> {
        let _guard = self.lock.lock().await;
        let mut lines = vec!["Checking FRAM data ...".to_string()];
        for addr in (TOTALS_ADDR..FRAM_SIZE).step_by(BLOCK_SIZE as usize) {
            let verdict = match self.read_raw_block(addr).await {
                Ok((_, true)) => "OK".to_string(),
                Ok((block, false)) => match stored_crc(&block, PAYLOAD_LEN) {
                    Some(0x0000) | Some(0xFFFF) => "Block free".to_string(),
                    _ => status_text(&Err(FramError::Crc)),
                },
                Err(e) => status_text(&Err(e)),
            };
            lines.push(format!("Address: 0x{:04X} ... {}", addr, verdict));
        }
        lines
    }

    /// Hex dump of the first `pages` 256-byte pages (0 = whole device)
    pub async fn hex_dump(&self, pages: u8) -> Vec<String> {
        let _guard = self.lock.lock().await;
        let total_pages = (FRAM_SIZE / 256) as u8;
        let pages = if pages == 0 {
            total_pages
        } else {
            pages.min(total_pages)
        };
        let mut lines = Vec::new();
        let end = u16::from(pages) * 256;
        for addr in (0..end).step_by(16) {
            let mut row = [0u8; 16];
            if let Err(e) = self.raw_read(addr, &mut row).await {
                lines.push(format!(
                    "Error read from FRAM: 0x{:04X} {}",
                    addr,
                    status_text(&Err(e))
                ));
            }
            lines.push(common::hex::dump_row(addr, &row));
            if addr % 256 == 240 {
                lines.push(String::new());
            }
        }
        lines
    }

    /// Destructive pattern test of the whole device
    ///
    /// The totals block is rewritten from memory afterwards; the log is lost.
    pub async fn self_test(&self) -> Vec<String> {
        let _guard = self.lock.lock().await;
        let mut lines = Vec::new();
        for pattern in TEST_PATTERNS {
            let chunk = [pattern; TEST_CHUNK];
            let mut line = format!("Write: 0x{:02X}  ", pattern);
            for addr in (0..FRAM_SIZE).step_by(TEST_CHUNK) {
                if self.raw_write(addr, &chunk).await.is_err() {
                    lines.push(format!("Error save: 0x{:04X}", addr));
                }
            }
            let mut mismatches = 0;
            for addr in (0..FRAM_SIZE).step_by(TEST_CHUNK) {
                let mut read = [0u8; TEST_CHUNK];
                if self.raw_read(addr, &mut read).await.is_err() {
                    lines.push(format!("Error read: 0x{:04X}", addr));
                }
                if read != chunk {
                    mismatches += 1;
                    lines.push(format!("Error compare: 0x{:04X}", addr));
                }
            }
            if mismatches == 0 {
                line.push_str("Compare: OK");
            }
            lines.push(line);
        }

        let totals = {
            let mut totals = self.totals.write();
            totals.next_addr = LOG_BASE;
            *totals
        };
        if let Err(e) = self.persist_totals_locked(&totals).await {
            lines.push(format!("Error write to FRAM: 0x{:04X} {}", TOTALS_ADDR, e));
        }
        lines
    }
}
