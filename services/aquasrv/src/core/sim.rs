//! In-process board simulation
//!
//! Implements every hardware trait in memory and records the output
//! transitions, so tests and `--simulate` runs see the same controller code
//! paths as the real board.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::hal::{
    FramBus, HalError, Indicator, LeakSensor, Led, LedMode, PressureAdc, RadioControl, Rtc,
    SensorInputs, Valve, ValvePins,
};
use super::time::DateTime;
use crate::device::state::ValveStatus;
use crate::storage::fram::FRAM_SIZE;

/// One change of a valve drive output pair
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DriveChange {
    pub valve: Valve,
    pub direction: bool,
    pub enable: bool,
}

#[derive(Debug)]
struct BoardState {
    drive: [(bool, bool); 2],
    load: [bool; 2],
    overload: [bool; 2],
    lines: [(bool, bool); 2],
    key: [bool; 2],
    leak: [bool; 2],
    dc12: bool,
    leds: HashMap<Led, LedMode>,
    radio_reset: bool,
    radio_running: bool,
    drive_log: Vec<DriveChange>,
    reset_pulses: u32,
}

impl Default for BoardState {
    fn default() -> Self {
        Self {
            drive: [(false, false); 2],
            load: [false; 2],
            overload: [false; 2],
            // both valves closed
            lines: [(true, false); 2],
            key: [false; 2],
            leak: [false; 2],
            dc12: true,
            leds: HashMap::new(),
            radio_reset: false,
            radio_running: true,
            drive_log: Vec::new(),
            reset_pulses: 0,
        }
    }
}

/// Simulated GPIO, LEDs and radio control lines
#[derive(Debug, Default)]
pub struct SimBoard {
    state: Mutex<BoardState>,
}

impl SimBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_position(&self, valve: Valve, status: ValveStatus) {
        let lines = match status {
            ValveStatus::Open => (false, true),
            ValveStatus::Closed => (true, false),
            ValveStatus::Undefined => (true, true),
        };
        self.state.lock().lines[valve.index()] = lines;
    }

    pub fn set_load(&self, valve: Valve, present: bool) {
        self.state.lock().load[valve.index()] = present;
    }

    pub fn set_overload(&self, valve: Valve, active: bool) {
        self.state.lock().overload[valve.index()] = active;
    }

    pub fn set_key(&self, valve: Valve, pressed: bool) {
        self.state.lock().key[valve.index()] = pressed;
    }

    pub fn set_leak(&self, sensor: LeakSensor, wet: bool) {
        let index = usize::from(sensor.number() - 1);
        self.state.lock().leak[index] = wet;
    }

    pub fn set_dc12(&self, ok: bool) {
        self.state.lock().dc12 = ok;
    }

    pub fn set_radio_running(&self, running: bool) {
        self.state.lock().radio_running = running;
    }

    /// Every drive output change so far
    pub fn drive_log(&self) -> Vec<DriveChange> {
        self.state.lock().drive_log.clone()
    }

    pub fn drive(&self, valve: Valve) -> (bool, bool) {
        self.state.lock().drive[valve.index()]
    }

    pub fn led(&self, led: Led) -> Option<LedMode> {
        self.state.lock().leds.get(&led).copied()
    }

    pub fn reset_pulses(&self) -> u32 {
        self.state.lock().reset_pulses
    }
}

impl ValvePins for SimBoard {
    fn set_drive(&self, valve: Valve, direction: bool, enable: bool) {
        let mut state = self.state.lock();
        if state.drive[valve.index()] != (direction, enable) {
            state.drive[valve.index()] = (direction, enable);
            state.drive_log.push(DriveChange {
                valve,
                direction,
                enable,
            });
        }
    }

    fn drive_enabled(&self, valve: Valve) -> bool {
        self.state.lock().drive[valve.index()].1
    }

    fn load_present(&self, valve: Valve) -> bool {
        self.state.lock().load[valve.index()]
    }

    fn overload(&self, valve: Valve) -> bool {
        self.state.lock().overload[valve.index()]
    }

    fn position_lines(&self, valve: Valve) -> (bool, bool) {
        self.state.lock().lines[valve.index()]
    }

    fn key_pressed(&self, valve: Valve) -> bool {
        self.state.lock().key[valve.index()]
    }
}

impl SensorInputs for SimBoard {
    fn leak(&self, sensor: LeakSensor) -> bool {
        self.state.lock().leak[usize::from(sensor.number() - 1)]
    }

    fn dc12_ok(&self) -> bool {
        self.state.lock().dc12
    }
}

impl Indicator for SimBoard {
    fn set_led(&self, led: Led, mode: LedMode) {
        self.state.lock().leds.insert(led, mode);
    }
}

impl RadioControl for SimBoard {
    fn set_reset(&self, asserted: bool) {
        let mut state = self.state.lock();
        if asserted && !state.radio_reset {
            state.reset_pulses += 1;
        }
        state.radio_reset = asserted;
    }

    fn is_running(&self) -> bool {
        let state = self.state.lock();
        state.radio_running && !state.radio_reset
    }
}

/// Drive the simulated valve mechanics: an energized drive draws current,
/// reaches the end stop after `travel` and drops the load
pub fn spawn_valve_model(
    board: Arc<SimBoard>,
    travel: Duration,
    token: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut started: [Option<tokio::time::Instant>; 2] = [None, None];
        let mut ticker = tokio::time::interval(Duration::from_millis(10));
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {},
            }
            for valve in Valve::ALL {
                let (direction, enable) = board.drive(valve);
                let slot = &mut started[valve.index()];
                match (enable, *slot) {
                    (true, None) => {
                        *slot = Some(tokio::time::Instant::now());
                        board.set_load(valve, true);
                        board.set_position(valve, ValveStatus::Undefined);
                    },
                    (true, Some(at)) if at.elapsed() >= travel => {
                        let opening = match valve {
                            Valve::Cold => direction,
                            Valve::Hot => !direction,
                        };
                        board.set_position(
                            valve,
                            if opening {
                                ValveStatus::Open
                            } else {
                                ValveStatus::Closed
                            },
                        );
                        board.set_load(valve, false);
                    },
                    (false, Some(_)) => {
                        *slot = None;
                        board.set_load(valve, false);
                    },
                    _ => {},
                }
            }
        }
    })
}

/// Settable clock; stays where it was put unless advanced
#[derive(Debug)]
pub struct SimRtc {
    now: Mutex<DateTime>,
}

impl SimRtc {
    pub fn new(now: DateTime) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }
}

impl Rtc for SimRtc {
    fn now(&self) -> DateTime {
        *self.now.lock()
    }

    fn set(&self, value: DateTime) {
        *self.now.lock() = value;
    }
}

/// Fixed ADC readings
#[derive(Debug)]
pub struct SimAdc {
    raw: Mutex<[u16; 2]>,
}

impl SimAdc {
    pub fn new(raw: [u16; 2]) -> Self {
        Self {
            raw: Mutex::new(raw),
        }
    }

    pub fn set(&self, raw: [u16; 2]) {
        *self.raw.lock() = raw;
    }
}

#[async_trait]
impl PressureAdc for SimAdc {
    async fn sample(&self) -> Result<[u16; 2], HalError> {
        Ok(*self.raw.lock())
    }
}

fn check_range(addr: u16, len: usize) -> Result<std::ops::Range<usize>, HalError> {
    let start = usize::from(addr);
    let end = start + len;
    if end > usize::from(FRAM_SIZE) {
        return Err(HalError::Bus(format!(
            "access 0x{:04X}+{} beyond device",
            addr, len
        )));
    }
    Ok(start..end)
}

/// FRAM image in memory with fault injection
#[derive(Debug)]
pub struct MemFram {
    cells: Mutex<Vec<u8>>,
    fail_next: Mutex<Option<HalError>>,
}

impl Default for MemFram {
    fn default() -> Self {
        Self::new()
    }
}

impl MemFram {
    pub fn new() -> Self {
        Self {
            cells: Mutex::new(vec![0u8; usize::from(FRAM_SIZE)]),
            fail_next: Mutex::new(None),
        }
    }

    /// Fail the next transfer with `err`
    pub fn fail_next(&self, err: HalError) {
        *self.fail_next.lock() = Some(err);
    }

    /// Flip the bits of one byte
    pub fn corrupt(&self, addr: u16) {
        if let Some(cell) = self.cells.lock().get_mut(usize::from(addr)) {
            *cell ^= 0xFF;
        }
    }

    pub fn snapshot(&self) -> Vec<u8> {
        self.cells.lock().clone()
    }

    fn injected(&self) -> Result<(), HalError> {
        match self.fail_next.lock().take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl FramBus for MemFram {
    async fn read(&self, addr: u16, buf: &mut [u8]) -> Result<(), HalError> {
        self.injected()?;
        let range = check_range(addr, buf.len())?;
        buf.copy_from_slice(&self.cells.lock()[range]);
        Ok(())
    }

    async fn write(&self, addr: u16, data: &[u8]) -> Result<(), HalError> {
        self.injected()?;
        let range = check_range(addr, data.len())?;
        self.cells.lock()[range].copy_from_slice(data);
        Ok(())
    }
}

/// FRAM image kept in a file so a host run keeps its log across restarts
#[derive(Debug)]
pub struct FileFram {
    path: PathBuf,
    cells: Mutex<Vec<u8>>,
}

impl FileFram {
    pub fn open(path: &Path) -> std::io::Result<Self> {
        let mut cells = match std::fs::read(path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("FRAM image {} not found, starting blank", path.display());
                Vec::new()
            },
            Err(e) => return Err(e),
        };
        cells.resize(usize::from(FRAM_SIZE), 0);
        Ok(Self {
            path: path.to_path_buf(),
            cells: Mutex::new(cells),
        })
    }

    fn flush(&self, cells: &[u8]) -> Result<(), HalError> {
        std::fs::write(&self.path, cells).map_err(|e| {
            warn!("FRAM image write failed: {}", e);
            HalError::Bus(e.to_string())
        })
    }
}

#[async_trait]
impl FramBus for FileFram {
    async fn read(&self, addr: u16, buf: &mut [u8]) -> Result<(), HalError> {
        let range = check_range(addr, buf.len())?;
        buf.copy_from_slice(&self.cells.lock()[range]);
        Ok(())
    }

    async fn write(&self, addr: u16, data: &[u8]) -> Result<(), HalError> {
        let range = check_range(addr, data.len())?;
        let image = {
            let mut cells = self.cells.lock();
            cells[range].copy_from_slice(data);
            cells.clone()
        };
        self.flush(&image)
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    #[test]
    fn test_drive_log_records_changes_only() {
        let board = SimBoard::new();
        board.set_drive(Valve::Cold, true, true);
        board.set_drive(Valve::Cold, true, true);
        board.set_drive(Valve::Cold, false, false);
        assert_eq!(board.drive_log().len(), 2);
        assert!(!board.drive_enabled(Valve::Cold));
    }

    #[tokio::test]
    async fn test_mem_fram_bounds_and_fault_injection() {
        let fram = MemFram::new();
        fram.write(0x07F0, &[1; 16]).await.unwrap();
        assert!(fram.write(0x07F8, &[1; 16]).await.is_err());

        fram.fail_next(HalError::Timeout);
        let mut buf = [0u8; 4];
        assert_eq!(fram.read(0, &mut buf).await, Err(HalError::Timeout));
        assert!(fram.read(0, &mut buf).await.is_ok());
    }

    #[tokio::test]
    async fn test_file_fram_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fram.bin");
        {
            let fram = FileFram::open(&path).unwrap();
            fram.write(0x0100, &[0xAB, 0xCD]).await.unwrap();
        }
        let fram = FileFram::open(&path).unwrap();
        let mut buf = [0u8; 2];
        fram.read(0x0100, &mut buf).await.unwrap();
        assert_eq!(buf, [0xAB, 0xCD]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_valve_model_completes_stroke() {
        let board = Arc::new(SimBoard::new());
        let token = CancellationToken::new();
        let handle = spawn_valve_model(board.clone(), Duration::from_millis(500), token.clone());

        // cold opens with direction set
        board.set_drive(Valve::Cold, true, true);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(board.load_present(Valve::Cold));
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert!(!board.load_present(Valve::Cold));
        assert_eq!(board.position_lines(Valve::Cold), (false, true));

        token.cancel();
        handle.await.unwrap();
    }
}
