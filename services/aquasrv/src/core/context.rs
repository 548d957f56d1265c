//! Device context shared by every task
//!
//! Holds the configuration, storage, board handles, the event groups and the
//! link counters. Tasks receive an `Arc<DeviceContext>` and talk to each other
//! only through the event groups and the CAN transmit queue.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::events::EventGroup;
use super::hal::{
    FramBus, Indicator, LeakSensor, PressureAdc, RadioControl, ResetSource, Rtc, SensorInputs,
    Valve, ValvePins,
};
use super::sim::{SimAdc, SimBoard};
use super::time::DateTime;
use crate::config::device::FLASH_PAGE;
use crate::config::{
    load_device_config, save_device_config, Config, ConfigError, ConfigStore, FlashStatus,
};
use crate::device::flags::{ValveEvents, WaterEvents};
use crate::device::state::{DeviceSnapshot, LeakState, Meter, SharedState, ValveSnapshot};
use crate::protocols::can::{CanMessage, CanStats};
use crate::protocols::modbus::ModbusStats;
use crate::protocols::zigbee::{ZbEvents, ZbStats};
use crate::storage::{FramStore, InitStatus};

/// Depth of the CAN transmit queue
pub const CAN_QUEUE_DEPTH: usize = 8;

/// Board peripherals
#[derive(Clone)]
pub struct Board {
    pub pins: Arc<dyn ValvePins>,
    pub sensors: Arc<dyn SensorInputs>,
    pub rtc: Arc<dyn Rtc>,
    pub adc: Arc<dyn PressureAdc>,
    pub indicator: Arc<dyn Indicator>,
    pub radio: Arc<dyn RadioControl>,
}

impl Board {
    /// Every peripheral backed by one simulated board
    pub fn simulated(sim: Arc<SimBoard>, rtc: Arc<dyn Rtc>, adc: Arc<SimAdc>) -> Self {
        Self {
            pins: sim.clone(),
            sensors: sim.clone(),
            rtc,
            adc,
            indicator: sim.clone(),
            radio: sim,
        }
    }
}

/// Pulses seen by the counter inputs and not yet added to the totals
#[derive(Debug, Default)]
pub struct PulseCounters {
    pending: [AtomicU32; 3],
}

impl PulseCounters {
    pub fn add(&self, meter: Meter) {
        self.pending[meter.index()].fetch_add(1, Ordering::AcqRel);
    }

    pub fn take(&self, meter: Meter) -> u32 {
        self.pending[meter.index()].swap(0, Ordering::AcqRel)
    }
}

/// Bounded CAN transmit queue; the transmit task takes the receiving half
pub struct CanQueue {
    tx: mpsc::Sender<CanMessage>,
    rx: Mutex<Option<mpsc::Receiver<CanMessage>>>,
}

impl Default for CanQueue {
    fn default() -> Self {
        let (tx, rx) = mpsc::channel(CAN_QUEUE_DEPTH);
        Self {
            tx,
            rx: Mutex::new(Some(rx)),
        }
    }
}

impl CanQueue {
    /// Queue without waiting; a full queue drops the message
    pub fn push(&self, message: CanMessage) -> bool {
        match self.tx.try_send(message) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(m)) => {
                warn!("CAN send queue full, message 0x{:X} dropped", m.msg_id);
                false
            },
            Err(mpsc::error::TrySendError::Closed(m)) => {
                debug!("CAN send queue closed, message 0x{:X} dropped", m.msg_id);
                false
            },
        }
    }

    pub fn take_receiver(&self) -> Option<mpsc::Receiver<CanMessage>> {
        self.rx.lock().take()
    }
}

/// Everything the tasks share
pub struct DeviceContext {
    config: RwLock<Config>,
    config_store: Arc<dyn ConfigStore>,
    flash_status: FlashStatus,
    pub fram: FramStore,
    pub state: SharedState,
    pub board: Board,
    pub valve_events: EventGroup<ValveEvents>,
    pub water_events: EventGroup<WaterEvents>,
    pub zb_events: EventGroup<ZbEvents>,
    pub pulses: PulseCounters,
    pub can_queue: CanQueue,
    pub can_stats: CanStats,
    pub modbus_stats: ModbusStats,
    pub zb_stats: ZbStats,
    /// Debug-only console verbs enabled
    pub debug: bool,
}

impl DeviceContext {
    /// Load the device configuration and bring up the FRAM store
    pub async fn open(
        config_store: Arc<dyn ConfigStore>,
        fram_bus: Arc<dyn FramBus>,
        board: Board,
        reset: ResetSource,
        debug: bool,
    ) -> Arc<Self> {
        let (config, flash_status) = load_device_config(config_store.as_ref());
        let fram = FramStore::new(fram_bus);
        let status = fram.init(board.rtc.as_ref(), reset as u8).await;
        if status != InitStatus::default() {
            warn!("FRAM totals not restored cleanly: {:?}", status);
        }
        info!(
            "Device context ready: flash {}, reset source {}",
            flash_status,
            reset.description()
        );
        Arc::new(Self {
            config: RwLock::new(config),
            config_store,
            flash_status,
            fram,
            state: SharedState::new(),
            board,
            valve_events: EventGroup::new(),
            water_events: EventGroup::new(),
            zb_events: EventGroup::new(),
            pulses: PulseCounters::default(),
            can_queue: CanQueue::default(),
            can_stats: CanStats::new(),
            modbus_stats: ModbusStats::new(),
            zb_stats: ZbStats::new(),
            debug,
        })
    }

    /// Copy of the device configuration
    pub fn config(&self) -> Config {
        self.config.read().clone()
    }

    /// Apply a validated change in memory; [`save_config`](Self::save_config) persists it
    pub fn update_config<F>(&self, f: F) -> Result<(), ConfigError>
    where
        F: FnOnce(&mut Config) -> Result<(), ConfigError>,
    {
        let mut config = self.config.write();
        let mut next = config.clone();
        f(&mut next)?;
        *config = next;
        Ok(())
    }

    pub fn save_config(&self) -> Result<(), ConfigError> {
        let config = self.config();
        save_device_config(self.config_store.as_ref(), &config)
    }

    /// Outcome of reading the configuration page at boot
    pub fn flash_status(&self) -> &FlashStatus {
        &self.flash_status
    }

    /// Raw configuration page as stored
    pub fn flash_page(&self) -> Result<[u8; FLASH_PAGE], ConfigError> {
        self.config_store.read_page()
    }

    pub fn now(&self) -> DateTime {
        self.board.rtc.now()
    }

    pub fn set_time(&self, value: DateTime) {
        self.board.rtc.set(value);
        info!("Clock set to {}", value);
    }

    pub fn leaks(&self) -> LeakState {
        LeakState::read(self.board.sensors.as_ref())
    }

    pub fn valve_snapshot(&self, valve: Valve) -> ValveSnapshot {
        self.state.valve_snapshot(self.board.pins.as_ref(), valve)
    }

    /// Live state of valves, meters, pressures and leak inputs
    pub fn snapshot(&self) -> DeviceSnapshot {
        DeviceSnapshot {
            cold: self.valve_snapshot(Valve::Cold),
            hot: self.valve_snapshot(Valve::Hot),
            counts: self.fram.totals().counts,
            pressure: [
                self.state.pressure(Valve::Cold),
                self.state.pressure(Valve::Hot),
            ],
            leaks: self.leaks(),
        }
    }

    /// One pulse on a meter input
    pub fn pulse(&self, meter: Meter) {
        self.pulses.add(meter);
        self.water_events.set(WaterEvents::pulse(meter));
    }

    /// Leak sensor became wet: close both valves, then let the water task log it
    pub fn leak_alarm(&self, sensor: LeakSensor) {
        warn!("Water leak on sensor #{}", sensor.number());
        self.valve_events
            .set(ValveEvents::close(Valve::Cold) | ValveEvents::close(Valve::Hot));
        self.water_events.set(WaterEvents::leak(sensor));
    }

    /// Raise a valve request
    pub fn valve_request(&self, events: ValveEvents) {
        self.valve_events.set(events);
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
pub(crate) mod tests {
    use super::*;
    use crate::config::MemConfigStore;
    use crate::core::sim::{MemFram, SimRtc};

    /// Context over a simulated board, blank FRAM and erased flash
    pub(crate) async fn sim_context() -> (Arc<DeviceContext>, Arc<SimBoard>, Arc<SimAdc>) {
        sim_context_with(true).await
    }

    pub(crate) async fn sim_context_with(
        debug: bool,
    ) -> (Arc<DeviceContext>, Arc<SimBoard>, Arc<SimAdc>) {
        let sim = Arc::new(SimBoard::new());
        let adc = Arc::new(SimAdc::new([0, 0]));
        let rtc = Arc::new(SimRtc::new(DateTime::new(10, 6, 2024, 12, 0, 0).unwrap()));
        let board = Board::simulated(sim.clone(), rtc, adc.clone());
        let ctx = DeviceContext::open(
            Arc::new(MemConfigStore::new()),
            Arc::new(MemFram::new()),
            board,
            ResetSource::PowerOn,
            debug,
        )
        .await;
        (ctx, sim, adc)
    }

    #[tokio::test]
    async fn test_open_on_blank_storage_uses_defaults() {
        let (ctx, _sim, _adc) = sim_context().await;
        assert_eq!(ctx.config(), Config::default());
        assert!(matches!(ctx.flash_status(), FlashStatus::Failed(_)));
        assert_eq!(ctx.fram.totals().counts, [0, 0, 0]);
    }

    #[tokio::test]
    async fn test_update_config_is_all_or_nothing() {
        let (ctx, _sim, _adc) = sim_context().await;
        let result = ctx.update_config(|c| {
            c.set_modbus_id(5)?;
            c.set_modbus_id(0)
        });
        assert!(result.is_err());
        assert_eq!(ctx.config().modbus_id(), Config::default().modbus_id());

        ctx.update_config(|c| c.set_modbus_id(5)).unwrap();
        ctx.save_config().unwrap();
        assert_eq!(Config::decode(&ctx.flash_page().unwrap()).unwrap().modbus_id(), 5);
    }

    #[tokio::test]
    async fn test_leak_alarm_raises_ungated_close() {
        let (ctx, _sim, _adc) = sim_context().await;
        ctx.leak_alarm(LeakSensor::Two);
        let valve = ctx.valve_events.peek();
        assert!(valve.contains(ValveEvents::COLD_CLS | ValveEvents::HOT_CLS));
        assert!(!valve.contains(ValveEvents::PREV_CHECK));
        assert_eq!(ctx.water_events.peek(), WaterEvents::LEAK2);
    }

    #[tokio::test]
    async fn test_pulses_accumulate_until_taken() {
        let (ctx, _sim, _adc) = sim_context().await;
        for _ in 0..3 {
            ctx.pulse(Meter::Hot);
        }
        assert_eq!(ctx.pulses.take(Meter::Hot), 3);
        assert_eq!(ctx.pulses.take(Meter::Hot), 0);
        assert_eq!(ctx.water_events.peek(), WaterEvents::CNT_HOT);
    }

    #[tokio::test]
    async fn test_can_queue_bounded() {
        let (ctx, _sim, _adc) = sim_context().await;
        for _ in 0..CAN_QUEUE_DEPTH {
            assert!(ctx.can_queue.push(CanMessage::new(1, &[0])));
        }
        assert!(!ctx.can_queue.push(CanMessage::new(1, &[0])));
        let mut rx = ctx.can_queue.take_receiver().unwrap();
        assert!(ctx.can_queue.take_receiver().is_none());
        assert_eq!(rx.recv().await.unwrap().msg_id, 1);
    }
}
