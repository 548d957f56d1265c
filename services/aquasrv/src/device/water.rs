//! Water meters, pressure and leak events
//!
//! The water task owns the meter totals and the event log writes. Two small
//! tickers feed it: the pressure sampler and the one-second clock.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::flags::WaterEvents;
use super::state::Meter;
use crate::config::Config;
use crate::core::context::DeviceContext;
use crate::core::hal::{LeakSensor, Valve};
use crate::protocols::can::payload::leak_payload;
use crate::protocols::can::{AnswerId, CanMessage};
use crate::protocols::zigbee::ZbEvents;
use crate::storage::fram::status_text;
use crate::storage::{EventKind, LogRecord};

/// Pressure sample period
pub const PRESSURE_PERIOD: Duration = Duration::from_millis(500);
/// Clock tick
pub const CLOCK_PERIOD: Duration = Duration::from_secs(1);

const ADC_REF: f32 = 3.292;
const ADC_FULL_SCALE: f32 = 4096.0;
/// Input divider in front of the ADC
const DIVIDER: f32 = 4.961 / 3.292;

/// Sensor output voltage of a raw ADC sample
pub fn sensor_volts(raw: u16) -> f32 {
    f32::from(raw) * ADC_REF / ADC_FULL_SCALE * DIVIDER
}

/// Pressure in hundredths of bar; readings outside the sensor output range give 0
pub fn pressure_hundredths(raw: u16, config: &Config) -> u16 {
    let volts = sensor_volts(raw);
    let (min, max) = (config.press_out_min(), config.press_out_max());
    if volts < min || volts > max || max <= min {
        return 0;
    }
    let atm = (volts - min) * config.pressure_max() / (max - min);
    (atm * 100.0) as u16
}

/// Meter totals and event log producer
pub struct WaterMonitor {
    ctx: Arc<DeviceContext>,
}

const METERS: [Meter; 3] = [Meter::Cold, Meter::Hot, Meter::Filter];
const LEAK_SENSORS: [LeakSensor; 2] = [LeakSensor::One, LeakSensor::Two];

impl WaterMonitor {
    pub fn new(ctx: Arc<DeviceContext>) -> Self {
        Self { ctx }
    }

    /// Add the pending pulses of one meter to its total
    async fn count(&self, meter: Meter) {
        let pulses = self.ctx.pulses.take(meter);
        if pulses == 0 {
            return;
        }
        let liters = u32::from(self.ctx.config().increment(meter)).wrapping_mul(pulses);
        let result = self
            .ctx
            .fram
            .update_totals(|t| t.set_count(meter, t.count(meter).wrapping_add(liters)))
            .await;
        match result {
            Ok(totals) => debug!(
                "{} meter +{} l ({} pulses), total {}",
                meter.name(),
                liters,
                pulses,
                totals.count(meter)
            ),
            Err(e) => error!("{} meter total not saved: {}", meter.name(), e),
        }
    }

    /// Append a log record of the present state
    pub async fn save_record(&self, kind: EventKind) {
        let snapshot = self.ctx.snapshot();
        if kind == EventKind::Alarm {
            self.ctx
                .can_queue
                .push(CanMessage::answer(AnswerId::Leak, &leak_payload(&snapshot)));
        }
        let record = LogRecord::from_snapshot(&snapshot, self.ctx.now(), kind);
        match self.ctx.fram.append_log(&record).await {
            Ok(addr) => info!("{:?} record saved at 0x{:04X}", kind, addr),
            Err(e) => error!("{:?} record not saved: {}", kind, e),
        }
    }

    async fn sample_pressure(&self) {
        match self.ctx.board.adc.sample().await {
            Ok(raw) => {
                let config = self.ctx.config();
                for valve in Valve::ALL {
                    let value = pressure_hundredths(raw[valve.index()], &config);
                    self.ctx.state.set_pressure(valve, value);
                }
            },
            Err(e) => warn!("Pressure sample failed: {}", e),
        }
    }

    /// Handle one batch of pending events
    pub async fn handle(&self, events: WaterEvents) {
        for meter in METERS {
            if events.contains(WaterEvents::pulse(meter)) {
                self.count(meter).await;
            }
        }
        for sensor in LEAK_SENSORS {
            if events.contains(WaterEvents::leak(sensor)) {
                warn!("Leak #{} recorded", sensor.number());
                self.save_record(EventKind::Alarm).await;
                self.ctx.zb_events.set(ZbEvents::SEND_LEAKS);
            }
        }
        if events.contains(WaterEvents::LOG) && self.ctx.now().is_end_of_day() {
            self.save_record(EventKind::Data).await;
        }
        if events.contains(WaterEvents::PRESSURE) {
            self.sample_pressure().await;
        }
    }

    pub async fn run(self, token: CancellationToken) {
        let status = self.ctx.fram.init_status();
        info!(
            "Checking current water flow values ... read: {} write: {}",
            status_text(&status.read),
            status_text(&status.write)
        );
        loop {
            let events = tokio::select! {
                _ = token.cancelled() => break,
                events = self.ctx.water_events.wait(WaterEvents::all()) => events,
            };
            self.handle(events).await;
        }
        info!("Water monitor stopped");
    }
}

fn spawn_ticker<F>(period: Duration, token: CancellationToken, mut tick: F) -> JoinHandle<()>
where
    F: FnMut() + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => tick(),
            }
        }
    })
}

/// Request a pressure sample every [`PRESSURE_PERIOD`]
pub fn spawn_pressure_ticker(ctx: Arc<DeviceContext>, token: CancellationToken) -> JoinHandle<()> {
    spawn_ticker(PRESSURE_PERIOD, token, move || {
        ctx.water_events.set(WaterEvents::PRESSURE)
    })
}

/// Once a second: daily record check, radio presence at each full minute
pub fn spawn_clock(ctx: Arc<DeviceContext>, token: CancellationToken) -> JoinHandle<()> {
    spawn_ticker(CLOCK_PERIOD, token, move || {
        ctx.water_events.set(WaterEvents::LOG);
        if ctx.now().sec() == 0 {
            ctx.zb_events.set(ZbEvents::IM_HERE);
        }
    })
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::core::context::tests::sim_context;
    use crate::core::time::DateTime;
    use crate::storage::SortIndex;

    #[test]
    fn test_pressure_conversion() {
        let config = Config::default();
        assert_eq!(pressure_hundredths(0, &config), 0);
        assert_eq!(pressure_hundredths(4095, &config), 0);
        // 2.5 V: middle of the 0.5..4.5 V span of a 10 atm sensor
        let mid = pressure_hundredths(2064, &config);
        assert!((499..=500).contains(&mid), "{}", mid);
        // just above the lower bound
        assert!(pressure_hundredths(420, &config) < 10);
    }

    #[tokio::test]
    async fn test_pulses_add_increment_each() {
        let (ctx, _sim, _adc) = sim_context().await;
        let water = WaterMonitor::new(ctx.clone());
        for _ in 0..5 {
            ctx.pulse(Meter::Cold);
        }
        let events = ctx.water_events.try_take(WaterEvents::all()).unwrap();
        water.handle(events).await;
        assert_eq!(ctx.fram.totals().count(Meter::Cold), 50);
        assert_eq!(ctx.fram.totals().count(Meter::Hot), 0);
    }

    #[tokio::test]
    async fn test_leak_queues_can_then_logs_alarm() {
        let (ctx, sim, _adc) = sim_context().await;
        sim.set_leak(LeakSensor::Two, true);
        let mut can_rx = ctx.can_queue.take_receiver().unwrap();
        let water = WaterMonitor::new(ctx.clone());

        water.handle(WaterEvents::LEAK2).await;

        let message = can_rx.try_recv().unwrap();
        assert_eq!(message.msg_id, AnswerId::Leak as u32);
        assert_eq!(message.data[1] & 0x02, 0x02);
        let index = SortIndex::build_kind(&ctx.fram, EventKind::Alarm).await;
        assert_eq!(index.len(), 1);
        assert!(index.get(0).unwrap().record.leaks.leak2);
        assert!(ctx.zb_events.peek().contains(ZbEvents::SEND_LEAKS));
    }

    #[tokio::test]
    async fn test_daily_record_only_at_end_of_day() {
        let (ctx, _sim, _adc) = sim_context().await;
        let water = WaterMonitor::new(ctx.clone());
        water.handle(WaterEvents::LOG).await;
        assert!(SortIndex::build(&ctx.fram).await.is_empty());

        ctx.set_time(DateTime::new(10, 6, 2024, 23, 59, 59).unwrap());
        water.handle(WaterEvents::LOG).await;
        let index = SortIndex::build_kind(&ctx.fram, EventKind::Data).await;
        assert_eq!(index.len(), 1);
    }

    #[tokio::test]
    async fn test_pressure_sample_updates_state() {
        let (ctx, _sim, adc) = sim_context().await;
        adc.set([2064, 0]);
        let water = WaterMonitor::new(ctx.clone());
        water.handle(WaterEvents::PRESSURE).await;
        assert!(ctx.state.pressure(Valve::Cold) >= 499);
        assert_eq!(ctx.state.pressure(Valve::Hot), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_clock_raises_log_and_presence() {
        let (ctx, _sim, _adc) = sim_context().await;
        let token = CancellationToken::new();
        let handle = spawn_clock(ctx.clone(), token.clone());
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(ctx.water_events.peek().contains(WaterEvents::LOG));
        // simulated clock sits at 12:00:00
        assert!(ctx.zb_events.peek().contains(ZbEvents::IM_HERE));
        token.cancel();
        handle.await.unwrap();
    }
}
