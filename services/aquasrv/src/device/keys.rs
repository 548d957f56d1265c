//! Periodic scan of the discrete inputs
//!
//! Every input is sampled once per period; a level counts only when two
//! consecutive scans agree. Edges on the manual keys, the drive current and overload
//! senses and the leak sensors become events.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::flags::ValveEvents;
use crate::core::context::DeviceContext;
use crate::core::hal::{LeakSensor, Valve};

/// Scan period
pub const SCAN_PERIOD: Duration = Duration::from_millis(20);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Edge {
    Rising,
    Falling,
}

/// Debounced level with edge reporting
#[derive(Debug, Clone, Copy, Default)]
pub struct EdgeDetector {
    level: bool,
    /// Sample taken on the previous scan
    last: bool,
}

impl EdgeDetector {
    pub fn new(level: bool) -> Self {
        Self { level, last: level }
    }

    pub fn level(&self) -> bool {
        self.level
    }

    /// Feed this scan's sample; the level follows once it matches the previous one
    pub fn update(&mut self, sample: bool) -> Option<Edge> {
        let previous = std::mem::replace(&mut self.last, sample);
        if sample != previous || sample == self.level {
            return None;
        }
        self.level = sample;
        Some(if sample { Edge::Rising } else { Edge::Falling })
    }
}

/// Key, drive sense and leak input scanner
pub struct KeyScanner {
    ctx: Arc<DeviceContext>,
    key: [EdgeDetector; 2],
    load: [EdgeDetector; 2],
    overload: [EdgeDetector; 2],
    leak: [EdgeDetector; 2],
}

const LEAK_SENSORS: [LeakSensor; 2] = [LeakSensor::One, LeakSensor::Two];

impl KeyScanner {
    /// Start from the present levels; leak inputs start dry so a sensor
    /// already wet at boot still raises the alarm
    pub fn new(ctx: Arc<DeviceContext>) -> Self {
        let pins = &ctx.board.pins;
        let key = Valve::ALL.map(|v| EdgeDetector::new(pins.key_pressed(v)));
        let load = Valve::ALL.map(|v| EdgeDetector::new(pins.load_present(v)));
        let overload = Valve::ALL.map(|v| EdgeDetector::new(pins.overload(v)));
        Self {
            ctx,
            key,
            load,
            overload,
            leak: [EdgeDetector::default(); 2],
        }
    }

    /// One scan; returns the valve events raised
    pub fn scan(&mut self) -> ValveEvents {
        let pins = Arc::clone(&self.ctx.board.pins);
        let sensors = Arc::clone(&self.ctx.board.sensors);
        let mut events = ValveEvents::empty();

        for valve in Valve::ALL {
            let i = valve.index();
            if self.key[i].update(pins.key_pressed(valve)) == Some(Edge::Rising) {
                events |= ValveEvents::key(valve);
            }
            if self.load[i].update(pins.load_present(valve)) == Some(Edge::Falling) {
                events |= ValveEvents::power_off(valve);
            }
            if self.overload[i].update(pins.overload(valve)) == Some(Edge::Rising) {
                events |= ValveEvents::overload(valve);
            }
        }
        if !events.is_empty() {
            debug!("Input edges {:?}", events);
            self.ctx.valve_request(events);
        }

        for (i, sensor) in LEAK_SENSORS.iter().enumerate() {
            if self.leak[i].update(sensors.leak(*sensor)) == Some(Edge::Rising) {
                self.ctx.leak_alarm(*sensor);
            }
        }
        events
    }

    pub async fn run(mut self, token: CancellationToken) {
        let mut ticker = tokio::time::interval(SCAN_PERIOD);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!("Input scan started");
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    self.scan();
                },
            }
        }
        info!("Input scan stopped");
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::core::context::tests::sim_context;
    use crate::device::flags::WaterEvents;

    #[test]
    fn test_edge_detector_needs_consecutive_samples() {
        let mut det = EdgeDetector::default();
        assert_eq!(det.update(true), None);
        assert_eq!(det.update(false), None);
        assert!(!det.level());
        assert_eq!(det.update(true), None);
        assert_eq!(det.update(true), Some(Edge::Rising));
        assert_eq!(det.update(true), None);
        assert_eq!(det.update(false), None);
        assert_eq!(det.update(false), Some(Edge::Falling));
    }

    #[tokio::test]
    async fn test_key_press_and_release() {
        let (ctx, sim, _adc) = sim_context().await;
        let mut scanner = KeyScanner::new(ctx.clone());
        assert!(scanner.scan().is_empty());

        sim.set_key(Valve::Hot, true);
        assert!(scanner.scan().is_empty());
        assert_eq!(scanner.scan(), ValveEvents::HOT_KEY);
        assert!(scanner.scan().is_empty());
        sim.set_key(Valve::Hot, false);
        assert!(scanner.scan().is_empty());
        assert!(scanner.scan().is_empty());
        assert_eq!(ctx.valve_events.peek(), ValveEvents::HOT_KEY);
    }

    #[tokio::test]
    async fn test_key_bounce_between_scans_is_ignored() {
        let (ctx, sim, _adc) = sim_context().await;
        let mut scanner = KeyScanner::new(ctx.clone());
        for pressed in [true, false, true, false] {
            sim.set_key(Valve::Cold, pressed);
            assert!(scanner.scan().is_empty());
        }
        assert!(ctx.valve_events.peek().is_empty());
    }

    #[tokio::test]
    async fn test_load_drop_and_overload_edges() {
        let (ctx, sim, _adc) = sim_context().await;
        let mut scanner = KeyScanner::new(ctx.clone());
        sim.set_load(Valve::Cold, true);
        assert!(scanner.scan().is_empty());
        assert!(scanner.scan().is_empty());
        sim.set_load(Valve::Cold, false);
        sim.set_overload(Valve::Hot, true);
        assert!(scanner.scan().is_empty());
        assert_eq!(scanner.scan(), ValveEvents::COLD_PWR | ValveEvents::HOT_OVR);
    }

    #[tokio::test]
    async fn test_leak_edge_raises_alarm_once() {
        let (ctx, sim, _adc) = sim_context().await;
        let mut scanner = KeyScanner::new(ctx.clone());
        sim.set_leak(LeakSensor::One, true);
        scanner.scan();
        assert!(ctx.water_events.peek().is_empty());
        scanner.scan();
        assert_eq!(ctx.water_events.try_take(WaterEvents::all()), Some(WaterEvents::LEAK1));
        scanner.scan();
        assert!(ctx.water_events.peek().is_empty());
        assert!(ctx
            .valve_events
            .peek()
            .contains(ValveEvents::COLD_CLS | ValveEvents::HOT_CLS));
    }
}
