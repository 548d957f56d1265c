//! Valve actuator control
//!
//! Each valve is a motor drive with no position feedback during the stroke.
//! A stroke is supervised by two one-shot timers: the load check expects drive
//! current shortly after start, the travel check bounds the whole stroke. A
//! latched error blocks every further drive command until it is cleared by
//! the manual key or an explicit command.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::flags::ValveEvents;
use super::state::{ValveError, ValveStatus};
use crate::core::context::DeviceContext;
use crate::core::hal::{Led, LedMode, Valve};
use crate::protocols::zigbee::ZbEvents;

/// Drive current must show up within this delay
pub const LOAD_CHECK_DELAY: Duration = Duration::from_millis(100);
/// Longest allowed stroke
pub const TRAVEL_WINDOW: Duration = Duration::from_millis(15_000);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriveCommand {
    Open,
    Close,
    Stop,
}

impl DriveCommand {
    /// Direction and enable levels; the hot drive is wired reversed
    fn levels(self, valve: Valve) -> (bool, bool) {
        match (self, valve) {
            (DriveCommand::Open, Valve::Cold) | (DriveCommand::Close, Valve::Hot) => (true, true),
            (DriveCommand::Close, Valve::Cold) | (DriveCommand::Open, Valve::Hot) => (false, true),
            (DriveCommand::Stop, _) => (false, false),
        }
    }
}

/// Restartable one-shot timer raising valve events when it expires
#[derive(Default)]
struct OneShot {
    handle: Option<JoinHandle<()>>,
}

impl OneShot {
    fn start(&mut self, ctx: &Arc<DeviceContext>, delay: Duration, events: ValveEvents) {
        self.stop();
        let ctx = Arc::clone(ctx);
        self.handle = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            ctx.valve_events.set(events);
        }));
    }

    fn stop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

#[derive(Default)]
struct StrokeTimers {
    load: OneShot,
    travel: OneShot,
}

impl StrokeTimers {
    fn stop(&mut self) {
        self.load.stop();
        self.travel.stop();
    }
}

/// Owner of both valve drives
pub struct ValveController {
    ctx: Arc<DeviceContext>,
    timers: [StrokeTimers; 2],
}

impl ValveController {
    pub fn new(ctx: Arc<DeviceContext>) -> Self {
        Self {
            ctx,
            timers: Default::default(),
        }
    }

    fn status(&self, valve: Valve) -> ValveStatus {
        self.ctx.valve_snapshot(valve).status
    }

    fn set_leds(&self, valve: Valve, open: LedMode, close: LedMode) {
        let indicator = &self.ctx.board.indicator;
        indicator.set_led(Led::Open(valve), open);
        indicator.set_led(Led::Close(valve), close);
    }

    /// Show the observed end position
    fn refresh_leds(&self, valve: Valve) {
        match self.status(valve) {
            ValveStatus::Undefined => self.set_leds(valve, LedMode::Blink, LedMode::Blink),
            ValveStatus::Closed => self.set_leds(valve, LedMode::Off, LedMode::On),
            ValveStatus::Open => self.set_leds(valve, LedMode::On, LedMode::Off),
        }
    }

    /// Set the drive outputs; refused while an error is latched
    pub fn drive(&self, valve: Valve, cmd: DriveCommand) -> bool {
        let error = self.ctx.state.valve_error(valve);
        if error != ValveError::Ok {
            warn!("Valve {} {:?} refused: error {}", valve, cmd, error);
            return false;
        }
        let (direction, enable) = cmd.levels(valve);
        self.ctx.board.pins.set_drive(valve, direction, enable);
        match cmd {
            DriveCommand::Open => self.set_leds(valve, LedMode::Blink, LedMode::Off),
            DriveCommand::Close => self.set_leds(valve, LedMode::Off, LedMode::Blink),
            DriveCommand::Stop => {},
        }
        debug!("Valve {} drive {:?}", valve, cmd);
        true
    }

    /// Latch or clear the valve error
    pub fn set_error(&self, valve: Valve, err: ValveError) {
        self.ctx.state.set_valve_error(valve, err);
        if err == ValveError::Ok {
            if !self.ctx.board.pins.drive_enabled(valve) {
                self.set_leds(valve, LedMode::Off, LedMode::Off);
            }
        } else {
            error!("Valve {} fault: {}", valve, err);
            self.set_leds(valve, LedMode::Blink, LedMode::Blink);
        }
    }

    fn start_stroke(&mut self, valve: Valve, cmd: DriveCommand) {
        if !self.drive(valve, cmd) {
            return;
        }
        info!("Valve {} {:?} started", valve, cmd);
        let timers = &mut self.timers[valve.index()];
        timers
            .load
            .start(&self.ctx, LOAD_CHECK_DELAY, ValveEvents::load_check(valve));
        timers
            .travel
            .start(&self.ctx, TRAVEL_WINDOW, ValveEvents::travel_check(valve));
    }

    fn fault(&mut self, valve: Valve, err: ValveError) {
        self.drive(valve, DriveCommand::Stop);
        self.set_error(valve, err);
    }

    /// Handle one batch of pending events, cold valve first
    pub fn handle(&mut self, events: ValveEvents) {
        let gated = events.contains(ValveEvents::PREV_CHECK);
        for valve in Valve::ALL {
            self.handle_valve(valve, events, gated);
        }
    }

    fn handle_valve(&mut self, valve: Valve, events: ValveEvents, gated: bool) {
        if events.contains(ValveEvents::key(valve)) {
            info!("Valve {} key pressed", valve);
            self.set_error(valve, ValveError::Ok);
            let request = match self.status(valve) {
                ValveStatus::Closed => ValveEvents::open(valve),
                ValveStatus::Open | ValveStatus::Undefined => ValveEvents::close(valve),
            };
            self.ctx.valve_request(request);
        }

        if events.contains(ValveEvents::open(valve)) {
            if !gated || self.status(valve) == ValveStatus::Closed {
                self.start_stroke(valve, DriveCommand::Open);
            } else {
                debug!("Valve {} open skipped: not closed", valve);
            }
        }

        if events.contains(ValveEvents::close(valve)) {
            if !gated || self.status(valve) == ValveStatus::Open {
                self.start_stroke(valve, DriveCommand::Close);
            } else {
                debug!("Valve {} close skipped: not open", valve);
            }
        }

        if events.contains(ValveEvents::stop(valve)) && self.drive(valve, DriveCommand::Stop) {
            self.set_leds(valve, LedMode::Off, LedMode::Off);
        }

        if events.contains(ValveEvents::load_check(valve))
            && !self.ctx.board.pins.load_present(valve)
        {
            self.timers[valve.index()].travel.stop();
            self.fault(valve, ValveError::NoPower);
        }

        if events.contains(ValveEvents::travel_check(valve))
            && self.ctx.board.pins.drive_enabled(valve)
        {
            self.fault(valve, ValveError::Timeout);
        }

        if events.contains(ValveEvents::power_off(valve)) {
            self.drive(valve, DriveCommand::Stop);
            // a latched fault keeps blinking
            if self.ctx.state.valve_error(valve) == ValveError::Ok {
                self.refresh_leds(valve);
            }
            info!("Valve {} stroke finished: {}", valve, self.status(valve));
            self.ctx.zb_events.set(ZbEvents::SEND_VALVE);
        }

        if events.contains(ValveEvents::overload(valve)) {
            self.timers[valve.index()].stop();
            self.fault(valve, ValveError::Overload);
        }
    }

    /// Serve valve events until cancelled
    pub async fn run(mut self, token: CancellationToken) {
        for valve in Valve::ALL {
            self.refresh_leds(valve);
        }
        info!("Valve control started");
        loop {
            let events = tokio::select! {
                _ = token.cancelled() => break,
                events = self.ctx.valve_events.wait(ValveEvents::all()) => events,
            };
            debug!("Valve events {:?}", events);
            self.handle(events);
        }
        for timers in &mut self.timers {
            timers.stop();
        }
        info!("Valve control stopped");
    }
}
