//! ZigBee control task
//!
//! Waits on the ZigBee event group and runs the pending work in a fixed
//! order: configuration check, network edges, then the outgoing packets.
//! Outcomes are printed the way the device console shows them.

use std::sync::Arc;
use std::time::Duration;

use errors::AquaErrorTrait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::link::ZbLink;
use super::module::{result_text, ModuleCommand, ZbError};
use super::packet::{data_packet, leaks_packet, state_packet, valve_packet, PacketType};
use super::ZbEvents;
use crate::core::context::DeviceContext;
use crate::storage::{EventKind, LogRecord};

/// Delay between start-up and the module configuration check
pub const CONFIG_CHECK_DELAY: Duration = Duration::from_millis(700);
/// Wait for the coordinator to acknowledge one log record
pub const ACK_TIMEOUT: Duration = Duration::from_millis(5000);
/// Configuration reads tried on a network edge
pub const NET_READ_ATTEMPTS: u32 = 3;

pub struct ZbController {
    ctx: Arc<DeviceContext>,
    link: Arc<ZbLink>,
}

impl ZbController {
    pub fn new(ctx: Arc<DeviceContext>, link: Arc<ZbLink>) -> Self {
        Self { ctx, link }
    }

    /// Read the module parameters and rewrite them when they drifted from the device configuration
    pub async fn check_config(&self) -> Result<(), ZbError> {
        let result = self.link.command(ModuleCommand::ReadConfig).await;
        info!("ZB: read config ... {}", result_text(&result));
        result?;
        let config = self.ctx.config();
        if !self.link.module_config().drifted(&config) {
            info!("ZB: parameters match.");
            return Ok(());
        }
        let result = self.link.command(ModuleCommand::SaveConfig).await;
        info!("ZB: save config ... {}", result_text(&result));
        result?;
        let result = self.link.command(ModuleCommand::ReadConfig).await;
        info!("ZB: read config ... {}", result_text(&result));
        for line in self.link.module_config().lines() {
            info!("{}", line);
        }
        result
    }

    /// Re-read the module parameters, backing off between retryable failures
    async fn refresh_config(&self) -> Result<(), ZbError> {
        let mut attempt = 1;
        loop {
            match self.link.command(ModuleCommand::ReadConfig).await {
                Err(e) if e.is_retryable() && attempt < NET_READ_ATTEMPTS => {
                    debug!("ZB: read config attempt {} failed: {}", attempt, e);
                    tokio::time::sleep(Duration::from_millis(e.retry_delay_ms())).await;
                    attempt += 1;
                },
                result => return result,
            }
        }
    }

    async fn send(&self, what: &str, payload: Vec<u8>) -> Result<(), ZbError> {
        let result = self.link.send_packet(&payload, None).await;
        info!("Send {}: {}", what, result_text(&result));
        result
    }

    /// Send the queued log records, each acknowledged; stops at the first failure.
    /// Returns the number of records delivered.
    pub async fn replay_log(&self) -> usize {
        let mut sent = 0;
        while let Some(entry) = self.link.next_replay() {
            let payload = data_packet(PacketType::WaterLog, self.link.identity(), &entry.record);
            let result = self.link.send_packet(&payload, Some(ACK_TIMEOUT)).await;
            info!("Send log data {:03}: {}", sent + 1, result_text(&result));
            if result.is_err() {
                self.link.clear_replay();
                break;
            }
            sent += 1;
        }
        sent
    }

    /// Run the pending events in order
    pub async fn handle(&self, events: ZbEvents) {
        if events.contains(ZbEvents::CONFIG_CHECK) {
            if let Err(e) = self.check_config().await {
                errors::report("ZigBee configuration check failed", &e);
            }
        }
        if events.contains(ZbEvents::NET_LOST) {
            info!("Network lost.");
            if let Err(e) = self.refresh_config().await {
                errors::report("ZigBee config read after network loss", &e);
            }
        }
        if events.contains(ZbEvents::NET_RESTORE) {
            info!("Network restored.");
            if let Err(e) = self.refresh_config().await {
                errors::report("ZigBee config read after network restore", &e);
            }
            self.ctx.zb_events.set(ZbEvents::SEND_STATE);
        }
        if events.intersects(ZbEvents::SEND_STATE | ZbEvents::IM_HERE) {
            let totals = self.ctx.fram.totals();
            let payload = state_packet(
                self.link.identity(),
                &self.ctx.now(),
                &totals.power_on,
                totals.reset_source,
            );
            if let Err(e) = self.send("state", payload).await {
                errors::report("ZigBee state packet", &e);
            }
        }
        if events.contains(ZbEvents::SEND_DATA) {
            let record = LogRecord::from_snapshot(&self.ctx.snapshot(), self.ctx.now(), EventKind::Data);
            let payload = data_packet(PacketType::Data, self.link.identity(), &record);
            if let Err(e) = self.send("data", payload).await {
                errors::report("ZigBee data packet", &e);
            }
        }
        if events.contains(ZbEvents::SEND_WLOG) {
            self.replay_log().await;
        }
        if events.contains(ZbEvents::SEND_VALVE) {
            let payload = valve_packet(self.link.identity(), self.ctx.snapshot().valve_byte());
            if let Err(e) = self.send("valve status", payload).await {
                errors::report("ZigBee valve packet", &e);
            }
        }
        if events.contains(ZbEvents::SEND_LEAKS) {
            let payload = leaks_packet(self.link.identity(), self.ctx.leaks().flags());
            if let Err(e) = self.send("status leaks", payload).await {
                errors::report("ZigBee leaks packet", &e);
            }
        }
        if events.contains(ZbEvents::SYNC_DTIME) {
            if let Some(value) = self.link.take_sync_time() {
                self.ctx.set_time(value);
                info!(
                    "Date/Time synchronization: {} {} OK",
                    value.date_string(),
                    value.time_string()
                );
            }
        }
    }

    /// Check the module configuration after the start-up delay, then serve events
    pub async fn run(self, token: CancellationToken) {
        tokio::select! {
            _ = token.cancelled() => return,
            _ = tokio::time::sleep(CONFIG_CHECK_DELAY) => {},
        }
        self.ctx.zb_events.set(ZbEvents::CONFIG_CHECK);
        loop {
            let events = tokio::select! {
                _ = token.cancelled() => break,
                events = self.ctx.zb_events.wait(ZbEvents::all()) => events,
            };
            self.handle(events).await;
        }
        info!("ZigBee control stopped");
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::core::time::DateTime;
    use crate::protocols::zigbee::link::tests::joined_link;
    use crate::protocols::zigbee::module::tests::config_answer;
    use crate::protocols::zigbee::packet::tests::{inbound, ID};
    use tokio::io::AsyncReadExt;

    async fn write_log(ctx: &DeviceContext, days: &[u8]) {
        for day in days {
            let mut record = LogRecord::from_snapshot(
                &ctx.snapshot(),
                DateTime::new(*day, 5, 2024, 23, 59, 59).unwrap(),
                EventKind::Data,
            );
            record.counts[0] = u32::from(*day);
            ctx.fram.append_log(&record).await.unwrap();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_replay_stops_at_missing_ack() {
        let (ctx, _sim, link, module) = joined_link().await;
        write_log(&ctx, &[1, 2, 3]).await;
        link.receive(&inbound(PacketType::ReqData, ID, &[3])).await;
        assert!(ctx.zb_events.peek().contains(ZbEvents::SEND_WLOG));

        // coordinator acknowledges only the first record
        let (mut rd, _wr) = tokio::io::split(module);
        let coordinator = {
            let link = link.clone();
            tokio::spawn(async move {
                let mut frames = Vec::new();
                for _ in 0..2 {
                    let mut head = [0u8; 2];
                    rd.read_exact(&mut head).await.unwrap();
                    let mut rest = vec![0u8; usize::from(head[1])];
                    rd.read_exact(&mut rest).await.unwrap();
                    frames.push(rest);
                    if frames.len() == 1 {
                        link.receive(&inbound(PacketType::Ack, ID, &[])).await;
                    }
                }
                frames
            })
        };

        let controller = ZbController::new(ctx.clone(), link.clone());
        assert_eq!(controller.replay_log().await, 1);
        let frames = coordinator.await.unwrap();
        // envelope header then payload: newest record first
        assert_eq!(frames[0][4], PacketType::WaterLog as u8);
        assert!(link.next_replay().is_none());
        assert_eq!(ctx.zb_stats.error_count(ZbError::Timeout), 1);
        assert_eq!(ctx.zb_stats.send_total(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_replay_sends_every_acknowledged_record() {
        let (ctx, _sim, link, module) = joined_link().await;
        write_log(&ctx, &[1, 2, 3]).await;
        link.receive(&inbound(PacketType::ReqData, ID, &[2])).await;

        let (mut rd, _wr) = tokio::io::split(module);
        let coordinator = {
            let link = link.clone();
            tokio::spawn(async move {
                loop {
                    let mut head = [0u8; 2];
                    if rd.read_exact(&mut head).await.is_err() {
                        break;
                    }
                    let mut rest = vec![0u8; usize::from(head[1])];
                    rd.read_exact(&mut rest).await.unwrap();
                    link.receive(&inbound(PacketType::Ack, ID, &[])).await;
                }
            })
        };

        let controller = ZbController::new(ctx.clone(), link.clone());
        assert_eq!(controller.replay_log().await, 2);
        assert_eq!(ctx.zb_stats.send_total(), 2);
        assert_eq!(ctx.zb_stats.error_count(ZbError::Timeout), 0);
        coordinator.abort();
    }

    #[tokio::test]
    async fn test_sync_time_sets_clock() {
        let (ctx, _sim, link, _module) = joined_link().await;
        let value = DateTime::new(1, 1, 2025, 6, 30, 15).unwrap();
        let mut frame = vec![PacketType::SyncTime as u8];
        frame.extend_from_slice(&value.to_wire());
        crate::core::crc::append_crc(&mut frame);
        link.receive(&frame).await;

        let controller = ZbController::new(ctx.clone(), link.clone());
        let events = ctx.zb_events.try_take(ZbEvents::all()).unwrap();
        assert_eq!(events, ZbEvents::SYNC_DTIME);
        controller.handle(events).await;
        assert_eq!(ctx.now(), value);
    }

    #[tokio::test(start_paused = true)]
    async fn test_net_lost_retries_silent_module() {
        let (ctx, _sim, link, _module) = joined_link().await;
        let controller = ZbController::new(ctx.clone(), link);
        let started = tokio::time::Instant::now();
        controller.handle(ZbEvents::NET_LOST).await;
        assert_eq!(ctx.zb_stats.error_count(ZbError::Timeout), NET_READ_ATTEMPTS);
        // answer timeouts plus the backoff between attempts
        let backoff = Duration::from_millis(ZbError::Timeout.retry_delay_ms());
        assert!(started.elapsed() >= backoff * (NET_READ_ATTEMPTS - 1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_net_restore_stops_retrying_on_answer() {
        let (ctx, _sim, link, module) = joined_link().await;
        let (mut rd, _wr) = tokio::io::split(module);
        let module_side = {
            let link = link.clone();
            tokio::spawn(async move {
                let mut cmd = [0u8; 4];
                // first read goes unanswered, the second one is answered
                rd.read_exact(&mut cmd).await.unwrap();
                rd.read_exact(&mut cmd).await.unwrap();
                assert_eq!(cmd, [0xFE, 0x01, 0xFE, 0xFF]);
                link.receive(&config_answer(ID.dev_addr, 0x0000)).await;
            })
        };
        let controller = ZbController::new(ctx.clone(), link);
        controller.handle(ZbEvents::NET_RESTORE).await;
        module_side.await.unwrap();
        assert_eq!(ctx.zb_stats.error_count(ZbError::Timeout), 1);
        assert!(ctx.zb_events.peek().contains(ZbEvents::SEND_STATE));
    }

    #[tokio::test]
    async fn test_state_refused_without_network() {
        let (ctx, _sim, link, _module) = joined_link().await;
        link.receive(&[0xFF, 0x00]).await;
        let controller = ZbController::new(ctx.clone(), link);
        controller.handle(ZbEvents::IM_HERE).await;
        assert_eq!(ctx.zb_stats.error_count(ZbError::Network), 1);
        assert_eq!(ctx.zb_stats.send_total(), 0);
    }
}
