//! Serial link to the radio module
//!
//! The receive task cuts frames on the idle gap, tracks the network state from
//! the system answers, validates application packets and turns them into
//! events. Every outgoing command or packet holds the port for the whole
//! send-and-await cycle; answers reach the waiting sender through a reply
//! channel that is drained before each send.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::module::{save_config_frame, ModuleCommand, ModuleConfig, SystemAnswer, ZbError};
use super::packet::{envelope, Identity, Inbound, PacketType};
use super::ZbEvents;
use crate::core::context::DeviceContext;
use crate::core::framing::IdleFramer;
use crate::core::hal::{Led, LedMode, Valve};
use crate::core::time::DateTime;
use crate::storage::{SortEntry, SortIndex};

/// Receive buffer of the module UART
pub const RECV_BUFFER: usize = 80;
/// Reset line held low
pub const RESET_PULSE: Duration = Duration::from_millis(100);
/// Idle gap ending a frame from the module
pub const FRAME_GAP: Duration = Duration::from_millis(5);

const REPLY_DEPTH: usize = 8;

/// What the receive task saw, for a sender awaiting an answer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Answer(SystemAnswer),
    Packet(PacketType),
}

struct Port {
    writer: Box<dyn AsyncWrite + Send + Unpin>,
    replies: mpsc::Receiver<Reply>,
}

/// Radio module link shared by the receive task, the control task and the console
pub struct ZbLink {
    ctx: Arc<DeviceContext>,
    port: tokio::sync::Mutex<Port>,
    replies: mpsc::Sender<Reply>,
    module: RwLock<ModuleConfig>,
    replay: Mutex<VecDeque<SortEntry>>,
    sync_time: Mutex<Option<DateTime>>,
}

impl ZbLink {
    pub fn new<W>(ctx: Arc<DeviceContext>, writer: W) -> Arc<Self>
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (tx, rx) = mpsc::channel(REPLY_DEPTH);
        Arc::new(Self {
            ctx,
            port: tokio::sync::Mutex::new(Port {
                writer: Box::new(writer),
                replies: rx,
            }),
            replies: tx,
            module: RwLock::new(ModuleConfig::default()),
            replay: Mutex::new(VecDeque::new()),
            sync_time: Mutex::new(None),
        })
    }

    /// Last configuration read from the module
    pub fn module_config(&self) -> ModuleConfig {
        self.module.read().clone()
    }

    pub fn is_joined(&self) -> bool {
        self.module.read().joined()
    }

    pub fn identity(&self) -> Identity {
        Identity {
            dev_numb: self.ctx.config().dev_numb(),
            dev_addr: self.module.read().short_address(),
        }
    }

    fn flash_led(&self) {
        self.ctx.board.indicator.set_led(Led::Radio, LedMode::Flash);
    }

    /// Write a frame and, with `wait`, block for an accepted reply
    async fn exchange<F>(&self, frame: &[u8], wait: Option<(Duration, F)>) -> Result<(), ZbError>
    where
        F: Fn(&Reply) -> bool,
    {
        let mut port = self.port.lock().await;
        while port.replies.try_recv().is_ok() {}
        debug!("ZigBee send {}", common::hex::encode_upper(frame));
        self.flash_led();
        if let Err(e) = port.writer.write_all(frame).await {
            warn!("ZigBee write failed: {}", e);
            return Err(ZbError::Send);
        }
        if port.writer.flush().await.is_err() {
            return Err(ZbError::Send);
        }
        let Some((timeout, accept)) = wait else {
            return Ok(());
        };
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            match tokio::time::timeout_at(deadline, port.replies.recv()).await {
                Ok(Some(Reply::Answer(SystemAnswer::Error))) => return Err(ZbError::Exec),
                Ok(Some(reply)) if accept(&reply) => return Ok(()),
                Ok(Some(reply)) => debug!("ZigBee reply {:?} ignored", reply),
                Ok(None) => return Err(ZbError::Send),
                Err(_) => return Err(ZbError::Timeout),
            }
        }
    }

    async fn run_command(&self, command: ModuleCommand) -> Result<(), ZbError> {
        if command == ModuleCommand::Reset {
            let _port = self.port.lock().await;
            self.ctx.board.radio.set_reset(true);
            tokio::time::sleep(RESET_PULSE).await;
            self.ctx.board.radio.set_reset(false);
            info!("ZigBee module reset");
            return Ok(());
        }
        let frame = match command {
            ModuleCommand::SaveConfig => {
                let image = self.module_config().for_write(&self.ctx.config());
                save_config_frame(&image)
            },
            other => other.code().ok_or(ZbError::Command)?.to_vec(),
        };
        let accept = move |reply: &Reply| matches!(reply, Reply::Answer(a) if command.is_answered_by(a));
        self.exchange(&frame, Some((command.answer_timeout(), accept)))
            .await
    }

    /// Run a module command; refused while the module is not running
    pub async fn command(&self, command: ModuleCommand) -> Result<(), ZbError> {
        if !self.ctx.board.radio.is_running() {
            return Err(ZbError::NotRunning);
        }
        let result = self.run_command(command).await;
        if command != ModuleCommand::Reset {
            self.ctx.zb_stats.record(result);
        }
        debug!("ZigBee command {:?}: {:?}", command, result);
        result
    }

    /// Send an application packet to the coordinator; with `ack` the coordinator
    /// must acknowledge within that time
    pub async fn send_packet(&self, payload: &[u8], ack: Option<Duration>) -> Result<(), ZbError> {
        let result = self.transfer(payload, ack).await;
        self.ctx.zb_stats.record(result);
        result
    }

    async fn transfer(&self, payload: &[u8], ack: Option<Duration>) -> Result<(), ZbError> {
        let frame = envelope(self.module.read().coord_short, payload)?;
        if !self.ctx.board.radio.is_running() {
            return Err(ZbError::NotRunning);
        }
        if !self.is_joined() {
            return Err(ZbError::Network);
        }
        self.ctx.zb_stats.count_sent();
        let accept = |reply: &Reply| *reply == Reply::Packet(PacketType::Ack);
        self.exchange(&frame, ack.map(|timeout| (timeout, accept)))
            .await
    }

    fn forward(&self, reply: Reply) {
        if self.replies.try_send(reply).is_err() {
            debug!("ZigBee reply dropped, nobody waiting");
        }
    }

    fn update_network(&self, joined: bool) {
        let mut module = self.module.write();
        if module.joined() != joined {
            self.ctx.zb_events.set(if joined {
                ZbEvents::NET_RESTORE
            } else {
                ZbEvents::NET_LOST
            });
        }
        module.net_state = u8::from(joined);
    }

    /// Handle one frame from the module
    pub async fn receive(&self, frame: &[u8]) {
        self.flash_led();
        debug!("ZigBee recv {}", common::hex::encode_upper(frame));
        if let Some(answer) = SystemAnswer::classify(frame) {
            match &answer {
                SystemAnswer::Joined | SystemAnswer::NetBuilt => self.update_network(true),
                SystemAnswer::NoNetwork => self.update_network(false),
                SystemAnswer::ConfigRead(cfg) => *self.module.write() = cfg.clone(),
                _ => {},
            }
            self.forward(Reply::Answer(answer));
            return;
        }

        self.ctx.zb_stats.count_received();
        match Inbound::parse(frame, self.identity()) {
            Ok(packet) => {
                self.dispatch(packet).await;
                if let Some(ty) = frame.first().copied().and_then(PacketType::from_u8) {
                    self.forward(Reply::Packet(ty));
                }
            },
            Err(e) => {
                debug!("ZigBee packet rejected: {}", e);
                self.ctx.zb_stats.record(Err(e));
            },
        }
    }

    async fn dispatch(&self, packet: Inbound) {
        match packet {
            Inbound::SyncTime(value) => {
                *self.sync_time.lock() = Some(value);
                self.ctx.zb_events.set(ZbEvents::SYNC_DTIME);
            },
            Inbound::RequestState => self.ctx.zb_events.set(ZbEvents::SEND_STATE),
            Inbound::RequestValve => self.ctx.zb_events.set(ZbEvents::SEND_VALVE),
            Inbound::RequestData { count: 0 } => self.ctx.zb_events.set(ZbEvents::SEND_DATA),
            Inbound::RequestData { count } => self.prepare_replay(count).await,
            Inbound::ValveControl { cold, hot } => {
                let events = cold.events(Valve::Cold) | hot.events(Valve::Hot);
                if !events.is_empty() {
                    info!(
                        "Valve control COLD = {} HOT = {}",
                        cold.description(),
                        hot.description()
                    );
                    self.ctx.valve_request(events);
                }
            },
            Inbound::Ack => {},
        }
    }

    /// Queue the newest `count` log records for replay
    async fn prepare_replay(&self, count: u8) {
        let index = SortIndex::build(&self.ctx.fram).await;
        if index.is_empty() {
            info!("Records not found.");
            return;
        }
        let count = usize::from(count);
        if count > index.len() {
            warn!(
                "Log replay of {} records refused, {} available",
                count,
                index.len()
            );
            return;
        }
        info!("Records uploaded: {}", index.len());
        let mut replay = self.replay.lock();
        replay.clear();
        replay.extend(index.newest(count).iter().cloned());
        drop(replay);
        self.ctx.zb_events.set(ZbEvents::SEND_WLOG);
    }

    pub fn next_replay(&self) -> Option<SortEntry> {
        self.replay.lock().pop_front()
    }

    pub fn clear_replay(&self) {
        self.replay.lock().clear();
    }

    /// Time received from the coordinator, once
    pub fn take_sync_time(&self) -> Option<DateTime> {
        self.sync_time.lock().take()
    }

    /// Receive frames until the stream closes or the token is cancelled
    pub async fn run_receiver<R>(self: Arc<Self>, mut reader: R, token: CancellationToken)
    where
        R: AsyncRead + Unpin,
    {
        let mut framer = IdleFramer::new(RECV_BUFFER, FRAME_GAP);
        loop {
            let frame = tokio::select! {
                _ = token.cancelled() => break,
                frame = framer.next_frame(&mut reader) => frame,
            };
            match frame {
                Some(frame) => self.receive(&frame).await,
                None => {
                    debug!("ZigBee line closed");
                    break;
                },
            }
        }
        info!("ZigBee receiver stopped");
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
pub(crate) mod tests {
    use super::*;
    use crate::core::context::tests::sim_context;
    use crate::core::sim::SimBoard;
    use crate::device::flags::ValveEvents;
    use crate::protocols::zigbee::module::tests::config_answer;
    use crate::protocols::zigbee::packet::tests::{inbound, ID};
    use tokio::io::{AsyncReadExt, DuplexStream};

    /// Joined link at address 0x1234; the returned stream is the module side
    pub(crate) async fn joined_link() -> (Arc<DeviceContext>, Arc<SimBoard>, Arc<ZbLink>, DuplexStream) {
        let (ctx, sim, _adc) = sim_context().await;
        sim.set_radio_running(true);
        let (module, device) = tokio::io::duplex(1024);
        let link = ZbLink::new(ctx.clone(), device);
        link.receive(&config_answer(ID.dev_addr, 0x0000)).await;
        (ctx, sim, link, module)
    }

    #[tokio::test]
    async fn test_network_edges_fire_once() {
        let (ctx, _sim, link, _module) = joined_link().await;
        link.receive(&[0xFF, 0x00]).await;
        assert_eq!(ctx.zb_events.try_take(ZbEvents::all()), Some(ZbEvents::NET_LOST));
        link.receive(&[0xFF, 0x00]).await;
        assert!(ctx.zb_events.peek().is_empty());
        link.receive(&[0xFF, 0xAA]).await;
        assert_eq!(ctx.zb_events.try_take(ZbEvents::all()), Some(ZbEvents::NET_RESTORE));
        assert!(link.is_joined());
    }

    #[tokio::test]
    async fn test_crc_error_counted_without_effect() {
        let (ctx, _sim, link, _module) = joined_link().await;
        let mut req = inbound(PacketType::ReqState, ID, &[0]);
        req[6] ^= 0xFF;
        link.receive(&req).await;
        assert_eq!(ctx.zb_stats.error_count(ZbError::Crc), 1);
        assert_eq!(ctx.zb_stats.recv_total(), 1);
        assert!(ctx.zb_events.peek().is_empty());
    }

    #[tokio::test]
    async fn test_requests_raise_events() {
        let (ctx, _sim, link, _module) = joined_link().await;
        link.receive(&inbound(PacketType::ReqState, ID, &[0])).await;
        link.receive(&inbound(PacketType::ReqData, ID, &[0])).await;
        assert_eq!(
            ctx.zb_events.peek(),
            ZbEvents::SEND_STATE | ZbEvents::SEND_DATA
        );

        link.receive(&inbound(PacketType::CtrlValve, ID, &[2, 0])).await;
        assert_eq!(ctx.valve_events.peek(), ValveEvents::COLD_OPN);
    }

    #[tokio::test]
    async fn test_replay_refused_beyond_log() {
        let (ctx, _sim, link, _module) = joined_link().await;
        link.receive(&inbound(PacketType::ReqData, ID, &[3])).await;
        assert!(ctx.zb_events.peek().is_empty());
        assert!(link.next_replay().is_none());
    }

    #[tokio::test]
    async fn test_command_awaits_answer() {
        let (ctx, _sim, link, module) = joined_link().await;
        let (mut rd, _wr) = tokio::io::split(module);
        let responder = {
            let link = link.clone();
            tokio::spawn(async move {
                let mut cmd = [0u8; 4];
                rd.read_exact(&mut cmd).await.unwrap();
                assert_eq!(cmd, [0xFD, 0x01, 0x14, 0xFF]);
                link.receive(&[0xFA, 0x14]).await;
            })
        };
        assert_eq!(link.command(ModuleCommand::NetRestart).await, Ok(()));
        responder.await.unwrap();
        assert_eq!(ctx.zb_stats.error_count(ZbError::Timeout), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_command_times_out() {
        let (ctx, _sim, link, _module) = joined_link().await;
        assert_eq!(
            link.command(ModuleCommand::ReadConfig).await,
            Err(ZbError::Timeout)
        );
        assert_eq!(ctx.zb_stats.error_count(ZbError::Timeout), 1);
    }

    #[tokio::test]
    async fn test_send_refused_when_down() {
        let (ctx, sim, link, _module) = joined_link().await;
        link.receive(&[0xFF, 0x00]).await;
        assert_eq!(link.send_packet(&[1, 2], None).await, Err(ZbError::Network));
        sim.set_radio_running(false);
        assert_eq!(link.send_packet(&[1, 2], None).await, Err(ZbError::NotRunning));
        assert_eq!(
            link.command(ModuleCommand::DevInit).await,
            Err(ZbError::NotRunning)
        );
        assert_eq!(ctx.zb_stats.send_total(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hard_reset_pulses_line() {
        let (ctx, sim, link, _module) = joined_link().await;
        link.command(ModuleCommand::Reset).await.unwrap();
        assert_eq!(sim.reset_pulses(), 1);
        assert!(ctx.board.radio.is_running());
    }
}
