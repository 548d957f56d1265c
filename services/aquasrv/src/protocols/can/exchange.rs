//! CAN request handling and transmit scheduling
//!
//! Three tasks cooperate: the event pump moves peripheral events into the
//! receive queue and releases mailboxes, the receive task answers requests,
//! and the transmit task drains the shared send queue into free mailboxes.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::frame::{
    AnswerId, BitTiming, CanAddressing, CanCommand, CanFilter, CanFrame, CtrlCommand,
};
use super::payload::{CountPayload, LogQuery, ReadingSource};
use crate::core::context::DeviceContext;
use crate::core::hal::Valve;
use crate::core::time::DateTime;
use crate::device::flags::ValveEvents;
use crate::device::state::{DeviceSnapshot, Meter};
use crate::protocols::stat_line;
use crate::storage::{EventKind, SortIndex};

/// Hardware transmit mailboxes
pub const MAILBOXES: usize = 3;
/// Receive queue depth
pub const RECV_QUEUE_DEPTH: usize = 8;
/// Longest wait for a free mailbox
pub const MAILBOX_TIMEOUT: Duration = Duration::from_millis(1000);

/// Bus error causes; bit `n` of the peripheral error code maps to index `n + 1`
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CanError {
    #[error("Protocol Error Warning")]
    ProtocolWarning = 1,
    #[error("Error Passive")]
    ErrorPassive,
    #[error("Bus-off error")]
    BusOff,
    #[error("Stuff error")]
    Stuff,
    #[error("Form error")]
    Form,
    #[error("Acknowledgment error")]
    Ack,
    #[error("Bit recessive error")]
    BitRecessive,
    #[error("Bit dominant error")]
    BitDominant,
    #[error("CRC error")]
    Crc,
    #[error("Rx FIFO0 overrun error")]
    Fifo0Overrun,
    #[error("Rx FIFO1 overrun error")]
    Fifo1Overrun,
    #[error("TxMailbox 0 failure due to arbitration lost")]
    Mailbox0Arbitration,
    #[error("TxMailbox 0 failure due to transmit error")]
    Mailbox0Transmit,
    #[error("TxMailbox 1 failure due to arbitration lost")]
    Mailbox1Arbitration,
    #[error("TxMailbox 1 failure due to transmit error")]
    Mailbox1Transmit,
    #[error("TxMailbox 2 failure due to arbitration lost")]
    Mailbox2Arbitration,
    #[error("TxMailbox 2 failure due to transmit error")]
    Mailbox2Transmit,
    #[error("Timeout error")]
    Timeout,
    #[error("Peripheral not initialized")]
    NotInitialized,
    #[error("Peripheral not ready")]
    NotReady,
    #[error("Peripheral not started")]
    NotStarted,
    #[error("Parameter error")]
    Parameter,
}

impl CanError {
    pub const ALL: [CanError; 22] = [
        CanError::ProtocolWarning,
        CanError::ErrorPassive,
        CanError::BusOff,
        CanError::Stuff,
        CanError::Form,
        CanError::Ack,
        CanError::BitRecessive,
        CanError::BitDominant,
        CanError::Crc,
        CanError::Fifo0Overrun,
        CanError::Fifo1Overrun,
        CanError::Mailbox0Arbitration,
        CanError::Mailbox0Transmit,
        CanError::Mailbox1Arbitration,
        CanError::Mailbox1Transmit,
        CanError::Mailbox2Arbitration,
        CanError::Mailbox2Transmit,
        CanError::Timeout,
        CanError::NotInitialized,
        CanError::NotReady,
        CanError::NotStarted,
        CanError::Parameter,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    /// Peripheral error code bit of this cause
    pub fn code_bit(self) -> u32 {
        1 << (self.index() - 1)
    }

    /// Causes flagged in a peripheral error code
    pub fn decode(code: u32) -> Vec<CanError> {
        Self::ALL
            .iter()
            .copied()
            .filter(|e| code & e.code_bit() != 0)
            .collect()
    }
}

/// Event reported by the peripheral
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CanEvent {
    Received(CanFrame),
    /// A mailbox finished transmitting
    TxComplete,
    /// Error code bit set, see [`CanError::decode`]
    Error(u32),
}

/// CAN controller
#[async_trait]
pub trait CanPeripheral: Send + Sync {
    /// Program acceptance filter and bit timing, then start the controller
    fn configure(&self, filter: CanFilter, timing: BitTiming) -> Result<(), CanError>;

    /// Place a frame into a free mailbox
    fn transmit(&self, frame: CanFrame) -> Result<(), CanError>;

    /// Next peripheral event; `None` once the peripheral is gone
    async fn next_event(&self) -> Option<CanEvent>;
}

/// Queued answer; the device identifier is applied when it is sent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanMessage {
    pub msg_id: u32,
    pub data: Vec<u8>,
}

impl CanMessage {
    pub fn new(msg_id: u32, payload: &[u8]) -> Self {
        Self {
            msg_id,
            data: payload.iter().take(8).copied().collect(),
        }
    }

    pub fn answer(id: AnswerId, payload: &[u8]) -> Self {
        Self::new(id as u32, payload)
    }
}

/// Frame totals and per-cause error counters
#[derive(Debug, Default)]
pub struct CanStats {
    recv_total: AtomicU32,
    send_total: AtomicU32,
    errors: [AtomicU32; 23],
}

impl CanStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn recv_total(&self) -> u32 {
        self.recv_total.load(Ordering::Relaxed)
    }

    pub fn send_total(&self) -> u32 {
        self.send_total.load(Ordering::Relaxed)
    }

    pub fn error_count(&self, err: CanError) -> u32 {
        self.errors[err.index()].load(Ordering::Relaxed)
    }

    fn count_received(&self) {
        self.recv_total.fetch_add(1, Ordering::Relaxed);
    }

    fn count_sent(&self) {
        self.send_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn count_error(&self, err: CanError) {
        self.errors[err.index()].fetch_add(1, Ordering::Relaxed);
    }

    /// Count every cause flagged in `code`
    pub fn record_error_code(&self, code: u32) {
        for err in CanError::decode(code) {
            self.count_error(err);
        }
    }

    /// Console statistics block
    pub fn lines(&self) -> Vec<String> {
        let mut lines = vec![
            stat_line("Total packages recv", self.recv_total()),
            stat_line("Total packages send", self.send_total()),
        ];
        lines.extend(
            CanError::ALL
                .iter()
                .map(|e| stat_line(&e.to_string(), self.error_count(*e))),
        );
        lines
    }
}

/// Build the transmitted frame for the configured identifier
pub fn answer_frame(can_id: u32, addressing: CanAddressing, message: &CanMessage) -> CanFrame {
    CanFrame::data(
        (can_id | message.msg_id) & addressing.max_id(),
        addressing == CanAddressing::Extended,
        &message.data,
    )
}

fn meter_answers(snapshot: &DeviceSnapshot, source: ReadingSource) -> Vec<CanMessage> {
    [
        (AnswerId::Cold, Meter::Cold),
        (AnswerId::Hot, Meter::Hot),
        (AnswerId::Filter, Meter::Filter),
    ]
    .iter()
    .map(|(id, meter)| {
        CanMessage::answer(*id, &CountPayload::new(snapshot, *meter, source).encode())
    })
    .collect()
}

/// CAN side of the controller
pub struct CanExchange {
    ctx: Arc<DeviceContext>,
    peripheral: Arc<dyn CanPeripheral>,
    mailboxes: Arc<Semaphore>,
}

impl CanExchange {
    pub fn new(ctx: Arc<DeviceContext>, peripheral: Arc<dyn CanPeripheral>) -> Self {
        Self {
            ctx,
            peripheral,
            mailboxes: Arc::new(Semaphore::new(MAILBOXES)),
        }
    }

    /// Apply filter and timing from the device configuration
    pub fn configure(&self) -> Result<(), CanError> {
        let config = self.ctx.config();
        let filter = CanFilter::for_device(config.can_id(), config.can_addressing());
        let timing = config.can_speed().timing();
        self.peripheral.configure(filter, timing)?;
        info!(
            "CAN started: id 0x{:X}, {} bit, {} kbit/s",
            config.can_id(),
            config.can_addressing().bits(),
            config.can_speed().kbit()
        );
        Ok(())
    }

    /// Answers for one received frame
    pub async fn handle_frame(&self, frame: &CanFrame) -> Vec<CanMessage> {
        let Some(command) = CanCommand::from_sub_id(frame.sub_id()) else {
            debug!("CAN sub-command {} ignored", frame.sub_id());
            return Vec::new();
        };
        match (frame.remote, command) {
            (false, CanCommand::Control) => {
                match frame.payload().first().and_then(|c| CtrlCommand::from_code(*c)) {
                    Some(cmd) => self.execute(cmd),
                    None => warn!("CAN control code {:?} rejected", frame.payload().first()),
                }
                Vec::new()
            },
            (false, CanCommand::DateTime) => {
                match DateTime::from_wire(frame.payload()) {
                    Ok(value) => self.ctx.set_time(value),
                    Err(e) => warn!("CAN date/time rejected: {}", e),
                }
                Vec::new()
            },
            (true, CanCommand::Control) => {
                let mut answers = vec![CanMessage::answer(
                    AnswerId::DateTime,
                    &self.ctx.now().to_wire(),
                )];
                answers.extend(meter_answers(&self.ctx.snapshot(), ReadingSource::Current));
                answers
            },
            (false, CanCommand::LogQuery) => self.log_query(frame.payload()).await,
            (true, _) => Vec::new(),
        }
    }

    async fn log_query(&self, payload: &[u8]) -> Vec<CanMessage> {
        let Some(date) = LogQuery::decode(payload).and_then(|q| q.date()) else {
            warn!("CAN log query malformed: {:02X?}", payload);
            return Vec::new();
        };
        let index = SortIndex::build_kind(&self.ctx.fram, EventKind::Data).await;
        match index.newest_on(&date) {
            Some(entry) => {
                debug!(
                    "CAN log query {}: record 0x{:04X}",
                    date.date_string(),
                    entry.addr
                );
                meter_answers(&entry.record.snapshot(), ReadingSource::Log)
            },
            None => {
                debug!("CAN log query {}: no record", date.date_string());
                Vec::new()
            },
        }
    }

    fn execute(&self, cmd: CtrlCommand) {
        info!("CAN valve command {:?}", cmd);
        let events = match cmd {
            CtrlCommand::CloseAll => {
                ValveEvents::close(Valve::Cold) | ValveEvents::close(Valve::Hot)
            },
            CtrlCommand::OpenAll => ValveEvents::open(Valve::Cold) | ValveEvents::open(Valve::Hot),
            CtrlCommand::ColdOpen => ValveEvents::open(Valve::Cold),
            CtrlCommand::ColdClose => ValveEvents::close(Valve::Cold),
            CtrlCommand::HotOpen => ValveEvents::open(Valve::Hot),
            CtrlCommand::HotClose => ValveEvents::close(Valve::Hot),
        };
        self.ctx.valve_request(events.gated());
    }

    fn release_mailbox(&self) {
        if self.mailboxes.available_permits() < MAILBOXES {
            self.mailboxes.add_permits(1);
        }
    }

    async fn send(&self, message: &CanMessage) {
        match tokio::time::timeout(MAILBOX_TIMEOUT, self.mailboxes.acquire()).await {
            Ok(Ok(permit)) => permit.forget(),
            Ok(Err(_)) => return,
            Err(_) => {
                warn!("CAN mailboxes busy, message 0x{:X} dropped", message.msg_id);
                self.ctx.can_stats.count_error(CanError::Timeout);
                return;
            },
        }
        let config = self.ctx.config();
        let frame = answer_frame(config.can_id(), config.can_addressing(), message);
        debug!("CAN send {:?}", frame);
        if let Err(e) = self.peripheral.transmit(frame) {
            error!("CAN transmit failed: {}", e);
            self.ctx.can_stats.count_error(e);
            self.release_mailbox();
        }
    }

    /// Start the pump, receive and transmit tasks
    pub fn spawn(self, token: CancellationToken) -> Vec<JoinHandle<()>> {
        let Some(mut send_rx) = self.ctx.can_queue.take_receiver() else {
            error!("CAN send queue already taken, exchange not started");
            return Vec::new();
        };
        let exchange = Arc::new(self);
        let (recv_tx, mut recv_rx) = mpsc::channel::<CanFrame>(RECV_QUEUE_DEPTH);

        let pump = {
            let exchange = Arc::clone(&exchange);
            let token = token.clone();
            tokio::spawn(async move {
                loop {
                    let event = tokio::select! {
                        _ = token.cancelled() => break,
                        event = exchange.peripheral.next_event() => event,
                    };
                    match event {
                        Some(CanEvent::Received(frame)) => {
                            exchange.ctx.can_stats.count_received();
                            if recv_tx.try_send(frame).is_err() {
                                warn!("CAN receive queue full, {:?} dropped", frame);
                            }
                        },
                        Some(CanEvent::TxComplete) => {
                            exchange.ctx.can_stats.count_sent();
                            exchange.release_mailbox();
                        },
                        Some(CanEvent::Error(code)) => {
                            if code != 0 {
                                warn!("CAN error code: 0x{:08X}", code);
                                exchange.ctx.can_stats.record_error_code(code);
                                exchange.release_mailbox();
                            }
                        },
                        None => {
                            info!("CAN peripheral closed");
                            break;
                        },
                    }
                }
            })
        };

        let recv = {
            let exchange = Arc::clone(&exchange);
            let token = token.clone();
            tokio::spawn(async move {
                loop {
                    let frame = tokio::select! {
                        _ = token.cancelled() => break,
                        frame = recv_rx.recv() => match frame {
                            Some(frame) => frame,
                            None => break,
                        },
                    };
                    debug!("CAN recv {:?}", frame);
                    for answer in exchange.handle_frame(&frame).await {
                        exchange.ctx.can_queue.push(answer);
                    }
                }
            })
        };

        let send = tokio::spawn(async move {
            loop {
                let message = tokio::select! {
                    _ = token.cancelled() => break,
                    message = send_rx.recv() => match message {
                        Some(message) => message,
                        None => break,
                    },
                };
                exchange.send(&message).await;
            }
        });

        vec![pump, recv, send]
    }
}
