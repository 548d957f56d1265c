//! In-process CAN controller

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info};

use super::exchange::{CanError, CanEvent, CanPeripheral};
use super::frame::{BitTiming, CanFilter, CanFrame};

/// Loopback controller: injected frames pass the acceptance filter, sent
/// frames are recorded and complete at once
pub struct SimCan {
    events_tx: mpsc::UnboundedSender<CanEvent>,
    events_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<CanEvent>>,
    filter: Mutex<Option<CanFilter>>,
    sent: Mutex<Vec<CanFrame>>,
}

impl Default for SimCan {
    fn default() -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            events_tx,
            events_rx: tokio::sync::Mutex::new(events_rx),
            filter: Mutex::new(None),
            sent: Mutex::new(Vec::new()),
        }
    }
}

impl SimCan {
    pub fn new() -> Self {
        Self::default()
    }

    /// Frame from another node; returns false when the filter drops it
    pub fn inject(&self, frame: CanFrame) -> bool {
        let accepted = self.filter.lock().map_or(false, |f| f.accepts(&frame));
        if accepted {
            let _ = self.events_tx.send(CanEvent::Received(frame));
        } else {
            debug!("SimCan filtered {:?}", frame);
        }
        accepted
    }

    /// Raise a bus error with the given code bits
    pub fn inject_error(&self, code: u32) {
        let _ = self.events_tx.send(CanEvent::Error(code));
    }

    /// Frames transmitted so far
    pub fn sent(&self) -> Vec<CanFrame> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl CanPeripheral for SimCan {
    fn configure(&self, filter: CanFilter, timing: BitTiming) -> Result<(), CanError> {
        debug!("SimCan timing {:?}", timing);
        *self.filter.lock() = Some(filter);
        Ok(())
    }

    fn transmit(&self, frame: CanFrame) -> Result<(), CanError> {
        if self.filter.lock().is_none() {
            return Err(CanError::NotStarted);
        }
        info!("CAN tx {:?}", frame);
        self.sent.lock().push(frame);
        let _ = self.events_tx.send(CanEvent::TxComplete);
        Ok(())
    }

    async fn next_event(&self) -> Option<CanEvent> {
        self.events_rx.lock().await.recv().await
    }
}
