//! Service runtime
//!
//! Opens the persistent images, builds the device context over the simulated
//! board and starts every controller task. The tasks share one cancellation
//! token; [`run`] returns after the token fires and the tasks have wound down.

use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{CanBackend, FileConfigStore, ServiceConfig};
use crate::console::Console;
use crate::core::context::{Board, DeviceContext};
use crate::core::hal::ResetSource;
use crate::core::sim::{spawn_valve_model, FileFram, SimAdc, SimBoard};
use crate::core::time::HostRtc;
use crate::device::keys::KeyScanner;
use crate::device::valve::ValveController;
use crate::device::water::{spawn_clock, spawn_pressure_ticker, WaterMonitor};
use crate::error::{AquaSrvError, ErrorExt, Result};
use crate::protocols::can::sim::SimCan;
use crate::protocols::can::CanExchange;
use crate::protocols::open_serial;
use crate::protocols::zigbee::{ZbController, ZbLink};

/// Travel time of the simulated valve drives
const VALVE_TRAVEL: Duration = Duration::from_secs(3);
/// Time granted to the tasks after cancellation
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Named handles of the running tasks
#[derive(Default)]
pub struct TaskTable {
    tasks: Mutex<Vec<(&'static str, JoinHandle<()>)>>,
}

impl TaskTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn spawn<F>(&self, name: &'static str, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.push(name, tokio::spawn(task));
    }

    pub fn push(&self, name: &'static str, handle: JoinHandle<()>) {
        debug!("Task started: {}", name);
        self.tasks.lock().push((name, handle));
    }

    pub fn len(&self) -> usize {
        self.tasks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.lock().is_empty()
    }

    /// One status line per task
    pub fn lines(&self) -> Vec<String> {
        let tasks = self.tasks.lock();
        let mut lines = vec![format!("{:<16}{}", "Name", "State")];
        lines.extend(tasks.iter().map(|(name, handle)| {
            let state = if handle.is_finished() {
                "Finished"
            } else {
                "Running"
            };
            format!("{:<16}{}", name, state)
        }));
        lines
    }

    /// Wait for every task; stragglers are aborted after `grace`
    pub async fn join_all(&self, grace: Duration) {
        let tasks = std::mem::take(&mut *self.tasks.lock());
        futures::future::join_all(tasks.into_iter().map(|(name, mut handle)| async move {
            match tokio::time::timeout(grace, &mut handle).await {
                Ok(Ok(())) => debug!("Task stopped: {}", name),
                Ok(Err(e)) => error!("Task {} failed: {}", name, e),
                Err(_) => {
                    warn!("Task {} did not stop in time, aborting", name);
                    handle.abort();
                },
            }
        }))
        .await;
    }
}

fn ensure_parent(path: &Path) -> Result<()> {
    match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => std::fs::create_dir_all(dir)
            .io_error(&format!("create {}", dir.display())),
        _ => Ok(()),
    }
}

/// Run the controller until `token` is cancelled
pub async fn run(config: ServiceConfig, token: CancellationToken) -> Result<()> {
    if !config.service.simulate {
        return Err(AquaSrvError::config(
            "no hardware board backend available, set service.simulate",
        ));
    }

    let flash_path = Path::new(&config.storage.flash_path);
    let fram_path = Path::new(&config.storage.fram_path);
    ensure_parent(flash_path)?;
    ensure_parent(fram_path)?;

    let config_store = Arc::new(FileConfigStore::new(flash_path));
    let fram = Arc::new(FileFram::open(fram_path).io_error("open FRAM image")?);
    let sim = Arc::new(SimBoard::new());
    let board = Board::simulated(
        sim.clone(),
        Arc::new(HostRtc::new()),
        Arc::new(SimAdc::new([0, 0])),
    );
    let ctx = DeviceContext::open(
        config_store,
        fram,
        board,
        ResetSource::PowerOn,
        config.service.debug,
    )
    .await;
    info!(
        "Device configuration: {}, FRAM log next address 0x{:04X}",
        ctx.flash_status(),
        ctx.fram.totals().next_addr
    );

    let tasks = Arc::new(TaskTable::new());
    tasks.spawn("valve", ValveController::new(ctx.clone()).run(token.clone()));
    tasks.spawn("keys", KeyScanner::new(ctx.clone()).run(token.clone()));
    tasks.spawn("water", WaterMonitor::new(ctx.clone()).run(token.clone()));
    tasks.push("pressure", spawn_pressure_ticker(ctx.clone(), token.clone()));
    tasks.push("clock", spawn_clock(ctx.clone(), token.clone()));
    tasks.push(
        "valve-model",
        spawn_valve_model(sim.clone(), VALVE_TRAVEL, token.clone()),
    );

    if config.can.backend == CanBackend::Simulated {
        let exchange = CanExchange::new(ctx.clone(), Arc::new(SimCan::new()));
        exchange.configure().protocol_error("CAN configuration")?;
        for handle in exchange.spawn(token.clone()) {
            tasks.push("can", handle);
        }
    }

    if let Some(port) = config.serial.modbus_port.clone() {
        let ctx = ctx.clone();
        let token = token.clone();
        tasks.spawn("modbus", async move {
            if let Err(e) = crate::protocols::modbus::link::run_serial(ctx, &port, token).await {
                error!("MODBUS slave failed: {}", e);
            }
        });
    }

    let mut zigbee = None;
    if let Some(port) = &config.serial.zigbee_port {
        let stream = open_serial(port, config.serial.zigbee_baud)?;
        let (reader, writer) = tokio::io::split(stream);
        let link = ZbLink::new(ctx.clone(), writer);
        tasks.spawn("zb-recv", link.clone().run_receiver(reader, token.clone()));
        tasks.spawn(
            "zb-ctrl",
            ZbController::new(ctx.clone(), link.clone()).run(token.clone()),
        );
        zigbee = Some(link);
    }

    if config.serial.console {
        let mut console = Console::new(ctx.clone(), token.clone()).with_tasks(tasks.clone());
        if let Some(link) = zigbee {
            console = console.with_zigbee(link);
        }
        match &config.serial.console_port {
            Some(port) => {
                let stream = open_serial(port, ctx.config().debug_speed().baud())?;
                let (reader, writer) = tokio::io::split(stream);
                tasks.spawn("console", console.run(reader, writer, token.clone()));
            },
            None => {
                tasks.spawn(
                    "console",
                    console.run(tokio::io::stdin(), tokio::io::stdout(), token.clone()),
                );
            },
        }
    }

    info!("{} running with {} tasks", config.service.name, tasks.len());
    token.cancelled().await;
    info!("Shutting down");
    tasks.join_all(SHUTDOWN_GRACE).await;
    info!("{} stopped", config.service.name);
    Ok(())
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    fn headless(dir: &Path) -> ServiceConfig {
        let mut config = ServiceConfig::default();
        config.serial.console = false;
        config.can.backend = CanBackend::Simulated;
        config.storage.flash_path = dir.join("cfg/flash.bin").display().to_string();
        config.storage.fram_path = dir.join("fram/fram.bin").display().to_string();
        config
    }

    #[tokio::test]
    async fn test_task_table_lines_and_join() {
        let table = TaskTable::new();
        let token = CancellationToken::new();
        let waiter = token.clone();
        table.spawn("short", async {});
        table.spawn("long", async move { waiter.cancelled().await });
        tokio::task::yield_now().await;

        let lines = table.lines();
        assert_eq!(lines.len(), 3);
        assert!(lines[2].starts_with("long"));
        assert!(lines[2].ends_with("Running"));

        token.cancel();
        table.join_all(Duration::from_secs(1)).await;
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_run_without_simulation_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = headless(dir.path());
        config.service.simulate = false;
        let err = run(config, CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, AquaSrvError::ConfigError(_)));
    }

    #[tokio::test]
    async fn test_run_creates_images_and_stops() {
        let dir = tempfile::tempdir().unwrap();
        let config = headless(dir.path());
        let token = CancellationToken::new();
        let handle = tokio::spawn(run(config, token.clone()));
        tokio::time::sleep(Duration::from_millis(50)).await;
        token.cancel();
        handle.await.unwrap().unwrap();
        assert!(dir.path().join("fram/fram.bin").exists());
    }
}
