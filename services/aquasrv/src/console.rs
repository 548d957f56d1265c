//! Line console on the debug UART
//!
//! One command per line, verb first, parameters separated by blanks; verbs are
//! case-insensitive. Every command answers with a fixed-format text report.
//! `log`, `task`, `flash`, `level` and `reset` exist only when the service
//! runs with debug enabled.

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::device::NET_KEY_LEN;
use crate::config::{parse_hex_value, ConfigError};
use crate::core::context::DeviceContext;
use crate::core::hal::{LeakSensor, ResetSource, Valve};
use crate::core::time::{parse_date, parse_time};
use crate::device::flags::{ValveEvents, WaterEvents};
use crate::device::state::Meter;
use crate::protocols::zigbee::module::result_text;
use crate::protocols::zigbee::{ModuleCommand, ZbController, ZbError, ZbLink};
use crate::runtime::TaskTable;
use crate::storage::fram::{status_text, LOG_BASE};
use crate::storage::{CurrentTotals, EventKind, SortIndex};

pub const MSG_OK: &str = "OK";
pub const MSG_ERR_PARAM: &str = "Parameter error.";
pub const MSG_NO_COMMAND: &str = "Command not found.";
pub const MSG_SAVE: &str = "Saving parameters ... ";
pub const MSG_DELIM: &str = "------------------------------------------------------";
pub const PROMPT: &str = ">";

const HELP: &[(&str, bool)] = &[
    ("date [dd.mm.yy]                 - Display/set date.", false),
    ("time [hh:mm[:ss]]               - Display/set time.", false),
    ("dtime                           - Display date and time.", false),
    ("valve [cold/hot opn/cls]        - Status, valve drive control.", false),
    ("stat                            - Statistics.", false),
    ("fram [N][clr/chk/test]          - FRAM HEX dump, clear, testing.", false),
    ("log [1/2]                       - Simulate a leak sensor alarm.", true),
    ("task                            - List task statuses, time statistics.", true),
    ("flash                           - FLASH config HEX dump.", true),
    ("level [filter]                  - Display/set the service log filter.", true),
    ("zb [res/init/net/save/cfg/chk]  - ZigBee module control.", false),
    ("water [cold/hot/filter/log [N]] - Water flow status, setting initial values.", false),
    ("config                          - Display of configuration parameters.", false),
    ("config save                     - Save configuration settings.", false),
    ("config {cold/hot/filter} xxxxx  - Setting incremental values for water meters.", false),
    ("config uart xxxxx               - Setting the speed baud (600 - 115200).", false),
    ("config modbus speed xxxxx       - Setting the speed baud (600 - 115200).", false),
    (
        "config modbus id 0x01 - 0xF8    - Setting the device ID on the modbus (HEX format without 0x).",
        false,
    ),
    (
        "config can id 0xXXXXXXXX        - Setting the Device ID on the CAN Bus (HEX format without 0x).",
        false,
    ),
    (
        "config can addr xxxxx           - Setting the width of the CAN bus identifier (11/29 bits).",
        false,
    ),
    (
        "config can speed xxxxx          - Set the CAN bus speed 10,20,50,125,250,500 (kbit/s).",
        false,
    ),
    ("config pres_max xxxxx           - Set the maximum pressure for the sensor.", false),
    (
        "config pres_omin xxxxx          - Setting the minimum output voltage of the pressure sensor.",
        false,
    ),
    (
        "config pres_omax xxxxx          - Setting the maximum output voltage of the pressure sensor.",
        false,
    ),
    ("config panid 0x0000 - 0xFFFE    - Network PANID (HEX format without 0x).", false),
    ("config netgrp 1-99              - Network group number.", false),
    ("config netkey XXXX....          - Network key (HEX format without 0x).", false),
    (
        "config devnumb 0x0001 - 0xFFFF  - Device number on the network (HEX format without 0x).",
        false,
    ),
    ("config gate 0x0000- 0xFFF8      - Gateway address (HEX format without 0x).", false),
    ("version                         - Displays the version number and date.", false),
    ("reset                           - Reset controller.", true),
    ("?                               - Help.", false),
];

type TotalsChange = Box<dyn FnOnce(&mut CurrentTotals) + Send>;

/// Totals as `m3.liters`
fn volume(liters: u32) -> String {
    format!("{}.{:03}", liters / 1000, liters % 1000)
}

/// Hundredths of bar as `x.yy`
fn pressure(hundredths: u16) -> String {
    format!("{}.{:02}", hundredths / 100, hundredths % 100)
}

fn alarm_text(ok: bool) -> &'static str {
    if ok {
        "OK"
    } else {
        "ALARM"
    }
}

fn valve_param(name: &str) -> Option<Valve> {
    match name.to_ascii_lowercase().as_str() {
        "cold" => Some(Valve::Cold),
        "hot" => Some(Valve::Hot),
        _ => None,
    }
}

fn meter_param(name: &str) -> Option<Meter> {
    match name.to_ascii_lowercase().as_str() {
        "cold" => Some(Meter::Cold),
        "hot" => Some(Meter::Hot),
        "filter" => Some(Meter::Filter),
        _ => None,
    }
}

/// Command interpreter
pub struct Console {
    ctx: Arc<DeviceContext>,
    zigbee: Option<Arc<ZbLink>>,
    tasks: Option<Arc<TaskTable>>,
    /// Cancelled by `reset`
    shutdown: CancellationToken,
}

impl Console {
    pub fn new(ctx: Arc<DeviceContext>, shutdown: CancellationToken) -> Self {
        Self {
            ctx,
            zigbee: None,
            tasks: None,
            shutdown,
        }
    }

    pub fn with_zigbee(mut self, link: Arc<ZbLink>) -> Self {
        self.zigbee = Some(link);
        self
    }

    pub fn with_tasks(mut self, tasks: Arc<TaskTable>) -> Self {
        self.tasks = Some(tasks);
        self
    }

    /// Execute one command line and return the report
    pub async fn execute(&self, line: &str) -> Vec<String> {
        let params: Vec<&str> = line.split_whitespace().collect();
        let Some(verb) = params.first() else {
            return Vec::new();
        };
        let debug = self.ctx.debug;
        debug!("Console command: {}", line.trim());
        match verb.to_ascii_lowercase().as_str() {
            "date" => self.cmd_date(&params),
            "time" => self.cmd_time(&params),
            "dtime" => vec![self.ctx.now().to_string()],
            "water" => self.cmd_water(&params).await,
            "valve" => self.cmd_valve(&params),
            "stat" => self.cmd_stat(),
            "fram" => self.cmd_fram(&params).await,
            "config" => self.cmd_config(&params),
            "zb" => self.cmd_zigbee(&params).await,
            "version" => self.cmd_version(),
            "log" if debug => self.cmd_log(&params),
            "task" if debug => self.cmd_task(),
            "flash" if debug => self.cmd_flash(),
            "level" if debug => self.cmd_level(&params),
            "reset" if debug => {
                warn!("Controller reset requested from the console");
                self.shutdown.cancel();
                vec![MSG_OK.to_string()]
            },
            "?" => HELP
                .iter()
                .filter(|(_, debug_only)| debug || !debug_only)
                .map(|(text, _)| text.to_string())
                .collect(),
            _ => vec![MSG_NO_COMMAND.to_string()],
        }
    }

    fn cmd_date(&self, params: &[&str]) -> Vec<String> {
        if let [_, value] = params {
            let now = self.ctx.now();
            match parse_date(value).and_then(|(d, m, y)| now.with_date(d, m, y)) {
                Ok(value) => self.ctx.set_time(value),
                Err(_) => return vec![MSG_ERR_PARAM.to_string()],
            }
        }
        vec![self.ctx.now().date_string()]
    }

    fn cmd_time(&self, params: &[&str]) -> Vec<String> {
        if let [_, value] = params {
            let now = self.ctx.now();
            match parse_time(value).and_then(|(h, m, s)| now.with_time(h, m, s)) {
                Ok(value) => self.ctx.set_time(value),
                Err(_) => return vec![MSG_ERR_PARAM.to_string()],
            }
        }
        vec![self.ctx.now().time_string()]
    }

    async fn cmd_water(&self, params: &[&str]) -> Vec<String> {
        let mut change: Option<TotalsChange> = None;
        match params {
            [_, what, value] if meter_param(what).is_some() => {
                let Ok(value) = value.parse::<u32>() else {
                    return vec![MSG_ERR_PARAM.to_string()];
                };
                if let Some(meter) = meter_param(what) {
                    change = Some(Box::new(move |t| t.set_count(meter, value)));
                }
            },
            [_, what] | [_, what, _] if what.eq_ignore_ascii_case("log") => {
                let count = params.get(2).and_then(|v| v.parse::<usize>().ok()).unwrap_or(0);
                return self.water_log(count).await;
            },
            [_, what, "0"] if what.eq_ignore_ascii_case("addr") => {
                change = Some(Box::new(|t| t.next_addr = LOG_BASE));
            },
            _ => {},
        }

        let mut lines = Vec::new();
        let status = match change {
            Some(f) => Some(self.ctx.fram.update_totals(f).await.map(|_| ())),
            None => None,
        };
        let totals = self.ctx.fram.totals();
        let leaks = self.ctx.leaks();
        lines.push(format!(
            "Cold water meter values: ...... {}",
            volume(totals.count(Meter::Cold))
        ));
        lines.push(format!(
            "Hot water meter values: ....... {}",
            volume(totals.count(Meter::Hot))
        ));
        lines.push(format!(
            "Drinking water meter values: .. {}",
            volume(totals.count(Meter::Filter))
        ));
        lines.push(format!(
            "Cold water pressure: .......... {} atm",
            pressure(self.ctx.state.pressure(Valve::Cold))
        ));
        lines.push(format!(
            "Hot water pressure: ........... {} atm",
            pressure(self.ctx.state.pressure(Valve::Hot))
        ));
        lines.push(format!(
            "Leakage sensor power check: ... {}",
            alarm_text(leaks.dc12_ok)
        ));
        for (n, wet) in [(1, leaks.leak1), (2, leaks.leak2)] {
            lines.push(format!(
                "Leak sensor status #{}: ........ {}",
                n,
                if wet { "WATER LEAK" } else { "OK" }
            ));
        }
        lines.push(format!(
            "Address of the next log entry:  0x{:04X}",
            totals.next_addr
        ));
        if let Some(status) = status {
            lines.push(status_text(&status));
        }
        lines
    }

    /// Newest `count` log records, all when 0
    async fn water_log(&self, count: usize) -> Vec<String> {
        let index = SortIndex::build(&self.ctx.fram).await;
        if index.is_empty() {
            return vec!["Records not found.".to_string()];
        }
        let mut lines = vec![format!("Records uploaded: {}", index.len()), String::new()];
        for (rank, entry) in index.newest(count).iter().enumerate() {
            let r = &entry.record;
            lines.push(format!(
                "{} #{:02} (0x{:04X}): {}",
                if r.kind == EventKind::Data { "Event" } else { "ALARM" },
                rank + 1,
                entry.addr,
                r.timestamp
            ));
            lines.push(MSG_DELIM.to_string());
            lines.push(format!(
                "Cold:  ........... {}  Pressure: ... {}",
                volume(r.count(Meter::Cold)),
                pressure(r.pressure[0])
            ));
            lines.push(format!(
                "Hot: ............. {}  Pressure: ... {}",
                volume(r.count(Meter::Hot)),
                pressure(r.pressure[1])
            ));
            lines.push(format!(
                "Filter: .......... {}",
                volume(r.count(Meter::Filter))
            ));
            lines.push(format!("Valve cold: ...... {} {}", r.cold.status, r.cold.error));
            lines.push(format!("Valve hot: ....... {} {}", r.hot.status, r.hot.error));
            lines.push(format!("DC12V: ........... {}", alarm_text(r.leaks.dc12_ok)));
            lines.push(format!("Leak sensor #1: .. {}", alarm_text(!r.leaks.leak1)));
            lines.push(format!("Leak sensor #2: .. {}", alarm_text(!r.leaks.leak2)));
            lines.push(String::new());
        }
        lines
    }

    fn cmd_valve(&self, params: &[&str]) -> Vec<String> {
        if let [_, which, action] = params {
            if let Some(valve) = valve_param(which) {
                match action.to_ascii_lowercase().as_str() {
                    "opn" => self.ctx.valve_request(ValveEvents::open(valve)),
                    "cls" => self.ctx.valve_request(ValveEvents::close(valve)),
                    _ => {},
                }
                return Vec::new();
            }
        }
        let cold = self.ctx.valve_snapshot(Valve::Cold);
        let hot = self.ctx.valve_snapshot(Valve::Hot);
        vec![
            format!("Cold water tap drive status: .. {}", cold.status),
            format!("Cold water valve error: ....... {}", cold.error),
            format!("Hot water tap drive status: ... {}", hot.status),
            format!("Hot water valve error: ........ {}", hot.error),
        ]
    }

    fn cmd_stat(&self) -> Vec<String> {
        let totals = self.ctx.fram.totals();
        let source = ResetSource::from_code(totals.reset_source).map_or("Unknown", |s| s.description());
        let mut lines = vec![
            format!("Source reset: {}", source),
            format!(
                "Date/time of activation: {}  {}",
                totals.power_on.date_string(),
                totals.power_on.time_string()
            ),
            String::new(),
            "Modbus statistics ...".to_string(),
            MSG_DELIM.to_string(),
        ];
        lines.extend(self.ctx.modbus_stats.lines());
        lines.extend([
            String::new(),
            "CAN statistics ...".to_string(),
            MSG_DELIM.to_string(),
        ]);
        lines.extend(self.ctx.can_stats.lines());
        lines.extend([
            String::new(),
            "ZigBee statistics ...".to_string(),
            MSG_DELIM.to_string(),
        ]);
        lines.extend(self.ctx.zb_stats.lines());
        lines
    }

    async fn cmd_fram(&self, params: &[&str]) -> Vec<String> {
        let fram = &self.ctx.fram;
        match params {
            [_, action] if action.eq_ignore_ascii_case("clr") => {
                vec![MSG_OK.to_string(), status_text(&fram.clear().await)]
            },
            [_, action] if action.eq_ignore_ascii_case("chk") => {
                let mut lines = fram.check().await;
                lines.push(MSG_OK.to_string());
                lines
            },
            [_, action] if action.eq_ignore_ascii_case("test") => {
                let mut lines = fram.self_test().await;
                lines.push(MSG_OK.to_string());
                lines
            },
            [_] | [_, _] => {
                let pages = params.get(1).map_or(Some(0), |v| v.parse::<u8>().ok());
                let Some(pages) = pages else {
                    return vec![MSG_ERR_PARAM.to_string()];
                };
                let mut lines = fram.hex_dump(pages).await;
                lines.push(MSG_OK.to_string());
                lines
            },
            _ => vec![MSG_ERR_PARAM.to_string()],
        }
    }

    /// Apply one `config` setter; `None` when the parameters name no setter
    fn apply_config(&self, params: &[&str]) -> Option<Result<(), ConfigError>> {
        let lower: Vec<String> = params.iter().map(|p| p.to_ascii_lowercase()).collect();
        let keys: Vec<&str> = lower.iter().map(String::as_str).collect();
        let number = |text: &str| {
            text.parse::<u32>()
                .map_err(|_| ConfigError::Range("number"))
        };
        let float = |text: &str| {
            text.parse::<f32>()
                .map_err(|_| ConfigError::Range("number"))
        };
        let result = match keys.as_slice() {
            [_, meter @ ("cold" | "hot" | "filter"), _] => {
                let meter = meter_param(meter)?;
                let value = params[2];
                self.ctx
                    .update_config(|c| c.set_increment(meter, number(value)?))
            },
            [_, "uart", _] => self
                .ctx
                .update_config(|c| c.set_debug_speed(number(params[2])?)),
            [_, "modbus", "speed", _] => self
                .ctx
                .update_config(|c| c.set_modbus_speed(number(params[3])?)),
            [_, "modbus", "id", _] => self.ctx.update_config(|c| {
                c.set_modbus_id(parse_hex_value(params[3], 1)? as u8)
            }),
            [_, "can", "id", _] => self
                .ctx
                .update_config(|c| c.set_can_id(parse_hex_value(params[3], 4)?)),
            [_, "can", "addr", _] => self
                .ctx
                .update_config(|c| c.set_can_addressing(number(params[3])?)),
            [_, "can", "speed", _] => self
                .ctx
                .update_config(|c| c.set_can_speed(number(params[3])?)),
            [_, "pres_max", _] => self
                .ctx
                .update_config(|c| c.set_pressure_max(float(params[2])?)),
            [_, "pres_omin", _] => self
                .ctx
                .update_config(|c| c.set_press_out_min(float(params[2])?)),
            [_, "pres_omax", _] => self
                .ctx
                .update_config(|c| c.set_press_out_max(float(params[2])?)),
            [_, "panid", _] => self.ctx.update_config(|c| {
                c.set_net_pan_id(parse_hex_value(params[2], 2)? as u16)
            }),
            [_, "netgrp", _] => self.ctx.update_config(|c| {
                let group = u8::try_from(number(params[2])?)
                    .map_err(|_| ConfigError::Range("net group"))?;
                c.set_net_group(group)
            }),
            [_, "netkey", _] => self.ctx.update_config(|c| {
                let key = common::hex::decode_exact::<NET_KEY_LEN>(params[2])?;
                c.set_net_key(key);
                Ok(())
            }),
            [_, "devnumb", _] => self.ctx.update_config(|c| {
                c.set_dev_numb(parse_hex_value(params[2], 2)? as u16)
            }),
            [_, "gate", _] => self.ctx.update_config(|c| {
                c.set_addr_gate(parse_hex_value(params[2], 2)? as u16)
            }),
            _ => return None,
        };
        Some(result)
    }

    fn save_lines(&self) -> Vec<String> {
        let result = self.ctx.save_config();
        vec![
            MSG_SAVE.to_string(),
            match result {
                Ok(()) => MSG_OK.to_string(),
                Err(e) => e.to_string(),
            },
        ]
    }

    fn cmd_config(&self, params: &[&str]) -> Vec<String> {
        if let [_, action] = params {
            if action.eq_ignore_ascii_case("save") {
                return self.save_lines();
            }
        }
        let mut tail = Vec::new();
        match self.apply_config(params) {
            Some(Ok(())) => tail = self.save_lines(),
            Some(Err(e)) => {
                info!("Console config rejected: {}", e);
                tail.push(MSG_ERR_PARAM.to_string());
            },
            None => {},
        }

        let c = self.ctx.config();
        let can_id = if c.can_addressing().bits() == 11 {
            format!("0x{:03X}", c.can_id())
        } else {
            format!("0x{:08X}", c.can_id())
        };
        let mut lines = vec![
            format!(
                "Reading parameters from flash memory: {}",
                self.ctx.flash_status()
            ),
            MSG_DELIM.to_string(),
            format!("UART speed: ......................... {}", c.debug_speed().baud()),
            format!(
                "Cold water meter increment: ......... {} liters/imp",
                c.increment(Meter::Cold)
            ),
            format!(
                "Hot water meter increment: .......... {} liters/imp",
                c.increment(Meter::Hot)
            ),
            format!(
                "Increment of drinking water meter: .. {} liters/imp",
                c.increment(Meter::Filter)
            ),
            "Maximum measured value of".to_string(),
            format!(" the pressure sensor: ............... {:.2} atm", c.pressure_max()),
            "Minimum voltage at".to_string(),
            format!(" the pressure sensor output: ........ {:.2}", c.press_out_min()),
            "Maximum voltage at".to_string(),
            format!(" the pressure sensor output: ........ {:.2}", c.press_out_max()),
            format!("CAN identifier: ..................... {}", can_id),
            format!(
                "CAN identifier bit length: .......... {}",
                c.can_addressing().bits()
            ),
            format!("CAN speed: .......................... {} kbit/s", c.can_speed().kbit()),
            format!("MODBUS device address: .............. 0x{:02X}", c.modbus_id()),
            format!("MODBUS speed: ....................... {}", c.modbus_speed().baud()),
            format!("Network PANID: ...................... 0x{:04X}", c.net_pan_id()),
            format!("Network group number: ............... {}", c.net_group()),
            format!(
                "Network key: ........................ {}",
                common::hex::encode_upper(c.net_key())
            ),
            format!("Device number on the network: ....... {:05}", c.dev_numb()),
            format!("Gateway address: .................... 0x{:04X}", c.addr_gate()),
        ];
        lines.extend(tail);
        lines
    }

    async fn cmd_zigbee(&self, params: &[&str]) -> Vec<String> {
        let [_, name] = params else {
            return vec![MSG_ERR_PARAM.to_string()];
        };
        let name = name.to_ascii_lowercase();
        let Some(link) = &self.zigbee else {
            return vec![result_text(&Err(ZbError::NotRunning))];
        };
        if name == "chk" {
            let controller = ZbController::new(self.ctx.clone(), link.clone());
            return vec![result_text(&controller.check_config().await)];
        }
        let Some(command) = ModuleCommand::from_name(&name) else {
            return vec![MSG_ERR_PARAM.to_string()];
        };
        let result = link.command(command).await;
        let mut lines = Vec::new();
        if command == ModuleCommand::ReadConfig && result.is_ok() {
            lines.extend(link.module_config().lines());
        }
        lines.push(result_text(&result));
        lines
    }

    fn cmd_version(&self) -> Vec<String> {
        vec![
            format!("FirmWare version: .... {}", env!("CARGO_PKG_VERSION")),
            format!("Package: ............. {}", env!("CARGO_PKG_NAME")),
        ]
    }

    fn cmd_log(&self, params: &[&str]) -> Vec<String> {
        match params.get(1).copied() {
            Some("1") => self.ctx.water_events.set(WaterEvents::leak(LeakSensor::One)),
            Some("2") => self.ctx.water_events.set(WaterEvents::leak(LeakSensor::Two)),
            _ => {},
        }
        Vec::new()
    }

    fn cmd_task(&self) -> Vec<String> {
        match &self.tasks {
            Some(tasks) => tasks.lines(),
            None => vec!["No tasks registered.".to_string()],
        }
    }

    fn cmd_flash(&self) -> Vec<String> {
        match self.ctx.flash_page() {
            Ok(page) => page
                .chunks(16)
                .enumerate()
                .map(|(row, data)| common::hex::dump_row((row * 16) as u16, data))
                .collect(),
            Err(e) => vec![e.to_string()],
        }
    }

    fn cmd_level(&self, params: &[&str]) -> Vec<String> {
        match params.get(1) {
            None => vec![common::logging::get_log_level()],
            Some(filter) => match common::logging::set_log_level(filter) {
                Ok(()) => vec![MSG_OK.to_string()],
                Err(e) => {
                    warn!("{}", e);
                    vec![MSG_ERR_PARAM.to_string()]
                },
            },
        }
    }

    /// Serve the console until end of input or cancellation
    pub async fn run<R, W>(self, reader: R, mut writer: W, token: CancellationToken)
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut lines = BufReader::new(reader).lines();
        loop {
            if writer.write_all(PROMPT.as_bytes()).await.is_err() {
                break;
            }
            let _ = writer.flush().await;
            let line = tokio::select! {
                _ = token.cancelled() => break,
                line = lines.next_line() => line,
            };
            let line = match line {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(e) => {
                    warn!("Console read failed: {}", e);
                    break;
                },
            };
            let mut output = String::new();
            for text in self.execute(&line).await {
                output.push_str(&text);
                output.push_str("\r\n");
            }
            if writer.write_all(output.as_bytes()).await.is_err() {
                break;
            }
        }
        info!("Console stopped");
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::core::context::tests::sim_context_with;
    use crate::core::time::DateTime;
    use crate::device::state::ValveStatus;
    use crate::storage::LogRecord;

    async fn console(debug: bool) -> (Console, Arc<DeviceContext>, Arc<crate::core::sim::SimBoard>) {
        let (ctx, sim, _adc) = sim_context_with(debug).await;
        (Console::new(ctx.clone(), CancellationToken::new()), ctx, sim)
    }

    #[tokio::test]
    async fn test_date_and_time_set() {
        let (console, ctx, _sim) = console(true).await;
        assert_eq!(console.execute("date 01.02.25").await, vec!["01.02.2025"]);
        assert_eq!(console.execute("TIME 08:30").await, vec!["08:30:00"]);
        assert_eq!(ctx.now(), DateTime::new(1, 2, 2025, 8, 30, 0).unwrap());
        assert_eq!(console.execute("date 31.02.25").await, vec![MSG_ERR_PARAM]);
    }

    #[tokio::test]
    async fn test_water_report_and_counter_set() {
        let (console, ctx, _sim) = console(true).await;
        let lines = console.execute("water hot 12345").await;
        assert_eq!(lines[1], "Hot water meter values: ....... 12.345");
        assert_eq!(lines.last().unwrap(), "OK");
        assert_eq!(ctx.fram.totals().count(Meter::Hot), 12_345);
        assert!(lines[8].ends_with("0x0020"));
    }

    #[tokio::test]
    async fn test_water_log_lists_newest_first() {
        let (console, ctx, _sim) = console(true).await;
        assert_eq!(console.execute("water log").await, vec!["Records not found."]);
        for day in [3, 4] {
            let record = LogRecord::from_snapshot(
                &ctx.snapshot(),
                DateTime::new(day, 6, 2024, 23, 59, 59).unwrap(),
                EventKind::Data,
            );
            ctx.fram.append_log(&record).await.unwrap();
        }
        let lines = console.execute("water log 1").await;
        assert_eq!(lines[0], "Records uploaded: 2");
        assert_eq!(lines[2], "Event #01 (0x0040): 04.06.2024 23:59:59");
        assert_eq!(lines.len(), 2 + 11);
    }

    #[tokio::test]
    async fn test_valve_commands_are_ungated() {
        let (console, ctx, sim) = console(true).await;
        sim.set_position(Valve::Cold, ValveStatus::Open);
        assert!(console.execute("valve cold opn").await.is_empty());
        assert_eq!(ctx.valve_events.peek(), ValveEvents::COLD_OPN);
        let lines = console.execute("valve").await;
        assert_eq!(lines[0], "Cold water tap drive status: .. OPEN");
        assert_eq!(lines[3], "Hot water valve error: ........ OK");
    }

    #[tokio::test]
    async fn test_config_setter_validates_and_saves() {
        let (console, ctx, _sim) = console(true).await;
        let lines = console.execute("config modbus id 11").await;
        assert_eq!(ctx.config().modbus_id(), 0x11);
        assert_eq!(lines.last().unwrap(), MSG_OK);

        let lines = console.execute("config modbus id F9").await;
        assert_eq!(lines.last().unwrap(), MSG_ERR_PARAM);
        assert_eq!(ctx.config().modbus_id(), 0x11);

        let lines = console.execute("config netgrp 100").await;
        assert_eq!(lines.last().unwrap(), MSG_ERR_PARAM);
        assert!(lines
            .iter()
            .any(|l| l == "MODBUS device address: .............. 0x11"));
    }

    #[tokio::test]
    async fn test_stat_sections() {
        let (console, _ctx, _sim) = console(true).await;
        let lines = console.execute("stat").await;
        assert_eq!(lines[0], "Source reset: Power on reset");
        assert!(lines.iter().any(|l| l == "ZigBee statistics ..."));
        assert!(lines.iter().any(|l| l.starts_with("Total packages recv")));
    }

    #[tokio::test]
    async fn test_debug_verbs_hidden() {
        let (console, _ctx, _sim) = console(false).await;
        assert_eq!(console.execute("reset").await, vec![MSG_NO_COMMAND]);
        assert!(!console.execute("?").await.iter().any(|l| l.starts_with("reset")));
        assert_eq!(console.execute("bogus").await, vec![MSG_NO_COMMAND]);
    }

    #[tokio::test]
    async fn test_level_without_logging_installed() {
        let (console, _ctx, _sim) = console(true).await;
        assert_eq!(console.execute("level").await, vec!["unknown"]);
        assert_eq!(console.execute("level debug").await, vec![MSG_ERR_PARAM]);
    }

    #[tokio::test]
    async fn test_reset_cancels_service() {
        let (console, _ctx, _sim) = console(true).await;
        let token = console.shutdown.clone();
        console.execute("reset").await;
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn test_zb_without_link() {
        let (console, _ctx, _sim) = console(true).await;
        assert_eq!(console.execute("zb").await, vec![MSG_ERR_PARAM]);
        assert_eq!(console.execute("zb cfg").await, vec!["Module no running"]);
    }

    #[tokio::test]
    async fn test_run_over_stream() {
        let (console, _ctx, _sim) = console(true).await;
        let (mut term, device) = tokio::io::duplex(4096);
        let (rd, wr) = tokio::io::split(device);
        let token = CancellationToken::new();
        let handle = tokio::spawn(console.run(rd, wr, token.clone()));
        term.write_all(b"dtime\r\n").await.unwrap();
        let mut buf = vec![0u8; 64];
        let mut seen = String::new();
        while !seen.contains("10.06.2024 12:00:00") {
            let n = tokio::io::AsyncReadExt::read(&mut term, &mut buf).await.unwrap();
            seen.push_str(&String::from_utf8_lossy(&buf[..n]));
        }
        token.cancel();
        handle.await.unwrap();
    }
}
