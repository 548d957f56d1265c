//! Radio module command layer
//!
//! Fixed command codes, the system answers the module sends back on its own or
//! in reply, and the 44-byte module configuration.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use errors::{AquaErrorTrait, ErrorCategory};
use thiserror::Error;

use crate::config::device::NET_KEY_LEN;
use crate::config::Config;
use crate::protocols::stat_line;

/// Outcome of a radio exchange; `Ok(())` is counted at index 0
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ZbError {
    #[error("Error in command data")]
    Exec = 1,
    #[error("UART transmission error")]
    Send = 2,
    #[error("Module no running")]
    NotRunning = 3,
    #[error("No network")]
    Network = 4,
    #[error("Command undefined")]
    Command = 5,
    #[error("Timed out for response")]
    Timeout = 6,
    #[error("Data error")]
    Data = 7,
    #[error("No confirmation of receipt of data")]
    NoAck = 8,
    #[error("Checksum error")]
    Crc = 9,
    #[error("Device number error")]
    DevNumber = 10,
    #[error("Device address error")]
    DevAddress = 11,
}

impl ZbError {
    pub const ALL: [ZbError; 11] = [
        ZbError::Exec,
        ZbError::Send,
        ZbError::NotRunning,
        ZbError::Network,
        ZbError::Command,
        ZbError::Timeout,
        ZbError::Data,
        ZbError::NoAck,
        ZbError::Crc,
        ZbError::DevNumber,
        ZbError::DevAddress,
    ];

    pub fn index(self) -> usize {
        self as usize
    }
}

/// `OK` or the error description
pub fn result_text(result: &Result<(), ZbError>) -> String {
    match result {
        Ok(()) => "OK".to_string(),
        Err(e) => e.to_string(),
    }
}

/// Packet totals and one counter per outcome
#[derive(Debug, Default)]
pub struct ZbStats {
    recv_total: AtomicU32,
    send_total: AtomicU32,
    outcomes: [AtomicU32; 12],
}

impl ZbStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn recv_total(&self) -> u32 {
        self.recv_total.load(Ordering::Relaxed)
    }

    pub fn send_total(&self) -> u32 {
        self.send_total.load(Ordering::Relaxed)
    }

    pub fn error_count(&self, err: ZbError) -> u32 {
        self.outcomes[err.index()].load(Ordering::Relaxed)
    }

    pub(crate) fn count_received(&self) {
        self.recv_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn count_sent(&self) {
        self.send_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record(&self, outcome: Result<(), ZbError>) {
        let index = outcome.err().map_or(0, ZbError::index);
        self.outcomes[index].fetch_add(1, Ordering::Relaxed);
    }

    pub fn lines(&self) -> Vec<String> {
        let mut lines = vec![
            stat_line("Total packages recv", self.recv_total()),
            stat_line("Total packages send", self.send_total()),
        ];
        lines.extend(
            ZbError::ALL
                .iter()
                .map(|e| stat_line(&e.to_string(), self.error_count(*e))),
        );
        lines
    }
}

/// Commands understood by the module; the hard reset goes through the reset line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleCommand {
    ReadConfig,
    SaveConfig,
    DevInit,
    Factory,
    NetRestart,
    Reset,
}

impl ModuleCommand {
    /// Command bytes; `SaveConfig` carries the configuration between byte 2 and the terminator
    pub fn code(self) -> Option<[u8; 4]> {
        match self {
            ModuleCommand::ReadConfig => Some([0xFE, 0x01, 0xFE, 0xFF]),
            ModuleCommand::SaveConfig => Some([0xFD, 0x2E, 0xFE, 0xFF]),
            ModuleCommand::DevInit => Some([0xFD, 0x01, 0x12, 0xFF]),
            ModuleCommand::Factory => Some([0xFD, 0x01, 0x13, 0xFF]),
            ModuleCommand::NetRestart => Some([0xFD, 0x01, 0x14, 0xFF]),
            ModuleCommand::Reset => None,
        }
    }

    pub fn answer_timeout(self) -> Duration {
        match self {
            ModuleCommand::SaveConfig => Duration::from_millis(200),
            _ => Duration::from_millis(100),
        }
    }

    /// Whether `answer` completes this command
    pub fn is_answered_by(self, answer: &SystemAnswer) -> bool {
        matches!(
            (self, answer),
            (ModuleCommand::ReadConfig, SystemAnswer::ConfigRead(_))
                | (ModuleCommand::SaveConfig, SystemAnswer::ConfigSaved)
                | (ModuleCommand::DevInit, SystemAnswer::Restarted)
                | (ModuleCommand::Factory, SystemAnswer::FactoryReset)
                | (ModuleCommand::NetRestart, SystemAnswer::NetRestarted)
        )
    }

    /// Console parameter of the `zb` verb
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "cfg" => Some(ModuleCommand::ReadConfig),
            "save" => Some(ModuleCommand::SaveConfig),
            "init" => Some(ModuleCommand::DevInit),
            "factory" => Some(ModuleCommand::Factory),
            "net" => Some(ModuleCommand::NetRestart),
            "res" => Some(ModuleCommand::Reset),
            _ => None,
        }
    }
}

/// Header of the configuration read answer
pub const CONFIG_ANSWER_HEAD: u8 = 0xFB;

/// Answers the module sends without a packet type
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SystemAnswer {
    Error,
    /// The coordinator asked for information while building the network
    NetBuilt,
    Joined,
    NoNetwork,
    ConfigSaved,
    Restarted,
    FactoryReset,
    NetRestarted,
    ConfigRead(ModuleConfig),
}

const ANSWERS: [([u8; 2], SystemAnswer); 8] = [
    ([0xF7, 0xFF], SystemAnswer::Error),
    ([0xFF, 0xFF], SystemAnswer::NetBuilt),
    ([0xFF, 0xAA], SystemAnswer::Joined),
    ([0xFF, 0x00], SystemAnswer::NoNetwork),
    ([0xFA, 0xFE], SystemAnswer::ConfigSaved),
    ([0xFA, 0x12], SystemAnswer::Restarted),
    ([0xFA, 0x13], SystemAnswer::FactoryReset),
    ([0xFA, 0x14], SystemAnswer::NetRestarted),
];

impl SystemAnswer {
    /// Recognize a system answer; anything else is an application packet
    pub fn classify(frame: &[u8]) -> Option<Self> {
        if let Some((_, answer)) = ANSWERS.iter().find(|(code, _)| frame == code.as_slice()) {
            return Some(answer.clone());
        }
        match frame.split_first() {
            Some((&CONFIG_ANSWER_HEAD, body)) if body.len() == MODULE_CONFIG_LEN => {
                ModuleConfig::decode(body).ok().map(SystemAnswer::ConfigRead)
            },
            _ => None,
        }
    }
}

pub const MODULE_CONFIG_LEN: usize = 44;

pub const DEV_TERMINAL: u8 = 2;
pub const NET_STATE_OK: u8 = 1;

const DEV_TYPES: [&str; 3] = ["Coordinator", "Router", "Terminal"];
const NET_STATES: [&str; 2] = ["No network", "Network exists"];
const TX_POWER: [&str; 5] = ["-3/16/20", "-1.5/17/22", "0/19/24", "2.5/20/26", "4.5/20/27"];

/// Module parameters; addresses are kept high byte first as the module sends them
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModuleConfig {
    pub dev_type: u8,
    pub net_state: u8,
    pub pan_id: [u8; 2],
    pub key: [u8; NET_KEY_LEN],
    pub short_addr: [u8; 2],
    pub mac: [u8; 8],
    pub coord_short: [u8; 2],
    pub coord_mac: [u8; 8],
    pub group: u8,
    pub channel: u8,
    pub tx_power: u8,
    pub sleep: u8,
}

impl ModuleConfig {
    pub fn decode(data: &[u8]) -> Result<Self, ZbError> {
        if data.len() < MODULE_CONFIG_LEN {
            return Err(ZbError::Data);
        }
        let mut cfg = ModuleConfig {
            dev_type: data[0],
            net_state: data[1],
            pan_id: [data[2], data[3]],
            short_addr: [data[20], data[21]],
            coord_short: [data[30], data[31]],
            group: data[40],
            channel: data[41],
            tx_power: data[42],
            sleep: data[43],
            ..Default::default()
        };
        cfg.key.copy_from_slice(&data[4..20]);
        cfg.mac.copy_from_slice(&data[22..30]);
        cfg.coord_mac.copy_from_slice(&data[32..40]);
        Ok(cfg)
    }

    pub fn encode(&self) -> [u8; MODULE_CONFIG_LEN] {
        let mut out = [0u8; MODULE_CONFIG_LEN];
        out[0] = self.dev_type;
        out[1] = self.net_state;
        out[2..4].copy_from_slice(&self.pan_id);
        out[4..20].copy_from_slice(&self.key);
        out[20..22].copy_from_slice(&self.short_addr);
        out[22..30].copy_from_slice(&self.mac);
        out[30..32].copy_from_slice(&self.coord_short);
        out[32..40].copy_from_slice(&self.coord_mac);
        out[40] = self.group;
        out[41] = self.channel;
        out[42] = self.tx_power;
        out[43] = self.sleep;
        out
    }

    pub fn joined(&self) -> bool {
        self.net_state == NET_STATE_OK
    }

    /// Network address assigned at join
    pub fn short_address(&self) -> u16 {
        u16::from_be_bytes(self.short_addr)
    }

    /// Type, PAN id, group or key differ from the device configuration
    pub fn drifted(&self, config: &Config) -> bool {
        self.dev_type != DEV_TERMINAL
            || self.pan_id != config.net_pan_id().to_be_bytes()
            || self.group != config.net_group()
            || self.key != *config.net_key()
    }

    /// Parameters to write: the device settings, with the addresses cleared
    pub fn for_write(&self, config: &Config) -> Self {
        Self {
            dev_type: DEV_TERMINAL,
            pan_id: config.net_pan_id().to_be_bytes(),
            group: config.net_group(),
            key: *config.net_key(),
            short_addr: [0; 2],
            mac: [0; 8],
            coord_short: [0; 2],
            coord_mac: [0; 8],
            ..self.clone()
        }
    }

    /// Console report
    pub fn lines(&self) -> Vec<String> {
        let text = |table: &[&'static str], index: u8| {
            table.get(usize::from(index)).copied().unwrap_or("?")
        };
        let bytes = |data: &[u8]| {
            data.iter()
                .map(|b| format!("{:02X} ", b))
                .collect::<String>()
        };
        vec![
            format!("Device type ........................... {}", text(&DEV_TYPES, self.dev_type)),
            format!("Network state ......................... {}", text(&NET_STATES, self.net_state)),
            format!(
                "Network PAN_ID ........................ 0x{}",
                common::hex::encode_upper(&self.pan_id)
            ),
            format!(
                "Network key ........................... {}",
                common::hex::encode_upper(&self.key)
            ),
            format!(
                "Network short address ................. 0x{}",
                common::hex::encode_upper(&self.short_addr)
            ),
            format!("MAC address ........................... {}", bytes(&self.mac)),
            format!(
                "Network short address of father node .. 0x{}",
                common::hex::encode_upper(&self.coord_short)
            ),
            format!("MAC address of father node ............ {}", bytes(&self.coord_mac)),
            format!("Network group number .................. {}", self.group),
            format!("Communication channel ................. {}", self.channel),
            format!("TX power .............................. {} dbm", text(&TX_POWER, self.tx_power)),
            format!("Sleep state ........................... {}", self.sleep),
        ]
    }
}

/// `SaveConfig` frame: `FD 2E FE <config> FF`
pub fn save_config_frame(cfg: &ModuleConfig) -> Vec<u8> {
    let mut frame = vec![0xFD, 0x2E, 0xFE];
    frame.extend_from_slice(&cfg.encode());
    frame.push(0xFF);
    frame
}

impl AquaErrorTrait for ZbError {
    fn error_code(&self) -> &'static str {
        match self {
            ZbError::Exec => "ZB_EXEC",
            ZbError::Send => "ZB_SEND",
            ZbError::NotRunning => "ZB_NOT_RUNNING",
            ZbError::Network => "ZB_NETWORK",
            ZbError::Command => "ZB_COMMAND",
            ZbError::Timeout => "ZB_TIMEOUT",
            ZbError::Data => "ZB_DATA",
            ZbError::NoAck => "ZB_NO_ACK",
            ZbError::Crc => "ZB_CRC",
            ZbError::DevNumber => "ZB_DEV_NUMBER",
            ZbError::DevAddress => "ZB_DEV_ADDRESS",
        }
    }

    fn category(&self) -> ErrorCategory {
        match self {
            ZbError::Timeout | ZbError::NoAck => ErrorCategory::Timeout,
            ZbError::Send | ZbError::NotRunning | ZbError::Network => ErrorCategory::Connection,
            _ => ErrorCategory::Protocol,
        }
    }
}
