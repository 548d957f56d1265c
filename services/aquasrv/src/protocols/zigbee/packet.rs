//! Application packets exchanged with the coordinator
//!
//! Every packet starts with its type byte and ends with a CRC over the bytes
//! before it. Packets from the coordinator carry the gateway address after the
//! CRC; it is not covered. Multi-byte fields are little-endian.

use tracing::debug;

use super::module::ZbError;
use crate::core::crc::{append_crc, crc16};
use crate::core::time::{DateTime, WIRE_LEN};
use crate::device::flags::ValveEvents;
use crate::core::hal::Valve;
use crate::storage::LogRecord;

/// Command byte of an application data transfer
pub const SEND_DATA: u8 = 0xFC;
/// On-demand transfer to the given short address
const MODE_ON_DEMAND: [u8; 2] = [0x03, 0x01];
/// Largest payload of one transfer
pub const MAX_PAYLOAD: usize = 76;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    State = 1,
    Data = 2,
    WaterLog = 3,
    Valve = 4,
    Leaks = 5,
    SyncTime = 6,
    ReqState = 7,
    ReqValve = 8,
    ReqData = 9,
    CtrlValve = 10,
    Ack = 11,
}

impl PacketType {
    pub fn from_u8(value: u8) -> Option<Self> {
        let ty = match value {
            1 => PacketType::State,
            2 => PacketType::Data,
            3 => PacketType::WaterLog,
            4 => PacketType::Valve,
            5 => PacketType::Leaks,
            6 => PacketType::SyncTime,
            7 => PacketType::ReqState,
            8 => PacketType::ReqValve,
            9 => PacketType::ReqData,
            10 => PacketType::CtrlValve,
            11 => PacketType::Ack,
            _ => return None,
        };
        Some(ty)
    }
}

/// Device number from the configuration and network address from the module
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Identity {
    pub dev_numb: u16,
    pub dev_addr: u16,
}

fn head(ty: PacketType, id: Identity) -> Vec<u8> {
    let mut buf = Vec::with_capacity(MAX_PAYLOAD);
    buf.push(ty as u8);
    buf.extend_from_slice(&id.dev_numb.to_le_bytes());
    buf.extend_from_slice(&id.dev_addr.to_le_bytes());
    buf
}

fn sealed(mut buf: Vec<u8>) -> Vec<u8> {
    append_crc(&mut buf);
    buf
}

/// Controller clock, power-on time and reset source
pub fn state_packet(id: Identity, now: &DateTime, power_on: &DateTime, reset_source: u8) -> Vec<u8> {
    let mut buf = head(PacketType::State, id);
    buf.extend_from_slice(&now.to_wire());
    buf.extend_from_slice(&power_on.to_wire());
    buf.push(reset_source);
    sealed(buf)
}

/// Meter totals, pressures, leak flags and valve state; `Data` for live values,
/// `WaterLog` for a replayed log record
pub fn data_packet(ty: PacketType, id: Identity, record: &LogRecord) -> Vec<u8> {
    let mut buf = head(ty, id);
    buf.extend_from_slice(&record.timestamp.to_wire());
    for count in record.counts {
        buf.extend_from_slice(&count.to_le_bytes());
    }
    for pressure in record.pressure {
        buf.extend_from_slice(&pressure.to_le_bytes());
    }
    buf.push(record.flags());
    buf.push(record.valve_byte());
    sealed(buf)
}

pub fn valve_packet(id: Identity, valve_byte: u8) -> Vec<u8> {
    let mut buf = head(PacketType::Valve, id);
    buf.push(valve_byte);
    sealed(buf)
}

pub fn leaks_packet(id: Identity, leak_flags: u8) -> Vec<u8> {
    let mut buf = head(PacketType::Leaks, id);
    buf.push(leak_flags);
    sealed(buf)
}

/// Module transfer frame: `FC, len + 4, mode, coordinator address, payload`
pub fn envelope(coord_short: [u8; 2], payload: &[u8]) -> Result<Vec<u8>, ZbError> {
    if payload.len() > MAX_PAYLOAD {
        return Err(ZbError::Data);
    }
    let mut frame = Vec::with_capacity(payload.len() + 6);
    frame.push(SEND_DATA);
    frame.push((payload.len() + MODE_ON_DEMAND.len() + coord_short.len()) as u8);
    frame.extend_from_slice(&MODE_ON_DEMAND);
    frame.extend_from_slice(&coord_short);
    frame.extend_from_slice(payload);
    Ok(frame)
}

/// Drive request of a valve control packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValveRequest {
    Keep,
    Close,
    Open,
}

impl ValveRequest {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => ValveRequest::Close,
            2 => ValveRequest::Open,
            _ => ValveRequest::Keep,
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            ValveRequest::Keep => "STOP",
            ValveRequest::Close => "CLOSE",
            ValveRequest::Open => "OPEN",
        }
    }

    pub fn events(self, valve: Valve) -> ValveEvents {
        match self {
            ValveRequest::Keep => ValveEvents::empty(),
            ValveRequest::Close => ValveEvents::close(valve),
            ValveRequest::Open => ValveEvents::open(valve),
        }
    }
}

/// Validated packet from the coordinator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Inbound {
    SyncTime(DateTime),
    RequestState,
    RequestValve,
    /// `count == 0` asks for live data, otherwise for that many log records
    RequestData { count: u8 },
    ValveControl { cold: ValveRequest, hot: ValveRequest },
    Ack,
}

/// Time sync: type, date/time, CRC
const SYNC_LEN: usize = 1 + WIRE_LEN + 2;
/// Requests: type, number, address, count, CRC, gateway
const REQUEST_LEN: usize = 10;
/// Valve control: type, number, address, cold, hot, CRC, gateway
const CONTROL_LEN: usize = 11;
/// Acknowledge: type, number, address, CRC, gateway
const ACK_LEN: usize = 9;
const GATEWAY_LEN: usize = 2;

fn check_crc(covered: &[u8], crc: &[u8]) -> Result<(), ZbError> {
    if crc16(covered) == u16::from_le_bytes([crc[0], crc[1]]) {
        Ok(())
    } else {
        Err(ZbError::Crc)
    }
}

/// Verify CRC, device number and network address of an addressed packet
fn check_addressed(frame: &[u8], id: Identity) -> Result<(), ZbError> {
    let crc_at = frame.len() - GATEWAY_LEN - 2;
    check_crc(&frame[..crc_at], &frame[crc_at..crc_at + 2])?;
    if u16::from_le_bytes([frame[1], frame[2]]) != id.dev_numb {
        return Err(ZbError::DevNumber);
    }
    if u16::from_le_bytes([frame[3], frame[4]]) != id.dev_addr {
        return Err(ZbError::DevAddress);
    }
    Ok(())
}

impl Inbound {
    /// Decode and validate a packet; unknown types and sizes are `Data` errors
    pub fn parse(frame: &[u8], id: Identity) -> Result<Self, ZbError> {
        let ty = frame
            .first()
            .copied()
            .and_then(PacketType::from_u8)
            .ok_or(ZbError::Data)?;
        let packet = match (ty, frame.len()) {
            (PacketType::SyncTime, SYNC_LEN) => {
                check_crc(&frame[..SYNC_LEN - 2], &frame[SYNC_LEN - 2..])?;
                let value = DateTime::from_wire(&frame[1..1 + WIRE_LEN]).map_err(|_| ZbError::Data)?;
                Inbound::SyncTime(value)
            },
            (PacketType::ReqState | PacketType::ReqValve | PacketType::ReqData, REQUEST_LEN) => {
                check_addressed(frame, id)?;
                match ty {
                    PacketType::ReqState => Inbound::RequestState,
                    PacketType::ReqValve => Inbound::RequestValve,
                    _ => Inbound::RequestData { count: frame[5] },
                }
            },
            (PacketType::CtrlValve, CONTROL_LEN) => {
                check_addressed(frame, id)?;
                Inbound::ValveControl {
                    cold: ValveRequest::from_u8(frame[5]),
                    hot: ValveRequest::from_u8(frame[6]),
                }
            },
            (PacketType::Ack, ACK_LEN) => {
                check_addressed(frame, id)?;
                Inbound::Ack
            },
            _ => return Err(ZbError::Data),
        };
        debug!("ZigBee packet {:?}", packet);
        Ok(packet)
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
pub(crate) mod tests {
    use super::*;
    use crate::core::crc::verify_trailing;
    use crate::device::state::{LeakState, ValveError, ValveSnapshot, ValveStatus};
    use crate::storage::EventKind;

    pub(crate) const ID: Identity = Identity {
        dev_numb: 1,
        dev_addr: 0x1234,
    };

    /// Coordinator packet: header, body, CRC and a gateway address
    pub(crate) fn inbound(ty: PacketType, id: Identity, body: &[u8]) -> Vec<u8> {
        let mut frame = head(ty, id);
        frame.extend_from_slice(body);
        append_crc(&mut frame);
        frame.extend_from_slice(&[0x00, 0x00]);
        frame
    }

    fn record() -> LogRecord {
        LogRecord {
            timestamp: DateTime::new(31, 12, 2024, 23, 59, 59).unwrap(),
            cold: ValveSnapshot {
                status: ValveStatus::Open,
                error: ValveError::Ok,
            },
            hot: ValveSnapshot {
                status: ValveStatus::Closed,
                error: ValveError::Timeout,
            },
            counts: [1000, 2000, 3000],
            pressure: [250, 310],
            leaks: LeakState {
                leak1: true,
                leak2: false,
                dc12_ok: true,
            },
            kind: EventKind::Alarm,
        }
    }

    #[test]
    fn test_outbound_layouts() {
        let now = DateTime::new(10, 6, 2024, 12, 0, 0).unwrap();
        let state = state_packet(ID, &now, &now, 3);
        assert_eq!(state.len(), 22);
        assert_eq!(&state[..5], &[1, 0x01, 0x00, 0x34, 0x12]);
        assert_eq!(state[19], 3);
        assert!(verify_trailing(&state));

        let rec = record();
        let data = data_packet(PacketType::WaterLog, ID, &rec);
        assert_eq!(data.len(), 32);
        assert_eq!(data[0], 3);
        assert_eq!(&data[12..16], &1000u32.to_le_bytes());
        assert_eq!(&data[24..26], &250u16.to_le_bytes());
        assert_eq!(data[28], rec.flags());
        assert_eq!(data[29], rec.valve_byte());
        assert!(verify_trailing(&data));

        let valve = valve_packet(ID, 0x5A);
        assert_eq!(valve.len(), 8);
        assert_eq!(valve[5], 0x5A);
        assert_eq!(leaks_packet(ID, 0x81)[5], 0x81);
    }

    #[test]
    fn test_envelope() {
        let frame = envelope([0x00, 0x00], &[1, 2, 3]).unwrap();
        assert_eq!(frame, vec![0xFC, 0x07, 0x03, 0x01, 0x00, 0x00, 1, 2, 3]);
        assert_eq!(envelope([0, 0], &[0; 77]), Err(ZbError::Data));
    }

    #[test]
    fn test_parse_requests() {
        let req = inbound(PacketType::ReqData, ID, &[5]);
        assert_eq!(Inbound::parse(&req, ID), Ok(Inbound::RequestData { count: 5 }));

        let ctrl = inbound(PacketType::CtrlValve, ID, &[2, 1]);
        assert_eq!(
            Inbound::parse(&ctrl, ID),
            Ok(Inbound::ValveControl {
                cold: ValveRequest::Open,
                hot: ValveRequest::Close
            })
        );
        assert_eq!(Inbound::parse(&inbound(PacketType::Ack, ID, &[]), ID), Ok(Inbound::Ack));
    }

    #[test]
    fn test_gateway_address_not_covered() {
        let mut req = inbound(PacketType::ReqState, ID, &[0]);
        req[8] = 0xBE;
        req[9] = 0xEF;
        assert_eq!(Inbound::parse(&req, ID), Ok(Inbound::RequestState));
    }

    #[test]
    fn test_parse_rejections() {
        let mut req = inbound(PacketType::ReqState, ID, &[0]);
        req[5] ^= 0x01;
        assert_eq!(Inbound::parse(&req, ID), Err(ZbError::Crc));

        let other = Identity {
            dev_numb: 2,
            dev_addr: ID.dev_addr,
        };
        let req = inbound(PacketType::ReqState, other, &[0]);
        assert_eq!(Inbound::parse(&req, ID), Err(ZbError::DevNumber));

        let other = Identity {
            dev_numb: ID.dev_numb,
            dev_addr: 0x9999,
        };
        let req = inbound(PacketType::ReqState, other, &[0]);
        assert_eq!(Inbound::parse(&req, ID), Err(ZbError::DevAddress));

        assert_eq!(Inbound::parse(&[0x42, 0, 0], ID), Err(ZbError::Data));
        assert_eq!(Inbound::parse(&[], ID), Err(ZbError::Data));
    }

    #[test]
    fn test_sync_time_packet() {
        let value = DateTime::new(1, 3, 2025, 6, 30, 15).unwrap();
        let mut frame = vec![PacketType::SyncTime as u8];
        frame.extend_from_slice(&value.to_wire());
        append_crc(&mut frame);
        assert_eq!(Inbound::parse(&frame, ID), Ok(Inbound::SyncTime(value)));
    }
}
