#![allow(clippy::disallowed_methods)]
//! MODBUS-RTU slave served over an in-memory line

use std::sync::Arc;
use std::time::Duration;

use aquasrv::config::MemConfigStore;
use aquasrv::core::context::{Board, DeviceContext};
use aquasrv::core::crc::{append_crc, verify_trailing};
use aquasrv::core::hal::ResetSource;
use aquasrv::core::sim::{MemFram, SimAdc, SimBoard, SimRtc};
use aquasrv::core::time::DateTime;
use aquasrv::protocols::modbus::link::serve;
use aquasrv::protocols::modbus::ModbusError;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio_util::sync::CancellationToken;

async fn slave() -> (Arc<DeviceContext>, DuplexStream, CancellationToken) {
    let sim = Arc::new(SimBoard::new());
    let rtc = Arc::new(SimRtc::new(DateTime::new(10, 6, 2024, 12, 0, 0).unwrap()));
    let ctx = DeviceContext::open(
        Arc::new(MemConfigStore::new()),
        Arc::new(MemFram::new()),
        Board::simulated(sim, rtc, Arc::new(SimAdc::new([0, 0]))),
        ResetSource::PowerOn,
        false,
    )
    .await;
    let (master, device) = tokio::io::duplex(512);
    let token = CancellationToken::new();
    tokio::spawn(serve(ctx.clone(), device, token.clone()));
    (ctx, master, token)
}

fn sealed(body: &[u8]) -> Vec<u8> {
    let mut frame = body.to_vec();
    append_crc(&mut frame);
    frame
}

async fn request(master: &mut DuplexStream, frame: &[u8], answer_len: usize) -> Option<Vec<u8>> {
    master.write_all(frame).await.unwrap();
    let mut answer = vec![0u8; answer_len];
    tokio::time::timeout(Duration::from_millis(300), master.read_exact(&mut answer))
        .await
        .ok()
        .map(|r| {
            r.unwrap();
            answer
        })
}

#[tokio::test]
async fn conflicting_control_word_is_rejected() {
    let (ctx, mut master, token) = slave().await;
    let answer = request(&mut master, &sealed(&[0x01, 0x06, 0x00, 0x00, 0x00, 0x03]), 5)
        .await
        .unwrap();
    assert_eq!(answer[..3], [0x01, 0x86, 0x03]);
    assert!(verify_trailing(&answer));
    assert!(ctx.valve_events.peek().is_empty());
    token.cancel();
}

#[tokio::test]
async fn unknown_register_gets_address_exception() {
    let (ctx, mut master, token) = slave().await;
    let answer = request(&mut master, &sealed(&[0x01, 0x03, 0x00, 0x02, 0x00, 0x01]), 5)
        .await
        .unwrap();
    assert_eq!(answer[..3], [0x01, 0x83, 0x02]);
    assert_eq!(ctx.modbus_stats.error_count(ModbusError::Address), 1);
    token.cancel();
}

#[tokio::test]
async fn crc_error_is_counted_and_not_answered() {
    let (ctx, mut master, token) = slave().await;
    let mut frame = sealed(&[0x01, 0x03, 0x00, 0x00, 0x00, 0x01]);
    frame[6] ^= 0xFF;
    assert!(request(&mut master, &frame, 1).await.is_none());
    assert_eq!(ctx.modbus_stats.error_count(ModbusError::Crc), 1);
    assert_eq!(ctx.modbus_stats.recv_total(), 0);

    // the line keeps working after the bad frame
    let answer = request(&mut master, &sealed(&[0x01, 0x03, 0x00, 0x00, 0x00, 0x01]), 7)
        .await
        .unwrap();
    assert_eq!(answer[..3], [0x01, 0x03, 0x02]);
    token.cancel();
}
