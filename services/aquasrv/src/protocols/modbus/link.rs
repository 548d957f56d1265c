//! RS-485 side of the slave
//!
//! Frames are cut by the 3.5 character gap of the configured line speed and
//! answered in order on the same stream.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::frame::MAX_FRAME;
use super::slave::ModbusSlave;
use crate::core::context::DeviceContext;
use crate::core::framing::IdleFramer;
use crate::error::Result;
use crate::protocols::open_serial;

/// Serve requests until the stream closes or the token is cancelled
pub async fn serve<S>(ctx: Arc<DeviceContext>, stream: S, token: CancellationToken)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let slave = ModbusSlave::new(ctx.clone());
    let speed = ctx.config().modbus_speed();
    let mut framer = IdleFramer::new(MAX_FRAME, speed.frame_gap());
    let (mut reader, mut writer) = tokio::io::split(stream);
    info!(
        "MODBUS slave 0x{:02X} listening at {} baud",
        ctx.config().modbus_id(),
        speed.baud()
    );

    loop {
        let frame = tokio::select! {
            _ = token.cancelled() => break,
            frame = framer.next_frame(&mut reader) => frame,
        };
        let Some(frame) = frame else {
            debug!("MODBUS line closed");
            break;
        };
        let Some(answer) = slave.process(&frame) else {
            continue;
        };
        if let Err(e) = writer.write_all(&answer).await {
            warn!("MODBUS answer not sent: {}", e);
            continue;
        }
        if let Err(e) = writer.flush().await {
            warn!("MODBUS flush failed: {}", e);
        }
    }
    info!("MODBUS slave stopped");
}

/// Open the RS-485 port at the configured speed and serve it
pub async fn run_serial(ctx: Arc<DeviceContext>, port: &str, token: CancellationToken) -> Result<()> {
    let stream = open_serial(port, ctx.config().modbus_speed().baud())?;
    serve(ctx, stream, token).await;
    Ok(())
}
