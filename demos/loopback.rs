//! Loopback demo: an emulated capture device on one end of an in-process
//!  duplex pipe, a link session writing CSV rows on the other.

use anyhow::bail;
use motionlink::config::LinkConfig;
use motionlink::frame::Frame;
use motionlink::link_session::LinkSession;
use motionlink::record_sink::CsvFileSink;
use motionlink::seq::SeqNum;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tracing::{info, Level};

fn init_logging() {
    tracing_subscriber::fmt()
        .with_max_level(Level::DEBUG)
        .try_init()
        .ok();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();

    let (host_io, device_io) = tokio::io::duplex(4096);
    let device = tokio::spawn(emulate_device(device_io));

    let sink = Arc::new(CsvFileSink::create("capture.csv", "AcX,AcY,AcZ,GyX,GyY,GyZ").await?);
    let session = LinkSession::new(Arc::new(LinkConfig::default_serial()), sink)?;

    session.start(host_io).await?;
    device.await??;

    info!("capture complete, rows written to capture.csv");
    Ok(())
}

/// Plays the microcontroller's side of the link: waits for a handshake probe,
///  echoes it, then streams a few sample rows and hangs up.
async fn emulate_device(mut io: DuplexStream) -> anyhow::Result<()> {
    let mut buf = [0u8; 256];
    let read = io.read(&mut buf).await?;
    let probe = Frame::decode(&buf[..read])?;
    let Frame::Handshake { seq } = probe else {
        bail!("expected a handshake probe, got {:?}", probe);
    };
    io.write_all(&Frame::Handshake { seq }.encode()).await?;

    for row in 1u8..=40 {
        let sample: Vec<u8> = (0i16..6)
            .flat_map(|axis| (row as i16 * 100 + axis).to_le_bytes())
            .collect();
        let frame = Frame::Information {
            seq: SeqNum::from_raw(row),
            payload: sample,
        };
        io.write_all(&frame.encode()).await?;
    }

    io.shutdown().await?;
    Ok(())
}
