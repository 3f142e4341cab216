use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use std::sync::Arc;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{error, trace};

/// This is an abstraction for writing a chunk of bytes to the transport,
///  introduced to facilitate mocking the I/O part away for testing
#[cfg_attr(test, automock)]
#[async_trait]
pub trait WireSocket: Send + Sync + 'static {
    async fn do_send_bytes(&self, buf: &[u8]);
}

/// WireSocket over the write half of any duplex byte stream - a serial port
///  device opened by the host, a TCP stream, or an in-process pipe.
pub struct StreamWireSocket<W> {
    writer: Mutex<W>,
}

impl<W: AsyncWrite + Unpin + Send + 'static> StreamWireSocket<W> {
    pub fn new(writer: W) -> StreamWireSocket<W> {
        StreamWireSocket {
            writer: Mutex::new(writer),
        }
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send + 'static> WireSocket for StreamWireSocket<W> {
    async fn do_send_bytes(&self, buf: &[u8]) {
        trace!("transport: writing {} bytes", buf.len());

        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.write_all(buf).await {
            error!("error writing to transport: {}", e);
            return;
        }
        if let Err(e) = writer.flush().await {
            error!("error flushing transport: {}", e);
        }
    }
}

/// Outbound side of the link: all encoded frames funnel through here.
///
/// NB: Send errors are logged, not propagated - the session learns of a dead
///      transport through its read loop, which is the single close trigger.
#[derive(Clone)]
pub struct SendPipeline {
    socket: Arc<dyn WireSocket>,
}

impl SendPipeline {
    pub fn new(socket: Arc<dyn WireSocket>) -> SendPipeline {
        SendPipeline { socket }
    }

    pub async fn do_send_frame(&self, frame_buf: &[u8]) {
        self.socket.do_send_bytes(frame_buf).await;
    }
}
