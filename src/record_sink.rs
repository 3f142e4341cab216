use anyhow::Context;
use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use std::path::Path;
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::Mutex;
use tracing::{error, warn};

/// Consumer of accepted Information payloads. The link layer treats the payload
///  as opaque bytes; whatever schema the bytes carry lives entirely in the sink.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RecordSink: Send + Sync + 'static {
    /// append one record
    async fn append(&self, payload: &[u8]);

    /// make previously appended records durable
    async fn flush(&self);
}

/// Sink writing one CSV row per record, the payload decoded as consecutive
///  little-endian i16 columns (the sample row layout of the capture device).
pub struct CsvFileSink {
    writer: Mutex<BufWriter<File>>,
}

impl CsvFileSink {
    /// Truncates any previous capture at `path` and writes the header row.
    pub async fn create(path: impl AsRef<Path>, header: &str) -> anyhow::Result<CsvFileSink> {
        let file = File::create(path.as_ref())
            .await
            .with_context(|| format!("opening capture file {:?}", path.as_ref()))?;

        let mut writer = BufWriter::new(file);
        writer.write_all(header.as_bytes()).await?;
        writer.write_all(b"\n").await?;

        Ok(CsvFileSink {
            writer: Mutex::new(writer),
        })
    }

    fn to_row(payload: &[u8]) -> String {
        let columns: Vec<String> = payload
            .chunks_exact(2)
            .map(|pair| i16::from_le_bytes([pair[0], pair[1]]).to_string())
            .collect();
        columns.join(",")
    }
}

#[async_trait]
impl RecordSink for CsvFileSink {
    async fn append(&self, payload: &[u8]) {
        if payload.len() % 2 != 0 {
            warn!("record payload has odd length {}, ignoring the trailing byte", payload.len());
        }
        let row = Self::to_row(payload);

        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.write_all(row.as_bytes()).await {
            error!("error appending record: {}", e);
            return;
        }
        if let Err(e) = writer.write_all(b"\n").await {
            error!("error appending record: {}", e);
        }
    }

    async fn flush(&self) {
        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.flush().await {
            error!("error flushing records: {}", e);
            return;
        }
        if let Err(e) = writer.get_ref().sync_data().await {
            error!("error syncing records to disk: {}", e);
        }
    }
}
