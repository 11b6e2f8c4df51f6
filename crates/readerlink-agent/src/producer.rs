// ABOUTME: Producer side of the queue: turns reader events into stored records, bounded by max_queue_size.
// ABOUTME: Also reads newline-delimited JSON objects from any async reader, e.g. stdin.

use std::sync::Arc;

use readerlink_core::{Fields, Record, RecordDraft, SharedSettings};
use readerlink_store::{RecordStore, StorageError};
use tokio::io::{AsyncBufRead, AsyncBufReadExt};

#[derive(Clone)]
pub struct Producer {
    store: Arc<RecordStore>,
    settings: SharedSettings,
}

impl Producer {
    pub fn new(store: Arc<RecordStore>, settings: SharedSettings) -> Self {
        Self { store, settings }
    }

    /// Store one reader event. A `max_queue_size` of 0 means unbounded.
    pub async fn submit(&self, fields: Fields) -> Result<Record, StorageError> {
        let limit = self.settings.read().await.max_queue_size();
        let limit = (limit > 0).then_some(limit);

        match self.store.add_bounded(RecordDraft::new(fields), limit).await {
            Ok(record) => {
                tracing::info!(key = %record.key, timestamp = record.timestamp, "record queued");
                Ok(record)
            }
            Err(e) => {
                tracing::warn!(error = %e, "record not queued");
                Err(e)
            }
        }
    }

    /// Submit every line of `reader` that holds a JSON object. Other lines
    /// are logged and skipped. Returns the number of records queued.
    pub async fn submit_lines<R: AsyncBufRead + Unpin>(&self, reader: R) -> std::io::Result<usize> {
        let mut lines = reader.lines();
        let mut queued = 0;

        while let Some(line) = lines.next_line().await? {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            let fields = match serde_json::from_str::<Fields>(line) {
                Ok(fields) => fields,
                Err(e) => {
                    tracing::warn!(error = %e, "skipping input line that is not a JSON object");
                    continue;
                }
            };

            if self.submit(fields).await.is_ok() {
                queued += 1;
            }
        }

        tracing::debug!(queued, "input closed");
        Ok(queued)
    }
}
