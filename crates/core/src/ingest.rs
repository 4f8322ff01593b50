//! Ingestion pipeline.
//!
//! Batches are validated as a whole before anything is appended. Continuous
//! uploads are newline-delimited JSON consumed incrementally: each complete
//! line is appended as soon as it arrives, and a bad line is counted and
//! skipped without stopping the upload.

use std::sync::Arc;

use bytes::BytesMut;
use futures::StreamExt;
use tokio::io::AsyncRead;
use tokio_util::codec::{Decoder, FramedRead, LinesCodec, LinesCodecError};
use tracing::{debug, info, warn};

use crate::{
    error::{Result, StreamError},
    registry::StreamRegistry,
    types::{IngestReport, NewEvent, StreamEvent},
};

/// Entry point for appending events.
#[derive(Clone)]
pub struct Ingestor {
    registry: Arc<StreamRegistry>,
    max_line_length: usize,
}

impl Ingestor {
    pub fn new(registry: Arc<StreamRegistry>, max_line_length: usize) -> Self {
        Self {
            registry,
            max_line_length,
        }
    }

    /// Append a batch of events, all or nothing on validation.
    pub async fn add_batch(&self, key: &str, events: Vec<NewEvent>) -> Result<IngestReport> {
        for (index, event) in events.iter().enumerate() {
            event
                .validate()
                .map_err(|reason| StreamError::Validation(format!("event {index}: {reason}")))?;
        }

        let ids = self.registry.append_batch(key, &events).await?;

        let mut report = IngestReport::default();
        for id in ids {
            report.record_added(id);
        }
        debug!(key = %key, added = report.added, "Appended batch");
        Ok(report)
    }

    /// Append one JSON-encoded event.
    pub async fn add_json(&self, key: &str, text: &str) -> Result<StreamEvent> {
        let event: NewEvent = serde_json::from_str(text)
            .map_err(|e| StreamError::Validation(format!("invalid event: {e}")))?;
        event.validate().map_err(StreamError::Validation)?;
        self.registry.append_one(key, &event).await
    }

    /// Consume a newline-delimited JSON upload.
    ///
    /// The stream must be active when the upload starts. After that every
    /// line stands alone: malformed, invalid or refused lines are counted in
    /// the report and the upload goes on. A transport error stops reading and
    /// returns what was recorded so far, flagged as interrupted.
    pub async fn add_lines<R>(&self, key: &str, reader: R) -> Result<IngestReport>
    where
        R: AsyncRead + Unpin,
    {
        self.registry.ensure_active(key).await?;

        let codec = UploadCodec::new(self.max_line_length);
        let mut lines = FramedRead::new(reader, codec);
        let mut report = IngestReport::default();
        let mut line_no = 0u64;

        while let Some(next) = lines.next().await {
            line_no += 1;
            let line = match next {
                Ok(UploadLine::Text(line)) => line,
                Ok(UploadLine::TooLong) => {
                    report.record_rejected(
                        line_no,
                        format!("line exceeds {} bytes", self.max_line_length),
                    );
                    continue;
                }
                Ok(UploadLine::NotUtf8) => {
                    report.record_rejected(line_no, "line is not valid UTF-8");
                    continue;
                }
                Err(err) => {
                    warn!(key = %key, line = line_no, error = %err, "Upload interrupted");
                    report.interrupted = true;
                    break;
                }
            };

            if line.trim().is_empty() {
                continue;
            }

            match self.append_line(key, &line).await {
                Ok(event) => report.record_added(event.id),
                Err(reason) => {
                    debug!(key = %key, line = line_no, reason = %reason, "Rejected line");
                    report.record_rejected(line_no, reason);
                }
            }
        }

        info!(
            key = %key,
            added = report.added,
            rejected = report.rejected,
            interrupted = report.interrupted,
            "Upload finished"
        );
        Ok(report)
    }

    async fn append_line(&self, key: &str, line: &str) -> std::result::Result<StreamEvent, String> {
        let event: NewEvent =
            serde_json::from_str(line).map_err(|e| format!("invalid json: {e}"))?;
        event.validate()?;
        self.registry
            .append_one(key, &event)
            .await
            .map_err(|e| e.to_string())
    }
}

/// One framed upload line.
#[derive(Debug, PartialEq, Eq)]
enum UploadLine {
    Text(String),
    TooLong,
    NotUtf8,
}

/// `LinesCodec` that reports bad lines as items so framing carries on.
struct UploadCodec {
    inner: LinesCodec,
}

impl UploadCodec {
    fn new(max_length: usize) -> Self {
        Self {
            inner: LinesCodec::new_with_max_length(max_length),
        }
    }

    fn map(
        result: std::result::Result<Option<String>, LinesCodecError>,
    ) -> std::result::Result<Option<UploadLine>, LinesCodecError> {
        match result {
            Ok(line) => Ok(line.map(UploadLine::Text)),
            Err(LinesCodecError::MaxLineLengthExceeded) => Ok(Some(UploadLine::TooLong)),
            // The codec consumed the line before checking its encoding
            Err(LinesCodecError::Io(err)) if err.kind() == std::io::ErrorKind::InvalidData => {
                Ok(Some(UploadLine::NotUtf8))
            }
            Err(err) => Err(err),
        }
    }
}

impl Decoder for UploadCodec {
    type Item = UploadLine;
    type Error = LinesCodecError;

    fn decode(&mut self, buf: &mut BytesMut) -> std::result::Result<Option<UploadLine>, Self::Error> {
        Self::map(self.inner.decode(buf))
    }

    fn decode_eof(
        &mut self,
        buf: &mut BytesMut,
    ) -> std::result::Result<Option<UploadLine>, Self::Error> {
        Self::map(self.inner.decode_eof(buf))
    }
}
