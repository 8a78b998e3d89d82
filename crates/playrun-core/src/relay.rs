//! Output relay
//!
//! One task per run drains the child's merged output. Every line goes to
//! the log file first and to the room second, so anything a subscriber has
//! seen is already on disk. When the stream ends the room is closed (unless
//! another workflow step follows), then the relay waits for the exit status
//! and tears the run down in a fixed order: finalize the record, free the
//! admission slot, remove the secret file, record the stop event.

use crate::admission::Reservation;
use crate::broker::{RoomBroker, StreamMessage};
use crate::events::{EventLog, JOB_STOP};
use crate::launcher::ExitWatch;
use crate::registry::RunRegistry;
use crate::secret::SecretFile;
use crate::types::RunId;
use std::path::Path;
use std::sync::Arc;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// How a relay ends its run
#[derive(Debug, Clone)]
pub struct RelayPlan {
    /// Job name recorded with the stop event
    pub job_name: String,

    /// Leave the room open at exit, for workflow steps followed by another
    pub keep_room_open: bool,
}

impl RelayPlan {
    pub fn single(job_name: impl Into<String>) -> Self {
        Self {
            job_name: job_name.into(),
            keep_room_open: false,
        }
    }
}

/// Drains one run's output into its log and room
pub struct OutputRelay {
    pub run_id: RunId,
    pub plan: RelayPlan,
    pub registry: Arc<RunRegistry>,
    pub broker: Arc<RoomBroker>,
    pub events: Arc<EventLog>,
    pub exit: ExitWatch,
    pub reservation: Reservation,
    pub secret: Option<SecretFile>,
}

impl OutputRelay {
    /// Start the relay task; the handle resolves to the exit code
    pub fn spawn<R>(self, output: R) -> JoinHandle<i32>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        tokio::spawn(self.run(output))
    }

    async fn run<R>(self, output: R) -> i32
    where
        R: AsyncRead + Unpin,
    {
        let log_path = self.registry.log_path(&self.run_id);
        let mut log = match open_log(&log_path).await {
            Ok(file) => Some(file),
            Err(e) => {
                warn!(run_id = %self.run_id, error = %e, "Cannot open log file, output will only be streamed");
                None
            }
        };

        let mut reader = BufReader::new(output);
        let mut buf = Vec::new();
        let mut lines = 0usize;
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {}
                Err(e) => {
                    warn!(run_id = %self.run_id, error = %e, "Output stream failed");
                    break;
                }
            }

            if let Some(file) = log.as_mut() {
                if let Err(e) = write_flushed(file, &buf).await {
                    warn!(run_id = %self.run_id, error = %e, "Log write failed, output will only be streamed");
                    log = None;
                }
            }
            let line = String::from_utf8_lossy(&buf).into_owned();
            self.broker.publish(&self.run_id, StreamMessage::log(line));
            lines += 1;
        }
        drop(log);
        debug!(run_id = %self.run_id, lines, "Output stream ended");

        if !self.plan.keep_room_open {
            self.broker.end(&self.run_id);
        }

        let code = self.exit.wait().await;
        self.teardown(code).await;
        code
    }

    async fn teardown(self, code: i32) {
        let id = &self.run_id;

        let log_size = self.registry.log_size(id);
        if let Err(e) = self.registry.finalize(id, Some(code), log_size).await {
            warn!(run_id = %id, error = %e, "Finalize failed");
        }

        drop(self.reservation);

        if let Some(secret) = &self.secret {
            if let Err(e) = secret.remove() {
                warn!(run_id = %id, error = %e, "Secret cleanup failed");
            }
        }

        match self.events.record(id, JOB_STOP, &self.plan.job_name).await {
            Ok(record) => {
                self.broker.publish(id, StreamMessage::Event(record));
            }
            Err(e) => warn!(run_id = %id, error = %e, "Failed to record stop event"),
        }
    }
}

async fn open_log(path: &Path) -> std::io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path).await
}

async fn write_flushed(file: &mut File, bytes: &[u8]) -> std::io::Result<()> {
    file.write_all(bytes).await?;
    file.flush().await
}

/// Append `text` to the log at `path` and broadcast it to the room of `id`
pub(crate) async fn announce(broker: &RoomBroker, path: &Path, id: &RunId, text: String) {
    let written = match open_log(path).await {
        Ok(mut file) => write_flushed(&mut file, text.as_bytes()).await,
        Err(e) => Err(e),
    };
    if let Err(e) = written {
        warn!(run_id = %id, error = %e, "Log write failed");
    }
    broker.publish(id, StreamMessage::log(text));
}
