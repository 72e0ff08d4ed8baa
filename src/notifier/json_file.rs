//! Notification records appended to a file using [JsonFileChannel].

use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::Local;
use serde_json::json;

use super::{ChannelError, NotificationChannel};
use crate::model::Status;
use crate::util::retry::{classify, Failure};

/// Appends one JSON object per notification to a file (JSON lines).
///
/// Meant to be picked up by a log shipper or a monitoring agent.
#[derive(Debug, Clone)]
pub struct JsonFileChannel {
    path: PathBuf,
}

impl JsonFileChannel {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
        }
    }
}

impl NotificationChannel for JsonFileChannel {
    fn send(&self, message: &str, status: Status) -> Result<(), Failure<ChannelError>> {
        let record = json!({
            "time": Local::now().to_rfc3339(),
            "status": status,
            "message": message,
        });
        let mut line =
            serde_json::to_vec(&record).map_err(|e| Failure::Fatal(ChannelError::Json(e)))?;
        line.push(b'\n');

        let io_failure = |e: io::Error| classify(e).map(ChannelError::Io);
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(io_failure)?;
        file.write_all(&line).map_err(io_failure)?;

        log::debug!(target: "notifier::json_file", "Appended notification to {}", self.path.display());
        Ok(())
    }
}
