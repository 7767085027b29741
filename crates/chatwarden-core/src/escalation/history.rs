//! JSON snapshot of violation history.

use std::path::{Path, PathBuf};

use chatwarden_types::WardenError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::ViolationRecord;

const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct Snapshot {
    version: u32,
    saved_at: DateTime<Utc>,
    records: Vec<ViolationRecord>,
}

#[derive(Debug, Clone)]
pub struct HistoryStore {
    path: PathBuf,
}

impl HistoryStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Records newer than `cutoff`. A missing file is an empty history.
    pub fn load(&self, cutoff: DateTime<Utc>) -> Result<Vec<ViolationRecord>, WardenError> {
        let text = match std::fs::read_to_string(&self.path) {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "no escalation history yet");
                return Ok(Vec::new());
            }
            Err(e) => return Err(e.into()),
        };
        let snapshot: Snapshot = serde_json::from_str(&text)?;
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(WardenError::Config(format!(
                "unsupported history snapshot version {} in {}",
                snapshot.version,
                self.path.display()
            )));
        }
        let total = snapshot.records.len();
        let records: Vec<_> = snapshot
            .records
            .into_iter()
            .filter(|r| r.timestamp > cutoff)
            .collect();
        info!(
            path = %self.path.display(),
            loaded = records.len(),
            expired = total - records.len(),
            "escalation history loaded"
        );
        Ok(records)
    }

    /// Write atomically: temp file in the same directory, then rename.
    pub fn save(&self, records: &[ViolationRecord]) -> Result<(), WardenError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let snapshot = Snapshot {
            version: SNAPSHOT_VERSION,
            saved_at: Utc::now(),
            records: records.to_vec(),
        };
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(&snapshot)?)?;
        std::fs::rename(&tmp, &self.path)?;
        debug!(path = %self.path.display(), records = records.len(), "escalation history saved");
        Ok(())
    }
}
