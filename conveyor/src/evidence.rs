//! Evidence capture for unattended runs.
//!
//! Every step transition and file operation is recorded with a timestamp;
//! file evidence carries size and SHA-256 checksum. The log is saved as a
//! JSON artifact at the end of the run.

use crate::errors::StepError;
use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// One recorded step outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvidenceEntry {
    /// The step or stage name.
    pub stage: String,
    /// Whether the stage succeeded.
    pub success: bool,
    /// RFC 3339 capture time.
    pub at: String,
    /// Free-form metadata.
    pub detail: serde_json::Value,
}

/// One recorded file operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileEvidence {
    /// The operation label (e.g. `raw_snapshot`, `report`).
    pub operation: String,
    /// The file path.
    pub path: String,
    /// File size in bytes; zero when the file was unreadable.
    pub bytes: u64,
    /// Hex-encoded SHA-256 of the contents, when readable.
    pub sha256: Option<String>,
    /// Whether the file was present and readable.
    pub success: bool,
    /// RFC 3339 capture time.
    pub at: String,
}

/// Serialized form of the evidence log.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct EvidenceDocument {
    run_id: Uuid,
    saved_at: String,
    entries: Vec<EvidenceEntry>,
    files: Vec<FileEvidence>,
}

/// Collects run evidence; shared across steps behind an `Arc`.
#[derive(Debug)]
pub struct EvidenceLog {
    run_id: Uuid,
    entries: Mutex<Vec<EvidenceEntry>>,
    files: Mutex<Vec<FileEvidence>>,
}

impl EvidenceLog {
    /// Creates an empty log for the given run.
    #[must_use]
    pub fn new(run_id: Uuid) -> Self {
        Self {
            run_id,
            entries: Mutex::new(Vec::new()),
            files: Mutex::new(Vec::new()),
        }
    }

    /// Records a step outcome.
    pub fn record_step(&self, stage: impl Into<String>, success: bool, detail: serde_json::Value) {
        let entry = EvidenceEntry {
            stage: stage.into(),
            success,
            at: Utc::now().to_rfc3339(),
            detail,
        };
        tracing::debug!(stage = %entry.stage, success, "evidence recorded");
        self.entries.lock().push(entry);
    }

    /// Records a file operation, hashing the file when readable.
    pub fn record_file(&self, operation: impl Into<String>, path: &Path) {
        let evidence = match std::fs::read(path) {
            Ok(data) => FileEvidence {
                operation: operation.into(),
                path: path.display().to_string(),
                bytes: data.len() as u64,
                sha256: Some(hex::encode(Sha256::digest(&data))),
                success: true,
                at: Utc::now().to_rfc3339(),
            },
            Err(err) => {
                tracing::warn!(path = %path.display(), error = %err, "file evidence capture failed");
                FileEvidence {
                    operation: operation.into(),
                    path: path.display().to_string(),
                    bytes: 0,
                    sha256: None,
                    success: false,
                    at: Utc::now().to_rfc3339(),
                }
            }
        };
        self.files.lock().push(evidence);
    }

    /// Number of recorded step entries.
    #[must_use]
    pub fn entry_count(&self) -> usize {
        self.entries.lock().len()
    }

    /// Returns a snapshot of the recorded step entries.
    #[must_use]
    pub fn entries(&self) -> Vec<EvidenceEntry> {
        self.entries.lock().clone()
    }

    /// Saves the log as `evidence_<run-id>.json` under `dir` and returns
    /// the artifact path.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory or file cannot be written.
    pub fn save(&self, dir: &Path) -> Result<PathBuf, StepError> {
        std::fs::create_dir_all(dir)
            .map_err(|e| StepError::fatal(format!("cannot create {}: {e}", dir.display())))?;

        let document = EvidenceDocument {
            run_id: self.run_id,
            saved_at: Utc::now().to_rfc3339(),
            entries: self.entries.lock().clone(),
            files: self.files.lock().clone(),
        };

        let path = dir.join(format!("evidence_{}.json", self.run_id));
        let body = serde_json::to_vec_pretty(&document)
            .map_err(|e| StepError::fatal(format!("evidence serialization failed: {e}")))?;
        std::fs::write(&path, body)
            .map_err(|e| StepError::fatal(format!("cannot write {}: {e}", path.display())))?;

        tracing::info!(path = %path.display(), entries = document.entries.len(), "evidence log saved");
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_step_accumulates_entries() {
        let log = EvidenceLog::new(Uuid::new_v4());
        log.record_step("fetch-catalog", true, serde_json::json!({"count": 20}));
        log.record_step("upload-report", false, serde_json::json!({"reason": "conflict"}));

        let entries = log.entries();
        assert_eq!(entries.len(), 2);
        assert!(entries[0].success);
        assert!(!entries[1].success);
    }

    #[test]
    fn test_record_file_hashes_contents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("artifact.json");
        std::fs::write(&path, b"{}").unwrap();

        let log = EvidenceLog::new(Uuid::new_v4());
        log.record_file("report", &path);

        let saved = log.save(dir.path()).unwrap();
        let document: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&saved).unwrap()).unwrap();
        let file = &document["files"][0];
        assert_eq!(file["bytes"], 2);
        assert_eq!(file["success"], true);
        // SHA-256 of "{}"
        assert_eq!(
            file["sha256"],
            "44136fa355b3678a1146ad16f7e8649e94fb4fc21fe77e8310c060f61caaff8a"
        );
    }

    #[test]
    fn test_record_file_unreadable_is_captured_as_failure() {
        let log = EvidenceLog::new(Uuid::new_v4());
        log.record_file("report", Path::new("/nonexistent/artifact.json"));

        let dir = tempfile::tempdir().unwrap();
        let saved = log.save(dir.path()).unwrap();
        let document: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&saved).unwrap()).unwrap();
        assert_eq!(document["files"][0]["success"], false);
        assert!(document["files"][0]["sha256"].is_null());
    }

    #[test]
    fn test_save_names_artifact_by_run_id() {
        let run_id = Uuid::new_v4();
        let log = EvidenceLog::new(run_id);
        let dir = tempfile::tempdir().unwrap();

        let path = log.save(dir.path()).unwrap();
        assert!(path
            .file_name()
            .unwrap()
            .to_string_lossy()
            .contains(&run_id.to_string()));
    }
}
