/*!
Persistent tracker state, one JSON document per tracker
*/

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use commit_ledger::{LedgerError, PersistedState, Policy, Tracker};
use thiserror::Error;
use tracing::{debug, info};

use crate::scheduler::config::StateConfig;
use crate::scheduler::controller::TrackerId;

#[derive(Debug, Error)]
pub enum StateError {
    #[error("state file {path}: {source}")]
    Ledger {
        path: PathBuf,
        source: LedgerError,
    },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Stores tracker state under `<directory>/<station>/<key>.json`
#[derive(Debug, Clone)]
pub struct StateStore {
    directory: PathBuf,
}

impl StateStore {
    pub fn new(config: &StateConfig) -> Self {
        Self {
            directory: config.directory.clone(),
        }
    }

    pub fn path_for(&self, id: &TrackerId) -> PathBuf {
        self.directory
            .join(sanitize(&id.station))
            .join(format!("{}.json", sanitize(&id.key)))
    }

    /// Load a tracker, starting empty when no document exists yet.
    ///
    /// A document from another schema version or one that fails validation is
    /// an error; it is never silently replaced.
    pub async fn load(
        &self,
        id: &TrackerId,
        policy: Policy,
        scan_overlap_ms: i64,
    ) -> Result<Tracker, StateError> {
        let path = self.path_for(id);
        let raw = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                info!(tracker = %id, "no saved state, starting empty");
                return Ok(Tracker::new(policy).with_scan_overlap(scan_overlap_ms));
            }
            Err(err) => return Err(err.into()),
        };

        let tracker = PersistedState::from_json(&raw)
            .and_then(|state| Tracker::from_state(policy, state))
            .map_err(|source| StateError::Ledger {
                path: path.clone(),
                source,
            })?;
        debug!(tracker = %id, path = %path.display(), "state loaded");
        Ok(tracker.with_scan_overlap(scan_overlap_ms))
    }

    /// Replace the saved document. With `durable` the data and the directory
    /// entry are flushed to disk before returning.
    pub async fn save(&self, id: &TrackerId, tracker: &Tracker, durable: bool) -> Result<(), StateError> {
        let path = self.path_for(id);
        let contents = encode(&path, tracker)?;
        tokio::task::spawn_blocking(move || write_atomic(&path, contents.as_bytes(), durable))
            .await
            .map_err(std::io::Error::other)??;
        Ok(())
    }

    /// Synchronous save for use while shutting down.
    pub fn save_blocking(&self, id: &TrackerId, tracker: &Tracker) -> Result<(), StateError> {
        let path = self.path_for(id);
        let contents = encode(&path, tracker)?;
        write_atomic(&path, contents.as_bytes(), true)?;
        Ok(())
    }
}

fn encode(path: &Path, tracker: &Tracker) -> Result<String, StateError> {
    tracker
        .to_state()
        .to_json()
        .map_err(|source| StateError::Ledger {
            path: path.to_path_buf(),
            source,
        })
}

fn write_atomic(path: &Path, contents: &[u8], durable: bool) -> std::io::Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent)?;

    let tmp = path.with_extension("json.tmp");
    {
        let mut file = File::create(&tmp)?;
        file.write_all(contents)?;
        if durable {
            file.sync_all()?;
        }
    }
    std::fs::rename(&tmp, path)?;

    if durable {
        // Persist the rename itself.
        File::open(parent)?.sync_all()?;
    }
    Ok(())
}

/// File-name safe form of a station or key.
fn sanitize(name: &str) -> String {
    let cleaned: String = name
        .trim()
        .to_lowercase()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "_".to_string()
    } else {
        cleaned
    }
}
