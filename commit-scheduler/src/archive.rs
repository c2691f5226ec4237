/*!
Archive access.

The scheduler only needs a narrow contract from the archive: shared read
locks over a time range, the file index, raw data blobs and a stream of
change hints per (station, archive) topic. [`LocalArchive`] provides that
contract on top of a plain directory tree.
*/

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use commit_ledger::TimeRange;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_stream::{StreamExt, wrappers::IntervalStream};
use tracing::{debug, warn};

use crate::scheduler::config::ArchiveConfig;

const INDEX_FILE: &str = "index.json";
const DATA_DIR: &str = "data";
const NOTIFY_LOG: &str = "notify.log";
const LOCK_RETRY_AFTER: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum ArchiveError {
    /// Another writer holds the lock; try again later.
    #[error("lock denied on {key}")]
    LockDenied {
        key: String,
        retry_after: Option<Duration>,
    },
    #[error("invalid archive file name {0:?}")]
    InvalidName(String),
    #[error("malformed archive document {path}: {source}")]
    Malformed {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Which half of a (station, archive) pair a lock protects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockScope {
    Index,
    Data,
}

impl LockScope {
    fn as_str(&self) -> &'static str {
        match self {
            LockScope::Index => "index",
            LockScope::Data => "data",
        }
    }
}

/// One source file as described by the archive index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    pub name: String,
    /// Declared coverage
    pub start: i64,
    pub end: i64,
    /// When this version of the file was written
    pub created: i64,
    pub instrument: String,
    pub instrument_type: String,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Deserialize, Serialize)]
struct DataBlob {
    times: Vec<i64>,
}

/// Row timestamps stored in a data blob.
pub fn decode_row_times(name: &str, bytes: &[u8]) -> Result<Vec<i64>, ArchiveError> {
    serde_json::from_slice::<DataBlob>(bytes)
        .map(|blob| blob.times)
        .map_err(|source| ArchiveError::Malformed {
            path: PathBuf::from(name),
            source,
        })
}

#[async_trait]
pub trait Archive: Send + Sync + 'static {
    /// Held for as long as the read lock should last.
    type Lock: Send;

    /// Acquire a shared read lock. Contention is reported as
    /// [`ArchiveError::LockDenied`].
    async fn lock_read(
        &self,
        scope: LockScope,
        station: &str,
        archive: &str,
        range: TimeRange,
    ) -> Result<Self::Lock, ArchiveError>;

    /// Index entries whose declared coverage overlaps `range`.
    async fn list_files(
        &self,
        station: &str,
        archive: &str,
        range: TimeRange,
    ) -> Result<Vec<FileEntry>, ArchiveError>;

    async fn read_blob(
        &self,
        station: &str,
        archive: &str,
        name: &str,
    ) -> Result<Vec<u8>, ArchiveError>;

    /// Change hints published on the (station, archive) topic from now on.
    fn listen(&self, station: &str, archive: &str) -> BoxStream<'static, TimeRange>;
}

/// Archive laid out as `<root>/<station>/<archive>/{index.json,data/,notify.log}`.
#[derive(Debug, Clone)]
pub struct LocalArchive {
    root: PathBuf,
    poll_interval: Duration,
}

/// Shared lock on one of the archive lock files, released on drop.
#[derive(Debug)]
pub struct LocalLock {
    _file: std::fs::File,
}

impl LocalArchive {
    pub fn new(config: &ArchiveConfig) -> Self {
        Self {
            root: config.root.clone(),
            poll_interval: Duration::from_millis(config.poll_interval_ms.max(10)),
        }
    }

    fn topic_dir(&self, station: &str, archive: &str) -> PathBuf {
        self.root
            .join(station.to_lowercase())
            .join(archive.to_lowercase())
    }
}

#[async_trait]
impl Archive for LocalArchive {
    type Lock = LocalLock;

    async fn lock_read(
        &self,
        scope: LockScope,
        station: &str,
        archive: &str,
        _range: TimeRange,
    ) -> Result<LocalLock, ArchiveError> {
        // File locks cannot be narrowed to a time range; the whole topic is locked.
        let dir = self.topic_dir(station, archive);
        tokio::fs::create_dir_all(&dir).await?;
        let path = dir.join(format!("{}.lock", scope.as_str()));
        let file = std::fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&path)?;

        match fs2::FileExt::try_lock_shared(&file) {
            Ok(()) => Ok(LocalLock { _file: file }),
            Err(err) if err.raw_os_error() == fs2::lock_contended_error().raw_os_error() => {
                Err(ArchiveError::LockDenied {
                    key: format!("{}/{}/{}", scope.as_str(), station, archive),
                    retry_after: Some(LOCK_RETRY_AFTER),
                })
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn list_files(
        &self,
        station: &str,
        archive: &str,
        range: TimeRange,
    ) -> Result<Vec<FileEntry>, ArchiveError> {
        let path = self.topic_dir(station, archive).join(INDEX_FILE);
        let raw = match tokio::fs::read(&path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        let entries: Vec<FileEntry> = serde_json::from_slice(&raw)
            .map_err(|source| ArchiveError::Malformed { path, source })?;
        Ok(entries
            .into_iter()
            .filter(|entry| entry.start < range.end && range.start < entry.end)
            .collect())
    }

    async fn read_blob(
        &self,
        station: &str,
        archive: &str,
        name: &str,
    ) -> Result<Vec<u8>, ArchiveError> {
        if name.is_empty() || name.contains(['/', '\\']) || name == ".." {
            return Err(ArchiveError::InvalidName(name.to_string()));
        }
        let path = self.topic_dir(station, archive).join(DATA_DIR).join(name);
        Ok(tokio::fs::read(path).await?)
    }

    fn listen(&self, station: &str, archive: &str) -> BoxStream<'static, TimeRange> {
        let path = self.topic_dir(station, archive).join(NOTIFY_LOG);
        let poll_interval = self.poll_interval;
        // Only hints published after subscribing are delivered.
        let mut offset = std::fs::metadata(&path).map(|meta| meta.len()).unwrap_or(0);

        Box::pin(async_stream::stream! {
            let mut ticks = IntervalStream::new(tokio::time::interval(poll_interval));
            let mut pending = String::new();
            while ticks.next().await.is_some() {
                match read_appended(&path, &mut offset).await {
                    Ok(chunk) => pending.push_str(&chunk),
                    Err(err) => {
                        warn!(path = %path.display(), error = %err, "failed to read notification log");
                        continue;
                    }
                }
                while let Some(newline) = pending.find('\n') {
                    let line: String = pending.drain(..=newline).collect();
                    match parse_hint(&line) {
                        Some(range) => yield range,
                        None if line.trim().is_empty() => {}
                        None => debug!(line = line.trim(), "ignoring malformed notification"),
                    }
                }
            }
        })
    }
}

async fn read_appended(path: &Path, offset: &mut u64) -> std::io::Result<String> {
    let len = match tokio::fs::metadata(path).await {
        Ok(meta) => meta.len(),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(String::new()),
        Err(err) => return Err(err),
    };
    if len < *offset {
        // Log was truncated or replaced.
        *offset = 0;
    }
    if len == *offset {
        return Ok(String::new());
    }

    let mut file = tokio::fs::File::open(path).await?;
    file.seek(SeekFrom::Start(*offset)).await?;
    let mut buf = Vec::new();
    file.read_to_end(&mut buf).await?;
    *offset += buf.len() as u64;
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

/// `<start> <end>` in epoch milliseconds.
fn parse_hint(line: &str) -> Option<TimeRange> {
    let mut parts = line.split_whitespace();
    let start = parts.next()?.parse::<i64>().ok()?;
    let end = parts.next()?.parse::<i64>().ok()?;
    TimeRange::new(start, end).ok()
}
