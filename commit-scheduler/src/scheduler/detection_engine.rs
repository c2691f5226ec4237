/*!
Verification of candidate windows against the archive contents
*/

use std::time::Duration;

use async_trait::async_trait;
use commit_ledger::{BoxError, TimeRange, Verifier, merge_interval};
use tracing::{debug, warn};

use crate::archive::{Archive, ArchiveError, FileEntry, LockScope, decode_row_times};
use crate::scheduler::config::{SchedulerSettings, SelectionConfig};

/// Lock retry pacing
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    pub initial: Duration,
    pub max: Duration,
}

impl Backoff {
    pub fn from_settings(settings: &SchedulerSettings) -> Self {
        let initial = Duration::from_millis(settings.lock_retry_initial_ms.max(1));
        Self {
            initial,
            max: Duration::from_millis(settings.lock_retry_max_ms).max(initial),
        }
    }
}

/// Looks at the files of one (station, archive) pair that changed since the
/// tracker last scanned and reports the time they actually cover.
pub struct FileInspector<'a, A: Archive> {
    archive: &'a A,
    station: &'a str,
    archive_name: &'a str,
    selection: &'a SelectionConfig,
    backoff: Backoff,
}

impl<'a, A: Archive> FileInspector<'a, A> {
    pub fn new(
        archive: &'a A,
        station: &'a str,
        archive_name: &'a str,
        selection: &'a SelectionConfig,
        backoff: Backoff,
    ) -> Self {
        Self {
            archive,
            station,
            archive_name,
            selection,
            backoff,
        }
    }

    /// Retries for as long as a writer holds the lock. Dropping the future
    /// abandons the wait.
    async fn lock(&self, scope: LockScope, range: TimeRange) -> Result<A::Lock, ArchiveError> {
        let mut delay = self.backoff.initial;
        loop {
            match self
                .archive
                .lock_read(scope, self.station, self.archive_name, range)
                .await
            {
                Err(ArchiveError::LockDenied { key, retry_after }) => {
                    let wait = retry_after.unwrap_or(delay).min(self.backoff.max);
                    debug!(lock = %key, wait_ms = wait.as_millis() as u64, "archive lock busy, retrying");
                    tokio::time::sleep(wait).await;
                    delay = (delay * 2).min(self.backoff.max);
                }
                other => return other,
            }
        }
    }

    async fn coverage(&self, file: &FileEntry, declared: TimeRange) -> Result<TimeRange, ArchiveError> {
        let blob = match self
            .archive
            .read_blob(self.station, self.archive_name, &file.name)
            .await
        {
            Ok(blob) => blob,
            Err(ArchiveError::Io(err)) if err.kind() == std::io::ErrorKind::NotFound => {
                warn!(file = %file.name, "indexed file has no data, assuming full coverage");
                return Ok(declared);
            }
            Err(err) => return Err(err),
        };
        let times = decode_row_times(&file.name, &blob)?;
        Ok(row_coverage(declared, &times))
    }
}

#[async_trait]
impl<'a, A: Archive> Verifier for FileInspector<'a, A> {
    async fn updates_within(
        &mut self,
        candidate: TimeRange,
        created_after: i64,
    ) -> Result<Vec<TimeRange>, BoxError> {
        // The index lock stays held until the data reads finish so no file
        // can be replaced in between.
        let _index = self.lock(LockScope::Index, candidate).await?;
        let files = self
            .archive
            .list_files(self.station, self.archive_name, candidate)
            .await?;

        let selected: Vec<FileEntry> = files
            .into_iter()
            .filter(|file| file.created >= created_after && selects(self.selection, file))
            .collect();
        if selected.is_empty() {
            return Ok(Vec::new());
        }

        let _data = self.lock(LockScope::Data, candidate).await?;
        let mut updates: Vec<TimeRange> = Vec::new();
        for file in &selected {
            let Ok(declared) = TimeRange::new(file.start, file.end) else {
                warn!(file = %file.name, start = file.start, end = file.end, "skipping file with empty coverage");
                continue;
            };
            let covered = self.coverage(file, declared).await?;
            if let Some(update) = covered.intersect(&candidate) {
                merge_interval(&mut updates, update);
            }
        }
        debug!(
            candidate = %candidate,
            files = selected.len(),
            updates = updates.len(),
            "candidate inspected"
        );
        Ok(updates)
    }
}

/// Span of the rows in a file, bounded by what the index declares. A file
/// without rows (or whose rows all fall outside) counts as its declared span.
fn row_coverage(declared: TimeRange, times: &[i64]) -> TimeRange {
    let (Some(first), Some(last)) = (times.iter().min(), times.iter().max()) else {
        return declared;
    };
    TimeRange {
        start: *first,
        end: last.saturating_add(1),
    }
    .intersect(&declared)
    .unwrap_or(declared)
}

fn selects(selection: &SelectionConfig, file: &FileEntry) -> bool {
    let has_tag = |wanted: &String| file.tags.iter().any(|tag| tag.eq_ignore_ascii_case(wanted));

    if !selection.required_tags.iter().all(has_tag) {
        return false;
    }
    if selection.excluded_tags.iter().any(has_tag) {
        return false;
    }
    if let Some(instrument) = &selection.instrument_id {
        if !file.instrument.eq_ignore_ascii_case(instrument) {
            return false;
        }
    }
    if let Some(kind) = &selection.instrument_type {
        if !file.instrument_type.eq_ignore_ascii_case(kind) {
            return false;
        }
    }
    true
}
