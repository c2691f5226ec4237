/*!
Change tracking for one downstream output key.

A [`Tracker`] queues candidate windows, turns them into verified updates
through a [`Verifier`], buckets those into outputs according to its
[`Policy`] and hands ready outputs to a [`CommitAction`].
*/

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::error::{BoxError, LedgerError};
use crate::ledger::{Output, ensure_output};
use crate::merge::{merge_interval, subtract};
use crate::policy::Policy;
use crate::range::{HOUR_MS, TimeRange};
use crate::state::{PersistedOutput, PersistedState, STATE_VERSION};

/// Slack subtracted from the pass start when advancing the scan watermark.
pub const DEFAULT_SCAN_OVERLAP_MS: i64 = HOUR_MS;

/// Confirms which parts of a candidate window really changed.
#[async_trait]
pub trait Verifier: Send {
    /// Changed ranges inside `candidate`, looking only at sources created at
    /// or after `created_after`.
    async fn updates_within(
        &mut self,
        candidate: TimeRange,
        created_after: i64,
    ) -> Result<Vec<TimeRange>, BoxError>;
}

/// Materializes an output downstream.
#[async_trait]
pub trait CommitAction: Send + Sync {
    fn name(&self) -> &'static str;

    async fn commit(&self, output: &Output) -> Result<(), BoxError>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessSummary {
    pub candidates: usize,
    pub updates: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommitSummary {
    pub committed: usize,
    pub failed: usize,
    pub expired: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tracker {
    policy: Policy,
    scan_overlap_ms: i64,
    candidate_scan: i64,
    candidates: Vec<TimeRange>,
    outputs: Vec<Output>,
    latest_commit: i64,
}

impl Tracker {
    pub fn new(policy: Policy) -> Self {
        Self {
            policy,
            scan_overlap_ms: DEFAULT_SCAN_OVERLAP_MS,
            candidate_scan: 0,
            candidates: Vec::new(),
            outputs: Vec::new(),
            latest_commit: 0,
        }
    }

    pub fn with_scan_overlap(mut self, scan_overlap_ms: i64) -> Self {
        self.scan_overlap_ms = scan_overlap_ms.max(0);
        self
    }

    /// Rebuild a tracker from its persisted document.
    pub fn from_state(policy: Policy, state: PersistedState) -> Result<Self, LedgerError> {
        if state.version != STATE_VERSION {
            return Err(LedgerError::VersionMismatch {
                found: state.version,
                expected: STATE_VERSION,
            });
        }
        state.validate()?;

        let outputs = state
            .outputs
            .into_iter()
            .map(|output| Output {
                range: TimeRange {
                    start: output.start,
                    end: output.end,
                },
                committed: output.committed,
                updates: output.updated,
            })
            .collect();

        Ok(Self {
            candidate_scan: state.candidate_scan,
            candidates: state.candidates,
            outputs,
            latest_commit: state.latest_commit,
            ..Self::new(policy)
        })
    }

    pub fn to_state(&self) -> PersistedState {
        PersistedState {
            version: STATE_VERSION,
            candidate_scan: self.candidate_scan,
            candidates: self.candidates.clone(),
            outputs: self.outputs.iter().map(PersistedOutput::from).collect(),
            latest_commit: self.latest_commit,
        }
    }

    pub fn policy(&self) -> Policy {
        self.policy
    }

    pub fn candidates(&self) -> &[TimeRange] {
        &self.candidates
    }

    pub fn candidate_scan(&self) -> i64 {
        self.candidate_scan
    }

    pub fn latest_commit(&self) -> i64 {
        self.latest_commit
    }

    /// Outputs still eligible for commit at `now`.
    pub fn outputs(&self, now: i64) -> impl Iterator<Item = &Output> + '_ {
        let policy = self.policy;
        self.outputs
            .iter()
            .filter(move |output| !policy.rules().is_expired(output, now))
    }

    /// Queue a window for verification. Returns whether the queue changed.
    pub fn notify_candidate(&mut self, range: TimeRange) -> bool {
        merge_interval(&mut self.candidates, range).changed()
    }

    /// Verify every queued candidate and fold the resulting updates.
    ///
    /// Candidates stay queued until the whole pass has succeeded, so an error
    /// (or the future being dropped) leaves every one of them in place for
    /// the next pass.
    pub async fn process_candidates<V>(
        &mut self,
        verifier: &mut V,
        now: i64,
    ) -> Result<ProcessSummary, BoxError>
    where
        V: Verifier + ?Sized,
    {
        let policy = self.policy;
        let created_after = self.candidate_scan;
        let mut summary = ProcessSummary::default();

        for index in 0..self.candidates.len() {
            let candidate = self.candidates[index];
            let Some(window) = policy.rules().round_candidate(candidate, now) else {
                debug!(candidate = %candidate, "candidate dropped by policy");
                continue;
            };
            let updates = verifier.updates_within(window, created_after).await?;
            for update in updates {
                if let Some(update) = update.intersect(&window) {
                    if self.fold_update(update, now) {
                        summary.updates += 1;
                    }
                }
            }
        }

        summary.candidates = self.candidates.len();
        if summary.candidates > 0 {
            self.candidates.clear();
            self.candidate_scan = self
                .candidate_scan
                .max(now.saturating_sub(self.scan_overlap_ms));
            debug!(
                candidates = summary.candidates,
                updates = summary.updates,
                candidate_scan = self.candidate_scan,
                "candidates processed"
            );
        }
        Ok(summary)
    }

    /// Inspect a window regardless of the scan watermark. On failure the
    /// window is queued as an ordinary candidate instead.
    pub async fn rescan<V>(
        &mut self,
        window: TimeRange,
        verifier: &mut V,
        now: i64,
    ) -> Result<usize, BoxError>
    where
        V: Verifier + ?Sized,
    {
        let Some(window) = self.policy.rules().round_candidate(window, now) else {
            return Ok(0);
        };
        match verifier.updates_within(window, i64::MIN).await {
            Ok(updates) => Ok(updates
                .into_iter()
                .filter_map(|update| update.intersect(&window))
                .filter(|update| self.fold_update(*update, now))
                .count()),
            Err(err) => {
                self.notify_candidate(window);
                Err(err)
            }
        }
    }

    /// Record a change that needs no verification.
    pub fn notify_update(&mut self, range: TimeRange, now: i64) -> bool {
        self.fold_update(range, now)
    }

    /// Record that `range` was committed by someone else.
    pub fn notify_external_commit(&mut self, range: TimeRange, now: i64) -> bool {
        let policy = self.policy;
        let rules = policy.rules();
        let mut changed = false;
        for bucket in rules.updated_to_outputs(range, now) {
            let index = ensure_output(&mut self.outputs, bucket, rules.merge_adjacent_outputs());
            let output = &mut self.outputs[index];
            changed |= !output.committed;
            output.committed = true;
            changed |= output.remove_updates(range);
        }
        if !rules.retain_after_commit() {
            self.outputs.retain(Output::has_updates);
        }
        if range.end > self.latest_commit {
            self.latest_commit = range.end;
            changed = true;
        }
        changed
    }

    /// Offer every ready output, oldest first, to `action`.
    ///
    /// Outputs are evaluated strictly in time order since readiness may
    /// depend on the outputs after them. A failed commit leaves its output
    /// exactly as it was.
    pub async fn commit<C>(&mut self, action: &C, now: i64) -> CommitSummary
    where
        C: CommitAction + ?Sized,
    {
        let policy = self.policy;
        let rules = policy.rules();
        let mut summary = CommitSummary::default();

        let before = self.outputs.len();
        self.outputs.retain(|output| !rules.is_expired(output, now));
        summary.expired = before - self.outputs.len();
        if summary.expired > 0 {
            info!(expired = summary.expired, "dropped expired outputs");
        }

        let mut index = 0;
        while index < self.outputs.len() {
            if !self.outputs[index].has_updates() || !rules.is_ready(index, &self.outputs, now) {
                index += 1;
                continue;
            }

            let range = self.outputs[index].range;
            match action.commit(&self.outputs[index]).await {
                Ok(()) => {
                    summary.committed += 1;
                    self.latest_commit = self.latest_commit.max(range.end);
                    info!(output = %range, action = action.name(), "output committed");
                    if rules.retain_after_commit() {
                        let output = &mut self.outputs[index];
                        output.updates.clear();
                        output.committed = true;
                        index += 1;
                    } else {
                        self.outputs.remove(index);
                    }
                }
                Err(err) => {
                    summary.failed += 1;
                    warn!(output = %range, action = action.name(), error = %err, "commit failed, will retry");
                    index += 1;
                }
            }
        }
        summary
    }

    /// Forget a window: queued candidates and recorded updates inside it are
    /// removed, and with `discard_outputs` every output touching it goes too.
    pub fn discard(&mut self, window: TimeRange, discard_outputs: bool) -> bool {
        let mut changed = subtract(&mut self.candidates, window);
        let before = self.outputs.len();
        if discard_outputs {
            self.outputs.retain(|output| !output.range.overlaps(&window));
        } else {
            for output in &mut self.outputs {
                changed |= output.remove_updates(window);
            }
            self.outputs
                .retain(|output| output.has_updates() || output.committed);
        }
        changed || self.outputs.len() != before
    }

    fn fold_update(&mut self, update: TimeRange, now: i64) -> bool {
        let policy = self.policy;
        let rules = policy.rules();
        let mut changed = false;
        for bucket in rules.updated_to_outputs(update, now) {
            let index = ensure_output(&mut self.outputs, bucket, rules.merge_adjacent_outputs());
            changed |= self.outputs[index].add_update(update);
        }
        changed
    }
}
