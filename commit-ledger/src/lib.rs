/*!
Change tracking ledger for archive export jobs.

Decides which time windows of an archive must be regenerated for a
downstream output, and when. Everything here is in-memory and
deterministic: callers supply the current time and the I/O hooks.
*/

pub mod error;
pub mod ledger;
pub mod merge;
pub mod policy;
pub mod range;
pub mod state;
pub mod tracker;

pub use error::{BoxError, LedgerError};
pub use ledger::Output;
pub use merge::{IntervalSeq, Merge, merge_interval};
pub use policy::{
    FileInspectionPolicy, Granularity, NearRealTimePolicy, OutputPolicy, Policy, YearlyPolicy,
};
pub use range::{DAY_MS, HOUR_MS, MINUTE_MS, TimeRange};
pub use state::{PersistedOutput, PersistedState, STATE_VERSION};
pub use tracker::{
    CommitAction, CommitSummary, DEFAULT_SCAN_OVERLAP_MS, ProcessSummary, Tracker, Verifier,
};
