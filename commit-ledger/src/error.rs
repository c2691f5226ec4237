/*!
Errors raised by the ledger
*/

use thiserror::Error;

/// Boxed error returned by verification and commit hooks.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("invalid time range [{start}, {end})")]
    InvalidRange { start: i64, end: i64 },
    #[error("tracker state version {found} does not match supported version {expected}")]
    VersionMismatch { found: u64, expected: u64 },
    #[error("corrupt tracker state: {0}")]
    Corrupt(String),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}
