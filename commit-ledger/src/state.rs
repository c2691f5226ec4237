/*!
The on-disk form of a tracker.

The document is rewritten wholesale on every save. There is no migration:
a file written by another schema version is refused.
*/

use serde::{Deserialize, Serialize};

use crate::error::LedgerError;
use crate::ledger::Output;
use crate::range::TimeRange;

pub const STATE_VERSION: u64 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedState {
    pub version: u64,
    pub candidate_scan: i64,
    pub candidates: Vec<TimeRange>,
    pub outputs: Vec<PersistedOutput>,
    pub latest_commit: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedOutput {
    pub start: i64,
    pub end: i64,
    pub committed: bool,
    pub updated: Vec<TimeRange>,
}

impl From<&Output> for PersistedOutput {
    fn from(output: &Output) -> Self {
        Self {
            start: output.range.start,
            end: output.range.end,
            committed: output.committed,
            updated: output.updates.clone(),
        }
    }
}

impl PersistedState {
    /// Parse a state document. The version is checked before anything else so
    /// that a newer layout reports a mismatch rather than a parse failure.
    pub fn from_json(raw: &str) -> Result<Self, LedgerError> {
        let value: serde_json::Value = serde_json::from_str(raw)?;
        let found = value
            .get("version")
            .and_then(serde_json::Value::as_u64)
            .ok_or_else(|| LedgerError::Corrupt("missing version".to_string()))?;
        if found != STATE_VERSION {
            return Err(LedgerError::VersionMismatch {
                found,
                expected: STATE_VERSION,
            });
        }
        let state: PersistedState = serde_json::from_value(value)?;
        state.validate()?;
        Ok(state)
    }

    pub fn to_json(&self) -> Result<String, LedgerError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Check the ordering invariants the tracker relies on.
    pub fn validate(&self) -> Result<(), LedgerError> {
        check_ordered("candidates", &self.candidates, false)?;

        let mut previous_end = i64::MIN;
        for output in &self.outputs {
            if output.start >= output.end {
                return Err(corrupt(format!(
                    "output [{}, {}) is empty",
                    output.start, output.end
                )));
            }
            if output.start < previous_end {
                return Err(corrupt(format!(
                    "output [{}, {}) overlaps its predecessor",
                    output.start, output.end
                )));
            }
            previous_end = output.end;

            check_ordered("updates", &output.updated, true)?;
            if let (Some(first), Some(last)) = (output.updated.first(), output.updated.last()) {
                if first.start < output.start || last.end > output.end {
                    return Err(corrupt(format!(
                        "updates escape output [{}, {})",
                        output.start, output.end
                    )));
                }
            }
        }
        Ok(())
    }
}

fn corrupt(message: String) -> LedgerError {
    LedgerError::Corrupt(message)
}

fn check_ordered(what: &str, ranges: &[TimeRange], allow_touching: bool) -> Result<(), LedgerError> {
    for range in ranges {
        if range.is_empty() {
            return Err(corrupt(format!("{what} contain empty range {range}")));
        }
    }
    for pair in ranges.windows(2) {
        let ordered = if allow_touching {
            pair[0].end <= pair[1].start
        } else {
            pair[0].end < pair[1].start
        };
        if !ordered {
            return Err(corrupt(format!(
                "{what} {} and {} are out of order or overlap",
                pair[0], pair[1]
            )));
        }
    }
    Ok(())
}
