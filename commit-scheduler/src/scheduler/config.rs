/*!
Configuration management for the commit scheduler
*/

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use commit_ledger::{
    DEFAULT_SCAN_OVERLAP_MS, FileInspectionPolicy, Granularity, HOUR_MS, NearRealTimePolicy,
    Policy, YearlyPolicy,
};
use serde::{Deserialize, Serialize};

use crate::scheduler::controller::TrackerId;
use crate::scheduler::state_manager::StateStore;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SchedulerConfig {
    /// Archive access settings
    #[serde(default)]
    pub archive: ArchiveConfig,
    /// Tracker state persistence settings
    #[serde(default)]
    pub state: StateConfig,
    /// Scheduling loop behaviour
    #[serde(default)]
    pub scheduler: SchedulerSettings,
    /// One entry per downstream output key
    #[serde(default)]
    pub trackers: Vec<TrackerConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ArchiveConfig {
    /// Root directory of the local archive
    pub root: PathBuf,
    /// Notification log polling interval in milliseconds
    pub poll_interval_ms: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StateConfig {
    /// Directory holding one state document per tracker
    pub directory: PathBuf,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SchedulerSettings {
    /// Quiet period after the last notification before candidates are processed
    pub process_delay_ms: u64,
    /// Upper bound on how long continuous notifications may postpone processing
    pub max_process_delay_ms: u64,
    /// Idle wakeup and status log period
    pub heartbeat_interval_ms: u64,
    /// Commit every tracker on each pass instead of only on request
    pub auto_commit: bool,
    /// Unix socket for the control plane
    pub control_socket: Option<PathBuf>,
    /// Slack subtracted when advancing the candidate scan watermark
    pub scan_overlap_ms: i64,
    pub lock_retry_initial_ms: u64,
    pub lock_retry_max_ms: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TrackerConfig {
    pub station: String,
    pub archive: String,
    /// Logical output key, unique per station
    pub key: String,
    #[serde(default)]
    pub policy: PolicyConfig,
    /// Which archive files count as changes for this output
    #[serde(default)]
    pub selection: SelectionConfig,
    pub action: ActionConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PolicyConfig {
    FileInspection {
        #[serde(default)]
        granularity: Granularity,
    },
    Yearly,
    NearRealTime {
        #[serde(default = "default_maximum_age_hours")]
        maximum_age_hours: u32,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct SelectionConfig {
    /// Every one of these tags must be present on a file
    pub required_tags: Vec<String>,
    /// None of these tags may be present on a file
    pub excluded_tags: Vec<String>,
    pub instrument_id: Option<String>,
    pub instrument_type: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ActionConfig {
    /// Run a program; `{station}`, `{archive}`, `{key}`, `{start}` and `{end}`
    /// are substituted in the arguments
    Command { program: String, args: Vec<String> },
    Webhook { url: String, auth_token: Option<String> },
    Sqlite { path: PathBuf, table_name: String },
    Json { path: PathBuf, pretty: bool },
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("./archive"),
            poll_interval_ms: 1000,
        }
    }
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("./state"),
        }
    }
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            process_delay_ms: 30_000,
            max_process_delay_ms: 600_000,
            heartbeat_interval_ms: 60_000,
            auto_commit: true,
            control_socket: None,
            scan_overlap_ms: DEFAULT_SCAN_OVERLAP_MS,
            lock_retry_initial_ms: 250,
            lock_retry_max_ms: 30_000,
        }
    }
}

impl Default for PolicyConfig {
    fn default() -> Self {
        PolicyConfig::FileInspection {
            granularity: Granularity::default(),
        }
    }
}

fn default_maximum_age_hours() -> u32 {
    48
}

impl PolicyConfig {
    pub fn policy(&self) -> Policy {
        match self {
            PolicyConfig::FileInspection { granularity } => {
                Policy::FileInspection(FileInspectionPolicy {
                    granularity: *granularity,
                })
            }
            PolicyConfig::Yearly => Policy::Yearly(YearlyPolicy),
            PolicyConfig::NearRealTime { maximum_age_hours } => {
                Policy::NearRealTime(NearRealTimePolicy {
                    maximum_age_ms: i64::from(*maximum_age_hours) * HOUR_MS,
                })
            }
        }
    }
}

impl SchedulerSettings {
    pub fn process_delay(&self) -> Duration {
        Duration::from_millis(self.process_delay_ms)
    }

    pub fn max_process_delay(&self) -> Duration {
        Duration::from_millis(self.max_process_delay_ms.max(self.process_delay_ms))
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms.max(1))
    }
}

impl SchedulerConfig {
    /// Load and validate a TOML configuration file
    pub async fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, Box<dyn std::error::Error>> {
        let content = tokio::fs::read_to_string(path).await?;
        let config: SchedulerConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), String> {
        let store = StateStore::new(&self.state);
        let mut seen = HashSet::new();
        for tracker in &self.trackers {
            if tracker.station.trim().is_empty() || tracker.key.trim().is_empty() {
                return Err("tracker station and key must not be empty".to_string());
            }
            if tracker.archive.trim().is_empty() {
                return Err(format!("tracker {} has no archive", tracker.key));
            }
            let id = TrackerId::new(&tracker.station, &tracker.archive, &tracker.key);
            let path = store.path_for(&id);
            if !seen.insert(path.clone()) {
                return Err(format!(
                    "tracker {id} shares the state file {} with an earlier tracker",
                    path.display()
                ));
            }
        }
        Ok(())
    }
}
