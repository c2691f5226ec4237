/*!
Commit actions that materialize ready outputs downstream
*/

use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use commit_ledger::{BoxError, CommitAction, Output};
use rusqlite::Connection;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::scheduler::config::ActionConfig;
use crate::scheduler::controller::TrackerId;

/// What every action reports about a committed output.
#[derive(Debug, Clone, Serialize)]
pub struct CommitRecord {
    pub station: String,
    pub archive: String,
    pub key: String,
    pub start: i64,
    pub end: i64,
    pub start_time: String,
    pub end_time: String,
    /// The output had been committed before and this is a reissue
    pub recommit: bool,
    pub committed_at: String,
}

impl CommitRecord {
    pub fn new(id: &TrackerId, output: &Output) -> Self {
        Self {
            station: id.station.clone(),
            archive: id.archive.clone(),
            key: id.key.clone(),
            start: output.range.start,
            end: output.range.end,
            start_time: format_millis(output.range.start),
            end_time: format_millis(output.range.end),
            recommit: output.committed,
            committed_at: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        }
    }
}

/// RFC 3339, or the raw number when it is outside chrono's range.
fn format_millis(ms: i64) -> String {
    DateTime::from_timestamp_millis(ms)
        .map(|time| time.to_rfc3339_opts(SecondsFormat::Millis, true))
        .unwrap_or_else(|| ms.to_string())
}

/// Build the action a tracker is configured with.
pub fn build_action(
    config: &ActionConfig,
    id: &TrackerId,
) -> Result<Box<dyn CommitAction>, Box<dyn std::error::Error>> {
    let action: Box<dyn CommitAction> = match config {
        ActionConfig::Command { program, args } => Box::new(CommandAction {
            id: id.clone(),
            program: program.clone(),
            args: args.clone(),
        }),
        ActionConfig::Webhook { url, auth_token } => Box::new(WebhookAction {
            id: id.clone(),
            url: url.clone(),
            auth_token: auth_token.clone(),
            client: reqwest::Client::new(),
        }),
        ActionConfig::Sqlite { path, table_name } => {
            if !valid_table_name(table_name) {
                return Err(format!("invalid table name {table_name:?}").into());
            }
            Box::new(SqliteAction {
                id: id.clone(),
                path: path.clone(),
                table_name: table_name.clone(),
            })
        }
        ActionConfig::Json { path, pretty } => Box::new(JsonAction {
            id: id.clone(),
            path: path.clone(),
            pretty: *pretty,
        }),
    };
    info!(tracker = %id, action = action.name(), "commit action ready");
    Ok(action)
}

fn valid_table_name(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        && name.len() <= 63
}

/// Runs a program per output. The placeholders `{station}`, `{archive}`,
/// `{key}`, `{start}`, `{end}`, `{start_time}` and `{end_time}` are replaced
/// in each argument.
pub struct CommandAction {
    id: TrackerId,
    program: String,
    args: Vec<String>,
}

impl CommandAction {
    fn expand(&self, record: &CommitRecord) -> Vec<String> {
        self.args
            .iter()
            .map(|arg| {
                arg.replace("{station}", &record.station)
                    .replace("{archive}", &record.archive)
                    .replace("{key}", &record.key)
                    .replace("{start_time}", &record.start_time)
                    .replace("{end_time}", &record.end_time)
                    .replace("{start}", &record.start.to_string())
                    .replace("{end}", &record.end.to_string())
            })
            .collect()
    }
}

#[async_trait]
impl CommitAction for CommandAction {
    fn name(&self) -> &'static str {
        "command"
    }

    async fn commit(&self, output: &Output) -> Result<(), BoxError> {
        let record = CommitRecord::new(&self.id, output);
        let args = self.expand(&record);
        debug!(program = %self.program, ?args, "running commit command");

        let status = tokio::process::Command::new(&self.program)
            .args(&args)
            .kill_on_drop(true)
            .status()
            .await?;
        if !status.success() {
            return Err(format!("{} exited with {}", self.program, status).into());
        }
        Ok(())
    }
}

/// Posts each commit record as JSON.
pub struct WebhookAction {
    id: TrackerId,
    url: String,
    auth_token: Option<String>,
    client: reqwest::Client,
}

#[async_trait]
impl CommitAction for WebhookAction {
    fn name(&self) -> &'static str {
        "webhook"
    }

    async fn commit(&self, output: &Output) -> Result<(), BoxError> {
        let mut request = self.client.post(&self.url);
        if let Some(token) = &self.auth_token {
            request = request.header("Authorization", format!("Bearer {token}"));
        }

        let response = request
            .json(&CommitRecord::new(&self.id, output))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(format!("webhook delivery failed: {}", response.status()).into());
        }
        Ok(())
    }
}

/// Appends one row per commit to a SQLite table.
pub struct SqliteAction {
    id: TrackerId,
    path: PathBuf,
    table_name: String,
}

#[async_trait]
impl CommitAction for SqliteAction {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    async fn commit(&self, output: &Output) -> Result<(), BoxError> {
        let record = CommitRecord::new(&self.id, output);
        let path = self.path.clone();
        let table = self.table_name.clone();

        tokio::task::spawn_blocking(move || -> Result<(), rusqlite::Error> {
            let conn = Connection::open(&path)?;
            conn.execute(
                &format!(
                    r#"
                    CREATE TABLE IF NOT EXISTS {table} (
                        id INTEGER PRIMARY KEY,
                        station TEXT NOT NULL,
                        archive TEXT NOT NULL,
                        output_key TEXT NOT NULL,
                        start_ms INTEGER NOT NULL,
                        end_ms INTEGER NOT NULL,
                        recommit INTEGER NOT NULL,
                        committed_at TEXT NOT NULL
                    )
                    "#
                ),
                [],
            )?;
            conn.execute(
                &format!(
                    "INSERT INTO {table} (station, archive, output_key, start_ms, end_ms, recommit, committed_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"
                ),
                (
                    &record.station,
                    &record.archive,
                    &record.key,
                    record.start,
                    record.end,
                    record.recommit,
                    &record.committed_at,
                ),
            )?;
            Ok(())
        })
        .await??;
        Ok(())
    }
}

/// Appends commit records to a JSON lines file.
pub struct JsonAction {
    id: TrackerId,
    path: PathBuf,
    pretty: bool,
}

#[async_trait]
impl CommitAction for JsonAction {
    fn name(&self) -> &'static str {
        "json"
    }

    async fn commit(&self, output: &Output) -> Result<(), BoxError> {
        let record = CommitRecord::new(&self.id, output);
        let mut line = if self.pretty {
            serde_json::to_string_pretty(&record)?
        } else {
            serde_json::to_string(&record)?
        };
        line.push('\n');

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}
