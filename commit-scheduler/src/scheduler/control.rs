/*!
Control plane: a small binary request/reply protocol over a Unix socket.

A request is one command byte, the command's fixed arguments (little-endian
`i64` start and end, plus a flag byte for discard), then three strings each
prefixed with a little-endian `u32` length: station, archive and a key
pattern. The reply is a single status byte.
*/

use std::path::Path;

use chrono::DateTime;
use commit_ledger::{DAY_MS, TimeRange};
use regex::{Regex, RegexBuilder};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::scheduler::controller::TrackerId;

pub const STATUS_OK: u8 = 0;
pub const STATUS_ERROR: u8 = 1;

const MAX_STRING_LEN: u32 = 64 * 1024;

/// Widest window a queue-update or external-commit may cover, since each is
/// split into one output per policy bucket.
pub const MAX_UPDATE_WINDOW_MS: i64 = 100 * 366 * DAY_MS;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCommand {
    QueueUpdate(TimeRange),
    CommitNow,
    ExternalCommit(TimeRange),
    Rescan(TimeRange),
    Suspend,
    Unsuspend,
    Discard {
        range: TimeRange,
        discard_outputs: bool,
    },
}

impl ControlCommand {
    fn code(&self) -> u8 {
        match self {
            ControlCommand::QueueUpdate(_) => 1,
            ControlCommand::CommitNow => 2,
            ControlCommand::ExternalCommit(_) => 3,
            ControlCommand::Rescan(_) => 4,
            ControlCommand::Suspend => 5,
            ControlCommand::Unsuspend => 6,
            ControlCommand::Discard { .. } => 7,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ControlCommand::QueueUpdate(_) => "queue-update",
            ControlCommand::CommitNow => "commit-now",
            ControlCommand::ExternalCommit(_) => "external-commit",
            ControlCommand::Rescan(_) => "rescan",
            ControlCommand::Suspend => "suspend",
            ControlCommand::Unsuspend => "unsuspend",
            ControlCommand::Discard { .. } => "discard",
        }
    }
}

/// Which trackers a request applies to. Station and archive must match
/// exactly; an empty key matches every key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ControlTarget {
    pub station: String,
    pub archive: String,
    /// Case-insensitive regular expression over tracker keys
    pub key: String,
}

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("unknown control command {0}")]
    UnknownCommand(u8),
    #[error("string of {0} bytes exceeds the request limit")]
    StringTooLong(u32),
    #[error("request string is not UTF-8")]
    Utf8(#[from] std::string::FromUtf8Error),
    #[error("invalid range [{start}, {end})")]
    InvalidRange { start: i64, end: i64 },
    #[error("window {0} is too wide for {1}")]
    WindowTooWide(TimeRange, &'static str),
    #[error("invalid key pattern: {0}")]
    Pattern(#[from] regex::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Compiled form of a [`ControlTarget`]
#[derive(Debug, Clone)]
pub struct TargetFilter {
    station: String,
    archive: String,
    key: Option<Regex>,
}

impl TargetFilter {
    pub fn new(target: &ControlTarget) -> Result<Self, ControlError> {
        let key = if target.key.is_empty() {
            None
        } else {
            Some(
                RegexBuilder::new(&target.key)
                    .case_insensitive(true)
                    .build()?,
            )
        };
        Ok(Self {
            station: target.station.clone(),
            archive: target.archive.clone(),
            key,
        })
    }

    pub fn matches(&self, id: &TrackerId) -> bool {
        self.station == id.station
            && self.archive == id.archive
            && self.key.as_ref().is_none_or(|key| key.is_match(&id.key))
    }
}

/// A decoded request waiting for the controller. The controller answers
/// whether any tracker matched and the command was applied.
#[derive(Debug)]
pub struct ControlRequest {
    pub command: ControlCommand,
    pub filter: TargetFilter,
    pub reply: oneshot::Sender<bool>,
}

pub fn encode_request(command: &ControlCommand, target: &ControlTarget) -> Vec<u8> {
    let mut buf = vec![command.code()];
    match command {
        ControlCommand::QueueUpdate(range)
        | ControlCommand::ExternalCommit(range)
        | ControlCommand::Rescan(range) => put_range(&mut buf, *range),
        ControlCommand::Discard {
            range,
            discard_outputs,
        } => {
            put_range(&mut buf, *range);
            buf.push(u8::from(*discard_outputs));
        }
        ControlCommand::CommitNow | ControlCommand::Suspend | ControlCommand::Unsuspend => {}
    }
    for field in [&target.station, &target.archive, &target.key] {
        buf.extend_from_slice(&(field.len() as u32).to_le_bytes());
        buf.extend_from_slice(field.as_bytes());
    }
    buf
}

fn put_range(buf: &mut Vec<u8>, range: TimeRange) {
    buf.extend_from_slice(&range.start.to_le_bytes());
    buf.extend_from_slice(&range.end.to_le_bytes());
}

pub async fn read_request<R>(reader: &mut R) -> Result<(ControlCommand, ControlTarget), ControlError>
where
    R: AsyncRead + Unpin,
{
    let code = reader.read_u8().await?;
    let command = match code {
        1 => ControlCommand::QueueUpdate(read_range(reader).await?),
        2 => ControlCommand::CommitNow,
        3 => ControlCommand::ExternalCommit(read_range(reader).await?),
        4 => ControlCommand::Rescan(read_range(reader).await?),
        5 => ControlCommand::Suspend,
        6 => ControlCommand::Unsuspend,
        7 => {
            let range = read_range(reader).await?;
            let discard_outputs = reader.read_u8().await? != 0;
            ControlCommand::Discard {
                range,
                discard_outputs,
            }
        }
        other => return Err(ControlError::UnknownCommand(other)),
    };
    if let ControlCommand::QueueUpdate(range) | ControlCommand::ExternalCommit(range) = command {
        if range.duration_ms() > MAX_UPDATE_WINDOW_MS {
            return Err(ControlError::WindowTooWide(range, command.name()));
        }
    }
    let target = ControlTarget {
        station: read_string(reader).await?,
        archive: read_string(reader).await?,
        key: read_string(reader).await?,
    };
    Ok((command, target))
}

async fn read_range<R: AsyncRead + Unpin>(reader: &mut R) -> Result<TimeRange, ControlError> {
    let start = reader.read_i64_le().await?;
    let end = reader.read_i64_le().await?;
    let on_calendar = |ms: i64| DateTime::from_timestamp_millis(ms).is_some();
    if !on_calendar(start) || !on_calendar(end) {
        return Err(ControlError::InvalidRange { start, end });
    }
    TimeRange::new(start, end).map_err(|_| ControlError::InvalidRange { start, end })
}

async fn read_string<R: AsyncRead + Unpin>(reader: &mut R) -> Result<String, ControlError> {
    let len = reader.read_u32_le().await?;
    if len > MAX_STRING_LEN {
        return Err(ControlError::StringTooLong(len));
    }
    let mut bytes = vec![0; len as usize];
    reader.read_exact(&mut bytes).await?;
    Ok(String::from_utf8(bytes)?)
}

/// Accept control connections until the listener fails. Each connection
/// carries one request.
pub async fn serve(listener: UnixListener, requests: mpsc::Sender<ControlRequest>) {
    loop {
        let stream = match listener.accept().await {
            Ok((stream, _)) => stream,
            Err(err) => {
                warn!(error = %err, "control socket accept failed");
                continue;
            }
        };
        let requests = requests.clone();
        tokio::spawn(async move {
            if let Err(err) = handle_connection(stream, requests).await {
                debug!(error = %err, "control connection failed");
            }
        });
    }
}

async fn handle_connection(
    mut stream: UnixStream,
    requests: mpsc::Sender<ControlRequest>,
) -> Result<(), ControlError> {
    let status = match read_request(&mut stream).await {
        Ok((command, target)) => dispatch(command, &target, &requests).await,
        Err(ControlError::Io(err)) => return Err(ControlError::Io(err)),
        Err(err) => {
            warn!(error = %err, "rejected control request");
            STATUS_ERROR
        }
    };
    stream.write_u8(status).await?;
    stream.flush().await?;
    Ok(())
}

async fn dispatch(
    command: ControlCommand,
    target: &ControlTarget,
    requests: &mpsc::Sender<ControlRequest>,
) -> u8 {
    let filter = match TargetFilter::new(target) {
        Ok(filter) => filter,
        Err(err) => {
            warn!(error = %err, "rejected control request");
            return STATUS_ERROR;
        }
    };
    info!(
        command = command.name(),
        station = %target.station,
        archive = %target.archive,
        key = %target.key,
        "control request"
    );

    let (reply, answer) = oneshot::channel();
    let request = ControlRequest {
        command,
        filter,
        reply,
    };
    if requests.send(request).await.is_err() {
        return STATUS_ERROR;
    }
    match answer.await {
        Ok(true) => STATUS_OK,
        _ => STATUS_ERROR,
    }
}

/// Send one request and report whether the scheduler accepted it.
pub async fn send_request(
    socket: &Path,
    command: &ControlCommand,
    target: &ControlTarget,
) -> Result<bool, ControlError> {
    let mut stream = UnixStream::connect(socket).await?;
    stream.write_all(&encode_request(command, target)).await?;
    stream.flush().await?;
    Ok(stream.read_u8().await? == STATUS_OK)
}
