/*!
Commit scheduler daemon and its control client
*/

use std::path::{Path, PathBuf};

use chrono::DateTime;
use clap::{Arg, ArgAction, ArgMatches, Command, crate_version};
use commit_ledger::TimeRange;
use tokio::net::UnixListener;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

use crate::archive::LocalArchive;
use crate::scheduler::config::SchedulerConfig;
use crate::scheduler::control::{self, ControlCommand, ControlTarget};
use crate::scheduler::controller::Controller;
use crate::scheduler::event_system::subscribe;

mod archive;
mod scheduler;

const CONTROL_BUFFER: usize = 64;

fn init_tracing() {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info".into());
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .init();
}

fn cli() -> Command {
    let time_arg = |name: &'static str| {
        Arg::new(name)
            .long(name)
            .value_name("TIME")
            .help("Epoch milliseconds or an RFC 3339 timestamp")
    };

    Command::new("commit-scheduler")
        .version(crate_version!())
        .about("Decides when archive export outputs need to be regenerated")
        .subcommand_required(true)
        .subcommand(
            Command::new("run").about("Run the scheduler").arg(
                Arg::new("config")
                    .short('c')
                    .long("config")
                    .help("Path to the TOML configuration")
                    .value_name("PATH")
                    .required(true),
            ),
        )
        .subcommand(
            Command::new("control")
                .about("Send a request to a running scheduler")
                .arg(
                    Arg::new("command")
                        .required(true)
                        .value_parser([
                            "queue-update",
                            "commit-now",
                            "external-commit",
                            "rescan",
                            "suspend",
                            "unsuspend",
                            "discard",
                        ]),
                )
                .arg(
                    Arg::new("socket")
                        .short('s')
                        .long("socket")
                        .help("Control socket of the scheduler")
                        .value_name("PATH")
                        .required(true),
                )
                .arg(
                    Arg::new("station")
                        .long("station")
                        .value_name("STATION")
                        .required(true),
                )
                .arg(
                    Arg::new("archive")
                        .long("archive")
                        .value_name("ARCHIVE")
                        .required(true),
                )
                .arg(
                    Arg::new("key")
                        .long("key")
                        .value_name("PATTERN")
                        .help("Case-insensitive pattern over tracker keys"),
                )
                .arg(time_arg("start"))
                .arg(time_arg("end"))
                .arg(
                    Arg::new("discard-outputs")
                        .long("discard-outputs")
                        .help("Also delete outputs overlapping the window")
                        .action(ArgAction::SetTrue),
                ),
        )
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    match cli().get_matches().subcommand() {
        Some(("run", matches)) => run(matches).await,
        Some(("control", matches)) => send_control(matches).await,
        _ => Ok(()),
    }
}

async fn run(matches: &ArgMatches) -> Result<(), Box<dyn std::error::Error>> {
    let config_path = matches
        .get_one::<String>("config")
        .map(PathBuf::from)
        .ok_or("missing --config")?;
    let config = SchedulerConfig::from_file(&config_path).await?;
    info!(config = %config_path.display(), trackers = config.trackers.len(), "configuration loaded");

    match fdlimit::raise_fd_limit() {
        Ok(fdlimit::Outcome::LimitRaised { from, to }) => {
            info!(from, to, "raised file descriptor limit")
        }
        Ok(fdlimit::Outcome::Unsupported) => {}
        Err(err) => warn!(error = %err, "could not raise file descriptor limit"),
    }

    let controller = Controller::from_config(&config, LocalArchive::new(&config.archive)).await?;
    let (events, listeners) = subscribe(controller.archive(), controller.topics());

    let (control_tx, control_rx) = mpsc::channel(CONTROL_BUFFER);
    let server = match &config.scheduler.control_socket {
        Some(path) => {
            let listener = bind_control_socket(path)?;
            info!(socket = %path.display(), "control socket listening");
            Some(tokio::spawn(control::serve(listener, control_tx)))
        }
        None => None,
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("shutdown requested");
        let _ = shutdown_tx.send(true);
    });

    controller.run(events, control_rx, shutdown_rx).await;

    for listener in listeners {
        listener.abort();
    }
    if let Some(server) = server {
        server.abort();
    }
    if let Some(path) = &config.scheduler.control_socket {
        let _ = std::fs::remove_file(path);
    }
    Ok(())
}

/// Bind the control socket, replacing a socket file left behind by an
/// earlier process.
fn bind_control_socket(path: &Path) -> std::io::Result<UnixListener> {
    match std::fs::remove_file(path) {
        Ok(()) => warn!(socket = %path.display(), "removed stale control socket"),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => return Err(err),
    }
    UnixListener::bind(path)
}

async fn wait_for_signal() {
    let mut terminate =
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(stream) => Some(stream),
            Err(err) => {
                warn!(error = %err, "cannot listen for SIGTERM");
                None
            }
        };
    let terminated = async {
        match terminate.as_mut() {
            Some(stream) => stream.recv().await,
            None => None,
        }
    };

    tokio::select! {
        Ok(()) = tokio::signal::ctrl_c() => {}
        Some(()) = terminated => {}
        else => {
            error!("no shutdown signal can be received, running until killed");
            std::future::pending::<()>().await;
        }
    }
}

async fn send_control(matches: &ArgMatches) -> Result<(), Box<dyn std::error::Error>> {
    let socket = matches
        .get_one::<String>("socket")
        .map(PathBuf::from)
        .ok_or("missing --socket")?;
    let name = matches
        .get_one::<String>("command")
        .map(String::as_str)
        .unwrap_or_default();
    let text = |arg: &str| matches.get_one::<String>(arg).cloned().unwrap_or_default();
    let target = ControlTarget {
        station: text("station"),
        archive: text("archive"),
        key: text("key"),
    };
    let window = || -> Result<TimeRange, Box<dyn std::error::Error>> {
        let start = parse_time(matches.get_one::<String>("start").ok_or("--start is required")?)?;
        let end = parse_time(matches.get_one::<String>("end").ok_or("--end is required")?)?;
        Ok(TimeRange::new(start, end)?)
    };

    let command = match name {
        "queue-update" => ControlCommand::QueueUpdate(window()?),
        "commit-now" => ControlCommand::CommitNow,
        "external-commit" => ControlCommand::ExternalCommit(window()?),
        "rescan" => ControlCommand::Rescan(window()?),
        "suspend" => ControlCommand::Suspend,
        "unsuspend" => ControlCommand::Unsuspend,
        "discard" => ControlCommand::Discard {
            range: window()?,
            discard_outputs: matches.get_flag("discard-outputs"),
        },
        other => return Err(format!("unknown command {other}").into()),
    };

    if control::send_request(&socket, &command, &target).await? {
        println!("ok");
        Ok(())
    } else {
        Err(format!("{} rejected by the scheduler", command.name()).into())
    }
}

/// Epoch milliseconds or RFC 3339.
fn parse_time(raw: &str) -> Result<i64, Box<dyn std::error::Error>> {
    if let Ok(ms) = raw.trim().parse::<i64>() {
        return Ok(ms);
    }
    Ok(DateTime::parse_from_rfc3339(raw.trim())?.timestamp_millis())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_both_time_forms() {
        assert_eq!(parse_time("1704067200000").unwrap(), 1_704_067_200_000);
        assert_eq!(parse_time("2024-01-01T00:00:00Z").unwrap(), 1_704_067_200_000);
        assert_eq!(parse_time("2024-01-01T01:00:00+01:00").unwrap(), 1_704_067_200_000);
        assert!(parse_time("yesterday").is_err());
    }

    #[test]
    fn control_arguments_parse() {
        let matches = cli().get_matches_from([
            "commit-scheduler",
            "control",
            "discard",
            "--socket",
            "/tmp/s.sock",
            "--station",
            "bnd",
            "--archive",
            "raw",
            "--key",
            "^ebas",
            "--start",
            "0",
            "--end",
            "2024-01-01T00:00:00Z",
            "--discard-outputs",
        ]);
        let (name, sub) = matches.subcommand().unwrap();
        assert_eq!(name, "control");
        assert_eq!(sub.get_one::<String>("command").unwrap(), "discard");
        assert!(sub.get_flag("discard-outputs"));
        assert_eq!(sub.get_one::<String>("key").unwrap(), "^ebas");
        assert_eq!(sub.get_one::<String>("station").unwrap(), "bnd");

        let missing_station =
            cli().try_get_matches_from(["commit-scheduler", "control", "suspend", "--socket", "/tmp/s.sock"]);
        assert!(missing_station.is_err());
    }

    #[test]
    fn cli_is_well_formed() {
        cli().debug_assert();
    }
}
