/*!
Fan-in of archive change notifications
*/

use std::collections::BTreeSet;

use commit_ledger::TimeRange;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tracing::{debug, info};

use crate::archive::Archive;

const EVENT_BUFFER: usize = 1024;

/// A change hint published on one (station, archive) topic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveEvent {
    pub station: String,
    pub archive: String,
    pub range: TimeRange,
}

/// Listen on every distinct topic and forward its hints into one channel.
///
/// Each topic is drained by its own task, which stops once the receiver
/// goes away.
pub fn subscribe<A, I>(archive: &A, topics: I) -> (mpsc::Receiver<ArchiveEvent>, Vec<JoinHandle<()>>)
where
    A: Archive,
    I: IntoIterator<Item = (String, String)>,
{
    let (tx, rx) = mpsc::channel(EVENT_BUFFER);
    let topics: BTreeSet<(String, String)> = topics
        .into_iter()
        .map(|(station, name)| (station.to_lowercase(), name.to_lowercase()))
        .collect();

    let mut tasks = Vec::with_capacity(topics.len());
    for (station, name) in topics {
        let mut hints = archive.listen(&station, &name);
        let tx = tx.clone();
        info!(station = %station, archive = %name, "subscribed to archive notifications");

        tasks.push(tokio::spawn(async move {
            while let Some(range) = hints.next().await {
                let event = ArchiveEvent {
                    station: station.clone(),
                    archive: name.clone(),
                    range,
                };
                if tx.send(event).await.is_err() {
                    debug!(station = %station, archive = %name, "notification receiver closed");
                    break;
                }
            }
        }));
    }
    (rx, tasks)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tempfile::TempDir;

    use super::*;
    use crate::archive::tests::{local, publish_hint};

    #[tokio::test]
    async fn forwards_hints_with_their_topic() {
        let dir = TempDir::new().unwrap();
        let archive = local(dir.path());
        let (mut events, tasks) = subscribe(
            &archive,
            vec![
                ("BND".to_string(), "raw".to_string()),
                ("bnd".to_string(), "RAW".to_string()),
                ("mlo".to_string(), "clean".to_string()),
            ],
        );
        assert_eq!(tasks.len(), 2);

        publish_hint(dir.path(), "mlo", "clean", TimeRange { start: 5, end: 9 });
        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            event,
            ArchiveEvent {
                station: "mlo".to_string(),
                archive: "clean".to_string(),
                range: TimeRange { start: 5, end: 9 },
            }
        );

        drop(events);
        for task in tasks {
            task.abort();
        }
    }
}
