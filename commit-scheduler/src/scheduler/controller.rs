/*!
The scheduling loop that owns every tracker.

All tracker state is mutated here, on one task. Archive notifications and
control requests arrive over channels and are applied between passes; a
pass verifies queued candidates once notifications have settled and then
offers ready outputs to each tracker's commit action.
*/

use std::fmt;
use std::time::{Duration, Instant};

use chrono::Utc;
use commit_ledger::{CommitAction, Tracker};
use tokio::sync::{mpsc, watch};
use tracing::{Instrument, Span, debug, error, info, info_span, warn};

use crate::archive::Archive;
use crate::scheduler::config::{SchedulerConfig, SchedulerSettings, SelectionConfig};
use crate::scheduler::control::{ControlCommand, ControlRequest};
use crate::scheduler::detection_engine::{Backoff, FileInspector};
use crate::scheduler::event_system::ArchiveEvent;
use crate::scheduler::output_plugins::build_action;
use crate::scheduler::state_manager::StateStore;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TrackerId {
    pub station: String,
    pub archive: String,
    pub key: String,
}

impl TrackerId {
    pub fn new(station: impl Into<String>, archive: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            station: station.into(),
            archive: archive.into(),
            key: key.into(),
        }
    }

    fn listens_to(&self, event: &ArchiveEvent) -> bool {
        self.station.eq_ignore_ascii_case(&event.station)
            && self.archive.eq_ignore_ascii_case(&event.archive)
    }
}

impl fmt::Display for TrackerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.station, self.key)
    }
}

/// A tracker together with everything needed to drive it
pub struct TrackerSlot {
    id: TrackerId,
    tracker: Tracker,
    selection: SelectionConfig,
    action: Box<dyn CommitAction>,
    suspended: bool,
    commit_requested: bool,
    /// Candidates queued since the last save
    unsaved: bool,
}

impl TrackerSlot {
    pub fn new(
        id: TrackerId,
        tracker: Tracker,
        selection: SelectionConfig,
        action: Box<dyn CommitAction>,
    ) -> Self {
        Self {
            id,
            tracker,
            selection,
            action,
            suspended: false,
            commit_requested: false,
            unsaved: false,
        }
    }

    fn span(&self) -> Span {
        info_span!(
            "tracker",
            station = %self.id.station,
            archive = %self.id.archive,
            key = %self.id.key
        )
    }
}

pub struct Controller<A: Archive> {
    archive: A,
    store: StateStore,
    settings: SchedulerSettings,
    backoff: Backoff,
    slots: Vec<TrackerSlot>,
    /// Most recent accepted notification since the last processing pass
    last_notification: Option<Instant>,
    /// First accepted notification since the last processing pass
    first_pending: Option<Instant>,
    last_process: Instant,
    last_heartbeat: Instant,
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

impl<A: Archive> Controller<A> {
    pub fn new(archive: A, store: StateStore, settings: SchedulerSettings, slots: Vec<TrackerSlot>) -> Self {
        let started = Instant::now();
        Self {
            archive,
            store,
            backoff: Backoff::from_settings(&settings),
            settings,
            slots,
            last_notification: None,
            first_pending: None,
            last_process: started,
            last_heartbeat: started,
        }
    }

    /// Build every configured tracker. A tracker whose saved state cannot be
    /// loaded or whose action cannot be built is skipped; having none left
    /// is an error.
    pub async fn from_config(config: &SchedulerConfig, archive: A) -> Result<Self, Box<dyn std::error::Error>> {
        let store = StateStore::new(&config.state);
        let mut slots = Vec::with_capacity(config.trackers.len());

        for entry in &config.trackers {
            let id = TrackerId::new(&entry.station, &entry.archive, &entry.key);
            let policy = entry.policy.policy();
            let tracker = match store
                .load(&id, policy, config.scheduler.scan_overlap_ms)
                .await
            {
                Ok(tracker) => tracker,
                Err(err) => {
                    error!(tracker = %id, error = %err, "failed to load tracker state, skipping tracker");
                    continue;
                }
            };
            let action = match build_action(&entry.action, &id) {
                Ok(action) => action,
                Err(err) => {
                    error!(tracker = %id, error = %err, "invalid commit action, skipping tracker");
                    continue;
                }
            };
            info!(
                tracker = %id,
                policy = policy.name(),
                candidates = tracker.candidates().len(),
                latest_commit = tracker.latest_commit(),
                "tracker loaded"
            );
            slots.push(TrackerSlot::new(id, tracker, entry.selection.clone(), action));
        }

        if slots.is_empty() {
            return Err("no trackers could be started".into());
        }
        Ok(Self::new(archive, store, config.scheduler.clone(), slots))
    }

    pub fn archive(&self) -> &A {
        &self.archive
    }

    /// Distinct (station, archive) topics the trackers listen on
    pub fn topics(&self) -> Vec<(String, String)> {
        self.slots
            .iter()
            .map(|slot| (slot.id.station.clone(), slot.id.archive.clone()))
            .collect()
    }

    /// Run until `shutdown` flips or its sender goes away, then persist
    /// every tracker synchronously.
    pub async fn run(
        mut self,
        mut events: mpsc::Receiver<ArchiveEvent>,
        mut control: mpsc::Receiver<ControlRequest>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!(trackers = self.slots.len(), auto_commit = self.settings.auto_commit, "scheduler started");

        loop {
            let wait = self.next_wakeup(Instant::now());
            let request = tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                Some(event) = events.recv() => {
                    self.accept_event(&event);
                    None
                }
                Some(request) = control.recv() => Some(request),
                _ = tokio::time::sleep(wait) => None,
            };

            // Rescans and processing passes may sit in lock backoff. A pass
            // cut short here leaves its candidates queued; an interrupted
            // control request is answered with an error.
            tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                _ = self.work(request, &mut events, &mut control) => {}
            }
        }

        self.shutdown(&mut events);
    }

    async fn work(
        &mut self,
        request: Option<ControlRequest>,
        events: &mut mpsc::Receiver<ArchiveEvent>,
        control: &mut mpsc::Receiver<ControlRequest>,
    ) {
        while let Ok(event) = events.try_recv() {
            self.accept_event(&event);
        }
        self.save_unsaved().await;

        if let Some(request) = request {
            self.handle_control(request).await;
        }
        while let Ok(request) = control.try_recv() {
            self.handle_control(request).await;
        }

        self.step(Instant::now()).await;
    }

    fn next_wakeup(&self, now: Instant) -> Duration {
        let heartbeat = self.settings.heartbeat_interval();
        let mut due = self.last_heartbeat + heartbeat;
        if let Some(process_at) = self.processing_deadline() {
            due = due.min(process_at);
        }
        due.saturating_duration_since(now)
    }

    fn processing_deadline(&self) -> Option<Instant> {
        match (self.last_notification, self.first_pending) {
            (Some(last), Some(first)) => Some(
                (last + self.settings.process_delay()).min(first + self.settings.max_process_delay()),
            ),
            _ if self.slots.iter().any(|slot| !slot.tracker.candidates().is_empty()) => {
                Some(self.last_process + self.settings.process_delay())
            }
            _ => None,
        }
    }

    async fn step(&mut self, now: Instant) {
        if self
            .processing_deadline()
            .is_some_and(|deadline| deadline <= now)
        {
            self.last_notification = None;
            self.first_pending = None;
            self.last_process = now;
            self.process_all(now_ms()).await;
        }

        self.commit_all(now_ms()).await;

        if now.duration_since(self.last_heartbeat) >= self.settings.heartbeat_interval() {
            self.last_heartbeat = now;
            self.heartbeat(now_ms());
        }
    }

    /// Queue `event` on every tracker listening to its topic. Nothing is
    /// written to disk here.
    fn accept_event(&mut self, event: &ArchiveEvent) {
        let mut accepted = false;
        for slot in self.slots.iter_mut() {
            if slot.suspended || !slot.id.listens_to(event) {
                continue;
            }
            accepted = true;
            if slot.tracker.notify_candidate(event.range) {
                debug!(tracker = %slot.id, start = event.range.start, end = event.range.end, "candidate queued");
                slot.unsaved = true;
            }
        }

        if accepted {
            let now = Instant::now();
            self.last_notification = Some(now);
            if self.first_pending.is_none() {
                self.first_pending = Some(now);
            }
        }
    }

    async fn save_unsaved(&mut self) {
        for slot in self.slots.iter_mut().filter(|slot| slot.unsaved) {
            slot.unsaved = false;
            save(&self.store, slot, false).await;
        }
    }

    async fn handle_control(&mut self, request: ControlRequest) {
        let ControlRequest {
            command,
            filter,
            reply,
        } = request;
        let now = now_ms();
        let archive = &self.archive;
        let store = &self.store;
        let backoff = self.backoff;
        let mut matched = false;

        for slot in self.slots.iter_mut().filter(|slot| filter.matches(&slot.id)) {
            matched = true;
            let span = slot.span();
            apply_command(slot, command, archive, store, backoff, now)
                .instrument(span)
                .await;
        }

        if !matched {
            warn!(command = command.name(), "control request matched no tracker");
        }
        let _ = reply.send(matched);
    }

    async fn process_all(&mut self, now: i64) {
        let archive = &self.archive;
        let store = &self.store;
        let backoff = self.backoff;

        for slot in self.slots.iter_mut() {
            if slot.tracker.candidates().is_empty() {
                continue;
            }
            let span = slot.span();
            process_slot(slot, archive, store, backoff, now)
                .instrument(span)
                .await;
        }
    }

    async fn commit_all(&mut self, now: i64) {
        let store = &self.store;
        let auto_commit = self.settings.auto_commit;

        for slot in self.slots.iter_mut() {
            if !auto_commit && !slot.commit_requested {
                continue;
            }
            slot.commit_requested = false;
            let span = slot.span();
            commit_slot(slot, store, now).instrument(span).await;
        }
    }

    fn heartbeat(&self, now: i64) {
        for slot in &self.slots {
            info!(
                station = %slot.id.station,
                archive = %slot.id.archive,
                key = %slot.id.key,
                candidates = slot.tracker.candidates().len(),
                outputs = slot.tracker.outputs(now).count(),
                latest_commit = slot.tracker.latest_commit(),
                suspended = slot.suspended,
                "tracker status"
            );
        }
    }

    /// Fold in whatever notifications are already queued, then write every
    /// tracker to disk.
    fn shutdown(&mut self, events: &mut mpsc::Receiver<ArchiveEvent>) {
        while let Ok(event) = events.try_recv() {
            self.accept_event(&event);
        }

        for slot in &self.slots {
            if let Err(err) = self.store.save_blocking(&slot.id, &slot.tracker) {
                error!(tracker = %slot.id, error = %err, "failed to save tracker state on shutdown");
            }
        }
        info!("scheduler stopped");
    }
}

async fn save(store: &StateStore, slot: &TrackerSlot, durable: bool) {
    if let Err(err) = store.save(&slot.id, &slot.tracker, durable).await {
        error!(tracker = %slot.id, error = %err, "failed to save tracker state");
    }
}

async fn process_slot<A: Archive>(
    slot: &mut TrackerSlot,
    archive: &A,
    store: &StateStore,
    backoff: Backoff,
    now: i64,
) {
    let mut inspector = FileInspector::new(
        archive,
        &slot.id.station,
        &slot.id.archive,
        &slot.selection,
        backoff,
    );
    match slot.tracker.process_candidates(&mut inspector, now).await {
        Ok(summary) => info!(
            candidates = summary.candidates,
            updates = summary.updates,
            "candidates verified"
        ),
        Err(err) => warn!(
            error = %err,
            pending = slot.tracker.candidates().len(),
            "verification failed, candidates kept for the next pass"
        ),
    }
    // Updates from candidates verified before a failure are kept too.
    save(store, slot, true).await;
}

async fn commit_slot(slot: &mut TrackerSlot, store: &StateStore, now: i64) {
    let summary = slot.tracker.commit(slot.action.as_ref(), now).await;
    if summary.committed > 0 || summary.failed > 0 {
        debug!(
            committed = summary.committed,
            failed = summary.failed,
            expired = summary.expired,
            "commit pass"
        );
    }
    if summary.committed > 0 || summary.expired > 0 {
        save(store, slot, true).await;
    }
}

async fn apply_command<A: Archive>(
    slot: &mut TrackerSlot,
    command: ControlCommand,
    archive: &A,
    store: &StateStore,
    backoff: Backoff,
    now: i64,
) {
    let changed = match command {
        ControlCommand::QueueUpdate(range) => {
            info!(start = range.start, end = range.end, "update queued");
            slot.tracker.notify_update(range, now)
        }
        ControlCommand::CommitNow => {
            slot.commit_requested = true;
            false
        }
        ControlCommand::ExternalCommit(range) => {
            info!(start = range.start, end = range.end, "external commit recorded");
            slot.tracker.notify_external_commit(range, now)
        }
        ControlCommand::Rescan(range) => {
            let mut inspector = FileInspector::new(
                archive,
                &slot.id.station,
                &slot.id.archive,
                &slot.selection,
                backoff,
            );
            match slot.tracker.rescan(range, &mut inspector, now).await {
                Ok(updates) => info!(start = range.start, end = range.end, updates, "window rescanned"),
                Err(err) => warn!(
                    start = range.start,
                    end = range.end,
                    error = %err,
                    "rescan failed, window queued as a candidate"
                ),
            }
            true
        }
        ControlCommand::Suspend => {
            info!("notifications suspended");
            slot.suspended = true;
            false
        }
        ControlCommand::Unsuspend => {
            info!("notifications resumed");
            slot.suspended = false;
            false
        }
        ControlCommand::Discard {
            range,
            discard_outputs,
        } => {
            info!(start = range.start, end = range.end, discard_outputs, "window discarded");
            slot.tracker.discard(range, discard_outputs)
        }
    };
    if changed {
        save(store, slot, true).await;
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use commit_ledger::{BoxError, FileInspectionPolicy, Granularity, Output, Policy, TimeRange};
    use tempfile::TempDir;
    use tokio::sync::oneshot;

    use super::*;
    use crate::archive::LocalArchive;
    use crate::archive::tests::{entry, local, seed_file};
    use crate::scheduler::config::StateConfig;
    use crate::scheduler::control::{ControlTarget, TargetFilter};

    #[derive(Clone, Default)]
    struct Recorder(Arc<Mutex<Vec<(String, TimeRange)>>>);

    struct RecordingAction {
        key: String,
        log: Recorder,
    }

    #[async_trait]
    impl CommitAction for RecordingAction {
        fn name(&self) -> &'static str {
            "recording"
        }

        async fn commit(&self, output: &Output) -> Result<(), BoxError> {
            self.log.0.lock().unwrap().push((self.key.clone(), output.range));
            Ok(())
        }
    }

    struct FailingAction;

    #[async_trait]
    impl CommitAction for FailingAction {
        fn name(&self) -> &'static str {
            "failing"
        }

        async fn commit(&self, _output: &Output) -> Result<(), BoxError> {
            Err("downstream unavailable".into())
        }
    }

    fn settings(auto_commit: bool) -> SchedulerSettings {
        SchedulerSettings {
            process_delay_ms: 20,
            max_process_delay_ms: 200,
            heartbeat_interval_ms: 50,
            auto_commit,
            lock_retry_initial_ms: 5,
            lock_retry_max_ms: 20,
            ..Default::default()
        }
    }

    fn inspection_tracker() -> Tracker {
        Tracker::new(Policy::FileInspection(FileInspectionPolicy {
            granularity: Granularity::Unbounded,
        }))
    }

    fn slot(key: &str, log: &Recorder) -> TrackerSlot {
        TrackerSlot::new(
            TrackerId::new("bnd", "raw", key),
            inspection_tracker(),
            SelectionConfig::default(),
            Box::new(RecordingAction {
                key: key.to_string(),
                log: log.clone(),
            }),
        )
    }

    fn filter(key: &str) -> TargetFilter {
        TargetFilter::new(&ControlTarget {
            station: "bnd".to_string(),
            archive: "raw".to_string(),
            key: key.to_string(),
        })
        .unwrap()
    }

    fn controller(root: &Path, state: &Path, auto_commit: bool, slots: Vec<TrackerSlot>) -> Controller<LocalArchive> {
        let store = StateStore::new(&StateConfig {
            directory: state.to_path_buf(),
        });
        Controller::new(local(root), store, settings(auto_commit), slots)
    }

    fn event(start: i64, end: i64) -> ArchiveEvent {
        ArchiveEvent {
            station: "BND".to_string(),
            archive: "raw".to_string(),
            range: TimeRange { start, end },
        }
    }

    async fn deliver(controller: &mut Controller<LocalArchive>, event: ArchiveEvent) {
        controller.accept_event(&event);
        controller.save_unsaved().await;
    }

    async fn control(
        controller: &mut Controller<LocalArchive>,
        command: ControlCommand,
        key: &str,
    ) -> bool {
        let (reply, answer) = oneshot::channel();
        controller
            .handle_control(ControlRequest {
                command,
                filter: filter(key),
                reply,
            })
            .await;
        answer.await.unwrap()
    }

    #[tokio::test]
    async fn notification_flows_through_to_commit() {
        let archive_dir = TempDir::new().unwrap();
        let state_dir = TempDir::new().unwrap();
        let now = now_ms();
        seed_file(archive_dir.path(), "bnd", "raw", entry("a.json", 1000, 5000, now), &[1500, 2499]);
        let log = Recorder::default();
        let mut controller = controller(archive_dir.path(), state_dir.path(), true, vec![slot("ebas", &log)]);

        deliver(&mut controller, event(0, 10_000)).await;
        assert_eq!(controller.slots[0].tracker.candidates().len(), 1);
        assert!(controller.processing_deadline().is_some());

        controller.process_all(now).await;
        assert!(controller.slots[0].tracker.candidates().is_empty());
        controller.commit_all(now).await;

        assert_eq!(
            log.0.lock().unwrap().clone(),
            vec![("ebas".to_string(), TimeRange { start: 1500, end: 2500 })]
        );
        let saved = state_dir.path().join("bnd").join("ebas.json");
        let state = std::fs::read_to_string(saved).unwrap();
        assert!(state.contains("\"latest_commit\": 2500"));
    }

    #[tokio::test]
    async fn suspended_trackers_ignore_notifications() {
        let archive_dir = TempDir::new().unwrap();
        let state_dir = TempDir::new().unwrap();
        let log = Recorder::default();
        let mut controller = controller(
            archive_dir.path(),
            state_dir.path(),
            true,
            vec![slot("ebas", &log), slot("nrt", &log)],
        );

        assert!(control(&mut controller, ControlCommand::Suspend, "^ebas$").await);
        deliver(&mut controller, event(0, 100)).await;
        assert!(controller.slots[0].tracker.candidates().is_empty());
        assert_eq!(controller.slots[1].tracker.candidates().len(), 1);

        assert!(control(&mut controller, ControlCommand::Unsuspend, "ebas").await);
        deliver(&mut controller, event(0, 100)).await;
        assert_eq!(controller.slots[0].tracker.candidates().len(), 1);

        let elsewhere = ArchiveEvent {
            archive: "clean".to_string(),
            ..event(500, 600)
        };
        deliver(&mut controller, elsewhere).await;
        assert_eq!(controller.slots[0].tracker.candidates().len(), 1);
    }

    #[tokio::test]
    async fn manual_mode_commits_only_on_request() {
        let archive_dir = TempDir::new().unwrap();
        let state_dir = TempDir::new().unwrap();
        let log = Recorder::default();
        let mut controller = controller(
            archive_dir.path(),
            state_dir.path(),
            false,
            vec![slot("ebas", &log), slot("nrt", &log)],
        );
        let now = now_ms();

        let update = ControlCommand::QueueUpdate(TimeRange { start: 10, end: 20 });
        assert!(control(&mut controller, update, "").await);
        controller.commit_all(now).await;
        assert!(log.0.lock().unwrap().is_empty());

        assert!(control(&mut controller, ControlCommand::CommitNow, "nrt").await);
        controller.commit_all(now).await;
        assert_eq!(
            log.0.lock().unwrap().clone(),
            vec![("nrt".to_string(), TimeRange { start: 10, end: 20 })]
        );
        assert!(!controller.slots[1].commit_requested);

        assert!(!control(&mut controller, ControlCommand::CommitNow, "nothing").await);
    }

    #[tokio::test]
    async fn discard_and_external_commit_over_control() {
        let archive_dir = TempDir::new().unwrap();
        let state_dir = TempDir::new().unwrap();
        let log = Recorder::default();
        let mut controller = controller(archive_dir.path(), state_dir.path(), false, vec![slot("ebas", &log)]);

        deliver(&mut controller, event(0, 100)).await;
        let discard = ControlCommand::Discard {
            range: TimeRange { start: 0, end: 50 },
            discard_outputs: false,
        };
        assert!(control(&mut controller, discard, "ebas").await);
        assert_eq!(
            controller.slots[0].tracker.candidates(),
            &[TimeRange { start: 50, end: 100 }]
        );

        let external = ControlCommand::ExternalCommit(TimeRange { start: 0, end: 1000 });
        assert!(control(&mut controller, external, "ebas").await);
        assert_eq!(controller.slots[0].tracker.latest_commit(), 1000);
    }

    #[tokio::test]
    async fn rescan_sees_files_older_than_the_watermark() {
        let archive_dir = TempDir::new().unwrap();
        let state_dir = TempDir::new().unwrap();
        seed_file(archive_dir.path(), "bnd", "raw", entry("old.json", 0, 100, 1), &[]);
        let log = Recorder::default();
        let mut controller = controller(archive_dir.path(), state_dir.path(), true, vec![slot("ebas", &log)]);

        let rescan = ControlCommand::Rescan(TimeRange { start: 0, end: 1000 });
        assert!(control(&mut controller, rescan, "").await);
        controller.commit_all(now_ms()).await;
        assert_eq!(
            log.0.lock().unwrap().clone(),
            vec![("ebas".to_string(), TimeRange { start: 0, end: 100 })]
        );
    }

    #[tokio::test]
    async fn run_loop_processes_and_persists_on_shutdown() {
        let archive_dir = TempDir::new().unwrap();
        let state_dir = TempDir::new().unwrap();
        seed_file(archive_dir.path(), "bnd", "raw", entry("a.json", 0, 100, now_ms()), &[]);
        let log = Recorder::default();
        let controller = controller(archive_dir.path(), state_dir.path(), true, vec![slot("ebas", &log)]);

        let (event_tx, event_rx) = mpsc::channel(8);
        let (_control_tx, control_rx) = mpsc::channel(8);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let running = tokio::spawn(controller.run(event_rx, control_rx, shutdown_rx));

        event_tx.send(event(0, 1000)).await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            while log.0.lock().unwrap().is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        shutdown_tx.send(true).unwrap();
        running.await.unwrap();

        let state = std::fs::read_to_string(state_dir.path().join("bnd").join("ebas.json")).unwrap();
        assert!(state.contains("\"latest_commit\": 100"));
    }

    #[tokio::test]
    async fn unloadable_trackers_are_skipped() {
        let state_dir = TempDir::new().unwrap();
        let config: SchedulerConfig = toml::from_str(&format!(
            r#"
            [state]
            directory = "{}"

            [[trackers]]
            station = "bnd"
            archive = "raw"
            key = "good"
            action = {{ type = "json", path = "/tmp/good.jsonl", pretty = false }}

            [[trackers]]
            station = "bnd"
            archive = "raw"
            key = "broken"
            action = {{ type = "json", path = "/tmp/broken.jsonl", pretty = false }}
            "#,
            state_dir.path().display()
        ))
        .unwrap();
        std::fs::create_dir_all(state_dir.path().join("bnd")).unwrap();
        std::fs::write(state_dir.path().join("bnd").join("broken.json"), "{\"version\": 99}").unwrap();

        let archive_dir = TempDir::new().unwrap();
        let controller = Controller::from_config(&config, local(archive_dir.path()))
            .await
            .unwrap();
        assert_eq!(controller.slots.len(), 1);
        assert_eq!(controller.slots[0].id.key, "good");
        assert_eq!(controller.topics(), vec![("bnd".to_string(), "raw".to_string())]);

        std::fs::write(state_dir.path().join("bnd").join("good.json"), "garbage").unwrap();
        assert!(
            Controller::from_config(&config, local(archive_dir.path()))
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn one_failing_tracker_does_not_hold_back_the_others() {
        let archive_dir = TempDir::new().unwrap();
        let state_dir = TempDir::new().unwrap();
        let now = now_ms();
        seed_file(archive_dir.path(), "bnd", "raw", entry("a.json", 1000, 5000, now), &[1500, 2499]);
        let broken_dir = archive_dir.path().join("bnd").join("broken");
        std::fs::create_dir_all(&broken_dir).unwrap();
        std::fs::write(broken_dir.join("index.json"), "not json").unwrap();

        let log = Recorder::default();
        let broken = TrackerSlot::new(
            TrackerId::new("bnd", "broken", "ebas"),
            inspection_tracker(),
            SelectionConfig::default(),
            Box::new(FailingAction),
        );
        let mut controller = controller(
            archive_dir.path(),
            state_dir.path(),
            true,
            vec![broken, slot("nrt", &log)],
        );

        let broken_event = ArchiveEvent {
            archive: "broken".to_string(),
            ..event(0, 10_000)
        };
        deliver(&mut controller, broken_event).await;
        deliver(&mut controller, event(0, 10_000)).await;
        controller.process_all(now).await;
        assert_eq!(
            controller.slots[0].tracker.candidates(),
            &[TimeRange { start: 0, end: 10_000 }]
        );
        assert!(controller.slots[1].tracker.candidates().is_empty());

        controller.slots[0]
            .tracker
            .notify_update(TimeRange { start: 0, end: 10 }, now);
        controller.commit_all(now).await;
        assert_eq!(
            log.0.lock().unwrap().clone(),
            vec![("nrt".to_string(), TimeRange { start: 1500, end: 2500 })]
        );
        assert_eq!(controller.slots[0].tracker.outputs(now).count(), 1);
        assert_eq!(controller.slots[0].tracker.latest_commit(), 0);
        assert_eq!(controller.slots[1].tracker.latest_commit(), 2500);
    }

    #[tokio::test]
    async fn shutdown_interrupts_a_rescan_waiting_on_a_lock() {
        let archive_dir = TempDir::new().unwrap();
        let state_dir = TempDir::new().unwrap();
        seed_file(archive_dir.path(), "bnd", "raw", entry("a.json", 0, 100, 1), &[]);
        let writer = std::fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(archive_dir.path().join("bnd/raw/index.lock"))
            .unwrap();
        fs2::FileExt::lock_exclusive(&writer).unwrap();

        let log = Recorder::default();
        let controller = controller(archive_dir.path(), state_dir.path(), true, vec![slot("ebas", &log)]);
        let (_event_tx, event_rx) = mpsc::channel(8);
        let (control_tx, control_rx) = mpsc::channel(8);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let running = tokio::spawn(controller.run(event_rx, control_rx, shutdown_rx));

        let (reply, answer) = oneshot::channel();
        control_tx
            .send(ControlRequest {
                command: ControlCommand::Rescan(TimeRange { start: 0, end: 100 }),
                filter: filter("ebas"),
                reply,
            })
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(3), running)
            .await
            .unwrap()
            .unwrap();

        assert!(answer.await.is_err());
        assert!(log.0.lock().unwrap().is_empty());
        assert!(state_dir.path().join("bnd").join("ebas.json").exists());
        drop(writer);
    }
}
