use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep_until, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::controller::{Phase, RequestOutcome, SaveAttemptController};
use super::AutosaveConfig;
use crate::codec::SnapshotCodec;
use crate::error::{Result, SyncError};
use crate::model::{epoch_millis, ProgressRecord};
use crate::reconcile::LocalStore;
use crate::rolling::{RemoteSlot, RollingSnapshotStore};

/// Read-only view of the live progress, sampled at the start of each attempt.
#[async_trait]
pub trait ProgressSource: Send + Sync {
    async fn snapshot(&self, pattern_id: &str) -> Result<Option<ProgressRecord>>;
}

#[async_trait]
impl<L: LocalStore + ?Sized> ProgressSource for L {
    async fn snapshot(&self, pattern_id: &str) -> Result<Option<ProgressRecord>> {
        self.load_progress(pattern_id).await
    }
}

/// Encodes progress and writes it into the pattern's slot ring.
#[derive(Clone)]
pub struct SnapshotWriter {
    codec: SnapshotCodec,
    store: RollingSnapshotStore,
}

impl SnapshotWriter {
    pub fn new(codec: SnapshotCodec, store: RollingSnapshotStore) -> Self {
        Self { codec, store }
    }

    pub async fn save(&self, account_id: &str, progress: &ProgressRecord) -> Result<RemoteSlot> {
        let bytes = self.codec.encode(progress, epoch_millis())?;
        debug!(
            pattern = %progress.pattern_id,
            compression = ?self.codec.compression(),
            bytes = bytes.len(),
            "encoded snapshot"
        );
        self.store
            .write(account_id, &progress.pattern_id, bytes)
            .await
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AutosaveStatus {
    pub pattern_id: String,
    #[serde(flatten)]
    pub phase: Phase,
    pub online: bool,
    pub failure_count: u32,
    /// Epoch milliseconds of the attempt behind the last verified save.
    pub last_saved_at: Option<i64>,
    pub last_slot: Option<usize>,
    pub last_error: Option<String>,
}

impl AutosaveStatus {
    fn new(pattern_id: &str) -> Self {
        Self {
            pattern_id: pattern_id.to_string(),
            phase: Phase::Idle,
            online: true,
            failure_count: 0,
            last_saved_at: None,
            last_slot: None,
            last_error: None,
        }
    }
}

enum Command {
    Interaction,
    RequestSave,
    VisibilityHidden,
    SetOnline(bool),
    Shutdown(oneshot::Sender<()>),
}

type SaveFuture = Pin<Box<dyn Future<Output = Result<RemoteSlot>> + Send>>;

async fn wait_in_flight(save: &mut Option<SaveFuture>) -> Result<RemoteSlot> {
    match save {
        Some(save) => save.await,
        None => std::future::pending().await,
    }
}

struct Worker {
    pattern_id: String,
    account_id: Option<String>,
    source: Arc<dyn ProgressSource>,
    writer: SnapshotWriter,
    controller: SaveAttemptController,
    tick: std::time::Duration,
    status: AutosaveStatus,
    status_tx: watch::Sender<AutosaveStatus>,
    attempt_started_epoch: i64,
}

impl Worker {
    fn publish(&mut self) {
        let state = self.controller.state();
        self.status.phase = self.controller.phase();
        self.status.online = self.controller.is_online();
        self.status.failure_count = state.failure_count;
        self.status_tx.send_replace(self.status.clone());
    }

    fn apply(&mut self, outcome: RequestOutcome, in_flight: &mut Option<SaveFuture>) {
        match outcome {
            RequestOutcome::Start => *in_flight = Some(self.start_attempt()),
            RequestOutcome::Coalesced => debug!(pattern = %self.pattern_id, "save coalesced into in-flight attempt"),
            RequestOutcome::Dropped(reason) => {
                debug!(pattern = %self.pattern_id, ?reason, "save request dropped")
            }
        }
    }

    fn start_attempt(&mut self) -> SaveFuture {
        self.attempt_started_epoch = epoch_millis();
        let pattern_id = self.pattern_id.clone();
        let account_id = self.account_id.clone();
        let source = Arc::clone(&self.source);
        let writer = self.writer.clone();
        debug!(pattern = %pattern_id, "autosave attempt started");
        Box::pin(async move {
            let account_id = account_id.ok_or(SyncError::AuthAbsent)?;
            let progress = source.snapshot(&pattern_id).await?.ok_or_else(|| {
                SyncError::NotFound(format!("no local progress for pattern {pattern_id}"))
            })?;
            writer.save(&account_id, &progress).await
        })
    }

    fn finish(&mut self, result: Result<RemoteSlot>, in_flight: &mut Option<SaveFuture>) {
        let now = Instant::now();
        match result {
            Ok(slot) => {
                info!(pattern = %self.pattern_id, slot = slot.slot_index, "autosaved progress");
                self.status.last_saved_at = Some(self.attempt_started_epoch);
                self.status.last_slot = Some(slot.slot_index);
                self.status.last_error = None;
                if let Some(outcome) = self.controller.finish_success(now) {
                    self.apply(outcome, in_flight);
                }
            }
            Err(err) if !err.is_transient() => {
                self.status.last_error = Some(err.to_string());
                self.controller.finish_rejected();
                warn!(pattern = %self.pattern_id, error = %err, "autosave rejected, not retrying");
            }
            Err(err) => {
                self.status.last_error = Some(err.to_string());
                match self.controller.finish_failure(now) {
                    Some(delay) => warn!(
                        pattern = %self.pattern_id,
                        error = %err,
                        retry_in_ms = delay.as_millis() as u64,
                        "autosave failed"
                    ),
                    None => warn!(pattern = %self.pattern_id, error = %err, "autosave failed, no retry scheduled"),
                }
            }
        }
        if let Some(outcome) = self.controller.closing_follow_up(now) {
            debug!(pattern = %self.pattern_id, "closing save for coalesced request");
            self.apply(outcome, in_flight);
        }
    }

    fn handle(&mut self, command: Command, in_flight: &mut Option<SaveFuture>) {
        let now = Instant::now();
        match command {
            Command::Interaction => self.controller.note_interaction(now),
            Command::RequestSave => {
                let outcome = self.controller.request_save(now);
                self.apply(outcome, in_flight);
            }
            Command::VisibilityHidden => {
                if let Some(outcome) = self.controller.visibility_hidden(now) {
                    self.apply(outcome, in_flight);
                }
            }
            Command::SetOnline(false) => {
                debug!(pattern = %self.pattern_id, "offline, retries cancelled");
                self.controller.went_offline();
            }
            Command::SetOnline(true) => {
                if let Some(delay) = self.controller.came_online(now) {
                    debug!(pattern = %self.pattern_id, retry_in_ms = delay.as_millis() as u64, "online, fast retry scheduled");
                }
            }
            // Handled by the run loop.
            Command::Shutdown(_) => {}
        }
    }

    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        let mut ticker = interval_at(Instant::now() + self.tick, self.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut in_flight: Option<SaveFuture> = None;
        let mut shutdown_waiters: Vec<oneshot::Sender<()>> = Vec::new();
        let mut draining = false;

        loop {
            let retry_at = self.controller.retry_deadline();
            tokio::select! {
                biased;
                result = wait_in_flight(&mut in_flight), if in_flight.is_some() => {
                    in_flight = None;
                    self.finish(result, &mut in_flight);
                }
                command = commands.recv(), if !draining => match command {
                    Some(Command::Shutdown(done)) => {
                        shutdown_waiters.push(done);
                        self.controller.begin_closing();
                        draining = true;
                    }
                    Some(command) => self.handle(command, &mut in_flight),
                    None => {
                        self.controller.begin_closing();
                        draining = true;
                    }
                },
                _ = sleep_until(retry_at.unwrap_or_else(Instant::now)), if retry_at.is_some() && !draining => {
                    let outcome = self.controller.retry_due(Instant::now());
                    self.apply(outcome, &mut in_flight);
                }
                _ = ticker.tick(), if !draining => {
                    if let Some(outcome) = self.controller.tick(Instant::now()) {
                        self.apply(outcome, &mut in_flight);
                    }
                }
            }
            self.publish();
            if draining && in_flight.is_none() {
                break;
            }
        }

        debug!(pattern = %self.pattern_id, "autosave stopped");
        for done in shutdown_waiters {
            let _ = done.send(());
        }
    }
}

/// Running autosave task for one pattern. Dropping the handle aborts the task
/// along with any in-flight attempt and timers.
pub struct AutosaveHandle {
    pattern_id: String,
    commands: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<AutosaveStatus>,
    task: Option<JoinHandle<()>>,
}

impl AutosaveHandle {
    pub fn spawn(
        pattern_id: &str,
        account_id: Option<String>,
        source: Arc<dyn ProgressSource>,
        writer: SnapshotWriter,
        config: AutosaveConfig,
    ) -> Self {
        let (commands, receiver) = mpsc::unbounded_channel();
        let initial = AutosaveStatus::new(pattern_id);
        let (status_tx, status) = watch::channel(initial.clone());
        let worker = Worker {
            pattern_id: pattern_id.to_string(),
            controller: SaveAttemptController::new(config, account_id.is_some(), Instant::now()),
            account_id,
            source,
            writer,
            tick: config.tick,
            status: initial,
            status_tx,
            attempt_started_epoch: 0,
        };
        let task = tokio::spawn(worker.run(receiver));
        Self {
            pattern_id: pattern_id.to_string(),
            commands,
            status,
            task: Some(task),
        }
    }

    pub fn pattern_id(&self) -> &str {
        &self.pattern_id
    }

    fn send(&self, command: Command) {
        // The task only goes away through shutdown or drop.
        let _ = self.commands.send(command);
    }

    pub fn note_interaction(&self) {
        self.send(Command::Interaction);
    }

    pub fn request_save(&self) {
        self.send(Command::RequestSave);
    }

    pub fn visibility_hidden(&self) {
        self.send(Command::VisibilityHidden);
    }

    pub fn set_online(&self, online: bool) {
        self.send(Command::SetOnline(online));
    }

    pub fn status(&self) -> AutosaveStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<AutosaveStatus> {
        self.status.clone()
    }

    /// Stop accepting events, wait for any in-flight attempt and return the
    /// final status. A request coalesced into that attempt gets one closing
    /// save; otherwise no new attempt is started.
    pub async fn shutdown(mut self) -> AutosaveStatus {
        let (done, wait) = oneshot::channel();
        self.send(Command::Shutdown(done));
        let _ = wait.await;
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
        self.status()
    }
}

impl Drop for AutosaveHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Owns the autosave task of whichever pattern is currently active.
pub struct AutosaveSession {
    account_id: Option<String>,
    source: Arc<dyn ProgressSource>,
    writer: SnapshotWriter,
    config: AutosaveConfig,
    active: Option<AutosaveHandle>,
}

impl AutosaveSession {
    pub fn new(
        account_id: Option<String>,
        source: Arc<dyn ProgressSource>,
        writer: SnapshotWriter,
        config: AutosaveConfig,
    ) -> Self {
        Self {
            account_id,
            source,
            writer,
            config,
            active: None,
        }
    }

    /// Make `pattern_id` the active pattern. Switching discards the previous
    /// pattern's state and timers; re-activating the same pattern keeps them.
    pub fn activate(&mut self, pattern_id: &str) -> &AutosaveHandle {
        if self
            .active
            .as_ref()
            .is_some_and(|h| h.pattern_id() != pattern_id)
        {
            if let Some(previous) = self.active.take() {
                debug!(from = previous.pattern_id(), to = pattern_id, "switching autosave pattern");
            }
        }
        self.active.get_or_insert_with(|| {
            AutosaveHandle::spawn(
                pattern_id,
                self.account_id.clone(),
                Arc::clone(&self.source),
                self.writer.clone(),
                self.config,
            )
        })
    }

    pub fn current(&self) -> Option<&AutosaveHandle> {
        self.active.as_ref()
    }

    /// Graceful end of session: waits for the active pattern's in-flight save.
    pub async fn close(&mut self) -> Option<AutosaveStatus> {
        match self.active.take() {
            Some(handle) => Some(handle.shutdown().await),
            None => None,
        }
    }
}
