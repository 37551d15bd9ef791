use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::{bail, Result};
use clap::Args;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use crate::args::BaseArgs;
use crate::autosave::{AutosaveSession, AutosaveStatus, Phase, ProgressSource};
use crate::context::AppContext;
use crate::error::SyncError;
use crate::reconcile::LocalStore;
use crate::rolling::RollingSnapshotStore;
use crate::storage::validate_segment;
use crate::ui::{print_command_status, CommandStatus};

#[derive(Debug, Clone, Args)]
pub struct WatchArgs {
    /// Pattern to autosave
    id: String,

    /// How often to check the progress file for edits
    #[arg(long, default_value_t = 1000)]
    poll_ms: u64,

    /// How often to check that the snapshot store is reachable
    #[arg(long, default_value_t = 30_000)]
    check_ms: u64,
}

const CHECK_TIMEOUT: Duration = Duration::from_secs(5);

async fn modified(path: &Path) -> Option<SystemTime> {
    tokio::fs::metadata(path).await.ok()?.modified().ok()
}

fn describe(status: &AutosaveStatus) -> (CommandStatus, String) {
    match (status.phase, &status.last_error) {
        (Phase::InFlight, _) => (CommandStatus::Info, "Saving...".to_string()),
        (Phase::Backoff { delay_ms }, Some(err)) => (
            CommandStatus::Warning,
            format!("Save failed ({err}); retrying in {}s", delay_ms / 1000),
        ),
        (_, Some(err)) => (CommandStatus::Error, format!("Save failed: {err}")),
        (_, None) => match status.last_slot {
            Some(slot) => (CommandStatus::Success, format!("Saved to slot {slot}")),
            None => (CommandStatus::Info, "Waiting for changes".to_string()),
        },
    }
}

fn report(json: bool, status: &AutosaveStatus) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string(status)?);
    } else {
        let (kind, message) = describe(status);
        print_command_status(kind, &message);
    }
    Ok(())
}

/// What a process signal means for the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionSignal {
    Stop,
    Detach,
}

#[cfg(unix)]
struct Signals {
    interrupt: tokio::signal::unix::Signal,
    terminate: tokio::signal::unix::Signal,
    hangup: tokio::signal::unix::Signal,
}

#[cfg(unix)]
impl Signals {
    fn install() -> Result<Self> {
        use tokio::signal::unix::{signal, SignalKind};
        Ok(Self {
            interrupt: signal(SignalKind::interrupt())?,
            terminate: signal(SignalKind::terminate())?,
            hangup: signal(SignalKind::hangup())?,
        })
    }

    async fn recv(&mut self) -> SessionSignal {
        tokio::select! {
            _ = self.interrupt.recv() => SessionSignal::Stop,
            _ = self.terminate.recv() => SessionSignal::Stop,
            _ = self.hangup.recv() => SessionSignal::Detach,
        }
    }
}

#[cfg(windows)]
struct Signals {
    ctrl_c: tokio::signal::windows::CtrlC,
}

#[cfg(windows)]
impl Signals {
    fn install() -> Result<Self> {
        Ok(Self {
            ctrl_c: tokio::signal::windows::ctrl_c()?,
        })
    }

    async fn recv(&mut self) -> SessionSignal {
        self.ctrl_c.recv().await;
        SessionSignal::Stop
    }
}

/// Last known reachability of the snapshot store. Only changes are forwarded.
#[derive(Debug)]
struct Connectivity {
    online: bool,
}

impl Connectivity {
    fn new() -> Self {
        Self { online: true }
    }

    fn observe(&mut self, reachable: bool) -> Option<bool> {
        if reachable == self.online {
            return None;
        }
        self.online = reachable;
        Some(reachable)
    }
}

/// `None` means the listing timed out. A server that answers with an error is
/// still reachable.
fn reachable(outcome: Option<crate::error::Result<()>>) -> bool {
    !matches!(outcome, None | Some(Err(SyncError::Network(_))))
}

async fn check_reachable(
    store: &RollingSnapshotStore,
    account_id: &str,
    pattern_id: &str,
    wait: Duration,
) -> bool {
    let outcome = tokio::time::timeout(wait, store.list_slots(account_id, pattern_id))
        .await
        .ok()
        .map(|listed| listed.map(|_| ()));
    reachable(outcome)
}

pub async fn run(base: BaseArgs, args: WatchArgs) -> Result<()> {
    let ctx = AppContext::from_base(&base)?;
    validate_segment(&args.id)?;
    if ctx.local.load_progress(&args.id).await?.is_none() {
        bail!("no local progress for '{}'", args.id);
    }
    let account_id = ctx.account_id();
    if account_id.is_none() {
        print_command_status(
            CommandStatus::Warning,
            "No account configured; progress will not be autosaved",
        );
    }

    let store = ctx.snapshot_store()?;
    let source: Arc<dyn ProgressSource> = ctx.local.clone();
    let mut session = AutosaveSession::new(
        account_id.clone(),
        source,
        ctx.snapshot_writer()?,
        ctx.autosave,
    );
    let handle = session.activate(&args.id);
    let mut updates = handle.subscribe();
    info!(pattern = %args.id, "watching for progress edits");

    let path = ctx.local.progress_path(&args.id)?;
    let mut last_modified = modified(&path).await;
    let mut poll = tokio::time::interval(Duration::from_millis(args.poll_ms.max(50)));
    let check_every = Duration::from_millis(args.check_ms.max(1000));
    let mut reach = tokio::time::interval(check_every);
    reach.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let check_wait = check_every.min(CHECK_TIMEOUT);
    let mut connectivity = Connectivity::new();
    let mut signals = Signals::install()?;
    let mut detached = false;

    loop {
        tokio::select! {
            signal = signals.recv() => match signal {
                SessionSignal::Stop => break,
                SessionSignal::Detach => {
                    // The terminal is gone; save now and keep watching quietly.
                    info!(pattern = %args.id, "terminal detached, saving");
                    detached = true;
                    handle.visibility_hidden();
                }
            },
            _ = poll.tick() => {
                let current = modified(&path).await;
                if current != last_modified {
                    debug!(pattern = %args.id, "progress file changed");
                    last_modified = current;
                    handle.note_interaction();
                }
            }
            _ = reach.tick(), if account_id.is_some() => {
                if let Some(account) = account_id.as_deref() {
                    let up = check_reachable(&store, account, &args.id, check_wait).await;
                    if let Some(online) = connectivity.observe(up) {
                        info!(pattern = %args.id, online, "snapshot store reachability changed");
                        handle.set_online(online);
                    }
                }
            }
            changed = updates.changed() => {
                if changed.is_err() {
                    break;
                }
                let status = updates.borrow_and_update().clone();
                if !detached {
                    report(ctx.json, &status)?;
                }
            }
        }
    }

    // Flush before exiting; shutdown runs this as the closing save.
    if let Some(active) = session.current() {
        active.request_save();
    }
    if let Some(status) = session.close().await {
        if !detached {
            report(ctx.json, &status)?;
        }
    }
    Ok(())
}
