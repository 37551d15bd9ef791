use std::time::Duration;

use backoff::backoff::Backoff;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use serde::Serialize;
use tokio::time::Instant;

use super::AutosaveConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum Phase {
    Idle,
    InFlight,
    Backoff { delay_ms: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduledRetry {
    pub due: Instant,
    pub delay: Duration,
}

/// Per-pattern autosave bookkeeping. Lives only as long as the pattern is active.
#[derive(Debug, Clone, Default)]
pub struct AutosaveState {
    pub last_saved_at: Option<Instant>,
    pub last_attempt_at: Option<Instant>,
    pub failure_count: u32,
    pub in_flight: bool,
    pub pending_save_requested: bool,
    pub scheduled_retry: Option<ScheduledRetry>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    Unauthenticated,
    Offline,
    Idle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOutcome {
    /// An attempt starts now. The caller performs the write and reports back.
    Start,
    /// An attempt is already in flight; the request was folded into it.
    Coalesced,
    Dropped(DropReason),
}

/// Save-attempt state machine. Performs no I/O: every transition takes the
/// current instant and reports what the caller should do next.
pub struct SaveAttemptController {
    config: AutosaveConfig,
    state: AutosaveState,
    authenticated: bool,
    online: bool,
    started_at: Instant,
    last_interaction_at: Instant,
    backoff: ExponentialBackoff,
    closing: bool,
}

impl SaveAttemptController {
    pub fn new(config: AutosaveConfig, authenticated: bool, now: Instant) -> Self {
        let backoff = ExponentialBackoffBuilder::new()
            .with_initial_interval(config.retry_base)
            .with_multiplier(2.0)
            .with_randomization_factor(0.0)
            .with_max_interval(config.retry_max)
            .with_max_elapsed_time(None)
            .build();
        Self {
            config,
            state: AutosaveState::default(),
            authenticated,
            online: true,
            started_at: now,
            last_interaction_at: now,
            backoff,
            closing: false,
        }
    }

    pub fn state(&self) -> &AutosaveState {
        &self.state
    }

    pub fn is_online(&self) -> bool {
        self.online
    }

    pub fn phase(&self) -> Phase {
        if self.state.in_flight {
            return Phase::InFlight;
        }
        match self.state.scheduled_retry {
            Some(retry) => Phase::Backoff {
                delay_ms: retry.delay.as_millis() as u64,
            },
            None => Phase::Idle,
        }
    }

    pub fn retry_deadline(&self) -> Option<Instant> {
        self.state.scheduled_retry.map(|r| r.due)
    }

    pub fn is_active(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.last_interaction_at) <= self.config.idle_after
    }

    pub fn note_interaction(&mut self, now: Instant) {
        self.last_interaction_at = now;
    }

    fn since_last_success(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.state.last_saved_at.unwrap_or(self.started_at))
    }

    fn is_overdue(&self, now: Instant) -> bool {
        self.since_last_success(now) >= self.config.save_every
    }

    fn schedule_retry(&mut self, now: Instant, delay: Duration) {
        self.state.scheduled_retry = Some(ScheduledRetry {
            due: now + delay,
            delay,
        });
    }

    pub fn request_save(&mut self, now: Instant) -> RequestOutcome {
        if !self.authenticated {
            return RequestOutcome::Dropped(DropReason::Unauthenticated);
        }
        if self.state.in_flight {
            self.state.pending_save_requested = true;
            return RequestOutcome::Coalesced;
        }
        if !self.online {
            return RequestOutcome::Dropped(DropReason::Offline);
        }
        if !self.is_active(now) {
            return RequestOutcome::Dropped(DropReason::Idle);
        }
        self.state.scheduled_retry = None;
        self.state.in_flight = true;
        self.state.last_attempt_at = Some(now);
        RequestOutcome::Start
    }

    /// Record a verified remote write. Returns the outcome of the follow-up
    /// request when one was pending and a regular save is already due again.
    pub fn finish_success(&mut self, now: Instant) -> Option<RequestOutcome> {
        self.state.in_flight = false;
        self.state.failure_count = 0;
        self.state.last_saved_at = self.state.last_attempt_at;
        self.backoff.reset();

        if self.closing {
            return None;
        }
        let pending = std::mem::take(&mut self.state.pending_save_requested);
        if pending && self.is_overdue(now) {
            return Some(self.request_save(now));
        }
        None
    }

    /// Record a failed attempt. Returns the retry delay when one was scheduled.
    pub fn finish_failure(&mut self, now: Instant) -> Option<Duration> {
        self.state.in_flight = false;
        if !self.closing {
            self.state.pending_save_requested = false;
        }
        self.state.failure_count += 1;
        let delay = self
            .backoff
            .next_backoff()
            .unwrap_or(self.config.retry_max)
            .min(self.config.retry_max);
        if self.online && self.is_active(now) && !self.closing {
            self.schedule_retry(now, delay);
            return Some(delay);
        }
        None
    }

    /// Record a failure that another attempt cannot fix. Counts as a
    /// failure but schedules no retry; the next due tick tries again.
    pub fn finish_rejected(&mut self) {
        self.state.in_flight = false;
        self.state.pending_save_requested = false;
        self.state.failure_count += 1;
    }

    /// The retry timer fired. An idle user drops the retry.
    pub fn retry_due(&mut self, now: Instant) -> RequestOutcome {
        self.state.scheduled_retry = None;
        if !self.is_active(now) {
            return RequestOutcome::Dropped(DropReason::Idle);
        }
        self.request_save(now)
    }

    /// Periodic tick. Scheduled retries own the timing while they are pending.
    pub fn tick(&mut self, now: Instant) -> Option<RequestOutcome> {
        if self.state.in_flight || self.state.scheduled_retry.is_some() {
            return None;
        }
        if !self.is_active(now) || !self.is_overdue(now) {
            return None;
        }
        Some(self.request_save(now))
    }

    pub fn visibility_hidden(&mut self, now: Instant) -> Option<RequestOutcome> {
        if !self.is_active(now) {
            return None;
        }
        Some(self.request_save(now))
    }

    /// Wind the session down: scheduled retries are dropped, and a request
    /// coalesced into the in-flight attempt is kept for [`Self::closing_follow_up`].
    pub fn begin_closing(&mut self) {
        self.closing = true;
        self.state.scheduled_retry = None;
        if !self.state.in_flight {
            self.state.pending_save_requested = false;
        }
    }

    /// The one attempt a closing session still makes: the request coalesced
    /// while the last attempt was in flight. Ignores the save interval and
    /// idleness.
    pub fn closing_follow_up(&mut self, now: Instant) -> Option<RequestOutcome> {
        if !self.closing || self.state.in_flight {
            return None;
        }
        if !std::mem::take(&mut self.state.pending_save_requested) {
            return None;
        }
        if !self.authenticated {
            return Some(RequestOutcome::Dropped(DropReason::Unauthenticated));
        }
        if !self.online {
            return Some(RequestOutcome::Dropped(DropReason::Offline));
        }
        self.state.in_flight = true;
        self.state.last_attempt_at = Some(now);
        Some(RequestOutcome::Start)
    }

    pub fn went_offline(&mut self) {
        self.online = false;
        self.state.scheduled_retry = None;
    }

    /// Returns the fast-retry delay when one was scheduled.
    pub fn came_online(&mut self, now: Instant) -> Option<Duration> {
        self.online = true;
        if self.state.in_flight || !self.is_active(now) {
            return None;
        }
        if self.state.failure_count > 0 || self.is_overdue(now) {
            let delay = self.config.online_retry;
            self.schedule_retry(now, delay);
            return Some(delay);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SEC: Duration = Duration::from_secs(1);
    const MIN: Duration = Duration::from_secs(60);

    fn controller(now: Instant) -> SaveAttemptController {
        SaveAttemptController::new(AutosaveConfig::default(), true, now)
    }

    #[test]
    fn backoff_doubles_from_base_and_caps() {
        let t0 = Instant::now();
        let mut c = controller(t0);
        let mut delays = Vec::new();
        for _ in 0..6 {
            assert_eq!(c.request_save(t0), RequestOutcome::Start);
            delays.push(c.finish_failure(t0).unwrap());
        }
        let expected: Vec<Duration> = [15, 30, 60, 120, 120, 120]
            .iter()
            .map(|s| Duration::from_secs(*s))
            .collect();
        assert_eq!(delays, expected);
        assert_eq!(c.state().failure_count, 6);
        assert_eq!(c.phase(), Phase::Backoff { delay_ms: 120_000 });
    }

    #[test]
    fn success_resets_backoff() {
        let t0 = Instant::now();
        let mut c = controller(t0);
        c.request_save(t0);
        c.finish_failure(t0);
        c.request_save(t0);
        c.finish_failure(t0);
        c.request_save(t0);
        c.finish_success(t0);
        assert_eq!(c.state().failure_count, 0);
        c.request_save(t0);
        assert_eq!(c.finish_failure(t0), Some(15 * SEC));
    }

    #[test]
    fn last_saved_at_moves_only_on_success() {
        let t0 = Instant::now();
        let mut c = controller(t0);
        c.request_save(t0);
        c.finish_failure(t0 + SEC);
        assert_eq!(c.state().last_saved_at, None);
        assert_eq!(c.state().last_attempt_at, Some(t0));

        let t1 = t0 + 20 * SEC;
        assert_eq!(c.retry_due(t1), RequestOutcome::Start);
        c.finish_success(t1 + SEC);
        assert_eq!(c.state().last_saved_at, Some(t1));
    }

    #[test]
    fn requests_during_flight_coalesce() {
        let t0 = Instant::now();
        let mut c = controller(t0);
        assert_eq!(c.request_save(t0), RequestOutcome::Start);
        assert_eq!(c.request_save(t0), RequestOutcome::Coalesced);
        assert_eq!(c.visibility_hidden(t0), Some(RequestOutcome::Coalesced));
        assert!(c.state().pending_save_requested);
        assert_eq!(c.tick(t0 + 10 * MIN), None);

        // Save not yet due again, so the pending flag is left to the next tick.
        assert_eq!(c.finish_success(t0 + SEC), None);
        assert!(!c.state().pending_save_requested);
        assert!(!c.state().in_flight);
    }

    #[test]
    fn pending_request_restarts_when_save_is_due() {
        let t0 = Instant::now();
        let mut c = controller(t0);
        c.request_save(t0);
        c.request_save(t0);
        c.note_interaction(t0 + 5 * MIN);
        assert_eq!(c.finish_success(t0 + 5 * MIN), Some(RequestOutcome::Start));
        assert!(c.state().in_flight);
    }

    #[test]
    fn idle_user_is_not_saved_on_tick() {
        let t0 = Instant::now();
        let mut c = controller(t0);
        assert_eq!(c.tick(t0 + 7 * MIN), None);
        assert!(!c.state().in_flight);
        assert_eq!(
            c.request_save(t0 + 7 * MIN),
            RequestOutcome::Dropped(DropReason::Idle)
        );
    }

    #[test]
    fn tick_saves_active_user_once_due() {
        let t0 = Instant::now();
        let mut c = controller(t0);
        c.note_interaction(t0 + 4 * MIN);
        assert_eq!(c.tick(t0 + 4 * MIN + 30 * SEC), None);
        assert_eq!(c.tick(t0 + 5 * MIN), Some(RequestOutcome::Start));
    }

    #[test]
    fn tick_defers_to_scheduled_retry() {
        let t0 = Instant::now();
        let mut c = controller(t0);
        c.note_interaction(t0 + 5 * MIN);
        c.request_save(t0 + 5 * MIN);
        c.finish_failure(t0 + 5 * MIN);
        assert_eq!(c.tick(t0 + 5 * MIN + 10 * SEC), None);
        assert!(!c.state().in_flight);
    }

    #[test]
    fn retry_for_idle_user_is_dropped() {
        let t0 = Instant::now();
        let mut c = controller(t0);
        c.request_save(t0);
        c.finish_failure(t0);
        assert_eq!(
            c.retry_due(t0 + 7 * MIN),
            RequestOutcome::Dropped(DropReason::Idle)
        );
        assert_eq!(c.retry_deadline(), None);
        assert_eq!(c.phase(), Phase::Idle);
    }

    #[test]
    fn offline_cancels_retry_and_online_retries_fast() {
        let t0 = Instant::now();
        let mut c = controller(t0);
        c.request_save(t0);
        c.finish_failure(t0);
        assert!(c.retry_deadline().is_some());

        c.went_offline();
        assert_eq!(c.retry_deadline(), None);
        assert_eq!(
            c.request_save(t0 + SEC),
            RequestOutcome::Dropped(DropReason::Offline)
        );

        assert_eq!(c.came_online(t0 + MIN), Some(5 * SEC));
        assert_eq!(c.retry_deadline(), Some(t0 + MIN + 5 * SEC));
    }

    #[test]
    fn failure_while_offline_schedules_nothing() {
        let t0 = Instant::now();
        let mut c = controller(t0);
        c.request_save(t0);
        c.went_offline();
        assert_eq!(c.finish_failure(t0), None);
        assert_eq!(c.state().failure_count, 1);
    }

    #[test]
    fn online_with_overdue_save_schedules_fast_retry() {
        let t0 = Instant::now();
        let mut c = controller(t0);
        c.went_offline();
        assert_eq!(c.came_online(t0 + MIN), None);

        c.went_offline();
        c.note_interaction(t0 + 5 * MIN);
        assert_eq!(c.came_online(t0 + 5 * MIN), Some(5 * SEC));
    }

    #[test]
    fn unauthenticated_session_never_saves() {
        let t0 = Instant::now();
        let mut c = SaveAttemptController::new(AutosaveConfig::default(), false, t0);
        assert_eq!(
            c.request_save(t0),
            RequestOutcome::Dropped(DropReason::Unauthenticated)
        );
        assert_eq!(
            c.tick(t0 + 5 * MIN),
            Some(RequestOutcome::Dropped(DropReason::Unauthenticated))
        );
    }

    #[test]
    fn closing_runs_one_follow_up_for_coalesced_request() {
        let t0 = Instant::now();
        let mut c = controller(t0);
        assert_eq!(c.request_save(t0), RequestOutcome::Start);
        assert_eq!(c.request_save(t0 + SEC), RequestOutcome::Coalesced);
        c.begin_closing();
        assert!(c.state().pending_save_requested);

        // Not due by the save interval, yet the closing save still runs.
        assert_eq!(c.finish_success(t0 + 2 * SEC), None);
        assert_eq!(c.closing_follow_up(t0 + 2 * SEC), Some(RequestOutcome::Start));
        assert!(c.state().in_flight);

        assert_eq!(c.finish_success(t0 + 3 * SEC), None);
        assert_eq!(c.closing_follow_up(t0 + 3 * SEC), None);
        assert!(!c.state().in_flight);
    }

    #[test]
    fn closing_follow_up_survives_failed_attempt_without_retry() {
        let t0 = Instant::now();
        let mut c = controller(t0);
        c.request_save(t0);
        c.request_save(t0);
        c.begin_closing();
        assert_eq!(c.finish_failure(t0 + SEC), None);
        assert_eq!(c.retry_deadline(), None);
        assert_eq!(c.closing_follow_up(t0 + SEC), Some(RequestOutcome::Start));
    }

    #[test]
    fn closing_without_pending_request_starts_nothing() {
        let t0 = Instant::now();
        let mut c = controller(t0);
        c.request_save(t0);
        c.finish_failure(t0);
        c.begin_closing();
        assert_eq!(c.retry_deadline(), None);
        assert_eq!(c.closing_follow_up(t0 + SEC), None);
    }

    #[test]
    fn rejected_attempt_counts_but_schedules_no_retry() {
        let t0 = Instant::now();
        let mut c = controller(t0);
        c.request_save(t0);
        c.request_save(t0);
        c.finish_rejected();
        assert_eq!(c.state().failure_count, 1);
        assert!(!c.state().pending_save_requested);
        assert_eq!(c.phase(), Phase::Idle);
    }
}
