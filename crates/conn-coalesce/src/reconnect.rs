//! Automatic reconnection for a single named connection.
//!
//! A lost connection counts down, attempts an ensure, backs off and retries
//! until it succeeds or the policy's attempt budget runs out. Every attempt
//! goes through the shared [`CoalescingEnsurer`], so a manual ensure issued
//! elsewhere at the same moment joins the same remote call.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::ReconnectPolicy;
use crate::ensure::{CoalescingEnsurer, ConnectionEnsurer};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReconnectionState {
    #[default]
    Idle,
    /// Counting down to the next attempt.
    Pending,
    Attempting,
    /// Attempt budget exhausted.
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReconnectSnapshot {
    pub state: ReconnectionState,
    /// Attempts made in the current run; the in-progress one while attempting.
    pub attempts: u32,
    /// Seconds left before the next attempt while pending, rounded up.
    pub countdown_secs: u64,
}

impl ReconnectSnapshot {
    fn new(state: ReconnectionState, attempts: u32, countdown_secs: u64) -> Self {
        Self {
            state,
            attempts,
            countdown_secs,
        }
    }
}

struct Inner<C: ConnectionEnsurer> {
    conn_name: String,
    ensurer: CoalescingEnsurer<C>,
    policy: ReconnectPolicy,
    state: watch::Sender<ReconnectSnapshot>,
    // Bumped on cancel/restart; a superseded run stops publishing.
    epoch: Mutex<u64>,
}

impl<C> Inner<C>
where
    C: ConnectionEnsurer + 'static,
{
    fn publish(&self, epoch: u64, snapshot: ReconnectSnapshot) -> bool {
        let current = self.epoch.lock();
        if *current != epoch {
            return false;
        }
        self.state.send_replace(snapshot);
        true
    }

    /// Invalidates any running supervisor and publishes `snapshot` as the
    /// new starting point.
    fn supersede(&self, snapshot: ReconnectSnapshot) -> u64 {
        let mut current = self.epoch.lock();
        *current += 1;
        self.state.send_replace(snapshot);
        *current
    }

    async fn run(self: Arc<Self>, epoch: u64, first_delay: Duration) {
        let mut delay = first_delay;
        let mut attempt = 0u32;
        loop {
            if !self.count_down(epoch, attempt, delay).await {
                return;
            }
            attempt += 1;
            if !self.publish(
                epoch,
                ReconnectSnapshot::new(ReconnectionState::Attempting, attempt, 0),
            ) {
                return;
            }
            debug!(conn = %self.conn_name, attempt, "reconnect attempt");

            match self.ensurer.ensure(&self.conn_name).await {
                Ok(()) => {
                    info!(conn = %self.conn_name, attempt, "reconnected");
                    self.publish(epoch, ReconnectSnapshot::default());
                    return;
                }
                Err(err) => {
                    warn!(
                        conn = %self.conn_name,
                        attempt,
                        max_attempts = self.policy.max_attempts,
                        error = %err,
                        "reconnect attempt failed"
                    );
                    if attempt >= self.policy.max_attempts {
                        self.publish(
                            epoch,
                            ReconnectSnapshot::new(ReconnectionState::Failed, attempt, 0),
                        );
                        return;
                    }
                    delay = self.policy.backoff_after(attempt);
                }
            }
        }
    }

    /// Publishes a pending countdown, ticking once per second (a fractional
    /// remainder makes the final tick shorter). Returns false
    /// if the run was superseded meanwhile.
    async fn count_down(&self, epoch: u64, attempts: u32, delay: Duration) -> bool {
        if delay.is_zero() {
            return true;
        }
        let mut remaining = delay;
        while !remaining.is_zero() {
            let secs = whole_secs(remaining);
            if !self.publish(
                epoch,
                ReconnectSnapshot::new(ReconnectionState::Pending, attempts, secs),
            ) {
                return false;
            }
            // The last tick only sleeps the fractional remainder.
            let tick = remaining.min(Duration::from_secs(1));
            tokio::time::sleep(tick).await;
            remaining -= tick;
        }
        true
    }
}

/// Supervises reconnection of one connection name.
///
/// At most one supervisor task runs at a time. Dropping the reconnector stops
/// it, but never cancels an ensure already handed to the coalescer.
pub struct Reconnector<C: ConnectionEnsurer + 'static> {
    inner: Arc<Inner<C>>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl<C> Reconnector<C>
where
    C: ConnectionEnsurer + 'static,
{
    pub fn new(
        conn_name: impl Into<String>,
        ensurer: CoalescingEnsurer<C>,
        policy: ReconnectPolicy,
    ) -> Self {
        let (state, _) = watch::channel(ReconnectSnapshot::default());
        Self {
            inner: Arc::new(Inner {
                conn_name: conn_name.into(),
                ensurer,
                policy,
                state,
                epoch: Mutex::new(0),
            }),
            supervisor: Mutex::new(None),
        }
    }

    pub fn conn_name(&self) -> &str {
        &self.inner.conn_name
    }

    pub fn policy(&self) -> &ReconnectPolicy {
        &self.inner.policy
    }

    pub fn snapshot(&self) -> ReconnectSnapshot {
        *self.inner.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ReconnectSnapshot> {
        self.inner.state.subscribe()
    }

    /// Start automatic reconnection after the policy's initial countdown.
    /// Does nothing while a supervisor is already counting down or attempting.
    pub fn connection_lost(&self) {
        let mut supervisor = self.supervisor.lock();
        if matches!(
            self.snapshot().state,
            ReconnectionState::Pending | ReconnectionState::Attempting
        ) {
            debug!(conn = %self.inner.conn_name, "reconnect already scheduled");
            return;
        }
        if let Some(task) = supervisor.take() {
            task.abort();
        }
        let delay = self.inner.policy.initial_delay;
        info!(
            conn = %self.inner.conn_name,
            delay_secs = delay.as_secs(),
            "connection lost, scheduling reconnect"
        );
        *supervisor = Some(self.spawn_run(delay));
    }

    /// Skip any countdown and attempt right away with a fresh attempt budget.
    pub fn manual_reconnect(&self) {
        let mut supervisor = self.supervisor.lock();
        if let Some(task) = supervisor.take() {
            task.abort();
        }
        info!(conn = %self.inner.conn_name, "manual reconnect");
        *supervisor = Some(self.spawn_run(Duration::ZERO));
    }

    /// Stop the supervisor and return to idle.
    pub fn cancel(&self) {
        let mut supervisor = self.supervisor.lock();
        if let Some(task) = supervisor.take() {
            task.abort();
        }
        self.inner.supersede(ReconnectSnapshot::default());
        debug!(conn = %self.inner.conn_name, "reconnect cancelled");
    }

    // The first snapshot is published before returning so observers never
    // see a stale state after `connection_lost` or `manual_reconnect`.
    fn spawn_run(&self, delay: Duration) -> JoinHandle<()> {
        let initial = if delay.is_zero() {
            ReconnectSnapshot::new(ReconnectionState::Attempting, 1, 0)
        } else {
            ReconnectSnapshot::new(ReconnectionState::Pending, 0, whole_secs(delay))
        };
        let epoch = self.inner.supersede(initial);
        tokio::spawn(Arc::clone(&self.inner).run(epoch, delay))
    }
}

impl<C> Drop for Reconnector<C>
where
    C: ConnectionEnsurer + 'static,
{
    fn drop(&mut self) {
        if let Some(task) = self.supervisor.get_mut().take() {
            task.abort();
        }
    }
}

fn whole_secs(delay: Duration) -> u64 {
    delay.as_secs() + u64::from(delay.subsec_nanos() > 0)
}
