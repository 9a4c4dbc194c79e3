//! Activity monitor: the per-record idle timer.
//!
//! Every edit re-arms the timer for `now + idle_window`. When the deadline
//! passes without another edit, the `on_idle` callback runs once on the
//! monitor's worker thread with the record generation that armed it.
//!
//! Each arm or cancel bumps a token under the state lock. The worker only
//! fires if the token it armed with is still current, so a superseded or
//! cancelled deadline can never fire, even if its control message is still
//! in flight.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{after, never, select, unbounded, Receiver, Sender};
use tracing::{debug, trace};

use crate::error::{lock_poisoned, IntakeError, IntakeResult, ValidationError};

/// Idle-timer configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivityConfig {
    /// Silence after the last edit before the record is marked inactive.
    pub idle_window: Duration,
}

impl Default for ActivityConfig {
    fn default() -> Self {
        Self {
            idle_window: Duration::from_millis(10_000),
        }
    }
}

impl ActivityConfig {
    /// Rejects a zero idle window.
    pub fn validate(self) -> Result<Self, ValidationError> {
        if self.idle_window.is_zero() {
            return Err(ValidationError::InvalidConfig {
                reason: "idle_window must be greater than zero".to_string(),
            });
        }
        Ok(self)
    }
}

#[derive(Debug)]
enum TimerMsg {
    Arm { token: u64, generation: u64, deadline: Instant },
    Cancel,
}

#[derive(Debug, Default)]
struct TimerState {
    token: u64,
    deadline: Option<Instant>,
}

/// The idle timer of one record.
#[derive(Debug)]
pub struct ActivityMonitor {
    idle_window: Duration,
    control_tx: Option<Sender<TimerMsg>>,
    state: Arc<Mutex<TimerState>>,
    fired: Arc<AtomicU64>,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl ActivityMonitor {
    /// Starts the timer worker. Nothing is armed until the first `on_edit`.
    pub fn start<F>(cfg: ActivityConfig, on_idle: F) -> IntakeResult<Self>
    where
        F: Fn(u64) + Send + 'static,
    {
        let cfg = cfg.validate()?;
        // Unbounded: `on_edit` runs under the session lock and must never
        // wait on a worker that may itself be waiting for that lock.
        let (control_tx, control_rx) = unbounded::<TimerMsg>();
        let state = Arc::new(Mutex::new(TimerState::default()));
        let fired = Arc::new(AtomicU64::new(0));

        let worker_state = Arc::clone(&state);
        let worker_fired = Arc::clone(&fired);
        let join = thread::Builder::new()
            .name("intake-activity".to_string())
            .spawn(move || timer_loop(&control_rx, &worker_state, &worker_fired, on_idle))
            .map_err(|e| IntakeError::internal(format!("failed to spawn activity timer: {e}")))?;

        Ok(Self {
            idle_window: cfg.idle_window,
            control_tx: Some(control_tx),
            state,
            fired,
            join: Mutex::new(Some(join)),
        })
    }

    /// Configured idle window.
    #[must_use]
    pub const fn idle_window(&self) -> Duration {
        self.idle_window
    }

    /// Cancels any pending deadline and arms a new one for `now + idle_window`.
    ///
    /// `generation` is handed back to `on_idle` so the owner can tell
    /// whether the record changed in the meantime.
    pub fn on_edit(&self, generation: u64) -> IntakeResult<Instant> {
        let deadline = Instant::now() + self.idle_window;
        let mut state = self.state.lock().map_err(|_| lock_poisoned("activity timer"))?;
        state.token += 1;
        state.deadline = Some(deadline);
        self.send(TimerMsg::Arm {
            token: state.token,
            generation,
            deadline,
        })?;
        trace!(generation, token = state.token, "idle timer armed");
        Ok(deadline)
    }

    /// Cancels the pending deadline, if any. Idempotent.
    pub fn cancel(&self) -> IntakeResult<()> {
        let mut state = self.state.lock().map_err(|_| lock_poisoned("activity timer"))?;
        if state.deadline.take().is_none() {
            return Ok(());
        }
        state.token += 1;
        self.send(TimerMsg::Cancel)?;
        trace!(token = state.token, "idle timer cancelled");
        Ok(())
    }

    /// Returns true while a deadline is armed and has not fired.
    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.state.lock().map(|s| s.deadline.is_some()).unwrap_or(false)
    }

    /// The armed deadline, if any.
    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        self.state.lock().ok().and_then(|s| s.deadline)
    }

    /// Number of times the timer has fired.
    #[must_use]
    pub fn fired(&self) -> u64 {
        self.fired.load(Ordering::Relaxed)
    }

    /// Cancels the timer and stops the worker. Later calls to `on_edit` fail.
    pub fn shutdown(&mut self) {
        let _ = self.cancel();
        drop(self.control_tx.take());
        if let Ok(mut guard) = self.join.lock() {
            if let Some(handle) = guard.take() {
                // The owner may be dropped from inside `on_idle`; never join
                // the worker from its own thread.
                if handle.thread().id() != thread::current().id() {
                    let _ = handle.join();
                }
            }
        }
    }

    fn send(&self, msg: TimerMsg) -> IntakeResult<()> {
        let tx = self
            .control_tx
            .as_ref()
            .ok_or_else(|| IntakeError::internal("activity timer is shut down"))?;
        tx.send(msg)
            .map_err(|_| IntakeError::internal("activity timer worker exited"))
    }
}

impl Drop for ActivityMonitor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn timer_loop<F>(control_rx: &Receiver<TimerMsg>, state: &Mutex<TimerState>, fired: &AtomicU64, on_idle: F)
where
    F: Fn(u64),
{
    // (token, generation, deadline)
    let mut armed: Option<(u64, u64, Instant)> = None;

    loop {
        let timeout = match armed {
            Some((_, _, deadline)) => after(deadline.saturating_duration_since(Instant::now())),
            None => never(),
        };

        select! {
            recv(control_rx) -> msg => match msg {
                Ok(TimerMsg::Arm { token, generation, deadline }) => armed = Some((token, generation, deadline)),
                Ok(TimerMsg::Cancel) => armed = None,
                Err(_) => break,
            },
            recv(timeout) -> _ => {
                let Some((token, generation, _)) = armed.take() else {
                    continue;
                };
                let current = match state.lock() {
                    Ok(mut guard) if guard.token == token => {
                        guard.deadline = None;
                        true
                    }
                    _ => false,
                };
                if current {
                    fired.fetch_add(1, Ordering::Relaxed);
                    debug!(generation, "idle window elapsed");
                    on_idle(generation);
                }
            },
        }
    }
}
