//! Cancellable countdown
//!
//! A countdown runs on its own tokio task and reports through an emit
//! callback: one tick per second carrying the remaining seconds, then
//! exactly one terminal event. Cancel and completion are decided under the
//! same lock, so a cancelled countdown never reports another tick.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Countdown lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CountdownPhase {
    Idle,
    Running,
    CompletedNaturally,
    Cancelled,
}

impl CountdownPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, CountdownPhase::CompletedNaturally | CountdownPhase::Cancelled)
    }
}

/// Events reported by a running countdown
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CountdownEvent {
    /// Seconds remaining (strictly decreasing, last one is 0)
    Tick(u32),

    /// Reached zero
    Completed,

    /// Stopped by `cancel()`
    Cancelled,
}

type Emitter = Arc<dyn Fn(CountdownEvent) + Send + Sync>;

struct Shared {
    phase: CountdownPhase,
    remaining: u32,
}

/// Fixed-duration countdown with explicit cancellation
pub struct CountdownController {
    shared: Arc<Mutex<Shared>>,
    token: CancellationToken,
    emit: Option<Emitter>,
    task: Option<JoinHandle<()>>,
}

impl CountdownController {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Mutex::new(Shared {
                phase: CountdownPhase::Idle,
                remaining: 0,
            })),
            token: CancellationToken::new(),
            emit: None,
            task: None,
        }
    }

    /// Start counting down from `duration_secs`
    ///
    /// The first tick carries the full duration and is emitted immediately.
    /// Starting a controller that is not idle is a no-op.
    pub fn start<F>(&mut self, duration_secs: u32, emit: F)
    where
        F: Fn(CountdownEvent) + Send + Sync + 'static,
    {
        let emit: Emitter = Arc::new(emit);

        {
            let mut shared = self.shared.lock();
            if shared.phase != CountdownPhase::Idle {
                debug!("Countdown already started, ignoring start()");
                return;
            }
            shared.remaining = duration_secs;
            emit(CountdownEvent::Tick(duration_secs));

            if duration_secs == 0 {
                shared.phase = CountdownPhase::CompletedNaturally;
                emit(CountdownEvent::Completed);
                info!("Zero-length countdown completed immediately");
                return;
            }
            shared.phase = CountdownPhase::Running;
        }

        info!("Countdown started: {}s", duration_secs);

        let shared = self.shared.clone();
        let token = self.token.clone();
        let task_emit = emit.clone();

        self.emit = Some(emit);
        self.task = Some(tokio::spawn(async move {
            let period = Duration::from_secs(1);
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Burst);

            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let mut state = shared.lock();
                        if state.phase != CountdownPhase::Running {
                            break;
                        }

                        state.remaining = state.remaining.saturating_sub(1);
                        task_emit(CountdownEvent::Tick(state.remaining));

                        if state.remaining == 0 {
                            state.phase = CountdownPhase::CompletedNaturally;
                            task_emit(CountdownEvent::Completed);
                            info!("Countdown completed");
                            break;
                        }
                    }
                }
            }
        }));
    }

    /// Stop the countdown; idempotent once terminal
    ///
    /// Returns true if this call cancelled a running countdown.
    pub fn cancel(&self) -> bool {
        let mut shared = self.shared.lock();
        if shared.phase != CountdownPhase::Running {
            debug!("cancel() on {:?} countdown is a no-op", shared.phase);
            return false;
        }

        shared.phase = CountdownPhase::Cancelled;
        self.token.cancel();

        if let Some(emit) = &self.emit {
            emit(CountdownEvent::Cancelled);
        }

        info!("Countdown cancelled with {}s remaining", shared.remaining);
        true
    }

    pub fn phase(&self) -> CountdownPhase {
        self.shared.lock().phase
    }

    pub fn remaining(&self) -> u32 {
        self.shared.lock().remaining
    }
}

impl Default for CountdownController {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for CountdownController {
    fn drop(&mut self) {
        self.token.cancel();
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Render seconds as `m:ss`
pub fn format_clock(secs: u32) -> String {
    format!("{}:{:02}", secs / 60, secs % 60)
}

/// Urgency shown alongside the remaining time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Urgency {
    Medium,
    High,
    Critical,
}

impl Urgency {
    pub fn for_remaining(secs: u32) -> Self {
        if secs <= 10 {
            Urgency::Critical
        } else if secs <= 30 {
            Urgency::High
        } else {
            Urgency::Medium
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Urgency::Medium => "MEDIUM",
            Urgency::High => "HIGH",
            Urgency::Critical => "CRITICAL",
        }
    }
}

/// Elapsed share of the countdown, 0..=100
pub fn progress_percent(total_secs: u32, remaining_secs: u32) -> u8 {
    if total_secs == 0 {
        return 100;
    }
    let elapsed = total_secs.saturating_sub(remaining_secs) as f64;
    ((elapsed / total_secs as f64) * 100.0).round() as u8
}
