// src/scheduler.rs
//
// Fixed-interval tick bookkeeping. The owner drives it from its own loop,
// so ticks always run on the control thread.

use log::debug;

use std::time::{Duration, Instant};

use crate::globals::{UPDATE_INTERVAL_DEFAULT, UPDATE_INTERVAL_MAX, UPDATE_INTERVAL_MIN};

/// Clamp to 0.1..=20 s and round to one decimal.
pub fn clamp_interval(seconds: f64) -> f64 {
    if !seconds.is_finite() {
        return UPDATE_INTERVAL_DEFAULT;
    }
    let clamped = seconds.clamp(UPDATE_INTERVAL_MIN, UPDATE_INTERVAL_MAX);
    (clamped * 10.0).round() / 10.0
}

#[derive(Debug, Clone)]
pub struct RecurringTask {
    interval: Duration,
    next_due: Option<Instant>,
}

impl RecurringTask {
    pub fn new(seconds: f64) -> Self {
        Self {
            interval: Duration::from_secs_f64(clamp_interval(seconds)),
            next_due: None,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Arm the task; the first tick is due immediately.
    pub fn start(&mut self, now: Instant) {
        self.next_due = Some(now);
    }

    pub fn stop(&mut self) {
        self.next_due = None;
    }

    pub fn is_running(&self) -> bool {
        self.next_due.is_some()
    }

    /// Change the interval. A running task restarts its period from `now`;
    /// the returned value is the interval actually used.
    pub fn reschedule(&mut self, seconds: f64, now: Instant) -> f64 {
        let clamped = clamp_interval(seconds);
        self.interval = Duration::from_secs_f64(clamped);
        if self.next_due.is_some() {
            self.next_due = Some(now + self.interval);
        }
        debug!("Update interval set to {:.1} s", clamped);
        clamped
    }

    /// Time left before the next tick, or `None` when stopped.
    pub fn time_until_due(&self, now: Instant) -> Option<Duration> {
        self.next_due.map(|due| due.saturating_duration_since(now))
    }

    /// True when a tick is due at `now`; advances the schedule. Missed
    /// periods are skipped rather than replayed.
    pub fn poll_due(&mut self, now: Instant) -> bool {
        let Some(due) = self.next_due else {
            return false;
        };
        if now < due {
            return false;
        }
        let mut next = due + self.interval;
        if next <= now {
            next = now + self.interval;
        }
        self.next_due = Some(next);
        true
    }
}
