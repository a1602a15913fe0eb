use log::{debug, trace};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Per-stage retry bookkeeping for the manager loop.
///
/// Each stage (connect, register, catalog poll, session request) owns one
/// of these. `try_begin` enforces at most one in-flight attempt, `reschedule`
/// arms at most one pending timer, and the shared `ended` flag lets a
/// shutdown cancel every timer that is still sleeping.
pub struct RetryLoop {
    label: &'static str,
    delay: Duration,
    in_flight: bool,
    armed: bool,
    ended: Arc<AtomicBool>,
}

impl RetryLoop {
    pub fn new(label: &'static str, delay: Duration, ended: Arc<AtomicBool>) -> Self {
        Self {
            label,
            delay,
            in_flight: false,
            armed: false,
            ended,
        }
    }

    /// Claims the in-flight slot. Returns false if an attempt is already
    /// running, in which case the caller must not start another one.
    pub fn try_begin(&mut self) -> bool {
        if self.in_flight {
            trace!("{}: attempt already in flight", self.label);
            return false;
        }
        self.in_flight = true;
        true
    }

    /// Marks the current attempt as finished, freeing the in-flight slot.
    pub fn finish(&mut self) {
        self.in_flight = false;
    }

    pub fn in_flight(&self) -> bool {
        self.in_flight
    }

    /// Forgets an in-flight attempt whose outcome will never be consumed,
    /// e.g. after the signalling channel it was issued on is gone.
    pub fn reset(&mut self) {
        self.in_flight = false;
    }

    /// Clears the armed flag when the timer's event is consumed. Ticks that
    /// arrive while disarmed are stale and must be dropped by the caller.
    pub fn disarm(&mut self) -> bool {
        let was_armed = self.armed;
        self.armed = false;
        was_armed
    }

    /// Arms a one-shot timer that posts `make_event()` to the manager queue
    /// after the configured delay. A second call while a timer is already
    /// armed is a no-op, so bursts of triggers collapse into one tick.
    pub fn reschedule<E, F>(&mut self, queue: &mpsc::UnboundedSender<E>, make_event: F)
    where
        E: Send + 'static,
        F: FnOnce() -> E + Send + 'static,
    {
        if self.armed {
            trace!("{}: timer already armed", self.label);
            return;
        }
        if self.ended.load(Ordering::SeqCst) {
            return;
        }
        self.armed = true;
        let label = self.label;
        let delay = self.delay;
        let ended = self.ended.clone();
        let queue = queue.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if ended.load(Ordering::SeqCst) {
                debug!("{}: retry timer cancelled by shutdown", label);
                return;
            }
            let _ = queue.send(make_event());
        });
    }
}
