//! Clock & Timer (C1, spec §4.1): a monotonic time source plus one-shot
//! delayed callbacks that all fire on the single driver task (spec §5).
//!
//! Grounded on the teacher's `SegmentScheduler::run()` (`hls/scheduler.rs`),
//! which drives its batch-window and per-job timers from one
//! `tokio::select!` loop rather than self-posting tasks; here the same
//! shape is factored out as a reusable wheel keyed by an opaque handle.

use std::time::{Duration, Instant};

use tokio_util::time::{delay_queue, DelayQueue};

/// Monotonic time source. `now_ms()` is relative to when the clock was
/// constructed, not wall-clock time; the tracker never calls wall-clock
/// functions directly (spec §4.1).
#[derive(Debug, Clone)]
pub struct Clock {
    epoch: Instant,
}

impl Clock {
    pub fn new() -> Self {
        Self { epoch: Instant::now() }
    }

    pub fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

/// Opaque handle to a scheduled timer, returned by [`TimerWheel::schedule`].
/// Wraps a `tokio_util::time::delay_queue::Key` so the driver can cancel
/// without knowing anything about `DelayQueue`'s internals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerHandle(delay_queue::Key);

/// A collection of pending one-shot timers, each carrying a payload `T`
/// identifying what to do when it fires (e.g. a bundle id). The driver
/// loop polls this with `tokio::select!` alongside its other event
/// sources, exactly as the teacher's scheduler polls its `FuturesUnordered`
/// of in-flight jobs.
#[derive(Debug)]
pub struct TimerWheel<T> {
    queue: DelayQueue<T>,
}

impl<T> TimerWheel<T> {
    pub fn new() -> Self {
        Self { queue: DelayQueue::new() }
    }

    /// `schedule(delayMs, callback) -> handle` (spec §4.1). The payload
    /// takes the place of the callback: when the timer fires, the driver
    /// reads it back out of the expired entry and dispatches on it.
    pub fn schedule(&mut self, delay: Duration, payload: T) -> TimerHandle {
        TimerHandle(self.queue.insert(payload, delay))
    }

    /// `cancel(handle)`. A no-op if the timer already fired or was already
    /// canceled.
    pub fn cancel(&mut self, handle: TimerHandle) {
        if self.queue.try_remove(&handle.0).is_none() {
            // Already fired or already removed; cancellation is idempotent.
        }
    }

    /// Reschedules an existing timer to a new delay without allocating a
    /// new handle, used when a bundle's `earliestNextLoadMs` is pushed out
    /// before the original timer fires.
    pub fn reset(&mut self, handle: TimerHandle, delay: Duration) {
        self.queue.reset(&handle.0, delay);
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Waits for the next timer to fire and returns its payload. Cancels
    /// cleanly when polled inside a `tokio::select!` alongside other
    /// branches: an empty wheel simply never resolves this future.
    pub async fn next(&mut self) -> T {
        use futures::StreamExt;
        loop {
            match self.queue.next().await {
                Some(Ok(expired)) => return expired.into_inner(),
                Some(Err(_)) => continue,
                None => std::future::pending::<()>().await,
            }
        }
    }
}

impl<T> Default for TimerWheel<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn now_ms_is_nondecreasing() {
        let clock = Clock::new();
        let a = clock.now_ms();
        std::thread::sleep(Duration::from_millis(5));
        let b = clock.now_ms();
        assert!(b >= a);
    }

    #[tokio::test]
    async fn schedule_then_cancel_never_fires() {
        let mut wheel: TimerWheel<u32> = TimerWheel::new();
        let handle = wheel.schedule(Duration::from_millis(50), 1);
        wheel.cancel(handle);
        assert!(wheel.is_empty());
        tokio::select! {
            _ = wheel.next() => panic!("canceled timer fired"),
            _ = tokio::time::sleep(Duration::from_millis(80)) => {}
        }
    }

    #[tokio::test]
    async fn schedule_fires_with_payload() {
        let mut wheel: TimerWheel<&'static str> = TimerWheel::new();
        wheel.schedule(Duration::from_millis(1), "fired");
        let payload = wheel.next().await;
        assert_eq!(payload, "fired");
    }
}
