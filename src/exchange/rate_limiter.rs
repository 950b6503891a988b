//! Sliding-window request limiter shared by every caller of one venue.
//!
//! Callers that find the window full join a FIFO queue; a background task
//! releases queued callers on a fixed tick as old timestamps leave the window.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};

struct Window {
    capacity: usize,
    window: Duration,
    /// Dispatch instants still inside the window, oldest first
    granted: VecDeque<Instant>,
    waiters: VecDeque<oneshot::Sender<()>>,
}

impl Window {
    fn prune(&mut self, now: Instant) {
        while let Some(&oldest) = self.granted.front() {
            if now.duration_since(oldest) >= self.window {
                self.granted.pop_front();
            } else {
                break;
            }
        }
    }

    fn has_room(&self) -> bool {
        self.granted.len() < self.capacity
    }

    fn release_waiters(&mut self, now: Instant) {
        self.prune(now);
        while self.has_room() {
            let Some(waiter) = self.waiters.pop_front() else {
                break;
            };
            // a dropped receiver gave up waiting and does not use a slot
            if waiter.send(()).is_ok() {
                self.granted.push_back(now);
            }
        }
    }
}

// a poisoned window still enforces the cap
fn lock(state: &Mutex<Window>) -> MutexGuard<'_, Window> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Rate limiter allowing `capacity` requests per sliding `window`.
pub struct RateLimiter {
    state: Arc<Mutex<Window>>,
    ticker: JoinHandle<()>,
}

impl RateLimiter {
    /// Must be called from within a tokio runtime.
    pub fn new(capacity: usize, window: Duration, tick: Duration) -> Self {
        let state = Arc::new(Mutex::new(Window {
            capacity: capacity.max(1),
            window,
            granted: VecDeque::new(),
            waiters: VecDeque::new(),
        }));

        let ticker = {
            let state = Arc::clone(&state);
            tokio::spawn(async move {
                let mut interval = time::interval(tick);
                interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    interval.tick().await;
                    lock(&state).release_waiters(Instant::now());
                }
            })
        };

        Self { state, ticker }
    }

    /// Wait until a request may be dispatched.
    pub async fn acquire(&self) {
        let rx = {
            let mut window = lock(&self.state);
            let now = Instant::now();
            window.prune(now);
            if window.waiters.is_empty() && window.has_room() {
                window.granted.push_back(now);
                return;
            }
            let (tx, rx) = oneshot::channel();
            window.waiters.push_back(tx);
            rx
        };
        let _ = rx.await;
    }

    /// Callers currently waiting for a slot.
    pub fn queued(&self) -> usize {
        lock(&self.state).waiters.len()
    }
}

impl Drop for RateLimiter {
    fn drop(&mut self) {
        self.ticker.abort();
    }
}
