//! Hashed timer wheel owned by the poller.
//!
//! Buckets are a power of two; a timer lands in `deadline_tick & mask` and is
//! fired once the wheel has advanced past its deadline. Timers further out
//! than one revolution stay in their bucket until their round comes up.
//!
//! Other threads never touch the wheel. They hand tasks to the poller through
//! a [`Scheduler`] and cancel them through the returned [`TimerToken`].
//! Cancellation is a flag checked before firing, never a removal.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;

use crate::core::ConfigError;

/// Callback run on the poller thread when a timer fires.
pub type TimerTask = Box<dyn FnOnce() + Send + 'static>;

/// Cancellation flag shared between the scheduler of a task and the wheel.
#[derive(Debug, Clone, Default)]
pub struct TimerToken(Arc<AtomicBool>);

impl TimerToken {
    /// Fresh, uncancelled token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Prevent the task from firing. Idempotent.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    /// Whether [`cancel`](Self::cancel) was called.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

struct Timer<T> {
    deadline_tick: u64,
    token: TimerToken,
    payload: T,
}

/// Single-level hashed timing wheel.
pub struct TimerWheel<T> {
    buckets: Vec<Vec<Timer<T>>>,
    mask: u64,
    tick: Duration,
    start: Instant,
    cursor: u64,
    pending: usize,
}

impl<T> std::fmt::Debug for TimerWheel<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerWheel")
            .field("buckets", &self.buckets.len())
            .field("tick", &self.tick)
            .field("cursor", &self.cursor)
            .field("pending", &self.pending)
            .finish()
    }
}

impl<T> TimerWheel<T> {
    /// Create a wheel with `buckets` slots of `tick` each.
    pub fn new(tick: Duration, buckets: usize) -> Result<Self, ConfigError> {
        Self::starting_at(tick, buckets, Instant::now())
    }

    fn starting_at(tick: Duration, buckets: usize, start: Instant) -> Result<Self, ConfigError> {
        if tick.is_zero() {
            return Err(ConfigError::ZeroTick);
        }
        if buckets == 0 || !buckets.is_power_of_two() {
            return Err(ConfigError::TimerBuckets(buckets));
        }
        Ok(Self {
            buckets: (0..buckets).map(|_| Vec::new()).collect(),
            mask: (buckets - 1) as u64,
            tick,
            start,
            cursor: 0,
            pending: 0,
        })
    }

    /// Tick duration.
    pub fn tick(&self) -> Duration {
        self.tick
    }

    /// Timers not yet fired or purged, cancelled ones included.
    pub fn pending(&self) -> usize {
        self.pending
    }

    fn tick_of(&self, at: Instant) -> u64 {
        let nanos = at.saturating_duration_since(self.start).as_nanos();
        (nanos / self.tick.as_nanos()) as u64
    }

    /// Schedule `payload` for `deadline` and return its cancellation token.
    pub fn schedule(&mut self, deadline: Instant, payload: T) -> TimerToken {
        let token = TimerToken::new();
        self.insert(deadline, token.clone(), payload);
        token
    }

    /// Schedule `payload` under an existing token.
    pub fn insert(&mut self, deadline: Instant, token: TimerToken, payload: T) {
        let nanos = deadline.saturating_duration_since(self.start).as_nanos();
        // Round up so a timer never fires before its deadline; anything
        // already due goes to the next tick.
        let deadline_tick = (nanos.div_ceil(self.tick.as_nanos()) as u64).max(self.cursor + 1);
        let slot = (deadline_tick & self.mask) as usize;
        self.buckets[slot].push(Timer {
            deadline_tick,
            token,
            payload,
        });
        self.pending += 1;
    }

    /// Whether the wheel has ticks to process at `now`.
    pub fn is_due(&self, now: Instant) -> bool {
        self.pending > 0 && self.tick_of(now) > self.cursor
    }

    /// Advance to `now`, calling `on_fire` for every uncancelled due timer.
    ///
    /// Returns the number of timers fired.
    pub fn expire(&mut self, now: Instant, mut on_fire: impl FnMut(T)) -> usize {
        let now_tick = self.tick_of(now);
        if now_tick <= self.cursor {
            return 0;
        }

        let span = (now_tick - self.cursor).min(self.buckets.len() as u64);
        let mut fired = 0;
        for offset in 1..=span {
            let slot = ((self.cursor + offset) & self.mask) as usize;
            let bucket = std::mem::take(&mut self.buckets[slot]);
            for timer in bucket {
                if timer.token.is_cancelled() {
                    self.pending -= 1;
                } else if timer.deadline_tick <= now_tick {
                    self.pending -= 1;
                    fired += 1;
                    on_fire(timer.payload);
                } else {
                    self.buckets[slot].push(timer);
                }
            }
        }
        self.cursor = now_tick;
        fired
    }
}

/// Task handed to the poller for insertion into its wheel.
pub struct ScheduledTask {
    pub(crate) deadline: Instant,
    pub(crate) token: TimerToken,
    pub(crate) task: TimerTask,
}

/// Receiving end of a [`Scheduler`], drained by the poller.
pub(crate) type ScheduledTaskQueue = mpsc::UnboundedReceiver<ScheduledTask>;

/// Cross-thread handle for scheduling tasks on a poller's timer wheel.
#[derive(Clone)]
pub struct Scheduler {
    tx: mpsc::UnboundedSender<ScheduledTask>,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("closed", &self.tx.is_closed())
            .finish()
    }
}

impl Scheduler {
    pub(crate) fn channel() -> (Self, ScheduledTaskQueue) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Run `task` on the poller thread after `delay`.
    pub fn schedule_after<F>(&self, delay: Duration, task: F) -> TimerToken
    where
        F: FnOnce() + Send + 'static,
    {
        self.schedule_at(Instant::now() + delay, task)
    }

    /// Run `task` on the poller thread at or after `deadline`.
    ///
    /// If the poller has stopped the returned token is already cancelled.
    pub fn schedule_at<F>(&self, deadline: Instant, task: F) -> TimerToken
    where
        F: FnOnce() + Send + 'static,
    {
        let token = TimerToken::new();
        let scheduled = ScheduledTask {
            deadline,
            token: token.clone(),
            task: Box::new(task),
        };
        if self.tx.send(scheduled).is_err() {
            token.cancel();
        }
        token
    }
}
