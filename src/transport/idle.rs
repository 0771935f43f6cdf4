//! Backoff idle strategy for the duty cycle.

use std::thread;
use std::time::Duration;

use crate::core::IdleConfig;

/// Where the strategy is in its backoff sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdlePhase {
    /// Last iteration did work.
    NotIdle,
    /// Busy spinning.
    Spinning,
    /// Yielding the thread.
    Yielding,
    /// Parking with a growing period.
    Parking,
}

/// Spin, then yield, then park with a doubling period.
///
/// Parking uses [`thread::park_timeout`], so an `unpark` on the poller thread
/// cuts a park short.
#[derive(Debug)]
pub struct BackoffIdleStrategy {
    config: IdleConfig,
    phase: IdlePhase,
    spins: u32,
    yields: u32,
    park_period: Duration,
}

impl BackoffIdleStrategy {
    /// Create a strategy from its parameters.
    pub fn new(config: IdleConfig) -> Self {
        Self {
            config,
            phase: IdlePhase::NotIdle,
            spins: 0,
            yields: 0,
            park_period: config.min_park,
        }
    }

    /// Current phase.
    pub fn phase(&self) -> IdlePhase {
        self.phase
    }

    /// Next park period.
    pub fn park_period(&self) -> Duration {
        self.park_period
    }

    /// Idle according to the work done in the last iteration.
    pub fn idle(&mut self, work_count: usize) {
        if work_count > 0 {
            self.reset();
            return;
        }

        match self.phase {
            IdlePhase::NotIdle => {
                self.phase = IdlePhase::Spinning;
                self.spins = 1;
                std::hint::spin_loop();
            }
            IdlePhase::Spinning => {
                if self.spins < self.config.max_spins {
                    self.spins += 1;
                    std::hint::spin_loop();
                } else {
                    self.phase = IdlePhase::Yielding;
                    self.yields = 1;
                    thread::yield_now();
                }
            }
            IdlePhase::Yielding => {
                if self.yields < self.config.max_yields {
                    self.yields += 1;
                    thread::yield_now();
                } else {
                    self.phase = IdlePhase::Parking;
                    self.park_period = self.config.min_park;
                    thread::park_timeout(self.park_period);
                }
            }
            IdlePhase::Parking => {
                self.park_period = (self.park_period * 2).min(self.config.max_park);
                thread::park_timeout(self.park_period);
            }
        }
    }

    /// Back to the start of the sequence.
    pub fn reset(&mut self) {
        self.phase = IdlePhase::NotIdle;
        self.spins = 0;
        self.yields = 0;
        self.park_period = self.config.min_park;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strategy() -> BackoffIdleStrategy {
        BackoffIdleStrategy::new(IdleConfig {
            max_spins: 2,
            max_yields: 2,
            min_park: Duration::from_micros(1),
            max_park: Duration::from_micros(4),
        })
    }

    #[test]
    fn test_backoff_sequence() {
        let mut idle = strategy();
        assert_eq!(idle.phase(), IdlePhase::NotIdle);

        idle.idle(0);
        idle.idle(0);
        assert_eq!(idle.phase(), IdlePhase::Spinning);

        idle.idle(0);
        idle.idle(0);
        assert_eq!(idle.phase(), IdlePhase::Yielding);

        idle.idle(0);
        assert_eq!(idle.phase(), IdlePhase::Parking);
        assert_eq!(idle.park_period(), Duration::from_micros(1));

        idle.idle(0);
        idle.idle(0);
        idle.idle(0);
        assert_eq!(idle.park_period(), Duration::from_micros(4));
    }

    #[test]
    fn test_work_resets() {
        let mut idle = strategy();
        for _ in 0..10 {
            idle.idle(0);
        }
        assert_eq!(idle.phase(), IdlePhase::Parking);

        idle.idle(3);
        assert_eq!(idle.phase(), IdlePhase::NotIdle);
        assert_eq!(idle.park_period(), Duration::from_micros(1));
    }
}
