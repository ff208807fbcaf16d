//! Cooperative execution budget.
//!
//! The interpreter ticks the watchdog at loop back-edges and call
//! prologues. Once a budget is exhausted, or the host asked for it through
//! a [`TerminationHandle`], the next tick reports a termination reason and
//! the interpreter raises an uncatchable exception.

use std::{
    fmt,
    sync::Arc,
    time::{Duration, Instant},
};

use parking_lot::Mutex;

/// Ticks between two wall clock reads.
const TIME_CHECK_INTERVAL: u64 = 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminationReason {
    TickLimit(u64),
    TimeLimit(Duration),
    Requested(String),
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TerminationReason::TickLimit(n) => write!(f, "tick limit of {n} exceeded"),
            TerminationReason::TimeLimit(d) => write!(f, "time limit of {d:?} exceeded"),
            TerminationReason::Requested(why) => write!(f, "terminated by host: {why}"),
        }
    }
}

/// Lets another thread stop a running evaluation.
#[derive(Debug, Clone, Default)]
pub struct TerminationHandle(Arc<Mutex<Option<String>>>);

impl TerminationHandle {
    pub fn terminate(&self, reason: impl Into<String>) {
        *self.0.lock() = Some(reason.into());
    }

    fn take(&self) -> Option<String> {
        self.0.lock().take()
    }

    pub fn is_requested(&self) -> bool {
        self.0.lock().is_some()
    }
}

#[derive(Debug)]
pub struct Watchdog {
    tick_limit: Option<u64>,
    time_limit: Option<Duration>,
    ticks: u64,
    started: Instant,
    handle: TerminationHandle,
    fired: u32,
}

impl Watchdog {
    pub fn new(tick_limit: Option<u64>, time_limit: Option<Duration>) -> Self {
        Self {
            tick_limit,
            time_limit,
            ticks: 0,
            started: Instant::now(),
            handle: TerminationHandle::default(),
            fired: 0,
        }
    }

    pub fn handle(&self) -> TerminationHandle {
        self.handle.clone()
    }

    /// Reset the budget for a new top-level evaluation.
    pub fn start(&mut self) {
        self.ticks = 0;
        self.started = Instant::now();
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    /// Number of terminations this watchdog caused.
    pub fn fired(&self) -> u32 {
        self.fired
    }

    pub fn set_tick_limit(&mut self, limit: Option<u64>) {
        self.tick_limit = limit;
    }

    pub fn tick(&mut self) -> Option<TerminationReason> {
        self.ticks += 1;
        let reason = if let Some(why) = self.handle.take() {
            Some(TerminationReason::Requested(why))
        } else if let Some(limit) = self.tick_limit
            && self.ticks > limit
        {
            Some(TerminationReason::TickLimit(limit))
        } else if let Some(limit) = self.time_limit
            && self.ticks.is_multiple_of(TIME_CHECK_INTERVAL)
            && self.started.elapsed() > limit
        {
            Some(TerminationReason::TimeLimit(limit))
        } else {
            None
        };
        if let Some(reason) = &reason {
            self.fired += 1;
            log::warn!("watchdog: {reason}");
        }
        reason
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tick_limit_fires_once_exceeded() {
        let mut watchdog = Watchdog::new(Some(3), None);
        assert!(watchdog.tick().is_none());
        assert!(watchdog.tick().is_none());
        assert!(watchdog.tick().is_none());
        assert_eq!(watchdog.tick(), Some(TerminationReason::TickLimit(3)));
        watchdog.start();
        assert!(watchdog.tick().is_none());
    }

    #[test]
    fn handle_requests_termination_from_another_thread() {
        let mut watchdog = Watchdog::new(None, None);
        let handle = watchdog.handle();
        std::thread::spawn(move || handle.terminate("shutdown"))
            .join()
            .unwrap();
        assert_eq!(
            watchdog.tick(),
            Some(TerminationReason::Requested("shutdown".into()))
        );
        assert!(watchdog.tick().is_none());
        assert_eq!(watchdog.fired(), 1);
    }
}
