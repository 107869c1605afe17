use std::{
    fmt,
    sync::atomic::{AtomicU64, Ordering},
};

use serde::Serialize;

/// Runtime counters of a tracing session.
#[derive(Debug, Default)]
pub struct Stats {
    events: AtomicU64,
    lost_events: AtomicU64,
    errors: AtomicU64,
}

impl Stats {
    pub fn add_event(&self) {
        self.events.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_lost_events(&self, lost: u64) {
        self.lost_events.fetch_add(lost, Ordering::Relaxed);
    }

    pub fn add_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            events: self.events.load(Ordering::Relaxed),
            lost_events: self.lost_events.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub events: u64,
    pub lost_events: u64,
    pub errors: u64,
}

impl fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "events: {}, lost: {}, errors: {}",
            self.events, self.lost_events, self.errors
        )
    }
}
