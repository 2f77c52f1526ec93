//! Dial counters

use std::sync::atomic::{AtomicU64, Ordering};

/// Shared dial statistics using atomic counters for lock-free access
#[derive(Debug, Default)]
pub struct DialStats {
    pub attempts: AtomicU64,
    pub protected: AtomicU64,
    pub protect_failures: AtomicU64,
    pub connect_failures: AtomicU64,
    pub ignored_local_binds: AtomicU64,
}

impl DialStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a socket about to be set up for connecting
    pub fn record_attempt(&self) {
        self.attempts.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a socket acknowledged by the protector
    pub fn record_protected(&self) {
        self.protected.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a failed protection exchange
    pub fn record_protect_failure(&self) {
        self.protect_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a failed connect after setup
    pub fn record_connect_failure(&self) {
        self.connect_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a local bind address dropped in protected mode
    pub fn record_ignored_local_bind(&self) {
        self.ignored_local_binds.fetch_add(1, Ordering::Relaxed);
    }

    /// Get a snapshot of all counters
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            attempts: self.attempts.load(Ordering::Relaxed),
            protected: self.protected.load(Ordering::Relaxed),
            protect_failures: self.protect_failures.load(Ordering::Relaxed),
            connect_failures: self.connect_failures.load(Ordering::Relaxed),
            ignored_local_binds: self.ignored_local_binds.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`DialStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub attempts: u64,
    pub protected: u64,
    pub protect_failures: u64,
    pub connect_failures: u64,
    pub ignored_local_binds: u64,
}

impl std::fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "attempts={} protected={} protect_failures={} connect_failures={} ignored_local_binds={}",
            self.attempts,
            self.protected,
            self.protect_failures,
            self.connect_failures,
            self.ignored_local_binds
        )
    }
}
