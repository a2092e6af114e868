//! Thread-safe failover statistics
//!
//! Each failover transport owns a [`FailoverMetrics`] collector. Counters are
//! atomics so the reconnect task and client tasks can record without taking
//! the transport's reconnect lock.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

/// Failover statistics collector
#[derive(Debug, Default)]
pub struct FailoverMetrics {
    connected: AtomicBool,
    connection_attempts: AtomicU64,
    connections_established: AtomicU64,
    connection_failures: AtomicU64,
    interruptions: AtomicU64,
    backups_promoted: AtomicU64,
    restores_failed: AtomicU64,
    commands_sent: AtomicU64,
    commands_replayed: AtomicU64,
    last_connected_at: Mutex<Option<DateTime<Utc>>>,
    last_connected_uri: Mutex<Option<String>>,
}

impl FailoverMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connection_attempt(&self) {
        self.connection_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_established(&self, uri: &str) {
        self.connections_established.fetch_add(1, Ordering::Relaxed);
        self.connected.store(true, Ordering::Relaxed);
        *self
            .last_connected_at
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(Utc::now());
        *self
            .last_connected_uri
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(uri.to_string());
    }

    pub fn connection_failed(&self) {
        self.connection_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_interrupted(&self) {
        self.interruptions.fetch_add(1, Ordering::Relaxed);
        self.connected.store(false, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.connected.store(false, Ordering::Relaxed);
    }

    pub fn backup_promoted(&self) {
        self.backups_promoted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn restore_failed(&self) {
        self.restores_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn command_sent(&self) {
        self.commands_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn commands_replayed(&self, count: u64) {
        self.commands_replayed.fetch_add(count, Ordering::Relaxed);
    }

    /// Point-in-time copy of every counter
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            connected: self.connected.load(Ordering::Relaxed),
            connection_attempts: self.connection_attempts.load(Ordering::Relaxed),
            connections_established: self.connections_established.load(Ordering::Relaxed),
            connection_failures: self.connection_failures.load(Ordering::Relaxed),
            interruptions: self.interruptions.load(Ordering::Relaxed),
            backups_promoted: self.backups_promoted.load(Ordering::Relaxed),
            restores_failed: self.restores_failed.load(Ordering::Relaxed),
            commands_sent: self.commands_sent.load(Ordering::Relaxed),
            commands_replayed: self.commands_replayed.load(Ordering::Relaxed),
            last_connected_at: *self
                .last_connected_at
                .lock()
                .unwrap_or_else(|e| e.into_inner()),
            last_connected_uri: self
                .last_connected_uri
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .clone(),
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub connected: bool,
    pub connection_attempts: u64,
    pub connections_established: u64,
    pub connection_failures: u64,
    pub interruptions: u64,
    pub backups_promoted: u64,
    pub restores_failed: u64,
    pub commands_sent: u64,
    pub commands_replayed: u64,
    pub last_connected_at: Option<DateTime<Utc>>,
    pub last_connected_uri: Option<String>,
    pub timestamp: DateTime<Utc>,
}
