// SPDX-License-Identifier: MIT
//
// IoT Hub Device Transport
// Copyright (c) 2025 Valer Bocan, PhD, CSSLP
// Email: valer.bocan@upt.ro
//
// Department of Computer and Information Technology
// Politehnica University of Timisoara

//! Transport counters

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Counters shared between the transport and whoever reports on it
#[derive(Clone)]
pub struct TransportMetrics {
    inner: Arc<MetricsInner>,
}

struct MetricsInner {
    start_time: Instant,

    // Telemetry
    events_sent: AtomicU64,
    events_failed: AtomicU64,
    batches_posted: AtomicU64,
    bytes_sent: AtomicU64,

    // Devicebound
    polls_issued: AtomicU64,
    messages_received: AtomicU64,
    dispositions_sent: AtomicU64,
    dispositions_failed: AtomicU64,
}

impl Default for TransportMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl TransportMetrics {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner {
                start_time: Instant::now(),
                events_sent: AtomicU64::new(0),
                events_failed: AtomicU64::new(0),
                batches_posted: AtomicU64::new(0),
                bytes_sent: AtomicU64::new(0),
                polls_issued: AtomicU64::new(0),
                messages_received: AtomicU64::new(0),
                dispositions_sent: AtomicU64::new(0),
                dispositions_failed: AtomicU64::new(0),
            }),
        }
    }

    pub fn record_events_sent(&self, count: usize, bytes: usize) {
        self.inner.events_sent.fetch_add(count as u64, Ordering::Relaxed);
        self.inner.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_events_failed(&self, count: usize) {
        self.inner.events_failed.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn record_batch(&self) {
        self.inner.batches_posted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_poll(&self) {
        self.inner.polls_issued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_message_received(&self) {
        self.inner.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_disposition(&self, succeeded: bool) {
        let counter = if succeeded {
            &self.inner.dispositions_sent
        } else {
            &self.inner.dispositions_failed
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.inner.start_time.elapsed().as_secs()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        MetricsSnapshot {
            uptime_seconds: self.uptime_seconds(),
            events_sent: load(&self.inner.events_sent),
            events_failed: load(&self.inner.events_failed),
            batches_posted: load(&self.inner.batches_posted),
            bytes_sent: load(&self.inner.bytes_sent),
            polls_issued: load(&self.inner.polls_issued),
            messages_received: load(&self.inner.messages_received),
            dispositions_sent: load(&self.inner.dispositions_sent),
            dispositions_failed: load(&self.inner.dispositions_failed),
        }
    }
}

/// Point-in-time copy of the counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub uptime_seconds: u64,
    pub events_sent: u64,
    pub events_failed: u64,
    pub batches_posted: u64,
    pub bytes_sent: u64,
    pub polls_issued: u64,
    pub messages_received: u64,
    pub dispositions_sent: u64,
    pub dispositions_failed: u64,
}
