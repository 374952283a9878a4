#![forbid(unsafe_code)]

// Server metrics - lock-free AtomicU64 counters and a Prometheus-compatible
// histogram, rendered in text exposition format on /metrics.

use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering::Relaxed};
use std::sync::Arc;
use std::time::Duration;

/// Fixed histogram bucket boundaries (microseconds internally).
const BUCKET_BOUNDS_US: [u64; 10] = [
    1_000,     // 1ms
    5_000,     // 5ms
    10_000,    // 10ms
    25_000,    // 25ms
    50_000,    // 50ms
    100_000,   // 100ms
    250_000,   // 250ms
    500_000,   // 500ms
    1_000_000, // 1s
    5_000_000, // 5s
];

/// Prometheus-compatible cumulative histogram with fixed buckets.
struct Histogram {
    buckets: [AtomicU64; 10],
    count: AtomicU64,
    sum_us: AtomicU64,
}

impl Histogram {
    fn new() -> Self {
        Self {
            buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            count: AtomicU64::new(0),
            sum_us: AtomicU64::new(0),
        }
    }

    fn observe(&self, duration: Duration) {
        let us = duration.as_micros() as u64;
        self.sum_us.fetch_add(us, Relaxed);
        self.count.fetch_add(1, Relaxed);
        for (i, &bound) in BUCKET_BOUNDS_US.iter().enumerate() {
            if us <= bound {
                self.buckets[i].fetch_add(1, Relaxed);
            }
        }
    }

    fn render(&self, name: &str, help: &str, out: &mut String) {
        let _ = writeln!(out, "# HELP {name} {help}");
        let _ = writeln!(out, "# TYPE {name} histogram");
        let labels = [
            "0.001", "0.005", "0.01", "0.025", "0.05", "0.1", "0.25", "0.5", "1", "5",
        ];
        for (i, label) in labels.iter().enumerate() {
            let val = self.buckets[i].load(Relaxed);
            let _ = writeln!(out, "{name}_bucket{{le=\"{label}\"}} {val}");
        }
        let count = self.count.load(Relaxed);
        let _ = writeln!(out, "{name}_bucket{{le=\"+Inf\"}} {count}");
        let sum_us = self.sum_us.load(Relaxed);
        let _ = writeln!(out, "{name}_sum {}.{:06}", sum_us / 1_000_000, sum_us % 1_000_000);
        let _ = writeln!(out, "{name}_count {count}");
    }
}

struct Inner {
    connections_total: AtomicU64,
    connections_active: AtomicU64,
    events_received_total: AtomicU64,
    events_sent_total: AtomicU64,
    errors_total: AtomicU64,
    rooms_created_total: AtomicU64,
    joins_total: AtomicU64,
    leaves_total: AtomicU64,
    producers_created_total: AtomicU64,
    consumers_created_total: AtomicU64,
    event_handling: Histogram,
}

/// Server-wide metrics using lock-free atomics.
#[derive(Clone)]
pub struct ServerMetrics {
    inner: Arc<Inner>,
}

impl Default for ServerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerMetrics {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                connections_total: AtomicU64::new(0),
                connections_active: AtomicU64::new(0),
                events_received_total: AtomicU64::new(0),
                events_sent_total: AtomicU64::new(0),
                errors_total: AtomicU64::new(0),
                rooms_created_total: AtomicU64::new(0),
                joins_total: AtomicU64::new(0),
                leaves_total: AtomicU64::new(0),
                producers_created_total: AtomicU64::new(0),
                consumers_created_total: AtomicU64::new(0),
                event_handling: Histogram::new(),
            }),
        }
    }

    pub fn inc_connections_total(&self) {
        self.inner.connections_total.fetch_add(1, Relaxed);
    }

    /// RAII gauge: increments on creation, decrements on drop.
    pub fn connection_active_guard(&self) -> ConnectionGuard {
        self.inner.connections_active.fetch_add(1, Relaxed);
        ConnectionGuard {
            metrics: self.clone(),
        }
    }

    pub fn inc_events_received(&self) {
        self.inner.events_received_total.fetch_add(1, Relaxed);
    }

    pub fn inc_events_sent(&self) {
        self.inner.events_sent_total.fetch_add(1, Relaxed);
    }

    pub fn inc_errors(&self) {
        self.inner.errors_total.fetch_add(1, Relaxed);
    }

    pub fn inc_rooms_created(&self) {
        self.inner.rooms_created_total.fetch_add(1, Relaxed);
    }

    pub fn inc_joins(&self) {
        self.inner.joins_total.fetch_add(1, Relaxed);
    }

    pub fn inc_leaves(&self) {
        self.inner.leaves_total.fetch_add(1, Relaxed);
    }

    pub fn inc_producers_created(&self) {
        self.inner.producers_created_total.fetch_add(1, Relaxed);
    }

    pub fn inc_consumers_created(&self) {
        self.inner.consumers_created_total.fetch_add(1, Relaxed);
    }

    pub fn observe_event_handling(&self, duration: Duration) {
        self.inner.event_handling.observe(duration);
    }

    /// Prometheus text exposition. Gauges for current topology come from the
    /// caller since they live in the registry and media engine.
    pub fn render_prometheus(&self, rooms: usize, members: usize, workers: usize) -> String {
        let mut out = String::with_capacity(2048);
        let counters = [
            (
                "castroom_connections_total",
                "Total WebSocket connections accepted",
                self.inner.connections_total.load(Relaxed),
            ),
            (
                "castroom_events_received_total",
                "Total inbound events",
                self.inner.events_received_total.load(Relaxed),
            ),
            (
                "castroom_events_sent_total",
                "Total outbound events",
                self.inner.events_sent_total.load(Relaxed),
            ),
            (
                "castroom_errors_total",
                "Total handler errors",
                self.inner.errors_total.load(Relaxed),
            ),
            (
                "castroom_rooms_created_total",
                "Total rooms created",
                self.inner.rooms_created_total.load(Relaxed),
            ),
            (
                "castroom_joins_total",
                "Total room joins",
                self.inner.joins_total.load(Relaxed),
            ),
            (
                "castroom_leaves_total",
                "Total room departures",
                self.inner.leaves_total.load(Relaxed),
            ),
            (
                "castroom_producers_created_total",
                "Total media producers created",
                self.inner.producers_created_total.load(Relaxed),
            ),
            (
                "castroom_consumers_created_total",
                "Total media consumers created",
                self.inner.consumers_created_total.load(Relaxed),
            ),
        ];
        for (name, help, value) in counters {
            let _ = writeln!(out, "# HELP {name} {help}");
            let _ = writeln!(out, "# TYPE {name} counter");
            let _ = writeln!(out, "{name} {value}");
        }

        let gauges = [
            (
                "castroom_connections_active",
                "Currently open WebSocket connections",
                self.inner.connections_active.load(Relaxed),
            ),
            ("castroom_rooms", "Live rooms", rooms as u64),
            ("castroom_members", "Members across all rooms", members as u64),
            ("castroom_media_workers", "Live media workers", workers as u64),
        ];
        for (name, help, value) in gauges {
            let _ = writeln!(out, "# HELP {name} {help}");
            let _ = writeln!(out, "# TYPE {name} gauge");
            let _ = writeln!(out, "{name} {value}");
        }

        self.inner.event_handling.render(
            "castroom_event_handling_seconds",
            "Inbound event handling latency",
            &mut out,
        );
        out
    }
}

pub struct ConnectionGuard {
    metrics: ServerMetrics,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.metrics
            .inner
            .connections_active
            .fetch_sub(1, Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_and_gauges_render() {
        let metrics = ServerMetrics::new();
        metrics.inc_connections_total();
        metrics.inc_joins();
        metrics.observe_event_handling(Duration::from_millis(3));

        let guard = metrics.connection_active_guard();
        let out = metrics.render_prometheus(2, 5, 3);
        assert!(out.contains("castroom_connections_total 1"));
        assert!(out.contains("castroom_joins_total 1"));
        assert!(out.contains("castroom_connections_active 1"));
        assert!(out.contains("castroom_rooms 2"));
        assert!(out.contains("castroom_event_handling_seconds_count 1"));

        drop(guard);
        let out = metrics.render_prometheus(0, 0, 0);
        assert!(out.contains("castroom_connections_active 0"));
    }
}
