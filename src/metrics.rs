#![forbid(unsafe_code)]

// Server metrics - lock-free counters and a latency histogram, rendered as Prometheus text

use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering::Relaxed};
use std::sync::Arc;
use std::time::Duration;

/// Bucket upper bounds in microseconds, with their Prometheus `le` labels
const BUCKETS: [(u64, &str); 8] = [
    (1_000, "0.001"),
    (5_000, "0.005"),
    (25_000, "0.025"),
    (100_000, "0.1"),
    (250_000, "0.25"),
    (1_000_000, "1"),
    (5_000_000, "5"),
    (30_000_000, "30"),
];

/// Cumulative histogram with fixed buckets
pub struct Histogram {
    buckets: [AtomicU64; BUCKETS.len()],
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

    pub fn observe(&self, duration: Duration) {
        let us = u64::try_from(duration.as_micros()).unwrap_or(u64::MAX);
        self.sum_us.fetch_add(us, Relaxed);
        self.count.fetch_add(1, Relaxed);
        for (slot, (bound, _)) in self.buckets.iter().zip(BUCKETS.iter()) {
            if us <= *bound {
                slot.fetch_add(1, Relaxed);
            }
        }
    }

    fn render(&self, name: &str, help: &str, out: &mut String) {
        let _ = writeln!(out, "# HELP {name} {help}");
        let _ = writeln!(out, "# TYPE {name} histogram");
        for (slot, (_, label)) in self.buckets.iter().zip(BUCKETS.iter()) {
            let _ = writeln!(out, "{name}_bucket{{le=\"{label}\"}} {}", slot.load(Relaxed));
        }
        let count = self.count.load(Relaxed);
        let _ = writeln!(out, "{name}_bucket{{le=\"+Inf\"}} {count}");
        let sum_us = self.sum_us.load(Relaxed);
        let _ = writeln!(out, "{name}_sum {}.{:06}", sum_us / 1_000_000, sum_us % 1_000_000);
        let _ = writeln!(out, "{name}_count {count}");
    }
}

/// Process-wide metrics, cheap to clone
#[derive(Clone)]
pub struct ServerMetrics {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Counters {
    connections: AtomicU64,
    messages_received: AtomicU64,
    messages_sent: AtomicU64,
    errors: AtomicU64,
    rooms_created: AtomicU64,
    rooms_closed: AtomicU64,
    joins: AtomicU64,
    leaves: AtomicU64,
    producers_created: AtomicU64,
    consumers_created: AtomicU64,
    taps_opened: AtomicU64,
    transcoder_spawns: AtomicU64,
    transcoder_exits: AtomicU64,
}

struct Inner {
    counters: Counters,
    connections_active: AtomicU64,
    message_handling: Histogram,
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
                counters: Counters::default(),
                connections_active: AtomicU64::new(0),
                message_handling: Histogram::new(),
            }),
        }
    }

    pub fn inc_connections_total(&self) {
        self.inner.counters.connections.fetch_add(1, Relaxed);
    }

    pub fn inc_messages_received(&self) {
        self.inner.counters.messages_received.fetch_add(1, Relaxed);
    }

    pub fn inc_messages_sent(&self) {
        self.inner.counters.messages_sent.fetch_add(1, Relaxed);
    }

    pub fn inc_errors(&self) {
        self.inner.counters.errors.fetch_add(1, Relaxed);
    }

    pub fn inc_rooms_created(&self) {
        self.inner.counters.rooms_created.fetch_add(1, Relaxed);
    }

    pub fn inc_rooms_closed(&self) {
        self.inner.counters.rooms_closed.fetch_add(1, Relaxed);
    }

    pub fn inc_joins(&self) {
        self.inner.counters.joins.fetch_add(1, Relaxed);
    }

    pub fn inc_leaves(&self) {
        self.inner.counters.leaves.fetch_add(1, Relaxed);
    }

    pub fn inc_producers_created(&self) {
        self.inner.counters.producers_created.fetch_add(1, Relaxed);
    }

    pub fn inc_consumers_created(&self) {
        self.inner.counters.consumers_created.fetch_add(1, Relaxed);
    }

    pub fn inc_taps_opened(&self) {
        self.inner.counters.taps_opened.fetch_add(1, Relaxed);
    }

    pub fn inc_transcoder_spawns(&self) {
        self.inner.counters.transcoder_spawns.fetch_add(1, Relaxed);
    }

    /// Transcoder processes that exited without being asked to
    pub fn inc_transcoder_exits(&self) {
        self.inner.counters.transcoder_exits.fetch_add(1, Relaxed);
    }

    #[cfg(test)]
    pub fn transcoder_exits(&self) -> u64 {
        self.inner.counters.transcoder_exits.load(Relaxed)
    }

    /// Increments the active-connection gauge until the guard drops
    pub fn connection_active_guard(&self) -> ConnectionGuard {
        self.inner.connections_active.fetch_add(1, Relaxed);
        ConnectionGuard {
            inner: self.inner.clone(),
        }
    }

    pub fn observe_message_handling(&self, duration: Duration) {
        self.inner.message_handling.observe(duration);
    }

    /// Prometheus text exposition; room and participant gauges come from the registry
    pub fn render_prometheus(&self, rooms_active: usize, participants_active: usize) -> String {
        let mut out = String::with_capacity(4096);
        let c = &self.inner.counters;

        let counters: [(&str, &str, &AtomicU64); 13] = [
            ("connections_total", "Total WebSocket connections", &c.connections),
            ("messages_received_total", "Total frames received from clients", &c.messages_received),
            ("messages_sent_total", "Total frames sent to clients", &c.messages_sent),
            ("errors_total", "Total request errors", &c.errors),
            ("rooms_created_total", "Total rooms created", &c.rooms_created),
            ("rooms_closed_total", "Total rooms closed", &c.rooms_closed),
            ("joins_total", "Total room joins", &c.joins),
            ("leaves_total", "Total room leaves", &c.leaves),
            ("producers_created_total", "Total producers created", &c.producers_created),
            ("consumers_created_total", "Total consumers created", &c.consumers_created),
            ("taps_opened_total", "Total room taps opened", &c.taps_opened),
            ("transcoder_spawns_total", "Total transcoder processes spawned", &c.transcoder_spawns),
            ("transcoder_unexpected_exits_total", "Transcoder processes that exited on their own", &c.transcoder_exits),
        ];
        for (name, help, value) in counters {
            render_metric(&mut out, name, "counter", help, value.load(Relaxed));
        }

        render_metric(
            &mut out,
            "connections_active",
            "gauge",
            "Currently active WebSocket connections",
            self.inner.connections_active.load(Relaxed),
        );
        render_metric(&mut out, "rooms_active", "gauge", "Currently active rooms", rooms_active as u64);
        render_metric(
            &mut out,
            "participants_active",
            "gauge",
            "Currently joined participants",
            participants_active as u64,
        );

        self.inner.message_handling.render(
            "roomcast_message_handling_seconds",
            "Signaling message handling latency in seconds",
            &mut out,
        );
        out
    }
}

/// Decrements `connections_active` on drop
pub struct ConnectionGuard {
    inner: Arc<Inner>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.inner.connections_active.fetch_sub(1, Relaxed);
    }
}

fn render_metric(out: &mut String, name: &str, kind: &str, help: &str, value: u64) {
    let _ = writeln!(out, "# HELP roomcast_{name} {help}");
    let _ = writeln!(out, "# TYPE roomcast_{name} {kind}");
    let _ = writeln!(out, "roomcast_{name} {value}");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_and_gauges_render() {
        let metrics = ServerMetrics::new();
        metrics.inc_joins();
        metrics.inc_joins();
        metrics.inc_transcoder_exits();
        let guard = metrics.connection_active_guard();

        let text = metrics.render_prometheus(3, 7);
        assert!(text.contains("roomcast_joins_total 2"));
        assert!(text.contains("roomcast_transcoder_unexpected_exits_total 1"));
        assert!(text.contains("roomcast_connections_active 1"));
        assert!(text.contains("roomcast_rooms_active 3"));
        assert!(text.contains("roomcast_participants_active 7"));

        drop(guard);
        assert!(metrics.render_prometheus(0, 0).contains("roomcast_connections_active 0"));
    }

    #[test]
    fn test_histogram_buckets_are_cumulative() {
        let metrics = ServerMetrics::new();
        metrics.observe_message_handling(Duration::from_millis(3));
        metrics.observe_message_handling(Duration::from_millis(200));

        let text = metrics.render_prometheus(0, 0);
        assert!(text.contains("roomcast_message_handling_seconds_bucket{le=\"0.001\"} 0"));
        assert!(text.contains("roomcast_message_handling_seconds_bucket{le=\"0.005\"} 1"));
        assert!(text.contains("roomcast_message_handling_seconds_bucket{le=\"0.25\"} 2"));
        assert!(text.contains("roomcast_message_handling_seconds_count 2"));
        assert!(text.contains("roomcast_message_handling_seconds_sum 0.203000"));
    }
}
