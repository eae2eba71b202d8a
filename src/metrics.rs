#![forbid(unsafe_code)]

// Lock-free server metrics: AtomicU64 counters, an active-connection gauge
// with an RAII guard, and a fixed-bucket latency histogram rendered in
// Prometheus text exposition format.

use std::fmt::Write;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering::Relaxed};
use std::time::Duration;

/// Bucket boundaries in microseconds; bucket[i] counts observations
/// <= BUCKET_BOUNDS_US[i].
const BUCKET_BOUNDS_US: [u64; 8] = [
    1_000,     // 1ms
    5_000,     // 5ms
    10_000,    // 10ms
    25_000,    // 25ms
    50_000,    // 50ms
    100_000,   // 100ms
    500_000,   // 500ms
    1_000_000, // 1s
];

const BUCKET_LABELS: [&str; 8] = ["0.001", "0.005", "0.01", "0.025", "0.05", "0.1", "0.5", "1"];

pub struct Histogram {
    buckets: [AtomicU64; 8],
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
        for (i, label) in BUCKET_LABELS.iter().enumerate() {
            let val = self.buckets[i].load(Relaxed);
            let _ = writeln!(out, "{name}_bucket{{le=\"{label}\"}} {val}");
        }
        let count = self.count.load(Relaxed);
        let _ = writeln!(out, "{name}_bucket{{le=\"+Inf\"}} {count}");
        let sum_us = self.sum_us.load(Relaxed);
        let _ = writeln!(
            out,
            "{name}_sum {}.{:06}",
            sum_us / 1_000_000,
            sum_us % 1_000_000
        );
        let _ = writeln!(out, "{name}_count {count}");
    }
}

#[derive(Clone)]
pub struct ServerMetrics {
    inner: Arc<Inner>,
}

struct Inner {
    connections_total: AtomicU64,
    messages_received_total: AtomicU64,
    protocol_errors_total: AtomicU64,
    rate_limited_total: AtomicU64,
    signal_errors_total: AtomicU64,
    rooms_created_total: AtomicU64,
    rooms_destroyed_total: AtomicU64,
    joins_total: AtomicU64,
    leaves_total: AtomicU64,
    producers_created_total: AtomicU64,
    consumers_created_total: AtomicU64,
    chat_messages_total: AtomicU64,

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
                connections_total: AtomicU64::new(0),
                messages_received_total: AtomicU64::new(0),
                protocol_errors_total: AtomicU64::new(0),
                rate_limited_total: AtomicU64::new(0),
                signal_errors_total: AtomicU64::new(0),
                rooms_created_total: AtomicU64::new(0),
                rooms_destroyed_total: AtomicU64::new(0),
                joins_total: AtomicU64::new(0),
                leaves_total: AtomicU64::new(0),
                producers_created_total: AtomicU64::new(0),
                consumers_created_total: AtomicU64::new(0),
                chat_messages_total: AtomicU64::new(0),
                connections_active: AtomicU64::new(0),
                message_handling: Histogram::new(),
            }),
        }
    }

    pub fn inc_connections_total(&self) {
        self.inner.connections_total.fetch_add(1, Relaxed);
    }

    pub fn inc_messages_received(&self) {
        self.inner.messages_received_total.fetch_add(1, Relaxed);
    }

    /// Malformed or unparseable channel messages (logged and dropped).
    pub fn inc_protocol_errors(&self) {
        self.inner.protocol_errors_total.fetch_add(1, Relaxed);
    }

    pub fn inc_rate_limited(&self) {
        self.inner.rate_limited_total.fetch_add(1, Relaxed);
    }

    /// Operations answered with a taxonomy error (RPC or channel).
    pub fn inc_signal_errors(&self) {
        self.inner.signal_errors_total.fetch_add(1, Relaxed);
    }

    pub fn inc_rooms_created(&self) {
        self.inner.rooms_created_total.fetch_add(1, Relaxed);
    }

    pub fn inc_rooms_destroyed(&self) {
        self.inner.rooms_destroyed_total.fetch_add(1, Relaxed);
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

    pub fn inc_chat_messages(&self) {
        self.inner.chat_messages_total.fetch_add(1, Relaxed);
    }

    /// Increments the active-connection gauge; the guard decrements on drop
    /// even when the connection handler unwinds.
    pub fn connection_active_guard(&self) -> ConnectionGuard {
        self.inner.connections_active.fetch_add(1, Relaxed);
        ConnectionGuard {
            inner: self.inner.clone(),
        }
    }

    pub fn observe_message_handling(&self, duration: Duration) {
        self.inner.message_handling.observe(duration);
    }

    /// `rooms_active` and `peers_active` are on-demand gauges supplied by
    /// the room manager.
    pub fn render_prometheus(&self, rooms_active: usize, peers_active: usize) -> String {
        let mut out = String::with_capacity(4096);
        let i = &self.inner;

        render_counter(&mut out, "huddle_connections_total", "Total WebSocket connections accepted", i.connections_total.load(Relaxed));
        render_counter(&mut out, "huddle_messages_received_total", "Total channel messages received", i.messages_received_total.load(Relaxed));
        render_counter(&mut out, "huddle_protocol_errors_total", "Malformed channel messages dropped", i.protocol_errors_total.load(Relaxed));
        render_counter(&mut out, "huddle_rate_limited_total", "Channel messages refused by rate limiting", i.rate_limited_total.load(Relaxed));
        render_counter(&mut out, "huddle_signal_errors_total", "Operations answered with an error", i.signal_errors_total.load(Relaxed));
        render_counter(&mut out, "huddle_rooms_created_total", "Total rooms created", i.rooms_created_total.load(Relaxed));
        render_counter(&mut out, "huddle_rooms_destroyed_total", "Total rooms destroyed", i.rooms_destroyed_total.load(Relaxed));
        render_counter(&mut out, "huddle_joins_total", "Total peer joins", i.joins_total.load(Relaxed));
        render_counter(&mut out, "huddle_leaves_total", "Total peer leaves", i.leaves_total.load(Relaxed));
        render_counter(&mut out, "huddle_producers_created_total", "Total producers created", i.producers_created_total.load(Relaxed));
        render_counter(&mut out, "huddle_consumers_created_total", "Total consumers created", i.consumers_created_total.load(Relaxed));
        render_counter(&mut out, "huddle_chat_messages_total", "Total chat messages broadcast", i.chat_messages_total.load(Relaxed));

        render_gauge(&mut out, "huddle_connections_active", "Currently open WebSocket connections", i.connections_active.load(Relaxed));
        render_gauge(&mut out, "huddle_rooms_active", "Currently active rooms", rooms_active as u64);
        render_gauge(&mut out, "huddle_peers_active", "Currently joined peers", peers_active as u64);

        i.message_handling.render(
            "huddle_message_handling_seconds",
            "Channel message handling latency in seconds",
            &mut out,
        );

        out
    }
}

/// Decrements `connections_active` on drop.
pub struct ConnectionGuard {
    inner: Arc<Inner>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.inner.connections_active.fetch_sub(1, Relaxed);
    }
}

fn render_counter(out: &mut String, name: &str, help: &str, value: u64) {
    let _ = writeln!(out, "# HELP {name} {help}");
    let _ = writeln!(out, "# TYPE {name} counter");
    let _ = writeln!(out, "{name} {value}");
}

fn render_gauge(out: &mut String, name: &str, help: &str, value: u64) {
    let _ = writeln!(out, "# HELP {name} {help}");
    let _ = writeln!(out, "# TYPE {name} gauge");
    let _ = writeln!(out, "{name} {value}");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_guard_tracks_the_gauge() {
        let metrics = ServerMetrics::new();
        let a = metrics.connection_active_guard();
        let b = metrics.connection_active_guard();
        assert_eq!(metrics.inner.connections_active.load(Relaxed), 2);
        drop(a);
        assert_eq!(metrics.inner.connections_active.load(Relaxed), 1);
        drop(b);
        assert_eq!(metrics.inner.connections_active.load(Relaxed), 0);
    }

    #[test]
    fn histogram_renders_cumulative_buckets() {
        let metrics = ServerMetrics::new();
        metrics.observe_message_handling(Duration::from_micros(800));
        metrics.observe_message_handling(Duration::from_millis(30));

        let out = metrics.render_prometheus(1, 2);
        assert!(out.contains("huddle_message_handling_seconds_bucket{le=\"0.001\"} 1"));
        assert!(out.contains("huddle_message_handling_seconds_bucket{le=\"0.05\"} 2"));
        assert!(out.contains("huddle_message_handling_seconds_bucket{le=\"+Inf\"} 2"));
        assert!(out.contains("huddle_message_handling_seconds_count 2"));
        assert!(out.contains("huddle_rooms_active 1"));
        assert!(out.contains("huddle_peers_active 2"));
    }
}
