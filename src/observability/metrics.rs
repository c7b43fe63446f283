//! Thread-safe metrics collection
//!
//! Atomic counters for task submissions and broker sessions, plus a bounded
//! sample of publish latencies.

use crate::error::ErrorKind;
use once_cell::sync::Lazy;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

const MAX_LATENCY_SAMPLES: usize = 1000;

/// Global metrics collector instance
pub static METRICS: Lazy<MetricsCollector> = Lazy::new(MetricsCollector::new);

/// Get reference to global metrics collector
pub fn metrics() -> &'static MetricsCollector {
    &METRICS
}

/// Thread-safe metrics collector using atomics and mutexes
pub struct MetricsCollector {
    // Task submission counters
    tasks_received: AtomicU64,
    tasks_published: AtomicU64,
    encoding_failures: AtomicU64,
    channel_failures: AtomicU64,
    publish_failures: AtomicU64,

    // Broker session counters
    session_live: AtomicBool,
    connection_attempts: AtomicU64,
    connections_established: AtomicU64,
    connection_failures: AtomicU64,
    sessions_lost: AtomicU64,
    session_start_time: AtomicU64,

    // Publish latencies in milliseconds
    publish_latencies: Mutex<Vec<u64>>,

    uptime_start: AtomicU64,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            tasks_received: AtomicU64::new(0),
            tasks_published: AtomicU64::new(0),
            encoding_failures: AtomicU64::new(0),
            channel_failures: AtomicU64::new(0),
            publish_failures: AtomicU64::new(0),
            session_live: AtomicBool::new(false),
            connection_attempts: AtomicU64::new(0),
            connections_established: AtomicU64::new(0),
            connection_failures: AtomicU64::new(0),
            sessions_lost: AtomicU64::new(0),
            session_start_time: AtomicU64::new(0),
            publish_latencies: Mutex::new(Vec::new()),
            uptime_start: AtomicU64::new(current_timestamp()),
        }
    }

    // Task metrics
    pub fn task_received(&self) {
        self.tasks_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn task_published(&self, latency: Duration) {
        self.tasks_published.fetch_add(1, Ordering::Relaxed);
        self.record_latency(latency);
    }

    pub fn task_failed(&self, kind: ErrorKind) {
        let counter = match kind {
            ErrorKind::Encoding => &self.encoding_failures,
            ErrorKind::Channel => &self.channel_failures,
            ErrorKind::Publish => &self.publish_failures,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn record_latency(&self, latency: Duration) {
        if let Ok(mut samples) = self.publish_latencies.lock() {
            samples.push(latency.as_millis() as u64);

            if samples.len() > MAX_LATENCY_SAMPLES {
                samples.remove(0);
            }
        }
    }

    // Session metrics
    pub fn connection_attempt(&self) {
        self.connection_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_established(&self) {
        self.connections_established.fetch_add(1, Ordering::Relaxed);
        self.session_live.store(true, Ordering::Relaxed);
        self.session_start_time
            .store(current_timestamp(), Ordering::Relaxed);
    }

    pub fn connection_failed(&self) {
        self.connection_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn session_lost(&self) {
        self.sessions_lost.fetch_add(1, Ordering::Relaxed);
        self.session_closed();
    }

    /// Session ended without a failure (shutdown)
    pub fn session_closed(&self) {
        self.session_live.store(false, Ordering::Relaxed);
        self.session_start_time.store(0, Ordering::Relaxed);
    }

    pub fn is_session_live(&self) -> bool {
        self.session_live.load(Ordering::Relaxed)
    }

    // Reset all metrics (useful for testing)
    pub fn reset(&self) {
        for counter in [
            &self.tasks_received,
            &self.tasks_published,
            &self.encoding_failures,
            &self.channel_failures,
            &self.publish_failures,
            &self.connection_attempts,
            &self.connections_established,
            &self.connection_failures,
            &self.sessions_lost,
            &self.session_start_time,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        self.session_live.store(false, Ordering::Relaxed);
        self.uptime_start
            .store(current_timestamp(), Ordering::Relaxed);
        if let Ok(mut samples) = self.publish_latencies.lock() {
            samples.clear();
        }
    }

    /// Average and percentiles of the retained latency samples
    fn latency_statistics(&self) -> (f64, f64, f64, f64) {
        let Ok(samples) = self.publish_latencies.lock() else {
            return (0.0, 0.0, 0.0, 0.0);
        };
        if samples.is_empty() {
            return (0.0, 0.0, 0.0, 0.0);
        }

        let mut sorted = samples.clone();
        sorted.sort_unstable();

        let avg = sorted.iter().sum::<u64>() as f64 / sorted.len() as f64;
        (
            avg,
            percentile(&sorted, 50.0),
            percentile(&sorted, 95.0),
            percentile(&sorted, 99.0),
        )
    }

    fn session_duration(&self, now: u64) -> u64 {
        if !self.session_live.load(Ordering::Relaxed) {
            return 0;
        }
        match self.session_start_time.load(Ordering::Relaxed) {
            0 => 0,
            start => now.saturating_sub(start),
        }
    }

    /// Get complete metrics snapshot
    pub fn get_metrics(&self) -> MetricsSnapshot {
        let now = current_timestamp();
        let (avg, p50, p95, p99) = self.latency_statistics();

        MetricsSnapshot {
            tasks: TaskMetrics {
                received: self.tasks_received.load(Ordering::Relaxed),
                published: self.tasks_published.load(Ordering::Relaxed),
                encoding_failures: self.encoding_failures.load(Ordering::Relaxed),
                channel_failures: self.channel_failures.load(Ordering::Relaxed),
                publish_failures: self.publish_failures.load(Ordering::Relaxed),
                avg_publish_time_ms: avg,
                publish_time_p50_ms: p50,
                publish_time_p95_ms: p95,
                publish_time_p99_ms: p99,
            },
            broker: BrokerMetrics {
                session_live: self.session_live.load(Ordering::Relaxed),
                connection_attempts: self.connection_attempts.load(Ordering::Relaxed),
                connections_established: self.connections_established.load(Ordering::Relaxed),
                connection_failures: self.connection_failures.load(Ordering::Relaxed),
                sessions_lost: self.sessions_lost.load(Ordering::Relaxed),
                session_duration_seconds: self.session_duration(now),
            },
            uptime_seconds: now.saturating_sub(self.uptime_start.load(Ordering::Relaxed)),
            timestamp: now,
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Serialize)]
pub struct MetricsSnapshot {
    pub tasks: TaskMetrics,
    pub broker: BrokerMetrics,
    pub uptime_seconds: u64,
    pub timestamp: u64,
}

#[derive(Debug, Serialize)]
pub struct TaskMetrics {
    pub received: u64,
    pub published: u64,
    pub encoding_failures: u64,
    pub channel_failures: u64,
    pub publish_failures: u64,
    pub avg_publish_time_ms: f64,
    pub publish_time_p50_ms: f64,
    pub publish_time_p95_ms: f64,
    pub publish_time_p99_ms: f64,
}

#[derive(Debug, Serialize)]
pub struct BrokerMetrics {
    pub session_live: bool,
    pub connection_attempts: u64,
    pub connections_established: u64,
    pub connection_failures: u64,
    pub sessions_lost: u64,
    pub session_duration_seconds: u64,
}

fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn percentile(sorted_data: &[u64], percentile: f64) -> f64 {
    if sorted_data.is_empty() {
        return 0.0;
    }

    let len = sorted_data.len();
    let index = (percentile / 100.0) * (len - 1) as f64;

    if index.fract() == 0.0 {
        sorted_data[index as usize] as f64
    } else {
        let lower = sorted_data[index.floor() as usize] as f64;
        let upper = sorted_data[index.ceil() as usize] as f64;
        lower + (upper - lower) * index.fract()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_task_metrics() {
        let collector = MetricsCollector::new();

        collector.task_received();
        collector.task_received();
        collector.task_published(Duration::from_millis(40));
        collector.task_failed(ErrorKind::Encoding);

        let metrics = collector.get_metrics();
        assert_eq!(metrics.tasks.received, 2);
        assert_eq!(metrics.tasks.published, 1);
        assert_eq!(metrics.tasks.encoding_failures, 1);
        assert_eq!(metrics.tasks.channel_failures, 0);
        assert!(metrics.tasks.avg_publish_time_ms >= 40.0);
    }

    #[test]
    fn test_failures_counted_by_kind() {
        let collector = MetricsCollector::new();

        collector.task_failed(ErrorKind::Channel);
        collector.task_failed(ErrorKind::Channel);
        collector.task_failed(ErrorKind::Publish);

        let metrics = collector.get_metrics();
        assert_eq!(metrics.tasks.channel_failures, 2);
        assert_eq!(metrics.tasks.publish_failures, 1);
    }

    #[test]
    fn test_session_metrics() {
        let collector = MetricsCollector::new();

        collector.connection_attempt();
        collector.connection_failed();
        collector.connection_attempt();
        collector.connection_established();
        assert!(collector.is_session_live());

        collector.session_lost();

        let metrics = collector.get_metrics();
        assert_eq!(metrics.broker.connection_attempts, 2);
        assert_eq!(metrics.broker.connection_failures, 1);
        assert_eq!(metrics.broker.connections_established, 1);
        assert_eq!(metrics.broker.sessions_lost, 1);
        assert!(!metrics.broker.session_live);
        assert_eq!(metrics.broker.session_duration_seconds, 0);
    }

    #[test]
    fn test_thread_safety() {
        let collector = Arc::new(MetricsCollector::new());

        let handles: Vec<_> = (0..10)
            .map(|_| {
                let collector = Arc::clone(&collector);
                thread::spawn(move || {
                    for _ in 0..100 {
                        collector.task_received();
                        collector.task_published(Duration::from_millis(1));
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        let metrics = collector.get_metrics();
        assert_eq!(metrics.tasks.received, 1000);
        assert_eq!(metrics.tasks.published, 1000);
    }

    #[test]
    fn test_latency_samples_are_bounded() {
        let collector = MetricsCollector::new();
        for i in 0..1500 {
            collector.task_published(Duration::from_millis(i));
        }

        let retained = collector.publish_latencies.lock().unwrap().len();
        assert_eq!(retained, MAX_LATENCY_SAMPLES);
        // Oldest samples are evicted first
        assert!(collector.get_metrics().tasks.avg_publish_time_ms >= 500.0);
    }

    #[test]
    fn test_percentile_calculation() {
        let data = vec![1, 2, 3, 4, 5, 6, 7, 8, 9, 10];

        assert!((percentile(&data, 50.0) - 5.5).abs() < 0.1);
        assert!((percentile(&data, 95.0) - 9.55).abs() < 0.1);
        assert!((percentile(&data, 0.0) - 1.0).abs() < 0.1);
        assert!((percentile(&data, 100.0) - 10.0).abs() < 0.1);
        assert_eq!(percentile(&[], 50.0), 0.0);
    }

    #[test]
    fn test_reset() {
        let collector = MetricsCollector::new();
        collector.task_received();
        collector.connection_established();

        collector.reset();

        let metrics = collector.get_metrics();
        assert_eq!(metrics.tasks.received, 0);
        assert!(!metrics.broker.session_live);
    }

    #[test]
    fn test_snapshot_serializes() {
        let json = serde_json::to_value(MetricsCollector::new().get_metrics()).unwrap();
        assert!(json["tasks"]["received"].is_u64());
        assert!(json["broker"]["session_live"].is_boolean());
    }
}
