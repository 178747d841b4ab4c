//! Performance metrics for backup and restore runs.

use parking_lot::RwLock;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

const MAX_SAMPLES: usize = 1000;

/// Performance metrics collector
pub struct PerformanceMetrics {
    /// Rows copied out or loaded
    pub rows_processed: AtomicU64,
    /// Artifact bytes (compressed)
    pub bytes_written: AtomicU64,
    /// Artifact bytes before compression
    pub bytes_uncompressed: AtomicU64,
    /// Entries applied successfully
    pub entries_applied: AtomicU64,
    /// Entries that failed
    pub errors: AtomicU64,
    /// Data chunks reused from a base backup
    pub chunks_reused: AtomicU64,
    /// Per-entry apply latencies in nanoseconds
    entry_latencies_ns: RwLock<Vec<u64>>,
    /// Lock wait latencies in nanoseconds
    lock_latencies_ns: RwLock<Vec<u64>>,
    start_time: Instant,
}

impl Default for PerformanceMetrics {
    fn default() -> Self {
        Self::new()
    }
}

fn push_sample(samples: &RwLock<Vec<u64>>, duration: Duration) {
    let mut latencies = samples.write();
    latencies.push(duration.as_nanos() as u64);
    // Keep last 1000 samples
    if latencies.len() > MAX_SAMPLES {
        latencies.remove(0);
    }
}

impl PerformanceMetrics {
    pub fn new() -> Self {
        Self {
            rows_processed: AtomicU64::new(0),
            bytes_written: AtomicU64::new(0),
            bytes_uncompressed: AtomicU64::new(0),
            entries_applied: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            chunks_reused: AtomicU64::new(0),
            entry_latencies_ns: RwLock::new(Vec::with_capacity(MAX_SAMPLES)),
            lock_latencies_ns: RwLock::new(Vec::with_capacity(MAX_SAMPLES)),
            start_time: Instant::now(),
        }
    }

    pub fn record_rows(&self, count: u64) {
        self.rows_processed.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_bytes(&self, compressed: u64, uncompressed: u64) {
        self.bytes_written.fetch_add(compressed, Ordering::Relaxed);
        self.bytes_uncompressed.fetch_add(uncompressed, Ordering::Relaxed);
    }

    pub fn record_entry(&self, duration: Duration) {
        self.entries_applied.fetch_add(1, Ordering::Relaxed);
        push_sample(&self.entry_latencies_ns, duration);
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reused_chunk(&self) {
        self.chunks_reused.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_lock_wait(&self, duration: Duration) {
        push_sample(&self.lock_latencies_ns, duration);
    }

    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Artifact throughput in MB/s
    pub fn throughput_mbps(&self) -> f64 {
        let bytes = self.bytes_written.load(Ordering::Relaxed) as f64;
        let elapsed = self.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            (bytes / 1_048_576.0) / elapsed
        } else {
            0.0
        }
    }

    pub fn compression_ratio(&self) -> f64 {
        let compressed = self.bytes_written.load(Ordering::Relaxed) as f64;
        let uncompressed = self.bytes_uncompressed.load(Ordering::Relaxed) as f64;
        if compressed > 0.0 {
            uncompressed / compressed
        } else {
            1.0
        }
    }

    pub fn rows_per_second(&self) -> f64 {
        let rows = self.rows_processed.load(Ordering::Relaxed) as f64;
        let elapsed = self.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            rows / elapsed
        } else {
            0.0
        }
    }

    pub fn entry_latency_stats(&self) -> LatencyStats {
        LatencyStats::from_samples(&self.entry_latencies_ns.read())
    }

    pub fn lock_latency_stats(&self) -> LatencyStats {
        LatencyStats::from_samples(&self.lock_latencies_ns.read())
    }

    pub fn report(&self) -> MetricsReport {
        MetricsReport {
            elapsed_secs: self.elapsed().as_secs_f64(),
            rows_processed: self.rows_processed.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            bytes_uncompressed: self.bytes_uncompressed.load(Ordering::Relaxed),
            entries_applied: self.entries_applied.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            chunks_reused: self.chunks_reused.load(Ordering::Relaxed),
            throughput_mbps: self.throughput_mbps(),
            compression_ratio: self.compression_ratio(),
            rows_per_second: self.rows_per_second(),
            entry_latency: self.entry_latency_stats(),
            lock_latency: self.lock_latency_stats(),
        }
    }
}

/// Latency statistics
#[derive(Debug, Clone, Default, Serialize)]
pub struct LatencyStats {
    pub count: usize,
    pub avg_ms: f64,
    pub p50_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
    pub max_ms: f64,
}

impl LatencyStats {
    /// Calculate stats from samples (in nanoseconds)
    fn from_samples(samples: &[u64]) -> Self {
        let mut sorted: Vec<u64> = samples.to_vec();
        sorted.sort_unstable();
        let Some(&max) = sorted.last() else {
            return Self::default();
        };

        let count = sorted.len();
        let sum: u64 = sorted.iter().sum();
        let ns_to_ms = |ns: u64| ns as f64 / 1_000_000.0;

        Self {
            count,
            avg_ms: ns_to_ms(sum / count as u64),
            p50_ms: ns_to_ms(sorted[count / 2]),
            p95_ms: ns_to_ms(sorted[((count as f64 * 0.95) as usize).min(count - 1)]),
            p99_ms: ns_to_ms(sorted[((count as f64 * 0.99) as usize).min(count - 1)]),
            max_ms: ns_to_ms(max),
        }
    }
}

/// Metrics report
#[derive(Debug, Clone, Serialize)]
pub struct MetricsReport {
    pub elapsed_secs: f64,
    pub rows_processed: u64,
    pub bytes_written: u64,
    pub bytes_uncompressed: u64,
    pub entries_applied: u64,
    pub errors: u64,
    pub chunks_reused: u64,
    pub throughput_mbps: f64,
    pub compression_ratio: f64,
    pub rows_per_second: f64,
    pub entry_latency: LatencyStats,
    pub lock_latency: LatencyStats,
}

impl std::fmt::Display for MetricsReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "=== Performance Metrics ===")?;
        writeln!(f, "Duration: {:.2}s", self.elapsed_secs)?;
        writeln!(f, "Rows processed: {}", self.rows_processed)?;
        writeln!(f, "Rows/sec: {:.0}", self.rows_per_second)?;
        writeln!(f, "Bytes written: {} MB", self.bytes_written / 1_048_576)?;
        writeln!(f, "Throughput: {:.2} MB/s", self.throughput_mbps)?;
        writeln!(f, "Compression ratio: {:.2}x", self.compression_ratio)?;
        writeln!(f, "Entries applied: {}", self.entries_applied)?;
        if self.chunks_reused > 0 {
            writeln!(f, "Chunks reused: {}", self.chunks_reused)?;
        }
        writeln!(f, "Errors: {}", self.errors)?;
        writeln!(f)?;
        writeln!(f, "Entry latency (ms):")?;
        writeln!(
            f,
            "  avg={:.2} p50={:.2} p95={:.2} p99={:.2} max={:.2}",
            self.entry_latency.avg_ms,
            self.entry_latency.p50_ms,
            self.entry_latency.p95_ms,
            self.entry_latency.p99_ms,
            self.entry_latency.max_ms
        )?;
        writeln!(f, "Lock wait (ms):")?;
        writeln!(
            f,
            "  avg={:.2} p50={:.2} p95={:.2} p99={:.2} max={:.2}",
            self.lock_latency.avg_ms,
            self.lock_latency.p50_ms,
            self.lock_latency.p95_ms,
            self.lock_latency.p99_ms,
            self.lock_latency.max_ms
        )?;
        Ok(())
    }
}

impl MetricsReport {
    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_else(|_| "{}".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_basic() {
        let metrics = PerformanceMetrics::new();

        metrics.record_rows(1000);
        metrics.record_bytes(500, 2000);
        metrics.record_entry(Duration::from_millis(3));

        let report = metrics.report();
        assert_eq!(report.rows_processed, 1000);
        assert_eq!(report.entries_applied, 1);
        assert_eq!(metrics.compression_ratio(), 4.0);
    }

    #[test]
    fn test_latency_stats() {
        let metrics = PerformanceMetrics::new();
        for i in 0..100 {
            metrics.record_lock_wait(Duration::from_millis(i));
        }

        let stats = metrics.lock_latency_stats();
        assert_eq!(stats.count, 100);
        assert!(stats.p50_ms >= 49.0 && stats.p50_ms <= 51.0);
        assert!(stats.p99_ms >= 98.0);
        assert_eq!(metrics.entry_latency_stats().count, 0);
    }
}
