//! Orphaned response reporting.
//!
//! Keeps the slowest (by server duration) responses that arrived after their
//! request had already completed, and logs them once per interval.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// One orphaned response.
#[derive(Debug, Clone, Serialize)]
pub struct ZombieEntry {
    pub operation_name: String,
    pub last_local_id: String,
    pub operation_id: String,
    pub last_remote_socket: String,
    #[serde(rename = "last_server_duration_us")]
    pub server_duration_us: u64,
}

#[derive(Serialize)]
struct ServiceRecord<'a> {
    total_count: u64,
    top_requests: &'a [ZombieEntry],
}

#[derive(Serialize)]
struct Record<'a> {
    kv: ServiceRecord<'a>,
}

pub struct ZombieLogger {
    interval: Duration,
    sample_size: usize,
    total: AtomicU64,
    ops: RwLock<Vec<ZombieEntry>>,
}

impl ZombieLogger {
    pub fn new(interval: Duration, sample_size: usize) -> Self {
        Self {
            interval,
            sample_size: sample_size.max(1),
            total: AtomicU64::new(0),
            ops: RwLock::new(Vec::with_capacity(sample_size)),
        }
    }

    /// Records an orphaned response, keeping only the slowest `sample_size`.
    pub fn record(&self, entry: ZombieEntry) {
        self.total.fetch_add(1, Ordering::Relaxed);
        {
            let ops = self.ops.read();
            if ops.len() >= self.sample_size
                && ops.last().is_some_and(|l| entry.server_duration_us <= l.server_duration_us)
            {
                return;
            }
        }

        let mut ops = self.ops.write();
        if ops.len() >= self.sample_size
            && ops.last().is_some_and(|l| entry.server_duration_us <= l.server_duration_us)
        {
            return;
        }
        let idx = ops
            .iter()
            .position(|e| e.server_duration_us < entry.server_duration_us)
            .unwrap_or(ops.len());
        ops.insert(idx, entry);
        ops.truncate(self.sample_size);
    }

    /// Takes the current sample as a JSON record, leaving the logger empty.
    pub fn flush(&self) -> Option<String> {
        let ops = std::mem::take(&mut *self.ops.write());
        let total = self.total.swap(0, Ordering::Relaxed);
        if ops.is_empty() {
            return None;
        }
        cbcore_telemetry::record_orphaned_responses(total as usize);
        let record = Record {
            kv: ServiceRecord {
                total_count: total,
                top_requests: &ops,
            },
        };
        serde_json::to_string(&record).ok()
    }

    /// Flushes every interval until `shutdown` fires.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Some(record) = self.flush() {
                        warn!(record = %record, "Orphaned responses observed");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(us: u64) -> ZombieEntry {
        ZombieEntry {
            operation_name: "Get".into(),
            last_local_id: "conn".into(),
            operation_id: format!("0x{us:x}"),
            last_remote_socket: "127.0.0.1:11210".into(),
            server_duration_us: us,
        }
    }

    #[test]
    fn test_keeps_slowest_sorted() {
        let logger = ZombieLogger::new(Duration::from_secs(10), 3);
        for us in [5, 50, 1, 30, 40, 2] {
            logger.record(entry(us));
        }
        let durations: Vec<u64> = logger.ops.read().iter().map(|e| e.server_duration_us).collect();
        assert_eq!(durations, vec![50, 40, 30]);
    }

    #[test]
    fn test_flush_clears_and_counts() {
        let logger = ZombieLogger::new(Duration::from_secs(10), 2);
        logger.record(entry(10));
        logger.record(entry(20));
        logger.record(entry(5));

        let record = logger.flush().unwrap();
        let value: serde_json::Value = serde_json::from_str(&record).unwrap();
        assert_eq!(value["kv"]["total_count"], 3);
        assert_eq!(value["kv"]["top_requests"][0]["last_server_duration_us"], 20);
        assert_eq!(value["kv"]["top_requests"].as_array().unwrap().len(), 2);

        assert!(logger.flush().is_none());
    }
}
