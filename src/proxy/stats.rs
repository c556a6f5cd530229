//! Per-path byte statistics
//!
//! A single mutex guards the whole table. Updates are a lookup and an add, so
//! the critical section is short and never held across an await point.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::info;

/// Cumulative response bytes served per request path
#[derive(Debug, Default)]
pub struct StatsAggregator {
    table: Mutex<HashMap<String, u64>>,
}

impl StatsAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `delta` to the total for `path` and return the new total
    pub fn update(&self, path: &str, delta: u64) -> u64 {
        let mut table = self.lock();
        if let Some(total) = table.get_mut(path) {
            *total = total.saturating_add(delta);
            return *total;
        }
        table.insert(path.to_string(), delta);
        delta
    }

    /// Current total for `path`, zero when it was never served
    pub fn get(&self, path: &str) -> u64 {
        self.lock().get(path).copied().unwrap_or(0)
    }

    /// All totals, sorted by path
    pub fn snapshot(&self) -> Vec<(String, u64)> {
        let mut entries: Vec<(String, u64)> = self
            .lock()
            .iter()
            .map(|(path, total)| (path.clone(), *total))
            .collect();
        entries.sort_unstable_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    /// Sum over every path
    pub fn total(&self) -> u64 {
        self.lock().values().fold(0u64, |acc, v| acc.saturating_add(*v))
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Log the table at info level
    pub fn log_summary(&self) {
        let snapshot = self.snapshot();
        info!("📊 Bytes served: {} across {} paths", self.total(), snapshot.len());
        for (path, total) in &snapshot {
            info!("   {} → {} bytes", path, total);
        }
    }

    // A panic while holding the lock cannot leave a half-written counter,
    // so a poisoned table is still consistent.
    fn lock(&self) -> MutexGuard<'_, HashMap<String, u64>> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_update_accumulates_per_path() {
        let stats = StatsAggregator::new();
        assert_eq!(stats.update("/foo", 10), 10);
        assert_eq!(stats.update("/foo", 5), 15);
        assert_eq!(stats.update("/bar", 7), 7);
        assert_eq!(stats.get("/foo"), 15);
        assert_eq!(stats.get("/missing"), 0);
        assert_eq!(stats.total(), 22);
    }

    #[test]
    fn test_zero_delta_creates_entry() {
        let stats = StatsAggregator::new();
        assert!(stats.is_empty());
        assert_eq!(stats.update("/empty", 0), 0);
        assert_eq!(stats.len(), 1);
    }

    #[test]
    fn test_snapshot_is_sorted() {
        let stats = StatsAggregator::new();
        stats.update("/b", 2);
        stats.update("/a", 1);
        stats.update("/c", 3);
        assert_eq!(
            stats.snapshot(),
            vec![
                ("/a".to_string(), 1),
                ("/b".to_string(), 2),
                ("/c".to_string(), 3)
            ]
        );
    }

    #[test]
    fn test_totals_are_exact_under_concurrency() {
        let stats = Arc::new(StatsAggregator::new());
        let threads: Vec<_> = (0..8)
            .map(|i| {
                let stats = Arc::clone(&stats);
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        stats.update("/shared", 3);
                        stats.update(&format!("/own/{}", i), 1);
                    }
                })
            })
            .collect();

        for t in threads {
            t.join().unwrap();
        }

        assert_eq!(stats.get("/shared"), 8 * 1000 * 3);
        for i in 0..8 {
            assert_eq!(stats.get(&format!("/own/{}", i)), 1000);
        }
    }
}
