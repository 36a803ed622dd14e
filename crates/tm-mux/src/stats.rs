//! Per-session traffic and stream accounting
//!
//! One instance of each counter is owned by a session and shared by
//! reference with every virtual connection it creates.

use std::sync::atomic::{AtomicU64, Ordering};

/// Cumulative bytes received and sent over a session
#[derive(Debug, Default)]
pub struct TrafficStat {
    rx: AtomicU64,
    tx: AtomicU64,
}

impl TrafficStat {
    /// Create zeroed counters
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `n` received bytes
    pub fn incr_rx(&self, n: usize) {
        if n > 0 {
            self.rx.fetch_add(n as u64, Ordering::Relaxed);
        }
    }

    /// Record `n` sent bytes
    pub fn incr_tx(&self, n: usize) {
        if n > 0 {
            self.tx.fetch_add(n as u64, Ordering::Relaxed);
        }
    }

    /// Current `(rx, tx)`
    pub fn load(&self) -> (u64, u64) {
        (self.rx.load(Ordering::Relaxed), self.tx.load(Ordering::Relaxed))
    }
}

/// Opened-ever and currently-open stream counts of a session
#[derive(Debug, Default)]
pub struct StreamStat {
    cumulative: AtomicU64,
    active: AtomicU64,
}

impl StreamStat {
    /// Create zeroed counters
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a newly opened or accepted stream
    pub fn open_one(&self) {
        // cumulative first so a concurrent load never sees active > cumulative
        self.cumulative.fetch_add(1, Ordering::SeqCst);
        self.active.fetch_add(1, Ordering::SeqCst);
    }

    /// Register a closed stream. Callers guarantee one call per stream.
    pub fn close_one(&self) {
        let _ = self
            .active
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
    }

    /// Current `(cumulative, active)`
    pub fn load(&self) -> (u64, u64) {
        let active = self.active.load(Ordering::SeqCst);
        let cumulative = self.cumulative.load(Ordering::SeqCst);
        (cumulative, active)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_traffic_accumulates() {
        let traffic = TrafficStat::new();
        traffic.incr_rx(10);
        traffic.incr_rx(0);
        traffic.incr_tx(7);
        traffic.incr_rx(5);
        assert_eq!(traffic.load(), (15, 7));
    }

    #[test]
    fn test_stream_open_close() {
        let streams = StreamStat::new();
        streams.open_one();
        streams.open_one();
        streams.close_one();
        assert_eq!(streams.load(), (2, 1));
    }

    #[test]
    fn test_close_never_underflows() {
        let streams = StreamStat::new();
        streams.close_one();
        assert_eq!(streams.load(), (0, 0));
    }

    #[test]
    fn test_concurrent_updates_are_not_lost() {
        let traffic = Arc::new(TrafficStat::new());
        let streams = Arc::new(StreamStat::new());

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let traffic = Arc::clone(&traffic);
                let streams = Arc::clone(&streams);
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        streams.open_one();
                        traffic.incr_tx(3);
                        traffic.incr_rx(1);
                        streams.close_one();
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(traffic.load(), (8000, 24000));
        assert_eq!(streams.load(), (8000, 0));
    }
}
