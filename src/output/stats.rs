//! Per-output statistics.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;

/// Statistics snapshot for one output destination.
///
/// Returned by status queries. All figures are mutated only by the owning
/// output unit; readers always see a consistent copy taken at snapshot
/// time.
#[derive(Debug, Clone, Default, Serialize)]
pub struct OutputStats {
    /// Bytes written in the current streaming session.
    ///
    /// Resets on a fresh start, never on a reconnect.
    pub bytes_written: u64,
    /// Time since the current session connected (frozen once stopped).
    pub duration: Duration,
    /// Wall-clock time of the current session's connect.
    pub started_at: Option<DateTime<Utc>>,
    /// Times the unit lost its connection. Never resets.
    pub reconnects: u64,
    /// Output rate over the most recent throughput window, in bits/sec.
    pub current_bitrate_bps: u64,
    /// Chunks currently queued for this destination.
    pub buffer_level: usize,
    /// Chunks dropped because the destination was slow or reconnecting.
    pub chunks_dropped: u64,
}

/// Atomic counters backing [`OutputStats`], owned by one unit worker.
#[derive(Debug, Default)]
pub(crate) struct UnitStats {
    bytes_written: AtomicU64,
    reconnects: AtomicU64,
    chunks_dropped: AtomicU64,
    bitrate_bps: AtomicU64,
    buffer_level: AtomicUsize,
    /// Unix millis of the current session's connect; 0 = never connected.
    started_at_ms: AtomicU64,
    /// Unix millis of the current session's stop; 0 = still running.
    ended_at_ms: AtomicU64,
}

impl UnitStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks a fresh session start: resets session-scoped figures, keeps
    /// `reconnects` and `chunks_dropped` cumulative.
    pub fn record_session_start(&self) {
        self.bytes_written.store(0, Ordering::Relaxed);
        self.record_reconnected();
    }

    /// Marks a successful reconnect within a session: the connect timestamp
    /// restarts, `bytes_written` keeps accumulating.
    pub fn record_reconnected(&self) {
        self.bitrate_bps.store(0, Ordering::Relaxed);
        self.started_at_ms
            .store(Utc::now().timestamp_millis() as u64, Ordering::Relaxed);
        self.ended_at_ms.store(0, Ordering::Relaxed);
    }

    /// Freezes the session duration at stop time.
    pub fn record_stop(&self) {
        if self.started_at_ms.load(Ordering::Relaxed) != 0 {
            self.ended_at_ms
                .store(Utc::now().timestamp_millis() as u64, Ordering::Relaxed);
        }
        self.bitrate_bps.store(0, Ordering::Relaxed);
        self.buffer_level.store(0, Ordering::Relaxed);
    }

    pub fn add_bytes(&self, n: u64) {
        self.bytes_written.fetch_add(n, Ordering::Relaxed);
    }

    pub fn inc_reconnects(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_dropped(&self) {
        self.chunks_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_bitrate(&self, bps: u64) {
        self.bitrate_bps.store(bps, Ordering::Relaxed);
    }

    pub fn set_buffer_level(&self, level: usize) {
        self.buffer_level.store(level, Ordering::Relaxed);
    }

    /// Takes a consistent snapshot for reporting.
    pub fn snapshot(&self) -> OutputStats {
        let started_ms = self.started_at_ms.load(Ordering::Relaxed);
        let ended_ms = self.ended_at_ms.load(Ordering::Relaxed);

        let started_at = (started_ms != 0)
            .then(|| Utc.timestamp_millis_opt(started_ms as i64).single())
            .flatten();
        let duration = match (started_ms, ended_ms) {
            (0, _) => Duration::ZERO,
            (start, 0) => {
                let now = Utc::now().timestamp_millis() as u64;
                Duration::from_millis(now.saturating_sub(start))
            }
            (start, end) => Duration::from_millis(end.saturating_sub(start)),
        };

        OutputStats {
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            duration,
            started_at,
            reconnects: self.reconnects.load(Ordering::Relaxed),
            current_bitrate_bps: self.bitrate_bps.load(Ordering::Relaxed),
            buffer_level: self.buffer_level.load(Ordering::Relaxed),
            chunks_dropped: self.chunks_dropped.load(Ordering::Relaxed),
        }
    }
}
