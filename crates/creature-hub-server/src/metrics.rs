//! Process-wide counters. Analogous to the source system's `SystemCounters`,
//! reimagined as a set of atomics rather than a mutex-guarded struct since
//! nothing here needs a consistent multi-field snapshot.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Default)]
pub struct Metrics {
    pub total_frames: AtomicU64,
    pub events_processed: AtomicU64,
    pub events_failed: AtomicU64,
    pub animations_played: AtomicU64,
    pub animations_preempted: AtomicU64,
    pub sessions_finished_naturally: AtomicU64,
    pub sessions_cancelled: AtomicU64,
    pub dmx_frames_sent: AtomicU64,
    pub dmx_send_errors: AtomicU64,
    pub rtp_frames_sent: AtomicU64,
    pub rtp_send_errors: AtomicU64,
    pub rtp_encoder_resets: AtomicU64,
    pub creature_cache_misses: AtomicU64,
    pub creature_lookup_failures: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn log_snapshot(&self) {
        tracing::info!(
            total_frames = self.total_frames.load(Ordering::Relaxed),
            events_processed = self.events_processed.load(Ordering::Relaxed),
            events_failed = self.events_failed.load(Ordering::Relaxed),
            animations_played = self.animations_played.load(Ordering::Relaxed),
            animations_preempted = self.animations_preempted.load(Ordering::Relaxed),
            sessions_finished_naturally = self.sessions_finished_naturally.load(Ordering::Relaxed),
            sessions_cancelled = self.sessions_cancelled.load(Ordering::Relaxed),
            dmx_frames_sent = self.dmx_frames_sent.load(Ordering::Relaxed),
            dmx_send_errors = self.dmx_send_errors.load(Ordering::Relaxed),
            rtp_frames_sent = self.rtp_frames_sent.load(Ordering::Relaxed),
            rtp_send_errors = self.rtp_send_errors.load(Ordering::Relaxed),
            rtp_encoder_resets = self.rtp_encoder_resets.load(Ordering::Relaxed),
            creature_cache_misses = self.creature_cache_misses.load(Ordering::Relaxed),
            creature_lookup_failures = self.creature_lookup_failures.load(Ordering::Relaxed),
            "counter snapshot",
        );
    }
}
