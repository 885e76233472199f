//! DMX sink (C4): the E1.31 output side. An external collaborator — the core
//! only calls it, fire-and-forget, and never blocks waiting on it.

use creature_types::UniverseId;

pub trait DmxSink: Send + Sync {
    /// Emit one frame. Non-blocking; failures are reported out-of-band via
    /// `take_errors()`, never as a `Result` the event body has to propagate.
    fn send_dmx(&self, universe: UniverseId, channel_offset: u16, payload: &[u8]);

    /// Number of sends that have failed since the last call, reset to zero
    /// by the read. The event loop drains this after every emission so a
    /// real transmitter's failures surface as metrics without the event
    /// body ever seeing a `Result`. Sinks that cannot fail (this placeholder
    /// included) can leave the default.
    fn take_errors(&self) -> u64 {
        0
    }
}

/// Placeholder sink for environments with no real E1.31 transmitter wired
/// up (tests, local development). Counts sends instead of emitting packets.
pub struct CountingDmxSink {
    sent: std::sync::atomic::AtomicU64,
}

impl CountingDmxSink {
    pub fn new() -> Self {
        Self {
            sent: std::sync::atomic::AtomicU64::new(0),
        }
    }

    pub fn sent_count(&self) -> u64 {
        self.sent.load(std::sync::atomic::Ordering::Relaxed)
    }
}

impl Default for CountingDmxSink {
    fn default() -> Self {
        Self::new()
    }
}

impl DmxSink for CountingDmxSink {
    fn send_dmx(&self, universe: UniverseId, channel_offset: u16, payload: &[u8]) {
        self.sent.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        tracing::trace!(universe, channel_offset, len = payload.len(), "dmx frame sent");
    }
}
