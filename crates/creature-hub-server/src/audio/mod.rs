//! Audio transport and encoding (C5, C6, C11 in the design).

pub mod rtp_control;
pub mod stream_buffer;
pub mod transport;

/// Samples per second for every channel in a stream buffer.
pub const SAMPLE_RATE_HZ: u32 = 48_000;

/// Independent mono Opus streams multiplexed over RTP: 16 creatures + 1 BGM.
pub const RTP_STREAMING_CHANNELS: usize = 17;

/// Duration, in milliseconds, of one Opus-encoded slice. Chosen to keep one
/// slice across all channels inside a single (jumbo) ethernet frame.
pub const RTP_FRAME_MS: u32 = 5;

/// PCM samples per channel per slice: 48_000 * 5 / 1000.
pub const RTP_SAMPLES_PER_FRAME: usize = (SAMPLE_RATE_HZ as usize * RTP_FRAME_MS as usize) / 1000;

/// Default per-channel CBR target. Sixteen creature streams plus a BGM
/// stream are voice/music material at 48kHz mono; this keeps the combined
/// 17-channel slice comfortably inside one jumbo ethernet frame.
pub const RTP_DEFAULT_BITRATE_BPS: i32 = 24_000;
