//! Shared data types for the creature control plane.
//!
//! These are the contracts the scheduling core consumes from or exposes to
//! external collaborators (the animation/creature store, the HTTP surface).
//! None of this crate knows about the event loop, audio transports, or RTP.

use serde::{Deserialize, Serialize};

/// Event-loop tick counter. Frame 0 is the tick the loop starts on.
pub type FrameNum = u64;

/// A DMX output domain. At most one playback session is active per universe.
pub type UniverseId = u16;

/// Opaque external identifier for a creature record.
pub type CreatureId = String;

/// Opaque external identifier for an animation record.
pub type AnimationId = String;

/// One creature's DMX payload for a single animation frame. The core treats
/// this as an opaque byte sequence; it never interprets per-channel meaning.
pub type DmxPayload = Vec<u8>;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct Track {
    pub creature_id: CreatureId,
    pub frames: Vec<DmxPayload>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct Animation {
    pub id: AnimationId,
    pub title: String,
    /// The animation's native frame period, in milliseconds. Always a
    /// multiple of the event loop tick.
    pub milliseconds_per_frame: u32,
    pub tracks: Vec<Track>,
    pub sound_file: Option<String>,
    /// Forwarded to observability as telemetry; not otherwise consumed.
    pub multitrack_audio: bool,
}

impl Animation {
    /// Non-schema validation the core is responsible for: non-empty tracks
    /// and a frame period that is an exact multiple of the tick.
    pub fn validate(&self, tick_ms: u32) -> Result<(), AnimationValidationError> {
        if self.milliseconds_per_frame == 0 || self.milliseconds_per_frame % tick_ms != 0 {
            return Err(AnimationValidationError::BadFramePeriod {
                ms_per_frame: self.milliseconds_per_frame,
                tick_ms,
            });
        }
        if self.tracks.iter().any(|t| t.frames.is_empty()) {
            return Err(AnimationValidationError::EmptyTrack);
        }
        Ok(())
    }
}

#[derive(Clone, Debug, thiserror::Error)]
pub enum AnimationValidationError {
    #[error("ms_per_frame {ms_per_frame} is not a multiple of the tick period {tick_ms}")]
    BadFramePeriod { ms_per_frame: u32, tick_ms: u32 },
    #[error("animation has a track with zero frames")]
    EmptyTrack,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct Creature {
    pub id: CreatureId,
    pub name: String,
    pub channel_offset: u16,
    pub audio_channel: u16,
}

/// Audio transport variant selected by configuration.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "snake_case")]
pub enum AudioMode {
    Local,
    Rtp,
}

/// Engine selection. Only `Cooperative` is implemented; `Legacy` names the
/// out-of-scope bulk pre-scheduling engine from the source system.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "snake_case")]
pub enum AnimationSchedulerType {
    Cooperative,
    Legacy,
}

/// Error taxonomy for the scheduler's synchronous entry point.
#[derive(Clone, Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("invalid data: {0}")]
    InvalidData(String),
    #[error("internal error: {0}")]
    InternalError(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn track(frames: usize) -> Track {
        Track {
            creature_id: "c1".into(),
            frames: (0..frames).map(|_| vec![0xAA]).collect(),
        }
    }

    fn animation(ms_per_frame: u32, tracks: Vec<Track>) -> Animation {
        Animation {
            id: "a1".into(),
            title: "test".into(),
            milliseconds_per_frame: ms_per_frame,
            tracks,
            sound_file: None,
            multitrack_audio: false,
        }
    }

    #[test]
    fn validate_rejects_non_multiple_frame_period() {
        let anim = animation(7, vec![track(1)]);
        assert!(matches!(
            anim.validate(1),
            Err(AnimationValidationError::BadFramePeriod { .. })
        ));
    }

    #[test]
    fn validate_rejects_empty_track() {
        let anim = animation(20, vec![track(0)]);
        assert!(matches!(anim.validate(1), Err(AnimationValidationError::EmptyTrack)));
    }

    #[test]
    fn validate_accepts_well_formed_animation() {
        let anim = animation(20, vec![track(3)]);
        assert!(anim.validate(1).is_ok());
    }
}
