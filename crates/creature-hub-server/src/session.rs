//! State container for one cooperative animation playback (C7 in the
//! design). Replaces bulk upfront scheduling: a session just holds decoded
//! frames and a cursor per track, and [`crate::runner::fire`] advances it
//! one tick at a time.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use creature_types::{Animation, CreatureId, UniverseId};
use uuid::Uuid;

use crate::audio::stream_buffer::AudioStreamBuffer;
use crate::audio::transport::AudioTransport;
use crate::event::FrameNum;
use crate::observability::OperationSpan;

/// Per-track decoded frames and playback cursor.
pub struct TrackState {
    pub creature_id: CreatureId,
    pub decoded_frames: Vec<Vec<u8>>,
    pub current_frame_index: usize,
    pub next_dispatch_frame: FrameNum,
}

impl TrackState {
    pub fn is_finished(&self) -> bool {
        self.current_frame_index >= self.decoded_frames.len()
    }

    pub fn total_frames(&self) -> usize {
        self.decoded_frames.len()
    }
}

type LifecycleCallback = Box<dyn FnOnce() + Send>;

/// Non-copyable, non-movable playback state (enforced here by interior
/// mutability and `Arc` ownership rather than a deleted move constructor —
/// Rust has no equivalent of pinning a stack value, so every session is
/// always behind an `Arc` from construction onward).
pub struct PlaybackSession {
    id: Uuid,
    animation: Animation,
    universe: UniverseId,
    starting_frame: Mutex<FrameNum>,
    track_states: Mutex<Vec<TrackState>>,
    audio_buffer: Mutex<Option<Arc<AudioStreamBuffer>>>,
    audio_transport: Mutex<Option<Arc<dyn AudioTransport>>>,
    cancelled: AtomicBool,
    started: AtomicBool,
    on_start: Mutex<Option<LifecycleCallback>>,
    on_finish: Mutex<Option<LifecycleCallback>>,
    span: Option<OperationSpan>,
}

impl PlaybackSession {
    pub fn new(
        animation: Animation,
        universe: UniverseId,
        starting_frame: FrameNum,
        span: Option<OperationSpan>,
    ) -> Self {
        let id = Uuid::new_v4();

        if let Some(span) = &span {
            span.set_attribute("session.id", id);
            span.set_attribute("session.animation_id", &animation.id);
            span.set_attribute("session.universe", universe);
            span.set_attribute("session.starting_frame", starting_frame);
            span.set_attribute("session.tracks_count", animation.tracks.len());
        }

        let mut track_states = Vec::with_capacity(animation.tracks.len());
        let mut total_frames_decoded = 0usize;
        for track in &animation.tracks {
            total_frames_decoded += track.frames.len();
            track_states.push(TrackState {
                creature_id: track.creature_id.clone(),
                decoded_frames: track.frames.clone(),
                current_frame_index: 0,
                next_dispatch_frame: starting_frame,
            });
        }

        if let Some(span) = &span {
            span.set_attribute("session.total_frames_decoded", total_frames_decoded);
        }

        tracing::debug!(
            session_id = %id,
            animation = %animation.title,
            universe,
            starting_frame,
            tracks = track_states.len(),
            total_frames_decoded,
            "playback session created",
        );

        Self {
            id,
            animation,
            universe,
            starting_frame: Mutex::new(starting_frame),
            track_states: Mutex::new(track_states),
            audio_buffer: Mutex::new(None),
            audio_transport: Mutex::new(None),
            cancelled: AtomicBool::new(false),
            started: AtomicBool::new(false),
            on_start: Mutex::new(None),
            on_finish: Mutex::new(None),
            span,
        }
    }

    /// Sets the cancelled flag. Idempotent; the runner is responsible for
    /// noticing it on its next firing and tearing the session down.
    pub fn cancel(&self) {
        let was_already_cancelled = self.cancelled.swap(true, Ordering::AcqRel);
        if !was_already_cancelled {
            tracing::info!(animation = %self.animation.title, universe = self.universe, "playback session cancelled");
            if let Some(span) = &self.span {
                span.set_attribute("session.cancelled", true);
            }
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn animation(&self) -> &Animation {
        &self.animation
    }

    pub fn universe(&self) -> UniverseId {
        self.universe
    }

    pub fn starting_frame(&self) -> FrameNum {
        *self.starting_frame.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Re-anchor the starting frame and every track's dispatch cursor. Used
    /// when audio loading pushes playback start back past the frame the
    /// scheduler originally picked.
    pub fn set_starting_frame(&self, frame: FrameNum) {
        *self.starting_frame.lock().unwrap_or_else(|e| e.into_inner()) = frame;
        let mut states = self.track_states.lock().unwrap_or_else(|e| e.into_inner());
        for state in states.iter_mut() {
            state.next_dispatch_frame = frame;
        }
        tracing::debug!(animation = %self.animation.title, universe = self.universe, frame, "starting frame updated");
    }

    pub fn ms_per_frame(&self) -> u32 {
        self.animation.milliseconds_per_frame
    }

    pub fn span(&self) -> Option<&OperationSpan> {
        self.span.as_ref()
    }

    pub fn audio_buffer(&self) -> Option<Arc<AudioStreamBuffer>> {
        self.audio_buffer.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn set_audio_buffer(&self, buffer: Arc<AudioStreamBuffer>) {
        *self.audio_buffer.lock().unwrap_or_else(|e| e.into_inner()) = Some(buffer);
    }

    pub fn audio_transport(&self) -> Option<Arc<dyn AudioTransport>> {
        self.audio_transport.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn set_audio_transport(&self, transport: Arc<dyn AudioTransport>) {
        *self.audio_transport.lock().unwrap_or_else(|e| e.into_inner()) = Some(transport);
    }

    pub fn set_on_start(&self, callback: impl FnOnce() + Send + 'static) {
        *self.on_start.lock().unwrap_or_else(|e| e.into_inner()) = Some(Box::new(callback));
    }

    pub fn set_on_finish(&self, callback: impl FnOnce() + Send + 'static) {
        *self.on_finish.lock().unwrap_or_else(|e| e.into_inner()) = Some(Box::new(callback));
    }

    /// Runs the start callback exactly once across the session's lifetime,
    /// no matter how many times or from which thread this is called.
    /// Tracked on the session itself rather than with a thread-local, since
    /// a session's firings aren't guaranteed to stay pinned to one thread.
    pub fn mark_started_and_invoke_on_start(&self) {
        if self.started.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(cb) = self.on_start.lock().unwrap_or_else(|e| e.into_inner()).take() {
            cb();
        }
    }

    pub fn invoke_on_finish(&self) {
        if let Some(cb) = self.on_finish.lock().unwrap_or_else(|e| e.into_inner()).take() {
            cb();
        }
    }

    pub fn with_track_states<R>(&self, f: impl FnOnce(&mut Vec<TrackState>) -> R) -> R {
        let mut states = self.track_states.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut states)
    }

    pub fn all_tracks_finished(&self) -> bool {
        let states = self.track_states.lock().unwrap_or_else(|e| e.into_inner());
        states.is_empty() || states.iter().all(|t| t.is_finished())
    }
}

impl Drop for PlaybackSession {
    fn drop(&mut self) {
        if let Some(span) = &self.span {
            span.set_attribute(
                "session.completion_reason",
                if self.is_cancelled() { "cancelled" } else { "natural" },
            );
            span.set_success();
        }
        tracing::debug!(animation = %self.animation.title, universe = self.universe, "playback session destroyed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use creature_types::Track;

    fn animation(ms_per_frame: u32) -> Animation {
        Animation {
            id: "anim-1".to_string(),
            title: "Test Animation".to_string(),
            milliseconds_per_frame: ms_per_frame,
            tracks: vec![Track {
                creature_id: "creature-1".to_string(),
                frames: vec![vec![1, 2, 3], vec![4, 5, 6]],
            }],
            sound_file: None,
            multitrack_audio: false,
        }
    }

    #[test]
    fn new_session_seeds_track_cursors_at_starting_frame() {
        let session = PlaybackSession::new(animation(50), 1, 100, None);
        session.with_track_states(|states| {
            assert_eq!(states.len(), 1);
            assert_eq!(states[0].next_dispatch_frame, 100);
            assert_eq!(states[0].current_frame_index, 0);
        });
    }

    #[test]
    fn cancel_is_idempotent_and_observable() {
        let session = PlaybackSession::new(animation(50), 1, 0, None);
        assert!(!session.is_cancelled());
        session.cancel();
        session.cancel();
        assert!(session.is_cancelled());
    }

    #[test]
    fn set_starting_frame_reanchors_all_tracks() {
        let session = PlaybackSession::new(animation(50), 1, 0, None);
        session.set_starting_frame(250);
        assert_eq!(session.starting_frame(), 250);
        session.with_track_states(|states| {
            assert!(states.iter().all(|t| t.next_dispatch_frame == 250));
        });
    }

    #[test]
    fn on_start_fires_exactly_once() {
        let session = PlaybackSession::new(animation(50), 1, 0, None);
        let count = Arc::new(std::sync::atomic::AtomicU64::new(0));
        let count_clone = count.clone();
        session.set_on_start(move || {
            count_clone.fetch_add(1, Ordering::Relaxed);
        });
        session.mark_started_and_invoke_on_start();
        session.mark_started_and_invoke_on_start();
        session.mark_started_and_invoke_on_start();
        assert_eq!(count.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn all_tracks_finished_once_cursors_exhausted() {
        let session = PlaybackSession::new(animation(50), 1, 0, None);
        assert!(!session.all_tracks_finished());
        session.with_track_states(|states| {
            states[0].current_frame_index = states[0].total_frames();
        });
        assert!(session.all_tracks_finished());
    }
}
