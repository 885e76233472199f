//! Audio transport abstraction (C5): how a session's audio actually leaves
//! the machine. Two shapes, unified behind one trait so the runner never
//! needs to know which one it's driving.

use std::fs::File;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{bail, Context, Result};
use cpal::traits::DeviceTrait;
use symphonia::core::probe::Hint;

use audio_player::config::PlaybackConfig;
use audio_player::{decode, device, pipeline};

use super::rtp_control::RtpControl;
use super::stream_buffer::AudioStreamBuffer;
use super::RTP_FRAME_MS;
use crate::event::FrameNum;
use crate::session::PlaybackSession;

/// Capability set the runner drives a session's audio through. Implemented
/// by the RTP streaming transport and the local fire-and-forget transport.
pub trait AudioTransport: Send + Sync {
    /// Called once, on the runner's first firing for this session.
    fn start(&self, session: &PlaybackSession) -> Result<()>;

    /// Called when the session is cancelled or completes.
    fn stop(&self);

    /// Whether `dispatch_next_chunk` needs to be called every tick.
    fn needs_per_frame_dispatch(&self) -> bool;

    /// RTP-only: send whatever chunk is due this frame, returning the frame
    /// number the next dispatch is needed at.
    fn dispatch_next_chunk(&self, current_frame: FrameNum) -> Result<FrameNum>;

    fn is_finished(&self) -> bool;
}

/// Per-frame-dispatch transport: pushes Opus slices into [`RtpControl`] in
/// lockstep with the event loop, so audio and DMX stay frame-aligned.
pub struct RtpAudioTransport {
    rtp: Arc<RtpControl>,
    state: Mutex<RtpState>,
    metrics: Arc<crate::metrics::Metrics>,
}

struct RtpState {
    audio_buffer: Option<Arc<AudioStreamBuffer>>,
    current_frame_index: usize,
    total_frames: usize,
    next_dispatch_frame: FrameNum,
    started: bool,
    stopped: bool,
}

/// Prefill depth: the first few slices go out 1ms apart to fill the jitter
/// buffer before settling into steady 5ms pacing.
const PREFILL_FRAMES: usize = 3;

impl RtpAudioTransport {
    pub fn new(rtp: Arc<RtpControl>, metrics: Arc<crate::metrics::Metrics>) -> Self {
        Self {
            rtp,
            state: Mutex::new(RtpState {
                audio_buffer: None,
                current_frame_index: 0,
                total_frames: 0,
                next_dispatch_frame: 0,
                started: false,
                stopped: false,
            }),
            metrics,
        }
    }
}

impl AudioTransport for RtpAudioTransport {
    fn start(&self, session: &PlaybackSession) -> Result<()> {
        if !self.rtp.is_ready() {
            bail!("rtp control not ready, cannot stream audio");
        }

        let buffer = session
            .audio_buffer()
            .context("no audio buffer attached to session")?;

        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.total_frames = buffer.frame_count();
        state.current_frame_index = 0;
        state.next_dispatch_frame = session.starting_frame();
        state.audio_buffer = Some(buffer);
        state.started = true;
        state.stopped = false;

        tracing::debug!(total_frames = state.total_frames, "rtp audio transport started");
        Ok(())
    }

    fn stop(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.stopped = true;
        tracing::debug!(
            current_frame_index = state.current_frame_index,
            total_frames = state.total_frames,
            "rtp audio transport stopped",
        );
    }

    fn needs_per_frame_dispatch(&self) -> bool {
        true
    }

    fn dispatch_next_chunk(&self, current_frame: FrameNum) -> Result<FrameNum> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());

        if current_frame < state.next_dispatch_frame {
            return Ok(state.next_dispatch_frame);
        }
        if state.stopped || state.current_frame_index >= state.total_frames {
            return Ok(current_frame);
        }

        let buffer = state
            .audio_buffer
            .clone()
            .context("audio buffer disappeared mid-playback")?;

        for channel in 0..super::RTP_STREAMING_CHANNELS {
            match self.rtp.send(channel as u8, buffer.encoded_frame(channel, state.current_frame_index)) {
                Ok(()) => {
                    self.metrics.rtp_frames_sent.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    self.metrics.rtp_send_errors.fetch_add(1, Ordering::Relaxed);
                    return Err(e);
                }
            }
        }

        state.current_frame_index += 1;

        state.next_dispatch_frame = if state.current_frame_index < PREFILL_FRAMES {
            current_frame + 1
        } else {
            current_frame + RTP_FRAME_MS as FrameNum
        };

        Ok(state.next_dispatch_frame)
    }

    fn is_finished(&self) -> bool {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.stopped || (state.started && state.current_frame_index >= state.total_frames)
    }
}

/// Fire-and-forget transport: plays a WAV/compressed file on the host's
/// default output device via the [`audio_player`] decode/device/pipeline
/// stack on a background thread, independent of the event loop's tick.
pub struct LocalAudioTransport {
    playback_config: PlaybackConfig,
    handle: Mutex<Option<LocalPlaybackHandle>>,
}

struct LocalPlaybackHandle {
    cancel: Arc<AtomicBool>,
    finished: Arc<AtomicBool>,
    join: Option<std::thread::JoinHandle<()>>,
}

impl LocalAudioTransport {
    pub fn new(playback_config: PlaybackConfig) -> Self {
        Self {
            playback_config,
            handle: Mutex::new(None),
        }
    }
}

impl AudioTransport for LocalAudioTransport {
    fn start(&self, session: &PlaybackSession) -> Result<()> {
        let sound_file = session
            .animation()
            .sound_file
            .clone()
            .context("no sound file configured for local playback")?;
        let path = PathBuf::from(sound_file);

        let cancel = Arc::new(AtomicBool::new(false));
        let finished = Arc::new(AtomicBool::new(false));
        let playback_config = self.playback_config.clone();

        let cancel_for_thread = cancel.clone();
        let finished_for_thread = finished.clone();
        let join = std::thread::spawn(move || {
            if let Err(e) = play_local_file(&path, &playback_config, cancel_for_thread) {
                tracing::warn!(error = %e, path = %path.display(), "local playback failed");
            }
            finished_for_thread.store(true, Ordering::Release);
        });

        *self.handle.lock().unwrap_or_else(|e| e.into_inner()) = Some(LocalPlaybackHandle {
            cancel,
            finished,
            join: Some(join),
        });

        Ok(())
    }

    fn stop(&self) {
        let mut guard = self.handle.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(mut handle) = guard.take() {
            handle.cancel.store(true, Ordering::Release);
            // Best-effort join with a hard cap: the background thread observes
            // the cancel flag with at most ~100ms of latency, so anything
            // longer means the worker is stuck and we move on without it.
            if let Some(join) = handle.join.take() {
                let deadline = std::time::Instant::now() + std::time::Duration::from_millis(500);
                while !join.is_finished() && std::time::Instant::now() < deadline {
                    std::thread::sleep(std::time::Duration::from_millis(10));
                }
                if join.is_finished() {
                    let _ = join.join();
                } else {
                    tracing::warn!("local playback thread did not stop within timeout");
                }
            }
        }
    }

    fn needs_per_frame_dispatch(&self) -> bool {
        false
    }

    fn dispatch_next_chunk(&self, current_frame: FrameNum) -> Result<FrameNum> {
        Ok(current_frame)
    }

    fn is_finished(&self) -> bool {
        match self.handle.lock().unwrap_or_else(|e| e.into_inner()).as_ref() {
            Some(handle) => handle.finished.load(Ordering::Acquire),
            None => true,
        }
    }
}

/// Refuse to even attempt playback of a file reporting a duration past this;
/// a file this long almost certainly means a bad duration estimate rather
/// than a legitimate creature sound cue.
const MAX_LOCAL_PLAYBACK_DURATION_MS: u64 = 3_600_000;

/// Safety-net margin added to a known duration before the watchdog forces a
/// stop, covering decode/resample drift without cutting a file off early.
const LOCAL_PLAYBACK_WATCHDOG_MARGIN_MS: u64 = 10_000;

fn play_local_file(path: &std::path::Path, playback: &PlaybackConfig, cancel: Arc<AtomicBool>) -> Result<()> {
    let mut hint = Hint::new();
    if let Some(ext) = path.extension().and_then(|s| s.to_str()) {
        hint.with_extension(ext);
    }

    let file = File::open(path).with_context(|| format!("open {path:?}"))?;
    let (src_spec, srcq, duration_ms, _source_info) =
        decode::start_streaming_decode_from_media_source_at(Box::new(file), hint, playback.buffer_seconds, None)
            .context("decode local sound file")?;

    if let Some(duration_ms) = duration_ms {
        if duration_ms > MAX_LOCAL_PLAYBACK_DURATION_MS {
            bail!(
                "refusing to play {path:?}: reported duration {duration_ms}ms exceeds {MAX_LOCAL_PLAYBACK_DURATION_MS}ms maximum"
            );
        }
    }

    let host = cpal::default_host();
    let out_device = device::pick_device(&host, None)?;
    let config = device::pick_output_config(&out_device, Some(src_spec.rate))?;
    let mut stream_config: cpal::StreamConfig = config.clone().into();
    if let Some(buf) = device::pick_buffer_size(&config) {
        stream_config.buffer_size = buf;
    }

    tracing::debug!(
        device = out_device.description().ok().map(|d| d.to_string()).unwrap_or_default(),
        sample_rate = stream_config.sample_rate,
        "local audio transport starting playback",
    );

    let watchdog_done = Arc::new(AtomicBool::new(false));
    let watchdog = duration_ms.map(|duration_ms| {
        let cancel = cancel.clone();
        let watchdog_done = watchdog_done.clone();
        let deadline = std::time::Instant::now()
            + std::time::Duration::from_millis(duration_ms + LOCAL_PLAYBACK_WATCHDOG_MARGIN_MS);
        std::thread::spawn(move || {
            while std::time::Instant::now() < deadline {
                if watchdog_done.load(Ordering::Acquire) {
                    return;
                }
                std::thread::sleep(std::time::Duration::from_millis(100));
            }
            tracing::warn!("local playback exceeded duration + safety margin, forcing stop");
            cancel.store(true, Ordering::Release);
        })
    });

    let result = pipeline::play_decoded_source(
        &out_device,
        &config,
        &stream_config,
        playback,
        src_spec,
        srcq,
        pipeline::PlaybackSessionOptions {
            paused: None,
            cancel: Some(cancel),
            played_frames: Some(Arc::new(AtomicU64::new(0))),
            underrun_frames: Some(Arc::new(AtomicU64::new(0))),
            underrun_events: Some(Arc::new(AtomicU64::new(0))),
            buffered_frames: None,
            buffer_capacity_frames: None,
            volume_percent: None,
            muted: None,
        },
    );

    watchdog_done.store(true, Ordering::Release);
    if let Some(watchdog) = watchdog {
        let _ = watchdog.join();
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::stream_buffer::AudioStreamBuffer;
    use crate::audio::{RTP_SAMPLES_PER_FRAME, RTP_STREAMING_CHANNELS, SAMPLE_RATE_HZ};
    use crate::metrics::Metrics;
    use creature_types::{Animation, Track};
    use std::net::SocketAddr;

    fn test_targets(base_port: u16) -> Vec<SocketAddr> {
        (0..RTP_STREAMING_CHANNELS)
            .map(|i| format!("127.0.0.1:{}", base_port + i as u16).parse().unwrap())
            .collect()
    }

    fn write_test_wav(path: &std::path::Path, frames: usize) {
        let spec = hound::WavSpec {
            channels: RTP_STREAMING_CHANNELS as u16,
            sample_rate: SAMPLE_RATE_HZ,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(path, spec).unwrap();
        for _ in 0..(frames * RTP_SAMPLES_PER_FRAME) {
            for ch in 0..RTP_STREAMING_CHANNELS {
                writer.write_sample((ch as i16) * 10).unwrap();
            }
        }
        writer.finalize().unwrap();
    }

    fn test_animation() -> Animation {
        Animation {
            id: "anim".to_string(),
            title: "Test".to_string(),
            milliseconds_per_frame: 50,
            tracks: vec![Track {
                creature_id: "c1".to_string(),
                frames: vec![vec![1]],
            }],
            sound_file: None,
            multitrack_audio: false,
        }
    }

    #[test]
    fn rtp_dispatch_follows_prefill_then_steady_cadence() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audio.wav");
        write_test_wav(&path, 10);
        let buffer = AudioStreamBuffer::load_from_wav(&path, None).unwrap();

        let bind: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let rtp = Arc::new(RtpControl::new(bind, test_targets(16400)).unwrap());
        let transport = RtpAudioTransport::new(rtp, Arc::new(Metrics::new()));

        let session = PlaybackSession::new(test_animation(), 1, 0, None);
        session.set_audio_buffer(buffer);
        transport.start(&session).unwrap();

        let mut frame = 0u64;
        for _ in 0..(PREFILL_FRAMES - 1) {
            let next = transport.dispatch_next_chunk(frame).unwrap();
            assert_eq!(next, frame + 1, "prefill dispatches must be 1 tick apart");
            frame = next;
        }

        // The dispatch completing the prefill window schedules the first
        // steady-cadence gap.
        let next = transport.dispatch_next_chunk(frame).unwrap();
        assert_eq!(next, frame + RTP_FRAME_MS as FrameNum, "cadence must settle to RTP_FRAME_MS once prefill is done");
    }

    #[test]
    fn dispatch_before_due_frame_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audio2.wav");
        write_test_wav(&path, 10);
        let buffer = AudioStreamBuffer::load_from_wav(&path, None).unwrap();

        let bind: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let rtp = Arc::new(RtpControl::new(bind, test_targets(16500)).unwrap());
        let transport = RtpAudioTransport::new(rtp, Arc::new(Metrics::new()));

        let session = PlaybackSession::new(test_animation(), 1, 5, None);
        session.set_audio_buffer(buffer);
        transport.start(&session).unwrap();

        let next = transport.dispatch_next_chunk(0).unwrap();
        assert_eq!(next, 5, "dispatch before the session's starting frame must not advance");
    }
}
