//! Cooperative animation scheduler (C9): the single entry point that turns
//! an `Animation` plus a target universe into a running [`PlaybackSession`].

use std::path::{Path, PathBuf};
use std::sync::Arc;

use creature_types::{Animation, AudioMode, SchedulerError, UniverseId};

use audio_player::config::PlaybackConfig;

use crate::audio::stream_buffer::{AudioCache, AudioStreamBuffer};
use crate::audio::transport::{AudioTransport, LocalAudioTransport, RtpAudioTransport};
use crate::context::EventContext;
use crate::event::{EventBody, FrameNum};
use crate::session::PlaybackSession;
use crate::status_light::StatusLight;

pub struct CooperativeScheduler {
    ctx: EventContext,
    sound_file_location: PathBuf,
    audio_mode: AudioMode,
    audio_cache: Option<Arc<AudioCache>>,
    local_playback_config: PlaybackConfig,
}

impl CooperativeScheduler {
    pub fn new(
        ctx: EventContext,
        sound_file_location: impl Into<PathBuf>,
        audio_mode: AudioMode,
        audio_cache: Option<Arc<AudioCache>>,
    ) -> Self {
        Self {
            ctx,
            sound_file_location: sound_file_location.into(),
            audio_mode,
            audio_cache,
            local_playback_config: PlaybackConfig::default(),
        }
    }

    pub fn schedule_animation(
        &self,
        starting_frame: FrameNum,
        animation: Animation,
        universe: UniverseId,
    ) -> Result<Arc<PlaybackSession>, SchedulerError> {
        let tick_ms = self.ctx.event_loop.tick_ms();
        animation
            .validate(tick_ms)
            .map_err(|e| SchedulerError::InvalidData(e.to_string()))?;

        let span = self.ctx.observability.create_span("scheduler.schedule_animation", None);
        span.set_attribute("animation.id", &animation.id);
        span.set_attribute("animation.universe", universe);
        span.set_attribute("animation.starting_frame", starting_frame);

        let session = Arc::new(PlaybackSession::new(animation.clone(), universe, starting_frame, Some(span.clone())));

        if let Some(sound_file) = animation.sound_file.as_ref() {
            let path = self.sound_file_location.join(sound_file);
            let buffer = self
                .load_audio_buffer(&path)
                .map_err(|e| SchedulerError::InternalError(format!("failed to load audio buffer: {e:#}")))?;
            session.set_audio_buffer(buffer);
            session.set_audio_transport(self.create_audio_transport());
        }

        self.setup_lifecycle_callbacks(&session, universe);

        let previous = self.ctx.session_registry.install(universe, session.clone());
        if previous.is_some() {
            self.ctx
                .metrics
                .animations_preempted
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        }

        self.ctx.event_loop.schedule(
            starting_frame,
            EventBody::PlaybackRunnerTick { session: session.clone() },
        );

        self.ctx
            .metrics
            .animations_played
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);

        span.set_success();
        tracing::info!(
            animation = %session.animation().title,
            universe,
            starting_frame,
            "scheduled cooperative animation",
        );

        Ok(session)
    }

    fn load_audio_buffer(&self, path: &Path) -> anyhow::Result<Arc<AudioStreamBuffer>> {
        AudioStreamBuffer::load_from_wav(path, self.audio_cache.as_deref())
    }

    fn create_audio_transport(&self) -> Arc<dyn AudioTransport> {
        match self.audio_mode {
            AudioMode::Rtp => {
                let rtp = self
                    .ctx
                    .rtp_control
                    .clone()
                    .expect("rtp audio mode configured without an rtp control instance");
                Arc::new(RtpAudioTransport::new(rtp, self.ctx.metrics.clone()))
            }
            AudioMode::Local => Arc::new(LocalAudioTransport::new(self.local_playback_config.clone())),
        }
    }

    fn setup_lifecycle_callbacks(&self, session: &Arc<PlaybackSession>, universe: UniverseId) {
        let on_start_ctx = self.ctx.clone();
        let on_start_session = session.clone();
        session.set_on_start(move || {
            on_start_ctx.event_loop.schedule(
                on_start_ctx.event_loop.next_frame(),
                EventBody::StatusLight {
                    light: StatusLight::Animation,
                    on: true,
                },
            );
            if let Some(transport) = on_start_session.audio_transport() {
                if let Err(e) = transport.start(&on_start_session) {
                    tracing::warn!(error = %e, "failed to start audio transport");
                }
            }
        });

        let on_finish_ctx = self.ctx.clone();
        let on_finish_session = session.clone();
        session.set_on_finish(move || {
            on_finish_ctx.event_loop.schedule(
                on_finish_ctx.event_loop.next_frame(),
                EventBody::StatusLight {
                    light: StatusLight::Animation,
                    on: false,
                },
            );
            on_finish_ctx.session_registry.retire(universe, &on_finish_session);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::creature_cache::{test_support::StaticCreatureSource, CreatureCache};
    use crate::dmx::CountingDmxSink;
    use crate::eventloop::EventLoop;
    use crate::metrics::Metrics;
    use crate::observability::Observability;
    use crate::session_registry::SessionRegistry;
    use crate::status_light::NullStatusLightSink;
    use creature_types::Track;
    use std::time::Duration;

    fn test_ctx() -> (EventContext, EventLoop) {
        let event_loop = EventLoop::new(Duration::from_millis(1));
        let metrics = Arc::new(Metrics::new());
        let ctx = EventContext {
            event_loop: event_loop.handle(),
            dmx_sink: Arc::new(CountingDmxSink::new()),
            status_sink: Arc::new(NullStatusLightSink),
            creature_cache: Arc::new(CreatureCache::new(Arc::new(StaticCreatureSource::new(vec![])), metrics.clone())),
            session_registry: Arc::new(SessionRegistry::new()),
            rtp_control: None,
            metrics,
            observability: Observability::new(),
        };
        (ctx, event_loop)
    }

    fn silent_animation() -> Animation {
        Animation {
            id: "anim".to_string(),
            title: "Silent".to_string(),
            milliseconds_per_frame: 10,
            tracks: vec![Track {
                creature_id: "c1".to_string(),
                frames: vec![vec![0]],
            }],
            sound_file: None,
            multitrack_audio: false,
        }
    }

    #[test]
    fn schedule_animation_installs_session_and_schedules_initial_tick() {
        let (ctx, _event_loop) = test_ctx();
        let scheduler = CooperativeScheduler::new(ctx.clone(), "/sounds", AudioMode::Local, None);

        let session = scheduler.schedule_animation(0, silent_animation(), 1).unwrap();
        assert!(Arc::ptr_eq(&ctx.session_registry.active(1).unwrap(), &session));
        assert_eq!(ctx.event_loop.queue_len(), 1);
        assert_eq!(ctx.metrics.animations_played.load(std::sync::atomic::Ordering::Relaxed), 1);
    }

    #[test]
    fn scheduling_twice_on_same_universe_preempts_the_first() {
        let (ctx, _event_loop) = test_ctx();
        let scheduler = CooperativeScheduler::new(ctx.clone(), "/sounds", AudioMode::Local, None);

        let first = scheduler.schedule_animation(0, silent_animation(), 1).unwrap();
        let second = scheduler.schedule_animation(0, silent_animation(), 1).unwrap();

        assert!(first.is_cancelled());
        assert!(!second.is_cancelled());
        assert_eq!(ctx.metrics.animations_preempted.load(std::sync::atomic::Ordering::Relaxed), 1);
    }

    #[test]
    fn rejects_animation_whose_frame_period_is_not_a_tick_multiple() {
        let event_loop = EventLoop::new(Duration::from_millis(5));
        let metrics = Arc::new(Metrics::new());
        let ctx = EventContext {
            event_loop: event_loop.handle(),
            dmx_sink: Arc::new(CountingDmxSink::new()),
            status_sink: Arc::new(NullStatusLightSink),
            creature_cache: Arc::new(CreatureCache::new(Arc::new(StaticCreatureSource::new(vec![])), metrics.clone())),
            session_registry: Arc::new(SessionRegistry::new()),
            rtp_control: None,
            metrics,
            observability: Observability::new(),
        };
        let scheduler = CooperativeScheduler::new(ctx, "/sounds", AudioMode::Local, None);
        let mut bad = silent_animation();
        bad.milliseconds_per_frame = 3;

        let result = scheduler.schedule_animation(0, bad, 1);
        assert!(matches!(result, Err(SchedulerError::InvalidData(_))));
    }
}
