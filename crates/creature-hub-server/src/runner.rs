//! The cooperative playback runner (C8): fired once per tick a session has
//! work due, emits this tick's DMX frames, dispatches audio if needed, and
//! either tears the session down or reschedules itself.

use std::sync::Arc;

use anyhow::Context as _;

use crate::context::EventContext;
use crate::event::{EventBody, FrameNum};
use crate::session::PlaybackSession;
use crate::status_light::StatusLight;

const PLAYBACK_RUNNER_TRACE_SAMPLING: f64 = 0.0005;

pub fn fire(frame: FrameNum, session: Arc<PlaybackSession>, ctx: &EventContext) -> anyhow::Result<()> {
    let runner_span = ctx.observability.create_sampled_span(
        "playback_runner.execute",
        session.span(),
        PLAYBACK_RUNNER_TRACE_SAMPLING,
    );
    if let Some(span) = &runner_span {
        span.set_attribute("runner.frame", frame);
        span.set_attribute("session.animation_id", &session.animation().id);
        span.set_attribute("session.universe", session.universe());
    }

    if session.is_cancelled() {
        tracing::debug!(animation = %session.animation().title, "runner detected cancellation, tearing down");
        perform_teardown(&session, ctx);
        session.invoke_on_finish();
        ctx.metrics.sessions_cancelled.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        if let Some(span) = &runner_span {
            span.set_attribute("runner.cancelled", true);
            span.set_success();
        }
        return Ok(());
    }

    session.mark_started_and_invoke_on_start();

    if let Err(e) = emit_dmx_frames(frame, &session, ctx).context("failed to emit dmx frames") {
        tracing::warn!(error = %e, animation = %session.animation().title, "fatal error emitting dmx frames; tearing down session");
        perform_teardown(&session, ctx);
        session.invoke_on_finish();
        ctx.metrics.events_failed.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        if let Some(span) = &runner_span {
            span.set_error(&e.to_string());
        }
        return Ok(());
    }

    if let Some(transport) = session.audio_transport() {
        if transport.needs_per_frame_dispatch() {
            if let Err(e) = transport.dispatch_next_chunk(frame) {
                tracing::warn!(error = %e, "audio dispatch failed; continuing playback");
            }
        }
    }

    if session.all_tracks_finished() {
        tracing::debug!(animation = %session.animation().title, "runner: all tracks finished");
        perform_teardown(&session, ctx);
        session.invoke_on_finish();
        ctx.metrics
            .sessions_finished_naturally
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        if let Some(span) = &runner_span {
            span.set_attribute("runner.completed_naturally", true);
            span.set_success();
        }
        return Ok(());
    }

    let next_frame = calculate_next_frame_number(frame, &session);
    ctx.event_loop.schedule(next_frame, EventBody::PlaybackRunnerTick { session });

    if let Some(span) = &runner_span {
        span.set_attribute("runner.next_frame", next_frame);
        span.set_success();
    }

    Ok(())
}

fn perform_teardown(session: &PlaybackSession, ctx: &EventContext) {
    // No DMX blackout here: creatures are left in their final state rather
    // than snapped back, to avoid a jarring last-instant motion.
    ctx.event_loop.schedule(
        ctx.event_loop.next_frame(),
        EventBody::StatusLight {
            light: StatusLight::Animation,
            on: false,
        },
    );

    if let Some(transport) = session.audio_transport() {
        transport.stop();
    }

    tracing::debug!(animation = %session.animation().title, "runner teardown complete");
}

fn emit_dmx_frames(frame: FrameNum, session: &PlaybackSession, ctx: &EventContext) -> anyhow::Result<()> {
    let universe = session.universe();
    let ms_per_tick = 1u32.max(ctx.event_loop.tick_ms());
    let mut frames_emitted = 0u32;

    session.with_track_states(|states| -> anyhow::Result<()> {
        for state in states.iter_mut() {
            if state.is_finished() {
                continue;
            }
            if frame < state.next_dispatch_frame {
                continue;
            }

            let creature = ctx
                .creature_cache
                .get(&state.creature_id)
                .with_context(|| format!("creature {} not found during playback", state.creature_id))?;

            let payload = state.decoded_frames[state.current_frame_index].clone();
            ctx.event_loop.schedule(
                frame,
                EventBody::DmxEmit {
                    universe,
                    channel_offset: creature.channel_offset,
                    payload,
                },
            );

            tracing::trace!(
                frame_index = state.current_frame_index,
                creature = %creature.name,
                universe,
                "emitted dmx frame",
            );

            state.current_frame_index += 1;
            state.next_dispatch_frame = frame + (session.ms_per_frame() / ms_per_tick) as FrameNum;
            frames_emitted += 1;
        }
        Ok(())
    })?;

    tracing::trace!(frame, frames_emitted, "emitted dmx frames for frame");
    ctx.metrics.dmx_frames_sent.fetch_add(frames_emitted as u64, std::sync::atomic::Ordering::Relaxed);
    Ok(())
}

fn calculate_next_frame_number(frame: FrameNum, session: &PlaybackSession) -> FrameNum {
    frame + (session.ms_per_frame() as FrameNum)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::EventContext;
    use crate::creature_cache::{test_support::StaticCreatureSource, CreatureCache};
    use crate::dmx::CountingDmxSink;
    use crate::eventloop::EventLoop;
    use crate::metrics::Metrics;
    use crate::observability::Observability;
    use crate::session_registry::SessionRegistry;
    use crate::status_light::NullStatusLightSink;
    use creature_types::{Animation, Creature, Track};
    use std::time::Duration;

    fn test_ctx(tick_ms: u64) -> (EventContext, EventLoop) {
        let event_loop = EventLoop::new(Duration::from_millis(tick_ms));
        let source = Arc::new(StaticCreatureSource::new(vec![Creature {
            id: "creature-1".to_string(),
            name: "Rover".to_string(),
            channel_offset: 5,
            audio_channel: 0,
        }]));
        let metrics = Arc::new(Metrics::new());
        let ctx = EventContext {
            event_loop: event_loop.handle(),
            dmx_sink: Arc::new(CountingDmxSink::new()),
            status_sink: Arc::new(NullStatusLightSink),
            creature_cache: Arc::new(CreatureCache::new(source, metrics.clone())),
            session_registry: Arc::new(SessionRegistry::new()),
            rtp_control: None,
            metrics,
            observability: Observability::new(),
        };
        (ctx, event_loop)
    }

    fn animation() -> Animation {
        Animation {
            id: "anim-1".to_string(),
            title: "Blink".to_string(),
            milliseconds_per_frame: 50,
            tracks: vec![Track {
                creature_id: "creature-1".to_string(),
                frames: vec![vec![1], vec![2]],
            }],
            sound_file: None,
            multitrack_audio: false,
        }
    }

    #[test]
    fn fires_and_reschedules_until_tracks_exhausted() {
        let (ctx, _event_loop) = test_ctx(1);
        let session = Arc::new(PlaybackSession::new(animation(), 1, 0, None));

        fire(0, session.clone(), &ctx).unwrap();
        assert_eq!(ctx.event_loop.queue_len(), 2); // dmx emit + next runner tick
        assert_eq!(ctx.metrics.dmx_frames_sent.load(std::sync::atomic::Ordering::Relaxed), 1);

        fire(50, session.clone(), &ctx).unwrap();
        assert_eq!(ctx.metrics.dmx_frames_sent.load(std::sync::atomic::Ordering::Relaxed), 2);
        assert!(session.all_tracks_finished());
    }

    #[test]
    fn cancellation_tears_down_without_emitting_dmx() {
        let (ctx, _event_loop) = test_ctx(1);
        let session = Arc::new(PlaybackSession::new(animation(), 1, 0, None));
        session.cancel();

        fire(0, session.clone(), &ctx).unwrap();
        assert_eq!(ctx.metrics.dmx_frames_sent.load(std::sync::atomic::Ordering::Relaxed), 0);
        assert_eq!(ctx.metrics.sessions_cancelled.load(std::sync::atomic::Ordering::Relaxed), 1);
    }

    #[test]
    fn on_finish_invoked_on_natural_completion() {
        let (ctx, _event_loop) = test_ctx(1);
        let session = Arc::new(PlaybackSession::new(animation(), 1, 0, None));
        let finished = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let finished_clone = finished.clone();
        session.set_on_finish(move || finished_clone.store(true, std::sync::atomic::Ordering::Relaxed));

        fire(0, session.clone(), &ctx).unwrap();
        fire(50, session.clone(), &ctx).unwrap();
        assert!(finished.load(std::sync::atomic::Ordering::Relaxed));
    }

    #[test]
    fn creature_lookup_miss_tears_down_session_instead_of_propagating() {
        let (ctx, _event_loop) = test_ctx(1);
        let mut bad_animation = animation();
        bad_animation.tracks[0].creature_id = "no-such-creature".to_string();
        let session = Arc::new(PlaybackSession::new(bad_animation, 1, 0, None));
        let finished = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let finished_clone = finished.clone();
        session.set_on_finish(move || finished_clone.store(true, std::sync::atomic::Ordering::Relaxed));

        let result = fire(0, session.clone(), &ctx);

        assert!(result.is_ok(), "a fatal per-session error must not propagate out of fire()");
        assert!(finished.load(std::sync::atomic::Ordering::Relaxed), "on_finish must still run");
        assert_eq!(ctx.metrics.events_failed.load(std::sync::atomic::Ordering::Relaxed), 1);
        assert_eq!(ctx.metrics.dmx_frames_sent.load(std::sync::atomic::Ordering::Relaxed), 0);
        // No reschedule: the session must not still be considered live.
        assert_eq!(ctx.event_loop.queue_len(), 1); // only the teardown status-light event
    }
}
