//! The fixed-tick cooperative event loop (C1-C3 in the design).
//!
//! One thread, one job: advance the frame counter every `tick` and drain
//! whatever in the queue has come due. Event bodies never block; anything
//! that needs to touch the filesystem or network is front-loaded by the
//! scheduler or handed off to a background worker.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{error, trace};

use crate::context::EventContext;
use crate::event::{EventBody, EventQueue, FrameNum};
use crate::metrics::Metrics;
use crate::runner;

/// Cheap, cloneable reference to the running loop. This is what the rest of
/// the system (scheduler, API handlers, other threads) holds onto — never
/// the loop itself.
#[derive(Clone)]
pub struct EventLoopHandle {
    queue: Arc<EventQueue>,
    current_frame: Arc<AtomicU64>,
    stop: Arc<AtomicBool>,
    tick_ms: u64,
}

impl EventLoopHandle {
    pub fn schedule(&self, target_frame: FrameNum, body: EventBody) {
        self.queue.schedule(target_frame, body);
    }

    pub fn current_frame(&self) -> FrameNum {
        self.current_frame.load(Ordering::Acquire)
    }

    pub fn next_frame(&self) -> FrameNum {
        self.current_frame() + 1
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// The tick period in milliseconds. Used to convert a per-frame
    /// animation cadence (`ms_per_frame`) into a frame-count stride.
    pub fn tick_ms(&self) -> u32 {
        self.tick_ms as u32
    }

    pub fn stop(&self) {
        self.stop.store(true, Ordering::Release);
    }
}

pub struct EventLoop {
    queue: Arc<EventQueue>,
    current_frame: Arc<AtomicU64>,
    stop: Arc<AtomicBool>,
    tick: Duration,
}

impl EventLoop {
    pub fn new(tick: Duration) -> Self {
        Self {
            queue: Arc::new(EventQueue::new()),
            current_frame: Arc::new(AtomicU64::new(0)),
            stop: Arc::new(AtomicBool::new(false)),
            tick,
        }
    }

    pub fn handle(&self) -> EventLoopHandle {
        EventLoopHandle {
            queue: self.queue.clone(),
            current_frame: self.current_frame.clone(),
            stop: self.stop.clone(),
            tick_ms: self.tick.as_millis() as u64,
        }
    }

    /// Run the loop to completion (i.e. until the stop flag is set). Intended
    /// to be spawned on its own thread; blocks the caller otherwise.
    pub fn run(&self, ctx: EventContext, metrics: Arc<Metrics>) {
        let mut next_target_time = Instant::now() + self.tick;

        tracing::info!(tick_ms = self.tick.as_millis() as u64, "event loop starting");

        while !self.stop.load(Ordering::Acquire) {
            let frame = self.current_frame.fetch_add(1, Ordering::AcqRel) + 1;
            metrics.total_frames.fetch_add(1, Ordering::Relaxed);

            loop {
                let Some(event) = self.queue.pop_due(frame) else {
                    break;
                };

                let target_frame = event.target_frame;
                let result = panic::catch_unwind(AssertUnwindSafe(|| {
                    execute(event.body, target_frame, &ctx)
                }));

                match result {
                    Ok(Ok(())) => {
                        metrics.events_processed.fetch_add(1, Ordering::Relaxed);
                    }
                    Ok(Err(e)) => {
                        metrics.events_failed.fetch_add(1, Ordering::Relaxed);
                        error!(error = %e, frame = target_frame, "event body returned an error; absorbed");
                    }
                    Err(panic) => {
                        metrics.events_failed.fetch_add(1, Ordering::Relaxed);
                        let msg = panic_message(&panic);
                        error!(frame = target_frame, panic = %msg, "event body panicked; absorbed");
                    }
                }
            }

            if let Some(remaining) = next_target_time.checked_duration_since(Instant::now()) {
                if remaining > Duration::ZERO {
                    std::thread::sleep(remaining);
                }
            }
            next_target_time += self.tick;
        }

        trace!("event loop stopped");
    }
}

fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

fn execute(body: EventBody, frame: FrameNum, ctx: &EventContext) -> anyhow::Result<()> {
    match body {
        EventBody::DmxEmit {
            universe,
            channel_offset,
            payload,
        } => {
            ctx.dmx_sink.send_dmx(universe, channel_offset, &payload);
            let errors = ctx.dmx_sink.take_errors();
            if errors > 0 {
                ctx.metrics.dmx_send_errors.fetch_add(errors, Ordering::Relaxed);
            }
            Ok(())
        }
        EventBody::PlaybackRunnerTick { session } => runner::fire(frame, session, ctx),
        EventBody::StatusLight { light, on } => {
            ctx.status_sink.set(light, on);
            Ok(())
        }
        EventBody::CacheInvalidate { creature_id } => {
            match creature_id {
                Some(id) => ctx.creature_cache.invalidate(&id),
                None => ctx.creature_cache.invalidate_all(),
            }
            Ok(())
        }
        EventBody::CounterSnapshot => {
            ctx.metrics.log_snapshot();
            Ok(())
        }
        EventBody::EncoderResetAndPrime {
            remaining_silent_frames,
            first,
        } => {
            if let Some(rtp) = ctx.rtp_control.as_ref() {
                if first {
                    rtp.rotate_ssrc();
                    rtp.reset_encoders();
                    ctx.metrics.rtp_encoder_resets.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                }
                if remaining_silent_frames > 0 {
                    rtp.send_silent_frame_to_all_channels()?;
                    ctx.event_loop.schedule(
                        frame + crate::audio::RTP_FRAME_MS as FrameNum,
                        EventBody::EncoderResetAndPrime {
                            remaining_silent_frames: remaining_silent_frames - 1,
                            first: false,
                        },
                    );
                }
            }
            Ok(())
        }
        EventBody::Tick => Ok(()),
        EventBody::Defer(f) => {
            f(ctx);
            Ok(())
        }
    }
}
