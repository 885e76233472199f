//! Thin HTTP control surface. Wire framing, auth, and persistence are
//! explicitly out of scope here — these handlers only translate a JSON body
//! into a call against the scheduler/registry/metrics and back.

use std::sync::Arc;

use actix_web::{web, HttpResponse, Responder};
use creature_types::{Animation, UniverseId};
use serde::{Deserialize, Serialize};

use crate::context::EventContext;
use crate::scheduler::CooperativeScheduler;

pub struct AppState {
    pub scheduler: Arc<CooperativeScheduler>,
    pub ctx: EventContext,
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(health)
        .service(schedule_animation)
        .service(cancel_universe)
        .service(metrics_snapshot);
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    current_frame: u64,
    queue_len: usize,
}

#[actix_web::get("/health")]
async fn health(state: web::Data<AppState>) -> impl Responder {
    HttpResponse::Ok().json(HealthResponse {
        status: "ok",
        current_frame: state.ctx.event_loop.current_frame(),
        queue_len: state.ctx.event_loop.queue_len(),
    })
}

#[derive(Deserialize)]
struct ScheduleRequest {
    universe: UniverseId,
    animation: Animation,
    /// Frame to start on; defaults to the next frame if omitted.
    starting_frame: Option<u64>,
}

#[derive(Serialize)]
struct ScheduleResponse {
    universe: UniverseId,
    session_id: String,
    animation_id: String,
    starting_frame: u64,
}

#[actix_web::post("/animations/schedule")]
async fn schedule_animation(state: web::Data<AppState>, body: web::Json<ScheduleRequest>) -> impl Responder {
    let req = body.into_inner();
    let starting_frame = req.starting_frame.unwrap_or_else(|| state.ctx.event_loop.next_frame());

    match state
        .scheduler
        .schedule_animation(starting_frame, req.animation, req.universe)
    {
        Ok(session) => HttpResponse::Ok().json(ScheduleResponse {
            universe: session.universe(),
            session_id: session.id().to_string(),
            animation_id: session.animation().id.clone(),
            starting_frame: session.starting_frame(),
        }),
        Err(e) => HttpResponse::BadRequest().json(ErrorResponse { error: e.to_string() }),
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

#[actix_web::post("/universes/{universe}/cancel")]
async fn cancel_universe(state: web::Data<AppState>, path: web::Path<UniverseId>) -> impl Responder {
    let universe = path.into_inner();
    let cancelled = state.ctx.session_registry.cancel(universe);
    HttpResponse::Ok().json(serde_json::json!({ "universe": universe, "cancelled": cancelled }))
}

#[derive(Serialize)]
struct MetricsResponse {
    total_frames: u64,
    events_processed: u64,
    events_failed: u64,
    animations_played: u64,
    animations_preempted: u64,
    sessions_finished_naturally: u64,
    sessions_cancelled: u64,
    dmx_frames_sent: u64,
    dmx_send_errors: u64,
    rtp_frames_sent: u64,
    rtp_send_errors: u64,
    rtp_encoder_resets: u64,
    creature_cache_misses: u64,
    creature_lookup_failures: u64,
}

#[actix_web::get("/metrics")]
async fn metrics_snapshot(state: web::Data<AppState>) -> impl Responder {
    use std::sync::atomic::Ordering;
    let m = &state.ctx.metrics;
    HttpResponse::Ok().json(MetricsResponse {
        total_frames: m.total_frames.load(Ordering::Relaxed),
        events_processed: m.events_processed.load(Ordering::Relaxed),
        events_failed: m.events_failed.load(Ordering::Relaxed),
        animations_played: m.animations_played.load(Ordering::Relaxed),
        animations_preempted: m.animations_preempted.load(Ordering::Relaxed),
        sessions_finished_naturally: m.sessions_finished_naturally.load(Ordering::Relaxed),
        sessions_cancelled: m.sessions_cancelled.load(Ordering::Relaxed),
        dmx_frames_sent: m.dmx_frames_sent.load(Ordering::Relaxed),
        dmx_send_errors: m.dmx_send_errors.load(Ordering::Relaxed),
        rtp_frames_sent: m.rtp_frames_sent.load(Ordering::Relaxed),
        rtp_send_errors: m.rtp_send_errors.load(Ordering::Relaxed),
        rtp_encoder_resets: m.rtp_encoder_resets.load(Ordering::Relaxed),
        creature_cache_misses: m.creature_cache_misses.load(Ordering::Relaxed),
        creature_lookup_failures: m.creature_lookup_failures.load(Ordering::Relaxed),
    })
}
