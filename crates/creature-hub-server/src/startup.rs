//! Wires the event loop, session registry, creature cache, optional RTP
//! control, scheduler, and HTTP surface together and runs them.

use std::sync::Arc;
use std::time::Duration;

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use anyhow::{Context, Result};

use crate::api::{self, AppState};
use crate::audio::rtp_control::RtpControl;
use crate::audio::stream_buffer::AudioCache;
use crate::config::{AudioModeConfig, ServerConfig};
use crate::context::EventContext;
use crate::creature_cache::{CreatureCache, JsonFileCreatureSource};
use crate::dmx::CountingDmxSink;
use crate::eventloop::EventLoop;
use crate::event::EventBody;
use crate::metrics::Metrics;
use crate::observability::Observability;
use crate::scheduler::CooperativeScheduler;
use crate::session_registry::SessionRegistry;
use crate::status_light::NullStatusLightSink;

pub async fn run(config: ServerConfig) -> Result<()> {
    let bind_addr = config.bind_addr()?;
    let event_loop = EventLoop::new(Duration::from_millis(config.ms_per_tick() as u64));

    let creature_source: Arc<dyn crate::creature_cache::CreatureSource> = match config.creature_source_file.as_deref()
    {
        Some(path) => Arc::new(JsonFileCreatureSource::load(path).context("loading creature source file")?),
        None => {
            tracing::warn!("no creature_source_file configured; playback will fail on every creature lookup");
            Arc::new(JsonFileCreatureSource { creatures: Default::default() })
        }
    };

    let rtp_control = match config.audio_mode {
        AudioModeConfig::Rtp => {
            let rtp_cfg = config
                .rtp
                .as_ref()
                .context("audio_mode = rtp requires an [rtp] config section")?;
            let bind: std::net::SocketAddr = rtp_cfg.bind.parse().context("parsing rtp bind address")?;
            let targets = rtp_cfg
                .targets
                .iter()
                .map(|t| t.parse())
                .collect::<Result<Vec<_>, _>>()
                .context("parsing rtp targets")?;
            Some(Arc::new(RtpControl::new(bind, targets)?))
        }
        AudioModeConfig::Local => None,
    };

    let metrics = Arc::new(Metrics::new());

    let ctx = EventContext {
        event_loop: event_loop.handle(),
        dmx_sink: Arc::new(CountingDmxSink::new()),
        status_sink: Arc::new(NullStatusLightSink),
        creature_cache: Arc::new(CreatureCache::new(creature_source, metrics.clone())),
        session_registry: Arc::new(SessionRegistry::new()),
        rtp_control: rtp_control.clone(),
        metrics,
        observability: Observability::new(),
    };

    if let (Some(_rtp), Some(rtp_cfg)) = (&rtp_control, config.rtp.as_ref()) {
        ctx.event_loop.schedule(
            ctx.event_loop.next_frame(),
            EventBody::EncoderResetAndPrime {
                remaining_silent_frames: rtp_cfg.silent_frame_count,
                first: true,
            },
        );
    }

    let audio_cache = config
        .audio_cache_dir
        .as_ref()
        .map(|dir| Arc::new(AudioCache::new(dir.clone())));

    let scheduler = Arc::new(CooperativeScheduler::new(
        ctx.clone(),
        config.sound_file_location(),
        config.audio_mode.into(),
        audio_cache,
    ));

    let loop_ctx = ctx.clone();
    let loop_metrics = ctx.metrics.clone();
    let event_loop_thread = std::thread::Builder::new()
        .name("creature-event-loop".to_string())
        .spawn(move || event_loop.run(loop_ctx, loop_metrics))
        .context("spawning event loop thread")?;

    tracing::info!(bind = %bind_addr, tick_ms = config.ms_per_tick(), "creature-hub-server starting");

    let app_data = web::Data::new(AppState {
        scheduler,
        ctx: ctx.clone(),
    });

    HttpServer::new(move || {
        App::new()
            .app_data(app_data.clone())
            .wrap(Cors::permissive())
            .configure(api::configure)
    })
    .bind(bind_addr)
    .with_context(|| format!("binding http server to {bind_addr}"))?
    .run()
    .await?;

    ctx.event_loop.stop();
    let _ = event_loop_thread.join();

    Ok(())
}
