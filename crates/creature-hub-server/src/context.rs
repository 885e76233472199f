//! Everything an event body needs to do its work, bundled into one cheaply
//! cloneable handle. Built once at startup and handed to the event loop and
//! to every API handler that needs to reach into it.

use std::sync::Arc;

use crate::audio::rtp_control::RtpControl;
use crate::creature_cache::CreatureCache;
use crate::dmx::DmxSink;
use crate::eventloop::EventLoopHandle;
use crate::metrics::Metrics;
use crate::observability::Observability;
use crate::session_registry::SessionRegistry;
use crate::status_light::StatusLightSink;

#[derive(Clone)]
pub struct EventContext {
    pub event_loop: EventLoopHandle,
    pub dmx_sink: Arc<dyn DmxSink>,
    pub status_sink: Arc<dyn StatusLightSink>,
    pub creature_cache: Arc<CreatureCache>,
    pub session_registry: Arc<SessionRegistry>,
    pub rtp_control: Option<Arc<RtpControl>>,
    pub metrics: Arc<Metrics>,
    pub observability: Observability,
}
