//! Status LED indicators (GPIO pins in the source system). External
//! collaborator; the core only toggles named lights through a trait object.

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StatusLight {
    Running,
    Animation,
    Sound,
    ReceivingStreamFrames,
    Dmx,
    Heartbeat,
}

pub trait StatusLightSink: Send + Sync {
    fn set(&self, light: StatusLight, on: bool);
}

/// No-op sink for environments with no GPIO hardware wired up.
pub struct NullStatusLightSink;

impl StatusLightSink for NullStatusLightSink {
    fn set(&self, light: StatusLight, on: bool) {
        tracing::trace!(?light, on, "status light set");
    }
}
