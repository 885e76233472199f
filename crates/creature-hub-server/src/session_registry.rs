//! Universe -> active session bookkeeping (C10), with preemption: starting
//! a new animation on a universe that already has one running cancels the
//! old one first.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use creature_types::UniverseId;

use crate::session::PlaybackSession;

#[derive(Default)]
pub struct SessionRegistry {
    by_universe: Mutex<HashMap<UniverseId, Arc<PlaybackSession>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs `session` as the active session for `universe`, cancelling
    /// and returning whatever was previously running there.
    pub fn install(&self, universe: UniverseId, session: Arc<PlaybackSession>) -> Option<Arc<PlaybackSession>> {
        let mut map = self.by_universe.lock().unwrap_or_else(|e| e.into_inner());
        let previous = map.insert(universe, session);
        if let Some(prev) = &previous {
            prev.cancel();
            tracing::debug!(universe, "preempted prior session on universe");
        }
        previous
    }

    pub fn active(&self, universe: UniverseId) -> Option<Arc<PlaybackSession>> {
        self.by_universe.lock().unwrap_or_else(|e| e.into_inner()).get(&universe).cloned()
    }

    /// Cancels and removes whatever session is active on `universe`, if any.
    pub fn cancel(&self, universe: UniverseId) -> bool {
        let session = self.by_universe.lock().unwrap_or_else(|e| e.into_inner()).remove(&universe);
        match session {
            Some(session) => {
                session.cancel();
                true
            }
            None => false,
        }
    }

    /// Drops the registry's reference to `universe`'s session if it is
    /// still the one pointed to (identity compared via `Arc::ptr_eq`).
    /// Called by the finish callback so a session removes itself once done,
    /// without clobbering a session that preempted it in the meantime.
    pub fn retire(&self, universe: UniverseId, session: &Arc<PlaybackSession>) {
        let mut map = self.by_universe.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(current) = map.get(&universe) {
            if Arc::ptr_eq(current, session) {
                map.remove(&universe);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use creature_types::Animation;

    fn session() -> Arc<PlaybackSession> {
        Arc::new(PlaybackSession::new(
            Animation {
                id: "a".to_string(),
                title: "t".to_string(),
                milliseconds_per_frame: 50,
                tracks: vec![],
                sound_file: None,
                multitrack_audio: false,
            },
            1,
            0,
            None,
        ))
    }

    #[test]
    fn install_preempts_prior_session_on_same_universe() {
        let registry = SessionRegistry::new();
        let first = session();
        let second = session();

        registry.install(1, first.clone());
        assert!(!first.is_cancelled());

        let previous = registry.install(1, second.clone());
        assert!(previous.is_some());
        assert!(first.is_cancelled());
        assert!(!second.is_cancelled());
        assert!(Arc::ptr_eq(&registry.active(1).unwrap(), &second));
    }

    #[test]
    fn cancel_removes_and_cancels_active_session() {
        let registry = SessionRegistry::new();
        let s = session();
        registry.install(7, s.clone());
        assert!(registry.cancel(7));
        assert!(s.is_cancelled());
        assert!(registry.active(7).is_none());
    }

    #[test]
    fn retire_is_a_noop_if_universe_was_already_preempted() {
        let registry = SessionRegistry::new();
        let first = session();
        let second = session();
        registry.install(3, first.clone());
        registry.install(3, second.clone());

        registry.retire(3, &first);
        assert!(Arc::ptr_eq(&registry.active(3).unwrap(), &second));
    }
}
