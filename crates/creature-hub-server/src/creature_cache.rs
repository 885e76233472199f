//! Creature lookup (consumed external store) plus the process-wide cache the
//! runner hits on every per-track emission.
//!
//! Concurrent-read / writer-wins-on-miss: a cache miss means two racing
//! runner firings might both fetch from the store and both insert; the
//! second insert simply overwrites the first with an equivalent, immutable
//! record. Stale reads are tolerated per the design.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use creature_types::{Creature, CreatureId};

use crate::metrics::Metrics;

#[derive(Debug, thiserror::Error)]
pub enum CreatureLookupError {
    #[error("creature {0} not found")]
    NotFound(CreatureId),
    #[error("creature store error: {0}")]
    Store(String),
}

/// The external collaborator: wherever creature records actually live
/// (MongoDB in the source system). Must be safe to call from the event loop
/// thread and should resolve within the tick budget.
pub trait CreatureSource: Send + Sync {
    fn get_creature(&self, creature_id: &CreatureId) -> Result<Creature, CreatureLookupError>;
}

pub struct CreatureCache {
    source: Arc<dyn CreatureSource>,
    entries: RwLock<HashMap<CreatureId, Arc<Creature>>>,
    metrics: Arc<Metrics>,
}

impl CreatureCache {
    pub fn new(source: Arc<dyn CreatureSource>, metrics: Arc<Metrics>) -> Self {
        Self {
            source,
            entries: RwLock::new(HashMap::new()),
            metrics,
        }
    }

    pub fn get(&self, creature_id: &CreatureId) -> Result<Arc<Creature>, CreatureLookupError> {
        if let Some(hit) = self.entries.read().unwrap_or_else(|e| e.into_inner()).get(creature_id) {
            return Ok(hit.clone());
        }

        self.metrics.creature_cache_misses.fetch_add(1, std::sync::atomic::Ordering::Relaxed);

        let fetched = match self.source.get_creature(creature_id) {
            Ok(creature) => Arc::new(creature),
            Err(e) => {
                self.metrics.creature_lookup_failures.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                return Err(e);
            }
        };
        self.entries
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(creature_id.clone(), fetched.clone());
        Ok(fetched)
    }

    pub fn invalidate(&self, creature_id: &CreatureId) {
        self.entries.write().unwrap_or_else(|e| e.into_inner()).remove(creature_id);
    }

    pub fn invalidate_all(&self) {
        self.entries.write().unwrap_or_else(|e| e.into_inner()).clear();
    }
}

/// Minimal concrete [`CreatureSource`]: reads a JSON array of creatures
/// from disk once at construction and serves lookups from memory. Standing
/// in for whatever record store actually owns creature data; persistence
/// and its schema are out of scope here.
pub struct JsonFileCreatureSource {
    pub creatures: HashMap<CreatureId, Creature>,
}

impl JsonFileCreatureSource {
    pub fn load(path: impl AsRef<std::path::Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("reading creature source file {}: {e}", path.display()))?;
        let list: Vec<Creature> = serde_json::from_str(&raw)
            .map_err(|e| anyhow::anyhow!("parsing creature source file {}: {e}", path.display()))?;
        Ok(Self {
            creatures: list.into_iter().map(|c| (c.id.clone(), c)).collect(),
        })
    }
}

impl CreatureSource for JsonFileCreatureSource {
    fn get_creature(&self, creature_id: &CreatureId) -> Result<Creature, CreatureLookupError> {
        self.creatures
            .get(creature_id)
            .cloned()
            .ok_or_else(|| CreatureLookupError::NotFound(creature_id.clone()))
    }
}

#[cfg(test)]
pub mod test_support {
    use super::*;
    use std::collections::HashMap as StdHashMap;
    use std::sync::Mutex;

    pub struct StaticCreatureSource {
        pub creatures: Mutex<StdHashMap<CreatureId, Creature>>,
        pub lookups: std::sync::atomic::AtomicU64,
    }

    impl StaticCreatureSource {
        pub fn new(creatures: Vec<Creature>) -> Self {
            Self {
                creatures: Mutex::new(creatures.into_iter().map(|c| (c.id.clone(), c)).collect()),
                lookups: std::sync::atomic::AtomicU64::new(0),
            }
        }
    }

    impl CreatureSource for StaticCreatureSource {
        fn get_creature(&self, creature_id: &CreatureId) -> Result<Creature, CreatureLookupError> {
            self.lookups.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            self.creatures
                .lock()
                .unwrap()
                .get(creature_id)
                .cloned()
                .ok_or_else(|| CreatureLookupError::NotFound(creature_id.clone()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::StaticCreatureSource;
    use super::*;

    fn creature(id: &str) -> Creature {
        Creature {
            id: id.to_string(),
            name: format!("creature-{id}"),
            channel_offset: 10,
            audio_channel: 1,
        }
    }

    #[test]
    fn caches_after_first_lookup() {
        let source = Arc::new(StaticCreatureSource::new(vec![creature("c1")]));
        let cache = CreatureCache::new(source.clone(), Arc::new(Metrics::new()));

        let a = cache.get(&"c1".to_string()).unwrap();
        let b = cache.get(&"c1".to_string()).unwrap();
        assert_eq!(a.id, b.id);
        assert_eq!(source.lookups.load(std::sync::atomic::Ordering::Relaxed), 1);
    }

    #[test]
    fn propagates_not_found() {
        let source = Arc::new(StaticCreatureSource::new(vec![]));
        let cache = CreatureCache::new(source, Arc::new(Metrics::new()));
        assert!(matches!(
            cache.get(&"missing".to_string()),
            Err(CreatureLookupError::NotFound(_))
        ));
    }

    #[test]
    fn invalidate_forces_refetch() {
        let source = Arc::new(StaticCreatureSource::new(vec![creature("c1")]));
        let cache = CreatureCache::new(source.clone(), Arc::new(Metrics::new()));
        cache.get(&"c1".to_string()).unwrap();
        cache.invalidate(&"c1".to_string());
        cache.get(&"c1".to_string()).unwrap();
        assert_eq!(source.lookups.load(std::sync::atomic::Ordering::Relaxed), 2);
    }
}
