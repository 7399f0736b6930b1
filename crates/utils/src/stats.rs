//! Process-wide stats-provider registry.
//!
//! Subsystems register a [`StatsProvider`] at startup; the HTTP surface
//! renders all snapshots in registration order. The registry is a singleton
//! living for the whole process; registering an already-taken name replaces
//! the previous provider in place, so concurrent or repeated startup paths
//! cannot produce duplicate sections.

use crate::json::{JsonObject, JsonValue};
use std::sync::{Arc, OnceLock, RwLock};

/// A named source of an ordered stats snapshot.
pub trait StatsProvider: Send + Sync {
    /// Section name in the aggregate report.
    fn name(&self) -> &str;

    /// Point-in-time snapshot. Counters are read with atomic loads, not
    /// transactionally; a snapshot may observe fields at slightly different
    /// moments.
    fn snapshot(&self) -> JsonValue;
}

/// Ordered registry of stats providers.
#[derive(Default)]
pub struct StatsRegistry {
    providers: RwLock<Vec<Arc<dyn StatsProvider>>>,
}

static REGISTRY: OnceLock<StatsRegistry> = OnceLock::new();

/// The process-wide registry, created on first access.
pub fn registry() -> &'static StatsRegistry {
    REGISTRY.get_or_init(StatsRegistry::default)
}

impl StatsRegistry {
    /// Register a provider. Re-registering a name replaces the provider but
    /// keeps its position.
    pub fn register(&self, provider: Arc<dyn StatsProvider>) {
        let mut providers = self.providers.write().unwrap_or_else(|e| e.into_inner());
        if let Some(slot) = providers.iter_mut().find(|p| p.name() == provider.name()) {
            *slot = provider;
        } else {
            providers.push(provider);
        }
    }

    /// Snapshot every provider, in registration order.
    pub fn all_stats(&self) -> JsonValue {
        let providers = self.providers.read().unwrap_or_else(|e| e.into_inner());
        let mut obj = JsonObject::new();
        for provider in providers.iter() {
            obj.set(provider.name().to_string(), provider.snapshot());
        }
        JsonValue::Object(obj)
    }

    pub fn len(&self) -> usize {
        self.providers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
