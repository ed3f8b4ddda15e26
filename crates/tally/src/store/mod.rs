//! Aggregate store: per-event-type running counts and sums.
//!
//! The processor writes through [`AggregateStore::increment`]; the read API
//! uses the query methods. Implementations must apply count, sum and type
//! registration as one atomic unit so concurrent processes never observe a
//! half-applied event.

mod memory;
mod redis;

pub use self::memory::InMemoryStore;
pub use self::redis::{RedisStore, RedisStoreConfig};

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;

use crate::error::StoreError;

/// Running statistics for one event type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct AggregateStats {
    pub count: f64,
    pub sum: f64,
}

impl AggregateStats {
    /// `sum / count`, or zero when nothing has been counted.
    pub fn average(&self) -> f64 {
        if self.count == 0.0 {
            0.0
        } else {
            self.sum / self.count
        }
    }
}

/// Storage backend for aggregates.
#[async_trait]
pub trait AggregateStore: Send + Sync {
    /// Liveness check. Never fails; returns `false` when unreachable.
    async fn ping(&self) -> bool;

    /// Add one event: count + 1, sum + `value`, and register the type.
    async fn increment(&self, event_type: &str, value: f64) -> Result<(), StoreError>;

    /// Statistics for one type, or `None` if it was never incremented.
    async fn get(&self, event_type: &str) -> Result<Option<AggregateStats>, StoreError>;

    /// All registered event types.
    async fn list_types(&self) -> Result<BTreeSet<String>, StoreError>;

    /// Statistics for every registered type.
    async fn get_all(&self) -> Result<BTreeMap<String, AggregateStats>, StoreError> {
        let mut all = BTreeMap::new();
        for event_type in self.list_types().await? {
            if let Some(stats) = self.get(&event_type).await? {
                all.insert(event_type, stats);
            }
        }
        Ok(all)
    }

    /// Remove every aggregate and the type registry.
    async fn reset_all(&self) -> Result<(), StoreError>;
}

/// Shared handle to a store.
pub type StoreRef = Arc<dyn AggregateStore>;

#[async_trait]
impl<S: AggregateStore + ?Sized> AggregateStore for Arc<S> {
    async fn ping(&self) -> bool {
        (**self).ping().await
    }

    async fn increment(&self, event_type: &str, value: f64) -> Result<(), StoreError> {
        (**self).increment(event_type, value).await
    }

    async fn get(&self, event_type: &str) -> Result<Option<AggregateStats>, StoreError> {
        (**self).get(event_type).await
    }

    async fn list_types(&self) -> Result<BTreeSet<String>, StoreError> {
        (**self).list_types().await
    }

    async fn get_all(&self) -> Result<BTreeMap<String, AggregateStats>, StoreError> {
        (**self).get_all().await
    }

    async fn reset_all(&self) -> Result<(), StoreError> {
        (**self).reset_all().await
    }
}
