//! In-process aggregate store.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tally_core::emit;
use tally_core::metrics::events::RequestStatus;

use super::{AggregateStats, AggregateStore};
use crate::error::StoreError;
use crate::metrics::{StoreOperation, StoreRequest};

/// Aggregate store backed by a mutex-guarded map.
///
/// Used for local runs and tests. The map lock makes every operation
/// atomic with respect to the others.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    records: Mutex<BTreeMap<String, AggregateStats>>,
    offline: AtomicBool,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate the store going down (`false`) or coming back (`true`).
    ///
    /// While offline, `ping` returns false and every other call fails.
    pub fn set_online(&self, online: bool) {
        self.offline.store(!online, Ordering::SeqCst);
    }

    fn check_online(&self) -> Result<(), StoreError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable {
                message: "in-memory store is offline".to_string(),
            });
        }
        Ok(())
    }

    fn records(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, AggregateStats>> {
        // A panic while holding the lock cannot leave a record half-updated.
        self.records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl AggregateStore for InMemoryStore {
    async fn ping(&self) -> bool {
        let online = self.check_online().is_ok();
        emit!(StoreRequest {
            operation: StoreOperation::Ping,
            status: if online {
                RequestStatus::Success
            } else {
                RequestStatus::Error
            },
        });
        online
    }

    async fn increment(&self, event_type: &str, value: f64) -> Result<(), StoreError> {
        let result = self.check_online().map(|()| {
            let mut records = self.records();
            let stats = records.entry(event_type.to_string()).or_default();
            stats.count += 1.0;
            stats.sum += value;
        });
        emit!(StoreRequest {
            operation: StoreOperation::Increment,
            status: RequestStatus::of(&result),
        });
        result
    }

    async fn get(&self, event_type: &str) -> Result<Option<AggregateStats>, StoreError> {
        self.check_online()?;
        Ok(self.records().get(event_type).copied())
    }

    async fn list_types(&self) -> Result<BTreeSet<String>, StoreError> {
        self.check_online()?;
        Ok(self.records().keys().cloned().collect())
    }

    async fn get_all(&self) -> Result<BTreeMap<String, AggregateStats>, StoreError> {
        self.check_online()?;
        Ok(self.records().clone())
    }

    async fn reset_all(&self) -> Result<(), StoreError> {
        self.check_online()?;
        self.records().clear();
        Ok(())
    }
}
