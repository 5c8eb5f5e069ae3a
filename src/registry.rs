use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use log::{info, warn};
use std::future::Future;

use crate::error::{HarnessError, HarnessResult};
use crate::provider::ProvisioningService;
use crate::resource::{ResourceHandle, ResourceId, ResourceKind, TestMarker};

#[derive(Debug, Clone)]
pub struct RegistryEntry {
    pub handle: ResourceHandle,
    pub registered_at: DateTime<Utc>,
}

/// Every resource created during a run, until its deletion is confirmed.
///
/// Safe to share between concurrently running scripts; membership changes are
/// the only contention point.
#[derive(Debug, Default)]
pub struct TestResourceRegistry {
    entries: DashMap<(ResourceKind, ResourceId), RegistryEntry>,
}

impl TestResourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false if the handle was already tracked.
    pub fn register(&self, handle: ResourceHandle) -> bool {
        match self.entries.entry(handle.key()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                info!("Registered {handle}");
                slot.insert(RegistryEntry {
                    handle,
                    registered_at: Utc::now(),
                });
                true
            }
        }
    }

    pub fn unregister(&self, handle: &ResourceHandle) -> bool {
        self.entries.remove(&handle.key()).is_some()
    }

    pub fn contains(&self, handle: &ResourceHandle) -> bool {
        self.entries.contains_key(&handle.key())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Registered handles in teardown order: compute before credentials (a
    /// credential may still be attached to a guest), oldest first.
    pub fn handles(&self) -> Vec<ResourceHandle> {
        let mut handles: Vec<ResourceHandle> = self
            .entries
            .iter()
            .map(|entry| entry.value().handle.clone())
            .collect();
        handles.sort_by_key(|h| (h.kind(), h.created_at(), h.id()));
        handles
    }

    pub fn entries(&self) -> Vec<RegistryEntry> {
        self.entries.iter().map(|e| e.value().clone()).collect()
    }

    /// Attempt `reclaim` for every registered handle, one at a time, collecting
    /// failures instead of stopping at the first. Handles whose reclaim
    /// succeeds are unregistered; failed ones stay for a later sweep.
    pub async fn sweep<F, Fut>(&self, mut reclaim: F) -> Vec<HarnessError>
    where
        F: FnMut(ResourceHandle) -> Fut,
        Fut: Future<Output = HarnessResult<()>>,
    {
        let handles = self.handles();
        info!("Sweeping {} registered resource(s)", handles.len());

        let mut errors = Vec::new();
        for handle in handles {
            match reclaim(handle.clone()).await {
                Ok(()) => {
                    self.unregister(&handle);
                }
                Err(e) => {
                    warn!("Sweep could not reclaim {handle}: {e}");
                    errors.push(e);
                }
            }
        }

        info!(
            "Sweep finished: {} failure(s), {} resource(s) still registered",
            errors.len(),
            self.len()
        );
        errors
    }

    /// List every remote resource carrying `marker`, whether or not this
    /// registry knows it. Independent of the per-script teardown path.
    pub async fn discover_orphans(
        &self,
        provider: &dyn ProvisioningService,
        marker: &TestMarker,
    ) -> HarnessResult<Vec<ResourceHandle>> {
        let mut handles = provider.list_by_marker(marker).await.map_err(|source| {
            HarnessError::DiscoveryFailed {
                marker: marker.to_string(),
                source,
            }
        })?;
        handles.sort_by_key(|h| (h.kind(), h.created_at(), h.id()));

        let unknown = handles.iter().filter(|h| !self.contains(h)).count();
        info!(
            "Found {} resource(s) marked {marker}, {unknown} not tracked by this run",
            handles.len()
        );
        Ok(handles)
    }
}
