//! Single-flight registry: at most one active request per resource

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::core::{Error, ResourceId, Result};

#[derive(Debug, Default)]
pub struct InFlightRegistry {
    active: Mutex<HashSet<ResourceId>>,
}

impl InFlightRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, HashSet<ResourceId>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Claim `resource`. Fails with `AlreadyInFlight` if a request holds it.
    pub fn try_begin(self: &Arc<Self>, resource: ResourceId) -> Result<FlightGuard> {
        if !self.lock().insert(resource) {
            return Err(Error::AlreadyInFlight(resource));
        }
        Ok(FlightGuard { registry: self.clone(), resource })
    }

    pub fn is_active(&self, resource: ResourceId) -> bool {
        self.lock().contains(&resource)
    }

    pub fn active_count(&self) -> usize {
        self.lock().len()
    }
}

/// Held by a running request; releases the claim on drop
#[derive(Debug)]
pub struct FlightGuard {
    registry: Arc<InFlightRegistry>,
    resource: ResourceId,
}

impl FlightGuard {
    pub fn resource(&self) -> ResourceId {
        self.resource
    }
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        self.registry.lock().remove(&self.resource);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_claim_rejected() {
        let registry = InFlightRegistry::new();
        let guard = registry.try_begin(5).unwrap();
        assert!(matches!(registry.try_begin(5), Err(Error::AlreadyInFlight(5))));
        // Distinct resources are independent
        let _other = registry.try_begin(6).unwrap();
        assert_eq!(registry.active_count(), 2);

        drop(guard);
        assert!(!registry.is_active(5));
        assert!(registry.try_begin(5).is_ok());
    }
}
