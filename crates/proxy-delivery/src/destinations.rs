//! Destination resolution capability.
//!
//! Destinations are externally managed configuration, resolved per tenant at
//! delivery time rather than journalled through the kernel.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;

use proxy_types::{scoped_key, Destination};

/// Capability that resolves `(tenantId, destinationId)` to delivery
/// settings.
#[async_trait]
pub trait DestinationResolver: Send + Sync {
    /// Resolve one destination; `None` means unknown.
    async fn resolve(
        &self,
        tenant_id: &str,
        destination_id: &str,
    ) -> anyhow::Result<Option<Destination>>;
}

/// Map-backed resolver for tests and single-node deployments.
#[derive(Debug, Default)]
pub struct InMemoryDestinations {
    destinations: RwLock<HashMap<String, Destination>>,
}

impl InMemoryDestinations {
    /// An empty resolver.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or replace a destination for a tenant.
    pub fn put(&self, tenant_id: &str, destination: Destination) {
        let key = scoped_key(tenant_id, &destination.destination_id);
        self.destinations
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key, destination);
    }
}

#[async_trait]
impl DestinationResolver for InMemoryDestinations {
    async fn resolve(
        &self,
        tenant_id: &str,
        destination_id: &str,
    ) -> anyhow::Result<Option<Destination>> {
        Ok(self
            .destinations
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&scoped_key(tenant_id, destination_id))
            .cloned())
    }
}
