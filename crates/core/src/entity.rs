//! Entity Sync Descriptor Registry (§4.1).
//!
//! A descriptor binds an entity name to its server and local contract.
//! Entities are structurally opaque records (§3.1): the registry and engine
//! never assume a schema beyond "a JSON object keyed by the entity's id
//! field". The registry is an ordered mapping — registration order is
//! preserved and is the default sequential push order (§4.4.4) — and a
//! `syncEntity(name)` call for an unregistered name fails closed.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{Result, SyncError};

/// Server-side conflict policy for one entity (§5 conflict resolution
/// rules).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictResolution {
    /// The pulled server record always wins over a locally cached copy.
    ServerWins,
    /// A locally queued mutation always wins until it is acknowledged.
    ClientWins,
    /// Whichever side has the later timestamp wins.
    LastWriteWins,
}

/// A single record as pulled from or pushed to the server: a structurally
/// opaque JSON object (§3.1). The registry never interprets its fields
/// beyond the entity's configured id/cursor field names.
pub type Record = serde_json::Map<String, serde_json::Value>;

/// Per-entity contract consulted by the engine during pull/push (§4.1).
#[async_trait]
pub trait EntitySyncDescriptor: Send + Sync {
    /// Stable registry key, also the wire entity name.
    fn name(&self) -> &str;

    /// Local table the default bulk writer upserts into.
    fn table_name(&self) -> &str;

    /// Local columns the default bulk writer upserts, in the descriptor's
    /// canonical order (§4.4.6 step 3). Entities that override `custom_save`
    /// never reach the default writer and may return an empty slice.
    fn columns(&self) -> &[&str];

    /// Pull base path (`apiEndpoint`), relative to the configured base URL.
    fn pull_endpoint(&self) -> &str;

    /// Push path (`apiMutationEndpoint`). `None` marks a pull-only entity —
    /// enqueueing a mutation against it is a programmer error the engine
    /// rejects at push time.
    fn push_endpoint(&self) -> Option<&str> {
        None
    }

    /// Field the server treats as the delta cursor (§6.1), read after a
    /// pull to compute `lastCursor`/`lastSyncAt`.
    fn cursor_field(&self) -> &str {
        "updatedAt"
    }

    /// Always `["id"]` in the described corpus; multi-key entities list all
    /// of their key columns here.
    fn primary_keys(&self) -> &[&str] {
        &["id"]
    }

    /// Single-column convenience accessor used by the I3 overwrite filter
    /// and bisect id reporting; the first (and, in the described corpus,
    /// only) entry of `primary_keys`.
    fn id_field(&self) -> &str {
        self.primary_keys().first().copied().unwrap_or("id")
    }

    /// Column the bulk writer scopes every upsert to (tenancy scope).
    fn scope_field(&self) -> &str {
        "technicianId"
    }

    /// Upper bound on the page size requested per pull.
    fn batch_size(&self) -> usize {
        100
    }

    fn conflict_resolution(&self) -> ConflictResolution {
        ConflictResolution::ServerWins
    }

    /// Whether this entity may run concurrently with others in the same
    /// sync cycle (§4.4.3, bounded by `EngineFlags::max_parallel_entities`).
    fn parallel_safe(&self) -> bool {
        false
    }

    /// Optional reshaping of a server record before it is persisted locally
    /// (§4.4.6). Default is the identity transform.
    fn transform_from_server(&self, record: Record) -> Result<Record> {
        Ok(record)
    }

    /// Optional reshaping of a local mutation payload before it is sent to
    /// the server (§4.4.5). Default is the identity transform.
    fn transform_to_server(&self, payload: Record) -> Result<Record> {
        Ok(payload)
    }

    /// Entities with non-trivial local persistence (joins, derived rows,
    /// side tables) override the default bulk-upsert save path with their
    /// own write (§4.4.6 `customSave`). `None` means "use the default bulk
    /// writer".
    async fn custom_save(&self, _records: &[Record]) -> Result<Option<()>> {
        Ok(None)
    }
}

/// Ordered, type-erased registry of entity descriptors (§4.1).
#[derive(Clone, Default)]
pub struct EntityRegistry {
    order: Vec<Arc<dyn EntitySyncDescriptor>>,
    by_name: HashMap<String, usize>,
}

impl EntityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a descriptor, preserving insertion order. Re-registering
    /// an existing name replaces it in place without reordering.
    pub fn register(&mut self, descriptor: Arc<dyn EntitySyncDescriptor>) {
        let name = descriptor.name().to_string();
        if let Some(&index) = self.by_name.get(&name) {
            self.order[index] = descriptor;
        } else {
            self.by_name.insert(name, self.order.len());
            self.order.push(descriptor);
        }
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn EntitySyncDescriptor>> {
        self.by_name
            .get(name)
            .map(|&index| Arc::clone(&self.order[index]))
            .ok_or_else(|| SyncError::EntityNotRegistered(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    /// Registered entities in registration order — the default sequential
    /// push/pull order (§4.4.4).
    pub fn in_order(&self) -> impl Iterator<Item = &Arc<dyn EntitySyncDescriptor>> {
        self.order.iter()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StubDescriptor {
        name: &'static str,
        parallel_safe: bool,
    }

    #[async_trait]
    impl EntitySyncDescriptor for StubDescriptor {
        fn name(&self) -> &str {
            self.name
        }

        fn table_name(&self) -> &str {
            self.name
        }

        fn columns(&self) -> &[&str] {
            &["id"]
        }

        fn pull_endpoint(&self) -> &str {
            "/pull"
        }

        fn push_endpoint(&self) -> Option<&str> {
            Some("/push")
        }

        fn parallel_safe(&self) -> bool {
            self.parallel_safe
        }
    }

    #[test]
    fn registration_order_is_preserved() {
        let mut registry = EntityRegistry::new();
        registry.register(Arc::new(StubDescriptor {
            name: "clients",
            parallel_safe: false,
        }));
        registry.register(Arc::new(StubDescriptor {
            name: "work_orders",
            parallel_safe: true,
        }));
        registry.register(Arc::new(StubDescriptor {
            name: "invoices",
            parallel_safe: false,
        }));

        let names: Vec<&str> = registry.in_order().map(|d| d.name()).collect();
        assert_eq!(names, vec!["clients", "work_orders", "invoices"]);
    }

    #[test]
    fn reregistering_replaces_in_place_without_reordering() {
        let mut registry = EntityRegistry::new();
        registry.register(Arc::new(StubDescriptor {
            name: "clients",
            parallel_safe: false,
        }));
        registry.register(Arc::new(StubDescriptor {
            name: "work_orders",
            parallel_safe: false,
        }));
        registry.register(Arc::new(StubDescriptor {
            name: "clients",
            parallel_safe: true,
        }));

        let names: Vec<&str> = registry.in_order().map(|d| d.name()).collect();
        assert_eq!(names, vec!["clients", "work_orders"]);
        assert!(registry.get("clients").unwrap().parallel_safe());
    }

    #[test]
    fn unregistered_entity_lookup_fails_closed() {
        let registry = EntityRegistry::new();
        let err = registry.get("clients").unwrap_err();
        assert!(matches!(err, SyncError::EntityNotRegistered(name) if name == "clients"));
    }
}
