//! Shared harness for the end-to-end scenarios.

#![allow(dead_code)]

use std::sync::Arc;

use duet_core::config::SyncSettings;
use duet_core::db::ControlDb;
use duet_core::models::ConflictStrategy;
use duet_core::store::{MemoryStore, StoreAdapter};
use duet_core::sync::{RetryPolicy, SyncEngine};
use duet_core::{Record, RecordKey, TenantId};
use serde_json::{json, Map, Value};

pub struct Harness {
    pub primary: Arc<MemoryStore>,
    pub secondary: Arc<MemoryStore>,
    pub engine: Arc<SyncEngine>,
}

impl Harness {
    pub fn new(strategy: ConflictStrategy) -> Self {
        Self::with_settings(SyncSettings {
            strategy,
            ..settings()
        })
    }

    pub fn with_settings(settings: SyncSettings) -> Self {
        let primary = Arc::new(MemoryStore::primary());
        let secondary = Arc::new(MemoryStore::secondary());
        let engine = Arc::new(SyncEngine::new(
            Arc::clone(&primary) as Arc<dyn StoreAdapter>,
            Arc::clone(&secondary) as Arc<dyn StoreAdapter>,
            ControlDb::open_in_memory().expect("control db"),
            settings,
        ));
        Self {
            primary,
            secondary,
            engine,
        }
    }

    pub async fn primary_copy(&self, table: &str, pk: &str) -> Option<Record> {
        self.primary.get(&key(table, pk)).await.expect("primary get")
    }

    pub async fn secondary_copy(&self, table: &str, pk: &str) -> Option<Record> {
        self.secondary.get(&key(table, pk)).await.expect("secondary get")
    }
}

pub fn settings() -> SyncSettings {
    SyncSettings {
        retry: RetryPolicy::immediate(3),
        tables: vec!["patients".to_string(), "appointments".to_string()],
        batch_size: 50,
        ..SyncSettings::default()
    }
}

pub fn tenant() -> TenantId {
    TenantId::new("clinic-north").expect("tenant")
}

pub fn key(table: &str, pk: &str) -> RecordKey {
    RecordKey::new(tenant(), table, pk).expect("key")
}

pub fn fields(pairs: &[(&str, Value)]) -> Map<String, Value> {
    pairs
        .iter()
        .map(|(name, value)| ((*name).to_string(), value.clone()))
        .collect()
}

pub fn named(name: &str) -> Map<String, Value> {
    fields(&[("name", json!(name))])
}

/// Write `revisions` local edits so the record ends at that version
pub async fn edit_times(store: &MemoryStore, table: &str, pk: &str, revisions: u64, last: &str) {
    for revision in 1..revisions {
        store
            .write(&key(table, pk), named(&format!("draft {revision}")))
            .await
            .expect("write");
    }
    store.write(&key(table, pk), named(last)).await.expect("write");
}
