use std::collections::BTreeMap;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use uuid::Uuid;

use super::{Store, StoreError};
use crate::model::EntityKind;

/// Process-local store. Used when no database is configured, and in tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
    docs: RwLock<BTreeMap<(EntityKind, Uuid), Value>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.docs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.docs.read().is_empty()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get(&self, kind: EntityKind, id: Uuid) -> Result<Option<Value>, StoreError> {
        Ok(self.docs.read().get(&(kind, id)).cloned())
    }

    async fn list(&self, kind: EntityKind) -> Result<Vec<Value>, StoreError> {
        Ok(self
            .docs
            .read()
            .range((kind, Uuid::nil())..=(kind, Uuid::from_u128(u128::MAX)))
            .map(|(_, v)| v.clone())
            .collect())
    }

    async fn save(&self, kind: EntityKind, id: Uuid, body: Value) -> Result<(), StoreError> {
        self.docs.write().insert((kind, id), body);
        Ok(())
    }

    async fn delete(&self, kind: EntityKind, id: Uuid) -> Result<bool, StoreError> {
        Ok(self.docs.write().remove(&(kind, id)).is_some())
    }
}
