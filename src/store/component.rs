//! Cached catalog of callable components.
//!
//! Lifecycle mirror of the node store over the `composchema` table, minus
//! children and schema-gated attributes: component records validate their
//! own shape at construction time.

use std::sync::Arc;
use tracing::debug;

use super::residency::{Lookup, Residency};
use super::kind_of_id;
use crate::component::{Component, ComponentKind, RestComponent};
use crate::repo::{id_filter, Record, Repository, TABLE_COMPONENT_SCHEMA};
use crate::types::{GroveError, Result};

pub struct ComponentStore {
    repo: Arc<dyn Repository>,
    http: reqwest::Client,
    residency: Residency<dyn Component>,
}

impl ComponentStore {
    pub fn new(repo: Arc<dyn Repository>, http: reqwest::Client, capacity: usize) -> Self {
        Self {
            repo,
            http,
            residency: Residency::new(capacity),
        }
    }

    /// Validate a component schema, persist it, and activate the component.
    pub async fn register(&self, kind: ComponentKind, schema: Record) -> Result<String> {
        let record = match kind {
            ComponentKind::Restful => RestComponent::build_schema(schema)?,
            other => {
                return Err(GroveError::Unsupported(format!(
                    "{other} components are not supported"
                )))
            }
        };

        let id = self.repo.create(TABLE_COMPONENT_SCHEMA, record).await?;

        // A failed registration must leave no repository row behind.
        if let Err(e) = self.activate(&id).await {
            let _ = self
                .repo
                .delete(TABLE_COMPONENT_SCHEMA, id_filter(&id))
                .await;
            return Err(e);
        }
        debug!(component = %id, "component registered");
        Ok(id)
    }

    /// Fetch a component, activating it from the repository on a cache miss.
    pub async fn get(&self, id: &str) -> Result<Arc<dyn Component>> {
        loop {
            match self.residency.lookup(id) {
                Lookup::Resident(component) => {
                    component.touch();
                    self.residency.fix(&*component);
                    return Ok(component);
                }
                Lookup::Activating => tokio::task::yield_now().await,
                Lookup::Absent => self.activate(id).await?,
            }
        }
    }

    /// Delete a component from the cache and the repository.
    pub async fn delete(&self, id: &str) -> Result<()> {
        self.get(id).await?;

        if let Some(component) = self.residency.take(id) {
            self.residency.drop_from_heap(&*component);
        }
        self.repo.delete(TABLE_COMPONENT_SCHEMA, id_filter(id)).await?;
        debug!(component = %id, "component deleted");
        Ok(())
    }

    /// Force the cache down to half its capacity.
    pub fn shrink(&self) {
        self.run_shrink(true);
    }

    pub fn active_count(&self) -> usize {
        self.residency.active_count()
    }

    pub async fn record_count(&self) -> Result<u64> {
        self.repo.count(TABLE_COMPONENT_SCHEMA, None).await
    }

    pub fn is_resident(&self, id: &str) -> bool {
        self.residency.is_resident(id)
    }

    async fn activate(&self, id: &str) -> Result<()> {
        if !self.residency.claim(id) {
            return Ok(());
        }

        let record = match self
            .repo
            .read_one(TABLE_COMPONENT_SCHEMA, id_filter(id))
            .await
        {
            Ok(record) => record,
            Err(e) => {
                self.residency.abort_claim(id);
                return Err(match e {
                    GroveError::NotFound(_) => GroveError::NotFound(format!("component {id}")),
                    other => other,
                });
            }
        };

        let component = match self.instantiate(id, record) {
            Ok(component) => component,
            Err(e) => {
                self.residency.abort_claim(id);
                return Err(e);
            }
        };

        self.residency.commit(component);
        debug!(component = %id, "component activated");
        self.run_shrink(false);
        Ok(())
    }

    fn instantiate(&self, id: &str, record: Record) -> Result<Arc<dyn Component>> {
        let kind = ComponentKind::from_prefix(kind_of_id(id)?)?;
        match kind {
            ComponentKind::Restful => {
                let component: Arc<dyn Component> =
                    RestComponent::from_record(record, self.http.clone())?;
                Ok(component)
            }
            other => Err(GroveError::Unsupported(format!(
                "cannot instantiate {other} component {id}"
            ))),
        }
    }

    // Components carry no dirty state, so eviction needs no write-back and
    // cannot fail.
    fn run_shrink(&self, force: bool) {
        if !force && !self.residency.over_capacity() {
            return;
        }
        let target = self.residency.shrink_target();
        while let Some(component) = self.residency.evict_lru(target) {
            debug!(component = component.id(), "component evicted");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repo::MemoryRepository;
    use serde_json::json;

    fn sum_schema(name: &str) -> Record {
        json!({
            "name": name,
            "api": "http://localhost:9000/sum",
            "method": "POST",
            "reqParams": [
                { "name": "a", "type": "float64", "required": true },
                { "name": "b", "type": "float64", "required": true },
            ],
            "resStatuses": [ { "code": 200 } ],
        })
        .as_object()
        .unwrap()
        .clone()
    }

    fn store_with_capacity(capacity: usize) -> ComponentStore {
        ComponentStore::new(
            Arc::new(MemoryRepository::new()),
            reqwest::Client::new(),
            capacity,
        )
    }

    #[tokio::test]
    async fn test_register_and_get() {
        let store = store_with_capacity(4);
        let id = store
            .register(ComponentKind::Restful, sum_schema("sum"))
            .await
            .unwrap();
        assert!(id.starts_with("RESTFUL-"));
        assert!(store.is_resident(&id));

        let component = store.get(&id).await.unwrap();
        assert_eq!(component.name(), "sum");
        assert_eq!(store.record_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_unsupported_kind_rejected() {
        let store = store_with_capacity(4);
        let err = store
            .register(ComponentKind::Grpc, sum_schema("grpc"))
            .await
            .unwrap_err();
        assert!(matches!(err, GroveError::Unsupported(_)));
        assert_eq!(store.record_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_eviction_and_reactivation() {
        let store = store_with_capacity(1);
        let first = store
            .register(ComponentKind::Restful, sum_schema("first"))
            .await
            .unwrap();
        let second = store
            .register(ComponentKind::Restful, sum_schema("second"))
            .await
            .unwrap();

        assert_eq!(store.active_count(), 1);
        assert!(store.is_resident(&second));
        assert!(!store.is_resident(&first));

        let component = store.get(&first).await.unwrap();
        assert_eq!(component.name(), "first");
        assert!(store.is_resident(&first));
        assert_eq!(store.active_count(), 1);
    }

    #[tokio::test]
    async fn test_delete_removes_both_tiers() {
        let store = store_with_capacity(4);
        let id = store
            .register(ComponentKind::Restful, sum_schema("gone"))
            .await
            .unwrap();
        store.delete(&id).await.unwrap();

        assert_eq!(store.active_count(), 0);
        assert_eq!(store.record_count().await.unwrap(), 0);
        assert!(store.get(&id).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_shrink_halves_cache() {
        let store = store_with_capacity(4);
        for i in 0..4 {
            store
                .register(ComponentKind::Restful, sum_schema(&format!("c{i}")))
                .await
                .unwrap();
        }
        assert_eq!(store.active_count(), 4);
        store.shrink();
        assert_eq!(store.active_count(), 2);
    }
}
