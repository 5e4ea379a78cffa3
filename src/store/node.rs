//! Resource nodes and the cached node tree.

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use tracing::{debug, warn};
use uuid::Uuid;

use super::residency::{Lookup, Residency};
use super::{access_tick, kind_of_id, Cached, NO_SLOT};
use crate::repo::{field_filter, id_filter, Record, Repository, UpdateDoc, TABLE_NODE};
use crate::schema::SchemaRegistry;
use crate::types::{GroveError, Result};

/// Attributes that belong to the node envelope rather than its schema
/// payload. They bypass schema validation on update.
fn is_system_attribute(name: &str) -> bool {
    matches!(name, "parent" | "components" | "template")
}

/// A resident resource node.
///
/// The store owns the node while it is resident; the repository owns the
/// durable record. `children` is derived state, rebuilt from `parent`
/// pointers at activation, and is not written back.
#[derive(Debug)]
pub struct Node {
    id: String,
    schema_name: String,
    attributes: RwLock<Record>,
    children: RwLock<Vec<String>>,
    call_time: AtomicU64,
    dirty: AtomicBool,
    heap_slot: AtomicUsize,
}

impl Node {
    fn from_record(record: Record) -> Result<Self> {
        let id = record
            .get("_id")
            .and_then(Value::as_str)
            .ok_or_else(|| GroveError::Invariant("node record has no _id".to_string()))?
            .to_string();
        let schema_name = kind_of_id(&id)?.to_string();

        Ok(Self {
            id,
            schema_name,
            attributes: RwLock::new(record),
            children: RwLock::new(Vec::new()),
            call_time: AtomicU64::new(access_tick()),
            dirty: AtomicBool::new(false),
            heap_slot: AtomicUsize::new(NO_SLOT),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Name of the schema this node conforms to, recovered from the id
    /// prefix once at activation.
    pub fn schema_name(&self) -> &str {
        &self.schema_name
    }

    pub fn name(&self) -> String {
        self.touch();
        self.attributes
            .read()
            .expect("attributes lock")
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    }

    pub fn parent_id(&self) -> Option<String> {
        self.touch();
        self.attributes
            .read()
            .expect("attributes lock")
            .get("parent")
            .and_then(Value::as_str)
            .map(str::to_string)
    }

    pub fn child_ids(&self) -> Vec<String> {
        self.touch();
        self.children.read().expect("children lock").clone()
    }

    /// Read an attribute, failing when it is absent.
    pub fn param(&self, name: &str) -> Result<Value> {
        self.touch();
        self.attributes
            .read()
            .expect("attributes lock")
            .get(name)
            .cloned()
            .ok_or_else(|| {
                GroveError::NotFound(format!(
                    "node {} does not have an attribute named {name}",
                    self.id
                ))
            })
    }

    /// Nilable attribute read, used when filling component parameters.
    pub fn attribute(&self, name: &str) -> Option<Value> {
        self.touch();
        self.attributes
            .read()
            .expect("attributes lock")
            .get(name)
            .cloned()
    }

    /// Set an attribute in place, returning the previous value. Marks the
    /// node dirty. Validation happens at the store level before this call.
    pub fn update_attribute(&self, name: &str, value: Value) -> Option<Value> {
        self.touch();
        self.dirty.store(true, Ordering::Release);
        self.attributes
            .write()
            .expect("attributes lock")
            .insert(name.to_string(), value)
    }

    pub fn component_ids(&self) -> Vec<String> {
        self.touch();
        self.attributes
            .read()
            .expect("attributes lock")
            .get("components")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Bind a component id; false when already bound.
    pub fn add_component(&self, component_id: &str) -> bool {
        self.touch();
        let mut attributes = self.attributes.write().expect("attributes lock");
        let components = attributes
            .entry("components".to_string())
            .or_insert_with(|| Value::Array(Vec::new()));
        let Value::Array(items) = components else {
            return false;
        };
        if items.iter().any(|item| item.as_str() == Some(component_id)) {
            return false;
        }
        items.push(Value::String(component_id.to_string()));
        self.dirty.store(true, Ordering::Release);
        true
    }

    /// Unbind a component id; false when it was not bound.
    pub fn remove_component(&self, component_id: &str) -> bool {
        self.touch();
        let mut attributes = self.attributes.write().expect("attributes lock");
        let Some(Value::Array(items)) = attributes.get_mut("components") else {
            return false;
        };
        let before = items.len();
        items.retain(|item| item.as_str() != Some(component_id));
        let removed = items.len() != before;
        if removed {
            self.dirty.store(true, Ordering::Release);
        }
        removed
    }

    // Child maintenance runs on behalf of an activating or deleted child, so
    // it does not count as an access.
    fn add_child(&self, child_id: &str) {
        let mut children = self.children.write().expect("children lock");
        if !children.iter().any(|c| c == child_id) {
            children.push(child_id.to_string());
        }
    }

    fn remove_child(&self, child_id: &str) {
        self.children
            .write()
            .expect("children lock")
            .retain(|c| c != child_id);
    }

    pub fn serialize(&self) -> Record {
        self.attributes.read().expect("attributes lock").clone()
    }

    fn clear_dirty(&self) {
        self.dirty.store(false, Ordering::Release);
    }
}

impl Cached for Node {
    fn cache_id(&self) -> &str {
        &self.id
    }

    fn call_time(&self) -> u64 {
        self.call_time.load(Ordering::Relaxed)
    }

    fn touch(&self) {
        self.call_time.store(access_tick(), Ordering::Relaxed);
    }

    fn heap_slot(&self) -> &AtomicUsize {
        &self.heap_slot
    }

    fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }
}

/// Cached tree of resource nodes over the repository's `node` table.
pub struct NodeStore {
    repo: Arc<dyn Repository>,
    schemas: Arc<SchemaRegistry>,
    residency: Residency<Node>,
}

impl NodeStore {
    pub fn new(repo: Arc<dyn Repository>, schemas: Arc<SchemaRegistry>, capacity: usize) -> Self {
        Self {
            repo,
            schemas,
            residency: Residency::new(capacity),
        }
    }

    pub fn schemas(&self) -> &Arc<SchemaRegistry> {
        &self.schemas
    }

    /// Validate `info` against the named schema, persist it, and activate
    /// the new node.
    pub async fn register(&self, schema_name: &str, mut info: Record) -> Result<String> {
        self.schemas
            .validate(schema_name, &mut info)
            .await
            .map_err(|e| {
                GroveError::validation(format!("node info for schema {schema_name} is invalid: {e}"))
            })?;

        let id = format!("{schema_name}-{}", Uuid::new_v4());
        info.insert("_id".to_string(), Value::String(id.clone()));
        self.repo.create(TABLE_NODE, info).await?;

        // A failed registration must leave no partial state. An activation
        // that failed in its shrink has already committed the node, so undo
        // the cache insert as well as the repository row. The node is fresh
        // and clean, so dropping it loses nothing.
        if let Err(e) = self.activate(&id).await {
            if let Some(node) = self.residency.take(&id) {
                self.residency.drop_from_heap(&node);
            }
            let _ = self.repo.delete(TABLE_NODE, id_filter(&id)).await;
            return Err(e);
        }
        debug!(node = %id, "node registered");
        Ok(id)
    }

    /// Fetch a node, activating it from the repository on a cache miss.
    pub async fn get(&self, id: &str) -> Result<Arc<Node>> {
        loop {
            match self.residency.lookup(id) {
                Lookup::Resident(node) => {
                    node.touch();
                    self.residency.fix(&node);
                    return Ok(node);
                }
                Lookup::Activating => tokio::task::yield_now().await,
                Lookup::Absent => self.activate(id).await?,
            }
        }
    }

    /// Recursively delete a node and its descendants, depth-first, removing
    /// both cache state and repository records.
    pub async fn delete(&self, id: &str) -> Result<()> {
        self.delete_inner(id).await
    }

    fn delete_inner<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<()>> {
        async move {
            let node = self.get(id).await?;

            if let Some(parent_id) = node.parent_id() {
                if let Lookup::Resident(parent) = self.residency.lookup(&parent_id) {
                    parent.remove_child(id);
                }
            }

            for child_id in node.child_ids() {
                self.delete_inner(&child_id).await?;
            }

            self.deactivate(id).await?;
            self.repo.delete(TABLE_NODE, id_filter(id)).await?;
            debug!(node = %id, "node deleted");
            Ok(())
        }
        .boxed()
    }

    /// Update one attribute. Resident nodes are mutated in place and marked
    /// dirty; non-resident nodes get a direct `$set` without activation.
    pub async fn update_attribute(&self, id: &str, name: &str, mut value: Value) -> Result<()> {
        if name == "_id" {
            return Err(GroveError::validation("node attribute _id is immutable"));
        }

        if !is_system_attribute(name) {
            let schema_name = kind_of_id(id)?;
            if !self.schemas.has_schema(schema_name).await {
                return Err(GroveError::validation(format!(
                    "schema name {schema_name} is not registered"
                )));
            }
            self.schemas
                .validate_field(schema_name, name, &mut value)
                .await?;
        }

        if let Lookup::Resident(node) = self.residency.lookup(id) {
            node.update_attribute(name, value);
            self.residency.fix(&node);
            return Ok(());
        }

        let mut fields = Record::new();
        fields.insert(name.to_string(), value);
        self.repo
            .update(TABLE_NODE, id_filter(id), UpdateDoc::Set(fields))
            .await
    }

    /// Bind a component id to the node's `components` list.
    pub async fn bind_component(&self, id: &str, component_id: &str) -> Result<()> {
        if let Lookup::Resident(node) = self.residency.lookup(id) {
            if node.add_component(component_id) {
                self.residency.fix(&node);
            }
            return Ok(());
        }

        self.repo
            .update(
                TABLE_NODE,
                id_filter(id),
                UpdateDoc::Push {
                    field: "components".to_string(),
                    value: Value::String(component_id.to_string()),
                },
            )
            .await
    }

    /// Remove a component id from the node's `components` list.
    pub async fn unbind_component(&self, id: &str, component_id: &str) -> Result<()> {
        let schema_name = kind_of_id(id)?;
        if !self.schemas.has_schema(schema_name).await {
            return Err(GroveError::validation(format!(
                "schema name {schema_name} is not registered"
            )));
        }

        if let Lookup::Resident(node) = self.residency.lookup(id) {
            if node.remove_component(component_id) {
                self.residency.fix(&node);
            }
            return Ok(());
        }

        self.repo
            .update(
                TABLE_NODE,
                id_filter(id),
                UpdateDoc::Pull {
                    field: "components".to_string(),
                    value: Value::String(component_id.to_string()),
                },
            )
            .await
    }

    /// Force the cache down to half its capacity.
    pub async fn shrink(&self) -> Result<()> {
        self.run_shrink(true).await
    }

    pub fn active_count(&self) -> usize {
        self.residency.active_count()
    }

    pub async fn record_count(&self) -> Result<u64> {
        self.repo.count(TABLE_NODE, None).await
    }

    pub fn is_resident(&self, id: &str) -> bool {
        self.residency.is_resident(id)
    }

    /// Id of the least-recently-used resident node.
    pub fn least_recently_used(&self) -> Option<String> {
        self.residency.least_recent_id()
    }

    /// Activate a node from its repository record.
    async fn activate(&self, id: &str) -> Result<()> {
        if !self.residency.claim(id) {
            return Ok(());
        }

        let record = match self.repo.read_one(TABLE_NODE, id_filter(id)).await {
            Ok(record) => record,
            Err(e) => {
                self.residency.abort_claim(id);
                return Err(match e {
                    GroveError::NotFound(_) => GroveError::NotFound(format!("node {id}")),
                    other => other,
                });
            }
        };

        let node = match Node::from_record(record) {
            Ok(node) => Arc::new(node),
            Err(e) => {
                self.residency.abort_claim(id);
                return Err(e);
            }
        };

        // Rebuild the children index from parent pointers.
        let children = match self
            .repo
            .read_all(TABLE_NODE, field_filter("parent", id))
            .await
        {
            Ok(children) => children,
            Err(e) => {
                self.residency.abort_claim(id);
                return Err(e);
            }
        };
        for child in &children {
            if let Some(child_id) = child.get("_id").and_then(Value::as_str) {
                node.add_child(child_id);
            }
        }

        if let Some(parent_id) = node.parent_id() {
            if let Lookup::Resident(parent) = self.residency.lookup(&parent_id) {
                parent.add_child(id);
            }
        }

        self.residency.commit(node);
        debug!(node = %id, "node activated");
        self.run_shrink(false).await
    }

    /// Deactivate a node: remove from the map, write back dirty attributes,
    /// then drop from the heap. A failed write-back restores the map entry
    /// and leaves the heap untouched.
    async fn deactivate(&self, id: &str) -> Result<()> {
        let Some(node) = self.residency.take(id) else {
            return Ok(());
        };

        if let Err(e) = self.write_back(&node).await {
            self.residency.restore_map_only(node);
            return Err(e);
        }

        self.residency.drop_from_heap(&node);
        debug!(node = %id, "node deactivated");
        Ok(())
    }

    /// Evict least-recently-used nodes down to the shrink target. A failed
    /// write-back reinserts the node and aborts the shrink.
    async fn run_shrink(&self, force: bool) -> Result<()> {
        if !force && !self.residency.over_capacity() {
            return Ok(());
        }
        let target = self.residency.shrink_target();

        while let Some(node) = self.residency.evict_lru(target) {
            if let Err(e) = self.write_back(&node).await {
                self.residency.restore(node);
                return Err(e);
            }
            debug!(node = node.id(), "node evicted");
        }
        Ok(())
    }

    async fn write_back(&self, node: &Node) -> Result<()> {
        if !node.is_dirty() {
            return Ok(());
        }
        self.repo
            .update(
                TABLE_NODE,
                id_filter(node.id()),
                UpdateDoc::Set(node.serialize()),
            )
            .await
            .map_err(|e| {
                warn!(node = node.id(), error = %e, "node write-back failed");
                e
            })?;
        node.clear_dirty();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repo::{MemoryRepository, TABLE_NODE_SCHEMA};
    use serde_json::json;

    async fn store_with_capacity(capacity: usize) -> NodeStore {
        let repo: Arc<dyn Repository> = Arc::new(MemoryRepository::new());
        let schemas = Arc::new(SchemaRegistry::new(repo.clone(), TABLE_NODE_SCHEMA));
        schemas
            .register_schema(
                json!({
                    "name": "Widget",
                    "fields": {
                        "name": { "type": "string", "required": true },
                        "result": { "type": "float64" },
                        "parent": { "type": "string" },
                    },
                })
                .as_object()
                .unwrap(),
            )
            .await
            .unwrap();
        NodeStore::new(repo, schemas, capacity)
    }

    fn info(value: serde_json::Value) -> Record {
        value.as_object().unwrap().clone()
    }

    #[tokio::test]
    async fn test_register_rejects_invalid_info() {
        let store = store_with_capacity(4).await;
        let err = store
            .register("Widget", info(json!({ "result": 1.0 })))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("name"));
        assert_eq!(store.record_count().await.unwrap(), 0);
        assert_eq!(store.active_count(), 0);
    }

    #[tokio::test]
    async fn test_register_activates() {
        let store = store_with_capacity(4).await;
        let id = store
            .register("Widget", info(json!({ "name": "a" })))
            .await
            .unwrap();
        assert!(id.starts_with("Widget-"));
        assert!(store.is_resident(&id));
        assert_eq!(store.active_count(), 1);
        assert_eq!(store.record_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_capacity_one_eviction_round_trip() {
        let store = store_with_capacity(1).await;
        let a = store
            .register("Widget", info(json!({ "name": "A" })))
            .await
            .unwrap();
        let b = store
            .register("Widget", info(json!({ "name": "B" })))
            .await
            .unwrap();

        assert_eq!(store.active_count(), 1);
        assert!(store.is_resident(&b));
        assert!(!store.is_resident(&a));

        // Non-resident update goes straight to the repository.
        store
            .update_attribute(&a, "name", json!("A2"))
            .await
            .unwrap();

        // Get transparently reactivates with the updated attribute.
        let node = store.get(&a).await.unwrap();
        assert_eq!(node.name(), "A2");
        assert_eq!(store.active_count(), 1);
        assert!(store.is_resident(&a));
    }

    #[tokio::test]
    async fn test_resident_count_bounded_after_burst() {
        let capacity = 4;
        let store = store_with_capacity(capacity).await;
        for i in 0..20 {
            store
                .register("Widget", info(json!({ "name": format!("n{i}") })))
                .await
                .unwrap();
        }
        let active = store.active_count();
        assert!(active >= 1 && active <= capacity, "active = {active}");
        assert_eq!(store.record_count().await.unwrap(), 20);
    }

    #[tokio::test]
    async fn test_get_refreshes_recency() {
        let store = store_with_capacity(8).await;
        let first = store
            .register("Widget", info(json!({ "name": "first" })))
            .await
            .unwrap();
        for i in 0..3 {
            store
                .register("Widget", info(json!({ "name": format!("n{i}") })))
                .await
                .unwrap();
        }

        assert_eq!(store.least_recently_used(), Some(first.clone()));
        store.get(&first).await.unwrap();
        assert_ne!(store.least_recently_used(), Some(first));
    }

    #[tokio::test]
    async fn test_update_attribute_requires_schema_field() {
        let store = store_with_capacity(4).await;
        let id = store
            .register("Widget", info(json!({ "name": "a" })))
            .await
            .unwrap();

        let err = store
            .update_attribute(&id, "mystery", json!(1))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("mystery"));

        // In-memory value is unchanged after the failed update.
        let node = store.get(&id).await.unwrap();
        assert!(node.attribute("mystery").is_none());

        let err = store.update_attribute(&id, "_id", json!("x")).await.unwrap_err();
        assert!(err.to_string().contains("immutable"));
    }

    #[tokio::test]
    async fn test_update_attribute_validates_and_applies() {
        let store = store_with_capacity(4).await;
        let id = store
            .register("Widget", info(json!({ "name": "a", "result": 0.0 })))
            .await
            .unwrap();

        store
            .update_attribute(&id, "result", json!(1.1))
            .await
            .unwrap();
        let node = store.get(&id).await.unwrap();
        assert_eq!(node.param("result").unwrap(), json!(1.1));
    }

    #[tokio::test]
    async fn test_children_index_rebuilt_on_activation() {
        let store = store_with_capacity(1).await;
        let parent = store
            .register("Widget", info(json!({ "name": "p" })))
            .await
            .unwrap();
        let child = store
            .register("Widget", info(json!({ "name": "c", "parent": parent })))
            .await
            .unwrap();

        // Capacity 1: the parent was evicted when the child activated.
        assert!(!store.is_resident(&parent));

        let parent_node = store.get(&parent).await.unwrap();
        assert_eq!(parent_node.child_ids(), vec![child]);
    }

    #[tokio::test]
    async fn test_recursive_delete_drains_subtree() {
        let store = store_with_capacity(8).await;
        let a = store
            .register("Widget", info(json!({ "name": "a" })))
            .await
            .unwrap();
        let b = store
            .register("Widget", info(json!({ "name": "b", "parent": a })))
            .await
            .unwrap();
        let _c = store
            .register("Widget", info(json!({ "name": "c", "parent": b })))
            .await
            .unwrap();

        assert_eq!(store.record_count().await.unwrap(), 3);
        store.delete(&a).await.unwrap();
        assert_eq!(store.record_count().await.unwrap(), 0);
        assert_eq!(store.active_count(), 0);
    }

    #[tokio::test]
    async fn test_bind_and_unbind_component() {
        let store = store_with_capacity(4).await;
        let id = store
            .register("Widget", info(json!({ "name": "a" })))
            .await
            .unwrap();

        store.bind_component(&id, "RESTFUL-c1").await.unwrap();
        store.bind_component(&id, "RESTFUL-c2").await.unwrap();
        store.bind_component(&id, "RESTFUL-c1").await.unwrap();

        let node = store.get(&id).await.unwrap();
        assert_eq!(node.component_ids(), vec!["RESTFUL-c1", "RESTFUL-c2"]);

        store.unbind_component(&id, "RESTFUL-c1").await.unwrap();
        let node = store.get(&id).await.unwrap();
        assert_eq!(node.component_ids(), vec!["RESTFUL-c2"]);
    }

    #[tokio::test]
    async fn test_dirty_state_written_back_on_eviction() {
        let store = store_with_capacity(1).await;
        let a = store
            .register("Widget", info(json!({ "name": "A" })))
            .await
            .unwrap();

        // Mutate in place while resident.
        store
            .update_attribute(&a, "name", json!("A-dirty"))
            .await
            .unwrap();

        // Registering B evicts A; the dirty name must land in the repository.
        store
            .register("Widget", info(json!({ "name": "B" })))
            .await
            .unwrap();
        assert!(!store.is_resident(&a));

        let node = store.get(&a).await.unwrap();
        assert_eq!(node.name(), "A-dirty");
    }

    #[tokio::test]
    async fn test_get_missing_node_is_not_found() {
        let store = store_with_capacity(4).await;
        let id = format!("Widget-{}", Uuid::new_v4());
        let err = store.get(&id).await.unwrap_err();
        assert!(err.is_not_found());
    }
}
