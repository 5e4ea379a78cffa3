//! Scene facade: composes the schema registry, node tree, component
//! catalog, worker pool and repository behind coarse operations.

mod sync_task;

pub use sync_task::SyncTask;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::component::{Component, ComponentKind};
use crate::repo::{field_filter, id_filter, Record, Repository, TABLE_NODE_SCHEMA, TABLE_NODE_TEMPLATE};
use crate::schema::SchemaRegistry;
use crate::store::{ComponentStore, Node, NodeStore};
use crate::types::{GroveError, Result};
use crate::worker::{Task, WorkerPool};

/// Invocation task taxonomy. Only synchronous invocation is implemented;
/// the other kinds are declared so callers get a clean rejection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    Sync,
    Async,
    Socket,
}

/// A named pairing of a schema with a preset component list, used as a
/// factory spec for nodes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeTemplate {
    #[serde(rename = "_id")]
    pub id: String,
    pub name: String,
    pub schema: String,
    #[serde(default)]
    pub components: Vec<String>,
}

/// Sizing knobs for a scene.
#[derive(Debug, Clone)]
pub struct SceneSettings {
    pub min_workers: usize,
    pub max_workers: usize,
    pub queue_size: usize,
    pub cache_capacity: usize,
}

impl Default for SceneSettings {
    fn default() -> Self {
        Self {
            min_workers: 4,
            max_workers: 16,
            queue_size: 256,
            cache_capacity: 1024,
        }
    }
}

pub struct Scene {
    name: String,
    repo: Arc<dyn Repository>,
    nodes: Arc<NodeStore>,
    components: Arc<ComponentStore>,
    dispatcher: Arc<WorkerPool>,
}

impl Scene {
    pub fn new(name: impl Into<String>, repo: Arc<dyn Repository>, settings: SceneSettings) -> Self {
        let name = name.into();
        let schemas = Arc::new(SchemaRegistry::new(repo.clone(), TABLE_NODE_SCHEMA));
        let nodes = Arc::new(NodeStore::new(
            repo.clone(),
            schemas,
            settings.cache_capacity,
        ));
        let components = Arc::new(ComponentStore::new(
            repo.clone(),
            reqwest::Client::new(),
            settings.cache_capacity,
        ));
        let dispatcher = Arc::new(WorkerPool::new(
            settings.min_workers,
            settings.max_workers,
            settings.queue_size,
        ));

        info!(scene = %name, "scene created");
        Self {
            name,
            repo,
            nodes,
            components,
            dispatcher,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn nodes(&self) -> &Arc<NodeStore> {
        &self.nodes
    }

    pub fn components(&self) -> &Arc<ComponentStore> {
        &self.components
    }

    pub fn dispatcher(&self) -> &Arc<WorkerPool> {
        &self.dispatcher
    }

    pub fn node_schemas(&self) -> &Arc<SchemaRegistry> {
        self.nodes.schemas()
    }

    // ------------------------------------------------------------------
    // Schemas
    // ------------------------------------------------------------------

    pub async fn register_node_schema(&self, info: &Record) -> Result<String> {
        self.node_schemas().register_schema(info).await
    }

    /// Register a `{"schemas": [...]}` batch, e.g. from a bootstrap file.
    pub async fn register_node_schemas_from_value(&self, doc: &Value) -> Result<Vec<String>> {
        self.node_schemas().register_schemas_from_value(doc).await
    }

    // ------------------------------------------------------------------
    // Nodes
    // ------------------------------------------------------------------

    pub async fn register_node(&self, schema_name: &str, info: Record) -> Result<String> {
        self.nodes.register(schema_name, info).await
    }

    pub async fn get_node(&self, id: &str) -> Result<Arc<Node>> {
        self.nodes.get(id).await
    }

    pub async fn delete_node(&self, id: &str) -> Result<()> {
        self.nodes.delete(id).await
    }

    pub async fn update_node_attribute(&self, id: &str, name: &str, value: Value) -> Result<()> {
        self.nodes.update_attribute(id, name, value).await
    }

    // ------------------------------------------------------------------
    // Components
    // ------------------------------------------------------------------

    pub async fn register_component(&self, kind: ComponentKind, schema: Record) -> Result<String> {
        self.components.register(kind, schema).await
    }

    pub async fn get_component(&self, id: &str) -> Result<Arc<dyn Component>> {
        self.components.get(id).await
    }

    pub async fn delete_component(&self, id: &str) -> Result<()> {
        self.components.delete(id).await
    }

    /// Bind a component to a node; both must be resident or loadable.
    pub async fn bind_component_to_node(&self, node_id: &str, component_id: &str) -> Result<()> {
        self.nodes.get(node_id).await?;
        self.components.get(component_id).await?;
        self.nodes.bind_component(node_id, component_id).await
    }

    /// Remove a component binding from a node.
    pub async fn unbind_component_from_node(&self, node_id: &str, component_id: &str) -> Result<()> {
        self.nodes.get(node_id).await?;
        self.components.get(component_id).await?;
        self.nodes.unbind_component(node_id, component_id).await
    }

    // ------------------------------------------------------------------
    // Templates
    // ------------------------------------------------------------------

    /// Register a node template. Registration is idempotent on the template
    /// name: an existing name returns its id.
    pub async fn register_node_template(
        &self,
        template_name: &str,
        schema_name: &str,
        component_ids: Vec<String>,
    ) -> Result<String> {
        match self
            .repo
            .read_one(TABLE_NODE_TEMPLATE, field_filter("name", template_name))
            .await
        {
            Ok(existing) => {
                return existing
                    .get("_id")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .ok_or_else(|| {
                        GroveError::Invariant(format!(
                            "template record {template_name} has no _id"
                        ))
                    });
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }

        if !self.node_schemas().has_schema(schema_name).await {
            return Err(GroveError::validation(format!(
                "no schema named {schema_name}"
            )));
        }
        for component_id in &component_ids {
            self.components.get(component_id).await.map_err(|e| {
                GroveError::validation(format!("no component has id {component_id}: {e}"))
            })?;
        }

        let template = NodeTemplate {
            id: Uuid::new_v4().to_string(),
            name: template_name.to_string(),
            schema: schema_name.to_string(),
            components: component_ids,
        };
        let record = match serde_json::to_value(&template) {
            Ok(Value::Object(record)) => record,
            _ => {
                return Err(GroveError::Invariant(
                    "template did not serialize to an object".to_string(),
                ))
            }
        };
        self.repo.create(TABLE_NODE_TEMPLATE, record).await?;

        debug!(template = %template_name, id = %template.id, "node template registered");
        Ok(template.id)
    }

    pub async fn get_node_template(&self, template_id: &str) -> Result<NodeTemplate> {
        let record = self
            .repo
            .read_one(TABLE_NODE_TEMPLATE, id_filter(template_id))
            .await
            .map_err(|e| match e {
                GroveError::NotFound(_) => {
                    GroveError::NotFound(format!("template {template_id}"))
                }
                other => other,
            })?;
        serde_json::from_value(Value::Object(record)).map_err(|e| {
            GroveError::Invariant(format!("malformed template record {template_id}: {e}"))
        })
    }

    pub async fn delete_node_template(&self, template_id: &str) -> Result<()> {
        self.get_node_template(template_id).await?;
        self.repo
            .delete(TABLE_NODE_TEMPLATE, id_filter(template_id))
            .await
    }

    /// Create a node from a template: validate against the template's
    /// schema, stamp the `template` attribute, and bind every declared
    /// component.
    pub async fn register_node_from_template(
        &self,
        template_id: &str,
        info: Record,
    ) -> Result<String> {
        let template = self.get_node_template(template_id).await?;

        let node_id = self.register_node(&template.schema, info).await?;
        self.nodes
            .update_attribute(&node_id, "template", Value::String(template_id.to_string()))
            .await?;

        for component_id in &template.components {
            self.nodes.bind_component(&node_id, component_id).await?;
        }

        Ok(node_id)
    }

    // ------------------------------------------------------------------
    // Invocation
    // ------------------------------------------------------------------

    /// Dispatch a component invocation against a node through the worker
    /// pool. Returns the task; callers of a `Sync` invocation wait on
    /// [`SyncTask::syncing`].
    pub async fn invoke_node_component(
        &self,
        kind: TaskKind,
        node_id: &str,
        component_id: &str,
        params: Option<Record>,
        headers: Option<HashMap<String, String>>,
    ) -> Result<Arc<SyncTask>> {
        let node = self.nodes.get(node_id).await?;
        let component = self.components.get(component_id).await?;

        match kind {
            TaskKind::Sync => {
                let task = Arc::new(SyncTask::new(
                    Uuid::new_v4().to_string(),
                    self.nodes.clone(),
                    node,
                    component,
                    params.unwrap_or_default(),
                    headers.unwrap_or_default(),
                ));
                let submitted: Arc<dyn Task> = task.clone();
                self.dispatcher.submit(submitted, None).await?;
                Ok(task)
            }
            other => Err(GroveError::Unsupported(format!(
                "task kind {other:?} is not supported"
            ))),
        }
    }

    /// Shut down the worker pool, cancelling queued invocations.
    pub async fn shutdown(&self) {
        self.dispatcher.shutdown().await;
        info!(scene = %self.name, "scene shut down");
    }
}
