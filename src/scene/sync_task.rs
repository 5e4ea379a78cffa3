//! Synchronous invocation task: execute a component against a node and
//! write the result back into the node's attributes.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;
use tracing::warn;

use crate::component::Component;
use crate::repo::Record;
use crate::store::{Node, NodeStore};
use crate::types::{GroveError, Result};
use crate::worker::{Task, TaskState};

/// A one-shot component invocation whose caller waits on `syncing`.
pub struct SyncTask {
    id: String,
    state: TaskState,
    nodes: Arc<NodeStore>,
    node: Arc<Node>,
    component: Arc<dyn Component>,
    params: Mutex<Option<Record>>,
    headers: HashMap<String, String>,
    outcome_tx: Mutex<Option<oneshot::Sender<Result<Record>>>>,
    outcome_rx: tokio::sync::Mutex<Option<oneshot::Receiver<Result<Record>>>>,
}

impl std::fmt::Debug for SyncTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncTask").field("id", &self.id).finish()
    }
}

impl SyncTask {
    pub fn new(
        id: String,
        nodes: Arc<NodeStore>,
        node: Arc<Node>,
        component: Arc<dyn Component>,
        params: Record,
        headers: HashMap<String, String>,
    ) -> Self {
        let (tx, rx) = oneshot::channel();
        Self {
            id,
            state: TaskState::new(),
            nodes,
            node,
            component,
            params: Mutex::new(Some(params)),
            headers,
            outcome_tx: Mutex::new(Some(tx)),
            outcome_rx: tokio::sync::Mutex::new(Some(rx)),
        }
    }

    /// Wait for the invocation outcome. On success every `(attribute,
    /// value)` pair of the result is written back into the node; individual
    /// write failures are logged and skipped, the result is returned either
    /// way.
    pub async fn syncing(&self) -> Result<Record> {
        let receiver = self
            .outcome_rx
            .lock()
            .await
            .take()
            .ok_or_else(|| {
                GroveError::Invariant(format!("task {} result already consumed", self.id))
            })?;

        let outcome = receiver.await.map_err(|_| {
            GroveError::Canceled(format!("task {} dropped before completion", self.id))
        })?;
        let result = outcome?;

        for (attribute, value) in &result {
            if let Err(e) = self
                .nodes
                .update_attribute(self.node.id(), attribute, value.clone())
                .await
            {
                warn!(
                    node = self.node.id(),
                    attribute = %attribute,
                    error = %e,
                    "result write-back skipped"
                );
            }
        }

        Ok(result)
    }
}

#[async_trait]
impl Task for SyncTask {
    fn id(&self) -> &str {
        &self.id
    }

    fn state(&self) -> &TaskState {
        &self.state
    }

    async fn process(&self) {
        let Some(sender) = self.outcome_tx.lock().expect("outcome lock").take() else {
            return;
        };
        let params = self
            .params
            .lock()
            .expect("params lock")
            .take()
            .unwrap_or_default();

        let outcome = self
            .component
            .execute(Some(&self.node), params, &self.headers)
            .await
            .map_err(|e| {
                GroveError::Transport(format!(
                    "error executing component {} of node {}: {e}",
                    self.component.name(),
                    self.node.name()
                ))
            });

        let _ = sender.send(outcome);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repo::{MemoryRepository, Repository, TABLE_NODE_SCHEMA};
    use crate::schema::SchemaRegistry;
    use crate::store::{access_tick, Cached, NO_SLOT};
    use serde_json::json;
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

    struct FixedComponent {
        id: String,
        outcome: std::result::Result<Record, String>,
        call_time: AtomicU64,
        heap_slot: AtomicUsize,
    }

    impl FixedComponent {
        fn returning(result: serde_json::Value) -> Arc<Self> {
            Arc::new(Self {
                id: format!("RESTFUL-{}", uuid::Uuid::new_v4()),
                outcome: Ok(result.as_object().unwrap().clone()),
                call_time: AtomicU64::new(access_tick()),
                heap_slot: AtomicUsize::new(NO_SLOT),
            })
        }

        fn failing(message: &str) -> Arc<Self> {
            Arc::new(Self {
                id: format!("RESTFUL-{}", uuid::Uuid::new_v4()),
                outcome: Err(message.to_string()),
                call_time: AtomicU64::new(access_tick()),
                heap_slot: AtomicUsize::new(NO_SLOT),
            })
        }
    }

    impl Cached for FixedComponent {
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
    }

    #[async_trait]
    impl Component for FixedComponent {
        fn id(&self) -> &str {
            &self.id
        }
        fn name(&self) -> &str {
            "fixed"
        }
        fn serialize(&self) -> Record {
            Record::new()
        }
        async fn execute(
            &self,
            _node: Option<&Node>,
            _params: Record,
            _headers: &HashMap<String, String>,
        ) -> Result<Record> {
            self.outcome
                .clone()
                .map_err(GroveError::Transport)
        }
    }

    async fn node_store() -> Arc<NodeStore> {
        let repo: Arc<dyn Repository> = Arc::new(MemoryRepository::new());
        let schemas = Arc::new(SchemaRegistry::new(repo.clone(), TABLE_NODE_SCHEMA));
        schemas
            .register_schema(
                json!({
                    "name": "Probe",
                    "fields": {
                        "name": { "type": "string", "required": true },
                        "result": { "type": "float64" },
                    },
                })
                .as_object()
                .unwrap(),
            )
            .await
            .unwrap();
        Arc::new(NodeStore::new(repo, schemas, 8))
    }

    fn task_for(
        nodes: Arc<NodeStore>,
        node: Arc<Node>,
        component: Arc<dyn Component>,
    ) -> SyncTask {
        SyncTask::new(
            uuid::Uuid::new_v4().to_string(),
            nodes,
            node,
            component,
            Record::new(),
            HashMap::new(),
        )
    }

    #[tokio::test]
    async fn test_result_written_back_to_node() {
        let nodes = node_store().await;
        let id = nodes
            .register("Probe", json!({ "name": "n", "result": 0.0 }).as_object().unwrap().clone())
            .await
            .unwrap();
        let node = nodes.get(&id).await.unwrap();

        let task = task_for(
            nodes.clone(),
            node.clone(),
            FixedComponent::returning(json!({ "result": 1.1 })),
        );
        task.process().await;
        let result = task.syncing().await.unwrap();

        assert_eq!(result.get("result"), Some(&json!(1.1)));
        assert_eq!(node.param("result").unwrap(), json!(1.1));
    }

    #[tokio::test]
    async fn test_unknown_result_attributes_are_skipped() {
        let nodes = node_store().await;
        let id = nodes
            .register("Probe", json!({ "name": "n" }).as_object().unwrap().clone())
            .await
            .unwrap();
        let node = nodes.get(&id).await.unwrap();

        let task = task_for(
            nodes.clone(),
            node.clone(),
            FixedComponent::returning(json!({ "result": 2.0, "mystery": true })),
        );
        task.process().await;
        let result = task.syncing().await.unwrap();

        // Partial write-back: the known attribute lands, the unknown does not.
        assert_eq!(result.len(), 2);
        assert_eq!(node.param("result").unwrap(), json!(2.0));
        assert!(node.attribute("mystery").is_none());
    }

    #[tokio::test]
    async fn test_component_error_is_surfaced() {
        let nodes = node_store().await;
        let id = nodes
            .register("Probe", json!({ "name": "n" }).as_object().unwrap().clone())
            .await
            .unwrap();
        let node = nodes.get(&id).await.unwrap();

        let task = task_for(nodes, node, FixedComponent::failing("backend down"));
        task.process().await;
        let err = task.syncing().await.unwrap_err();
        assert!(err.to_string().contains("backend down"));
    }

    #[tokio::test]
    async fn test_syncing_twice_fails() {
        let nodes = node_store().await;
        let id = nodes
            .register("Probe", json!({ "name": "n" }).as_object().unwrap().clone())
            .await
            .unwrap();
        let node = nodes.get(&id).await.unwrap();

        let task = task_for(nodes, node, FixedComponent::returning(json!({})));
        task.process().await;
        task.syncing().await.unwrap();
        assert!(task.syncing().await.is_err());
    }
}
