//! In-memory repository backend.
//!
//! Table-per-key concurrent store used by tests and dev mode. Matches the
//! Mongo backend's observable behavior for the operations the runtime issues.

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use uuid::Uuid;

use super::{Record, Repository, UpdateDoc};
use crate::types::{GroveError, Result};

/// Repository backed by process memory.
#[derive(Default)]
pub struct MemoryRepository {
    tables: DashMap<String, Vec<Record>>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

fn matches(record: &Record, filter: &Record) -> bool {
    filter.iter().all(|(k, v)| record.get(k) == Some(v))
}

fn record_id(record: &Record) -> Option<String> {
    record.get("_id").and_then(Value::as_str).map(str::to_string)
}

#[async_trait]
impl Repository for MemoryRepository {
    async fn create(&self, table: &str, mut record: Record) -> Result<String> {
        let id = match record_id(&record) {
            Some(id) => id,
            None => {
                let id = Uuid::new_v4().to_string();
                record.insert("_id".to_string(), Value::String(id.clone()));
                id
            }
        };

        let mut rows = self.tables.entry(table.to_string()).or_default();
        if rows.iter().any(|r| record_id(r).as_deref() == Some(&id)) {
            return Err(GroveError::AlreadyExists(format!(
                "record {id} in table {table}"
            )));
        }
        rows.push(record);
        Ok(id)
    }

    async fn read_one(&self, table: &str, filter: Record) -> Result<Record> {
        self.tables
            .get(table)
            .and_then(|rows| rows.iter().find(|r| matches(r, &filter)).cloned())
            .ok_or_else(|| GroveError::NotFound(format!("record in table {table}")))
    }

    async fn read_all(&self, table: &str, filter: Record) -> Result<Vec<Record>> {
        Ok(self
            .tables
            .get(table)
            .map(|rows| {
                rows.iter()
                    .filter(|r| matches(r, &filter))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn update(&self, table: &str, filter: Record, update: UpdateDoc) -> Result<()> {
        let Some(mut rows) = self.tables.get_mut(table) else {
            return Ok(());
        };
        let Some(row) = rows.iter_mut().find(|r| matches(r, &filter)) else {
            return Ok(());
        };

        match update {
            UpdateDoc::Set(fields) => {
                for (k, v) in fields {
                    row.insert(k, v);
                }
            }
            UpdateDoc::Push { field, value } => {
                match row.entry(field).or_insert_with(|| Value::Array(Vec::new())) {
                    Value::Array(items) => items.push(value),
                    other => {
                        return Err(GroveError::Invariant(format!(
                            "$push target is not an array: {other}"
                        )))
                    }
                }
            }
            UpdateDoc::Pull { field, value } => {
                if let Some(Value::Array(items)) = row.get_mut(&field) {
                    items.retain(|item| item != &value);
                }
            }
        }
        Ok(())
    }

    async fn delete(&self, table: &str, filter: Record) -> Result<()> {
        if let Some(mut rows) = self.tables.get_mut(table) {
            rows.retain(|r| !matches(r, &filter));
        }
        Ok(())
    }

    async fn count(&self, table: &str, filter: Option<Record>) -> Result<u64> {
        let count = self
            .tables
            .get(table)
            .map(|rows| match &filter {
                Some(f) => rows.iter().filter(|r| matches(r, f)).count(),
                None => rows.len(),
            })
            .unwrap_or(0);
        Ok(count as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repo::{field_filter, id_filter};
    use serde_json::json;

    fn record(pairs: &[(&str, Value)]) -> Record {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[tokio::test]
    async fn test_create_echoes_provided_id() {
        let repo = MemoryRepository::new();
        let id = repo
            .create("node", record(&[("_id", json!("n-1")), ("name", json!("a"))]))
            .await
            .unwrap();
        assert_eq!(id, "n-1");
    }

    #[tokio::test]
    async fn test_create_generates_missing_id() {
        let repo = MemoryRepository::new();
        let id = repo
            .create("node", record(&[("name", json!("a"))]))
            .await
            .unwrap();
        let row = repo.read_one("node", id_filter(&id)).await.unwrap();
        assert_eq!(row.get("name"), Some(&json!("a")));
    }

    #[tokio::test]
    async fn test_duplicate_id_rejected() {
        let repo = MemoryRepository::new();
        repo.create("node", record(&[("_id", json!("n-1"))]))
            .await
            .unwrap();
        let err = repo
            .create("node", record(&[("_id", json!("n-1"))]))
            .await
            .unwrap_err();
        assert!(matches!(err, GroveError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn test_read_one_missing_is_not_found() {
        let repo = MemoryRepository::new();
        let err = repo.read_one("node", id_filter("nope")).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_push_and_pull() {
        let repo = MemoryRepository::new();
        repo.create("node", record(&[("_id", json!("n-1"))]))
            .await
            .unwrap();

        repo.update(
            "node",
            id_filter("n-1"),
            UpdateDoc::Push {
                field: "components".to_string(),
                value: json!("c-1"),
            },
        )
        .await
        .unwrap();
        repo.update(
            "node",
            id_filter("n-1"),
            UpdateDoc::Push {
                field: "components".to_string(),
                value: json!("c-2"),
            },
        )
        .await
        .unwrap();

        let row = repo.read_one("node", id_filter("n-1")).await.unwrap();
        assert_eq!(row.get("components"), Some(&json!(["c-1", "c-2"])));

        repo.update(
            "node",
            id_filter("n-1"),
            UpdateDoc::Pull {
                field: "components".to_string(),
                value: json!("c-1"),
            },
        )
        .await
        .unwrap();

        let row = repo.read_one("node", id_filter("n-1")).await.unwrap();
        assert_eq!(row.get("components"), Some(&json!(["c-2"])));
    }

    #[tokio::test]
    async fn test_count_with_and_without_filter() {
        let repo = MemoryRepository::new();
        repo.create("node", record(&[("_id", json!("a")), ("parent", json!("p"))]))
            .await
            .unwrap();
        repo.create("node", record(&[("_id", json!("b")), ("parent", json!("p"))]))
            .await
            .unwrap();
        repo.create("node", record(&[("_id", json!("c"))]))
            .await
            .unwrap();

        assert_eq!(repo.count("node", None).await.unwrap(), 3);
        assert_eq!(
            repo.count("node", Some(field_filter("parent", "p")))
                .await
                .unwrap(),
            2
        );
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let repo = MemoryRepository::new();
        repo.create("node", record(&[("_id", json!("a"))]))
            .await
            .unwrap();
        repo.delete("node", id_filter("a")).await.unwrap();
        repo.delete("node", id_filter("a")).await.unwrap();
        assert_eq!(repo.count("node", None).await.unwrap(), 0);
    }
}
