//! MongoDB repository backend.

use async_trait::async_trait;
use bson::{doc, Document};
use futures_util::StreamExt;
use mongodb::Client;
use serde_json::Value;
use tracing::{error, info};
use uuid::Uuid;

use super::{Record, Repository, UpdateDoc};
use crate::types::{GroveError, Result};

/// Repository backed by a MongoDB database.
#[derive(Clone)]
pub struct MongoRepository {
    db: mongodb::Database,
}

impl MongoRepository {
    /// Connect and verify the connection with a ping.
    pub async fn connect(uri: &str, db_name: &str, timeout_secs: u64) -> Result<Self> {
        info!("Connecting to MongoDB at {}", uri);

        // Bound server selection so an unreachable MongoDB fails fast instead
        // of hanging the whole bootstrap.
        let timeout_ms = timeout_secs.saturating_mul(1000);
        let timeout_uri = if uri.contains('?') {
            format!("{uri}&serverSelectionTimeoutMS={timeout_ms}&connectTimeoutMS={timeout_ms}")
        } else {
            format!("{uri}?serverSelectionTimeoutMS={timeout_ms}&connectTimeoutMS={timeout_ms}")
        };

        let client = Client::with_uri_str(&timeout_uri)
            .await
            .map_err(|e| GroveError::Transport(format!("failed to connect to MongoDB: {e}")))?;

        client
            .database(db_name)
            .run_command(doc! { "ping": 1 })
            .await
            .map_err(|e| GroveError::Transport(format!("MongoDB ping failed: {e}")))?;

        info!("Connected to MongoDB database '{}'", db_name);

        Ok(Self {
            db: client.database(db_name),
        })
    }

    fn collection(&self, table: &str) -> mongodb::Collection<Document> {
        self.db.collection::<Document>(table)
    }
}

fn to_document(record: &Record) -> Result<Document> {
    bson::to_document(record)
        .map_err(|e| GroveError::Transport(format!("record to BSON failed: {e}")))
}

fn to_bson(value: &Value) -> Result<bson::Bson> {
    bson::to_bson(value).map_err(|e| GroveError::Transport(format!("value to BSON failed: {e}")))
}

fn from_document(doc: Document) -> Result<Record> {
    bson::from_document(doc)
        .map_err(|e| GroveError::Transport(format!("BSON to record failed: {e}")))
}

fn update_document(update: &UpdateDoc) -> Result<Document> {
    Ok(match update {
        UpdateDoc::Set(fields) => doc! { "$set": to_document(fields)? },
        UpdateDoc::Push { field, value } => doc! { "$push": { field: to_bson(value)? } },
        UpdateDoc::Pull { field, value } => doc! { "$pull": { field: to_bson(value)? } },
    })
}

#[async_trait]
impl Repository for MongoRepository {
    async fn create(&self, table: &str, mut record: Record) -> Result<String> {
        let id = match record.get("_id").and_then(Value::as_str) {
            Some(id) => id.to_string(),
            None => {
                let id = Uuid::new_v4().to_string();
                record.insert("_id".to_string(), Value::String(id.clone()));
                id
            }
        };

        self.collection(table)
            .insert_one(to_document(&record)?)
            .await
            .map_err(|e| GroveError::Transport(format!("insert into {table} failed: {e}")))?;
        Ok(id)
    }

    async fn read_one(&self, table: &str, filter: Record) -> Result<Record> {
        let found = self
            .collection(table)
            .find_one(to_document(&filter)?)
            .await
            .map_err(|e| GroveError::Transport(format!("find in {table} failed: {e}")))?;

        match found {
            Some(doc) => from_document(doc),
            None => Err(GroveError::NotFound(format!("record in table {table}"))),
        }
    }

    async fn read_all(&self, table: &str, filter: Record) -> Result<Vec<Record>> {
        let mut cursor = self
            .collection(table)
            .find(to_document(&filter)?)
            .await
            .map_err(|e| GroveError::Transport(format!("find in {table} failed: {e}")))?;

        let mut records = Vec::new();
        while let Some(next) = cursor.next().await {
            match next {
                Ok(doc) => records.push(from_document(doc)?),
                Err(e) => error!("Error reading document from {}: {}", table, e),
            }
        }
        Ok(records)
    }

    async fn update(&self, table: &str, filter: Record, update: UpdateDoc) -> Result<()> {
        self.collection(table)
            .update_one(to_document(&filter)?, update_document(&update)?)
            .await
            .map_err(|e| GroveError::Transport(format!("update in {table} failed: {e}")))?;
        Ok(())
    }

    async fn delete(&self, table: &str, filter: Record) -> Result<()> {
        self.collection(table)
            .delete_many(to_document(&filter)?)
            .await
            .map_err(|e| GroveError::Transport(format!("delete in {table} failed: {e}")))?;
        Ok(())
    }

    async fn count(&self, table: &str, filter: Option<Record>) -> Result<u64> {
        let filter = match filter {
            Some(f) => to_document(&f)?,
            None => Document::new(),
        };
        self.collection(table)
            .count_documents(filter)
            .await
            .map_err(|e| GroveError::Transport(format!("count in {table} failed: {e}")))
    }
}
