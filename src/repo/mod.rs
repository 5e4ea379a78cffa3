//! Repository contract the runtime consumes from its storage collaborator.
//!
//! Records are dynamic JSON documents keyed by `_id`. Filters are equality
//! mappings. Updates are limited to `$set`/`$push`/`$pull` on top-level keys,
//! which is all the runtime ever issues.

mod memory;
mod mongo;

pub use memory::MemoryRepository;
pub use mongo::MongoRepository;

use async_trait::async_trait;
use serde_json::Value;

use crate::types::Result;

/// Dynamic document record: a JSON object keyed by field name.
pub type Record = serde_json::Map<String, Value>;

/// Tables the runtime writes to.
pub const TABLE_NODE: &str = "node";
pub const TABLE_NODE_SCHEMA: &str = "nodeschema";
pub const TABLE_COMPONENT_SCHEMA: &str = "composchema";
pub const TABLE_NODE_TEMPLATE: &str = "nodetemplate";

/// Update document applied to records matching a filter.
#[derive(Debug, Clone)]
pub enum UpdateDoc {
    /// Replace the listed top-level keys.
    Set(Record),
    /// Append a value to a top-level array field, creating it if absent.
    Push { field: String, value: Value },
    /// Remove all occurrences of a value from a top-level array field.
    Pull { field: String, value: Value },
}

/// Document-store contract: filter-based CRUD plus count.
#[async_trait]
pub trait Repository: Send + Sync {
    /// Insert a record. The id is taken from `record["_id"]` when present,
    /// generated otherwise, and echoed back either way.
    async fn create(&self, table: &str, record: Record) -> Result<String>;

    /// Read the first record matching the equality filter.
    async fn read_one(&self, table: &str, filter: Record) -> Result<Record>;

    /// Read every record matching the equality filter. May be empty.
    async fn read_all(&self, table: &str, filter: Record) -> Result<Vec<Record>>;

    /// Apply an update document to the first matching record. A filter that
    /// matches nothing is not an error.
    async fn update(&self, table: &str, filter: Record, update: UpdateDoc) -> Result<()>;

    /// Delete every matching record. Idempotent.
    async fn delete(&self, table: &str, filter: Record) -> Result<()>;

    /// Count matching records; `None` counts the whole table.
    async fn count(&self, table: &str, filter: Option<Record>) -> Result<u64>;
}

/// Equality filter on the primary key.
pub fn id_filter(id: &str) -> Record {
    let mut filter = Record::new();
    filter.insert("_id".to_string(), Value::String(id.to_string()));
    filter
}

/// Equality filter on a single field.
pub fn field_filter(field: &str, value: impl Into<Value>) -> Record {
    let mut filter = Record::new();
    filter.insert(field.to_string(), value.into());
    filter
}
