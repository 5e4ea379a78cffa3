//! Schema registry: name-keyed cache over the repository.

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use super::{is_scalar_kind, is_structured_kind, parse_fields, FieldDefinition, SchemaDefinition};
use crate::repo::{field_filter, id_filter, Record, Repository};
use crate::types::{GroveError, Result};

/// Registry of schema definitions for one table (`nodeschema` or
/// `composchema`). Definitions are registered once and never mutated; the
/// cache lives for the whole process.
pub struct SchemaRegistry {
    repo: Arc<dyn Repository>,
    table: &'static str,
    cache: RwLock<HashMap<String, Arc<SchemaDefinition>>>,
}

impl SchemaRegistry {
    pub fn new(repo: Arc<dyn Repository>, table: &'static str) -> Self {
        Self {
            repo,
            table,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Register a schema described by `{name, extends?, fields}`.
    ///
    /// The raw `fields` mapping is persisted as provided; the parsed and
    /// inheritance-merged definition goes to the cache only after the
    /// repository write succeeds, so a failed registration leaves no state.
    pub async fn register_schema(&self, info: &Record) -> Result<String> {
        if info.is_empty() {
            return Err(GroveError::validation("schema info cannot be empty"));
        }

        let name = match info.get("name").and_then(Value::as_str) {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => {
                return Err(GroveError::validation(
                    "schema name must be a non-empty string",
                ))
            }
        };

        if self.cache.read().await.contains_key(&name) {
            return Err(GroveError::AlreadyExists(format!("schema name {name}")));
        }
        let existing = self
            .repo
            .count(self.table, Some(field_filter("name", name.as_str())))
            .await?;
        if existing > 0 {
            return Err(GroveError::AlreadyExists(format!("schema name {name}")));
        }

        let extends = match info.get("extends") {
            None => None,
            Some(Value::String(ext)) if ext.is_empty() => None,
            Some(Value::String(ext)) => Some(ext.clone()),
            Some(_) => {
                return Err(GroveError::validation(
                    "extends of schema info must be a string",
                ))
            }
        };
        if let Some(ext) = &extends {
            if !self.has_schema(ext).await {
                return Err(GroveError::validation(format!(
                    "base schema {ext} does not exist"
                )));
            }
        }

        let raw_fields = info
            .get("fields")
            .and_then(Value::as_object)
            .ok_or_else(|| GroveError::validation("fields of schema info must be a mapping"))?;

        let mut fields = parse_fields(raw_fields)?;

        // Inheritance merge: own fields win on collision.
        if let Some(ext) = &extends {
            let base = self.load(ext, &mut Vec::new()).await?;
            for (field_name, def) in &base.fields {
                fields
                    .entry(field_name.clone())
                    .or_insert_with(|| def.clone());
            }
        }

        let id = Uuid::new_v4().to_string();
        let mut record = Record::new();
        record.insert("_id".to_string(), Value::String(id.clone()));
        record.insert("name".to_string(), Value::String(name.clone()));
        record.insert(
            "extends".to_string(),
            Value::String(extends.clone().unwrap_or_default()),
        );
        record.insert("fields".to_string(), Value::Object(raw_fields.clone()));
        self.repo.create(self.table, record).await?;

        let definition = Arc::new(SchemaDefinition {
            id: id.clone(),
            name: name.clone(),
            extends,
            fields,
        });
        self.cache.write().await.insert(name.clone(), definition);

        debug!(schema = %name, id = %id, table = self.table, "schema registered");
        Ok(id)
    }

    /// Register every schema in a `{"schemas": [...]}` document, in order.
    /// Bases must precede the schemas that extend them.
    pub async fn register_schemas_from_value(&self, doc: &Value) -> Result<Vec<String>> {
        let schemas = doc
            .get("schemas")
            .and_then(Value::as_array)
            .ok_or_else(|| {
                GroveError::validation("schemas document must contain a 'schemas' array")
            })?;

        let mut ids = Vec::with_capacity(schemas.len());
        for entry in schemas {
            let info = entry
                .as_object()
                .ok_or_else(|| GroveError::validation("schema entry must be a mapping"))?;
            ids.push(self.register_schema(info).await?);
        }
        Ok(ids)
    }

    /// Get a parsed schema by name, loading from the repository on a miss.
    pub async fn get_schema(&self, name: &str) -> Result<Arc<SchemaDefinition>> {
        self.load(name, &mut Vec::new()).await
    }

    /// Get a parsed schema by its repository id.
    pub async fn get_schema_by_id(&self, id: &str) -> Result<Arc<SchemaDefinition>> {
        let record = self.repo.read_one(self.table, id_filter(id)).await?;
        let name = record
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| GroveError::Invariant(format!("schema record {id} has no name")))?;
        self.get_schema(name).await
    }

    /// Resolve a schema name to its repository id.
    pub async fn schema_id(&self, name: &str) -> Result<String> {
        if let Some(cached) = self.cache.read().await.get(name) {
            return Ok(cached.id.clone());
        }
        let record = self
            .repo
            .read_one(self.table, field_filter("name", name))
            .await?;
        record
            .get("_id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| GroveError::Invariant(format!("schema record {name} has no _id")))
    }

    pub async fn has_schema(&self, name: &str) -> bool {
        self.get_schema(name).await.is_ok()
    }

    pub async fn has_schema_by_id(&self, id: &str) -> bool {
        self.repo.read_one(self.table, id_filter(id)).await.is_ok()
    }

    /// Validate a value mapping against the named schema.
    ///
    /// A missing required field fails; extra fields are ignored. Integer
    /// fields holding whole floats are rewritten to integers in place.
    pub async fn validate(&self, name: &str, data: &mut Record) -> Result<()> {
        let schema = self.get_schema(name).await?;
        self.validate_fields(&schema.fields, data).await
    }

    /// Validate a single value against one field of the named schema.
    pub async fn validate_field(
        &self,
        name: &str,
        field_name: &str,
        value: &mut Value,
    ) -> Result<()> {
        let schema = self.get_schema(name).await?;
        let def = schema.fields.get(field_name).ok_or_else(|| {
            GroveError::validation(format!(
                "schema {name} does not have a field named {field_name}"
            ))
        })?;
        self.validate_value(field_name, def, value).await
    }

    async fn validate_fields(
        &self,
        fields: &HashMap<String, FieldDefinition>,
        data: &mut Record,
    ) -> Result<()> {
        for (field_name, def) in fields {
            match data.get_mut(field_name) {
                None if def.required => {
                    return Err(GroveError::validation(format!(
                        "field {field_name} is required"
                    )));
                }
                None => continue,
                Some(value) => self.validate_value(field_name, def, value).await?,
            }
        }
        Ok(())
    }

    fn validate_value<'a>(
        &'a self,
        path: &'a str,
        def: &'a FieldDefinition,
        value: &'a mut Value,
    ) -> BoxFuture<'a, Result<()>> {
        async move {
            // A `ref`, or a kind that is neither scalar nor structured, names
            // another schema; the value is validated as an instance of it.
            let referenced = def.reference.as_deref().or_else(|| {
                (!is_scalar_kind(&def.kind) && !is_structured_kind(&def.kind))
                    .then_some(def.kind.as_str())
            });
            if let Some(ref_name) = referenced {
                let schema = self.get_schema(ref_name).await.map_err(|e| {
                    GroveError::validation(format!(
                        "failed to load schema {ref_name} referenced by {path}: {e}"
                    ))
                })?;
                let nested = value.as_object_mut().ok_or_else(|| {
                    GroveError::validation(format!("{path} must be an object"))
                })?;
                return self.validate_fields(&schema.fields, nested).await;
            }

            match def.kind.as_str() {
                "string" => {
                    if !value.is_string() {
                        return Err(GroveError::validation(format!("{path} must be a string")));
                    }
                }
                "bool" => {
                    if !value.is_boolean() {
                        return Err(GroveError::validation(format!("{path} must be a bool")));
                    }
                }
                "float64" => {
                    if value.as_f64().is_none() {
                        return Err(GroveError::validation(format!("{path} must be a float64")));
                    }
                }
                "int" => {
                    if value.as_i64().is_none() && value.as_u64().is_none() {
                        match value.as_f64() {
                            Some(f) if f.fract() == 0.0 => *value = Value::from(f as i64),
                            _ => {
                                return Err(GroveError::validation(format!(
                                    "{path} must be an integer"
                                )))
                            }
                        }
                    }
                }
                "object" => {
                    let nested = value.as_object_mut().ok_or_else(|| {
                        GroveError::validation(format!("{path} must be an object"))
                    })?;
                    if let Some(fields) = &def.fields {
                        self.validate_fields(fields, nested).await?;
                    }
                }
                "array" => {
                    let items = value.as_array_mut().ok_or_else(|| {
                        GroveError::validation(format!("{path} must be an array"))
                    })?;
                    let item_def = def.item.as_deref().ok_or_else(|| {
                        GroveError::validation(format!("{path} has no item definition"))
                    })?;
                    for (index, item) in items.iter_mut().enumerate() {
                        let item_path = format!("item {index} in {path}");
                        self.validate_value(&item_path, item_def, item).await?;
                    }
                }
                "map" => {
                    let entries = value.as_object_mut().ok_or_else(|| {
                        GroveError::validation(format!("{path} must be a map"))
                    })?;
                    if let Some(item_def) = def.item.as_deref() {
                        let keys: Vec<String> = entries.keys().cloned().collect();
                        for key in keys {
                            let entry_path = format!("{path}[{key}]");
                            if let Some(entry) = entries.get_mut(&key) {
                                self.validate_value(&entry_path, item_def, entry).await?;
                            }
                        }
                    }
                }
                other => {
                    return Err(GroveError::validation(format!(
                        "unsupported type {other} for {path}"
                    )));
                }
            }
            Ok(())
        }
        .boxed()
    }

    /// Load a schema by name, transitively closing over `extends`.
    ///
    /// `ancestors` carries the chain of names currently being loaded so an
    /// inheritance cycle in the stored records is reported instead of
    /// recursing forever.
    fn load<'a>(
        &'a self,
        name: &'a str,
        ancestors: &'a mut Vec<String>,
    ) -> BoxFuture<'a, Result<Arc<SchemaDefinition>>> {
        async move {
            if let Some(cached) = self.cache.read().await.get(name) {
                return Ok(cached.clone());
            }

            let record = self
                .repo
                .read_one(self.table, field_filter("name", name))
                .await
                .map_err(|e| match e {
                    GroveError::NotFound(_) => GroveError::NotFound(format!("schema {name}")),
                    other => other,
                })?;

            let id = record
                .get("_id")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let extends = record
                .get("extends")
                .and_then(Value::as_str)
                .filter(|ext| !ext.is_empty())
                .map(str::to_string);
            let raw_fields = record
                .get("fields")
                .and_then(Value::as_object)
                .ok_or_else(|| {
                    GroveError::Invariant(format!("schema record {name} has no fields mapping"))
                })?;

            let mut fields = parse_fields(raw_fields)?;

            if let Some(ext) = &extends {
                if ancestors.iter().any(|a| a == ext) || ext == name {
                    return Err(GroveError::validation(format!(
                        "inheritance cycle detected at schema {ext}"
                    )));
                }
                ancestors.push(name.to_string());
                let base = self.load(ext, ancestors).await?;
                for (field_name, def) in &base.fields {
                    fields
                        .entry(field_name.clone())
                        .or_insert_with(|| def.clone());
                }
            }

            let definition = Arc::new(SchemaDefinition {
                id,
                name: name.to_string(),
                extends,
                fields,
            });
            self.cache
                .write()
                .await
                .insert(name.to_string(), definition.clone());

            debug!(schema = %name, table = self.table, "schema loaded from repository");
            Ok(definition)
        }
        .boxed()
    }
}
