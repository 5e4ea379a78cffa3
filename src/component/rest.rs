//! RESTful component: a persisted HTTP endpoint description that can be
//! executed against a node.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

use super::Component;
use crate::repo::Record;
use crate::store::{access_tick, Cached, Node, NO_SLOT};
use crate::types::{GroveError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HttpMethod {
    #[serde(rename = "GET")]
    Get,
    #[serde(rename = "POST")]
    Post,
    #[serde(rename = "PUT")]
    Put,
    #[serde(rename = "DELETE")]
    Delete,
    #[serde(rename = "PATCH")]
    Patch,
}

impl HttpMethod {
    fn as_reqwest(self) -> reqwest::Method {
        match self {
            HttpMethod::Get => reqwest::Method::GET,
            HttpMethod::Post => reqwest::Method::POST,
            HttpMethod::Put => reqwest::Method::PUT,
            HttpMethod::Delete => reqwest::Method::DELETE,
            HttpMethod::Patch => reqwest::Method::PATCH,
        }
    }

    /// GET and DELETE carry parameters in the query string; the rest carry
    /// a JSON body.
    fn uses_query(self) -> bool {
        matches!(self, HttpMethod::Get | HttpMethod::Delete)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamKind {
    Simple,
    Object,
    Array,
}

fn valid_param_type(name: &str) -> bool {
    matches!(
        name,
        "string" | "int" | "float64" | "bool" | "object" | "array"
    )
}

/// Description of one request or response parameter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParamSpec {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Value type; inferred from `kind` when omitted.
    #[serde(rename = "type", default)]
    pub value_type: String,

    /// Shape class; inferred from `value_type` when omitted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<ParamKind>,

    #[serde(default)]
    pub required: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,

    /// Nested parameters, only for object and array kinds.
    #[serde(rename = "nestedParams", default, skip_serializing_if = "Vec::is_empty")]
    pub nested_params: Vec<ParamSpec>,

    #[serde(rename = "isPathParam", default, skip_serializing_if = "std::ops::Not::not")]
    pub is_path_param: bool,
}

/// One acceptable response status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseStatus {
    pub code: u16,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Response content type; defaults to `application/json`.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub schema: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub params: Vec<ParamSpec>,
}

/// Runtime-only state, never persisted.
struct Runtime {
    call_time: AtomicU64,
    heap_slot: AtomicUsize,
    client: reqwest::Client,
}

impl Default for Runtime {
    fn default() -> Self {
        Self {
            call_time: AtomicU64::new(0),
            heap_slot: AtomicUsize::new(NO_SLOT),
            client: reqwest::Client::new(),
        }
    }
}

/// A RESTful callable component, in its persisted record shape.
#[derive(Serialize, Deserialize)]
pub struct RestComponent {
    #[serde(rename = "_id", default)]
    id: String,

    name: String,

    api: String,

    method: HttpMethod,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    description: Option<String>,

    #[serde(rename = "reqSchema", default, skip_serializing_if = "String::is_empty")]
    req_schema: String,

    #[serde(rename = "reqParams", default, skip_serializing_if = "Vec::is_empty")]
    req_params: Vec<ParamSpec>,

    #[serde(rename = "resStatuses", default, skip_serializing_if = "Vec::is_empty")]
    res_statuses: Vec<ResponseStatus>,

    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    deprecated: bool,

    #[serde(skip)]
    runtime: Runtime,
}

impl RestComponent {
    /// Validate a provided component schema, fill defaults, assign an id,
    /// and return the record to persist.
    pub fn build_schema(schema: Record) -> Result<Record> {
        let mut component: RestComponent = serde_json::from_value(Value::Object(schema))
            .map_err(|e| {
                GroveError::validation(format!("failed to parse restful component schema: {e}"))
            })?;

        component.id = format!("RESTFUL-{}", Uuid::new_v4());

        if component.name.is_empty() || component.api.is_empty() {
            return Err(GroveError::validation(
                "missing required fields: name or api",
            ));
        }

        for param in &mut component.req_params {
            normalize_param(param)?;
        }
        for status in &mut component.res_statuses {
            for param in &mut status.params {
                normalize_param(param)?;
            }
            if status.schema.is_empty() {
                status.schema = "application/json".to_string();
            }
        }

        match serde_json::to_value(&component) {
            Ok(Value::Object(record)) => Ok(record),
            Ok(_) => Err(GroveError::Invariant(
                "component schema did not serialize to an object".to_string(),
            )),
            Err(e) => Err(GroveError::Invariant(format!(
                "failed to serialize component schema: {e}"
            ))),
        }
    }

    /// Instantiate a component from its persisted record.
    pub fn from_record(record: Record, client: reqwest::Client) -> Result<Arc<Self>> {
        let mut component: RestComponent = serde_json::from_value(Value::Object(record))
            .map_err(|e| {
                GroveError::Invariant(format!("failed to instantiate restful component: {e}"))
            })?;
        component.runtime.client = client;
        component
            .runtime
            .call_time
            .store(access_tick(), Ordering::Relaxed);
        Ok(Arc::new(component))
    }

    pub fn method(&self) -> HttpMethod {
        self.method
    }

    pub fn api(&self) -> &str {
        &self.api
    }

    fn validate_params(&self, params: &Record) -> Result<()> {
        for spec in &self.req_params {
            validate_param_value(spec, params.get(&spec.name), &spec.name)?;
        }
        for provided in params.keys() {
            if !self.req_params.iter().any(|spec| spec.name == *provided) {
                return Err(GroveError::validation(format!(
                    "unknown parameter '{provided}' provided"
                )));
            }
        }
        Ok(())
    }

    fn build_url(&self, params: &Record) -> Result<String> {
        let mut url = self.api.clone();
        for spec in self.req_params.iter().filter(|s| s.is_path_param) {
            let value = params.get(&spec.name).or(spec.default.as_ref());
            let text = match value {
                Some(Value::String(s)) => s.clone(),
                Some(Value::Number(n)) => n.to_string(),
                Some(other) => {
                    return Err(GroveError::validation(format!(
                        "path parameter '{}' must be a string or number, got {other}",
                        spec.name
                    )))
                }
                None if spec.required => {
                    return Err(GroveError::validation(format!(
                        "missing required path parameter '{}'",
                        spec.name
                    )))
                }
                None => String::new(),
            };
            url = url.replacen(
                &format!("{{{}}}", spec.name),
                urlencoding::encode(&text).as_ref(),
                1,
            );
        }
        Ok(url)
    }

    fn query_pairs(&self, params: &Record) -> Result<Vec<(String, String)>> {
        let mut pairs = Vec::new();
        for spec in self.req_params.iter().filter(|s| !s.is_path_param) {
            let Some(value) = params.get(&spec.name) else {
                continue;
            };
            match value {
                Value::String(s) => pairs.push((spec.name.clone(), s.clone())),
                Value::Number(n) => pairs.push((spec.name.clone(), n.to_string())),
                Value::Bool(b) => pairs.push((spec.name.clone(), b.to_string())),
                Value::Array(items) => {
                    for item in items {
                        let text = match item {
                            Value::String(s) => s.clone(),
                            other => other.to_string(),
                        };
                        pairs.push((spec.name.clone(), text));
                    }
                }
                other => {
                    return Err(GroveError::validation(format!(
                        "unsupported query parameter type for '{}': {other}",
                        spec.name
                    )))
                }
            }
        }
        Ok(pairs)
    }

    fn body_params(&self, params: &Record) -> Record {
        params
            .iter()
            .filter(|(name, _)| {
                !self
                    .req_params
                    .iter()
                    .any(|spec| spec.is_path_param && spec.name == **name)
            })
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect()
    }
}

impl Cached for RestComponent {
    fn cache_id(&self) -> &str {
        &self.id
    }

    fn call_time(&self) -> u64 {
        self.runtime.call_time.load(Ordering::Relaxed)
    }

    fn touch(&self) {
        self.runtime.call_time.store(access_tick(), Ordering::Relaxed);
    }

    fn heap_slot(&self) -> &AtomicUsize {
        &self.runtime.heap_slot
    }
}

#[async_trait]
impl Component for RestComponent {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn serialize(&self) -> Record {
        match serde_json::to_value(self) {
            Ok(Value::Object(record)) => record,
            _ => Record::new(),
        }
    }

    async fn execute(
        &self,
        node: Option<&Node>,
        mut params: Record,
        headers: &HashMap<String, String>,
    ) -> Result<Record> {
        self.touch();

        // Fill missing parameters from node attributes.
        if let Some(node) = node {
            for spec in &self.req_params {
                if !params.contains_key(&spec.name) {
                    if let Some(value) = node.attribute(&spec.name) {
                        params.insert(spec.name.clone(), value);
                    }
                }
            }
        }

        self.validate_params(&params)?;

        let url = self.build_url(&params)?;
        let mut request = self
            .runtime
            .client
            .request(self.method.as_reqwest(), &url);

        if self.method.uses_query() {
            let pairs = self.query_pairs(&params)?;
            if !pairs.is_empty() {
                request = request.query(&pairs);
            }
        } else {
            let body = self.body_params(&params);
            if !body.is_empty() {
                request = request.json(&body);
            }
            if !self.req_schema.is_empty() {
                request = request.header(reqwest::header::CONTENT_TYPE, self.req_schema.as_str());
            }
        }

        for (key, value) in headers {
            request = request.header(key.as_str(), value.as_str());
        }

        debug!(component = %self.name, method = ?self.method, url = %url, "executing restful component");

        let response = request
            .send()
            .await
            .map_err(|e| GroveError::Transport(format!("request to {url} failed: {e}")))?;
        let status = response.status().as_u16();
        let body: Value = response
            .json()
            .await
            .map_err(|e| GroveError::Transport(format!("failed to decode response: {e}")))?;
        let result = body
            .as_object()
            .cloned()
            .ok_or_else(|| GroveError::Transport("response is not a JSON object".to_string()))?;

        if self.res_statuses.iter().any(|s| s.code == status) {
            Ok(result)
        } else {
            Err(GroveError::Transport(format!(
                "unexpected status code: {status}"
            )))
        }
    }
}

/// Infer missing type/kind, enforce their consistency, and recurse into
/// nested parameters.
fn normalize_param(spec: &mut ParamSpec) -> Result<()> {
    if spec.value_type.is_empty() {
        spec.value_type = match spec.kind {
            Some(ParamKind::Object) => "object",
            Some(ParamKind::Array) => "array",
            Some(ParamKind::Simple) | None => "string",
        }
        .to_string();
    } else if !valid_param_type(&spec.value_type) {
        return Err(GroveError::validation(format!(
            "invalid type '{}' for parameter '{}'",
            spec.value_type, spec.name
        )));
    }

    if spec.kind.is_none() {
        spec.kind = Some(match spec.value_type.as_str() {
            "object" => ParamKind::Object,
            "array" => ParamKind::Array,
            _ => ParamKind::Simple,
        });
    }
    let kind = spec.kind.expect("kind inferred above");

    let consistent = match spec.value_type.as_str() {
        "object" => kind == ParamKind::Object,
        "array" => kind == ParamKind::Array,
        _ => kind == ParamKind::Simple,
    };
    if !consistent {
        return Err(GroveError::validation(format!(
            "type '{}' and kind '{kind:?}' are inconsistent for parameter '{}'",
            spec.value_type, spec.name
        )));
    }

    match kind {
        ParamKind::Object | ParamKind::Array => {
            if spec.nested_params.is_empty() {
                return Err(GroveError::validation(format!(
                    "parameter '{}' with kind '{kind:?}' must have at least one nested parameter",
                    spec.name
                )));
            }
            for nested in &mut spec.nested_params {
                normalize_param(nested)?;
            }
        }
        ParamKind::Simple => {
            if !spec.nested_params.is_empty() {
                return Err(GroveError::validation(format!(
                    "simple parameter '{}' should not have nested parameters",
                    spec.name
                )));
            }
        }
    }

    Ok(())
}

fn validate_param_value(spec: &ParamSpec, value: Option<&Value>, path: &str) -> Result<()> {
    // A required parameter must be provided even when it carries a default.
    let Some(value) = value else {
        if spec.required {
            return Err(GroveError::validation(format!(
                "missing required parameter at '{path}'"
            )));
        }
        return Ok(());
    };

    match spec.value_type.as_str() {
        "string" => {
            if !value.is_string() {
                return Err(GroveError::validation(format!(
                    "parameter '{path}' must be a string"
                )));
            }
        }
        "int" => {
            let whole = value.as_i64().is_some()
                || value.as_u64().is_some()
                || value.as_f64().is_some_and(|f| f.fract() == 0.0);
            if !whole {
                return Err(GroveError::validation(format!(
                    "parameter '{path}' must be an integer"
                )));
            }
        }
        "float64" => {
            if value.as_f64().is_none() {
                return Err(GroveError::validation(format!(
                    "parameter '{path}' must be a float64"
                )));
            }
        }
        "bool" => {
            if !value.is_boolean() {
                return Err(GroveError::validation(format!(
                    "parameter '{path}' must be a bool"
                )));
            }
        }
        "object" => {
            let object = value.as_object().ok_or_else(|| {
                GroveError::validation(format!("parameter '{path}' must be an object"))
            })?;
            for nested in &spec.nested_params {
                if let Some(nested_value) = object.get(&nested.name) {
                    let nested_path = format!("{path}.{}", nested.name);
                    validate_param_value(nested, Some(nested_value), &nested_path)?;
                }
            }
        }
        "array" => {
            let items = value.as_array().ok_or_else(|| {
                GroveError::validation(format!("parameter '{path}' must be an array"))
            })?;
            if spec.nested_params.len() != 1 {
                return Err(GroveError::validation(format!(
                    "array parameter '{path}' must have exactly one nested parameter definition"
                )));
            }
            let nested = &spec.nested_params[0];
            for (index, item) in items.iter().enumerate() {
                let nested_path = format!("{path}[{index}]");
                validate_param_value(nested, Some(item), &nested_path)?;
            }
        }
        other => {
            return Err(GroveError::validation(format!(
                "unsupported parameter type '{other}' for '{path}'"
            )));
        }
    }
    Ok(())
}
