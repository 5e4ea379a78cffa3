//! Callable components bound to nodes.

mod rest;

pub use rest::{HttpMethod, ParamKind, ParamSpec, ResponseStatus, RestComponent};

use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;

use crate::repo::Record;
use crate::store::{Cached, Node};
use crate::types::{GroveError, Result};

/// Component taxonomy. The kind is the id prefix of every component of that
/// kind. Only `RESTFUL` is instantiable today; the others are declared so
/// their ids parse and report a clean error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComponentKind {
    Restful,
    Grpc,
    Local,
    Runtime,
}

impl ComponentKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ComponentKind::Restful => "RESTFUL",
            ComponentKind::Grpc => "GRPC",
            ComponentKind::Local => "LOCAL",
            ComponentKind::Runtime => "RUNTIME",
        }
    }

    pub fn from_prefix(prefix: &str) -> Result<Self> {
        match prefix {
            "RESTFUL" => Ok(ComponentKind::Restful),
            "GRPC" => Ok(ComponentKind::Grpc),
            "LOCAL" => Ok(ComponentKind::Local),
            "RUNTIME" => Ok(ComponentKind::Runtime),
            other => Err(GroveError::Invariant(format!(
                "unknown component kind {other}"
            ))),
        }
    }
}

impl fmt::Display for ComponentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A callable component.
///
/// `execute` receives the target node (when invoked against one) so missing
/// parameters can be filled from node attributes, and returns a result
/// mapping that callers may write back into the node.
#[async_trait]
pub trait Component: Cached {
    fn id(&self) -> &str;

    fn name(&self) -> &str;

    /// Persisted record shape of this component.
    fn serialize(&self) -> Record;

    async fn execute(
        &self,
        node: Option<&Node>,
        params: Record,
        headers: &HashMap<String, String>,
    ) -> Result<Record>;
}

impl fmt::Debug for dyn Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Component")
            .field("id", &self.id())
            .field("name", &self.name())
            .finish()
    }
}
