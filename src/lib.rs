//! Grove - scene runtime for resource nodes and callable components
//!
//! Grove manages a tree of schema-validated resource nodes and a catalog of
//! callable components, binds components to nodes, and dispatches
//! invocations through a bounded worker pool.
//!
//! ## Subsystems
//!
//! - **Schema registry**: recursive type definitions with inheritance and
//!   cross-schema references, validated against dynamic JSON records
//! - **Node store / component store**: two-tier caches over a document
//!   repository with LRU-by-last-access eviction and dirty write-back
//! - **Worker pool**: bounded elastic pool with cancellable tasks, submit
//!   timeouts and idle worker reaping
//! - **Scene**: the facade composing the above, plus node templates and
//!   synchronous component invocation

pub mod component;
pub mod config;
pub mod repo;
pub mod scene;
pub mod schema;
pub mod store;
pub mod types;
pub mod worker;

pub use config::Args;
pub use scene::{Scene, SceneSettings, SyncTask, TaskKind};
pub use types::{GroveError, Result};
