//! Configuration for Grove.
//!
//! CLI arguments and environment variable handling using clap.

use clap::Parser;
use std::path::PathBuf;

/// Grove - scene runtime for resource nodes and callable components
#[derive(Parser, Debug, Clone)]
#[command(name = "grove")]
#[command(about = "Scene runtime: cached node tree, component catalog, worker pool")]
pub struct Args {
    /// Scene name for this runtime instance
    #[arg(long, env = "SCENE_NAME", default_value = "grove")]
    pub scene_name: String,

    /// MongoDB connection URI
    #[arg(long, env = "MONGODB_URI", default_value = "mongodb://localhost:27017")]
    pub mongodb_uri: String,

    /// MongoDB database name
    #[arg(long, env = "MONGODB_DB", default_value = "grove")]
    pub mongodb_db: String,

    /// Repository timeout in seconds (server selection and connect)
    #[arg(long, env = "REPO_TIMEOUT_SECS", default_value = "3")]
    pub repo_timeout_secs: u64,

    /// Path to a JSON document of node schemas to register at startup.
    /// The document shape is {"schemas": [{...}, ...]}
    #[arg(long, env = "SCHEMA_PATH")]
    pub schema_path: Option<PathBuf>,

    /// Soft capacity of the node and component caches
    #[arg(long, env = "CACHE_CAPACITY", default_value = "1024")]
    pub cache_capacity: usize,

    /// Number of workers spawned at startup
    #[arg(long, env = "MIN_WORKERS", default_value = "4")]
    pub min_workers: usize,

    /// Ceiling on live workers
    #[arg(long, env = "MAX_WORKERS", default_value = "16")]
    pub max_workers: usize,

    /// Capacity of the task queue
    #[arg(long, env = "QUEUE_SIZE", default_value = "256")]
    pub queue_size: usize,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

impl Args {
    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.cache_capacity == 0 {
            return Err("CACHE_CAPACITY must be at least 1".to_string());
        }

        if self.max_workers == 0 {
            return Err("MAX_WORKERS must be at least 1".to_string());
        }

        if self.min_workers > self.max_workers {
            return Err("MIN_WORKERS must be less than or equal to MAX_WORKERS".to_string());
        }

        if self.queue_size == 0 {
            return Err("QUEUE_SIZE must be at least 1".to_string());
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_args() -> Args {
        Args::parse_from(["grove"])
    }

    #[test]
    fn test_defaults_validate() {
        assert!(base_args().validate().is_ok());
    }

    #[test]
    fn test_worker_floor_above_ceiling_rejected() {
        let mut args = base_args();
        args.min_workers = 8;
        args.max_workers = 2;
        assert!(args.validate().is_err());
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let mut args = base_args();
        args.cache_capacity = 0;
        assert!(args.validate().is_err());
    }
}
