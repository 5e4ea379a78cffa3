//! Grove - scene runtime for resource nodes and callable components

use clap::Parser;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use grove::config::Args;
use grove::repo::MongoRepository;
use grove::scene::{Scene, SceneSettings};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file if present
    let _ = dotenvy::dotenv();

    let args = Args::parse();

    let log_level = args.log_level.clone();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("grove={log_level},info").into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if let Err(e) = args.validate() {
        error!("Configuration error: {}", e);
        std::process::exit(1);
    }

    info!("======================================");
    info!("  Grove - scene runtime");
    info!("======================================");
    info!("Scene: {}", args.scene_name);
    info!("MongoDB: {} / {}", args.mongodb_uri, args.mongodb_db);
    info!(
        "Workers: {}..{} (queue {})",
        args.min_workers, args.max_workers, args.queue_size
    );
    info!("Cache capacity: {}", args.cache_capacity);

    let repo = Arc::new(
        MongoRepository::connect(&args.mongodb_uri, &args.mongodb_db, args.repo_timeout_secs)
            .await?,
    );

    let scene = Scene::new(
        args.scene_name.clone(),
        repo,
        SceneSettings {
            min_workers: args.min_workers,
            max_workers: args.max_workers,
            queue_size: args.queue_size,
            cache_capacity: args.cache_capacity,
        },
    );

    // Schema bootstrap is a configuration concern: read the file here and
    // feed the parsed document to the registry.
    if let Some(path) = &args.schema_path {
        let text = std::fs::read_to_string(path)?;
        let doc: serde_json::Value = serde_json::from_str(&text)?;
        let ids = scene.register_node_schemas_from_value(&doc).await?;
        info!("Registered {} node schemas from {}", ids.len(), path.display());
    }

    info!("Scene '{}' ready", scene.name());

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    scene.shutdown().await;

    Ok(())
}
