//! Choir Image Cache CLI
//!
//! Operator tool over a filesystem-backed cache directory: fetch through the
//! tiers, warm the cache, invalidate entries and inspect statistics.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use tracing::{info, Level};
use tracing_subscriber::filter::Directive;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use choir_image_cache::cache::placeholder::is_placeholder;
use choir_image_cache::metrics::render_prometheus;
use choir_image_cache::{
    CacheConfig, CacheKey, DurableStore, FsStore, HttpOrigin, ImageCache, ResourceType,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Tiered image cache for piece scores, collection covers and attachments
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// YAML configuration file
    #[arg(long, env = "IMAGE_CACHE_CONFIG")]
    config: Option<PathBuf>,

    /// Backend API base URL (overrides the config file)
    #[arg(long, env = "IMAGE_CACHE_API_URL")]
    api_url: Option<String>,

    /// Persistent tier directory
    #[arg(long, env = "IMAGE_CACHE_DIR", default_value = ".image-cache")]
    cache_dir: PathBuf,

    /// Run without the persistent tier
    #[arg(long, env = "IMAGE_CACHE_MEMORY_ONLY")]
    memory_only: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Resolve one image through the tiers
    Get {
        /// piece, collection or post
        resource_type: ResourceType,
        id: u64,
        /// Write decoded image bytes here instead of printing the data URL
        #[arg(long, short)]
        output: Option<PathBuf>,
    },
    /// Warm the cache, e.g. `preload piece:1 collection:7`
    Preload {
        #[arg(required = true)]
        items: Vec<CacheKey>,
        #[arg(long)]
        max_concurrent: Option<usize>,
    },
    /// Remove one key from every tier
    Invalidate { key: String },
    /// Remove every entry of a resource type
    InvalidateType { resource_type: ResourceType },
    /// Empty every tier
    Clear,
    /// Print cache statistics
    Stats {
        #[arg(long, value_enum, default_value_t = StatsFormat::Json)]
        format: StatsFormat,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum StatsFormat {
    Json,
    Prometheus,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(&args);

    let mut config = match &args.config {
        Some(path) => CacheConfig::from_yaml_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => CacheConfig::default(),
    };
    if let Some(url) = &args.api_url {
        config.origin.base_url = url.clone();
    }

    info!("Starting image cache");
    info!("  Origin: {}", config.origin.base_url);
    info!("  Memory only: {}", args.memory_only);

    let origin = Arc::new(HttpOrigin::new(config.origin.clone())?);
    let store: Option<Arc<dyn DurableStore>> = if args.memory_only {
        None
    } else {
        let store = FsStore::open(&args.cache_dir)
            .await
            .with_context(|| format!("opening cache directory {}", args.cache_dir.display()))?;
        Some(Arc::new(store))
    };
    let cache = ImageCache::new(config, origin, store);

    match args.command {
        Command::Get {
            resource_type,
            id,
            output,
        } => {
            let payload = cache.get(resource_type, id).await;
            if is_placeholder(&payload) {
                info!("{}:{} unavailable, placeholder served", resource_type, id);
            }
            match output {
                Some(path) => {
                    let bytes = payload.decode()?;
                    tokio::fs::write(&path, &bytes)
                        .await
                        .with_context(|| format!("writing {}", path.display()))?;
                    info!("wrote {} bytes to {}", bytes.len(), path.display());
                }
                None => println!("{}", payload.as_text().unwrap_or_default()),
            }
        }
        Command::Preload {
            items,
            max_concurrent,
        } => {
            let items = items.into_iter().map(|k| (k.resource_type(), k.id()));
            let settled = cache.preload(items, max_concurrent).await;
            let stats = cache.stats().await;
            println!(
                "preloaded {} items ({} origin failures)",
                settled, stats.errors.network
            );
        }
        Command::Invalidate { key } => cache.invalidate(&key).await,
        Command::InvalidateType { resource_type } => cache.invalidate_by_type(resource_type).await,
        Command::Clear => cache.clear_all().await,
        Command::Stats { format } => {
            let snapshot = cache.stats().await;
            match format {
                StatsFormat::Json => println!("{}", serde_json::to_string_pretty(&snapshot)?),
                StatsFormat::Prometheus => print!("{}", render_prometheus(&snapshot)?),
            }
        }
    }

    Ok(())
}

// =============================================================================
// Logging
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = ["hyper=warn", "reqwest=warn", "rustls=warn"]
        .iter()
        .filter_map(|d| d.parse::<Directive>().ok())
        .fold(
            EnvFilter::from_default_env().add_directive(level.into()),
            |filter, directive| filter.add_directive(directive),
        );

    // stdout carries command output
    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .init();
    }
}
