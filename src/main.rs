use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use heatlink::cache::{RedisSharedCache, SharedCache};
use heatlink::config::EngineConfig;
use heatlink::emit::LogEmitter;
use heatlink::engine::{FetchEngine, GetNewsOptions};
use heatlink::models::SourceDescriptor;
use heatlink::proxy::ProxySpec;
use heatlink::stats::NullStatsSink;
use heatlink::utils::SystemClock;

#[derive(Parser)]
#[command(
    name = "heatlink",
    version,
    about = "Trending-news source fetch engine with adaptive scheduling and cache protection",
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Path to the source descriptor file (JSON array of descriptors)
    #[arg(long, global = true, default_value = "sources.json")]
    sources: PathBuf,

    /// Path to an optional proxy list file (JSON array of proxy specs)
    #[arg(long, global = true)]
    proxies: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the engine with the background scheduler until interrupted
    Run,

    /// Fetch one source and print its items as JSON
    Fetch {
        /// Source id (any synonym form)
        source_id: String,

        /// Force a live fetch even when the cache is valid
        #[arg(short, long)]
        force: bool,
    },

    /// List the registered source descriptors
    Sources,
}

fn init_tracing(verbose: bool) {
    let default_filter = if verbose { "heatlink=debug,info" } else { "heatlink=info,warn" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn load_descriptors(path: &PathBuf) -> Result<Vec<SourceDescriptor>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read source file: {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("failed to parse source file: {}", path.display()))
}

fn load_proxies(path: &PathBuf) -> Result<Vec<ProxySpec>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read proxy file: {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("failed to parse proxy file: {}", path.display()))
}

async fn build_engine(cli: &Cli, config: EngineConfig) -> Result<Arc<FetchEngine>> {
    let shared: Option<Arc<dyn SharedCache>> = match &config.shared_cache_url {
        Some(url) => RedisSharedCache::try_connect(url)
            .await
            .map(|c| Arc::new(c) as Arc<dyn SharedCache>),
        None => None,
    };

    let engine = FetchEngine::new(
        config,
        Arc::new(SystemClock::new()),
        Arc::new(NullStatsSink),
        Arc::new(LogEmitter),
        shared,
        None,
    );

    for descriptor in load_descriptors(&cli.sources)? {
        let source_id = descriptor.source_id.clone();
        match engine.register_descriptor(descriptor) {
            Ok(()) => {}
            // Colliding canonical ids mean the source file is corrupt; that
            // is the one startup condition worth dying for.
            Err(e @ heatlink::Error::Registry(_)) => {
                anyhow::bail!("registry corrupt: {e}");
            }
            Err(e) => {
                tracing::error!(source_id = %source_id, error = %e, "Skipping source");
            }
        }
    }
    if engine.list_sources().is_empty() {
        anyhow::bail!("no sources registered, nothing to do");
    }

    if let Some(path) = &cli.proxies {
        engine.proxies().replace_all(load_proxies(path)?);
    }

    Ok(engine)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = EngineConfig::from_env()?;

    match &cli.command {
        Commands::Run => {
            let engine = build_engine(&cli, config).await?;
            tracing::info!(sources = engine.list_sources().len(), "Engine running");

            let handles = engine.spawn_background();
            tokio::signal::ctrl_c()
                .await
                .context("failed to listen for ctrl-c")?;

            engine.shutdown().await;
            for handle in handles {
                handle.abort();
            }
        }

        Commands::Fetch { source_id, force } => {
            let engine = build_engine(&cli, config).await?;
            let (items, meta) = engine
                .get_news(
                    source_id,
                    GetNewsOptions {
                        force_refresh: *force,
                        ..Default::default()
                    },
                )
                .await
                .with_context(|| format!("fetch failed for '{source_id}'"))?;

            tracing::info!(
                count = items.len(),
                cache_hit = meta.cache_hit,
                protection_applied = meta.protection_applied,
                "Fetch complete"
            );
            println!("{}", serde_json::to_string_pretty(&items)?);
            engine.shutdown().await;
        }

        Commands::Sources => {
            let engine = build_engine(&cli, config).await?;
            for descriptor in engine.list_sources() {
                println!(
                    "{:<24} {:<5} every {:>5}s  ttl {:>4}s  priority {:>3}  {}",
                    descriptor.source_id,
                    descriptor.source_type.as_str(),
                    descriptor.update_interval_ms / 1000,
                    descriptor.cache_ttl_ms / 1000,
                    descriptor.priority,
                    descriptor.name,
                );
            }
        }
    }

    Ok(())
}
