use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use zoekt_indexserver::{admin, cleanup, config, shards};
use zoekt_indexserver::{load_config, HttpCatalog, Opts, Server};

#[tokio::main]
async fn main() -> Result<()> {
    let opts = Opts::parse();

    let default_level = if opts.debug || config::src_log_level_is_debug() {
        "debug"
    } else {
        "info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cfg = load_config(opts)?;

    std::fs::create_dir_all(&cfg.index_dir)
        .with_context(|| format!("create index dir {}", cfg.index_dir.display()))?;
    shards::setup_scratch_dir(&cfg.index_dir)?;
    cleanup::remove_incomplete_shards(&cfg.index_dir);

    let catalog = Arc::new(HttpCatalog::new(cfg.catalog_url.clone()));
    let server = Arc::new(Server::new(cfg.clone(), catalog));

    if let Some(addr) = cfg.listen {
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .with_context(|| format!("bind {addr}"))?;
        tracing::info!(%addr, "serving admin surface");
        let srv = server.clone();
        tokio::spawn(async move {
            if let Err(err) = admin::serve(listener, srv).await {
                tracing::error!(error = %err, "admin surface failed");
            }
        });
    }

    tracing::info!(
        index_dir = %cfg.index_dir.display(),
        catalog = %cfg.catalog_url,
        interval = ?cfg.interval,
        parallelism = cfg.parallelism,
        shard_merging = cfg.shard_merging,
        "starting index supervisor"
    );
    server.run().await
}
