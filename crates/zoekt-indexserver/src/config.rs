//! Configuration loading: defaults <- config file <- env vars <- CLI.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;

use crate::executor;

/// CLI options for the supervisor binary.
#[derive(Parser, Debug, Default)]
#[command(
    name = "dzr-indexserver",
    about = "Keeps a local directory of zoekt shards in sync with an upstream repository catalog"
)]
pub struct Opts {
    /// Path to a TOML config file (optional)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Base URL of the repository catalog service
    #[arg(long)]
    pub catalog_url: Option<String>,

    /// Index directory holding the shards
    #[arg(long)]
    pub index_dir: Option<PathBuf>,

    /// Listen address for the admin surface (disabled when unset)
    #[arg(long)]
    pub listen: Option<String>,

    /// Sync with the catalog this often, in seconds
    #[arg(long)]
    pub interval_seconds: Option<u64>,

    /// Run the merge pass this often, in seconds
    #[arg(long)]
    pub merge_interval_seconds: Option<u64>,

    /// Scan compound shards for tombstones this often, in seconds
    #[arg(long)]
    pub vacuum_interval_seconds: Option<u64>,

    /// Fraction of the cores to use for indexing, in (0, 1]
    #[arg(long)]
    pub cpu_fraction: Option<f64>,

    /// Target size for compound shards, in bytes
    #[arg(long)]
    pub target_size_bytes: Option<u64>,

    /// Shards larger than this are excluded from merging, in bytes
    #[arg(long)]
    pub max_size_bytes: Option<u64>,

    /// Compound shards smaller than this are dissolved by vacuum, in bytes
    #[arg(long)]
    pub min_size_bytes: Option<u64>,

    /// Enable shard merging (merge and vacuum loops)
    #[arg(long)]
    pub shard_merging: bool,

    /// Child indexer executable
    #[arg(long)]
    pub indexer_bin: Option<PathBuf>,

    /// Turn on more verbose logging
    #[arg(long)]
    pub debug: bool,
}

/// Resolved configuration the server runs with.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub catalog_url: reqwest::Url,
    pub index_dir: PathBuf,
    pub listen: Option<SocketAddr>,
    pub interval: Duration,
    pub merge_interval: Duration,
    pub vacuum_interval: Duration,
    pub target_size_bytes: u64,
    pub max_size_bytes: u64,
    pub min_size_bytes: u64,
    pub parallelism: usize,
    pub shard_merging: bool,
    pub indexer_bin: PathBuf,
    pub no_output_timeout: Duration,
}

fn env_u64(key: &str) -> Option<u64> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

fn env_f64(key: &str) -> Option<f64> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

fn env_bool(key: &str) -> Option<bool> {
    std::env::var(key)
        .ok()
        .map(|v| matches!(v.as_str(), "1" | "true" | "t" | "yes"))
}

/// True when the shared logging convention asks for verbose output.
pub fn src_log_level_is_debug() -> bool {
    std::env::var("SRC_LOG_LEVEL")
        .map(|lvl| lvl.eq_ignore_ascii_case("dbug") || lvl.eq_ignore_ascii_case("debug"))
        .unwrap_or(false)
}

/// Merge configuration from defaults, the optional TOML file, environment
/// variables, and CLI flags, then validate. Validation failures are fatal:
/// the caller aborts startup with the returned message.
pub fn load_config(opts: Opts) -> Result<ServerConfig> {
    // Defaults.
    let mut catalog_url: Option<String> = None;
    let mut index_dir: Option<PathBuf> = None;
    let mut listen: Option<String> = None;
    let mut interval = Duration::from_secs(10 * 60);
    let mut merge_interval = Duration::from_secs(60 * 60);
    let mut vacuum_interval = Duration::from_secs(60 * 60);
    let mut cpu_fraction = 0.25f64;
    let mut target_size_bytes: u64 = 2_000_000_000;
    let mut max_size_bytes: u64 = 1_800_000_000;
    let mut min_size_bytes: u64 = 50_000_000;
    let mut shard_merging = false;
    let mut indexer_bin = PathBuf::from("zr-archive-index");

    // Config file.
    if let Some(path) = opts.config.as_ref() {
        if path.exists() {
            let s = std::fs::read_to_string(path)
                .with_context(|| format!("read {}", path.display()))?;
            let v: toml::Value = toml::from_str(&s)
                .with_context(|| format!("parse {}", path.display()))?;
            if let Some(u) = v.get("catalog_url").and_then(|x| x.as_str()) {
                catalog_url = Some(u.to_string());
            }
            if let Some(d) = v.get("index_dir").and_then(|x| x.as_str()) {
                index_dir = Some(PathBuf::from(d));
            }
            if let Some(l) = v.get("listen").and_then(|x| x.as_str()) {
                listen = Some(l.to_string());
            }
            if let Some(i) = v.get("interval_seconds").and_then(|x| x.as_integer()) {
                interval = Duration::from_secs(i as u64);
            }
            if let Some(i) = v.get("merge_interval_seconds").and_then(|x| x.as_integer()) {
                merge_interval = Duration::from_secs(i as u64);
            }
            if let Some(i) = v.get("vacuum_interval_seconds").and_then(|x| x.as_integer()) {
                vacuum_interval = Duration::from_secs(i as u64);
            }
            if let Some(f) = v.get("cpu_fraction").and_then(|x| x.as_float()) {
                cpu_fraction = f;
            }
            if let Some(i) = v.get("target_size_bytes").and_then(|x| x.as_integer()) {
                target_size_bytes = i as u64;
            }
            if let Some(i) = v.get("max_size_bytes").and_then(|x| x.as_integer()) {
                max_size_bytes = i as u64;
            }
            if let Some(i) = v.get("min_size_bytes").and_then(|x| x.as_integer()) {
                min_size_bytes = i as u64;
            }
            if let Some(b) = v.get("shard_merging").and_then(|x| x.as_bool()) {
                shard_merging = b;
            }
            if let Some(b) = v.get("indexer_bin").and_then(|x| x.as_str()) {
                indexer_bin = PathBuf::from(b);
            }
        }
    }

    // Env vars override the file.
    if let Ok(u) = std::env::var("ZOEKTD_CATALOG_URL") {
        catalog_url = Some(u);
    }
    if let Ok(d) = std::env::var("ZOEKTD_INDEX_DIR") {
        index_dir = Some(PathBuf::from(d));
    }
    if let Ok(l) = std::env::var("ZOEKTD_LISTEN") {
        listen = Some(l);
    }
    if let Some(i) = env_u64("ZOEKTD_INTERVAL_SECONDS") {
        interval = Duration::from_secs(i);
    }
    if let Some(i) = env_u64("ZOEKTD_MERGE_INTERVAL_SECONDS") {
        merge_interval = Duration::from_secs(i);
    }
    if let Some(i) = env_u64("ZOEKTD_VACUUM_INTERVAL_SECONDS") {
        vacuum_interval = Duration::from_secs(i);
    }
    if let Some(f) = env_f64("ZOEKTD_CPU_FRACTION") {
        cpu_fraction = f;
    }
    if let Some(i) = env_u64("ZOEKTD_TARGET_SIZE_BYTES") {
        target_size_bytes = i;
    }
    if let Some(i) = env_u64("ZOEKTD_MAX_SIZE_BYTES") {
        max_size_bytes = i;
    }
    if let Some(i) = env_u64("ZOEKTD_MIN_SIZE_BYTES") {
        min_size_bytes = i;
    }
    if let Some(b) = env_bool("ZOEKTD_SHARD_MERGING") {
        shard_merging = b;
    }
    if let Ok(b) = std::env::var("ZOEKTD_INDEXER_BIN") {
        indexer_bin = PathBuf::from(b);
    }

    // CLI overrides everything.
    if let Some(u) = opts.catalog_url {
        catalog_url = Some(u);
    }
    if let Some(d) = opts.index_dir {
        index_dir = Some(d);
    }
    if let Some(l) = opts.listen {
        listen = Some(l);
    }
    if let Some(i) = opts.interval_seconds {
        interval = Duration::from_secs(i);
    }
    if let Some(i) = opts.merge_interval_seconds {
        merge_interval = Duration::from_secs(i);
    }
    if let Some(i) = opts.vacuum_interval_seconds {
        vacuum_interval = Duration::from_secs(i);
    }
    if let Some(f) = opts.cpu_fraction {
        cpu_fraction = f;
    }
    if let Some(i) = opts.target_size_bytes {
        target_size_bytes = i;
    }
    if let Some(i) = opts.max_size_bytes {
        max_size_bytes = i;
    }
    if let Some(i) = opts.min_size_bytes {
        min_size_bytes = i;
    }
    if opts.shard_merging {
        shard_merging = true;
    }
    if let Some(b) = opts.indexer_bin {
        indexer_bin = b;
    }

    // Validate.
    let Some(catalog_url) = catalog_url else {
        bail!("must set --catalog-url");
    };
    let catalog_url =
        reqwest::Url::parse(&catalog_url).with_context(|| format!("parse {catalog_url}"))?;
    let Some(index_dir) = index_dir else {
        bail!("must set --index-dir");
    };
    if !(cpu_fraction > 0.0 && cpu_fraction <= 1.0) {
        bail!("cpu_fraction must be in (0, 1], got {cpu_fraction}");
    }
    let listen = match listen {
        Some(l) => Some(l.parse().with_context(|| format!("parse listen addr {l}"))?),
        None => None,
    };

    let cores = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    let parallelism = ((cores as f64 * cpu_fraction).round() as usize).max(1);

    Ok(ServerConfig {
        catalog_url,
        index_dir,
        listen,
        interval,
        merge_interval,
        vacuum_interval,
        target_size_bytes,
        max_size_bytes,
        min_size_bytes,
        parallelism,
        shard_merging,
        indexer_bin,
        no_output_timeout: executor::NO_OUTPUT_TIMEOUT,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const ENV_VARS: &[&str] = &[
        "ZOEKTD_CATALOG_URL",
        "ZOEKTD_INDEX_DIR",
        "ZOEKTD_LISTEN",
        "ZOEKTD_INTERVAL_SECONDS",
        "ZOEKTD_MERGE_INTERVAL_SECONDS",
        "ZOEKTD_VACUUM_INTERVAL_SECONDS",
        "ZOEKTD_CPU_FRACTION",
        "ZOEKTD_TARGET_SIZE_BYTES",
        "ZOEKTD_MAX_SIZE_BYTES",
        "ZOEKTD_MIN_SIZE_BYTES",
        "ZOEKTD_SHARD_MERGING",
        "ZOEKTD_INDEXER_BIN",
    ];

    fn clear_env() {
        for v in ENV_VARS {
            std::env::remove_var(v);
        }
    }

    fn base_opts() -> Opts {
        Opts {
            catalog_url: Some("http://localhost:3090".into()),
            index_dir: Some(PathBuf::from("/tmp/idx")),
            ..Default::default()
        }
    }

    #[test]
    #[serial_test::serial]
    fn file_env_cli_precedence() {
        clear_env();
        let tmp = tempfile::NamedTempFile::new().expect("tempfile");
        std::fs::write(
            tmp.path(),
            r#"
interval_seconds = 11
merge_interval_seconds = 22
"#,
        )
        .unwrap();

        std::env::set_var("ZOEKTD_INTERVAL_SECONDS", "33");

        let mut opts = base_opts();
        opts.config = Some(tmp.path().to_path_buf());
        opts.merge_interval_seconds = Some(44);

        let cfg = load_config(opts).expect("load");
        // env beats file, cli beats both
        assert_eq!(cfg.interval.as_secs(), 33);
        assert_eq!(cfg.merge_interval.as_secs(), 44);
        clear_env();
    }

    #[test]
    #[serial_test::serial]
    fn invalid_env_is_ignored() {
        clear_env();
        std::env::set_var("ZOEKTD_INTERVAL_SECONDS", "not-a-number");
        let cfg = load_config(base_opts()).expect("load");
        assert_eq!(cfg.interval.as_secs(), 10 * 60);
        clear_env();
    }

    #[test]
    #[serial_test::serial]
    fn rejects_bad_cpu_fraction() {
        clear_env();
        let mut opts = base_opts();
        opts.cpu_fraction = Some(0.0);
        assert!(load_config(opts).is_err());

        let mut opts = base_opts();
        opts.cpu_fraction = Some(1.5);
        assert!(load_config(opts).is_err());

        let mut opts = base_opts();
        opts.cpu_fraction = Some(1.0);
        let cfg = load_config(opts).expect("load");
        assert!(cfg.parallelism >= 1);
        clear_env();
    }

    #[test]
    #[serial_test::serial]
    fn requires_catalog_url_and_index_dir() {
        clear_env();
        assert!(load_config(Opts::default()).is_err());

        let mut opts = Opts::default();
        opts.catalog_url = Some("http://localhost:3090".into());
        assert!(load_config(opts).is_err());
        clear_env();
    }

    #[test]
    #[serial_test::serial]
    fn rejects_bad_catalog_url() {
        clear_env();
        let mut opts = base_opts();
        opts.catalog_url = Some("not a url".into());
        assert!(load_config(opts).is_err());
        clear_env();
    }

    #[test]
    #[serial_test::serial]
    fn src_log_level_mapping() {
        std::env::remove_var("SRC_LOG_LEVEL");
        assert!(!src_log_level_is_debug());
        std::env::set_var("SRC_LOG_LEVEL", "dbug");
        assert!(src_log_level_is_debug());
        std::env::set_var("SRC_LOG_LEVEL", "DEBUG");
        assert!(src_log_level_is_debug());
        std::env::set_var("SRC_LOG_LEVEL", "info");
        assert!(!src_log_level_is_debug());
        std::env::remove_var("SRC_LOG_LEVEL");
    }
}
