// Copyright 2025 HyperZoekt Project
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The indexing control plane: sync loop, worker loop, and the merge and
//! vacuum tickers, all sharing one queue and one index-directory lock.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use anyhow::Result;
use tokio::process::Command;
use tokio::sync::Mutex;

use crate::catalog::DynCatalog;
use crate::config::ServerConfig;
use crate::index_args::{self, IncrementalState, IndexArgs};
use crate::queue::Queue;
use crate::{cleanup, executor, merge, metrics, shards, ticker, vacuum};
use crate::{IndexOptions, IndexState, RepoId};

/// Existence of this file in the index directory pauses the sync and worker
/// loops, so an operator can poke at the directory without the supervisor
/// writing to it. Its content is logged.
pub const PAUSE_FILE: &str = "PAUSE";

/// Default file size limit passed to the child indexer when the repo options
/// don't override it.
const DEFAULT_FILE_LIMIT: u64 = 1 << 20;

/// Archive downloads come from a co-located service on the same network;
/// uncapped fetches have taken out the link for everything else on the
/// host. 1 Gbps still moves a 1 GiB archive in ~8.5 s.
const DOWNLOAD_LIMIT_MBPS: u32 = 1000;

pub struct Server {
    pub cfg: ServerConfig,
    pub queue: Queue,
    catalog: Arc<dyn DynCatalog>,
    /// Serializes all destructive writers into the index directory: worker,
    /// cleanup, merge commit, vacuum commit. Never held together with the
    /// queue mutex.
    index_lock: Mutex<()>,
}

impl Server {
    pub fn new(cfg: ServerConfig, catalog: Arc<dyn DynCatalog>) -> Self {
        Self {
            cfg,
            queue: Queue::new(),
            catalog,
            index_lock: Mutex::new(()),
        }
    }

    fn pause_file(&self) -> PathBuf {
        self.cfg.index_dir.join(PAUSE_FILE)
    }

    /// Pause-file content when the supervisor is manually paused.
    fn paused(&self) -> Option<String> {
        std::fs::read_to_string(self.pause_file())
            .ok()
            .map(|s| s.trim().to_string())
    }

    pub fn index_args(&self, opts: IndexOptions) -> IndexArgs {
        let file_limit = if opts.file_limit > 0 {
            opts.file_limit
        } else {
            DEFAULT_FILE_LIMIT
        };
        IndexArgs {
            opts,
            index_dir: self.cfg.index_dir.clone(),
            parallelism: self.cfg.parallelism,
            incremental: true,
            file_limit,
            download_limit_mbps: DOWNLOAD_LIMIT_MBPS,
        }
    }

    /// One sync tick: reconcile the queue and the disk with the upstream
    /// catalog. Does not return until the background cleanup pass finished,
    /// so the next tick sees a quiesced directory.
    pub async fn sync_once(self: &Arc<Self>) -> Result<()> {
        if let Some(msg) = self.paused() {
            tracing::info!(pause = %msg, "manually paused via PAUSE file, skipping sync");
            return Ok(());
        }

        let indexed = shards::list_repo_ids(&self.cfg.index_dir)?;
        let repos = self.catalog.list(&indexed).await?;
        tracing::debug!(repos = repos.ids.len(), "updating index queue");

        let removed = self.queue.maybe_remove_missing(&repos.ids);
        if removed > 0 {
            tracing::info!(count = removed, "stopped tracking repositories");
        }

        let srv = self.clone();
        let tracked = repos.ids.clone();
        let cleanup_done = tokio::spawn(async move {
            let _guard = srv.index_lock.lock().await;
            cleanup::cleanup(
                &srv.cfg.index_dir,
                &tracked,
                SystemTime::now(),
                srv.cfg.shard_merging,
            );
        });

        repos.iterate_index_options(|opts| self.queue.add_or_update(opts));

        // The catalog only streamed options for repos that changed since the
        // last tick. Re-enqueue everything we know with its stored options so
        // the worker re-validates the disk state; externally deleted or
        // corrupted shards come back without any upstream change. Repos the
        // catalog lists but we have never seen need a forced options fetch.
        let missing = self.queue.bump(&repos.ids);
        if !missing.is_empty() {
            match self.catalog.force_index_options(&missing).await {
                Ok(all) => {
                    for opts in all {
                        self.queue.add_or_update(opts);
                    }
                }
                Err(err) => {
                    tracing::warn!(error = %err, count = missing.len(), "failed to fetch options for missing repos");
                }
            }
        }

        metrics::set_compound_shards(shards::count_compound_shards(&self.cfg.index_dir));
        metrics::set_queue_len(self.queue.len());

        let _ = cleanup_done.await;
        metrics::set_last_sync_now();
        Ok(())
    }

    /// Classify and run one index job. Always returns a state; a failure
    /// also carries the error for logging.
    pub async fn index(&self, args: &IndexArgs) -> (IndexState, Option<anyhow::Error>) {
        if let Some(err) = &args.opts.error {
            return (
                IndexState::Fail,
                Some(anyhow::anyhow!("upstream option error: {err}")),
            );
        }

        if args.opts.branches.is_empty() {
            return match index_args::create_empty_shard(args) {
                Ok(()) => (IndexState::Empty, None),
                Err(err) => (IndexState::Fail, Some(err)),
            };
        }

        let mut reason = "forced";
        if args.incremental {
            let bo = args.build_options();
            let state = bo.index_state();
            reason = state.as_str();
            match state {
                IncrementalState::Equal => {
                    tracing::debug!(repo = %args, "index already up to date");
                    return (IndexState::Noop, None);
                }
                IncrementalState::Meta => {
                    match index_args::merge_meta(&bo) {
                        Ok(()) => return (IndexState::SuccessMeta, None),
                        Err(err) => {
                            tracing::warn!(repo = %args, error = %err, "falling back to full update: failed to update metadata");
                        }
                    }
                }
                IncrementalState::Corrupt => {
                    tracing::warn!(repo = %args, "falling back to full update: corrupt index");
                }
                IncrementalState::Missing => {}
            }
        }

        tracing::info!(repo = %args, reason, "updating index");
        let mut cmd = Command::new(&self.cfg.indexer_bin);
        cmd.args(args.as_args());
        if let Err(err) = executor::logged_run(cmd, self.cfg.no_output_timeout).await {
            return (IndexState::Fail, Some(err));
        }

        // The child writes the shard content; the control-plane sidecar is
        // ours to stamp so the next incremental pass can classify.
        let shard = shards::shard_path(&args.index_dir, args.opts.repo_id);
        if !shard.exists() {
            return (
                IndexState::Fail,
                Some(anyhow::anyhow!("indexer exited 0 but wrote no shard for {args}")),
            );
        }
        match shards::write_shard_meta(
            &args.index_dir,
            &shard,
            &shards::ShardMeta::from_options(&args.opts),
        ) {
            Ok(()) => (IndexState::Success, None),
            Err(err) => (IndexState::Fail, Some(err)),
        }
    }

    /// One worker step: pop and index the oldest runnable entry. Returns
    /// false when the queue was empty.
    pub async fn process_one(&self) -> bool {
        let Some(opts) = self.queue.pop() else {
            return false;
        };
        let args = self.index_args(opts);
        let start = Instant::now();

        let (state, err) = {
            let _guard = self.index_lock.lock().await;
            self.index(&args).await
        };
        let elapsed = start.elapsed();
        metrics::record_index(state);

        if let Some(err) = err {
            tracing::error!(repo = %args, error = %err, "error indexing");
        }
        match state {
            IndexState::Success => {
                tracing::info!(repo = %args, elapsed = ?elapsed, "updated index")
            }
            IndexState::SuccessMeta => {
                tracing::info!(repo = %args, elapsed = ?elapsed, "updated metadata")
            }
            _ => {}
        }

        self.queue.set_indexed(&args.opts, state);
        metrics::set_queue_len(self.queue.len());
        true
    }

    /// Run the index job for one repository now, with fresh options from the
    /// catalog and incremental indexing disabled. Always returns a message
    /// explaining what happened, even on failure.
    pub async fn force_index(&self, id: RepoId) -> String {
        let opts = match self.catalog.get_index_options(id).await {
            Ok(opts) => opts,
            Err(err) => return format!("Indexing {id} failed: {err}"),
        };
        if let Some(err) = &opts.error {
            return format!("Indexing {id} failed: {err}");
        }

        let mut args = self.index_args(opts);
        args.incremental = false;

        let (state, err) = {
            let _guard = self.index_lock.lock().await;
            self.index(&args).await
        };
        metrics::record_index(state);
        match err {
            Some(err) => format!("Indexing {args} failed: {err}"),
            None => format!("Indexed {args} with state {state}"),
        }
    }

    /// Run the supervisor forever: spawns the sync, merge, and vacuum loops
    /// and processes the queue in the calling task.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let srv = self.clone();
        tokio::spawn(async move {
            let mut tick = ticker::jitter_ticker(srv.cfg.interval);
            while tick.recv().await.is_some() {
                if let Err(err) = srv.sync_once().await {
                    tracing::warn!(error = %err, "sync tick failed");
                    metrics::inc_sync_failed();
                }
            }
        });

        let srv = self.clone();
        tokio::spawn(async move {
            let mut tick = ticker::jitter_ticker(srv.cfg.merge_interval);
            while tick.recv().await.is_some() {
                if !srv.cfg.shard_merging {
                    continue;
                }
                if let Err(err) = merge::do_merge(
                    &srv.cfg.index_dir,
                    srv.cfg.target_size_bytes,
                    srv.cfg.max_size_bytes,
                    &srv.index_lock,
                )
                .await
                {
                    tracing::warn!(error = %err, "merge tick failed");
                }
            }
        });

        let srv = self.clone();
        tokio::spawn(async move {
            let mut tick = ticker::jitter_ticker(srv.cfg.vacuum_interval);
            while tick.recv().await.is_some() {
                if !srv.cfg.shard_merging {
                    continue;
                }
                if let Err(err) =
                    vacuum::vacuum(&srv.cfg.index_dir, srv.cfg.min_size_bytes, &srv.index_lock)
                        .await
                {
                    tracing::warn!(error = %err, "vacuum tick failed");
                }
            }
        });

        loop {
            if self.paused().is_some() {
                tokio::time::sleep(Duration::from_secs(1)).await;
                continue;
            }
            if !self.process_one().await {
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}
