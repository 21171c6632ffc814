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

//! Fakes and fixtures shared between unit and integration tests.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use parking_lot::Mutex;

use crate::catalog::{DynCatalog, RepoList};
use crate::config::ServerConfig;
use crate::executor;
use crate::{IndexOptions, RepoId};

#[derive(Default)]
struct MockState {
    repos: Vec<IndexOptions>,
    /// Drained by the next `list` call, mirroring the catalog's
    /// changed-since semantics.
    changed: Vec<IndexOptions>,
}

/// In-memory catalog fake. `list` returns the configured id set and drains
/// the changed options exactly once, the way the real catalog only streams
/// repos whose state moved since the previous call.
#[derive(Default)]
pub struct MockCatalog {
    state: Mutex<MockState>,
    list_calls: AtomicUsize,
}

impl MockCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the tracked set; all given repos are reported as changed on
    /// the next `list`.
    pub fn set_repos(&self, repos: Vec<IndexOptions>) {
        let mut state = self.state.lock();
        state.changed = repos.clone();
        state.repos = repos;
    }

    /// Upsert one repo and mark it changed.
    pub fn update_repo(&self, opts: IndexOptions) {
        let mut state = self.state.lock();
        state.repos.retain(|o| o.repo_id != opts.repo_id);
        state.repos.push(opts.clone());
        state.changed.push(opts);
    }

    /// Stop listing a repo, without reporting any change.
    pub fn remove_repo(&self, id: RepoId) {
        let mut state = self.state.lock();
        state.repos.retain(|o| o.repo_id != id);
        state.changed.retain(|o| o.repo_id != id);
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DynCatalog for MockCatalog {
    async fn list(&self, _indexed_ids: &[RepoId]) -> Result<RepoList> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock();
        Ok(RepoList {
            ids: state.repos.iter().map(|o| o.repo_id).collect(),
            changed: std::mem::take(&mut state.changed),
        })
    }

    async fn force_index_options(&self, ids: &[RepoId]) -> Result<Vec<IndexOptions>> {
        let state = self.state.lock();
        Ok(state
            .repos
            .iter()
            .filter(|o| ids.contains(&o.repo_id))
            .cloned()
            .collect())
    }

    async fn get_index_options(&self, id: RepoId) -> Result<IndexOptions> {
        let state = self.state.lock();
        state
            .repos
            .iter()
            .find(|o| o.repo_id == id)
            .cloned()
            .ok_or_else(|| anyhow!("unknown repo {id}"))
    }
}

fn write_script(path: &Path, script: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;
    std::fs::write(path, script).expect("write stub script");
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))
        .expect("chmod stub script");
    path.to_path_buf()
}

/// Shell stand-in for the real archive indexer: records the invocation in
/// `log`, then writes the expected shard file.
pub fn write_stub_indexer(dir: &Path, log: &Path) -> PathBuf {
    let script = format!(
        r#"#!/bin/sh
index=""
repo_id=""
while [ $# -gt 0 ]; do
  case "$1" in
    --index) index="$2"; shift 2 ;;
    --repo-id) repo_id="$2"; shift 2 ;;
    *) shift ;;
  esac
done
echo "$repo_id" >> "{log}"
echo "indexing $repo_id"
shard=$(printf 'r%09d_v1.00000.zoekt' "$repo_id")
printf 'shard-content-%s' "$repo_id" > "$index/$shard"
"#,
        log = log.display()
    );
    write_script(&dir.join("stub-indexer.sh"), &script)
}

/// Stand-in for a wedged indexer: emits 16 bytes of output, then blocks
/// without ever writing a shard.
pub fn write_stuck_indexer(dir: &Path) -> PathBuf {
    write_script(
        &dir.join("stuck-indexer.sh"),
        "#!/bin/sh\necho 0123456789abcdef\nexec sleep 600\n",
    )
}

/// Chatty but slow indexer used to observe lock exclusion.
pub fn write_slow_indexer(dir: &Path, log: &Path) -> PathBuf {
    let script = format!(
        r#"#!/bin/sh
index=""
repo_id=""
while [ $# -gt 0 ]; do
  case "$1" in
    --index) index="$2"; shift 2 ;;
    --repo-id) repo_id="$2"; shift 2 ;;
    *) shift ;;
  esac
done
echo "$repo_id" >> "{log}"
i=0
while [ $i -lt 20 ]; do
  echo tick
  sleep 0.02
  i=$((i + 1))
done
shard=$(printf 'r%09d_v1.00000.zoekt' "$repo_id")
printf 'shard-content-%s' "$repo_id" > "$index/$shard"
"#,
        log = log.display()
    );
    write_script(&dir.join("slow-indexer.sh"), &script)
}

/// Server configuration pointed at a temp index directory and a stub child.
pub fn test_config(index_dir: &Path, indexer_bin: PathBuf) -> ServerConfig {
    ServerConfig {
        catalog_url: reqwest::Url::parse("http://localhost:3090").expect("static url"),
        index_dir: index_dir.to_path_buf(),
        listen: None,
        interval: Duration::from_millis(50),
        merge_interval: Duration::from_millis(50),
        vacuum_interval: Duration::from_millis(50),
        target_size_bytes: 1 << 30,
        max_size_bytes: 1 << 30,
        min_size_bytes: 0,
        parallelism: 2,
        shard_merging: false,
        indexer_bin,
        no_output_timeout: executor::NO_OUTPUT_TIMEOUT,
    }
}
