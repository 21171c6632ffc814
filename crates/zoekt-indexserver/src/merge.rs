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

//! Compound shard merging.
//!
//! Many small single-repo shards cost memory; merging consolidates them into
//! compound shards approaching the target size. The heavy work (reading and
//! concatenating shard content) runs against the scratch directory without
//! the index lock; only the rename commit and source unlink happen under it,
//! so an observer sees either the old shards or the new compound, never a
//! half-merged state.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tokio::sync::Mutex;

use crate::shards::{self, CompoundMember, CompoundMeta};

/// Group single-repo shards into merge sets. Shards larger than `max_size`
/// are never candidates; each set's total approaches `target_size` without
/// exceeding it; sets of one are discarded.
pub fn plan_merge(
    mut candidates: Vec<(PathBuf, u64)>,
    target_size: u64,
    max_size: u64,
) -> Vec<Vec<PathBuf>> {
    candidates.retain(|(_, size)| *size <= max_size);
    candidates.sort();

    let mut groups = Vec::new();
    let mut current: Vec<PathBuf> = Vec::new();
    let mut current_size = 0u64;
    for (path, size) in candidates {
        if !current.is_empty() && current_size + size > target_size {
            if current.len() >= 2 {
                groups.push(std::mem::take(&mut current));
            } else {
                current.clear();
            }
            current_size = 0;
        }
        current_size += size;
        current.push(path);
    }
    if current.len() >= 2 {
        groups.push(current);
    }
    groups
}

/// One merge pass over the index directory.
pub async fn do_merge(
    index_dir: &Path,
    target_size: u64,
    max_size: u64,
    index_lock: &Mutex<()>,
) -> Result<()> {
    let mut candidates = Vec::new();
    for shard in shards::list_shards(index_dir)? {
        if shards::is_compound(&shard) {
            continue;
        }
        let size = fs::metadata(&shard)?.len();
        candidates.push((shard, size));
    }

    let groups = plan_merge(candidates, target_size, max_size);
    for group in groups {
        if let Err(err) = merge_group(index_dir, &group, index_lock).await {
            tracing::warn!(error = %err, "merge group failed");
        }
    }
    Ok(())
}

async fn merge_group(index_dir: &Path, group: &[PathBuf], index_lock: &Mutex<()>) -> Result<()> {
    // Heavy part, unlocked: concatenate member content into a staged file.
    let mut members = Vec::with_capacity(group.len());
    let mut content = Vec::new();
    for shard in group {
        let meta = shards::read_shard_meta(shard)
            .with_context(|| format!("merge: read {}", shard.display()))?;
        let bytes = fs::read(shard).with_context(|| format!("merge: read {}", shard.display()))?;
        members.push(CompoundMember {
            meta,
            offset: content.len() as u64,
            len: bytes.len() as u64,
            tombstoned: false,
        });
        content.extend_from_slice(&bytes);
    }

    let name = shards::compound_file_name(&members);
    let scratch = shards::scratch_dir(index_dir);
    fs::create_dir_all(&scratch)?;
    let staged = scratch.join(&name);
    fs::write(&staged, &content).with_context(|| format!("merge: write {}", staged.display()))?;

    // Commit under the index lock: rename the compound in, then drop the
    // sources. A worker may have replaced a source while we read it; in
    // that case the group is abandoned and retried on a later tick.
    let _guard = index_lock.lock().await;
    for shard in group {
        if !shard.exists() {
            tracing::info!(shard = %shard.display(), "merge: source vanished, abandoning group");
            let _ = fs::remove_file(&staged);
            return Ok(());
        }
    }
    let dest = index_dir.join(&name);
    fs::rename(&staged, &dest)
        .with_context(|| format!("merge: rename {} -> {}", staged.display(), dest.display()))?;
    shards::write_compound_meta(index_dir, &dest, &CompoundMeta { repos: members })?;
    for shard in group {
        let _ = fs::remove_file(shard);
        let _ = fs::remove_file(shards::meta_path(shard));
    }
    tracing::info!(compound = %dest.display(), members = group.len(), "merged shards into compound");
    Ok(())
}
