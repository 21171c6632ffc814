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

//! Tombstone vacuum for compound shards.
//!
//! Cleanup only marks repos inside compounds as tombstoned; this loop does
//! the physical reclamation. A compound whose live content fell below the
//! size floor is dissolved back into single-repo shards; one above the floor
//! but carrying tombstones is rewritten without them. Like merging, the
//! heavy work runs unlocked and the commit happens under the index lock.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use tokio::sync::Mutex;

use crate::shards::{self, CompoundMember, CompoundMeta};

/// One vacuum pass over the index directory.
pub async fn vacuum(index_dir: &Path, min_size: u64, index_lock: &Mutex<()>) -> Result<()> {
    for compound in shards::list_shards(index_dir)? {
        if !shards::is_compound(&compound) {
            continue;
        }
        if let Err(err) = vacuum_compound(index_dir, &compound, min_size, index_lock).await {
            tracing::warn!(shard = %compound.display(), error = %err, "vacuum failed");
        }
    }
    Ok(())
}

async fn vacuum_compound(
    index_dir: &Path,
    compound: &Path,
    min_size: u64,
    index_lock: &Mutex<()>,
) -> Result<()> {
    let meta = shards::read_compound_meta(compound)?;
    let live: Vec<&CompoundMember> = meta.live().collect();

    if live.is_empty() {
        let _guard = index_lock.lock().await;
        tracing::info!(shard = %compound.display(), "vacuum: removing dead compound");
        let _ = fs::remove_file(compound);
        let _ = fs::remove_file(shards::meta_path(compound));
        return Ok(());
    }

    if meta.live_size() < min_size {
        return dissolve(index_dir, compound, &live, index_lock).await;
    }

    if meta.tombstone_count() > 0 {
        return rewrite(index_dir, compound, &live, index_lock).await;
    }
    Ok(())
}

/// Write the live members back as individual shards, then unlink the
/// compound.
async fn dissolve(
    index_dir: &Path,
    compound: &Path,
    live: &[&CompoundMember],
    index_lock: &Mutex<()>,
) -> Result<()> {
    let content = fs::read(compound).with_context(|| format!("read {}", compound.display()))?;
    let sections: Vec<(CompoundMember, &[u8])> = live
        .iter()
        .map(|m| {
            let section = &content[m.offset as usize..(m.offset + m.len) as usize];
            ((*m).clone(), section)
        })
        .collect();

    let _guard = index_lock.lock().await;
    for (member, section) in &sections {
        let shard = shards::shard_path(index_dir, member.meta.repo_id);
        shards::write_atomic(index_dir, &shard, section)?;
        shards::write_shard_meta(index_dir, &shard, &member.meta)?;
    }
    let _ = fs::remove_file(compound);
    let _ = fs::remove_file(shards::meta_path(compound));
    tracing::info!(shard = %compound.display(), repos = sections.len(), "vacuum: dissolved compound below size floor");
    Ok(())
}

/// Rewrite the compound with only its live members.
async fn rewrite(
    index_dir: &Path,
    compound: &Path,
    live: &[&CompoundMember],
    index_lock: &Mutex<()>,
) -> Result<()> {
    let content = fs::read(compound).with_context(|| format!("read {}", compound.display()))?;
    let mut new_content = Vec::new();
    let mut members = Vec::with_capacity(live.len());
    for m in live {
        let section = &content[m.offset as usize..(m.offset + m.len) as usize];
        members.push(CompoundMember {
            meta: m.meta.clone(),
            offset: new_content.len() as u64,
            len: m.len,
            tombstoned: false,
        });
        new_content.extend_from_slice(section);
    }

    let name = shards::compound_file_name(&members);
    let scratch = shards::scratch_dir(index_dir);
    fs::create_dir_all(&scratch)?;
    let staged = scratch.join(&name);
    fs::write(&staged, &new_content)?;

    let _guard = index_lock.lock().await;
    let dest = index_dir.join(&name);
    fs::rename(&staged, &dest)
        .with_context(|| format!("rename {} -> {}", staged.display(), dest.display()))?;
    shards::write_compound_meta(index_dir, &dest, &CompoundMeta { repos: members })?;
    if dest != *compound {
        let _ = fs::remove_file(compound);
        let _ = fs::remove_file(shards::meta_path(compound));
    }
    tracing::info!(old = %compound.display(), new = %dest.display(), "vacuum: rewrote compound without tombstones");
    Ok(())
}
