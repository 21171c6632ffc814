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

//! Shard garbage collection.
//!
//! Every shard file on disk must correspond to a tracked repo id or be a
//! currently valid compound shard. Untracked single shards are unlinked;
//! untracked repos inside compound shards are tombstoned (vacuum reclaims
//! them later); half-written files are reaped after a grace period.
//!
//! The caller holds the index-directory lock for the whole pass.

use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::time::{Duration, SystemTime};

use crate::shards;
use crate::RepoId;

/// In-flight shard writes older than this are assumed dead.
const INCOMPLETE_GRACE: Duration = Duration::from_secs(4 * 60 * 60);

fn is_incomplete(name: &str) -> bool {
    name.ends_with(".tmp") || name.ends_with(".incomplete")
}

/// Remove every in-flight shard write regardless of age. Run once at
/// startup, before any loop can produce new ones.
pub fn remove_incomplete_shards(index_dir: &Path) {
    let entries = match fs::read_dir(index_dir) {
        Ok(e) => e,
        Err(err) => {
            tracing::warn!(dir = %index_dir.display(), error = %err, "cleanup: cannot read index dir");
            return;
        }
    };
    for entry in entries.flatten() {
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if is_incomplete(name) {
            tracing::info!(file = %path.display(), "removing incomplete shard");
            if let Err(err) = fs::remove_file(&path) {
                tracing::warn!(file = %path.display(), error = %err, "cleanup: remove failed");
            }
        }
    }
}

/// One garbage-collection pass over the index directory.
pub fn cleanup(index_dir: &Path, tracked: &[RepoId], now: SystemTime, shard_merging: bool) {
    let tracked: HashSet<RepoId> = tracked.iter().copied().collect();

    let entries = match fs::read_dir(index_dir) {
        Ok(e) => e,
        Err(err) => {
            tracing::warn!(dir = %index_dir.display(), error = %err, "cleanup: cannot read index dir");
            return;
        }
    };

    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };

        if is_incomplete(name) {
            reap_incomplete(&path, now);
            continue;
        }

        if shards::is_compound(&path) {
            cleanup_compound(index_dir, &path, &tracked, shard_merging);
            continue;
        }

        if let Some(id) = shards::parse_shard_repo_id(&path) {
            if !tracked.contains(&id) {
                tracing::info!(repo_id = id, shard = %path.display(), "removing untracked shard");
                remove_shard_and_meta(&path);
            }
        }
    }
}

fn reap_incomplete(path: &Path, now: SystemTime) {
    let old_enough = fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|mtime| now.duration_since(mtime).ok())
        .map(|age| age > INCOMPLETE_GRACE)
        .unwrap_or(false);
    if old_enough {
        tracing::info!(file = %path.display(), "removing stale incomplete shard");
        if let Err(err) = fs::remove_file(path) {
            tracing::warn!(file = %path.display(), error = %err, "cleanup: remove failed");
        }
    }
}

fn cleanup_compound(index_dir: &Path, path: &Path, tracked: &HashSet<RepoId>, shard_merging: bool) {
    let mut meta = match shards::read_compound_meta(path) {
        Ok(m) => m,
        Err(err) => {
            tracing::warn!(shard = %path.display(), error = %err, "cleanup: unreadable compound metadata");
            return;
        }
    };

    if shard_merging {
        let mut tombstoned = 0usize;
        for member in meta.repos.iter_mut() {
            if !member.tombstoned && !tracked.contains(&member.meta.repo_id) {
                member.tombstoned = true;
                tombstoned += 1;
            }
        }
        if tombstoned > 0 {
            tracing::info!(shard = %path.display(), count = tombstoned, "tombstoned untracked repos in compound");
            if let Err(err) = shards::write_compound_meta(index_dir, path, &meta) {
                tracing::warn!(shard = %path.display(), error = %err, "cleanup: tombstone write failed");
                return;
            }
        }
    }

    if meta.live().next().is_none() {
        tracing::info!(shard = %path.display(), "removing compound with no live repos");
        remove_shard_and_meta(path);
    }
}

fn remove_shard_and_meta(shard: &Path) {
    for target in [shard.to_path_buf(), shards::meta_path(shard)] {
        if let Err(err) = fs::remove_file(&target) {
            if err.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(file = %target.display(), error = %err, "cleanup: remove failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shards::{
        compound_file_name, shard_path, write_compound_meta, write_shard_meta, CompoundMember,
        CompoundMeta, ShardMeta,
    };
    use crate::{Branch, IndexOptions};
    use tempfile::TempDir;

    fn seed_single(dir: &Path, id: RepoId) {
        let shard = shard_path(dir, id);
        fs::write(&shard, b"content").unwrap();
        let opts = IndexOptions {
            repo_id: id,
            name: format!("repo-{id}"),
            branches: vec![Branch {
                name: "HEAD".into(),
                version: "aaaa".into(),
            }],
            ..Default::default()
        };
        write_shard_meta(dir, &shard, &ShardMeta::from_options(&opts)).unwrap();
    }

    fn seed_compound(dir: &Path, ids: &[RepoId]) -> std::path::PathBuf {
        let mut members = Vec::new();
        let mut offset = 0u64;
        for &id in ids {
            let opts = IndexOptions {
                repo_id: id,
                name: format!("repo-{id}"),
                ..Default::default()
            };
            members.push(CompoundMember {
                meta: ShardMeta::from_options(&opts),
                offset,
                len: 4,
                tombstoned: false,
            });
            offset += 4;
        }
        let path = dir.join(compound_file_name(&members));
        fs::write(&path, vec![0u8; offset as usize]).unwrap();
        write_compound_meta(dir, &path, &CompoundMeta { repos: members }).unwrap();
        path
    }

    #[test]
    fn untracked_single_shard_is_removed() {
        let tmp = TempDir::new().unwrap();
        seed_single(tmp.path(), 1);
        seed_single(tmp.path(), 2);

        cleanup(tmp.path(), &[1], SystemTime::now(), false);

        assert!(shard_path(tmp.path(), 1).exists());
        assert!(!shard_path(tmp.path(), 2).exists());
        assert!(!shards::meta_path(&shard_path(tmp.path(), 2)).exists());
    }

    #[test]
    fn stale_incomplete_files_are_reaped() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("r000000001_v1.00000.zoekt.tmp"), b"x").unwrap();
        fs::write(tmp.path().join("part.incomplete"), b"x").unwrap();

        // Fresh files survive a pass at the current time.
        cleanup(tmp.path(), &[], SystemTime::now(), false);
        assert!(tmp.path().join("part.incomplete").exists());

        // The same files are stale from five hours in the future.
        let later = SystemTime::now() + Duration::from_secs(5 * 60 * 60);
        cleanup(tmp.path(), &[], later, false);
        assert!(!tmp.path().join("part.incomplete").exists());
        assert!(!tmp.path().join("r000000001_v1.00000.zoekt.tmp").exists());
    }

    #[test]
    fn startup_sweep_ignores_age() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("fresh.tmp"), b"x").unwrap();
        remove_incomplete_shards(tmp.path());
        assert!(!tmp.path().join("fresh.tmp").exists());
    }

    #[test]
    fn compound_members_are_tombstoned_not_deleted() {
        let tmp = TempDir::new().unwrap();
        let compound = seed_compound(tmp.path(), &[1, 2]);

        cleanup(tmp.path(), &[1], SystemTime::now(), true);

        assert!(compound.exists(), "compound must survive tombstoning");
        let meta = shards::read_compound_meta(&compound).unwrap();
        assert_eq!(meta.tombstone_count(), 1);
        assert_eq!(meta.live().next().unwrap().meta.repo_id, 1);
    }

    #[test]
    fn fully_dead_compound_is_removed() {
        let tmp = TempDir::new().unwrap();
        let compound = seed_compound(tmp.path(), &[1, 2]);

        cleanup(tmp.path(), &[], SystemTime::now(), true);

        assert!(!compound.exists());
        assert!(!shards::meta_path(&compound).exists());
    }
}
