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

//! Shard directory layout and metadata sidecars.
//!
//! A shard is an opaque `.zoekt` file accompanied by a JSON `.meta` sidecar.
//! Single-repo shards are named `r<id>_v1.00000.zoekt`; compound shards are
//! named `compound-<hex>.zoekt` and carry many repos, each recorded with its
//! byte range in the compound file plus a tombstone flag. All sidecar writes
//! go through the scratch directory and commit by rename so readers only
//! ever see complete files.

use std::ffi::OsString;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{Branch, IndexOptions, RepoId};

pub const SHARD_SUFFIX: &str = ".zoekt";
pub const COMPOUND_PREFIX: &str = "compound-";
/// Scratch space on the same volume as the shards, used for atomic writes.
pub const SCRATCH_DIR: &str = ".indexserver.tmp";

/// Sidecar metadata for one repository's index.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardMeta {
    pub repo_id: RepoId,
    pub name: String,
    pub branches: Vec<Branch>,
    /// Hash over the fields that require recomputing postings.
    pub identity_fingerprint: String,
    /// Hash over side-band metadata (display name).
    pub meta_fingerprint: String,
}

impl ShardMeta {
    pub fn from_options(opts: &IndexOptions) -> Self {
        Self {
            repo_id: opts.repo_id,
            name: opts.name.clone(),
            branches: opts.branches.clone(),
            identity_fingerprint: opts.identity_fingerprint(),
            meta_fingerprint: opts.meta_fingerprint(),
        }
    }
}

/// One repository inside a compound shard: its metadata plus the byte range
/// holding its content.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CompoundMember {
    pub meta: ShardMeta,
    pub offset: u64,
    pub len: u64,
    /// Tombstoned repos are treated as absent until vacuum reclaims them.
    #[serde(default)]
    pub tombstoned: bool,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CompoundMeta {
    pub repos: Vec<CompoundMember>,
}

impl CompoundMeta {
    pub fn live(&self) -> impl Iterator<Item = &CompoundMember> {
        self.repos.iter().filter(|m| !m.tombstoned)
    }

    pub fn live_size(&self) -> u64 {
        self.live().map(|m| m.len).sum()
    }

    pub fn tombstone_count(&self) -> usize {
        self.repos.iter().filter(|m| m.tombstoned).count()
    }
}

pub fn shard_file_name(id: RepoId) -> String {
    format!("r{:09}_v1.00000{}", id, SHARD_SUFFIX)
}

pub fn shard_path(index_dir: &Path, id: RepoId) -> PathBuf {
    index_dir.join(shard_file_name(id))
}

/// Compound shard name derived from its member fingerprints, so successive
/// rewrites of the same compound get distinct names and commit by rename.
pub fn compound_file_name(members: &[CompoundMember]) -> String {
    let mut h = Sha256::new();
    for m in members {
        h.update(m.meta.identity_fingerprint.as_bytes());
        h.update([m.tombstoned as u8]);
    }
    let digest = h.finalize();
    let mut hex = String::new();
    for b in digest.iter().take(8) {
        hex.push_str(&format!("{:02x}", b));
    }
    format!("{}{}{}", COMPOUND_PREFIX, hex, SHARD_SUFFIX)
}

pub fn meta_path(shard: &Path) -> PathBuf {
    let mut os: OsString = shard.as_os_str().to_owned();
    os.push(".meta");
    PathBuf::from(os)
}

pub fn is_shard(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.ends_with(SHARD_SUFFIX))
        .unwrap_or(false)
}

pub fn is_compound(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.starts_with(COMPOUND_PREFIX) && n.ends_with(SHARD_SUFFIX))
        .unwrap_or(false)
}

/// Repo id parsed from a single-repo shard file name, `None` for compounds
/// and foreign files.
pub fn parse_shard_repo_id(path: &Path) -> Option<RepoId> {
    let name = path.file_name()?.to_str()?;
    if !name.ends_with(SHARD_SUFFIX) || name.starts_with(COMPOUND_PREFIX) {
        return None;
    }
    let rest = name.strip_prefix('r')?;
    let digits = rest.split('_').next()?;
    digits.parse().ok()
}

/// All `.zoekt` files in the index directory, sorted by name.
pub fn list_shards(index_dir: &Path) -> io::Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    for entry in fs::read_dir(index_dir)? {
        let path = entry?.path();
        if path.is_file() && is_shard(&path) {
            out.push(path);
        }
    }
    out.sort();
    Ok(out)
}

/// Repo ids present on disk: single-repo shards plus live members of
/// compound shards. Sorted ascending.
pub fn list_repo_ids(index_dir: &Path) -> Result<Vec<RepoId>> {
    let mut ids = Vec::new();
    for shard in list_shards(index_dir)? {
        if is_compound(&shard) {
            match read_compound_meta(&shard) {
                Ok(meta) => ids.extend(meta.live().map(|m| m.meta.repo_id)),
                Err(err) => {
                    tracing::warn!(shard = %shard.display(), error = %err, "unreadable compound metadata, skipping");
                }
            }
        } else if let Some(id) = parse_shard_repo_id(&shard) {
            ids.push(id);
        }
    }
    ids.sort_unstable();
    ids.dedup();
    Ok(ids)
}

pub fn count_compound_shards(index_dir: &Path) -> usize {
    list_shards(index_dir)
        .map(|s| s.iter().filter(|p| is_compound(p)).count())
        .unwrap_or(0)
}

pub fn read_shard_meta(shard: &Path) -> Result<ShardMeta> {
    let path = meta_path(shard);
    let data = fs::read(&path).with_context(|| format!("read {}", path.display()))?;
    serde_json::from_slice(&data).with_context(|| format!("parse {}", path.display()))
}

pub fn write_shard_meta(index_dir: &Path, shard: &Path, meta: &ShardMeta) -> Result<()> {
    write_atomic(index_dir, &meta_path(shard), &serde_json::to_vec(meta)?)
}

pub fn read_compound_meta(shard: &Path) -> Result<CompoundMeta> {
    let path = meta_path(shard);
    let data = fs::read(&path).with_context(|| format!("read {}", path.display()))?;
    serde_json::from_slice(&data).with_context(|| format!("parse {}", path.display()))
}

pub fn write_compound_meta(index_dir: &Path, shard: &Path, meta: &CompoundMeta) -> Result<()> {
    write_atomic(index_dir, &meta_path(shard), &serde_json::to_vec(meta)?)
}

pub fn scratch_dir(index_dir: &Path) -> PathBuf {
    index_dir.join(SCRATCH_DIR)
}

/// Create the scratch directory and drop anything a previous process left in
/// it. Called once at startup before any loop runs.
pub fn setup_scratch_dir(index_dir: &Path) -> Result<()> {
    let scratch = scratch_dir(index_dir);
    if scratch.exists() {
        fs::remove_dir_all(&scratch)
            .with_context(|| format!("clear scratch {}", scratch.display()))?;
    }
    fs::create_dir_all(&scratch).with_context(|| format!("create {}", scratch.display()))?;
    Ok(())
}

/// Write `data` to `dest` by staging in the scratch directory and renaming.
/// The scratch directory lives on the same volume, so the rename is atomic.
pub fn write_atomic(index_dir: &Path, dest: &Path, data: &[u8]) -> Result<()> {
    let scratch = scratch_dir(index_dir);
    fs::create_dir_all(&scratch)?;
    let staged = scratch.join(format!(
        "{}.tmp",
        dest.file_name().and_then(|n| n.to_str()).unwrap_or("stage")
    ));
    fs::write(&staged, data).with_context(|| format!("write {}", staged.display()))?;
    fs::rename(&staged, dest)
        .with_context(|| format!("rename {} -> {}", staged.display(), dest.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn opts(id: RepoId) -> IndexOptions {
        IndexOptions {
            repo_id: id,
            name: format!("repo-{id}"),
            branches: vec![Branch {
                name: "HEAD".into(),
                version: "aaaa".into(),
            }],
            ..Default::default()
        }
    }

    #[test]
    fn parse_round_trips_shard_names() {
        let dir = Path::new("/idx");
        let p = shard_path(dir, 42);
        assert_eq!(parse_shard_repo_id(&p), Some(42));
        assert!(!is_compound(&p));
        assert!(is_compound(Path::new("/idx/compound-abcd1234.zoekt")));
        assert_eq!(parse_shard_repo_id(Path::new("/idx/compound-ab.zoekt")), None);
        assert_eq!(parse_shard_repo_id(Path::new("/idx/README")), None);
    }

    #[test]
    fn meta_round_trip() {
        let tmp = TempDir::new().unwrap();
        let shard = shard_path(tmp.path(), 7);
        std::fs::write(&shard, b"shard-bytes").unwrap();
        let meta = ShardMeta::from_options(&opts(7));
        write_shard_meta(tmp.path(), &shard, &meta).unwrap();
        assert_eq!(read_shard_meta(&shard).unwrap(), meta);
    }

    #[test]
    fn list_repo_ids_sees_singles_and_compound_live_members() {
        let tmp = TempDir::new().unwrap();
        let single = shard_path(tmp.path(), 3);
        std::fs::write(&single, b"x").unwrap();
        write_shard_meta(tmp.path(), &single, &ShardMeta::from_options(&opts(3))).unwrap();

        let members = vec![
            CompoundMember {
                meta: ShardMeta::from_options(&opts(1)),
                offset: 0,
                len: 4,
                tombstoned: false,
            },
            CompoundMember {
                meta: ShardMeta::from_options(&opts(2)),
                offset: 4,
                len: 4,
                tombstoned: true,
            },
        ];
        let compound = tmp.path().join(compound_file_name(&members));
        std::fs::write(&compound, b"aaaabbbb").unwrap();
        write_compound_meta(tmp.path(), &compound, &CompoundMeta { repos: members }).unwrap();

        assert_eq!(list_repo_ids(tmp.path()).unwrap(), vec![1, 3]);
        assert_eq!(count_compound_shards(tmp.path()), 1);
    }

    #[test]
    fn setup_scratch_dir_clears_leftovers() {
        let tmp = TempDir::new().unwrap();
        let scratch = scratch_dir(tmp.path());
        std::fs::create_dir_all(&scratch).unwrap();
        std::fs::write(scratch.join("stale.tmp"), b"x").unwrap();
        setup_scratch_dir(tmp.path()).unwrap();
        assert!(scratch.exists());
        assert!(!scratch.join("stale.tmp").exists());
    }
}
