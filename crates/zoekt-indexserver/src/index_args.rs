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

//! Arguments for one index run and the incremental-state check against the
//! shard directory.

use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Result};

use crate::shards::{self, ShardMeta};
use crate::{Branch, IndexOptions, EMPTY_COMMIT};

/// Everything one index run needs: the upstream options plus server
/// defaults.
#[derive(Clone, Debug)]
pub struct IndexArgs {
    pub opts: IndexOptions,
    pub index_dir: PathBuf,
    pub parallelism: usize,
    pub incremental: bool,
    /// File size limit in bytes passed to the child indexer.
    pub file_limit: u64,
    /// Archive download rate cap in MB/s. The archive service shares the
    /// node's network; fetches must not saturate it.
    pub download_limit_mbps: u32,
}

impl IndexArgs {
    pub fn build_options(&self) -> BuildOptions {
        BuildOptions {
            index_dir: self.index_dir.clone(),
            desired: ShardMeta::from_options(&self.opts),
        }
    }

    /// Argument vector for the child indexer process.
    pub fn as_args(&self) -> Vec<String> {
        let mut args = vec![
            "--index".into(),
            self.index_dir.display().to_string(),
            "--parallelism".into(),
            self.parallelism.to_string(),
            "--file-limit".into(),
            self.file_limit.to_string(),
            "--download-limit-mbps".into(),
            self.download_limit_mbps.to_string(),
            "--repo-id".into(),
            self.opts.repo_id.to_string(),
            "--name".into(),
            self.opts.name.clone(),
        ];
        if self.incremental {
            args.push("--incremental".into());
        }
        if self.opts.symbols {
            args.push("--require-ctags".into());
        } else {
            args.push("--disable-ctags".into());
        }
        for glob in &self.opts.large_files {
            args.push("--large-file".into());
            args.push(glob.clone());
        }
        for b in &self.opts.branches {
            args.push("--branch".into());
            args.push(format!("{}@{}", b.name, b.version));
        }
        args
    }
}

impl fmt::Display for IndexArgs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (id={})", self.opts.name, self.opts.repo_id)
    }
}

/// Verdict of comparing the desired options against what is on disk.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IncrementalState {
    /// On-disk fingerprints match; nothing to do.
    Equal,
    /// Postings match but side-band metadata differs.
    Meta,
    /// Sidecar exists but cannot be read; a full reindex repairs it.
    Corrupt,
    /// No shard, or postings differ.
    Missing,
}

impl IncrementalState {
    pub fn as_str(&self) -> &'static str {
        match self {
            IncrementalState::Equal => "equal",
            IncrementalState::Meta => "meta",
            IncrementalState::Corrupt => "corrupt",
            IncrementalState::Missing => "missing",
        }
    }
}

/// Bridge to the shard directory for one repository's desired state.
pub struct BuildOptions {
    index_dir: PathBuf,
    desired: ShardMeta,
}

impl BuildOptions {
    pub fn index_state(&self) -> IncrementalState {
        match self.on_disk_meta() {
            Ok(Some(meta)) => {
                if meta.identity_fingerprint != self.desired.identity_fingerprint {
                    IncrementalState::Missing
                } else if meta.meta_fingerprint != self.desired.meta_fingerprint {
                    IncrementalState::Meta
                } else {
                    IncrementalState::Equal
                }
            }
            Ok(None) => IncrementalState::Missing,
            Err(_) => IncrementalState::Corrupt,
        }
    }

    /// Metadata currently recorded for this repo: its single shard if one
    /// exists, otherwise its live entry in a compound shard.
    fn on_disk_meta(&self) -> Result<Option<ShardMeta>> {
        let shard = shards::shard_path(&self.index_dir, self.desired.repo_id);
        if shard.exists() {
            return shards::read_shard_meta(&shard).map(Some);
        }
        for compound in shards::list_shards(&self.index_dir)? {
            if !shards::is_compound(&compound) {
                continue;
            }
            let meta = shards::read_compound_meta(&compound)?;
            if let Some(member) = meta
                .live()
                .find(|m| m.meta.repo_id == self.desired.repo_id)
            {
                return Ok(Some(member.meta.clone()));
            };
        }
        Ok(None)
    }
}

/// Rewrite only the side-band metadata of an existing shard, leaving the
/// postings untouched. Fails when the repo has no shard on disk; the caller
/// falls back to a full reindex.
pub fn merge_meta(bo: &BuildOptions) -> Result<()> {
    let shard = shards::shard_path(&bo.index_dir, bo.desired.repo_id);
    if shard.exists() {
        let mut meta = shards::read_shard_meta(&shard)?;
        meta.name = bo.desired.name.clone();
        meta.branches = bo.desired.branches.clone();
        meta.meta_fingerprint = bo.desired.meta_fingerprint.clone();
        return shards::write_shard_meta(&bo.index_dir, &shard, &meta);
    }
    for compound in shards::list_shards(&bo.index_dir)? {
        if !shards::is_compound(&compound) {
            continue;
        }
        let mut meta = shards::read_compound_meta(&compound)?;
        let mut updated = false;
        for member in meta.repos.iter_mut() {
            if !member.tombstoned && member.meta.repo_id == bo.desired.repo_id {
                member.meta.name = bo.desired.name.clone();
                member.meta.branches = bo.desired.branches.clone();
                member.meta.meta_fingerprint = bo.desired.meta_fingerprint.clone();
                updated = true;
            }
        }
        if updated {
            return shards::write_compound_meta(&bo.index_dir, &compound, &meta);
        }
    }
    Err(anyhow!(
        "no shard on disk for repo {}",
        bo.desired.repo_id
    ))
}

/// Write a marker shard for a repository with no branches so the queue does
/// not keep re-enqueueing it. The marker records a single synthetic branch
/// pointing at a dummy commit.
pub fn create_empty_shard(args: &IndexArgs) -> Result<()> {
    let mut opts = args.opts.clone();
    opts.branches = vec![Branch {
        name: "HEAD".into(),
        version: EMPTY_COMMIT.into(),
    }];
    let desired = ShardMeta::from_options(&opts);

    let shard = shards::shard_path(&args.index_dir, opts.repo_id);
    if args.incremental && shard.exists() {
        if let Ok(existing) = shards::read_shard_meta(&shard) {
            if existing.identity_fingerprint == desired.identity_fingerprint {
                return Ok(());
            }
        }
    }
    shards::write_atomic(&args.index_dir, &shard, b"")?;
    shards::write_shard_meta(&args.index_dir, &shard, &desired)
}

/// True when a marker shard produced by [`create_empty_shard`] is current
/// for the given directory and repo.
pub fn has_empty_marker(index_dir: &Path, opts: &IndexOptions) -> bool {
    let shard = shards::shard_path(index_dir, opts.repo_id);
    shards::read_shard_meta(&shard)
        .map(|m| m.branches.len() == 1 && m.branches[0].version == EMPTY_COMMIT)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn args(dir: &Path, opts: IndexOptions) -> IndexArgs {
        IndexArgs {
            opts,
            index_dir: dir.to_path_buf(),
            parallelism: 2,
            incremental: true,
            file_limit: 1 << 20,
            download_limit_mbps: 1000,
        }
    }

    fn opts(id: u32, version: &str) -> IndexOptions {
        IndexOptions {
            repo_id: id,
            name: format!("repo-{id}"),
            branches: vec![Branch {
                name: "HEAD".into(),
                version: version.into(),
            }],
            ..Default::default()
        }
    }

    #[test]
    fn index_state_missing_then_equal() {
        let tmp = TempDir::new().unwrap();
        let a = args(tmp.path(), opts(1, "aaaa"));
        let bo = a.build_options();
        assert_eq!(bo.index_state(), IncrementalState::Missing);

        let shard = shards::shard_path(tmp.path(), 1);
        std::fs::write(&shard, b"content").unwrap();
        shards::write_shard_meta(tmp.path(), &shard, &ShardMeta::from_options(&a.opts)).unwrap();
        assert_eq!(bo.index_state(), IncrementalState::Equal);
    }

    #[test]
    fn index_state_meta_on_rename() {
        let tmp = TempDir::new().unwrap();
        let old = opts(1, "aaaa");
        let shard = shards::shard_path(tmp.path(), 1);
        std::fs::write(&shard, b"content").unwrap();
        shards::write_shard_meta(tmp.path(), &shard, &ShardMeta::from_options(&old)).unwrap();

        let mut renamed = old.clone();
        renamed.name = "renamed".into();
        let bo = args(tmp.path(), renamed.clone()).build_options();
        assert_eq!(bo.index_state(), IncrementalState::Meta);

        merge_meta(&bo).unwrap();
        assert_eq!(bo.index_state(), IncrementalState::Equal);
        assert_eq!(shards::read_shard_meta(&shard).unwrap().name, "renamed");
    }

    #[test]
    fn index_state_corrupt_on_bad_sidecar() {
        let tmp = TempDir::new().unwrap();
        let shard = shards::shard_path(tmp.path(), 1);
        std::fs::write(&shard, b"content").unwrap();
        std::fs::write(shards::meta_path(&shard), b"not-json").unwrap();
        let bo = args(tmp.path(), opts(1, "aaaa")).build_options();
        assert_eq!(bo.index_state(), IncrementalState::Corrupt);
    }

    #[test]
    fn index_state_missing_on_commit_change() {
        let tmp = TempDir::new().unwrap();
        let shard = shards::shard_path(tmp.path(), 1);
        std::fs::write(&shard, b"content").unwrap();
        shards::write_shard_meta(
            tmp.path(),
            &shard,
            &ShardMeta::from_options(&opts(1, "aaaa")),
        )
        .unwrap();
        let bo = args(tmp.path(), opts(1, "bbbb")).build_options();
        assert_eq!(bo.index_state(), IncrementalState::Missing);
    }

    #[test]
    fn empty_shard_marker_is_incremental() {
        let tmp = TempDir::new().unwrap();
        let o = IndexOptions {
            repo_id: 9,
            name: "empty".into(),
            ..Default::default()
        };
        let a = args(tmp.path(), o.clone());
        create_empty_shard(&a).unwrap();
        assert!(has_empty_marker(tmp.path(), &o));

        let shard = shards::shard_path(tmp.path(), 9);
        let before = std::fs::metadata(shards::meta_path(&shard)).unwrap().modified().unwrap();
        create_empty_shard(&a).unwrap();
        let after = std::fs::metadata(shards::meta_path(&shard)).unwrap().modified().unwrap();
        assert_eq!(before, after, "second call must skip the write");
    }

    #[test]
    fn child_args_carry_all_tunables() {
        let tmp = TempDir::new().unwrap();
        let mut o = opts(5, "cccc");
        o.symbols = true;
        o.large_files = vec!["*.min.js".into()];
        let argv = args(tmp.path(), o).as_args();
        assert!(argv.contains(&"--require-ctags".into()));
        assert!(argv.contains(&"--large-file".into()));
        assert!(argv.contains(&"HEAD@cccc".to_string()));
        assert!(argv.contains(&"--incremental".into()));
    }
}
