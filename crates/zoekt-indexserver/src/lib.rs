//! Index supervisor for a zoekt shard directory.
//!
//! The daemon keeps a local directory of search shards in sync with an
//! upstream repository catalog:
//! - a queue tracks every known repository and its last-indexed fingerprint
//! - a sync loop reconciles the queue with the catalog on a jittered interval
//! - a worker loop drains the queue and drives a child indexer process under
//!   a no-output watchdog
//! - merge and vacuum loops consolidate small shards into compound shards and
//!   reclaim tombstoned content
//!
//! Exactly one supervisor owns an index directory at a time; all destructive
//! writers inside this process serialize on a single index-directory lock.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub mod admin;
pub mod catalog;
pub mod cleanup;
pub mod config;
pub mod executor;
pub mod index_args;
pub mod merge;
pub mod metrics;
pub mod queue;
pub mod server;
pub mod shards;
pub mod test_utils;
pub mod ticker;
pub mod vacuum;

pub use catalog::{DynCatalog, HttpCatalog, RepoList};
pub use config::{load_config, Opts, ServerConfig};
pub use index_args::IndexArgs;
pub use queue::Queue;
pub use server::Server;

/// Stable numeric repository id. The id is authoritative; the display name
/// may change between syncs without invalidating the shard.
pub type RepoId = u32;

/// A branch to index: name plus the commit it resolved to upstream.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Branch {
    pub name: String,
    pub version: String,
}

/// The commit recorded on the marker shard of an empty repository.
pub const EMPTY_COMMIT: &str = "404aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";

/// Upstream-supplied description of how to index one repository.
///
/// An `IndexOptions` equal to what is already on disk means a no-op; equality
/// is decided by [`IndexOptions::fingerprint`].
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexOptions {
    pub repo_id: RepoId,
    pub name: String,
    /// Branches in priority order. Order matters for the fingerprint.
    #[serde(default)]
    pub branches: Vec<Branch>,
    /// Glob patterns of files indexed regardless of size. A set: order does
    /// not affect the fingerprint.
    #[serde(default)]
    pub large_files: Vec<String>,
    /// Whether to generate symbol (ctags) metadata.
    #[serde(default)]
    pub symbols: bool,
    /// Per-repo file size limit in bytes. Zero means the server default.
    #[serde(default)]
    pub file_limit: u64,
    /// Set when the upstream failed to compute options for this repository.
    /// The worker treats such an entry as a failed index and leaves it
    /// eligible for retry on the next bump.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl IndexOptions {
    /// Fingerprint over the full desired index state. Equal fingerprints mean
    /// equivalent desired state, so the queue can skip already-indexed work.
    pub fn fingerprint(&self) -> String {
        let mut h = Sha256::new();
        self.hash_identity(&mut h);
        h.update(self.name.as_bytes());
        h.update([0]);
        hex(&h.finalize())
    }

    /// Fingerprint over the fields that require recomputing postings. Display
    /// metadata (the name) is excluded; a change there is a metadata-only
    /// rewrite.
    pub fn identity_fingerprint(&self) -> String {
        let mut h = Sha256::new();
        self.hash_identity(&mut h);
        hex(&h.finalize())
    }

    /// Fingerprint over side-band metadata only.
    pub fn meta_fingerprint(&self) -> String {
        let mut h = Sha256::new();
        h.update(self.name.as_bytes());
        hex(&h.finalize())
    }

    fn hash_identity(&self, h: &mut Sha256) {
        h.update(self.repo_id.to_le_bytes());
        for b in &self.branches {
            h.update(b.name.as_bytes());
            h.update([0]);
            h.update(b.version.as_bytes());
            h.update([0]);
        }
        let mut globs = self.large_files.clone();
        globs.sort();
        for g in &globs {
            h.update(g.as_bytes());
            h.update([0]);
        }
        h.update([self.symbols as u8]);
        h.update(self.file_limit.to_le_bytes());
    }
}

/// Outcome of one index run, fed back into [`Queue::set_indexed`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IndexState {
    /// The indexer failed; the entry stays runnable for retry.
    Fail,
    /// Postings were rebuilt.
    Success,
    /// Only side-band metadata was rewritten.
    SuccessMeta,
    /// On-disk state already matched the desired options.
    Noop,
    /// The repository has no branches; a marker shard exists.
    Empty,
}

impl IndexState {
    pub fn as_str(&self) -> &'static str {
        match self {
            IndexState::Fail => "fail",
            IndexState::Success => "success",
            IndexState::SuccessMeta => "success_meta",
            IndexState::Noop => "noop",
            IndexState::Empty => "empty",
        }
    }

    /// Terminal success states update the indexed fingerprint.
    pub fn is_terminal_success(&self) -> bool {
        !matches!(self, IndexState::Fail)
    }
}

impl std::fmt::Display for IndexState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

fn hex(bytes: &[u8]) -> String {
    use std::fmt::Write;
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(s, "{:02x}", b);
    }
    s
}

#[cfg(test)]
mod tests {
    use super::*;

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
    fn fingerprint_is_stable() {
        let a = opts(1);
        let b = opts(1);
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_eq!(a.identity_fingerprint(), b.identity_fingerprint());
    }

    #[test]
    fn fingerprint_ignores_large_file_order() {
        let mut a = opts(1);
        a.large_files = vec!["*.pb.go".into(), "*.min.js".into()];
        let mut b = opts(1);
        b.large_files = vec!["*.min.js".into(), "*.pb.go".into()];
        assert_eq!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn fingerprint_respects_branch_order() {
        let mut a = opts(1);
        a.branches.push(Branch {
            name: "dev".into(),
            version: "bbbb".into(),
        });
        let mut b = a.clone();
        b.branches.reverse();
        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn name_change_is_meta_only() {
        let a = opts(1);
        let mut b = opts(1);
        b.name = "renamed".into();
        assert_eq!(a.identity_fingerprint(), b.identity_fingerprint());
        assert_ne!(a.meta_fingerprint(), b.meta_fingerprint());
        assert_ne!(a.fingerprint(), b.fingerprint());
    }
}
