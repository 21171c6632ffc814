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

//! Ordered set of repositories with pending and indexed fingerprints.
//!
//! One entry per known repo id. An entry is *runnable* when it sits in the
//! FIFO runnable set and *idle* otherwise. Popping removes an entry from the
//! runnable set but keeps it in the index so `set_indexed` can find it after
//! the worker finishes.

use std::collections::{BTreeMap, HashMap, HashSet};

use parking_lot::Mutex;

use crate::{IndexOptions, IndexState, RepoId};

struct Entry {
    opts: IndexOptions,
    /// Arrival sequence; position in the runnable set when queued.
    seq: u64,
    queued: bool,
    /// Fingerprint that was last successfully written to disk.
    indexed: Option<String>,
    /// Fingerprint currently waiting to run.
    pending: Option<String>,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<RepoId, Entry>,
    /// Runnable set ordered by arrival sequence. Ties within one sync pass
    /// keep arrival order so repeated syncs don't starve late arrivals.
    runnable: BTreeMap<u64, RepoId>,
    next_seq: u64,
}

/// Safe for many writers and one popper; every operation takes the single
/// internal mutex.
#[derive(Default)]
pub struct Queue {
    inner: Mutex<Inner>,
}

impl Queue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Upsert the entry keyed by `opts.repo_id` and set its pending
    /// fingerprint. Entries whose indexed fingerprint already matches go (or
    /// stay) idle; everything else is enqueued, keeping its position if it
    /// was already runnable.
    pub fn add_or_update(&self, opts: IndexOptions) {
        let fp = opts.fingerprint();
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let entry = inner.entries.entry(opts.repo_id).or_insert_with(|| Entry {
            opts: opts.clone(),
            seq: 0,
            queued: false,
            indexed: None,
            pending: None,
        });
        entry.opts = opts;
        entry.pending = Some(fp);

        if entry.pending == entry.indexed {
            if entry.queued {
                entry.queued = false;
                inner.runnable.remove(&entry.seq);
            }
        } else if !entry.queued {
            entry.queued = true;
            entry.seq = inner.next_seq;
            inner.next_seq += 1;
            inner.runnable.insert(entry.seq, entry.opts.repo_id);
        }
    }

    /// Oldest runnable entry, removed from the runnable set but retained in
    /// the index. `None` when the runnable set is empty.
    pub fn pop(&self) -> Option<IndexOptions> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let (_, id) = inner.runnable.pop_first()?;
        let entry = inner.entries.get_mut(&id)?;
        entry.queued = false;
        Some(entry.opts.clone())
    }

    /// Record the outcome of one index run. Terminal success states mark the
    /// entry as current; a failure leaves the indexed fingerprint untouched
    /// so the next bump retries the entry.
    pub fn set_indexed(&self, opts: &IndexOptions, state: IndexState) {
        if !state.is_terminal_success() {
            return;
        }
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        if let Some(entry) = inner.entries.get_mut(&opts.repo_id) {
            entry.indexed = Some(opts.fingerprint());
            if entry.queued && entry.pending == entry.indexed {
                entry.queued = false;
                inner.runnable.remove(&entry.seq);
            }
        }
    }

    /// Drop entries whose id is not in `ids`. Returns the count removed.
    pub fn maybe_remove_missing(&self, ids: &[RepoId]) -> usize {
        let keep: HashSet<RepoId> = ids.iter().copied().collect();
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let gone: Vec<RepoId> = inner
            .entries
            .keys()
            .filter(|id| !keep.contains(id))
            .copied()
            .collect();
        for id in &gone {
            if let Some(entry) = inner.entries.remove(id) {
                if entry.queued {
                    inner.runnable.remove(&entry.seq);
                }
            }
        }
        gone.len()
    }

    /// Re-enqueue every id we know about using its stored options so the
    /// worker re-validates disk state even without upstream changes. Returns
    /// the subset of `ids` with no entry; the caller fetches options for
    /// those unconditionally.
    pub fn bump(&self, ids: &[RepoId]) -> Vec<RepoId> {
        let mut missing = Vec::new();
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        for &id in ids {
            match inner.entries.get_mut(&id) {
                None => missing.push(id),
                Some(entry) if !entry.queued => {
                    entry.queued = true;
                    entry.seq = inner.next_seq;
                    inner.next_seq += 1;
                    inner.runnable.insert(entry.seq, id);
                }
                Some(_) => {}
            }
        }
        missing
    }

    /// Snapshot read of all stored options, ordered by repo id.
    pub fn iterate(&self, mut f: impl FnMut(&IndexOptions)) {
        let inner = self.inner.lock();
        let mut ids: Vec<RepoId> = inner.entries.keys().copied().collect();
        ids.sort_unstable();
        for id in ids {
            f(&inner.entries[&id].opts);
        }
    }

    /// Number of runnable entries.
    pub fn len(&self) -> usize {
        self.inner.lock().runnable.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
