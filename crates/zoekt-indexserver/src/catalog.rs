//! Upstream catalog client.
//!
//! The catalog decides which repositories this node should index and with
//! what options. The trait keeps the surface small so tests can plug an
//! in-memory fake; production talks JSON over HTTP to the catalog service.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{IndexOptions, RepoId};

/// Result of one `list` call.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct RepoList {
    /// Every repo id this node should hold a shard for.
    pub ids: Vec<RepoId>,
    /// Options for the subset whose server-side state changed since the
    /// previous list call; the catalog tracks the token.
    #[serde(default)]
    pub changed: Vec<IndexOptions>,
}

impl RepoList {
    /// Invoke `f` for every changed repository's options.
    pub fn iterate_index_options(&self, mut f: impl FnMut(IndexOptions)) {
        for opts in &self.changed {
            f(opts.clone());
        }
    }
}

#[async_trait]
pub trait DynCatalog: Send + Sync {
    /// The full id set plus changed options. `indexed_ids` tells the catalog
    /// what is already on disk so it can prioritize.
    async fn list(&self, indexed_ids: &[RepoId]) -> Result<RepoList>;

    /// Options for the given ids, fetched unconditionally (no changed-since
    /// filtering).
    async fn force_index_options(&self, ids: &[RepoId]) -> Result<Vec<IndexOptions>>;

    /// Options for a single id, for the admin surface.
    async fn get_index_options(&self, id: RepoId) -> Result<IndexOptions>;
}

#[derive(Serialize)]
struct ListRequest<'a> {
    indexed_ids: &'a [RepoId],
}

#[derive(Serialize)]
struct OptionsRequest<'a> {
    repo_ids: &'a [RepoId],
}

/// Catalog client over HTTP, normally pointed at the internal frontend
/// service.
pub struct HttpCatalog {
    root: reqwest::Url,
    client: reqwest::Client,
}

impl HttpCatalog {
    pub fn new(root: reqwest::Url) -> Self {
        Self {
            root,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl DynCatalog for HttpCatalog {
    async fn list(&self, indexed_ids: &[RepoId]) -> Result<RepoList> {
        let url = self.root.join("/indexserver/v1/list")?;
        let resp = self
            .client
            .post(url.clone())
            .json(&ListRequest { indexed_ids })
            .send()
            .await
            .with_context(|| format!("POST {url}"))?
            .error_for_status()
            .with_context(|| format!("POST {url}"))?;
        resp.json().await.context("decode repo list")
    }

    async fn force_index_options(&self, ids: &[RepoId]) -> Result<Vec<IndexOptions>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let url = self.root.join("/indexserver/v1/options")?;
        let resp = self
            .client
            .post(url.clone())
            .json(&OptionsRequest { repo_ids: ids })
            .send()
            .await
            .with_context(|| format!("POST {url}"))?
            .error_for_status()
            .with_context(|| format!("POST {url}"))?;
        resp.json().await.context("decode index options")
    }

    async fn get_index_options(&self, id: RepoId) -> Result<IndexOptions> {
        let mut opts = self.force_index_options(&[id]).await?;
        if opts.is_empty() {
            return Err(anyhow!("catalog returned no options for repo {id}"));
        }
        Ok(opts.swap_remove(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn iterate_yields_changed_options() {
        let list = RepoList {
            ids: vec![1, 2, 3],
            changed: vec![IndexOptions {
                repo_id: 2,
                name: "changed".into(),
                ..Default::default()
            }],
        };
        let mut seen = Vec::new();
        list.iterate_index_options(|o| seen.push(o.repo_id));
        assert_eq!(seen, vec![2]);
    }

    #[test]
    fn repo_list_decodes_with_missing_changed() {
        let list: RepoList = serde_json::from_str(r#"{"ids":[5,6]}"#).unwrap();
        assert_eq!(list.ids, vec![5, 6]);
        assert!(list.changed.is_empty());
    }
}
