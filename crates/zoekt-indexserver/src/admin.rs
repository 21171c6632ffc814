//! Admin HTTP surface: a form to force-reindex any tracked repository, plus
//! health and metrics endpoints.
//!
//! A force reindex contends for the index-directory lock like any other
//! writer; it does not bypass a running job.

use std::sync::Arc;

use anyhow::Result;
use axum::extract::{Extension, Form};
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse};
use axum::routing::get;
use axum::Router;
use serde::Deserialize;

use crate::metrics;
use crate::server::Server;
use crate::RepoId;

#[derive(Deserialize)]
pub struct ReindexForm {
    pub repo: String,
}

pub fn router(server: Arc<Server>) -> Router {
    Router::new()
        .route("/", get(home).post(reindex))
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics_handler))
        .layer(Extension(server))
}

pub async fn serve(listener: tokio::net::TcpListener, server: Arc<Server>) -> Result<()> {
    axum::serve(listener, router(server)).await?;
    Ok(())
}

pub async fn home(Extension(server): Extension<Arc<Server>>) -> Html<String> {
    render_page(&server, "")
}

pub async fn reindex(
    Extension(server): Extension<Arc<Server>>,
    Form(form): Form<ReindexForm>,
) -> Html<String> {
    let msg = match form.repo.parse::<RepoId>() {
        Ok(id) => server.force_index(id).await,
        Err(err) => format!("bad repo id {:?}: {err}", form.repo),
    };
    render_page(&server, &msg)
}

async fn healthz() -> &'static str {
    "OK"
}

async fn metrics_handler() -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4")],
        metrics::render_prometheus(),
    )
}

fn render_page(server: &Server, msg: &str) -> Html<String> {
    let mut rows = String::new();
    server.queue.iterate(|opts| {
        rows.push_str(&format!(
            "<button type=\"submit\" name=\"repo\" value=\"{}\">{}</button><br />\n",
            opts.repo_id,
            escape(&opts.name)
        ));
    });
    Html(format!(
        "<html><body>\n{}<br />\n<h3>Re-index repository</h3>\n<form action=\"/\" method=\"post\">\n{}</form>\n</body></html>\n",
        escape(msg),
        rows
    ))
}

fn escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escape_neutralizes_markup() {
        assert_eq!(escape("a<b>&\"c\""), "a&lt;b&gt;&amp;&quot;c&quot;");
    }
}
