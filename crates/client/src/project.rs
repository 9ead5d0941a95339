// Out-of-band project metadata refetch.
//
// A `project_updated` push message only says *that* project metadata changed.
// The metadata itself comes from a request/response endpoint, fetched here and
// published on a watch channel.

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use reqwest::header::COOKIE;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, warn};
use url::Url;

use statesync_common::ordering;
use statesync_common::types::Timestamp;

use crate::channel::validate_server_url;

/// Called by the push-channel manager whenever the project changed.
/// Implementations must not block.
pub trait ProjectRefetcher: Send + Sync {
    fn request_refetch(&self, last_updated: &Timestamp);

    /// Metadata published by this refetcher, if it keeps any.
    fn subscribe_metadata(&self) -> Option<watch::Receiver<Option<ProjectMetadata>>> {
        None
    }
}

/// Latest project metadata body and the change it was fetched for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectMetadata {
    pub fetched_for: Timestamp,
    pub body: serde_json::Value,
}

/// `{server}/project/{id}`.
pub fn metadata_url(server_url: &str, project_id: &str) -> Result<Url> {
    let mut url = validate_server_url(server_url)?;
    url.path_segments_mut()
        .map_err(|_| anyhow!("server_url `{server_url}` cannot carry a path"))?
        .pop_if_empty()
        .extend(["project", project_id]);
    Ok(url)
}

/// Fetches metadata over HTTP on a spawned tokio task.
#[derive(Clone)]
pub struct HttpProjectRefetcher {
    client: reqwest::Client,
    url: Url,
    cookie: Option<String>,
    metadata_tx: Arc<watch::Sender<Option<ProjectMetadata>>>,
}

impl HttpProjectRefetcher {
    pub fn new(url: Url, cookie: Option<String>) -> Self {
        let (metadata_tx, _) = watch::channel(None);
        Self { client: reqwest::Client::new(), url, cookie, metadata_tx: Arc::new(metadata_tx) }
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<ProjectMetadata>> {
        self.metadata_tx.subscribe()
    }

    async fn fetch(&self) -> Result<serde_json::Value> {
        let mut request = self.client.get(self.url.clone());
        if let Some(cookie) = &self.cookie {
            request = request.header(COOKIE, cookie);
        }
        request
            .send()
            .await
            .with_context(|| format!("failed to request project metadata from `{}`", self.url))?
            .error_for_status()
            .context("project metadata request rejected")?
            .json::<serde_json::Value>()
            .await
            .context("project metadata is not valid JSON")
    }
}

impl ProjectRefetcher for HttpProjectRefetcher {
    fn request_refetch(&self, last_updated: &Timestamp) {
        let this = self.clone();
        let fetched_for = last_updated.clone();
        tokio::spawn(async move {
            match this.fetch().await {
                Ok(body) => publish(&this.metadata_tx, ProjectMetadata { fetched_for, body }),
                Err(error) => warn!(error = %format!("{error:#}"), "project metadata refetch failed"),
            }
        });
    }

    fn subscribe_metadata(&self) -> Option<watch::Receiver<Option<ProjectMetadata>>> {
        Some(self.subscribe())
    }
}

/// Publish unless a response for a newer change already landed.
fn publish(tx: &watch::Sender<Option<ProjectMetadata>>, metadata: ProjectMetadata) {
    tx.send_if_modified(|current| {
        let newest = current.as_ref().map(|m| &m.fetched_for);
        if !ordering::accept(&metadata.fetched_for, newest, "projectMetadata") {
            return false;
        }
        debug!(fetched_for = %metadata.fetched_for, "project metadata refreshed");
        *current = Some(metadata);
        true
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn metadata_url_appends_project_path() {
        let url = metadata_url("https://app.test/api", "p1").unwrap();
        assert_eq!(url.as_str(), "https://app.test/api/project/p1");
    }

    #[test]
    fn metadata_url_rejects_insecure_remote() {
        assert!(metadata_url("http://app.test", "p1").is_err());
    }

    #[test]
    fn out_of_order_responses_keep_the_newest() {
        let (tx, rx) = watch::channel(None);
        publish(
            &tx,
            ProjectMetadata {
                fetched_for: Timestamp::from("2024-01-02T00:00:00Z"),
                body: json!({"label": "new"}),
            },
        );
        publish(
            &tx,
            ProjectMetadata {
                fetched_for: Timestamp::from("2024-01-01T00:00:00Z"),
                body: json!({"label": "old"}),
            },
        );

        let current = rx.borrow().clone().unwrap();
        assert_eq!(current.body["label"], "new");
    }
}
