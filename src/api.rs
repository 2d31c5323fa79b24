//! One-shot authenticated reads and actions against the aggregator.
//!
//! Bearer credentials come from the mirrored token key in the
//! reload-surviving store, so this client works without a handle on the
//! session manager. Every request carries a per-class timeout; a timeout
//! aborts the request and surfaces as an ordinary error.

use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use tracing::debug;
use url::Url;

use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::models::{Container, ContainerAction, Host, ImageUpdate, UpdateAck};
use crate::session::ACCESS_TOKEN_KEY;
use crate::storage::KeyValueStore;

/// Turn a non-2xx response into [`Error::Api`], extracting the
/// human-readable `error`/`message` field from a JSON body when present.
pub(crate) async fn response_error(resp: reqwest::Response) -> Error {
    let status = resp.status().as_u16();
    let fallback = || format!("request failed with status {status}");
    let message = match resp.text().await {
        Ok(text) => serde_json::from_str::<serde_json::Value>(&text)
            .ok()
            .and_then(|v| {
                v.get("error")
                    .or_else(|| v.get("message"))
                    .and_then(|m| m.as_str())
                    .map(String::from)
            })
            .unwrap_or_else(fallback),
        Err(_) => fallback(),
    };
    Error::Api { status, message }
}

#[derive(Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    config: Arc<ClientConfig>,
    store: Arc<dyn KeyValueStore>,
}

impl ApiClient {
    pub fn new(config: Arc<ClientConfig>, store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            http: reqwest::Client::new(),
            config,
            store,
        }
    }

    fn bearer(&self) -> Option<String> {
        self.store.get(ACCESS_TOKEN_KEY)
    }

    async fn get_json<T: DeserializeOwned>(&self, url: Url, timeout: Duration) -> Result<T> {
        let mut req = self.http.get(url).timeout(timeout);
        if let Some(token) = self.bearer() {
            req = req.bearer_auth(token);
        }
        let resp = req.send().await?;
        if !resp.status().is_success() {
            return Err(response_error(resp).await);
        }
        Ok(resp.json().await?)
    }

    async fn post_json<T: DeserializeOwned>(&self, url: Url, timeout: Duration) -> Result<T> {
        let mut req = self.http.post(url).timeout(timeout);
        if let Some(token) = self.bearer() {
            req = req.bearer_auth(token);
        }
        let resp = req.send().await?;
        if !resp.status().is_success() {
            return Err(response_error(resp).await);
        }
        Ok(resp.json().await?)
    }

    /// Full container list across all hosts.
    pub async fn fetch_containers(&self) -> Result<Vec<Container>> {
        let url = self.config.endpoint("containers")?;
        self.get_json(url, self.config.read_timeout).await
    }

    /// Host summaries; the aggregator fans out to every host, so this uses
    /// the longer host timeout.
    pub async fn fetch_hosts(&self) -> Result<Vec<Host>> {
        let url = self.config.endpoint("hosts")?;
        self.get_json(url, self.config.hosts_timeout).await
    }

    /// Start, stop or restart a single container.
    pub async fn container_action(
        &self,
        host_id: &str,
        container_id: &str,
        action: ContainerAction,
    ) -> Result<()> {
        let url = self
            .config
            .endpoint(&format!("containers/{host_id}/{container_id}/{}", action.as_str()))?;
        debug!(host_id, container_id, action = action.as_str(), "container action");
        let mut req = self.http.post(url).timeout(self.config.action_timeout);
        if let Some(token) = self.bearer() {
            req = req.bearer_auth(token);
        }
        let resp = req.send().await?;
        if !resp.status().is_success() {
            return Err(response_error(resp).await);
        }
        Ok(())
    }

    /// Trigger an image update for one container. Pulling can take a while on
    /// the remote side, hence the generous update timeout.
    pub async fn trigger_container_update(
        &self,
        host_id: &str,
        container_id: &str,
    ) -> Result<UpdateAck> {
        let url = self
            .config
            .endpoint(&format!("containers/{host_id}/{container_id}/update"))?;
        self.post_json(url, self.config.update_timeout).await
    }

    /// Known image-update status for every container.
    pub async fn fetch_image_updates(&self) -> Result<Vec<ImageUpdate>> {
        let url = self.config.endpoint("updates")?;
        self.get_json(url, self.config.update_timeout).await
    }

    /// Re-check the registry for one container's image.
    pub async fn check_image_update(
        &self,
        host_id: &str,
        container_id: &str,
    ) -> Result<ImageUpdate> {
        let url = self
            .config
            .endpoint(&format!("updates/{host_id}/{container_id}/check"))?;
        self.post_json(url, self.config.action_timeout).await
    }
}
