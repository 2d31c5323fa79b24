//! Bulk operation orchestrator: fan out an image update across a filtered
//! subset of the fleet and aggregate per-item outcomes.

use futures_util::future::join_all;
use tracing::info;

use crate::api::ApiClient;
use crate::error::Result;
use crate::models::{BulkUpdateItem, BulkUpdateReport, Container};

/// Target filter for a bulk update. `host_id` matches by exact host id;
/// `name` matches as a trimmed, case-folded substring of the container name.
/// An empty or whitespace-only name filter matches everything.
#[derive(Debug, Clone, Default)]
pub struct BulkUpdateFilter {
    pub host_id: Option<String>,
    pub name: Option<String>,
}

impl BulkUpdateFilter {
    fn name_needle(&self) -> Option<String> {
        self.name
            .as_deref()
            .map(|n| n.trim().to_lowercase())
            .filter(|n| !n.is_empty())
    }

    pub fn matches(&self, container: &Container) -> bool {
        if let Some(host_id) = &self.host_id {
            if &container.host_id != host_id {
                return false;
            }
        }
        if let Some(needle) = self.name_needle() {
            if !container.name.to_lowercase().contains(&needle) {
                return false;
            }
        }
        true
    }
}

/// Fan out an image update across every matched container.
///
/// The match set comes from a fresh one-shot read, not the live snapshot; if
/// that read fails the whole operation fails, since no safe partial result
/// exists. With `dry_run` the matched count is reported and nothing else
/// happens. Otherwise one update request is issued per matched container,
/// concurrently and independently: a single container's failure becomes a
/// per-item error entry and never aborts the batch. Each result is attributed
/// by the container identity captured before dispatch, not by completion
/// order.
pub async fn bulk_update(
    api: &ApiClient,
    filter: &BulkUpdateFilter,
    dry_run: bool,
) -> Result<BulkUpdateReport> {
    let containers = api.fetch_containers().await?;
    let matched: Vec<Container> = containers.into_iter().filter(|c| filter.matches(c)).collect();

    if dry_run {
        return Ok(BulkUpdateReport {
            matched: matched.len(),
            updated: 0,
            failed: 0,
            results: Vec::new(),
        });
    }

    let results = join_all(matched.iter().map(|container| {
        let api = api.clone();
        let container_id = container.id.clone();
        let container_name = container.name.clone();
        let host_id = container.host_id.clone();
        async move {
            match api.trigger_container_update(&host_id, &container_id).await {
                Ok(_) => BulkUpdateItem {
                    container_id,
                    container_name,
                    host_id,
                    success: true,
                    error: None,
                },
                Err(e) => BulkUpdateItem {
                    container_id,
                    container_name,
                    host_id,
                    success: false,
                    error: Some(e.to_string()),
                },
            }
        }
    }))
    .await;

    let updated = results.iter().filter(|r| r.success).count();
    let failed = results.len() - updated;
    info!(matched = matched.len(), updated, failed, "bulk update finished");

    Ok(BulkUpdateReport {
        matched: matched.len(),
        updated,
        failed,
        results,
    })
}
