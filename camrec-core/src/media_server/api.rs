use std::time::Duration;

use reqwest::{Client, Response, StatusCode};
use tracing::{debug, info};

use super::document::PathConfig;
use super::ReconcileError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Removed,
    /// The server never had the path; on-demand paths only exist once pulled.
    Absent,
}

/// Client for the media server's live path-configuration API.
#[derive(Debug, Clone)]
pub struct MediaServerApi {
    client: Client,
    base_url: String,
}

impl MediaServerApi {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, ReconcileError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn endpoint(&self, action: &str, path: &str) -> String {
        format!("{}/v3/config/paths/{action}/{path}", self.base_url)
    }

    pub async fn add_path(&self, path: &str, config: &PathConfig) -> Result<(), ReconcileError> {
        let response = self
            .client
            .post(self.endpoint("add", path))
            .json(config)
            .send()
            .await?;
        expect_success(path, response).await?;
        info!(path, "media server path added");
        Ok(())
    }

    pub async fn patch_path(&self, path: &str, config: &PathConfig) -> Result<(), ReconcileError> {
        let response = self
            .client
            .patch(self.endpoint("patch", path))
            .json(config)
            .send()
            .await?;
        expect_success(path, response).await?;
        info!(path, "media server path updated");
        Ok(())
    }

    pub async fn delete_path(&self, path: &str) -> Result<DeleteOutcome, ReconcileError> {
        let response = self.client.post(self.endpoint("delete", path)).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            debug!(path, "media server path already absent");
            return Ok(DeleteOutcome::Absent);
        }
        expect_success(path, response).await?;
        info!(path, "media server path removed");
        Ok(DeleteOutcome::Removed)
    }
}

async fn expect_success(path: &str, response: Response) -> Result<(), ReconcileError> {
    let status = response.status();
    if status.is_success() {
        return Ok(());
    }
    let body = response.text().await.unwrap_or_default();
    Err(ReconcileError::Api {
        path: path.to_string(),
        status: status.as_u16(),
        body,
    })
}
