//! Document remote over the JSON HTTP service.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use std::time::Duration;
use tracing::debug;

use super::{DocumentRemote, RemoteError};
use crate::sync::protocol::{ConflictBody, Document, PutRequest, PutResponse};

/// Client for `GET/PUT {base_url}/api/documents/:id`
#[derive(Clone)]
pub struct HttpRemote {
    client: Client,
    base_url: String,
}

impl HttpRemote {
    pub fn new(base_url: impl Into<String>) -> Result<Self, RemoteError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| RemoteError::Transport(e.to_string()))?;
        Ok(Self::with_client(client, base_url))
    }

    pub fn with_client(client: Client, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self { client, base_url }
    }

    fn document_url(&self, document_id: &str) -> String {
        format!("{}/api/documents/{}", self.base_url, document_id)
    }
}

fn transport(err: reqwest::Error) -> RemoteError {
    RemoteError::Transport(err.to_string())
}

#[async_trait]
impl DocumentRemote for HttpRemote {
    async fn fetch(&self, document_id: &str) -> Result<Document, RemoteError> {
        let url = self.document_url(document_id);
        let response = self.client.get(&url).send().await.map_err(transport)?;

        match response.status() {
            StatusCode::NOT_FOUND => Err(RemoteError::NotFound(document_id.to_string())),
            status if !status.is_success() => Err(RemoteError::Transport(format!(
                "GET {} returned {}",
                url, status
            ))),
            _ => response.json::<Document>().await.map_err(transport),
        }
    }

    async fn put(&self, document_id: &str, request: PutRequest) -> Result<PutResponse, RemoteError> {
        let url = self.document_url(document_id);
        let submitted = request.rev;
        debug!("PUT {} at rev {}", url, submitted);

        let response = self
            .client
            .put(&url)
            .json(&request)
            .send()
            .await
            .map_err(transport)?;

        match response.status() {
            StatusCode::CONFLICT => {
                let current = response.json::<ConflictBody>().await.ok().map(|b| b.rev);
                Err(RemoteError::Conflict { submitted, current })
            }
            status if !status.is_success() => Err(RemoteError::Transport(format!(
                "PUT {} returned {}",
                url, status
            ))),
            _ => response.json::<PutResponse>().await.map_err(transport),
        }
    }
}
