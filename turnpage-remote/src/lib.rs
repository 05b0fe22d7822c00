use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, Response};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};
use turnpage_core::{Annotation, BookmarkRecord, DocumentId, RemoteError, RemoteStore};
use url::Url;

#[derive(Deserialize, Debug)]
struct AnnotationsResponse {
    #[serde(default)]
    annotations: Option<String>,
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
struct AnnotationsRequest<'a> {
    document_id: &'a str,
    owner_id: &'a str,
    annotations: String,
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
struct BookmarksRequest<'a> {
    document_id: &'a str,
    owner_id: &'a str,
    /// Serialized record, or empty to clear.
    bookmarks: String,
}

/// JSON-over-HTTP annotation and bookmark store.
pub struct HttpRemoteStore {
    base_url: Url,
    client: Client,
}

impl HttpRemoteStore {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let mut base_url =
            Url::parse(base_url).with_context(|| format!("invalid remote url {}", base_url))?;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build http client")?;
        Ok(Self { base_url, client })
    }

    fn endpoint(&self, name: &str) -> Result<Url, RemoteError> {
        self.base_url
            .join(name)
            .map_err(|err| RemoteError::Transport(err.to_string()))
    }
}

fn transport(err: reqwest::Error) -> RemoteError {
    if err.is_decode() {
        RemoteError::Decode(err.to_string())
    } else {
        RemoteError::Transport(err.to_string())
    }
}

fn check(response: Response) -> Result<Response, RemoteError> {
    let status = response.status();
    if status.is_success() {
        Ok(response)
    } else {
        warn!(%status, url = %response.url(), "remote store rejected request");
        Err(RemoteError::Status(status.as_u16()))
    }
}

#[async_trait]
impl RemoteStore for HttpRemoteStore {
    #[instrument(skip(self), fields(document = %document))]
    async fn fetch_annotations(
        &self,
        document: &DocumentId,
        owner: &str,
    ) -> Result<Vec<Annotation>, RemoteError> {
        let response = self
            .client
            .get(self.endpoint("annotations")?)
            .query(&[("documentId", document.as_str()), ("ownerId", owner)])
            .send()
            .await
            .map_err(transport)?;
        let body: AnnotationsResponse = check(response)?.json().await.map_err(transport)?;

        let raw = body.annotations.unwrap_or_default();
        if raw.trim().is_empty() {
            return Ok(Vec::new());
        }
        let annotations: Vec<Annotation> =
            serde_json::from_str(&raw).map_err(|err| RemoteError::Decode(err.to_string()))?;
        debug!(count = annotations.len(), "fetched annotations");
        Ok(annotations)
    }

    #[instrument(skip(self, annotations), fields(document = %document, count = annotations.len()))]
    async fn save_annotations(
        &self,
        document: &DocumentId,
        owner: &str,
        annotations: &[Annotation],
    ) -> Result<(), RemoteError> {
        let request = AnnotationsRequest {
            document_id: document.as_str(),
            owner_id: owner,
            annotations: serde_json::to_string(annotations)
                .map_err(|err| RemoteError::Decode(err.to_string()))?,
        };
        let response = self
            .client
            .post(self.endpoint("annotations")?)
            .json(&request)
            .send()
            .await
            .map_err(transport)?;
        check(response)?;
        Ok(())
    }

    #[instrument(skip(self, bookmark), fields(document = %document, clear = bookmark.is_none()))]
    async fn save_bookmark(
        &self,
        document: &DocumentId,
        owner: &str,
        bookmark: Option<&BookmarkRecord>,
    ) -> Result<(), RemoteError> {
        let bookmarks = match bookmark {
            Some(record) => serde_json::to_string(record)
                .map_err(|err| RemoteError::Decode(err.to_string()))?,
            None => String::new(),
        };
        let request = BookmarksRequest {
            document_id: document.as_str(),
            owner_id: owner,
            bookmarks,
        };
        let response = self
            .client
            .post(self.endpoint("bookmarks")?)
            .json(&request)
            .send()
            .await
            .map_err(transport)?;
        check(response)?;
        Ok(())
    }
}
