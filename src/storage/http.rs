use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode};

use super::{validate_key, ObjectEntry, ObjectStore};
use crate::error::{Result, SyncError};

/// REST object store: `GET`/`PUT`/`DELETE` on `{base}/{key}` and
/// `GET {base}/{prefix}?list` returning a JSON array of [`ObjectEntry`].
pub struct HttpObjectStore {
    base_url: String,
    client: Client,
    token: Option<String>,
}

impl HttpObjectStore {
    pub fn new(base_url: &str, token: Option<&str>) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(15))
            .timeout(Duration::from_secs(60))
            .build()?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
            token: token.map(|t| t.to_string()),
        })
    }

    fn url(&self, key: &str) -> String {
        let encoded: Vec<String> = key
            .split('/')
            .map(|segment| urlencoding::encode(segment).into_owned())
            .collect();
        format!("{}/{}", self.base_url, encoded.join("/"))
    }

    fn authed(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

fn status_error(op: &str, key: &str, status: StatusCode) -> SyncError {
    SyncError::Storage(format!("{op} {key}: HTTP {status}"))
}

#[async_trait]
impl ObjectStore for HttpObjectStore {
    async fn list(&self, prefix: &str) -> Result<Vec<ObjectEntry>> {
        let url = format!("{}?list", self.url(prefix));
        let response = self.authed(self.client.get(&url)).send().await?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        if !status.is_success() {
            return Err(status_error("list", prefix, status));
        }
        let mut entries: Vec<ObjectEntry> = response.json().await?;
        entries.retain(|e| e.key.starts_with(prefix));
        Ok(entries)
    }

    async fn read(&self, key: &str) -> Result<Option<Vec<u8>>> {
        validate_key(key)?;
        let response = self.authed(self.client.get(self.url(key))).send().await?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(status_error("read", key, status));
        }
        Ok(Some(response.bytes().await?.to_vec()))
    }

    async fn write(&self, key: &str, data: Vec<u8>) -> Result<()> {
        validate_key(key)?;
        let response = self
            .authed(self.client.put(self.url(key)))
            .header("content-type", "application/octet-stream")
            .body(data)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(status_error("write", key, status));
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        validate_key(key)?;
        let response = self.authed(self.client.delete(self.url(key))).send().await?;
        let status = response.status();
        if status.is_success() || status == StatusCode::NOT_FOUND {
            return Ok(());
        }
        Err(status_error("delete", key, status))
    }
}
