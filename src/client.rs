//! client.rs
//!
//! HTTP client for the index server's bulk-insert route. This is what the
//! transport hands every batch to.

use std::time::Duration;

use reqwest::Client;
use serde_json::Value;
use url::Url;

use crate::config::TransportSettings;
use crate::errors::IndexerError;
use crate::transport::BatchSink;

pub struct IndexClient {
    client: Client,
    bulk_url: Url,
}

impl IndexClient {
    /// Build a client posting to `{settings.url}/bulk`.
    pub fn new(settings: &TransportSettings) -> Result<Self, IndexerError> {
        let bulk_url = settings.bulk_url()?;
        let client = Client::builder()
            .user_agent(concat!("rust-log-indexer-transport/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| IndexerError::Http(bulk_url.to_string(), e))?;
        Ok(IndexClient { client, bulk_url })
    }

    pub fn bulk_url(&self) -> &Url {
        &self.bulk_url
    }

    /// POST `records` as one JSON array. Any non-2xx answer is an error.
    pub async fn insert(&self, records: &[Value]) -> Result<(), IndexerError> {
        let resp = self
            .client
            .post(self.bulk_url.clone())
            .json(records)
            .send()
            .await
            .map_err(|e| IndexerError::Http(self.bulk_url.to_string(), e))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(IndexerError::UnexpectedStatus {
                url: self.bulk_url.to_string(),
                status: status.as_u16(),
            });
        }
        Ok(())
    }
}

impl BatchSink for IndexClient {
    async fn send_batch(&self, batch: &[Value]) -> Result<(), IndexerError> {
        self.insert(batch).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bulk_url_appends_route_to_prefix() {
        let settings = TransportSettings {
            url: "http://localhost:6200/logs/".into(),
            ..Default::default()
        };
        let client = IndexClient::new(&settings).unwrap();
        assert_eq!(client.bulk_url().as_str(), "http://localhost:6200/logs/bulk");
    }

    #[test]
    fn unreachable_server_is_an_http_error() {
        let settings = TransportSettings {
            // Port 9 (discard) on loopback is closed on any sane test host
            url: "http://127.0.0.1:9".into(),
            ..Default::default()
        };
        let client = IndexClient::new(&settings).unwrap();
        let result = tokio_test::block_on(client.insert(&[serde_json::json!({ "msg": "x" })]));
        assert!(matches!(result, Err(IndexerError::Http(..))));
    }
}
