//! Minimal client for the GCE instance metadata service: one-shot reads and
//! etag-based hanging-GET watches.

use snafu::ResultExt;
use std::env;
use std::future::Future;
use tokio::time::Duration;

use self::error::Result;

const DEFAULT_METADATA_HOST: &str = "metadata.google.internal";
// Host override honored by the rest of the GCE tooling ecosystem.
const METADATA_HOST_ENV_VAR: &str = "GCE_METADATA_HOST";
const METADATA_FLAVOR_HEADER: &str = "Metadata-Flavor";
const METADATA_FLAVOR: &str = "Google";

// One-shot reads are quick; only hanging watch requests may block.
const GET_TIMEOUT: Duration = Duration::from_secs(5);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Clone, Debug)]
pub struct MetadataClient {
    http: reqwest::Client,
    base_url: String,
}

impl MetadataClient {
    pub fn new() -> Result<Self> {
        let host =
            env::var(METADATA_HOST_ENV_VAR).unwrap_or_else(|_| DEFAULT_METADATA_HOST.to_string());
        let http = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .context(error::BuildClientSnafu)?;
        Ok(Self {
            http,
            base_url: format!("http://{}/computeMetadata/v1/", host),
        })
    }

    /// Reads a single metadata value.
    pub async fn get(&self, key: &str) -> Result<String> {
        let (value, _) = self.fetch(key, None, Some(GET_TIMEOUT)).await?;
        Ok(value)
    }

    /// Watches a metadata value: `observer` is invoked with the current value,
    /// then once per change reported by the server. Returns only on error;
    /// reconnecting is the caller's decision.
    pub async fn watch<F, Fut>(&self, key: &str, mut observer: F) -> Result<()>
    where
        F: FnMut(String) -> Fut,
        Fut: Future<Output = ()>,
    {
        let (value, mut last_etag) = self.fetch(key, None, Some(GET_TIMEOUT)).await?;
        observer(value).await;
        loop {
            // The hanging GET holds until the value changes server-side.
            let (value, etag) = self.fetch(key, Some(&last_etag), None).await?;
            last_etag = etag;
            observer(value).await;
        }
    }

    async fn fetch(
        &self,
        key: &str,
        wait_for_change_from: Option<&str>,
        timeout: Option<Duration>,
    ) -> Result<(String, String)> {
        let mut request = self
            .http
            .get(format!("{}{}", self.base_url, key))
            .header(METADATA_FLAVOR_HEADER, METADATA_FLAVOR);
        if let Some(etag) = wait_for_change_from {
            request = request.query(&[("wait_for_change", "true"), ("last_etag", etag)]);
        }
        if let Some(timeout) = timeout {
            request = request.timeout(timeout);
        }
        let response = request.send().await.context(error::RequestSnafu { key })?;
        let status = response.status();
        if !status.is_success() {
            return error::UnexpectedStatusSnafu { key, status }.fail();
        }
        let etag = response
            .headers()
            .get("etag")
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let value = response.text().await.context(error::RequestSnafu { key })?;
        Ok((value.trim().to_string(), etag))
    }
}

pub mod error {
    use snafu::Snafu;

    pub type Result<T> = std::result::Result<T, Error>;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub))]
    pub enum Error {
        #[snafu(display("Unable to build metadata http client: '{}'", source))]
        BuildClient { source: reqwest::Error },

        #[snafu(display("Metadata request for '{}' failed: '{}'", key, source))]
        Request { source: reqwest::Error, key: String },

        #[snafu(display("Metadata request for '{}' returned status {}", key, status))]
        UnexpectedStatus {
            key: String,
            status: reqwest::StatusCode,
        },
    }
}
