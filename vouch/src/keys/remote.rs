use std::{collections::HashMap, time::Duration};

use async_trait::async_trait;
use reqwest::{header, Client};

use super::{max_age, FetchedKeys, KeySource, SigningKeySet};
use crate::error;

/// A key source backed by an HTTP endpoint publishing `kid` to PEM mappings
#[derive(Clone, Debug)]
pub struct RemoteKeySource {
    url: String,
    client: Client,
}

impl RemoteKeySource {
    /// Constructs a key source for `url`, bounding every request by `timeout`
    ///
    /// # Errors
    ///
    /// The HTTP client could not be constructed, usually because no TLS
    /// backend is available.
    pub fn new(
        url: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, error::KeySourceUnavailable> {
        let client = Client::builder()
            .user_agent(concat!("vouch/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()
            .map_err(|err| error::key_source_unavailable("HTTP client unavailable", err))?;

        Ok(Self::with_client(url, client))
    }

    /// Constructs a key source for `url` using an existing client
    ///
    /// The client is expected to carry its own request timeout.
    pub fn with_client(url: impl Into<String>, client: Client) -> Self {
        Self {
            url: url.into(),
            client,
        }
    }

    /// The endpoint this source retrieves keys from
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl KeySource for RemoteKeySource {
    #[tracing::instrument(skip(self), fields(keys.url = %self.url))]
    async fn fetch(&self) -> Result<FetchedKeys, error::KeySourceUnavailable> {
        tracing::debug!("fetching signing keys");

        let response = self.client.get(&self.url).send().await.map_err(|err| {
            let error: &(dyn std::error::Error + 'static) = &err;
            tracing::warn!(error, "signing key request failed");
            if err.is_timeout() {
                error::key_source_unavailable("timed out", err)
            } else {
                error::key_source_unavailable("request failed", err)
            }
        })?;

        if let Err(err) = response.error_for_status_ref() {
            let error: &(dyn std::error::Error + 'static) = &err;
            tracing::warn!(
                error,
                http.status_code = response.status().as_u16(),
                "signing key request failed; unexpected response status",
            );
            return Err(error::key_source_unavailable(
                "unexpected response status",
                err,
            ));
        }

        let max_age = max_age(
            response
                .headers()
                .get(header::CACHE_CONTROL)
                .and_then(|v| v.to_str().ok()),
        );

        let pems = response
            .json::<HashMap<String, String>>()
            .await
            .map_err(|err| {
                let error: &(dyn std::error::Error + 'static) = &err;
                tracing::warn!(error, "signing key response was not a kid to PEM mapping");
                error::key_source_unavailable("unexpected response body", err)
            })?;

        let keys = SigningKeySet::from_pems(pems);

        tracing::debug!(
            keys = keys.len(),
            max_age = max_age.map(|a| a.0),
            "fetched signing keys"
        );

        Ok(FetchedKeys { keys, max_age })
    }
}
