use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{
    header::{ETAG, IF_MATCH},
    Client, Response, StatusCode, Url,
};
use tracing::{debug, warn};

use super::{LeaseStore, Versioned};
use crate::{slot::Version, Error, Result};

/// Ledger object behind an object-storage REST endpoint.
///
/// The object lives at `{endpoint}/n/{namespace}/b/{bucket}/o/{object}`.
/// Reads take the `ETag` as the version; writes send it back in `If-Match`
/// and the service answers `412 Precondition Failed` when it is stale.
#[derive(Debug, Clone)]
pub struct HttpObjectStore {
    client: Client,
    url: Url,
}

impl HttpObjectStore {
    pub fn new(
        endpoint: &str,
        namespace: &str,
        bucket: &str,
        object: &str,
        connect_timeout: Duration,
        request_timeout: Duration,
    ) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(connect_timeout)
            .timeout(request_timeout)
            .build()
            .map_err(|e| Error::Config(format!("cannot build http client: {e}")))?;
        Self::with_client(client, endpoint, namespace, bucket, object)
    }

    pub fn with_client(
        client: Client,
        endpoint: &str,
        namespace: &str,
        bucket: &str,
        object: &str,
    ) -> Result<Self> {
        let mut url = Url::parse(endpoint)
            .map_err(|e| Error::Config(format!("invalid endpoint {endpoint:?}: {e}")))?;
        url.path_segments_mut()
            .map_err(|()| Error::Config(format!("endpoint {endpoint:?} cannot be a base")))?
            .pop_if_empty()
            .extend(["n", namespace, "b", bucket, "o", object]);
        Ok(Self { client, url })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }
}

fn etag(response: &Response) -> Result<Version> {
    response
        .headers()
        .get(ETAG)
        .and_then(|value| value.to_str().ok())
        .map(Version::from)
        .ok_or_else(|| Error::unavailable("response carries no ETag"))
}

#[async_trait]
impl LeaseStore for HttpObjectStore {
    async fn get(&self) -> Result<Versioned> {
        let response = self
            .client
            .get(self.url.clone())
            .send()
            .await
            .map_err(Error::unavailable)?;

        match response.status() {
            status if status.is_success() => {
                let version = etag(&response)?;
                let content = response.bytes().await.map_err(Error::unavailable)?;
                debug!("got the lease object with version {}", version);
                Ok(Versioned { content, version })
            }
            StatusCode::NOT_FOUND => Err(Error::unavailable(format!(
                "lease object {} not found",
                self.url
            ))),
            status => Err(Error::unavailable(format!(
                "GET {} returned {status}",
                self.url
            ))),
        }
    }

    async fn put(&self, content: Bytes, expected: &Version) -> Result<Version> {
        let response = self
            .client
            .put(self.url.clone())
            .header(IF_MATCH, expected.as_str())
            .body(content)
            .send()
            .await
            .map_err(Error::unavailable)?;

        match response.status() {
            status if status.is_success() => etag(&response).map_err(|_| {
                warn!("PUT {} returned {status} without an ETag", self.url);
                Error::CommitUnconfirmed {
                    reason: format!("PUT {} returned {status} without an ETag", self.url),
                }
            }),
            StatusCode::PRECONDITION_FAILED => Err(Error::VersionConflict {
                expected: expected.clone(),
            }),
            status => Err(Error::unavailable(format!(
                "PUT {} returned {status}",
                self.url
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(endpoint: &str) -> Result<HttpObjectStore> {
        HttpObjectStore::with_client(Client::new(), endpoint, "ci", "lease-bucket", "leases")
    }

    #[test]
    fn test_object_url() {
        let store = store("http://127.0.0.1:9000").unwrap();
        assert_eq!(
            store.url().as_str(),
            "http://127.0.0.1:9000/n/ci/b/lease-bucket/o/leases"
        );

        let store = self::store("https://objects.example.com/api/").unwrap();
        assert_eq!(
            store.url().as_str(),
            "https://objects.example.com/api/n/ci/b/lease-bucket/o/leases"
        );
    }

    #[tokio::test]
    async fn test_put_without_etag_is_unconfirmed() {
        let app = axum::Router::new().route(
            "/n/:namespace/b/:bucket/o/:object",
            axum::routing::put(|| async { axum::http::StatusCode::OK }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await });

        let store = store(&format!("http://{addr}")).unwrap();
        let err = store
            .put(Bytes::from_static(b"1,A,R,bob,1,\n"), &Version::from("\"1\""))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::CommitUnconfirmed { .. }));
        assert!(!err.is_conflict());
    }

    #[test]
    fn test_bad_endpoint_is_config_error() {
        assert!(matches!(store("not a url"), Err(Error::Config(_))));
        assert!(matches!(store("mailto:ops@example.com"), Err(Error::Config(_))));
    }
}
