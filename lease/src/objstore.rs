//! Minimal object-storage service with `If-Match` conditional writes.
//!
//! Serves the same `/n/{namespace}/b/{bucket}/o/{object}` paths that
//! [`HttpObjectStore`](crate::store::HttpObjectStore) talks to, backed by an
//! in-memory [`ObjectBucket`]. Useful for local runs and tests.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use tokio::net::TcpListener;
use tracing::{debug, info};

use crate::{slot::Version, store::ObjectBucket, Error, Result};

/// Key an object is stored under inside the bucket.
pub fn object_key(namespace: &str, bucket: &str, object: &str) -> String {
    format!("{namespace}/{bucket}/{object}")
}

pub fn router(bucket: Arc<ObjectBucket>) -> Router {
    Router::new()
        .route(
            "/n/:namespace/b/:bucket/o/:object",
            get(get_object).put(put_object),
        )
        .with_state(bucket)
}

/// Serve until the listener fails.
pub async fn serve(listener: TcpListener, bucket: Arc<ObjectBucket>) -> Result<()> {
    let addr = listener.local_addr()?;
    info!("object store listening on {}", addr);
    axum::serve(listener, router(bucket))
        .await
        .map_err(Error::from)
}

/// Bind `addr` and serve in the background. Returns the bound address.
pub async fn spawn(addr: SocketAddr, bucket: Arc<ObjectBucket>) -> Result<SocketAddr> {
    let listener = TcpListener::bind(addr).await?;
    let bound = listener.local_addr()?;
    tokio::spawn(async move {
        if let Err(e) = serve(listener, bucket).await {
            tracing::error!("object store stopped: {}", e);
        }
    });
    Ok(bound)
}

type ObjectPath = Path<(String, String, String)>;

async fn get_object(
    State(bucket): State<Arc<ObjectBucket>>,
    Path((namespace, bucket_name, object)): ObjectPath,
) -> Response {
    let key = object_key(&namespace, &bucket_name, &object);
    match bucket.get(&key) {
        Some(stored) => {
            debug!("GET {} -> {}", key, stored.version);
            (
                [(header::ETAG, stored.version.to_string())],
                stored.content,
            )
                .into_response()
        }
        None => (StatusCode::NOT_FOUND, format!("object {key} not found")).into_response(),
    }
}

async fn put_object(
    State(bucket): State<Arc<ObjectBucket>>,
    Path((namespace, bucket_name, object)): ObjectPath,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let key = object_key(&namespace, &bucket_name, &object);
    let if_match = match headers.get(header::IF_MATCH).map(|value| value.to_str()) {
        None => None,
        Some(Ok(value)) => Some(Version::from(value)),
        Some(Err(_)) => {
            return (StatusCode::BAD_REQUEST, "If-Match is not valid text").into_response();
        }
    };

    let result = match &if_match {
        Some(expected) => bucket.put(&key, body, Some(expected)),
        None => Ok(bucket.upload(&key, body)),
    };

    match result {
        Ok(version) => {
            debug!("PUT {} -> {}", key, version);
            (StatusCode::OK, [(header::ETAG, version.to_string())]).into_response()
        }
        Err(Error::VersionConflict { expected }) => {
            debug!("PUT {} rejected, stale version {}", key, expected);
            (
                StatusCode::PRECONDITION_FAILED,
                format!("object {key} is not at version {expected}"),
            )
                .into_response()
        }
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}
