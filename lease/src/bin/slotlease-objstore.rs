use lease::{codec, config::Config, objstore, ObjectBucket, Result, Version};
use std::{env, net::SocketAddr, path::PathBuf, sync::Arc};
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let bind_addr = env::var("SLOTLEASE_BIND_ADDR")
        .unwrap_or_else(|_| "127.0.0.1:7070".to_string());
    let config = Config::from_env()?;

    info!("slotlease object store starting...");

    let bucket = Arc::new(ObjectBucket::new());

    // Provision the ledger out-of-band, if a seed file was given
    if let Ok(seed) = env::var("SLOTLEASE_SEED_FILE") {
        let path = PathBuf::from(seed);
        let content = tokio::fs::read(&path).await?;
        let ledger = codec::decode(&content, Version::from("seed"))?;
        let key = objstore::object_key(&config.namespace, &config.bucket, &config.object);
        let version = bucket.upload(&key, content.into());
        info!(
            "seeded {} with {} slots from {} (version {})",
            key,
            ledger.len(),
            path.display(),
            version
        );
    }

    let addr: SocketAddr = bind_addr
        .parse()
        .map_err(|e| lease::Error::Config(format!("Invalid bind address {bind_addr}: {e}")))?;
    let listener = TcpListener::bind(&addr).await?;

    info!("API endpoints:");
    info!("  GET /n/{{namespace}}/b/{{bucket}}/o/{{object}} - read object and ETag");
    info!("  PUT /n/{{namespace}}/b/{{bucket}}/o/{{object}} - write object, If-Match optional");

    objstore::serve(listener, bucket).await
}
