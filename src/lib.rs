use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use lease::{
    codec, config::Config, objstore, AcquireOutcome, LeaseCoordinator, Ledger, ObjectBucket, Version,
};
use tokio::net::TcpListener;
use tracing::info;

mod cli;
pub use cli::{Cli, Commands};

pub const EXIT_OK: u8 = 0;

/// Exit status when every slot is held and none has expired.
pub const EXIT_NO_CAPACITY: u8 = 2;

/// Resolve configuration: file (or defaults), then env, then flags.
pub fn load_config(cli: &Cli) -> Result<Config> {
    load_config_with(cli, |key| std::env::var(key).ok())
}

/// [`load_config`] with env lookups going through `lookup`.
pub fn load_config_with<F>(cli: &Cli, lookup: F) -> Result<Config>
where
    F: Fn(&str) -> Option<String>,
{
    let base = match &cli.config {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("could not load config {}", path.display()))?,
        None => Config::default(),
    };
    let mut config = base.with_overrides(lookup)?;
    if let Some(endpoint) = &cli.endpoint {
        config.endpoint.clone_from(endpoint);
    }
    Ok(config)
}

/// Run one command and return the process exit status.
pub async fn run(cli: Cli) -> Result<u8> {
    let config = load_config(&cli)?;
    run_with_config(cli.command, &config).await
}

/// Run `command` against an already resolved configuration.
pub async fn run_with_config(command: Commands, config: &Config) -> Result<u8> {
    match command {
        Commands::List => {
            let coordinator = config.coordinator()?;
            list(&coordinator).await?;
            Ok(EXIT_OK)
        }
        Commands::Acquire {
            tenant,
            build_number,
            timeout,
        } => {
            let coordinator = config.coordinator()?;
            let outcome = match timeout {
                Some(secs) => {
                    coordinator
                        .acquire_within(Duration::from_secs(secs), &tenant, build_number)
                        .await?
                }
                None => coordinator.acquire(&tenant, build_number).await?,
            };
            Ok(report(&outcome))
        }
        Commands::Serve { bind, seed } => {
            let bucket = Arc::new(ObjectBucket::new());
            if let Some(path) = seed {
                let content = tokio::fs::read(&path)
                    .await
                    .with_context(|| format!("could not read {}", path.display()))?;
                let ledger = codec::decode(&content, Version::from("seed"))?;
                let key = objstore::object_key(&config.namespace, &config.bucket, &config.object);
                bucket.upload(&key, content.into());
                info!("seeded {} with {} slots", key, ledger.len());
            }
            let listener = TcpListener::bind(bind)
                .await
                .with_context(|| format!("could not bind {bind}"))?;
            objstore::serve(listener, bucket).await?;
            Ok(EXIT_OK)
        }
    }
}

async fn list(coordinator: &LeaseCoordinator) -> Result<()> {
    let ledger = coordinator.ledger().await?;
    print!("{}", render_listing(&ledger));
    Ok(())
}

/// Text printed by `list`.
pub fn render_listing(ledger: &Ledger) -> String {
    let mut out = format!(
        "Current leases ({} slots, {} vacant, version {}):\n",
        ledger.len(),
        ledger.vacancies(),
        ledger.version()
    );
    for slot in ledger.slots() {
        out.push_str(&format!("  {slot}\n"));
    }
    out
}

fn report(outcome: &AcquireOutcome) -> u8 {
    match outcome {
        AcquireOutcome::Granted(granted) => {
            println!("{}", granted.slot);
            println!("instance: {}", granted.instance_name());
            if let Some(evicted) = &granted.evicted {
                println!("evicted expired lease held by {evicted}");
            }
            EXIT_OK
        }
        AcquireOutcome::Exhausted => {
            println!("no lease available");
            EXIT_NO_CAPACITY
        }
    }
}
