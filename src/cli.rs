use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{ArgAction, Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "slotlease", version, about, long_about = None)]
pub struct Cli {
    /// JSON config file (SLOTLEASE_* env vars still apply on top)
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Object storage endpoint, overrides config and env
    #[arg(long, value_name = "URL")]
    pub endpoint: Option<String>,

    /// Verbose mode (-v, -vv, -vvv)
    #[arg(short, action = ArgAction::Count)]
    pub verbosity: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand, PartialEq, Eq)]
pub enum Commands {
    /// Prints every slot in the ledger
    #[command(alias = "ls")]
    List,
    /// Acquires a lease on a free or expired slot
    /// Exits with status 2 when no lease is available
    Acquire {
        /// Tenant the lease is recorded for
        #[arg(short, long)]
        tenant: String,
        /// Build number to correlate the lease with
        #[arg(short, long, default_value_t = 0)]
        build_number: u64,
        /// Give up after this many seconds, retries included
        #[arg(long, value_name = "SECS")]
        timeout: Option<u64>,
    },
    /// Runs a local object store holding the ledger
    Serve {
        #[arg(long, default_value = "127.0.0.1:7070")]
        bind: SocketAddr,
        /// Ledger file to provision before serving
        #[arg(long, value_name = "FILE")]
        seed: Option<PathBuf>,
    },
}

impl Cli {
    /// Log filter matching the `-v` count.
    pub fn log_level(&self) -> &'static str {
        match self.verbosity {
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        }
    }
}
