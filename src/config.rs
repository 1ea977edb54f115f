// System
use std::path::PathBuf;
use std::time::Duration;

// Third Party
use anyhow::Context;
use clap::Parser;

/// Configuration for the exporter binary, taken from command line flags
/// with `EXPORTER_`-prefixed environment variables as fallback. The core
/// components receive these as plain values and do no parsing of their own.
#[derive(Debug, Parser)]
#[command(name = "pod-meta-exporter")]
pub struct Config {
    /// The name of the node to track pods on. Defaults to the local
    /// hostname.
    #[arg(long, env = "EXPORTER_NODE_NAME")]
    node_name: Option<String>,

    /// How long to keep a metadata file after its pod was deleted, in
    /// seconds.
    #[arg(long, env = "EXPORTER_RETENTION_SECONDS", default_value_t = 60)]
    retention_seconds: u64,

    /// The directory to put metadata files in.
    #[arg(long, env = "EXPORTER_DESTINATION_DIR", default_value = "/var/kube_meta")]
    pub destination_dir: PathBuf,
}

impl Config {
    pub fn node_name(&self) -> Result<String, anyhow::Error> {
        match &self.node_name {
            Some(name) => Ok(name.clone()),
            None => default_node_name(),
        }
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_seconds)
    }
}

fn default_node_name() -> Result<String, anyhow::Error> {
    hostname::get()
        .context("error resolving local hostname")?
        .into_string()
        .map_err(|_| anyhow::Error::msg("local hostname is not valid UTF-8"))
}
