// Third Party
use anyhow::bail;
use clap::Parser;
use kube::Client;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

// Local
use pod_meta_exporter::{
    config::Config, tracker::PodTracker, utils::init_tracing, writer::PodMetaWriter,
};

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    init_tracing();
    let config = Config::parse();
    let node_name = config.node_name()?;
    info!(
        "Running with config: node = {}, retention = {:?}, directory = {}",
        node_name,
        config.retention(),
        config.destination_dir.display()
    );

    let client = Client::try_default().await?;
    let tracker = PodTracker::new(&client);
    let mut writer = PodMetaWriter::new(config.destination_dir.clone(), config.retention());

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Caught interrupt, shutting down...");
                shutdown.cancel();
            }
        }
    });

    let mut events = tracker.track_pods(shutdown.clone(), &node_name)?;
    while let Some(event) = events.recv().await {
        writer.handle(event).await?;
    }

    // A closed stream without a shutdown request means the tracker hit a
    // condition its reconnection loop could not absorb.
    if !shutdown.is_cancelled() {
        bail!("pod event stream closed unexpectedly");
    }
    Ok(())
}
