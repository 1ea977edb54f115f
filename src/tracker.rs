// System
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

// Third Party
use futures::{pin_mut, TryStreamExt};
use k8s_openapi::api::core::v1::Pod;
use kube::{
    api::{Api, WatchEvent, WatchParams},
    Client,
};
use rand::Rng;
use tokio::sync::mpsc;
use tokio::time::{self, Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

// Local
use crate::{PodEvent, PodEventKind, PodIdentity};

const NODE_NAME_FIELD: &str = "spec.nodeName";

/// HTTP status the API server uses for an expired watch resource version.
const RESOURCE_EXPIRED: u16 = 410;

/// Bounded exponential backoff applied between failed watch connection
/// attempts. The delay doubles up to `max_delay` with up to `jitter_millis`
/// of random jitter added, and the session gives up after `max_retries`
/// consecutive failures. Both the delay and the retry budget are reset once
/// a watch connects.
#[derive(Clone, Copy, Debug)]
pub struct WatchBackoff {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub jitter_millis: u64,
    pub max_retries: u32,
}

impl Default for WatchBackoff {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            jitter_millis: 500,
            max_retries: 30,
        }
    }
}

/// Tracks pod lifecycle events on a single node through a long-lived watch
/// on the API server, repairing the watch when it breaks.
///
/// A tracker supports at most one active session at a time: the worker it
/// spawns is the only writer to the event channel, and the session lock is
/// released only when that worker has fully terminated.
pub struct PodTracker {
    client: Client,
    backoff: WatchBackoff,
    running: Arc<AtomicBool>,
}

impl PodTracker {
    pub fn new(client: &Client) -> Self {
        Self::with_backoff(client, WatchBackoff::default())
    }

    pub fn with_backoff(client: &Client, backoff: WatchBackoff) -> Self {
        Self {
            client: client.clone(),
            backoff,
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Starts tracking pod events on the specified node.
    ///
    /// Returns a channel of [`PodEvent`]s that stays open until `shutdown`
    /// is cancelled or the watch fails in a way the reconnection loop
    /// cannot absorb. A closed channel means no further events will ever
    /// arrive; the distinction between the two causes is the caller's to
    /// make by checking `shutdown`. Fails if a session is already active.
    pub fn track_pods(
        &self,
        shutdown: CancellationToken,
        node: &str,
    ) -> Result<mpsc::Receiver<PodEvent>, anyhow::Error> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(anyhow::Error::msg("already tracking pods"));
        }

        // Capacity 1 keeps the handoff close to a rendezvous: a slow
        // consumer stalls the watch-read loop instead of buffering events.
        let (events, receiver) = mpsc::channel(1);
        let client = self.client.clone();
        let backoff = self.backoff;
        let running = Arc::clone(&self.running);
        let node = node.to_string();

        tokio::spawn(async move {
            watch_worker(client, backoff, &shutdown, &node, &events).await;
            // Release the session lock before the sender drop closes the
            // channel, so observing a closed channel implies the tracker
            // can be started again.
            running.store(false, Ordering::SeqCst);
            drop(events);
        });

        Ok(receiver)
    }
}

/// The reconnection loop: opens a watch scoped to the node, streams items
/// from it, and reopens it on recoverable failures until cancelled or a
/// fatal condition is hit.
async fn watch_worker(
    client: Client,
    backoff: WatchBackoff,
    shutdown: &CancellationToken,
    node: &str,
    events: &mpsc::Sender<PodEvent>,
) {
    let pods: Api<Pod> = Api::all(client);
    let params = WatchParams::default().fields(&format!("{}={}", NODE_NAME_FIELD, node));
    let mut delay = backoff.initial_delay;
    let mut retries = 0;

    'reconnect: loop {
        let watch_result = tokio::select! {
            _ = shutdown.cancelled() => break 'reconnect,
            // Resource version "0" makes the API server deliver initial
            // ADDED events for pods already running on the node.
            result = pods.watch(&params, "0") => result,
        };
        let stream = match watch_result {
            Ok(stream) => stream,
            Err(error) if is_retryable(&error) => {
                warn!("Error opening pod watch: {}", error);
                if retries >= backoff.max_retries {
                    error!("Giving up on pod watch after {} failed attempts", retries);
                    break 'reconnect;
                }
                retries += 1;
                let sleep_for = delay + jitter(backoff.jitter_millis);
                debug!("Retrying pod watch in {:?}...", sleep_for);
                tokio::select! {
                    _ = shutdown.cancelled() => break 'reconnect,
                    _ = time::sleep(sleep_for) => {}
                }
                delay = std::cmp::min(delay * 2, backoff.max_delay);
                continue 'reconnect;
            }
            Err(error) => {
                error!("Error opening pod watch: {}", error);
                break 'reconnect;
            }
        };
        pin_mut!(stream);
        // Successfully connected, so reset the delay and retry budget
        delay = backoff.initial_delay;
        retries = 0;
        info!("Watching pods on node {}...", node);

        loop {
            let item = tokio::select! {
                _ = shutdown.cancelled() => break 'reconnect,
                item = stream.try_next() => item,
            };
            match item {
                Ok(Some(WatchEvent::Added(pod))) => {
                    if !forward(shutdown, events, PodEventKind::Created, pod).await {
                        break 'reconnect;
                    }
                }
                Ok(Some(WatchEvent::Modified(pod))) => {
                    if !forward(shutdown, events, PodEventKind::Updated, pod).await {
                        break 'reconnect;
                    }
                }
                Ok(Some(WatchEvent::Deleted(pod))) => {
                    if !forward(shutdown, events, PodEventKind::Removed, pod).await {
                        break 'reconnect;
                    }
                }
                // Bookmarks only advance the stream, they are never
                // forwarded as lifecycle events.
                Ok(Some(WatchEvent::Bookmark(_))) => {}
                Ok(Some(WatchEvent::Error(response))) if response.code == RESOURCE_EXPIRED => {
                    warn!("Pod watch expired, reopening: {}", response.message);
                    continue 'reconnect;
                }
                Ok(Some(WatchEvent::Error(response))) => {
                    error!("Error event received from pod watch: {:?}", response);
                    break 'reconnect;
                }
                // The server ended the watch, e.g. its timeout elapsed.
                Ok(None) => continue 'reconnect,
                Err(error @ kube::Error::SerdeError(_)) => {
                    warn!("Discarding watch item of unexpected shape: {}", error);
                }
                Err(error) if is_retryable(&error) => {
                    warn!("Error while watching pods, reopening: {}", error);
                    continue 'reconnect;
                }
                Err(error) => {
                    error!("Error while watching pods: {}", error);
                    break 'reconnect;
                }
            }
        }
    }
}

/// Hands one event to the consumer. Returns `false` when the session should
/// end because the consumer is gone or shutdown was requested.
async fn forward(
    shutdown: &CancellationToken,
    events: &mpsc::Sender<PodEvent>,
    kind: PodEventKind,
    pod: Pod,
) -> bool {
    let identity = match identity_of(&pod) {
        Some(identity) => identity,
        None => {
            warn!("Discarding pod event without namespace/name metadata");
            return true;
        }
    };
    let event = PodEvent {
        identity,
        kind,
        pod,
    };
    tokio::select! {
        _ = shutdown.cancelled() => false,
        sent = events.send(event) => sent.is_ok(),
    }
}

fn identity_of(pod: &Pod) -> Option<PodIdentity> {
    let namespace = pod.metadata.namespace.clone()?;
    let name = pod.metadata.name.clone()?;
    if namespace.is_empty() || name.is_empty() {
        return None;
    }
    Some(PodIdentity { namespace, name })
}

/// Conditions the reconnection loop absorbs: transport-level failures and
/// an expired resource version. Everything else ends the session.
fn is_retryable(error: &kube::Error) -> bool {
    match error {
        kube::Error::HyperError(_) | kube::Error::Service(_) => true,
        kube::Error::Api(response) => response.code == RESOURCE_EXPIRED,
        _ => false,
    }
}

fn jitter(max_millis: u64) -> Duration {
    Duration::from_millis(rand::thread_rng().gen_range(0..=max_millis))
}
