//! Exports the metadata of every pod scheduled on one node to a local
//! directory, one JSON file per pod, so that node-local consumers (sidecars,
//! log shippers) can resolve process identity to cluster metadata without
//! talking to the API server themselves.
//!
//! Two cooperating pieces:
//! - [`tracker::PodTracker`] keeps a reconnecting watch on the node's pods
//!   and turns it into a channel of [`PodEvent`]s.
//! - [`writer::PodMetaWriter`] consumes those events, writing a snapshot
//!   file per pod and deleting it a retention period after the pod is gone.

// Third Party
use k8s_openapi::api::core::v1::Pod;

pub mod config;
pub mod tracker;
pub mod utils;
pub mod writer;

/// Durable key for a pod within the cluster. Both fields are non-empty;
/// uniqueness of the pair is guaranteed by the API server.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PodIdentity {
    pub namespace: String,
    pub name: String,
}

/// What happened to a pod on the watch stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PodEventKind {
    Created,
    Updated,
    Removed,
    /// Control traffic that carries no actionable pod. The tracker filters
    /// these out before they reach the channel; the writer still treats the
    /// variant as a no-op.
    Ignore,
}

/// A single pod lifecycle event, carrying the full pod document as observed
/// on the watch stream.
#[derive(Clone, Debug)]
pub struct PodEvent {
    pub identity: PodIdentity,
    pub kind: PodEventKind,
    pub pod: Pod,
}
