//! Error taxonomy for the collection pipeline.
//!
//! Everything except [`LoopError`] is per-event: it is logged where it happens
//! and the drain moves on to the next record.

use thiserror::Error;

/// A ring buffer record could not be turned into an event.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("event too short: {size} bytes, need {expected}")]
    Truncated { size: usize, expected: usize },
}

impl DecodeError {
    pub fn kind(&self) -> &'static str {
        "malformed_event"
    }
}

/// cgroup id could not be mapped to a container identity.
#[derive(Error, Debug)]
pub enum ResolveError {
    #[error("no container identity for cgroup {cgroup_id}")]
    NotFound { cgroup_id: u64 },

    #[error("identity lookup for cgroup {cgroup_id} failed: {cause:#}")]
    Lookup {
        cgroup_id: u64,
        cause: anyhow::Error,
    },
}

impl ResolveError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "identity_not_found",
            Self::Lookup { .. } => "lookup_error",
        }
    }

    pub fn cgroup_id(&self) -> u64 {
        match self {
            Self::NotFound { cgroup_id } | Self::Lookup { cgroup_id, .. } => *cgroup_id,
        }
    }
}

/// The metric sink rejected a point or did not answer in time.
#[derive(Error, Debug)]
#[error("publishing {metric_type} failed: {cause:#}")]
pub struct PublishError {
    pub metric_type: String,
    pub cause: anyhow::Error,
}

impl PublishError {
    pub fn kind(&self) -> &'static str {
        "publish_error"
    }
}

/// Reading from the event channel did not yield a record.
#[derive(Error, Debug)]
pub enum ChannelError {
    /// The producer went away. Normal end of stream.
    #[error("event channel closed")]
    Closed,

    /// The channel is unusable for a reason other than closure.
    #[error("event channel failed: {0:#}")]
    Failed(anyhow::Error),
}

/// Fatal outcome of a collection loop.
#[derive(Error, Debug)]
pub enum LoopError {
    #[error("collection loop aborted: {0}")]
    Channel(#[from] ChannelError),

    #[error("collection task did not complete: {0}")]
    Join(#[from] tokio::task::JoinError),
}
