use std::io;
use std::path::PathBuf;
use thiserror::Error;

use crate::units::NodeId;

/// Errors raised while setting up a run. Every one of them is fatal and is
/// reported before simulated time advances.
#[derive(Debug, Error)]
pub enum SetupError {
    // Configuration errors
    #[error("Protocol '{0}' is not supported")]
    UnsupportedProtocol(String),

    #[error("invalid data rate '{value}': {reason}")]
    InvalidDataRate { value: String, reason: String },

    #[error("error rate {0} must lie within [0, 1]")]
    InvalidErrorRate(f64),

    #[error("adaptation algorithm name '{0}' cannot be used as a directory name")]
    InvalidAlgorithmName(String),

    #[error("unknown adaptation algorithm '{0}'. Try 'festive', 'panda' or 'tobasco'.")]
    UnknownAlgorithm(String),

    #[error("malformed segment size table {path}: {reason}")]
    SegmentTable { path: PathBuf, reason: String },

    #[error("subnet {base}/{mask} cannot hold {needed} hosts")]
    SubnetTooSmall {
        base: String,
        mask: String,
        needed: usize,
    },

    #[error("no transport stack installed on node {0}")]
    StackNotInstalled(NodeId),

    #[error("node {0} already hosts an application")]
    NodeOccupied(NodeId),

    // Resource errors
    #[error("failed to create artifact directory {path}")]
    ArtifactDirectory {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to open packet capture {path}")]
    Capture {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to write {path}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to read {path}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl SetupError {
    /// True for errors caused by the filesystem rather than by the supplied parameters.
    pub fn is_resource_error(&self) -> bool {
        matches!(
            self,
            SetupError::ArtifactDirectory { .. }
                | SetupError::Capture { .. }
                | SetupError::Write { .. }
                | SetupError::Read { .. }
        )
    }
}

/// Errors an application can observe from its node's transport stack.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("node has no address assigned")]
    NoAddress,
    #[error("a connection already exists on this node")]
    AlreadyConnected,
    #[error("no open connection")]
    NotConnected,
}
