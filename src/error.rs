//! Error types for the client core
//!
//! One enum covers every failure class; errors from a single peer or
//! tracker never escape that actor. Only `InvalidMetainfo` is fatal.

use std::fmt;

/// Error type for all torrent operations
#[derive(Debug, Clone)]
pub enum TorrentError {
    /// Bencode, metainfo, or peer frame could not be parsed
    MalformedInput {
        message: String,
        source: Option<String>,
    },

    /// Torrent file failed structural validation
    InvalidMetainfo {
        message: String,
        field: Option<String>,
    },

    /// Disk or network I/O error
    IoFailure {
        message: String,
        path: Option<String>,
        source: Option<String>,
    },

    /// Peer sent something structurally valid but semantically impossible
    ProtocolViolation {
        message: String,
        peer: Option<String>,
    },

    /// A bounded operation ran out of time
    TimeoutExpired {
        message: String,
        resource: Option<String>,
    },
}

impl TorrentError {
    /// Create a new MalformedInput error
    pub fn malformed(message: impl Into<String>) -> Self {
        TorrentError::MalformedInput {
            message: message.into(),
            source: None,
        }
    }

    /// Create a new MalformedInput error with source detail
    pub fn malformed_with_source(message: impl Into<String>, source: impl Into<String>) -> Self {
        TorrentError::MalformedInput {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// Create a new InvalidMetainfo error
    pub fn invalid_metainfo(message: impl Into<String>) -> Self {
        TorrentError::InvalidMetainfo {
            message: message.into(),
            field: None,
        }
    }

    /// Create a new InvalidMetainfo error naming the offending field
    pub fn invalid_metainfo_field(message: impl Into<String>, field: impl Into<String>) -> Self {
        TorrentError::InvalidMetainfo {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Create a new IoFailure error
    pub fn io_failure(message: impl Into<String>) -> Self {
        TorrentError::IoFailure {
            message: message.into(),
            path: None,
            source: None,
        }
    }

    /// Create a new IoFailure error with the affected path
    pub fn io_failure_with_path(message: impl Into<String>, path: impl Into<String>) -> Self {
        TorrentError::IoFailure {
            message: message.into(),
            path: Some(path.into()),
            source: None,
        }
    }

    /// Create a new IoFailure error with path and source
    pub fn io_failure_full(
        message: impl Into<String>,
        path: impl Into<String>,
        source: impl Into<String>,
    ) -> Self {
        TorrentError::IoFailure {
            message: message.into(),
            path: Some(path.into()),
            source: Some(source.into()),
        }
    }

    /// Create a new ProtocolViolation error
    pub fn protocol_violation(message: impl Into<String>) -> Self {
        TorrentError::ProtocolViolation {
            message: message.into(),
            peer: None,
        }
    }

    /// Create a new ProtocolViolation error with the peer address
    pub fn protocol_violation_with_peer(
        message: impl Into<String>,
        peer: impl Into<String>,
    ) -> Self {
        TorrentError::ProtocolViolation {
            message: message.into(),
            peer: Some(peer.into()),
        }
    }

    /// Create a new TimeoutExpired error
    pub fn timeout(message: impl Into<String>) -> Self {
        TorrentError::TimeoutExpired {
            message: message.into(),
            resource: None,
        }
    }

    /// Create a new TimeoutExpired error naming the resource
    pub fn timeout_with_resource(message: impl Into<String>, resource: impl Into<String>) -> Self {
        TorrentError::TimeoutExpired {
            message: message.into(),
            resource: Some(resource.into()),
        }
    }

    /// Whether this error is fatal for the whole client rather than one actor
    pub fn is_fatal(&self) -> bool {
        matches!(self, TorrentError::InvalidMetainfo { .. })
    }
}

impl fmt::Display for TorrentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TorrentError::MalformedInput { message, source } => {
                if let Some(src) = source {
                    write!(f, "Malformed input: {} (source: {})", message, src)
                } else {
                    write!(f, "Malformed input: {}", message)
                }
            }
            TorrentError::InvalidMetainfo { message, field } => {
                if let Some(field_val) = field {
                    write!(f, "Invalid metainfo: {} (field: {})", message, field_val)
                } else {
                    write!(f, "Invalid metainfo: {}", message)
                }
            }
            TorrentError::IoFailure { message, path, source } => match (path, source) {
                (Some(p), Some(s)) => {
                    write!(f, "I/O failure: {} (path: {}, source: {})", message, p, s)
                }
                (Some(p), None) => write!(f, "I/O failure: {} (path: {})", message, p),
                (None, Some(s)) => write!(f, "I/O failure: {} (source: {})", message, s),
                (None, None) => write!(f, "I/O failure: {}", message),
            },
            TorrentError::ProtocolViolation { message, peer } => {
                if let Some(p) = peer {
                    write!(f, "Protocol violation: {} (peer: {})", message, p)
                } else {
                    write!(f, "Protocol violation: {}", message)
                }
            }
            TorrentError::TimeoutExpired { message, resource } => {
                if let Some(r) = resource {
                    write!(f, "Timeout expired: {} (resource: {})", message, r)
                } else {
                    write!(f, "Timeout expired: {}", message)
                }
            }
        }
    }
}

impl std::error::Error for TorrentError {}

impl From<std::io::Error> for TorrentError {
    fn from(err: std::io::Error) -> Self {
        TorrentError::IoFailure {
            message: err.to_string(),
            path: None,
            source: Some(err.kind().to_string()),
        }
    }
}

impl From<serde_bencode::Error> for TorrentError {
    fn from(err: serde_bencode::Error) -> Self {
        TorrentError::malformed_with_source("Failed to parse bencode data", err.to_string())
    }
}

impl From<reqwest::Error> for TorrentError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            TorrentError::timeout_with_resource(
                "Tracker request timed out",
                err.url().map(|u| u.to_string()).unwrap_or_default(),
            )
        } else {
            TorrentError::IoFailure {
                message: "Tracker request failed".to_string(),
                path: err.url().map(|u| u.to_string()),
                source: Some(err.to_string()),
            }
        }
    }
}

impl From<tokio::time::error::Elapsed> for TorrentError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        TorrentError::timeout("Operation timed out")
    }
}
