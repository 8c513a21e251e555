//! Error taxonomy for the indexing pipeline
//!
//! Node-facing failures are typed so the fetch layer can route them
//! through the fallback ladder (repin, per-tx fallback, raw-wire
//! fallback). Everything else propagates as a boxed error.

use thiserror::Error;

/// Boxed error used for generic plumbing (repository calls, processor
/// runs, service loops).
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// gRPC-style status codes surfaced by the access node transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpcStatusCode {
    NotFound,
    Unimplemented,
    ResourceExhausted,
    Internal,
    Unavailable,
    DeadlineExceeded,
    Unknown,
}

impl RpcStatusCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RpcStatusCode::NotFound => "NOT_FOUND",
            RpcStatusCode::Unimplemented => "UNIMPLEMENTED",
            RpcStatusCode::ResourceExhausted => "RESOURCE_EXHAUSTED",
            RpcStatusCode::Internal => "INTERNAL",
            RpcStatusCode::Unavailable => "UNAVAILABLE",
            RpcStatusCode::DeadlineExceeded => "DEADLINE_EXCEEDED",
            RpcStatusCode::Unknown => "UNKNOWN",
        }
    }
}

/// Errors produced by `NodeClient` operations.
#[derive(Debug, Error)]
pub enum NodeError {
    /// The pinned node cannot be reached or refused the connection.
    #[error("node {node_index} unavailable: {message}")]
    NodeUnavailable { node_index: usize, message: String },

    /// The node is rate-limiting us; back off and repin.
    #[error("node {node} exhausted")]
    NodeExhausted { node: String },

    /// The node reported that the requested height is below its spork
    /// root. Carries the root height when the remote includes it.
    #[error("spork root not found on {node} (root height {root_height:?})")]
    SporkRootNotFound {
        node: String,
        root_height: Option<u64>,
    },

    /// No node in the pool can serve the requested height.
    #[error("no suitable node for height {height}")]
    NoSuitableNode { height: u64 },

    /// Transport-level failure, optionally carrying a gRPC status code.
    #[error("transport error ({code:?}): {message}")]
    Transport {
        code: Option<RpcStatusCode>,
        message: String,
    },

    /// Payload decode failure (CCF / JSON-CDC / SDK codec).
    #[error("decode error: {message}")]
    Decode { message: String },

    /// Operation was cancelled via the cooperative token.
    #[error("operation cancelled")]
    Cancelled,
}

impl NodeError {
    pub fn transport(code: Option<RpcStatusCode>, message: impl Into<String>) -> Self {
        NodeError::Transport {
            code,
            message: message.into(),
        }
    }

    pub fn decode(message: impl Into<String>) -> Self {
        NodeError::Decode {
            message: message.into(),
        }
    }

    /// Status code carried by transport errors, if any.
    pub fn status_code(&self) -> Option<RpcStatusCode> {
        match self {
            NodeError::Transport { code, .. } => *code,
            _ => None,
        }
    }

    pub fn is_unimplemented(&self) -> bool {
        self.status_code() == Some(RpcStatusCode::Unimplemented)
    }

    pub fn is_not_found(&self) -> bool {
        self.status_code() == Some(RpcStatusCode::NotFound)
    }

    pub fn is_resource_exhausted(&self) -> bool {
        matches!(self, NodeError::NodeExhausted { .. })
            || self.status_code() == Some(RpcStatusCode::ResourceExhausted)
    }

    /// True when the message clearly indicates a spork boundary: either
    /// the "spork root block height N" literal or the pruned-block
    /// signature ("failed to get block" + "key not found").
    pub fn indicates_spork_boundary(&self) -> bool {
        if matches!(self, NodeError::SporkRootNotFound { .. }) {
            return true;
        }
        let msg = self.to_string();
        msg.contains("spork root block height")
            || (msg.contains("failed to get block") && msg.contains("key not found"))
    }

    /// Extract the spork root height from the error, either from the
    /// typed variant or from the "spork root block height N" literal.
    pub fn spork_root_height(&self) -> Option<u64> {
        if let NodeError::SporkRootNotFound { root_height, .. } = self {
            return *root_height;
        }
        parse_spork_root_height(&self.to_string())
    }
}

/// Parse "spork root block height N" out of an error message.
pub fn parse_spork_root_height(message: &str) -> Option<u64> {
    let marker = "spork root block height";
    let idx = message.find(marker)?;
    let rest = &message[idx + marker.len()..];
    let digits: String = rest
        .trim_start()
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse().ok()
}

/// Kinds recorded in the indexing error log. The repair loop keys off
/// these to decide what to rerun.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexingErrorKind {
    ProcessError,
    LiveDeriverError,
    LiveDeriverSkipped,
    FetchWarning,
    IngestWarning,
}

impl IndexingErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            IndexingErrorKind::ProcessError => "PROCESS_ERROR",
            IndexingErrorKind::LiveDeriverError => "LIVE_DERIVER_ERROR",
            IndexingErrorKind::LiveDeriverSkipped => "LIVE_DERIVER_SKIPPED",
            IndexingErrorKind::FetchWarning => "FETCH_WARNING",
            IndexingErrorKind::IngestWarning => "INGEST_WARNING",
        }
    }
}

impl std::fmt::Display for IndexingErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
