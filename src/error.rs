//! Runtime error kinds.
//!
//! Every job cycle returns [`Result`]. Errors are caught at the cycle
//! boundary and folded into the job's [`JobState`](crate::job::JobState);
//! only [`Error::is_fatal`] errors travel further than the orchestrator's
//! dispatch loop.
//!
//! | Variant | Recoverable | Raised by |
//! |---------|-------------|-----------|
//! | `Config` | no | startup |
//! | `Capture` | yes | capture backends |
//! | `QueueOverflow` | yes | [`HandoffQueue::push`](crate::queue::HandoffQueue::push) |
//! | `EmptyQueue` | yes | [`HandoffQueue::pop`](crate::queue::HandoffQueue::pop) |
//! | `Archive` | yes | local archive job |
//! | `Upload` | yes | remote stores, upload job |
//! | `Network` | yes | control transports |
//! | `Auth` | yes | push transport handshake |
//! | `Command` | yes | command parsing |
//! | `Invariant` | no | corrupted shared state |
//! | `Cancelled` | n/a | cooperative shutdown checkpoints |

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Error types
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid configuration, fatal at startup
    #[error("Config error: {0}")]
    Config(String),

    /// Image acquisition failed, regardless of backend
    #[error("Capture error: {0}")]
    Capture(String),

    /// Queue full and the overflow policy rejected the artifact
    #[error("Queue overflow: {0}")]
    QueueOverflow(String),

    /// Nothing queued for this consumer
    #[error("Queue is empty")]
    EmptyQueue,

    /// Local archive bookkeeping failed
    #[error("Archive error: {0}")]
    Archive(String),

    /// Remote storage rejected or did not complete an upload
    #[error("Upload error: {0}")]
    Upload(String),

    /// Control transport unreachable or misbehaving
    #[error("Network error: {0}")]
    Network(String),

    /// Push transport handshake rejected
    #[error("Auth error: {0}")]
    Auth(String),

    /// Remote command string could not be parsed
    #[error("Invalid command: {0}")]
    Command(String),

    /// Shared state is corrupted
    #[error("Invariant violated: {0}")]
    Invariant(String),

    /// Cycle abandoned at a cancellation checkpoint
    #[error("Cancelled by shutdown")]
    Cancelled,

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// HTTP client error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl Error {
    /// Fatal errors terminate the process after a clean shutdown attempt.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Config(_) | Error::Invariant(_))
    }

    /// Short machine-readable kind, used in logs and status payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Config(_) => "config",
            Error::Capture(_) => "capture",
            Error::QueueOverflow(_) => "queue_overflow",
            Error::EmptyQueue => "empty_queue",
            Error::Archive(_) => "archive",
            Error::Upload(_) => "upload",
            Error::Network(_) | Error::Http(_) => "network",
            Error::Auth(_) => "auth",
            Error::Command(_) => "command",
            Error::Invariant(_) => "invariant",
            Error::Cancelled => "cancelled",
            Error::Io(_) => "io",
            Error::Serialization(_) => "serialization",
        }
    }
}
