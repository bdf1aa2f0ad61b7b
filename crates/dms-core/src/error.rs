use thiserror::Error;

#[derive(Debug, Error)]
pub enum DmsError {
    #[error("invalid configuration: {0}")]
    Configuration(String),

    #[error("cannot read history: {0}")]
    HistoryRead(String),

    #[error("corrupt state marker in commit {commit}: {reason}")]
    CorruptMarker { commit: String, reason: String },

    #[error("history changed since it was read (expected head {expected}, found {found})")]
    HistoryConflict { expected: String, found: String },

    #[error("git {command} failed: {stderr}")]
    Git { command: String, stderr: String },

    #[error("git binary not found on PATH")]
    GitNotInstalled,

    #[error("template {path}: {reason}")]
    Template { path: String, reason: String },

    #[error("delivery to {recipient} failed: {reason}")]
    Delivery { recipient: String, reason: String },

    #[error("{failed} of {attempted} deliveries failed; state marker withheld so the batch is retried")]
    DeliveryIncomplete { failed: usize, attempted: usize },

    #[error("mail setup: {0}")]
    MailSetup(String),

    #[error("no messages rendered for {0}; state marker withheld")]
    NothingToSend(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl DmsError {
    /// Per-item failures are logged and skipped; everything else aborts the run.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, DmsError::Template { .. } | DmsError::Delivery { .. })
    }
}

pub type Result<T> = std::result::Result<T, DmsError>;
