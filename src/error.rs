//! Per-subsystem error families. Callers match on these to decide
//! recovery strategy; command-level code uses `anyhow::Result` for ad-hoc
//! context chains.

use thiserror::Error;

// ─── Job store errors ────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum StoreError {
    /// Malformed or conflicting job fields, rejected before persistence.
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("job '{0}' already exists")]
    DuplicateId(String),

    #[error("job '{0}' not found")]
    NotFound(String),

    /// Expected concurrency collision; callers skip, never crash.
    #[error("job '{0}' is already running")]
    AlreadyRunning(String),

    /// Durable storage unreadable or unwritable. Fatal at startup,
    /// logged at runtime mutation.
    #[error("persistence: {0}")]
    Persistence(String),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

// ─── Output delivery errors ──────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum DeliveryError {
    /// Chat destination requested but the gateway is disabled or has no
    /// bot token. Sibling destinations are still attempted.
    #[error("gateway unavailable: {0}")]
    GatewayUnavailable(String),

    #[error("send failed: {0}")]
    Send(String),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}
