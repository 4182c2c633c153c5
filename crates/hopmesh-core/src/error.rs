//! Error types for fallible boundaries.
//!
//! Protocol-internal conditions that the design treats as silently
//! logged-and-dropped (no route, duplicate fragment, out-of-sequence
//! fragment) are deliberately NOT represented here — promoting them to
//! `Result::Err` would contradict the protocol's documented fail-open
//! behavior (see `DESIGN.md`).

use hopmesh_wire::WireError;

/// Errors that can terminate a node task.
#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error("medium connection failed: {0}")]
    Medium(#[from] std::io::Error),

    #[error("malformed frame from medium: {0}")]
    Wire(#[from] WireError),

    #[error("medium closed the connection")]
    MediumClosed,

    #[error("background task was cancelled")]
    Cancelled,

    #[error("--force-id {0} is out of range (expected 1..=31)")]
    InvalidForceId(u8),
}
