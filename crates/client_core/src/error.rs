use std::time::Duration;

use shared::error::{CommandError, InvalidEntityId};
use thiserror::Error;

/// Transport-level failures surfaced by a [`Session`](crate::Session).
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("websocket transport failure: {0}")]
    Transport(String),
    #[error("authentication rejected: {0}")]
    AuthRejected(String),
    #[error("command failed: {0}")]
    CommandFailed(CommandError),
    #[error("connection lost before a response arrived")]
    ConnectionLost,
    #[error("session has no live connection")]
    NotConnected,
    #[error("session is closed")]
    Closed,
    #[error("no response within {0:?}")]
    Timeout(Duration),
    #[error("malformed server payload: {0}")]
    Protocol(String),
}

/// Failures that abort controller setup. Setup failures are caller-visible
/// and terminal for that connection attempt; retry is driven externally.
#[derive(Debug, Error)]
pub enum SetupError {
    #[error(transparent)]
    InvalidEntityId(#[from] InvalidEntityId),
    #[error("missing or empty credentials")]
    MissingCredentials,
    #[error("invalid server url {url:?}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("bulk state fetch returned a non-list payload")]
    MalformedStateList,
    #[error(transparent)]
    Session(#[from] SessionError),
}

/// Outcome of one rate-limited attempt, delivered to the limiter's error
/// callback and never to the caller of `call`.
#[derive(Debug, Error)]
pub enum CallError {
    #[error("call timed out after {0:?}")]
    Timeout(Duration),
    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}
