//! VK API surface: wire types, error taxonomy, and the HTTP client.

/// VK API client trait and reqwest implementation
pub mod api;
/// Wire types for long-poll responses, events, and message records
pub mod types;

use thiserror::Error;

/// Errors produced by VK API calls.
///
/// `AuthExpired` is a distinguished recoverable condition: the upstream
/// answered with an error payload on a message fetch, signalling that the
/// token/cursor pair went stale and the caller should re-resolve
/// credentials. Transport and parsing failures use the other variants.
#[derive(Debug, Error)]
pub enum VkError {
    /// Cookie rejected or token exchange failed
    #[error("auth error: {0}")]
    Auth(String),
    /// Message fetch answered with an error payload; re-authentication needed
    #[error("session expired: {0}")]
    AuthExpired(String),
    /// VK answered with an error payload on a non-fetch call
    #[error("API error: {0}")]
    Api(String),
    /// Transport-level failure
    #[error("network error: {0}")]
    Network(String),
    /// Malformed or unexpected payload shape
    #[error("JSON error: {0}")]
    Json(String),
}
