//! Telegram side of the relay.

/// Outbound message delivery
pub mod send;
