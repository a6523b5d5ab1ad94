//! VK to Telegram message relay.
//!
//! Long-polls a VK messenger session for new message events, resolves the
//! full message payload out-of-band, and forwards it to a fixed Telegram
//! chat or forum topic. A companion `resend_media` binary resends missed
//! photo messages from recent VK history.

/// Configuration management
pub mod config;
/// Relay loop state machine
pub mod relay;
/// Batch resend of missed photo messages
pub mod resend;
/// Telegram outbound delivery
pub mod tg;
/// Raw VK records to normalized messages
pub mod transform;
/// VK API client
pub mod vk;
