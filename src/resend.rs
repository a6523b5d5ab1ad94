//! Batch resend of missed photo messages.
//!
//! One non-looping pass per peer: pull recent history, walk it oldest to
//! newest, and re-deliver every message at or after the threshold that
//! carries at least one photo.

use crate::tg::send::{Destination, MessageSink};
use crate::transform::{self, MediaKind};
use crate::vk::api::VkApi;
use anyhow::Result;
use tracing::{debug, info};

/// Resend recent photo messages of one peer to the destination.
///
/// Returns how many messages were delivered.
///
/// # Errors
///
/// Returns the first history-fetch, transform, or delivery failure; the
/// utility has no per-message recovery.
pub async fn resend_photos_for_peer(
    api: &dyn VkApi,
    sink: &dyn MessageSink,
    access_token: &str,
    peer_id: i64,
    destination: &Destination,
    date_threshold: i64,
    count: u32,
) -> Result<usize> {
    let history = api.fetch_history(access_token, peer_id, count).await?;
    info!(
        peer_id,
        items = history.items.len(),
        "history fetched for resend"
    );

    let mut delivered = 0;
    // VK returns newest first; deliver in chronological order.
    for record in history.items.iter().rev() {
        if record.date < date_threshold {
            continue;
        }

        let message = transform::build(
            api,
            access_token,
            record,
            &history.profiles,
            &history.title,
        )
        .await?;

        if !message
            .media
            .iter()
            .any(|item| item.kind == MediaKind::Photo)
        {
            debug!(message_id = record.id, "no photo attachment; skipped");
            continue;
        }

        sink.deliver(&message, destination).await?;
        delivered += 1;
    }

    Ok(delivered)
}
