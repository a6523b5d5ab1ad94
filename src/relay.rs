//! The long-poll relay cycle.
//!
//! One stateful loop owns the VK session (token + cursors), detects session
//! invalidation on either cursor space, transparently re-authenticates, and
//! forwards exactly one outbound message per inbound event. Nothing
//! propagates past an iteration boundary: every failure is logged, reported
//! to the destination, and the loop moves on with whatever cursor state was
//! last assigned.

use crate::tg::send::{Destination, MessageSink};
use crate::transform;
use crate::vk::api::VkApi;
use crate::vk::types::{Credentials, MessageBatch, RawEvent};
use crate::vk::VkError;
use anyhow::Result;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Pause between long-poll requests, bounding the request rate.
pub const POLL_PAUSE: Duration = Duration::from_millis(200);

/// Long-poll session position.
///
/// `server`/`key`/`ts` authenticate and position the long-poll stream;
/// `pts` positions the separate message-history stream. `ts` only moves
/// forward from server-acknowledged values; `pts` advances by one per
/// processed event unless the server reports `new_pts`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionCursor {
    /// Long-poll server host
    pub server: String,
    /// Long-poll session key
    pub key: String,
    /// Event stream position
    pub ts: i64,
    /// History stream position
    pub pts: i64,
}

/// The relay's whole mutable state: one token, one cursor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    /// Reusable VK access token
    pub access_token: String,
    /// Long-poll and history positions
    pub cursor: SessionCursor,
}

impl Session {
    /// Build the initial session from freshly resolved credentials.
    #[must_use]
    pub fn from_credentials(credentials: Credentials) -> Self {
        let pts = credentials.pts.unwrap_or_default();
        Self {
            access_token: credentials.access_token,
            cursor: SessionCursor {
                server: credentials.server,
                key: credentials.key,
                ts: credentials.ts,
                pts,
            },
        }
    }

    /// Overwrite the token and the `ts`/`key` pair from fresh credentials.
    ///
    /// `server` and `pts` are untouched: re-authentication repositions the
    /// event stream, not the history stream, and the poll URL stays valid.
    fn absorb(&mut self, credentials: Credentials) {
        self.access_token = credentials.access_token;
        self.cursor.key = credentials.key;
        self.cursor.ts = credentials.ts;
    }
}

/// What one iteration did, logged by the outer loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IterationOutcome {
    /// No updates in the poll response
    Idle,
    /// First update carried a tag the relay does not act on
    Ignored {
        /// The unrecognized event tag
        tag: i64,
    },
    /// Event originated outside the allow-list; history cursor advanced
    Filtered {
        /// The filtered chat
        peer_id: i64,
    },
    /// One message delivered to the destination
    Delivered {
        /// The relayed chat
        peer_id: i64,
    },
    /// Fetch failed even after re-authentication; event dropped
    Dropped {
        /// The chat whose event was dropped
        peer_id: i64,
    },
}

/// The relay loop: owns the session and orchestrates poll, fetch,
/// transform, and delivery.
pub struct RelayLoop {
    vk: Arc<dyn VkApi>,
    sink: Arc<dyn MessageSink>,
    cookie: String,
    allowed_chats: HashSet<i64>,
    destination: Destination,
    session: Session,
}

impl RelayLoop {
    /// Assemble a loop around an established session.
    #[must_use]
    pub fn new(
        vk: Arc<dyn VkApi>,
        sink: Arc<dyn MessageSink>,
        cookie: String,
        allowed_chats: HashSet<i64>,
        destination: Destination,
        session: Session,
    ) -> Self {
        Self {
            vk,
            sink,
            cookie,
            allowed_chats,
            destination,
            session,
        }
    }

    /// Current session state, for inspection.
    #[must_use]
    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Run until the process is stopped externally.
    pub async fn run(&mut self) {
        info!(
            chat_id = self.destination.chat_id,
            allowed = self.allowed_chats.len(),
            "relay loop started"
        );
        loop {
            self.run_once().await;
        }
    }

    /// One guarded cycle: pause, iterate, absorb any failure.
    ///
    /// This is the iteration boundary: errors are logged, the destination
    /// is notified, and the cursor keeps whatever was last assigned.
    pub async fn run_once(&mut self) {
        tokio::time::sleep(POLL_PAUSE).await;
        match self.run_iteration().await {
            Ok(outcome) => log_outcome(&outcome),
            Err(error) => {
                error!(error = %error, "relay iteration failed");
                if let Err(notice_error) = self.sink.notify_failure(&self.destination).await {
                    warn!(error = %notice_error, "failure notice could not be delivered");
                }
            }
        }
    }

    /// One unguarded iteration of the relay cycle.
    ///
    /// # Errors
    ///
    /// Returns any transport/parse/delivery failure; the caller owns the
    /// iteration boundary.
    pub async fn run_iteration(&mut self) -> Result<IterationOutcome> {
        let cursor = &self.session.cursor;
        let response = self
            .vk
            .long_poll(&cursor.server, &cursor.key, cursor.ts)
            .await?;

        let mut outcome = IterationOutcome::Idle;
        if let Some(first) = response.updates.first() {
            if let Some(ts) = response.ts {
                self.session.cursor.ts = ts;
            }
            if response.updates.len() > 1 {
                // Only the first update is drained per cycle; the rest are
                // re-delivered by the server at the advanced ts.
                debug!(
                    count = response.updates.len(),
                    "long-poll batched extra updates"
                );
            }
            let event = RawEvent::parse(first)?;
            outcome = self.handle_event(event).await?;
        }

        // Checked independently of update handling: either cursor space can
        // go stale on its own.
        match response.failed {
            Some(1) => {
                if let Some(ts) = response.ts {
                    self.session.cursor.ts = ts;
                }
                debug!("long-poll window lost; ts resynced");
            }
            Some(2) => {
                warn!("long-poll session invalidated; re-resolving credentials");
                self.refresh_session().await?;
            }
            Some(code) => warn!(code, "unexpected failed code in long-poll response"),
            None => {}
        }

        Ok(outcome)
    }

    async fn handle_event(&mut self, event: RawEvent) -> Result<IterationOutcome> {
        match event {
            RawEvent::Ignored { tag } => Ok(IterationOutcome::Ignored { tag }),
            RawEvent::NewMessage {
                message_id,
                peer_id,
                ..
            } => {
                info!(peer_id, message_id, "new message event");
                if !self.allowed_chats.contains(&peer_id) {
                    // Keep the history cursor in step with the event stream.
                    self.session.cursor.pts += 1;
                    return Ok(IterationOutcome::Filtered { peer_id });
                }

                let Some(batch) = self.fetch_with_reauth().await? else {
                    return Ok(IterationOutcome::Dropped { peer_id });
                };
                let Some(record) = batch.items.last() else {
                    anyhow::bail!(
                        "long-poll history returned no items at pts {}",
                        self.session.cursor.pts
                    );
                };

                let message = transform::build(
                    self.vk.as_ref(),
                    &self.session.access_token,
                    record,
                    &batch.profiles,
                    &batch.title,
                )
                .await?;

                self.session.cursor.pts = batch
                    .new_pts
                    .unwrap_or(self.session.cursor.pts + 1);

                self.sink.deliver(&message, &self.destination).await?;
                Ok(IterationOutcome::Delivered { peer_id })
            }
        }
    }

    /// Fetch the message batch, re-authenticating once on a stale session.
    ///
    /// A second failure drops the event: best-effort retry, not guaranteed
    /// recovery.
    async fn fetch_with_reauth(&mut self) -> Result<Option<MessageBatch>> {
        let pts = self.session.cursor.pts;
        let first_attempt = self.vk.fetch_messages(&self.session.access_token, pts).await;
        match first_attempt {
            Ok(batch) => Ok(Some(batch)),
            Err(VkError::AuthExpired(reason)) => {
                warn!(%reason, "message fetch rejected the session; re-resolving credentials");
                self.refresh_session().await?;
                let retry = self.vk.fetch_messages(&self.session.access_token, pts).await;
                match retry {
                    Ok(batch) => {
                        info!("message fetch retry succeeded after re-authentication");
                        Ok(Some(batch))
                    }
                    Err(retry_error) => {
                        error!(error = %retry_error, "message fetch retry failed; dropping event");
                        Ok(None)
                    }
                }
            }
            Err(other) => Err(other.into()),
        }
    }

    async fn refresh_session(&mut self) -> Result<(), VkError> {
        let credentials = self.vk.resolve_credentials(&self.cookie).await?;
        self.session.absorb(credentials);
        info!("VK session refreshed");
        Ok(())
    }
}

fn log_outcome(outcome: &IterationOutcome) {
    match outcome {
        IterationOutcome::Idle => {}
        IterationOutcome::Ignored { tag } => debug!(tag, "event ignored"),
        IterationOutcome::Filtered { peer_id } => debug!(peer_id, "chat not in allow-list"),
        IterationOutcome::Delivered { peer_id } => info!(peer_id, "message relayed"),
        IterationOutcome::Dropped { peer_id } => warn!(peer_id, "event dropped"),
    }
}
