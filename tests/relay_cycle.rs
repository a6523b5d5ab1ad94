//! Scripted-mock tests for the relay loop state machine.

use anyhow::Result;
use async_trait::async_trait;
use serde_json::json;
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use vkgram::relay::{IterationOutcome, RelayLoop, Session};
use vkgram::tg::send::{Destination, MessageSink};
use vkgram::transform::NormalizedMessage;
use vkgram::vk::api::VkApi;
use vkgram::vk::types::{Credentials, HistoryBatch, LongPollResponse, MessageBatch, VkProfile};
use vkgram::vk::VkError;

/// Replays queued responses and records every call it sees.
#[derive(Default)]
struct ScriptedVk {
    polls: Mutex<VecDeque<Result<LongPollResponse, VkError>>>,
    fetches: Mutex<VecDeque<Result<MessageBatch, VkError>>>,
    fetch_pts: Mutex<Vec<i64>>,
    credential_calls: AtomicUsize,
    fresh_credentials: Mutex<Option<Credentials>>,
}

#[async_trait]
impl VkApi for ScriptedVk {
    async fn long_poll(
        &self,
        _server: &str,
        _key: &str,
        _ts: i64,
    ) -> std::result::Result<LongPollResponse, VkError> {
        self.polls
            .lock()
            .expect("polls lock")
            .pop_front()
            .unwrap_or_else(|| Ok(LongPollResponse::default()))
    }

    async fn fetch_messages(
        &self,
        _access_token: &str,
        pts: i64,
    ) -> std::result::Result<MessageBatch, VkError> {
        self.fetch_pts.lock().expect("fetch_pts lock").push(pts);
        self.fetches
            .lock()
            .expect("fetches lock")
            .pop_front()
            .unwrap_or_else(|| Err(VkError::Api("unscripted fetch".to_string())))
    }

    async fn fetch_history(
        &self,
        _access_token: &str,
        _peer_id: i64,
        _count: u32,
    ) -> std::result::Result<HistoryBatch, VkError> {
        Err(VkError::Api("unscripted history".to_string()))
    }

    async fn resolve_credentials(
        &self,
        _cookie: &str,
    ) -> std::result::Result<Credentials, VkError> {
        self.credential_calls.fetch_add(1, Ordering::SeqCst);
        self.fresh_credentials
            .lock()
            .expect("credentials lock")
            .clone()
            .ok_or_else(|| VkError::Auth("unscripted credentials".to_string()))
    }

    async fn resolve_video_url(
        &self,
        _access_token: &str,
        _owner_id: i64,
        _video_id: i64,
        _access_key: Option<&str>,
    ) -> std::result::Result<String, VkError> {
        Ok("https://video.example/v.mp4".to_string())
    }
}

/// Records deliveries; can be told to fail them.
#[derive(Default)]
struct RecordingSink {
    delivered: Mutex<Vec<NormalizedMessage>>,
    notices: AtomicUsize,
    fail_delivery: bool,
}

#[async_trait]
impl MessageSink for RecordingSink {
    async fn deliver(&self, message: &NormalizedMessage, _destination: &Destination) -> Result<()> {
        if self.fail_delivery {
            anyhow::bail!("scripted delivery failure");
        }
        self.delivered
            .lock()
            .expect("delivered lock")
            .push(message.clone());
        Ok(())
    }

    async fn notify_failure(&self, _destination: &Destination) -> Result<()> {
        self.notices.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn poll(value: serde_json::Value) -> LongPollResponse {
    serde_json::from_value(value).expect("poll response should parse")
}

fn initial_session(ts: i64, pts: i64) -> Session {
    Session::from_credentials(Credentials {
        access_token: "token0".to_string(),
        server: "lp.example".to_string(),
        key: "key0".to_string(),
        ts,
        pts: Some(pts),
    })
}

fn fresh_credentials() -> Credentials {
    Credentials {
        access_token: "token1".to_string(),
        server: "other.example".to_string(),
        key: "key1".to_string(),
        ts: 99,
        pts: Some(777),
    }
}

fn batch(new_pts: Option<i64>) -> MessageBatch {
    let record = serde_json::from_value(json!({
        "id": 1,
        "from_id": 101,
        "peer_id": 55,
        "date": 1_700_000_000,
        "text": "hello"
    }))
    .expect("record should parse");
    MessageBatch {
        items: vec![record],
        profiles: vec![VkProfile {
            id: 101,
            first_name: "Ada".to_string(),
            last_name: "Lovelace".to_string(),
        }],
        title: "Team chat".to_string(),
        new_pts,
    }
}

fn relay(vk: Arc<ScriptedVk>, sink: Arc<RecordingSink>, session: Session) -> RelayLoop {
    RelayLoop::new(
        vk,
        sink,
        "cookie".to_string(),
        HashSet::from([55]),
        Destination {
            chat_id: -100,
            topic_id: None,
        },
        session,
    )
}

#[tokio::test]
async fn test_idle_poll_leaves_cursor_untouched() -> Result<()> {
    let vk = Arc::new(ScriptedVk::default());
    vk.polls
        .lock()
        .expect("polls lock")
        .push_back(Ok(poll(json!({"ts": 200, "updates": []}))));
    let sink = Arc::new(RecordingSink::default());
    let mut relay = relay(vk.clone(), sink.clone(), initial_session(100, 10));

    let outcome = relay.run_iteration().await?;

    assert_eq!(outcome, IterationOutcome::Idle);
    // No updates: server ts is not absorbed, pts untouched.
    assert_eq!(relay.session().cursor.ts, 100);
    assert_eq!(relay.session().cursor.pts, 10);
    assert_eq!(relay.session().cursor.key, "key0");
    assert!(vk.fetch_pts.lock().expect("fetch_pts lock").is_empty());
    assert!(sink.delivered.lock().expect("delivered lock").is_empty());
    Ok(())
}

#[tokio::test]
async fn test_filtered_event_advances_pts_only() -> Result<()> {
    let vk = Arc::new(ScriptedVk::default());
    vk.polls.lock().expect("polls lock").push_back(Ok(poll(
        json!({"ts": 6, "updates": [[4, 100, 0, 77, 1_700_000_000, "chat"]]}),
    )));
    let sink = Arc::new(RecordingSink::default());
    let mut relay = relay(vk.clone(), sink.clone(), initial_session(5, 10));

    let outcome = relay.run_iteration().await?;

    assert_eq!(outcome, IterationOutcome::Filtered { peer_id: 77 });
    assert_eq!(relay.session().cursor.ts, 6);
    assert_eq!(relay.session().cursor.pts, 11);
    assert!(vk.fetch_pts.lock().expect("fetch_pts lock").is_empty());
    assert!(sink.delivered.lock().expect("delivered lock").is_empty());
    Ok(())
}

#[tokio::test]
async fn test_allowed_event_delivers_and_advances_pts() -> Result<()> {
    let vk = Arc::new(ScriptedVk::default());
    // String ts exercises the lenient cursor parse.
    vk.polls.lock().expect("polls lock").push_back(Ok(poll(
        json!({"updates": [[4, 100, 0, 55, 1_700_000_000, "chat"]], "ts": "5"}),
    )));
    vk.fetches
        .lock()
        .expect("fetches lock")
        .push_back(Ok(batch(None)));
    let sink = Arc::new(RecordingSink::default());
    let mut relay = relay(vk.clone(), sink.clone(), initial_session(1, 10));

    let outcome = relay.run_iteration().await?;

    assert_eq!(outcome, IterationOutcome::Delivered { peer_id: 55 });
    assert_eq!(relay.session().cursor.ts, 5);
    assert_eq!(relay.session().cursor.pts, 11);
    assert_eq!(*vk.fetch_pts.lock().expect("fetch_pts lock"), vec![10]);

    let delivered = sink.delivered.lock().expect("delivered lock");
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].text, "hello");
    assert_eq!(delivered[0].sender_label, "Ada Lovelace (Team chat)");
    assert_eq!(sink.notices.load(Ordering::SeqCst), 0);
    Ok(())
}

#[tokio::test]
async fn test_new_pts_overrides_increment() -> Result<()> {
    let vk = Arc::new(ScriptedVk::default());
    vk.polls.lock().expect("polls lock").push_back(Ok(poll(
        json!({"ts": 5, "updates": [[4, 100, 0, 55, 1_700_000_000, "chat"]]}),
    )));
    vk.fetches
        .lock()
        .expect("fetches lock")
        .push_back(Ok(batch(Some(42))));
    let sink = Arc::new(RecordingSink::default());
    let mut relay = relay(vk.clone(), sink.clone(), initial_session(1, 10));

    relay.run_iteration().await?;

    assert_eq!(relay.session().cursor.pts, 42);
    Ok(())
}

#[tokio::test]
async fn test_stale_fetch_triggers_single_reauth_and_retry() -> Result<()> {
    let vk = Arc::new(ScriptedVk::default());
    vk.polls.lock().expect("polls lock").push_back(Ok(poll(
        json!({"ts": 5, "updates": [[4, 100, 0, 55, 1_700_000_000, "chat"]]}),
    )));
    {
        let mut fetches = vk.fetches.lock().expect("fetches lock");
        fetches.push_back(Err(VkError::AuthExpired("stale token".to_string())));
        fetches.push_back(Ok(batch(None)));
    }
    *vk.fresh_credentials.lock().expect("credentials lock") = Some(fresh_credentials());
    let sink = Arc::new(RecordingSink::default());
    let mut relay = relay(vk.clone(), sink.clone(), initial_session(1, 10));

    let outcome = relay.run_iteration().await?;

    assert_eq!(outcome, IterationOutcome::Delivered { peer_id: 55 });
    assert_eq!(vk.credential_calls.load(Ordering::SeqCst), 1);
    // Retried once at the same pts.
    assert_eq!(*vk.fetch_pts.lock().expect("fetch_pts lock"), vec![10, 10]);
    // Fresh credentials overwrite the token and the ts/key pair.
    assert_eq!(relay.session().access_token, "token1");
    assert_eq!(relay.session().cursor.key, "key1");
    assert_eq!(relay.session().cursor.ts, 99);
    assert_eq!(relay.session().cursor.pts, 11);
    assert_eq!(sink.delivered.lock().expect("delivered lock").len(), 1);
    Ok(())
}

#[tokio::test]
async fn test_second_fetch_failure_drops_event() -> Result<()> {
    let vk = Arc::new(ScriptedVk::default());
    vk.polls.lock().expect("polls lock").push_back(Ok(poll(
        json!({"ts": 5, "updates": [[4, 100, 0, 55, 1_700_000_000, "chat"]]}),
    )));
    {
        let mut fetches = vk.fetches.lock().expect("fetches lock");
        fetches.push_back(Err(VkError::AuthExpired("stale token".to_string())));
        fetches.push_back(Err(VkError::AuthExpired("still stale".to_string())));
    }
    *vk.fresh_credentials.lock().expect("credentials lock") = Some(fresh_credentials());
    let sink = Arc::new(RecordingSink::default());
    let mut relay = relay(vk.clone(), sink.clone(), initial_session(1, 10));

    let outcome = relay.run_iteration().await?;

    assert_eq!(outcome, IterationOutcome::Dropped { peer_id: 55 });
    assert_eq!(vk.credential_calls.load(Ordering::SeqCst), 1);
    assert!(sink.delivered.lock().expect("delivered lock").is_empty());
    // A dropped event is swallowed, not escalated to the failure notice.
    assert_eq!(sink.notices.load(Ordering::SeqCst), 0);
    // The history cursor is left for the next fetch attempt.
    assert_eq!(relay.session().cursor.pts, 10);
    Ok(())
}

#[tokio::test]
async fn test_failed_one_resyncs_ts_only() -> Result<()> {
    let vk = Arc::new(ScriptedVk::default());
    vk.polls
        .lock()
        .expect("polls lock")
        .push_back(Ok(poll(json!({"failed": 1, "ts": 42}))));
    let sink = Arc::new(RecordingSink::default());
    let mut relay = relay(vk.clone(), sink.clone(), initial_session(1, 10));

    let outcome = relay.run_iteration().await?;

    assert_eq!(outcome, IterationOutcome::Idle);
    assert_eq!(relay.session().cursor.ts, 42);
    assert_eq!(relay.session().cursor.key, "key0");
    assert_eq!(vk.credential_calls.load(Ordering::SeqCst), 0);
    Ok(())
}

#[tokio::test]
async fn test_failed_two_refreshes_credentials() -> Result<()> {
    let vk = Arc::new(ScriptedVk::default());
    vk.polls
        .lock()
        .expect("polls lock")
        .push_back(Ok(poll(json!({"failed": 2}))));
    *vk.fresh_credentials.lock().expect("credentials lock") = Some(fresh_credentials());
    let sink = Arc::new(RecordingSink::default());
    let mut relay = relay(vk.clone(), sink.clone(), initial_session(1, 10));

    relay.run_iteration().await?;

    assert_eq!(vk.credential_calls.load(Ordering::SeqCst), 1);
    assert_eq!(relay.session().access_token, "token1");
    assert_eq!(relay.session().cursor.key, "key1");
    assert_eq!(relay.session().cursor.ts, 99);
    assert_eq!(relay.session().cursor.pts, 10);
    Ok(())
}

#[tokio::test]
async fn test_delivery_failure_sends_fallback_notice() {
    let vk = Arc::new(ScriptedVk::default());
    vk.polls.lock().expect("polls lock").push_back(Ok(poll(
        json!({"ts": 5, "updates": [[4, 100, 0, 55, 1_700_000_000, "chat"]]}),
    )));
    vk.fetches
        .lock()
        .expect("fetches lock")
        .push_back(Ok(batch(None)));
    let sink = Arc::new(RecordingSink {
        fail_delivery: true,
        ..RecordingSink::default()
    });
    let mut relay = relay(vk.clone(), sink.clone(), initial_session(1, 10));

    relay.run_once().await;

    assert_eq!(sink.notices.load(Ordering::SeqCst), 1);
    // The loop survives and keeps polling afterwards.
    relay.run_once().await;
    assert_eq!(sink.notices.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_transport_error_sends_fallback_notice_and_continues() {
    let vk = Arc::new(ScriptedVk::default());
    vk.polls
        .lock()
        .expect("polls lock")
        .push_back(Err(VkError::Network("connection reset".to_string())));
    let sink = Arc::new(RecordingSink::default());
    let mut relay = relay(vk.clone(), sink.clone(), initial_session(1, 10));

    relay.run_once().await;

    assert_eq!(sink.notices.load(Ordering::SeqCst), 1);
    assert_eq!(relay.session().cursor.ts, 1);

    // Next cycle is an ordinary idle poll.
    relay.run_once().await;
    assert_eq!(sink.notices.load(Ordering::SeqCst), 1);
}
