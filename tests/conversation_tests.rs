//! End-to-end conversation behavior against an in-process backend: dispatch,
//! chunk reconciliation, busy gating, teardown and sign-in redirects.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use qingwang_chat::api::{HistoryMessage, SearchRequest, StreamRequest};
use qingwang_chat::transcript::{INTERRUPTED_MARKER, NO_RESULTS_TEXT};
use qingwang_chat::*;
use serde_json::{json, Value};
use tokio::sync::Notify;

// ---------------------------------------------------------------------------
// Fake backend
// ---------------------------------------------------------------------------

#[derive(Default)]
struct FakeBackend {
    history: Vec<Value>,
    reject_history: bool,
    reject_trigger: bool,
    fail_trigger: Option<&'static str>,
    search_results: Vec<String>,
    searches: Arc<Mutex<Vec<SearchRequest>>>,
    triggers: Arc<Mutex<Vec<StreamRequest>>>,
    /// Chunks pushed on the channel before the trigger resolves; the trigger
    /// then waits for the notify.
    during_trigger: Option<(ChannelFeed, Vec<Value>, Arc<Notify>)>,
    /// The channel rejects the session while the trigger is pending; the
    /// trigger then also answers 401 once the notify fires.
    rejected_during_trigger: Option<(ChannelFeed, Arc<Notify>)>,
}

impl ChatBackend for FakeBackend {
    async fn trigger_stream(&self, _conversation_id: &str, request: &StreamRequest) -> Result<()> {
        self.triggers.lock().unwrap().push(request.clone());
        if let Some((feed, ack)) = &self.rejected_during_trigger {
            feed.auth_rejected();
            ack.notified().await;
            return Err(ChatError::AuthRejected);
        }
        if self.reject_trigger {
            return Err(ChatError::AuthRejected);
        }
        if let Some(detail) = self.fail_trigger {
            return Err(ChatError::RequestFailed {
                url: "fake://trigger".into(),
                detail: detail.into(),
            });
        }
        if let Some((feed, chunks, ack)) = &self.during_trigger {
            for chunk in chunks {
                feed.chunk(chunk.clone());
            }
            ack.notified().await;
        }
        Ok(())
    }

    async fn search(&self, _conversation_id: &str, request: &SearchRequest) -> Result<Vec<String>> {
        self.searches.lock().unwrap().push(request.clone());
        Ok(self.search_results.clone())
    }

    async fn fetch_history(&self, _conversation_id: &str) -> Result<Vec<HistoryMessage>> {
        if self.reject_history {
            return Err(ChatError::AuthRejected);
        }
        Ok(self
            .history
            .iter()
            .map(|v| serde_json::from_value(v.clone()).unwrap())
            .collect())
    }
}

fn counting_redirect() -> (Arc<dyn SignInRedirect>, Arc<AtomicUsize>) {
    let count = Arc::new(AtomicUsize::new(0));
    let c = Arc::clone(&count);
    let redirect: Arc<dyn SignInRedirect> = Arc::new(move || {
        c.fetch_add(1, Ordering::SeqCst);
    });
    (redirect, count)
}

async fn mount(backend: FakeBackend) -> (Conversation<FakeBackend>, ChannelFeed, Arc<AtomicUsize>) {
    let (channel, feed) = ChannelHandle::detached("room-1");
    let (redirect, count) = counting_redirect();
    let chat = Conversation::with_channel(ClientConfig::default(), backend, channel, redirect)
        .await
        .unwrap();
    (chat, feed, count)
}

fn chunk(seq: u64, text: &str, finished: bool) -> Value {
    json!({ "sequence": seq, "text": text, "finished": finished })
}

fn body(chat: &Conversation<FakeBackend>, handle: Handle) -> MessageBody {
    chat.transcript().get(handle).unwrap().body.clone()
}

// ---------------------------------------------------------------------------
// Streaming
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_stream_in_order() {
    let (mut chat, feed, _) = mount(FakeBackend::default()).await;
    let h = chat
        .submit("借款不还怎么办", Mission::Consultation, SubmitOptions::default())
        .await
        .unwrap();
    assert_eq!(body(&chat, h), MessageBody::Thinking);
    assert!(chat.is_busy());

    feed.chunk(chunk(1, "正", false));
    feed.chunk(chunk(2, "正在", false));
    feed.chunk(chunk(3, "正在思考完毕", true));
    chat.settle().await;

    assert_eq!(body(&chat, h), MessageBody::Text("正在思考完毕".into()));
    assert!(!chat.is_busy());
    assert_eq!(chat.transcript().len(), 2);
}

#[tokio::test]
async fn test_stream_out_of_order_same_result() {
    let (mut chat, feed, _) = mount(FakeBackend::default()).await;
    let h = chat
        .submit("问", Mission::VerdictPrediction, SubmitOptions::default())
        .await
        .unwrap();

    feed.chunk(chunk(2, "正在", false));
    feed.chunk(chunk(1, "正", false));
    feed.chunk(chunk(3, "正在思考完毕", true));
    chat.settle().await;

    assert_eq!(body(&chat, h), MessageBody::Text("正在思考完毕".into()));
}

#[tokio::test]
async fn test_next_update_reports_each_chunk() {
    let (mut chat, feed, _) = mount(FakeBackend::default()).await;
    let h = chat
        .submit("问", Mission::Consultation, SubmitOptions::default())
        .await
        .unwrap();

    feed.chunk(chunk(1, "正", false));
    feed.chunk(chunk(1, "正", false));
    feed.chunk(json!({ "text": "no sequence" }));
    feed.chunk(chunk(2, "正在", true));

    assert_eq!(
        chat.next_update().await,
        Some(Update::Chunk { target: h, applied: reconciler::Applied::Partial })
    );
    assert_eq!(chat.next_update().await, Some(Update::Ignored));
    assert_eq!(chat.next_update().await, Some(Update::Ignored));
    assert_eq!(
        chat.next_update().await,
        Some(Update::Chunk { target: h, applied: reconciler::Applied::Finished })
    );
    assert!(!chat.is_busy());
}

#[tokio::test]
async fn test_legacy_chunk_fields_accepted() {
    let (mut chat, feed, _) = mount(FakeBackend::default()).await;
    let h = chat
        .submit("问", Mission::Consultation, SubmitOptions::default())
        .await
        .unwrap();

    feed.chunk(json!({ "num": 1, "text": "旧", "isfinished": 1 }));
    chat.settle().await;
    assert_eq!(body(&chat, h), MessageBody::Text("旧".into()));
}

#[tokio::test]
async fn test_chunks_reconciled_while_trigger_in_flight() {
    let (channel, feed) = ChannelHandle::detached("room-1");
    let ack = Arc::new(Notify::new());
    let backend = FakeBackend {
        during_trigger: Some((
            feed.clone(),
            vec![chunk(1, "先到", false), chunk(2, "先到的答案", true)],
            Arc::clone(&ack),
        )),
        ..FakeBackend::default()
    };
    let (redirect, _) = counting_redirect();
    let mut chat = Conversation::with_channel(ClientConfig::default(), backend, channel, redirect)
        .await
        .unwrap();

    // Releases the trigger only once the final chunk has landed.
    let mut events = chat.subscribe();
    let watcher = tokio::spawn(async move {
        let mut updates = 0;
        while let Ok(event) = events.recv().await {
            if matches!(event, TranscriptEvent::Updated(_)) {
                updates += 1;
                if updates == 2 {
                    ack.notify_one();
                    return;
                }
            }
        }
    });

    let h = tokio::time::timeout(
        Duration::from_secs(5),
        chat.submit("问", Mission::Consultation, SubmitOptions::default()),
    )
    .await
    .expect("trigger never released: chunks were not applied while it was pending")
    .unwrap();

    assert_eq!(body(&chat, h), MessageBody::Text("先到的答案".into()));
    assert!(!chat.is_busy());
    watcher.await.unwrap();
}

#[tokio::test]
async fn test_requests_carry_mission_and_input() {
    let backend = FakeBackend::default();
    let triggers = Arc::clone(&backend.triggers);
    let searches = Arc::clone(&backend.searches);
    let (mut chat, feed, _) = mount(backend).await;

    chat.submit("判决结果？", Mission::VerdictPrediction, SubmitOptions::default())
        .await
        .unwrap();
    feed.chunk(chunk(1, "驳回", true));
    chat.settle().await;
    chat.submit("民法典 第五百条", Mission::StatuteSearch, SubmitOptions { model_enhanced: true })
        .await
        .unwrap();
    chat.submit("借贷纠纷", Mission::CaseSearch, SubmitOptions::default())
        .await
        .unwrap();

    let triggers = triggers.lock().unwrap();
    assert_eq!(triggers.len(), 1);
    assert_eq!(triggers[0].inputs, "判决结果？");
    assert_eq!(triggers[0].mission, Mission::VerdictPrediction);

    let searches = searches.lock().unwrap();
    assert_eq!(searches.len(), 2);
    assert_eq!((searches[0].mission, searches[0].top_k, searches[0].is_model), (Mission::StatuteSearch, 5, true));
    assert_eq!((searches[1].mission, searches[1].top_k, searches[1].is_model), (Mission::CaseSearch, 3, false));
}

// ---------------------------------------------------------------------------
// Busy gating
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_busy_rejects_second_submit_without_mutation() {
    let (mut chat, feed, _) = mount(FakeBackend::default()).await;
    chat.submit("一", Mission::Consultation, SubmitOptions::default())
        .await
        .unwrap();
    let before = chat.transcript().snapshot();

    let err = chat
        .submit("二", Mission::CaseSearch, SubmitOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, ChatError::Busy));
    assert_eq!(chat.transcript().snapshot(), before);

    feed.chunk(chunk(1, "好", true));
    chat.settle().await;
    assert!(chat
        .submit("二", Mission::CaseSearch, SubmitOptions::default())
        .await
        .is_ok());
}

// ---------------------------------------------------------------------------
// Single-shot search
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_empty_search_shows_no_results() {
    let (mut chat, _feed, _) = mount(FakeBackend::default()).await;
    let h = chat
        .submit("离婚财产分割", Mission::StatuteSearch, SubmitOptions::default())
        .await
        .unwrap();
    assert_eq!(body(&chat, h), MessageBody::NoResults);
    assert_eq!(body(&chat, h).render(), NO_RESULTS_TEXT);
    assert!(!chat.is_busy());
}

#[tokio::test]
async fn test_search_results_in_order() {
    let backend = FakeBackend {
        search_results: vec!["第一条".into(), "第二条".into()],
        ..FakeBackend::default()
    };
    let (mut chat, _feed, _) = mount(backend).await;
    let h = chat
        .submit("案情", Mission::CaseSearch, SubmitOptions { model_enhanced: true })
        .await
        .unwrap();
    assert_eq!(
        body(&chat, h),
        MessageBody::Results(vec!["第一条".into(), "第二条".into()])
    );
}

#[tokio::test]
async fn test_search_ignores_channel_chunks() {
    let (mut chat, feed, _) = mount(FakeBackend::default()).await;
    let h = chat
        .submit("案情", Mission::CaseSearch, SubmitOptions::default())
        .await
        .unwrap();
    feed.chunk(chunk(1, "stray", true));
    assert_eq!(chat.next_update().await, Some(Update::Ignored));
    assert_eq!(body(&chat, h), MessageBody::NoResults);
}

// ---------------------------------------------------------------------------
// Failures
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_failed_trigger_shows_failure_and_frees_conversation() {
    let backend = FakeBackend {
        fail_trigger: Some("HTTP 503"),
        ..FakeBackend::default()
    };
    let (mut chat, _feed, _) = mount(backend).await;
    let err = chat
        .submit("问", Mission::Consultation, SubmitOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, ChatError::RequestFailed { .. }));

    let last = chat.transcript().last().unwrap();
    assert_eq!(last.body, MessageBody::Failed("HTTP 503".into()));
    assert!(!chat.is_busy());
}

#[tokio::test]
async fn test_rejected_trigger_redirects_once() {
    let backend = FakeBackend {
        reject_trigger: true,
        ..FakeBackend::default()
    };
    let (mut chat, _feed, redirects) = mount(backend).await;
    let err = chat
        .submit("问", Mission::Consultation, SubmitOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, ChatError::AuthRejected));
    assert_eq!(redirects.load(Ordering::SeqCst), 1);
    assert!(matches!(chat.transcript().last().unwrap().body, MessageBody::Failed(_)));
}

#[tokio::test]
async fn test_rejection_on_channel_and_trigger_redirects_once() {
    let (channel, feed) = ChannelHandle::detached("room-1");
    let ack = Arc::new(Notify::new());
    let backend = FakeBackend {
        rejected_during_trigger: Some((feed.clone(), Arc::clone(&ack))),
        ..FakeBackend::default()
    };
    let (redirect, redirects) = counting_redirect();
    let mut chat = Conversation::with_channel(ClientConfig::default(), backend, channel, redirect)
        .await
        .unwrap();

    // The trigger answers only after the channel rejection failed the placeholder.
    let mut events = chat.subscribe();
    let watcher = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            if matches!(event, TranscriptEvent::Updated(_)) {
                ack.notify_one();
                return;
            }
        }
    });

    let err = tokio::time::timeout(
        Duration::from_secs(5),
        chat.submit("问", Mission::Consultation, SubmitOptions::default()),
    )
    .await
    .expect("channel rejection was not applied while the trigger was pending")
    .unwrap_err();

    assert!(matches!(err, ChatError::AuthRejected));
    assert_eq!(redirects.load(Ordering::SeqCst), 1);
    assert!(matches!(chat.transcript().last().unwrap().body, MessageBody::Failed(_)));
    assert!(!chat.is_busy());
    watcher.await.unwrap();
}

#[tokio::test]
async fn test_history_rejection_redirects_exactly_once() {
    let backend = FakeBackend {
        reject_history: true,
        ..FakeBackend::default()
    };
    let (channel, _feed) = ChannelHandle::detached("room-1");
    let (redirect, redirects) = counting_redirect();
    let result = Conversation::with_channel(ClientConfig::default(), backend, channel, redirect).await;
    assert!(matches!(result, Err(ChatError::AuthRejected)));
    assert_eq!(redirects.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_channel_auth_rejection_fails_open_stream() {
    let (mut chat, feed, redirects) = mount(FakeBackend::default()).await;
    let h = chat
        .submit("问", Mission::Consultation, SubmitOptions::default())
        .await
        .unwrap();
    feed.auth_rejected();
    assert_eq!(chat.next_update().await, Some(Update::AuthRejected));
    assert_eq!(redirects.load(Ordering::SeqCst), 1);
    assert!(matches!(body(&chat, h), MessageBody::Failed(_)));
    assert!(!chat.is_busy());
}

#[tokio::test]
async fn test_channel_lost_interrupts_open_stream() {
    let (mut chat, feed, _) = mount(FakeBackend::default()).await;
    let h = chat
        .submit("问", Mission::Consultation, SubmitOptions::default())
        .await
        .unwrap();
    feed.chunk(chunk(1, "一半", false));
    feed.lost("reset by peer");

    chat.next_update().await;
    assert_eq!(
        chat.next_update().await,
        Some(Update::ChannelLost { interrupted: Some(h) })
    );
    assert_eq!(body(&chat, h), MessageBody::Interrupted("一半".into()));
    assert!(body(&chat, h).render().ends_with(INTERRUPTED_MARKER));
    assert!(!chat.is_busy());
}

#[tokio::test]
async fn test_settle_interrupts_when_channel_ends() {
    let (mut chat, feed, _) = mount(FakeBackend::default()).await;
    let h = chat
        .submit("问", Mission::Consultation, SubmitOptions::default())
        .await
        .unwrap();
    feed.chunk(chunk(1, "部分", false));
    drop(feed);

    chat.settle().await;
    assert_eq!(body(&chat, h), MessageBody::Interrupted("部分".into()));
}

#[tokio::test]
async fn test_next_update_interrupts_when_channel_ends() {
    let (mut chat, feed, _) = mount(FakeBackend::default()).await;
    let h = chat
        .submit("问", Mission::Consultation, SubmitOptions::default())
        .await
        .unwrap();
    feed.chunk(chunk(1, "半句", false));
    drop(feed);

    assert!(matches!(chat.next_update().await, Some(Update::Chunk { .. })));
    assert_eq!(
        chat.next_update().await,
        Some(Update::ChannelLost { interrupted: Some(h) })
    );
    assert_eq!(body(&chat, h), MessageBody::Interrupted("半句".into()));
    assert!(!chat.is_busy());
    assert_eq!(chat.next_update().await, None);
}

#[tokio::test]
async fn test_streaming_refused_after_channel_lost() {
    let backend = FakeBackend {
        search_results: vec!["案例一".into()],
        ..FakeBackend::default()
    };
    let (mut chat, feed, _) = mount(backend).await;
    feed.lost("reset by peer");
    drop(feed);
    assert_eq!(
        chat.next_update().await,
        Some(Update::ChannelLost { interrupted: None })
    );
    assert_eq!(chat.next_update().await, None);

    let err = chat
        .submit("问", Mission::Consultation, SubmitOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, ChatError::ChannelLost(_)));
    assert!(chat.transcript().is_empty());
    assert!(!chat.is_busy());

    // Retrieval does not need the channel.
    let h = chat
        .submit("类案", Mission::CaseSearch, SubmitOptions::default())
        .await
        .unwrap();
    assert_eq!(body(&chat, h), MessageBody::Results(vec!["案例一".into()]));
}

// ---------------------------------------------------------------------------
// History and teardown
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_history_seeds_transcript() {
    let backend = FakeBackend {
        history: vec![
            json!({ "role": "user", "content": "找类案" }),
            json!({ "role": "类案检索", "content": ["案一", "案二"] }),
            json!({ "role": "user", "content": "法条" }),
            json!({ "role": "法条检索", "content": [] }),
            json!({ "role": "assistant", "content": "好的" }),
        ],
        ..FakeBackend::default()
    };
    let (chat, _feed, _) = mount(backend).await;
    let snap = chat.transcript().snapshot();
    assert_eq!(snap.len(), 5);
    assert_eq!(snap[0].author, Author::User);
    assert_eq!(snap[1].mission, Some(Mission::CaseSearch));
    assert_eq!(snap[1].body, MessageBody::Results(vec!["案一".into(), "案二".into()]));
    assert_eq!(snap[3].body, MessageBody::NoResults);
    assert_eq!(snap[4].body, MessageBody::Text("好的".into()));
    assert_eq!(snap[4].mission, None);
}

#[tokio::test]
async fn test_refresh_history_skipped_while_streaming() {
    let (mut chat, feed, _) = mount(FakeBackend::default()).await;
    chat.submit("问", Mission::Consultation, SubmitOptions::default())
        .await
        .unwrap();
    assert!(!chat.refresh_history().await.unwrap());
    assert_eq!(chat.transcript().len(), 2);

    feed.chunk(chunk(1, "完", true));
    chat.settle().await;
    assert!(chat.refresh_history().await.unwrap());
    assert!(chat.transcript().is_empty());
}

#[tokio::test]
async fn test_teardown_stops_delivery() {
    let (mut old, old_feed, _) = mount(FakeBackend::default()).await;
    old.submit("旧房间", Mission::Consultation, SubmitOptions::default())
        .await
        .unwrap();
    old.close();

    let (replacement, _new_feed, _) = mount(FakeBackend::default()).await;
    let before = replacement.transcript().snapshot();

    assert!(!old_feed.chunk(chunk(1, "迟到", true)));
    assert!(old_feed.is_closed());
    assert_eq!(replacement.transcript().snapshot(), before);
}

#[tokio::test]
async fn test_transcript_events_follow_submit() {
    let (mut chat, feed, _) = mount(FakeBackend::default()).await;
    let mut events = chat.subscribe();
    let h = chat
        .submit("问", Mission::Consultation, SubmitOptions::default())
        .await
        .unwrap();
    feed.chunk(chunk(1, "答", true));
    chat.settle().await;

    assert!(matches!(events.recv().await.unwrap(), TranscriptEvent::Appended(_)));
    assert_eq!(events.recv().await.unwrap(), TranscriptEvent::Appended(h));
    assert_eq!(events.recv().await.unwrap(), TranscriptEvent::Updated(h));
}
