use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parley_agents::conversation::{
    BUSY_NOTICE, CANCELED_NOTICE, IDLE_RESET_NOTICE, NEW_DIALOG_NOTICE, NOTHING_TO_CANCEL_NOTICE,
    PLACEHOLDER_TEXT,
};
use parley_agents::{
    ChatRole, CompletionClient, ControllerSettings, ConversationController, LlmProvider,
    LlmRequest, LlmResponse, Outcome, SlotState, Usage,
};
use parley_channels::{ChatTransport, SentMessage};
use parley_common::{
    ChatId, ChatKind, DialogId, Error, InboundMessage, Result, UserId, UserProfile,
};
use parley_config::CompletionOptions;
use parley_db::{DialogStore, DialogStoreExt, NewUser, SqliteDialogStore, Turn};
use serde_json::Value;
use tokio::sync::Semaphore;

const MODEL: &str = "gpt-3.5-turbo";

// ── Test doubles ──

/// Answers every request with `reply()`, but only once the test hands out a
/// permit through `release`.
struct GatedProvider {
    gate: Semaphore,
    requests: Mutex<Vec<LlmRequest>>,
    reply: fn() -> Result<LlmResponse>,
    /// When set, user "7" sends /cancel after the answer is ready but before
    /// it is returned.
    cancel_before_reply: OnceLock<Weak<ConversationController>>,
}

impl GatedProvider {
    fn open(reply: fn() -> Result<LlmResponse>) -> Self {
        Self {
            gate: Semaphore::new(1_000),
            requests: Mutex::new(Vec::new()),
            reply,
            cancel_before_reply: OnceLock::new(),
        }
    }

    fn closed(reply: fn() -> Result<LlmResponse>) -> Self {
        Self {
            gate: Semaphore::new(0),
            ..Self::open(reply)
        }
    }

    fn release(&self, n: usize) {
        self.gate.add_permits(n);
    }

    fn requests(&self) -> Vec<LlmRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl LlmProvider for GatedProvider {
    fn provider_id(&self) -> &str {
        "gated"
    }

    async fn complete(&self, request: &LlmRequest) -> Result<LlmResponse> {
        self.requests.lock().unwrap().push(request.clone());
        self.gate
            .acquire()
            .await
            .map_err(|e| Error::Internal(e.to_string()))?
            .forget();
        if let Some(controller) = self.cancel_before_reply.get().and_then(Weak::upgrade) {
            assert!(controller.cancel(&message("7", "/cancel")).await);
        }
        (self.reply)()
    }

    async fn health_check(&self) -> Result<bool> {
        Ok(true)
    }
}

fn hi() -> Result<LlmResponse> {
    Ok(LlmResponse {
        content: "hi!".to_string(),
        model: MODEL.to_string(),
        usage: Some(Usage {
            input_tokens: 5,
            output_tokens: 3,
        }),
        stop_reason: Some("stop".to_string()),
    })
}

fn unavailable() -> Result<LlmResponse> {
    Err(Error::Upstream("OpenAI API error (status=503): overloaded".into()))
}

fn overflow() -> Result<LlmResponse> {
    Err(Error::ContextOverflow("maximum context length".into()))
}

#[derive(Debug, Clone, PartialEq)]
enum Event {
    Sent { text: String, message_id: i32 },
    Edited { message_id: i32, text: String },
    Typing,
}

#[derive(Default)]
struct RecordingTransport {
    events: Mutex<Vec<Event>>,
    next_id: AtomicI32,
}

impl RecordingTransport {
    fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    fn sent_count(&self, text: &str) -> usize {
        self.events()
            .iter()
            .filter(|e| matches!(e, Event::Sent { text: t, .. } if t == text))
            .count()
    }

    fn last_edit(&self) -> Option<String> {
        self.events().into_iter().rev().find_map(|e| match e {
            Event::Edited { text, .. } => Some(text),
            _ => None,
        })
    }
}

#[async_trait]
impl ChatTransport for RecordingTransport {
    async fn send_text(
        &self,
        chat_id: ChatId,
        text: &str,
        _reply_to: Option<i32>,
    ) -> Result<SentMessage> {
        let message_id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        self.events.lock().unwrap().push(Event::Sent {
            text: text.to_string(),
            message_id,
        });
        Ok(SentMessage {
            chat_id,
            message_id,
        })
    }

    async fn edit_text(&self, message: &SentMessage, text: &str) -> Result<()> {
        self.events.lock().unwrap().push(Event::Edited {
            message_id: message.message_id,
            text: text.to_string(),
        });
        Ok(())
    }

    async fn send_typing(&self, _chat_id: ChatId) -> Result<()> {
        self.events.lock().unwrap().push(Event::Typing);
        Ok(())
    }
}

/// SQLite store that counts how often a new dialog is started. It can hold
/// `start_new_dialog` until the test opens `dialog_gate`, and can fail every
/// attribute write.
struct CountingStore {
    inner: SqliteDialogStore,
    new_dialogs: AtomicUsize,
    dialog_gate: Semaphore,
    fail_attribute_writes: AtomicBool,
}

impl CountingStore {
    fn new() -> Self {
        Self {
            inner: SqliteDialogStore::in_memory().unwrap(),
            new_dialogs: AtomicUsize::new(0),
            dialog_gate: Semaphore::new(1),
            fail_attribute_writes: AtomicBool::new(false),
        }
    }

    fn with_closed_dialog_gate() -> Self {
        Self {
            dialog_gate: Semaphore::new(0),
            ..Self::new()
        }
    }

    fn failing_attribute_writes() -> Self {
        Self {
            fail_attribute_writes: AtomicBool::new(true),
            ..Self::new()
        }
    }

    fn new_dialogs(&self) -> usize {
        self.new_dialogs.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DialogStore for CountingStore {
    async fn user_exists(&self, user_id: &UserId) -> Result<bool> {
        self.inner.user_exists(user_id).await
    }

    async fn create_user(&self, user: NewUser) -> Result<()> {
        self.inner.create_user(user).await
    }

    async fn start_new_dialog(&self, user_id: &UserId) -> Result<DialogId> {
        self.new_dialogs.fetch_add(1, Ordering::SeqCst);
        let _open = self
            .dialog_gate
            .acquire()
            .await
            .map_err(|e| Error::Internal(e.to_string()))?;
        self.inner.start_new_dialog(user_id).await
    }

    async fn get_attribute(&self, user_id: &UserId, key: &str) -> Result<Value> {
        self.inner.get_attribute(user_id, key).await
    }

    async fn set_attribute(&self, user_id: &UserId, key: &str, value: Value) -> Result<()> {
        if self.fail_attribute_writes.load(Ordering::SeqCst) {
            return Err(Error::Database("disk full".into()));
        }
        self.inner.set_attribute(user_id, key, value).await
    }

    async fn get_dialog_messages(
        &self,
        user_id: &UserId,
        dialog_id: Option<&DialogId>,
    ) -> Result<Vec<Turn>> {
        self.inner.get_dialog_messages(user_id, dialog_id).await
    }

    async fn set_dialog_messages(
        &self,
        user_id: &UserId,
        turns: Vec<Turn>,
        dialog_id: Option<&DialogId>,
    ) -> Result<()> {
        self.inner
            .set_dialog_messages(user_id, turns, dialog_id)
            .await
    }

    async fn record_token_usage(
        &self,
        user_id: &UserId,
        model: &str,
        input_tokens: u64,
        output_tokens: u64,
    ) -> Result<()> {
        self.inner
            .record_token_usage(user_id, model, input_tokens, output_tokens)
            .await
    }
}

// ── Harness ──

struct Harness {
    controller: Arc<ConversationController>,
    store: Arc<CountingStore>,
    provider: Arc<GatedProvider>,
    transport: Arc<RecordingTransport>,
}

fn harness(provider: GatedProvider) -> Harness {
    harness_with(provider, CountingStore::new())
}

fn harness_with(provider: GatedProvider, store: CountingStore) -> Harness {
    let store = Arc::new(store);
    let provider = Arc::new(provider);
    let transport = Arc::new(RecordingTransport::default());

    let settings = ControllerSettings {
        default_model: MODEL.to_string(),
        default_chat_mode: "zara".to_string(),
        personas: HashMap::from([("zara".to_string(), "You are Zara.".to_string())]),
        idle_timeout: Duration::from_secs(24 * 60 * 60),
    };
    let completion = Arc::new(CompletionClient::new(
        provider.clone(),
        CompletionOptions::default(),
    ));
    let controller = Arc::new(ConversationController::new(
        store.clone(),
        completion,
        transport.clone(),
        settings,
    ));

    Harness {
        controller,
        store,
        provider,
        transport,
    }
}

fn message(user: &str, text: &str) -> InboundMessage {
    InboundMessage::text(UserId::from(user), ChatId(70), ChatKind::Direct, text)
}

fn new_user(user: &str) -> NewUser {
    NewUser {
        id: UserId::from(user),
        chat_id: ChatId(70),
        profile: UserProfile::default(),
        chat_mode: "zara".to_string(),
        model: MODEL.to_string(),
    }
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

// ── Tests ──

#[tokio::test]
async fn test_first_message_is_answered_and_persisted() {
    let h = harness(GatedProvider::open(hi));
    let user = UserId::from("7");

    let outcome = h.controller.handle_message(message("7", "hello")).await.unwrap();
    assert_eq!(outcome, Outcome::Answered("hi!".to_string()));

    let turns = h.store.inner.get_dialog_messages(&user, None).await.unwrap();
    assert_eq!(turns.len(), 1);
    assert_eq!((turns[0].user.as_str(), turns[0].bot.as_str()), ("hello", "hi!"));

    let usage = h.store.inner.token_usage(&user, MODEL).await.unwrap();
    assert_eq!((usage.n_input_tokens, usage.n_output_tokens), (5, 3));

    let requests = h.provider.requests();
    assert_eq!(requests.len(), 1);
    let messages = &requests[0].messages;
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].role, ChatRole::System);
    assert_eq!(messages[0].content, "You are Zara.");
    assert_eq!(messages[1].role, ChatRole::User);
    assert_eq!(messages[1].content, "hello");

    // Placeholder first, then edited in place with the answer.
    let events = h.transport.events();
    assert_eq!(
        events[0],
        Event::Sent {
            text: PLACEHOLDER_TEXT.to_string(),
            message_id: 1
        }
    );
    assert!(events.contains(&Event::Edited {
        message_id: 1,
        text: "hi!".to_string()
    }));
    assert_eq!(h.controller.state(&user), SlotState::Idle);
}

#[tokio::test]
async fn test_follow_up_sees_previous_turn() {
    let h = harness(GatedProvider::open(hi));

    h.controller.handle_message(message("7", "hello")).await.unwrap();
    h.controller.handle_message(message("7", "again")).await.unwrap();

    let requests = h.provider.requests();
    let contents: Vec<_> = requests[1]
        .messages
        .iter()
        .map(|m| m.content.as_str())
        .collect();
    assert_eq!(contents, ["You are Zara.", "hello", "hi!", "again"]);

    let turns = h
        .store
        .inner
        .get_dialog_messages(&UserId::from("7"), None)
        .await
        .unwrap();
    assert_eq!(turns.len(), 2);
    assert_eq!(turns[1].user, "again");
    // Only the first contact opens a dialog.
    assert_eq!(h.store.new_dialogs(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_messages_only_one_proceeds() {
    let h = harness(GatedProvider::closed(hi));
    let count = 5;

    let handles: Vec<_> = (0..count)
        .map(|i| {
            let controller = h.controller.clone();
            tokio::spawn(async move {
                controller
                    .handle_message(message("7", &format!("message {i}")))
                    .await
            })
        })
        .collect();

    let transport = h.transport.clone();
    wait_until(|| transport.sent_count(BUSY_NOTICE) == count - 1).await;
    assert_eq!(h.controller.state(&UserId::from("7")), SlotState::Busy);

    h.provider.release(1);
    let mut answered = 0;
    let mut busy = 0;
    for handle in handles {
        match handle.await.unwrap().unwrap() {
            Outcome::Answered(_) => answered += 1,
            Outcome::Busy => busy += 1,
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    assert_eq!((answered, busy), (1, count - 1));
    assert_eq!(h.provider.requests().len(), 1);
    let turns = h
        .store
        .inner
        .get_dialog_messages(&UserId::from("7"), None)
        .await
        .unwrap();
    assert_eq!(turns.len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_different_users_proceed_in_parallel() {
    let h = harness(GatedProvider::closed(hi));

    let a = {
        let controller = h.controller.clone();
        tokio::spawn(async move { controller.handle_message(message("a", "hello")).await })
    };
    let b = {
        let controller = h.controller.clone();
        tokio::spawn(async move { controller.handle_message(message("b", "hello")).await })
    };

    let provider = h.provider.clone();
    wait_until(|| provider.requests().len() == 2).await;
    h.provider.release(2);

    assert!(matches!(a.await.unwrap().unwrap(), Outcome::Answered(_)));
    assert!(matches!(b.await.unwrap().unwrap(), Outcome::Answered(_)));
    assert_eq!(h.transport.sent_count(BUSY_NOTICE), 0);
}

#[tokio::test]
async fn test_idle_user_gets_fresh_dialog() {
    let h = harness(GatedProvider::open(hi));
    let user = UserId::from("7");

    h.store.inner.create_user(new_user("7")).await.unwrap();
    let old_dialog = h.store.inner.start_new_dialog(&user).await.unwrap();
    h.store
        .inner
        .append_turn(&user, Turn::new("yesterday", "hello again"))
        .await
        .unwrap();
    h.store
        .inner
        .touch(&user, Utc::now() - chrono::Duration::hours(25))
        .await
        .unwrap();

    let outcome = h.controller.handle_message(message("7", "hello")).await.unwrap();
    assert_eq!(outcome, Outcome::Answered("hi!".to_string()));

    assert_eq!(h.store.new_dialogs(), 1);
    assert_eq!(h.transport.sent_count(IDLE_RESET_NOTICE), 1);

    // The notice precedes the placeholder of the reply.
    let events = h.transport.events();
    let notice_at = events
        .iter()
        .position(|e| matches!(e, Event::Sent { text, .. } if text == IDLE_RESET_NOTICE))
        .unwrap();
    let placeholder_at = events
        .iter()
        .position(|e| matches!(e, Event::Sent { text, .. } if text == PLACEHOLDER_TEXT))
        .unwrap();
    assert!(notice_at < placeholder_at);

    // The stale history was not sent and stays in the old dialog.
    assert_eq!(h.provider.requests()[0].messages.len(), 2);
    let old_turns = h
        .store
        .inner
        .get_dialog_messages(&user, Some(&old_dialog))
        .await
        .unwrap();
    assert_eq!(old_turns.len(), 1);
    assert_eq!(h.store.inner.list_dialogs(&user).unwrap().len(), 2);
}

#[tokio::test]
async fn test_recent_user_keeps_dialog() {
    let h = harness(GatedProvider::open(hi));
    let user = UserId::from("7");

    h.store.inner.create_user(new_user("7")).await.unwrap();
    h.store.inner.start_new_dialog(&user).await.unwrap();
    h.store
        .inner
        .touch(&user, Utc::now() - chrono::Duration::hours(1))
        .await
        .unwrap();

    h.controller.handle_message(message("7", "hello")).await.unwrap();

    assert_eq!(h.store.new_dialogs(), 0);
    assert_eq!(h.transport.sent_count(IDLE_RESET_NOTICE), 0);
    let last = h.store.inner.last_interaction(&user).await.unwrap().unwrap();
    assert!(Utc::now() - last < chrono::Duration::minutes(1));
}

#[tokio::test]
async fn test_cancel_with_nothing_in_flight() {
    let h = harness(GatedProvider::open(hi));

    let cancelled = h.controller.cancel(&message("7", "/cancel")).await;

    assert!(!cancelled);
    assert_eq!(h.transport.sent_count(NOTHING_TO_CANCEL_NOTICE), 1);
    assert_eq!(h.store.inner.count_users().unwrap(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cancel_in_flight_exchange() {
    let h = harness(GatedProvider::closed(hi));
    let user = UserId::from("7");

    let handle = {
        let controller = h.controller.clone();
        tokio::spawn(async move { controller.handle_message(message("7", "hello")).await })
    };

    let provider = h.provider.clone();
    wait_until(|| provider.requests().len() == 1).await;
    assert!(h.controller.cancel(&message("7", "/cancel")).await);

    assert_eq!(handle.await.unwrap().unwrap(), Outcome::Cancelled);
    assert_eq!(h.transport.last_edit().as_deref(), Some(CANCELED_NOTICE));
    assert!(h
        .store
        .inner
        .get_dialog_messages(&user, None)
        .await
        .unwrap()
        .is_empty());
    let usage = h.store.inner.token_usage(&user, MODEL).await.unwrap();
    assert_eq!((usage.n_input_tokens, usage.n_output_tokens), (0, 0));
    assert_eq!(h.controller.state(&user), SlotState::Idle);

    // The slot is free again.
    h.provider.release(10);
    let outcome = h.controller.handle_message(message("7", "hello")).await.unwrap();
    assert_eq!(outcome, Outcome::Answered("hi!".to_string()));
}

#[tokio::test]
async fn test_upstream_failure_leaves_dialog_untouched() {
    let h = harness(GatedProvider::open(unavailable));
    let user = UserId::from("7");

    let outcome = h.controller.handle_message(message("7", "hello")).await.unwrap();
    let Outcome::Failed(notice) = outcome else {
        panic!("expected failure, got {outcome:?}");
    };
    assert!(!notice.contains("503"));
    assert_eq!(h.transport.last_edit(), Some(notice));

    assert!(h
        .store
        .inner
        .get_dialog_messages(&user, None)
        .await
        .unwrap()
        .is_empty());
    let usage = h.store.inner.token_usage(&user, MODEL).await.unwrap();
    assert_eq!(usage.n_input_tokens, 0);

    // Failure releases the slot.
    let again = h.controller.handle_message(message("7", "hello")).await.unwrap();
    assert!(matches!(again, Outcome::Failed(_)));
    assert_eq!(h.transport.sent_count(BUSY_NOTICE), 0);
}

#[tokio::test]
async fn test_oversized_message_reports_prompt_too_large() {
    let h = harness(GatedProvider::open(overflow));

    let outcome = h.controller.handle_message(message("7", "hello")).await.unwrap();

    match outcome {
        Outcome::Failed(notice) => assert!(notice.contains("too long"), "{notice}"),
        other => panic!("expected failure, got {other:?}"),
    }
    // Empty history: a single attempt.
    assert_eq!(h.provider.requests().len(), 1);
}

#[tokio::test]
async fn test_answer_is_escaped_for_html() {
    fn markup() -> Result<LlmResponse> {
        Ok(LlmResponse {
            content: "use <b> & </b>".to_string(),
            model: MODEL.to_string(),
            usage: None,
            stop_reason: None,
        })
    }
    let h = harness(GatedProvider::open(markup));

    let outcome = h.controller.handle_message(message("7", "hello")).await.unwrap();

    // Stored and returned raw, delivered escaped.
    assert_eq!(outcome, Outcome::Answered("use <b> & </b>".to_string()));
    assert_eq!(
        h.transport.last_edit().as_deref(),
        Some("use &lt;b&gt; &amp; &lt;/b&gt;")
    );
}

#[tokio::test]
async fn test_reset_dialog_starts_new_dialog() {
    let h = harness(GatedProvider::open(hi));
    let user = UserId::from("7");

    h.controller.handle_message(message("7", "hello")).await.unwrap();
    let before = h.store.inner.current_dialog_id(&user).await.unwrap();

    assert!(h.controller.reset_dialog(&message("7", "/new")).await.unwrap());

    let after = h.store.inner.current_dialog_id(&user).await.unwrap();
    assert_ne!(before, after);
    assert_eq!(h.store.new_dialogs(), 2);
    assert_eq!(h.transport.sent_count(NEW_DIALOG_NOTICE), 1);
    assert!(h
        .store
        .inner
        .get_dialog_messages(&user, None)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_start_registers_new_user() {
    let h = harness(GatedProvider::open(hi));
    let user = UserId::from("7");

    assert!(h.controller.start(&message("7", "/start")).await.unwrap());

    assert!(h.store.inner.user_exists(&user).await.unwrap());
    assert!(h.store.inner.current_dialog_id(&user).await.unwrap().is_some());
    // Registration already opened the dialog; no empty archive is left behind.
    assert_eq!(h.store.new_dialogs(), 1);
    assert_eq!(h.store.inner.list_dialogs(&user).unwrap().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_reset_dialog_refused_while_busy() {
    let h = harness(GatedProvider::closed(hi));

    let handle = {
        let controller = h.controller.clone();
        tokio::spawn(async move { controller.handle_message(message("7", "hello")).await })
    };
    let provider = h.provider.clone();
    wait_until(|| provider.requests().len() == 1).await;

    assert!(!h.controller.reset_dialog(&message("7", "/new")).await.unwrap());
    assert_eq!(h.transport.sent_count(BUSY_NOTICE), 1);
    assert_eq!(h.store.new_dialogs(), 1);

    h.provider.release(1);
    assert!(matches!(handle.await.unwrap().unwrap(), Outcome::Answered(_)));
}

#[tokio::test]
async fn test_cancel_after_answer_arrives_discards_it() {
    let h = harness(GatedProvider::open(hi));
    h.provider
        .cancel_before_reply
        .set(Arc::downgrade(&h.controller))
        .unwrap();
    let user = UserId::from("7");

    let outcome = h.controller.handle_message(message("7", "hello")).await.unwrap();

    assert_eq!(outcome, Outcome::Cancelled);
    assert_eq!(h.provider.requests().len(), 1);
    assert_eq!(h.transport.last_edit().as_deref(), Some(CANCELED_NOTICE));
    assert!(h
        .store
        .inner
        .get_dialog_messages(&user, None)
        .await
        .unwrap()
        .is_empty());
    let usage = h.store.inner.token_usage(&user, MODEL).await.unwrap();
    assert_eq!((usage.n_input_tokens, usage.n_output_tokens), (0, 0));
    assert_eq!(h.controller.state(&user), SlotState::Idle);
}

#[tokio::test]
async fn test_store_failure_before_exchange_is_reported() {
    let h = harness_with(
        GatedProvider::open(hi),
        CountingStore::failing_attribute_writes(),
    );
    let user = UserId::from("7");

    let outcome = h.controller.handle_message(message("7", "hello")).await.unwrap();

    let Outcome::Failed(notice) = outcome else {
        panic!("expected failure, got {outcome:?}");
    };
    assert!(!notice.contains("disk full"));
    // Only the notice: no placeholder, no upstream call.
    assert_eq!(
        h.transport.events(),
        vec![Event::Sent {
            text: notice,
            message_id: 1
        }]
    );
    assert!(h.provider.requests().is_empty());
    assert_eq!(h.controller.state(&user), SlotState::Idle);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cancel_during_reset_has_nothing_to_cancel() {
    let h = harness_with(
        GatedProvider::open(hi),
        CountingStore::with_closed_dialog_gate(),
    );

    let reset = {
        let controller = h.controller.clone();
        tokio::spawn(async move { controller.reset_dialog(&message("7", "/new")).await })
    };
    let store = h.store.clone();
    wait_until(|| store.new_dialogs() == 1).await;

    assert!(!h.controller.cancel(&message("7", "/cancel")).await);
    assert_eq!(h.transport.sent_count(NOTHING_TO_CANCEL_NOTICE), 1);

    h.store.dialog_gate.add_permits(1);
    assert!(reset.await.unwrap().unwrap());
    assert_eq!(h.store.new_dialogs(), 1);
    assert_eq!(h.transport.sent_count(NEW_DIALOG_NOTICE), 1);
    assert_eq!(h.transport.sent_count(CANCELED_NOTICE), 0);
}
