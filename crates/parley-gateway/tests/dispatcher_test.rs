use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use parley_agents::{Choice, LlmProvider, LlmRequest, LlmResponse};
use parley_common::{ChatMessage, ChatRole, Error, RequestContext, Result, Session, ToolCall};
use parley_config::AppConfig;
use parley_db::{InMemoryStore, SessionStore, Stores, UserStore};
use parley_gateway::{DispatchOutcome, Gateway, GatewayBuilder, RequestDispatcher};
use serde_json::json;
use tokio::sync::Notify;

enum Step {
    Reply(ChatMessage),
    Fail,
}

/// Scripted provider. Once the script is used up it answers `reply N`,
/// where N counts every call made so far.
struct Provider {
    script: Mutex<VecDeque<Step>>,
    requests: Mutex<Vec<LlmRequest>>,
    delay: Duration,
    started: Notify,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl Provider {
    fn new(script: Vec<Step>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            requests: Mutex::new(Vec::new()),
            delay: Duration::ZERO,
            started: Notify::new(),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    fn requests(&self) -> Vec<LlmRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl LlmProvider for Provider {
    fn provider_id(&self) -> &str {
        "scripted"
    }

    async fn create_chat_completion(&self, request: &LlmRequest) -> Result<LlmResponse> {
        let n = {
            let mut requests = self.requests.lock().unwrap();
            requests.push(request.clone());
            requests.len()
        };
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        self.started.notify_one();
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let step = self.script.lock().unwrap().pop_front();
        let message = match step {
            Some(Step::Reply(message)) => message,
            Some(Step::Fail) => return Err(Error::provider("scripted", "status=503, body=down")),
            None => ChatMessage::assistant(format!("reply {n}")),
        };
        Ok(LlmResponse {
            model: "scripted-model".to_string(),
            choices: vec![Choice {
                message,
                finish_reason: None,
            }],
            usage: None,
        })
    }
}

fn tool_call(id: &str, name: &str, args: serde_json::Value) -> Step {
    Step::Reply(ChatMessage::assistant_with_tools(
        "",
        vec![ToolCall {
            id: id.to_string(),
            name: name.to_string(),
            arguments: args.to_string(),
        }],
    ))
}

struct Harness {
    store: Arc<InMemoryStore>,
    provider: Arc<Provider>,
    dispatcher: Arc<RequestDispatcher>,
}

impl Harness {
    fn new(provider: Provider) -> Self {
        let mut config = AppConfig::default();
        config.database.in_memory = true;
        let store = Arc::new(InMemoryStore::new());
        let provider = Arc::new(provider);
        let gateway = GatewayBuilder::new(&config, Stores::full(Arc::clone(&store)))
            .provider(provider.clone())
            .build()
            .unwrap();
        Self {
            store,
            provider,
            dispatcher: gateway.dispatcher,
        }
    }

    async fn send(&self, user: &str, text: &str) -> Result<DispatchOutcome> {
        self.dispatcher.dispatch(&RequestContext::new(user), text).await
    }

    async fn session(&self, id: &str) -> Session {
        self.store.get(id).await.unwrap()
    }
}

fn contents(session: &Session) -> Vec<&str> {
    session.msgs.iter().map(|m| m.message.content.as_str()).collect()
}

fn replied(outcome: DispatchOutcome) -> Vec<String> {
    match outcome {
        DispatchOutcome::Replied(replies) => replies,
        DispatchOutcome::Queued => panic!("expected replies, message was queued"),
    }
}

#[tokio::test]
async fn first_message_creates_session() {
    let h = Harness::new(Provider::new(vec![]));

    let replies = replied(h.send("alice", "hello there").await.unwrap());
    assert_eq!(replies, ["reply 1"]);

    let session = h.session("alice-l-s0001").await;
    assert_eq!(contents(&session), ["hello there", "reply 1"]);
    assert_eq!(session.msgs[0].id, "alice-l-s0001-m1");
    assert_eq!(session.msgs[1].id, "alice-l-s0001-m2");
    assert_eq!(session.model.as_deref(), Some("scripted-model"));
    assert_eq!(h.store.messages_for("alice-l-s0001").len(), 2);

    let user = h.store.get_user("alice").await.unwrap().unwrap();
    assert_eq!(
        user.active_session(parley_common::AgentType::Low),
        Some("alice-l-s0001")
    );

    // the second turn lands in the same session with the history attached
    h.send("alice", "and again").await.unwrap();
    let session = h.session("alice-l-s0001").await;
    assert_eq!(session.msgs.len(), 4);
    let last = h.provider.requests().pop().unwrap();
    assert!(last.messages.iter().any(|m| m.content == "hello there"));
}

#[tokio::test(start_paused = true)]
async fn messages_sent_mid_turn_fold_into_it() {
    let h = Harness::new(Provider::new(vec![]).with_delay(Duration::from_millis(100)));

    let running = tokio::spawn({
        let dispatcher = Arc::clone(&h.dispatcher);
        async move {
            dispatcher
                .dispatch(&RequestContext::new("alice"), "first")
                .await
        }
    });
    h.provider.started.notified().await;

    assert_eq!(h.send("alice", "second").await.unwrap(), DispatchOutcome::Queued);
    assert_eq!(h.send("alice", "third").await.unwrap(), DispatchOutcome::Queued);

    let replies = replied(running.await.unwrap().unwrap());
    assert_eq!(replies, ["reply 2"]);
    assert_eq!(h.provider.max_in_flight.load(Ordering::SeqCst), 1);

    let session = h.session("alice-l-s0001").await;
    assert_eq!(
        contents(&session),
        ["first", "reply 1", "second", "third", "reply 2"]
    );
    // the combined reply is requested without tools
    assert!(h.provider.requests()[1].tools.is_empty());
    assert!(!h.dispatcher.progress().is_in_progress("alice"));
    assert_eq!(h.dispatcher.progress().queued_len("alice"), 0);
}

#[tokio::test(start_paused = true)]
async fn late_arrivals_become_the_next_turn() {
    let h = Harness::new(Provider::new(vec![]).with_delay(Duration::from_millis(100)));

    let running = tokio::spawn({
        let dispatcher = Arc::clone(&h.dispatcher);
        async move { dispatcher.dispatch(&RequestContext::new("bob"), "one").await }
    });

    h.provider.started.notified().await;
    assert_eq!(h.send("bob", "two").await.unwrap(), DispatchOutcome::Queued);
    // second call: the tool-less follow-up that folded in "two"
    h.provider.started.notified().await;
    assert_eq!(h.send("bob", "three").await.unwrap(), DispatchOutcome::Queued);

    let replies = replied(running.await.unwrap().unwrap());
    assert_eq!(replies, ["reply 2", "reply 3"]);
    assert_eq!(h.provider.max_in_flight.load(Ordering::SeqCst), 1);

    let session = h.session("bob-l-s0001").await;
    assert_eq!(
        contents(&session),
        ["one", "reply 1", "two", "reply 2", "three", "reply 3"]
    );
}

#[tokio::test(start_paused = true)]
async fn different_users_run_concurrently() {
    let h = Harness::new(Provider::new(vec![]).with_delay(Duration::from_millis(100)));

    let (a, b) = tokio::join!(h.send("alice", "hello"), h.send("bob", "hello"));
    assert!(matches!(a.unwrap(), DispatchOutcome::Replied(_)));
    assert!(matches!(b.unwrap(), DispatchOutcome::Replied(_)));
    assert_eq!(h.provider.max_in_flight.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn failed_turn_leaves_session_untouched() {
    let h = Harness::new(Provider::new(vec![Step::Fail]));

    let err = h.send("carol", "are you there").await.unwrap_err();
    assert!(matches!(err, Error::Provider { status: Some(503), .. }));

    let session = h.session("carol-l-s0001").await;
    assert!(session.msgs.is_empty());
    assert!(!h.dispatcher.progress().is_in_progress("carol"));

    let replies = replied(h.send("carol", "are you there now").await.unwrap());
    assert_eq!(replies, ["reply 2"]);
    let session = h.session("carol-l-s0001").await;
    assert_eq!(contents(&session), ["are you there now", "reply 2"]);
}

fn tool_ids(store: &InMemoryStore, session_id: &str) -> Vec<String> {
    let mut ids: Vec<String> = store
        .tool_calls_for(session_id)
        .into_iter()
        .map(|r| r.id)
        .collect();
    ids.sort();
    ids
}

#[tokio::test]
async fn tool_ids_stay_unique_after_a_failed_turn() {
    let h = Harness::new(Provider::new(vec![
        tool_call("c1", "current_time", json!({})),
        Step::Fail,
        tool_call("c2", "current_time", json!({})),
        Step::Reply(ChatMessage::assistant("It is noon.")),
    ]));

    h.send("pat", "what time is it").await.unwrap_err();
    let session = h.session("pat-l-s0001").await;
    assert!(session.msgs.is_empty());
    assert_eq!(session.sequences.tool_seq(), 1);

    let replies = replied(h.send("pat", "what time is it now").await.unwrap());
    assert_eq!(replies, ["It is noon."]);
    assert_eq!(
        tool_ids(&h.store, "pat-l-s0001"),
        ["pat-l-s0001-t1", "pat-l-s0001-t2"]
    );
}

#[tokio::test]
async fn tool_ids_stay_unique_after_an_escalation() {
    let h = Harness::new(Provider::new(vec![
        tool_call("c1", "current_time", json!({})),
        tool_call("e1", "escalate", json!({"reason": "hard"})),
        Step::Reply(ChatMessage::assistant("Deep answer.")),
        tool_call("c2", "current_time", json!({})),
        Step::Reply(ChatMessage::assistant("Quick answer.")),
    ]));

    let replies = replied(h.send("quin", "plan my week").await.unwrap());
    assert_eq!(replies, ["Deep answer."]);
    assert!(h.session("quin-l-s0001").await.msgs.is_empty());

    let replies = replied(h.send("quin", "and the time?").await.unwrap());
    assert_eq!(replies, ["Quick answer."]);
    assert_eq!(
        tool_ids(&h.store, "quin-l-s0001"),
        ["quin-l-s0001-t1", "quin-l-s0001-t2"]
    );
}

#[tokio::test(start_paused = true)]
async fn leftovers_from_a_failed_turn_go_before_newer_messages() {
    let h = Harness::new(
        Provider::new(vec![
            Step::Reply(ChatMessage::assistant("first answer")),
            Step::Fail,
        ])
        .with_delay(Duration::from_millis(100)),
    );

    let running = tokio::spawn({
        let dispatcher = Arc::clone(&h.dispatcher);
        async move { dispatcher.dispatch(&RequestContext::new("ivy"), "A").await }
    });
    h.provider.started.notified().await;
    assert_eq!(h.send("ivy", "B").await.unwrap(), DispatchOutcome::Queued);

    // the combined reply for A and B fails; B waits for the next turn
    let err = running.await.unwrap().unwrap_err();
    assert!(matches!(err, Error::Provider { status: Some(503), .. }));
    assert_eq!(h.dispatcher.progress().queued_len("ivy"), 1);

    // B runs first and C, waiting behind it, is folded into that turn
    let replies = replied(h.send("ivy", "C").await.unwrap());
    assert_eq!(replies, ["reply 4"]);

    let session = h.session("ivy-l-s0001").await;
    assert_eq!(contents(&session), ["B", "reply 3", "C", "reply 4"]);
    assert_eq!(h.dispatcher.progress().queued_len("ivy"), 0);
    assert!(!h.dispatcher.progress().is_in_progress("ivy"));
}

#[tokio::test]
async fn clarification_round_trip() {
    let h = Harness::new(Provider::new(vec![
        tool_call("c1", "ask_user", json!({"question": "Which city?"})),
        Step::Reply(ChatMessage::assistant("Sunny in Paris.")),
    ]));

    let replies = replied(h.send("dana", "what's the weather").await.unwrap());
    assert_eq!(replies, ["Which city?"]);

    let session = h.session("dana-l-s0001").await;
    let pending = session.pending_clarification.clone().unwrap();
    assert_eq!(pending.tool_call_id, "c1");
    assert_eq!(session.msgs.len(), 2);

    let replies = replied(h.send("dana", "Paris").await.unwrap());
    assert_eq!(replies, ["Sunny in Paris."]);

    let session = h.session("dana-l-s0001").await;
    assert!(session.pending_clarification.is_none());
    let answer = &session.msgs[2].message;
    assert_eq!(answer.role, ChatRole::Tool);
    assert_eq!(answer.tool_call_id.as_deref(), Some("c1"));
    assert_eq!(answer.content, "Paris");
    assert_eq!(session.msgs[3].message.content, "Sunny in Paris.");
}

#[tokio::test]
async fn escalation_runs_on_the_stronger_agent() {
    let h = Harness::new(Provider::new(vec![
        tool_call("e1", "escalate", json!({"reason": "needs analysis"})),
        Step::Reply(ChatMessage::assistant("Thorough answer.")),
    ]));

    let replies = replied(h.send("erin", "compare these contracts").await.unwrap());
    assert_eq!(replies, ["Thorough answer."]);

    let requests = h.provider.requests();
    assert!(requests[0].tools.iter().any(|t| t.name == "escalate"));
    // the stronger agent never gets the escalation tool
    assert!(requests[1].tools.iter().all(|t| t.name != "escalate"));

    let high = h.session("erin-h-s0001").await;
    assert_eq!(contents(&high), ["compare these contracts", "Thorough answer."]);

    // the weaker agent's partial turn is dropped
    let low = h.session("erin-l-s0001").await;
    assert!(low.msgs.is_empty());
}

#[tokio::test]
async fn repeated_gibberish_leads_to_a_ban() {
    // repeat offenses are confirmed by the model before they count
    let h = Harness::new(Provider::new(vec![
        Step::Reply(ChatMessage::assistant("YES")),
        Step::Reply(ChatMessage::assistant("YES")),
    ]));

    for _ in 0..2 {
        let replies = replied(h.send("mallory", "zzzzzzzzzzzz").await.unwrap());
        assert_eq!(replies.len(), 1);
    }
    h.send("mallory", "zzzzzzzzzzzz").await.unwrap();

    let user = h.store.get_user("mallory").await.unwrap().unwrap();
    assert!(user.is_banned);
    assert_eq!(user.nonsense_count, 3);

    let replies = replied(h.send("mallory", "sorry about that").await.unwrap());
    assert_eq!(replies.len(), 1);

    let requests = h.provider.requests();
    assert_eq!(requests.len(), 2);
    assert!(requests.iter().all(|r| r.max_tokens == Some(3)));
    assert!(requests.iter().all(|r| r.model == AppConfig::default().llm.model));
}

#[tokio::test]
async fn stored_session_is_adopted_when_user_record_is_missing() {
    let h = Harness::new(Provider::new(vec![]));
    let mut existing = Session::new("frank", parley_common::AgentType::Low, 3);
    existing.push_message(ChatMessage::user("old question"));
    existing.push_message(ChatMessage::assistant("old answer"));
    h.store.put(&existing).await.unwrap();

    h.send("frank", "new question").await.unwrap();

    let session = h.session("frank-l-s0003").await;
    assert_eq!(session.msgs.len(), 4);
    let user = h.store.get_user("frank").await.unwrap().unwrap();
    assert_eq!(
        user.active_session(parley_common::AgentType::Low),
        Some("frank-l-s0003")
    );
}

#[tokio::test]
async fn sqlite_gateway_persists_across_restart() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = AppConfig::default();
    config.database.path = Some(dir.path().join("parley.db"));

    {
        let stores = parley_gateway::open_stores(&config).unwrap();
        let gateway = GatewayBuilder::new(&config, stores)
            .provider(Arc::new(Provider::new(vec![])))
            .build()
            .unwrap();
        gateway
            .dispatcher
            .dispatch(&RequestContext::new("gina"), "remember me")
            .await
            .unwrap();
    }

    let stores = parley_gateway::open_stores(&config).unwrap();
    let session = stores.sessions.get("gina-l-s0001").await.unwrap();
    assert_eq!(contents(&session), ["remember me", "reply 1"]);

    let gateway: Gateway = GatewayBuilder::new(&config, stores)
        .provider(Arc::new(Provider::new(vec![])))
        .build()
        .unwrap();
    gateway
        .dispatcher
        .dispatch(&RequestContext::new("gina"), "still there?")
        .await
        .unwrap();
    let session = gateway.stores.sessions.get("gina-l-s0001").await.unwrap();
    assert_eq!(session.msgs.len(), 4);
    assert_eq!(session.msgs[2].id, "gina-l-s0001-m3");
}
