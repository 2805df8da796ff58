/// Sync loop scenarios with a scripted server and push channel
use async_trait::async_trait;
use chrono::NaiveDate;
use parley_core::channel::{ChannelEvent, ConnectionState, Outbox};
use parley_core::config::Config;
use parley_core::engine::{Phase, SyncEngine, ViewState};
use parley_core::fetcher::StateFetcher;
use parley_core::messenger_types::{
    Conversation, ConversationId, Identity, InboundEvent, Message, SendCommand, UserId,
};
use parley_core::runtime::{ChatRuntime, ClientHandle};
use parley_core::{ChatError, Result};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};

const ME: UserId = UserId(1);
const WAIT: Duration = Duration::from_secs(5);

fn me() -> Identity {
    Identity {
        id: ME,
        username: "alice".to_string(),
    }
}

fn bob() -> Identity {
    Identity {
        id: UserId(2),
        username: "bob".to_string(),
    }
}

fn conversation(id: i64, peer: i64) -> Conversation {
    Conversation {
        id: ConversationId(id),
        user_a: ME,
        user_b: UserId(peer),
    }
}

fn message(conversation: i64, sender: UserId, content: &str) -> Message {
    Message {
        id: Some(1),
        conversation_id: Some(ConversationId(conversation)),
        sender_id: sender,
        content: content.to_string(),
        timestamp: NaiveDate::from_ymd_opt(2024, 5, 1)
            .unwrap()
            .and_hms_opt(10, 0, 0)
            .unwrap(),
        provenance: Default::default(),
    }
}

fn inbound(conversation: i64, sender: UserId) -> ChannelEvent {
    ChannelEvent::Inbound(InboundEvent {
        conversation_id: ConversationId(conversation),
        sender_id: Some(sender),
        content: Some("ping".to_string()),
        timestamp: None,
    })
}

/// Canned server state; history for a gated conversation waits for `release`
#[derive(Default)]
struct ScriptedServer {
    conversations: Mutex<Vec<Conversation>>,
    history: Mutex<HashMap<ConversationId, Vec<Message>>>,
    gates: Mutex<HashMap<ConversationId, Arc<Notify>>>,
    directory: Vec<Identity>,
    lookups: Mutex<Vec<String>>,
}

impl ScriptedServer {
    fn set_history(&self, conversation: i64, messages: Vec<Message>) {
        self.history
            .lock()
            .unwrap()
            .insert(ConversationId(conversation), messages);
    }

    fn gate(&self, conversation: i64) {
        self.gates
            .lock()
            .unwrap()
            .insert(ConversationId(conversation), Arc::new(Notify::new()));
    }

    fn release(&self, conversation: i64) {
        if let Some(gate) = self.gates.lock().unwrap().get(&ConversationId(conversation)) {
            gate.notify_one();
        }
    }
}

#[async_trait]
impl StateFetcher for ScriptedServer {
    async fn conversations(&self, _user: UserId) -> Result<Vec<Conversation>> {
        Ok(self.conversations.lock().unwrap().clone())
    }

    async fn message_history(&self, conversation: ConversationId) -> Result<Vec<Message>> {
        let gate = self.gates.lock().unwrap().get(&conversation).cloned();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        Ok(self
            .history
            .lock()
            .unwrap()
            .get(&conversation)
            .cloned()
            .unwrap_or_default())
    }

    async fn search_identities(&self, query: &str) -> Result<Vec<Identity>> {
        self.lookups.lock().unwrap().push(query.to_string());
        Ok(self
            .directory
            .iter()
            .filter(|u| u.username.contains(query))
            .cloned()
            .collect())
    }
}

/// Push channel stand-in recording every command
#[derive(Clone)]
struct RecordingOutbox {
    sent: Arc<Mutex<Vec<SendCommand>>>,
    state: Arc<Mutex<ConnectionState>>,
    closed: Arc<Mutex<bool>>,
}

impl RecordingOutbox {
    fn new() -> Self {
        Self {
            sent: Arc::new(Mutex::new(Vec::new())),
            state: Arc::new(Mutex::new(ConnectionState::Connected)),
            closed: Arc::new(Mutex::new(false)),
        }
    }
}

impl Outbox for RecordingOutbox {
    fn push(&self, command: SendCommand) -> Result<()> {
        let state = *self.state.lock().unwrap();
        if state != ConnectionState::Connected {
            return Err(ChatError::ChannelUnavailable(format!("{:?}", state)));
        }
        self.sent.lock().unwrap().push(command);
        Ok(())
    }

    fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap()
    }

    fn close(&self) {
        *self.closed.lock().unwrap() = true;
    }
}

struct Harness {
    client: ClientHandle,
    server: Arc<ScriptedServer>,
    outbox: RecordingOutbox,
    events: mpsc::UnboundedSender<ChannelEvent>,
    sync_loop: JoinHandle<Result<()>>,
}

fn start(server: ScriptedServer, debounce: Duration) -> Harness {
    let config = Config {
        search_debounce: debounce,
        ..Default::default()
    };
    let server = Arc::new(server);
    let outbox = RecordingOutbox::new();
    let (events, events_rx) = mpsc::unbounded_channel();

    let mut engine = SyncEngine::new(me());
    engine.attach_outbox(Box::new(outbox.clone()));
    let (runtime, client) = ChatRuntime::new(&config, engine, server.clone(), events_rx);
    let sync_loop = tokio::spawn(runtime.run());

    Harness {
        client,
        server,
        outbox,
        events,
        sync_loop,
    }
}

/// Wait until the published view satisfies `done`
async fn wait_for(client: &mut ClientHandle, done: impl Fn(&ViewState) -> bool) -> ViewState {
    let current = client.view();
    if done(&current) {
        return current;
    }
    timeout(WAIT, async {
        loop {
            let view = client.changed().await.unwrap();
            if done(&view) {
                return view;
            }
        }
    })
    .await
    .expect("view never reached the expected state")
}

fn two_conversations() -> ScriptedServer {
    let server = ScriptedServer {
        directory: vec![me(), bob()],
        ..Default::default()
    };
    *server.conversations.lock().unwrap() = vec![conversation(10, 2), conversation(11, 3)];
    server.set_history(10, vec![message(10, UserId(2), "from A")]);
    server.set_history(11, vec![message(11, UserId(3), "from B")]);
    server
}

#[tokio::test]
async fn test_initial_list_is_fetched() {
    let mut h = start(two_conversations(), Duration::ZERO);
    let view = wait_for(&mut h.client, |v| v.conversations.len() == 2).await;
    assert_eq!(view.phase, Phase::NoConversation);
    assert_eq!(view.connection, ConnectionState::Connected);
}

#[tokio::test]
async fn test_stale_history_is_discarded() {
    let server = two_conversations();
    server.gate(10);
    let mut h = start(server, Duration::ZERO);

    h.client.open(conversation(10, 2)).unwrap();
    h.client.open(conversation(11, 3)).unwrap();
    let view = wait_for(&mut h.client, |v| v.phase == Phase::Active(ConversationId(11))).await;
    assert_eq!(view.messages[0].content, "from B");

    // A's answer shows up late and must not replace B's messages
    h.server.release(10);
    sleep(Duration::from_millis(100)).await;
    h.client.refresh().unwrap();
    sleep(Duration::from_millis(100)).await;

    let view = h.client.view();
    assert_eq!(view.phase, Phase::Active(ConversationId(11)));
    assert_eq!(view.messages_for, Some(ConversationId(11)));
    assert_eq!(view.messages.len(), 1);
    assert_eq!(view.messages[0].content, "from B");
    assert_eq!(view.peer, Some(UserId(3)));
}

#[tokio::test]
async fn test_inbound_auto_opens_when_nothing_is_active() {
    let mut h = start(two_conversations(), Duration::ZERO);
    wait_for(&mut h.client, |v| v.conversations.len() == 2).await;

    h.events.send(inbound(10, UserId(2))).unwrap();
    let view = wait_for(&mut h.client, |v| v.phase == Phase::Active(ConversationId(10))).await;
    assert_eq!(view.peer, Some(UserId(2)));
    assert_eq!(view.messages[0].content, "from A");
}

#[tokio::test]
async fn test_first_of_several_inbound_events_wins() {
    let server = two_conversations();
    server.set_history(12, vec![message(12, UserId(4), "from C")]);
    server.gate(10);
    let mut h = start(server, Duration::ZERO);
    wait_for(&mut h.client, |v| v.conversations.len() == 2).await;

    h.events.send(inbound(10, UserId(2))).unwrap();
    h.events.send(inbound(11, UserId(3))).unwrap();
    h.events.send(inbound(12, UserId(4))).unwrap();
    let view = wait_for(&mut h.client, |v| v.phase == Phase::Loading(ConversationId(10))).await;
    assert!(view.messages.is_empty());

    h.server.release(10);
    let view = wait_for(&mut h.client, |v| v.phase == Phase::Active(ConversationId(10))).await;
    assert_eq!(view.messages_for, Some(ConversationId(10)));
    assert_eq!(view.messages.len(), 1);
    assert_eq!(view.messages[0].content, "from A");
    assert_eq!(view.peer, Some(UserId(2)));

    sleep(Duration::from_millis(100)).await;
    assert_eq!(h.client.view().phase, Phase::Active(ConversationId(10)));
}

#[tokio::test]
async fn test_inbound_for_other_conversation_leaves_pane_alone() {
    let mut h = start(two_conversations(), Duration::ZERO);
    h.client.open(conversation(10, 2)).unwrap();
    wait_for(&mut h.client, |v| v.phase == Phase::Active(ConversationId(10))).await;

    *h.server.conversations.lock().unwrap() = vec![
        conversation(10, 2),
        conversation(11, 3),
        conversation(12, 4),
    ];
    h.events.send(inbound(11, UserId(3))).unwrap();

    let view = wait_for(&mut h.client, |v| v.conversations.len() == 3).await;
    assert_eq!(view.phase, Phase::Active(ConversationId(10)));
    assert_eq!(view.messages[0].content, "from A");
}

#[tokio::test]
async fn test_send_is_optimistic_until_history_confirms() {
    let mut h = start(two_conversations(), Duration::ZERO);
    h.client.open(conversation(10, 2)).unwrap();
    wait_for(&mut h.client, |v| v.phase == Phase::Active(ConversationId(10))).await;

    h.client.send("hello").await.unwrap();
    let view = h.client.view();
    assert_eq!(view.messages.len(), 2);
    assert!(view.messages[1].is_optimistic());
    assert_eq!(view.messages[1].content, "hello");
    assert_eq!(
        h.outbox.sent.lock().unwrap().clone(),
        vec![SendCommand {
            to: UserId(2),
            conversation_id: Some(ConversationId(10)),
            content: "hello".to_string(),
        }]
    );

    // Server stores it and announces the activity
    h.server.set_history(
        10,
        vec![message(10, UserId(2), "from A"), message(10, ME, "hello")],
    );
    h.events.send(inbound(10, ME)).unwrap();
    let view = wait_for(&mut h.client, |v| {
        v.messages.len() == 2 && !v.messages[1].is_optimistic()
    })
    .await;
    assert_eq!(view.messages[1].content, "hello");
}

#[tokio::test]
async fn test_send_rejections() {
    let mut h = start(two_conversations(), Duration::ZERO);

    assert!(matches!(h.client.send("   ").await, Err(ChatError::EmptyMessage)));
    assert!(matches!(h.client.send("hi").await, Err(ChatError::NoRecipient)));

    h.client.open(conversation(10, 2)).unwrap();
    wait_for(&mut h.client, |v| v.phase == Phase::Active(ConversationId(10))).await;

    *h.outbox.state.lock().unwrap() = ConnectionState::Disconnected;
    h.events
        .send(ChannelEvent::State(ConnectionState::Disconnected))
        .unwrap();
    wait_for(&mut h.client, |v| v.connection == ConnectionState::Disconnected).await;

    assert!(matches!(
        h.client.send("hi").await,
        Err(ChatError::ChannelUnavailable(_))
    ));
    assert!(h.outbox.sent.lock().unwrap().is_empty());
    assert_eq!(h.client.view().messages.len(), 1);
}

#[tokio::test]
async fn test_start_chat_from_search() {
    let mut h = start(ScriptedServer {
        directory: vec![me(), bob()],
        ..Default::default()
    }, Duration::ZERO);

    h.client.search("b").unwrap();
    let view = wait_for(&mut h.client, |v| !v.search.results.is_empty()).await;
    assert_eq!(view.search.results, vec![bob()]);

    h.client.start_chat(bob()).await.unwrap();
    let view = h.client.view();
    assert!(view.search.results.is_empty());
    assert_eq!(view.peer, Some(UserId(2)));
    assert_eq!(view.phase, Phase::NoConversation);
    assert_eq!(
        h.outbox.sent.lock().unwrap().clone(),
        vec![SendCommand {
            to: UserId(2),
            conversation_id: None,
            content: "Hi".to_string(),
        }]
    );

    // The server creates conversation 12 and announces it
    *h.server.conversations.lock().unwrap() = vec![conversation(12, 2)];
    h.server.set_history(12, vec![message(12, ME, "Hi")]);
    h.events.send(inbound(12, ME)).unwrap();

    // Sender is me, so the recipient comes from the refreshed list
    let view = wait_for(&mut h.client, |v| {
        v.phase == Phase::Active(ConversationId(12)) && v.peer.is_some()
    })
    .await;
    assert_eq!(view.peer, Some(UserId(2)));
    assert_eq!(view.messages[0].content, "Hi");
}

#[tokio::test]
async fn test_search_is_debounced_and_excludes_self() {
    let mut h = start(ScriptedServer {
        directory: vec![me(), bob()],
        ..Default::default()
    }, Duration::from_millis(100));

    h.client.search("a").unwrap();
    h.client.search("al").unwrap();
    h.client.search("ali").unwrap();
    sleep(Duration::from_millis(300)).await;
    assert_eq!(h.server.lookups.lock().unwrap().clone(), vec!["ali".to_string()]);
    // alice matched but is filtered out
    assert!(h.client.view().search.results.is_empty());

    h.client.search("bo").unwrap();
    let view = wait_for(&mut h.client, |v| !v.search.results.is_empty()).await;
    assert_eq!(view.search.results, vec![bob()]);

    let lookups = h.server.lookups.lock().unwrap().len();
    h.client.search("").unwrap();
    wait_for(&mut h.client, |v| v.search.results.is_empty()).await;
    h.client.search("   ").unwrap();
    sleep(Duration::from_millis(300)).await;
    assert_eq!(h.server.lookups.lock().unwrap().len(), lookups);
}

#[tokio::test]
async fn test_logout_closes_channel_and_stops_loop() {
    let mut h = start(two_conversations(), Duration::ZERO);
    h.client.open(conversation(10, 2)).unwrap();
    wait_for(&mut h.client, |v| v.phase == Phase::Active(ConversationId(10))).await;

    h.client.logout().unwrap();
    timeout(WAIT, h.sync_loop).await.unwrap().unwrap().unwrap();

    assert!(*h.outbox.closed.lock().unwrap());
    assert_eq!(h.client.view(), ViewState::default());
    assert!(h.client.refresh().is_err());
}

#[tokio::test]
async fn test_dropping_client_stops_loop() {
    let h = start(two_conversations(), Duration::ZERO);
    let Harness {
        client,
        outbox,
        sync_loop,
        ..
    } = h;
    drop(client);
    timeout(WAIT, sync_loop).await.unwrap().unwrap().unwrap();
    assert!(*outbox.closed.lock().unwrap());
}
