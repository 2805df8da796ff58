/// Engine driver: one loop owns the `SyncEngine` and processes user intents,
/// push channel events and finished queries one at a time
use crate::channel::{ChannelEvent, ConnectionState};
use crate::config::Config;
use crate::engine::{Completion, Effect, SyncEngine, ViewState};
use crate::error::{ChatError, Result};
use crate::fetcher::StateFetcher;
use crate::messenger_types::{Conversation, Identity};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// Requests from the presentation layer
#[derive(Debug)]
pub enum Intent {
    Open(Conversation),
    Send {
        text: String,
        reply: oneshot::Sender<Result<()>>,
    },
    Search(String),
    StartChat {
        peer: Identity,
        reply: oneshot::Sender<Result<()>>,
    },
    SetDraft(String),
    Refresh,
    Logout,
}

fn stopped() -> ChatError {
    ChatError::Session("chat client has stopped".to_string())
}

/// Presentation-side handle: submit intents, watch the view
#[derive(Clone)]
pub struct ClientHandle {
    intents: mpsc::UnboundedSender<Intent>,
    view: watch::Receiver<ViewState>,
}

impl ClientHandle {
    fn submit(&self, intent: Intent) -> Result<()> {
        self.intents.send(intent).map_err(|_| stopped())
    }

    pub fn open(&self, conversation: Conversation) -> Result<()> {
        self.submit(Intent::Open(conversation))
    }

    /// Resolves once the engine accepted or rejected the send
    pub async fn send(&self, text: impl Into<String>) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.submit(Intent::Send {
            text: text.into(),
            reply,
        })?;
        rx.await.map_err(|_| stopped())?
    }

    pub fn search(&self, text: impl Into<String>) -> Result<()> {
        self.submit(Intent::Search(text.into()))
    }

    pub async fn start_chat(&self, peer: Identity) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.submit(Intent::StartChat { peer, reply })?;
        rx.await.map_err(|_| stopped())?
    }

    pub fn set_draft(&self, text: impl Into<String>) -> Result<()> {
        self.submit(Intent::SetDraft(text.into()))
    }

    pub fn refresh(&self) -> Result<()> {
        self.submit(Intent::Refresh)
    }

    pub fn logout(&self) -> Result<()> {
        self.submit(Intent::Logout)
    }

    /// Latest published view
    pub fn view(&self) -> ViewState {
        self.view.borrow().clone()
    }

    /// Wait for the next published view
    pub async fn changed(&mut self) -> Result<ViewState> {
        self.view.changed().await.map_err(|_| stopped())?;
        Ok(self.view.borrow_and_update().clone())
    }
}

pub struct ChatRuntime {
    engine: SyncEngine,
    fetcher: Arc<dyn StateFetcher>,
    intents: mpsc::UnboundedReceiver<Intent>,
    events: mpsc::UnboundedReceiver<ChannelEvent>,
    completions_tx: mpsc::UnboundedSender<Completion>,
    completions: mpsc::UnboundedReceiver<Completion>,
    view_tx: watch::Sender<ViewState>,
    latest_search: Arc<AtomicU64>,
    search_debounce: Duration,
    greeting: String,
}

impl ChatRuntime {
    /// `engine` should already have the session's outbox attached;
    /// `events` is the receiving side of that same channel.
    pub fn new(
        config: &Config,
        engine: SyncEngine,
        fetcher: Arc<dyn StateFetcher>,
        events: mpsc::UnboundedReceiver<ChannelEvent>,
    ) -> (Self, ClientHandle) {
        let (intents_tx, intents) = mpsc::unbounded_channel();
        let (completions_tx, completions) = mpsc::unbounded_channel();
        let (view_tx, view_rx) = watch::channel(engine.view().clone());

        let runtime = Self {
            engine,
            fetcher,
            intents,
            events,
            completions_tx,
            completions,
            view_tx,
            latest_search: Arc::new(AtomicU64::new(0)),
            search_debounce: config.search_debounce,
            greeting: config.greeting.clone(),
        };
        let handle = ClientHandle {
            intents: intents_tx,
            view: view_rx,
        };
        (runtime, handle)
    }

    /// Run until logout or until every `ClientHandle` is dropped
    pub async fn run(mut self) -> Result<()> {
        info!("Sync loop started for {}", self.engine.me().username);
        let initial = self.engine.refresh_conversations();
        self.dispatch(vec![initial]);

        let mut channel_open = true;
        loop {
            tokio::select! {
                intent = self.intents.recv() => match intent {
                    Some(intent) => {
                        if !self.handle_intent(intent) {
                            break;
                        }
                    }
                    None => {
                        debug!("All client handles dropped");
                        self.engine.logout();
                        break;
                    }
                },
                event = self.events.recv(), if channel_open => match event {
                    Some(ChannelEvent::Inbound(event)) => {
                        let effects = self.engine.handle_inbound(&event);
                        self.dispatch(effects);
                    }
                    Some(ChannelEvent::State(state)) => {
                        self.engine.set_connection(state);
                    }
                    None => {
                        channel_open = false;
                        self.engine.set_connection(ConnectionState::Disconnected);
                    }
                },
                Some(done) = self.completions.recv() => {
                    self.engine.apply(done);
                }
            }
            self.publish();
        }

        self.publish();
        info!("Sync loop stopped");
        Ok(())
    }

    /// Returns false once the session is over
    fn handle_intent(&mut self, intent: Intent) -> bool {
        match intent {
            Intent::Open(conversation) => {
                let effects = self.engine.open_conversation(&conversation);
                self.dispatch(effects);
            }
            Intent::Send { text, reply } => {
                let result = self.engine.send_message(&text);
                if let Err(e) = &result {
                    warn!("Send rejected: {}", e);
                }
                // Callers read the view as soon as the reply lands
                self.publish();
                let _ = reply.send(result);
            }
            Intent::Search(text) => {
                let effect = self.engine.search(&text);
                self.latest_search
                    .store(self.engine.search_generation(), Ordering::SeqCst);
                if let Some(effect) = effect {
                    self.dispatch(vec![effect]);
                }
            }
            Intent::StartChat { peer, reply } => {
                let result = self.engine.start_conversation_with_peer(&peer, &self.greeting);
                if let Err(e) = &result {
                    warn!("Starting chat with {} rejected: {}", peer.username, e);
                }
                self.latest_search
                    .store(self.engine.search_generation(), Ordering::SeqCst);
                self.publish();
                let _ = reply.send(result);
            }
            Intent::SetDraft(text) => self.engine.set_draft(&text),
            Intent::Refresh => {
                let effects = self.engine.refresh();
                self.dispatch(effects);
            }
            Intent::Logout => {
                self.engine.logout();
                return false;
            }
        }
        true
    }

    /// Run each query on its own task; results come back through `completions`
    fn dispatch(&self, effects: Vec<Effect>) {
        for effect in effects {
            let fetcher = self.fetcher.clone();
            let done = self.completions_tx.clone();
            match effect {
                Effect::FetchHistory(ticket) => {
                    tokio::spawn(async move {
                        let result = fetcher.message_history(ticket.conversation).await;
                        let _ = done.send(Completion::History { ticket, result });
                    });
                }
                Effect::FetchConversations { user, generation } => {
                    tokio::spawn(async move {
                        let result = fetcher.conversations(user).await;
                        let _ = done.send(Completion::Conversations { generation, result });
                    });
                }
                Effect::Search(ticket) => {
                    let latest = self.latest_search.clone();
                    let debounce = self.search_debounce;
                    tokio::spawn(async move {
                        if !debounce.is_zero() {
                            sleep(debounce).await;
                        }
                        if latest.load(Ordering::SeqCst) != ticket.generation {
                            debug!("Search {:?} superseded before lookup", ticket.query);
                            return;
                        }
                        let result = fetcher.search_identities(&ticket.query).await;
                        let _ = done.send(Completion::Search { ticket, result });
                    });
                }
            }
        }
    }

    fn publish(&self) {
        let view = self.engine.view();
        self.view_tx.send_if_modified(|current| {
            if *current != *view {
                *current = view.clone();
                true
            } else {
                false
            }
        });
    }
}
