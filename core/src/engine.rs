/// Conversation/message synchronization engine
///
/// Reconciles the push channel (activity notifications), pull results
/// (conversation list, message history) and local optimistic sends into a
/// single view. The engine performs no I/O itself: operations return the
/// queries to run as `Effect`s, and finished queries come back through
/// `apply` as `Completion`s. Exactly one owner mutates it.
///
/// Every history query carries the conversation it was issued for. A result
/// is merged only if that conversation is still the active one when the
/// result is applied; otherwise it is dropped. Merged history always replaces
/// the message list, which is how optimistic messages get superseded.
use crate::channel::{ConnectionState, Outbox};
use crate::discovery::{PeerSearch, SearchTicket};
use crate::error::{ChatError, Result};
use crate::messenger_types::{
    Conversation, ConversationId, Identity, InboundEvent, Message, SendCommand, UserId,
};
use tracing::{debug, info, warn};

/// Focus of the message pane
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Phase {
    #[default]
    NoConversation,
    /// History requested, not yet merged
    Loading(ConversationId),
    Active(ConversationId),
}

impl Phase {
    /// The active conversation id, loading or loaded
    pub fn conversation(&self) -> Option<ConversationId> {
        match self {
            Phase::NoConversation => None,
            Phase::Loading(id) | Phase::Active(id) => Some(*id),
        }
    }
}

/// Identifies one history query
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistoryTicket {
    pub conversation: ConversationId,
    pub generation: u64,
}

/// A pull query the engine wants run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    FetchHistory(HistoryTicket),
    FetchConversations { user: UserId, generation: u64 },
    Search(SearchTicket),
}

/// Outcome of an `Effect`, fed back through `SyncEngine::apply`
#[derive(Debug)]
pub enum Completion {
    History {
        ticket: HistoryTicket,
        result: Result<Vec<Message>>,
    },
    Conversations {
        generation: u64,
        result: Result<Vec<Conversation>>,
    },
    Search {
        ticket: SearchTicket,
        result: Result<Vec<Identity>>,
    },
}

/// Everything the presentation layer renders
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ViewState {
    pub connection: ConnectionState,
    pub conversations: Vec<Conversation>,
    pub phase: Phase,
    pub messages: Vec<Message>,
    /// Conversation the displayed messages belong to. Differs from the
    /// active one while loading or after a failed fetch.
    pub messages_for: Option<ConversationId>,
    /// Recipient of the next send
    pub peer: Option<UserId>,
    /// Pending outbound text
    pub draft: String,
    pub search: PeerSearch,
}

impl ViewState {
    pub fn active(&self) -> Option<ConversationId> {
        self.phase.conversation()
    }
}

pub struct SyncEngine {
    me: Identity,
    view: ViewState,
    outbox: Option<Box<dyn Outbox>>,
    history_issued: u64,
    history_applied: u64,
    list_issued: u64,
    list_applied: u64,
    closed: bool,
}

impl SyncEngine {
    pub fn new(me: Identity) -> Self {
        Self {
            me,
            view: ViewState::default(),
            outbox: None,
            history_issued: 0,
            history_applied: 0,
            list_issued: 0,
            list_applied: 0,
            closed: false,
        }
    }

    pub fn me(&self) -> &Identity {
        &self.me
    }

    pub fn view(&self) -> &ViewState {
        &self.view
    }

    /// Bind the session's push channel
    pub fn attach_outbox(&mut self, outbox: Box<dyn Outbox>) {
        self.view.connection = outbox.state();
        self.outbox = Some(outbox);
    }

    /// Mirror a channel state change into the view
    pub fn set_connection(&mut self, state: ConnectionState) -> bool {
        if self.view.connection == state {
            return false;
        }
        info!("Push channel is now {:?}", state);
        self.view.connection = state;
        true
    }

    pub fn refresh_conversations(&mut self) -> Effect {
        self.list_issued += 1;
        Effect::FetchConversations {
            user: self.me.id,
            generation: self.list_issued,
        }
    }

    /// Resync on request: the list plus the active conversation's history
    pub fn refresh(&mut self) -> Vec<Effect> {
        let mut effects = vec![self.refresh_conversations()];
        if let Some(active) = self.view.phase.conversation() {
            effects.push(self.fetch_history(active));
        }
        effects
    }

    fn fetch_history(&mut self, conversation: ConversationId) -> Effect {
        self.history_issued += 1;
        Effect::FetchHistory(HistoryTicket {
            conversation,
            generation: self.history_issued,
        })
    }

    /// User picked a conversation from the list. Always refetches, even when
    /// it is already active.
    pub fn open_conversation(&mut self, conversation: &Conversation) -> Vec<Effect> {
        if !conversation.involves(self.me.id) {
            warn!(
                "Opening conversation {} which does not list user {}",
                conversation.id, self.me.id
            );
        }
        debug!("Opening conversation {}", conversation.id);
        self.view.peer = conversation.peer_of(self.me.id);
        self.view.phase = Phase::Loading(conversation.id);
        vec![self.fetch_history(conversation.id)]
    }

    /// New activity announced by the push channel
    pub fn handle_inbound(&mut self, event: &InboundEvent) -> Vec<Effect> {
        let target = event.conversation_id;
        let mut effects = Vec::with_capacity(2);

        match self.view.phase.conversation() {
            None => {
                info!("Auto-opening conversation {}", target);
                // Unresolved until the list names the other participant
                let peer = match event.sender_id.filter(|s| *s != self.me.id) {
                    Some(sender) => Some(sender),
                    None => self.peer_from_list(target),
                };
                self.view.peer = peer;
                self.view.phase = Phase::Loading(target);
                effects.push(self.fetch_history(target));
            }
            Some(active) if active == target => {
                effects.push(self.fetch_history(active));
            }
            Some(active) => {
                debug!("Activity in conversation {} while {} is open", target, active);
            }
        }

        effects.push(self.refresh_conversations());
        effects
    }

    /// Push `text` to the current recipient and show it right away
    pub fn send_message(&mut self, text: &str) -> Result<()> {
        if text.trim().is_empty() {
            return Err(ChatError::EmptyMessage);
        }
        let outbox = self.connected_outbox()?;
        let to = self.view.peer.ok_or(ChatError::NoRecipient)?;
        let conversation_id = self.view.phase.conversation();

        outbox.push(SendCommand {
            to,
            conversation_id,
            content: text.to_string(),
        })?;

        // The pane may still show another conversation (loading or failed fetch)
        if self.view.messages_for != conversation_id {
            self.view.messages.clear();
            self.view.messages_for = conversation_id;
        }
        self.view
            .messages
            .push(Message::optimistic(conversation_id, self.me.id, text.to_string()));
        self.view.draft.clear();
        Ok(())
    }

    /// Ask the server to create or locate a conversation with `peer`. The
    /// conversation is opened when the server announces it.
    pub fn start_conversation_with_peer(&mut self, peer: &Identity, greeting: &str) -> Result<()> {
        self.connected_outbox()?.push(SendCommand {
            to: peer.id,
            conversation_id: None,
            content: greeting.to_string(),
        })?;

        info!("Starting chat with {} ({})", peer.username, peer.id);
        self.view.peer = Some(peer.id);
        self.view.search.clear();
        self.view.phase = Phase::NoConversation;
        self.view.messages.clear();
        self.view.messages_for = None;
        Ok(())
    }

    pub fn set_draft(&mut self, text: &str) {
        self.view.draft = text.to_string();
    }

    /// Peer search box changed
    pub fn search(&mut self, text: &str) -> Option<Effect> {
        self.view.search.update(text).map(Effect::Search)
    }

    pub fn search_generation(&self) -> u64 {
        self.view.search.generation()
    }

    /// Merge a finished query. Returns whether the view changed.
    pub fn apply(&mut self, completion: Completion) -> bool {
        if self.closed {
            return false;
        }
        match completion {
            Completion::History { ticket, result } => self.apply_history(ticket, result),
            Completion::Conversations { generation, result } => {
                if generation < self.list_applied {
                    debug!("Discarding out-of-order conversation list {}", generation);
                    return false;
                }
                match result {
                    Ok(list) => {
                        self.list_applied = generation;
                        self.view.conversations = list;
                        if let Some(peer) = self
                            .view
                            .phase
                            .conversation()
                            .and_then(|active| self.peer_from_list(active))
                        {
                            self.view.peer = Some(peer);
                        }
                        true
                    }
                    Err(e) => {
                        warn!("Conversation list refresh failed: {}", e);
                        false
                    }
                }
            }
            Completion::Search { ticket, result } => match result {
                Ok(results) => self.view.search.apply(&ticket, results, self.me.id),
                Err(e) => {
                    warn!("Peer search for {:?} failed: {}", ticket.query, e);
                    false
                }
            },
        }
    }

    fn apply_history(&mut self, ticket: HistoryTicket, result: Result<Vec<Message>>) -> bool {
        if self.view.phase.conversation() != Some(ticket.conversation) {
            debug!(
                "Discarding stale history for conversation {} (generation {})",
                ticket.conversation, ticket.generation
            );
            return false;
        }
        if ticket.generation < self.history_applied {
            debug!(
                "Discarding out-of-order history for conversation {} (generation {})",
                ticket.conversation, ticket.generation
            );
            return false;
        }

        match result {
            Ok(messages) => {
                self.history_applied = ticket.generation;
                self.view.messages = messages;
                self.view.messages_for = Some(ticket.conversation);
                self.view.phase = Phase::Active(ticket.conversation);
                true
            }
            Err(e) => {
                // Keep whatever is on screen
                warn!(
                    "History fetch for conversation {} failed: {}",
                    ticket.conversation, e
                );
                if self.view.phase == Phase::Loading(ticket.conversation) {
                    self.view.phase = Phase::Active(ticket.conversation);
                    true
                } else {
                    false
                }
            }
        }
    }

    /// End of session: close the channel and drop the view
    pub fn logout(&mut self) {
        if let Some(outbox) = self.outbox.take() {
            outbox.close();
        }
        self.view = ViewState::default();
        self.closed = true;
        info!("Logged out {}", self.me.username);
    }

    fn connected_outbox(&self) -> Result<&dyn Outbox> {
        let outbox = self.outbox.as_deref().ok_or_else(|| {
            ChatError::ChannelUnavailable("no push channel for this session".to_string())
        })?;
        match outbox.state() {
            ConnectionState::Connected => Ok(outbox),
            state => Err(ChatError::ChannelUnavailable(format!(
                "push channel is {:?}",
                state
            ))),
        }
    }

    fn peer_from_list(&self, conversation: ConversationId) -> Option<UserId> {
        self.view
            .conversations
            .iter()
            .find(|c| c.id == conversation)
            .and_then(|c| c.peer_of(self.me.id))
    }
}
