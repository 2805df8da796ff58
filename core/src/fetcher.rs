/// Pull-based queries returning authoritative snapshots
use crate::error::Result;
use crate::messenger_types::{Conversation, ConversationId, Identity, Message, UserId};
use async_trait::async_trait;

#[async_trait]
pub trait StateFetcher: Send + Sync {
    /// Every conversation `user` takes part in
    async fn conversations(&self, user: UserId) -> Result<Vec<Conversation>>;

    /// Full history of one conversation, in server order
    async fn message_history(&self, conversation: ConversationId) -> Result<Vec<Message>>;

    /// Substring lookup in the identity directory. Callers filter themselves out.
    async fn search_identities(&self, query: &str) -> Result<Vec<Identity>>;
}
