use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::{
    domain::{ChatId, MessageId, MessageRef},
    messaging::types::{
        ClientCapabilities, Media, OutgoingFile, SendOptions, SourceEvent, SourceMessage,
    },
    Result,
};

/// Message source/sink port.
///
/// Wraps the wire client. Every call may fail with `Error::RateLimited`,
/// `Error::StaleReference` or a generic error; the delivery engine decides how to recover.
#[async_trait]
pub trait ChatClient: Send + Sync {
    fn capabilities(&self) -> ClientCapabilities;

    /// Resolve a configured reference (`@username`, numeric id, invite link) to a chat id.
    async fn resolve_chat(&self, reference: &str) -> Result<ChatId>;

    /// Up to `limit` messages with id greater than `after`, oldest first.
    ///
    /// An empty page means the history is exhausted.
    async fn history_page(
        &self,
        chat: ChatId,
        after: MessageId,
        limit: usize,
    ) -> Result<Vec<SourceMessage>>;

    /// The newest `limit` messages of a chat, newest first.
    async fn recent_messages(&self, chat: ChatId, limit: usize) -> Result<Vec<SourceMessage>>;

    /// Replies whose chain is rooted at `msg` in `chat`, oldest first.
    async fn replies(&self, chat: ChatId, msg: MessageId, limit: usize)
        -> Result<Vec<SourceMessage>>;

    /// The discussion-group message linked to a channel post, if comments are enabled.
    async fn discussion_message(&self, chat: ChatId, post: MessageId)
        -> Result<Option<MessageRef>>;

    /// The discussion group linked to a channel, if any.
    async fn linked_group(&self, chat: ChatId) -> Result<Option<ChatId>>;

    /// Start receiving push events for the given chats.
    async fn subscribe(&self, chats: Vec<ChatId>) -> Result<mpsc::Receiver<SourceEvent>>;

    async fn send_text(&self, chat: ChatId, text: &str, opts: &SendOptions) -> Result<MessageRef>;

    async fn send_file(
        &self,
        chat: ChatId,
        file: &OutgoingFile,
        caption: &str,
        opts: &SendOptions,
    ) -> Result<MessageRef>;

    /// Send several files as one grouped post; `caption` goes on the first item.
    async fn send_album(
        &self,
        chat: ChatId,
        files: &[OutgoingFile],
        caption: &str,
        opts: &SendOptions,
    ) -> Result<Vec<MessageRef>>;

    /// Native forward keeping the original attribution.
    async fn forward(&self, to: ChatId, from: ChatId, ids: &[MessageId]) -> Result<Vec<MessageRef>>;

    /// Download an attachment into `dir`, returning the local path.
    async fn download_media(&self, media: &Media, dir: &Path) -> Result<PathBuf>;

    async fn edit_text(&self, msg: MessageRef, text: &str, html: bool) -> Result<()>;

    async fn delete_messages(&self, chat: ChatId, ids: &[MessageId]) -> Result<()>;
}

/// Opens additional authenticated identities (used by the sender-override stage).
#[async_trait]
pub trait ClientFactory: Send + Sync {
    async fn connect(&self, credentials: &str) -> Result<Arc<dyn ChatClient>>;
}
