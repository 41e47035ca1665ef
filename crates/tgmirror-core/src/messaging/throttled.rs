use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    time::Duration,
};

use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};

use crate::{
    domain::{ChatId, MessageId, MessageRef},
    messaging::{
        port::ChatClient,
        types::{
            ClientCapabilities, Media, OutgoingFile, SendOptions, SourceEvent, SourceMessage,
        },
    },
    Result,
};

/// Minimum spacing of outbound calls.
#[derive(Clone, Copy, Debug)]
pub struct ThrottleConfig {
    /// Between any two calls.
    pub global_min_interval: Duration,
    /// Between two writes to the same chat.
    pub per_chat_min_interval: Duration,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            global_min_interval: Duration::from_millis(40),
            per_chat_min_interval: Duration::from_millis(1050),
        }
    }
}

/// Hands out evenly spaced start times.
#[derive(Debug)]
struct Pacer {
    gap: Duration,
    free_at: Instant,
}

impl Pacer {
    fn new(gap: Duration, now: Instant) -> Self {
        Self { gap, free_at: now }
    }

    /// Claim the earliest slot not before `earliest`.
    fn claim(&mut self, earliest: Instant) -> Instant {
        let at = self.free_at.max(earliest);
        self.free_at = at + self.gap;
        at
    }
}

#[derive(Debug)]
struct Slots {
    global: Pacer,
    chats: HashMap<ChatId, Pacer>,
}

/// ChatClient decorator that spaces outbound calls.
///
/// Reads (history, replies, lookups) only pass through the global pacer; writes are
/// also spaced per destination chat. This does not prevent rate-limit signals, it only
/// makes them rarer; the delivery engine still handles them.
pub struct ThrottledClient {
    inner: Arc<dyn ChatClient>,
    cfg: ThrottleConfig,
    slots: Mutex<Slots>,
}

impl ThrottledClient {
    pub fn new(inner: Arc<dyn ChatClient>, cfg: ThrottleConfig) -> Self {
        let now = Instant::now();
        Self {
            inner,
            cfg,
            slots: Mutex::new(Slots {
                global: Pacer::new(cfg.global_min_interval, now),
                chats: HashMap::new(),
            }),
        }
    }

    /// Wait for a global slot and, for writes, a slot on `chat`.
    async fn pace(&self, chat: Option<ChatId>) {
        let start = {
            let now = Instant::now();
            let mut slots = self.slots.lock().unwrap_or_else(|p| p.into_inner());
            let mut at = slots.global.claim(now);
            if let Some(chat) = chat {
                let gap = self.cfg.per_chat_min_interval;
                at = slots
                    .chats
                    .entry(chat)
                    .or_insert_with(|| Pacer::new(gap, now))
                    .claim(at);
            }
            at
        };
        sleep_until(start).await;
    }
}

#[async_trait::async_trait]
impl ChatClient for ThrottledClient {
    fn capabilities(&self) -> ClientCapabilities {
        self.inner.capabilities()
    }

    async fn resolve_chat(&self, reference: &str) -> Result<ChatId> {
        self.pace(None).await;
        self.inner.resolve_chat(reference).await
    }

    async fn history_page(
        &self,
        chat: ChatId,
        after: MessageId,
        limit: usize,
    ) -> Result<Vec<SourceMessage>> {
        self.pace(None).await;
        self.inner.history_page(chat, after, limit).await
    }

    async fn recent_messages(&self, chat: ChatId, limit: usize) -> Result<Vec<SourceMessage>> {
        self.pace(None).await;
        self.inner.recent_messages(chat, limit).await
    }

    async fn replies(
        &self,
        chat: ChatId,
        msg: MessageId,
        limit: usize,
    ) -> Result<Vec<SourceMessage>> {
        self.pace(None).await;
        self.inner.replies(chat, msg, limit).await
    }

    async fn discussion_message(
        &self,
        chat: ChatId,
        post: MessageId,
    ) -> Result<Option<MessageRef>> {
        self.pace(None).await;
        self.inner.discussion_message(chat, post).await
    }

    async fn linked_group(&self, chat: ChatId) -> Result<Option<ChatId>> {
        self.pace(None).await;
        self.inner.linked_group(chat).await
    }

    async fn subscribe(&self, chats: Vec<ChatId>) -> Result<mpsc::Receiver<SourceEvent>> {
        self.inner.subscribe(chats).await
    }

    async fn send_text(&self, chat: ChatId, text: &str, opts: &SendOptions) -> Result<MessageRef> {
        self.pace(Some(chat)).await;
        self.inner.send_text(chat, text, opts).await
    }

    async fn send_file(
        &self,
        chat: ChatId,
        file: &OutgoingFile,
        caption: &str,
        opts: &SendOptions,
    ) -> Result<MessageRef> {
        self.pace(Some(chat)).await;
        self.inner.send_file(chat, file, caption, opts).await
    }

    async fn send_album(
        &self,
        chat: ChatId,
        files: &[OutgoingFile],
        caption: &str,
        opts: &SendOptions,
    ) -> Result<Vec<MessageRef>> {
        self.pace(Some(chat)).await;
        self.inner.send_album(chat, files, caption, opts).await
    }

    async fn forward(
        &self,
        to: ChatId,
        from: ChatId,
        ids: &[MessageId],
    ) -> Result<Vec<MessageRef>> {
        self.pace(Some(to)).await;
        self.inner.forward(to, from, ids).await
    }

    async fn download_media(&self, media: &Media, dir: &Path) -> Result<PathBuf> {
        self.pace(None).await;
        self.inner.download_media(media, dir).await
    }

    async fn edit_text(&self, msg: MessageRef, text: &str, html: bool) -> Result<()> {
        self.pace(Some(msg.chat_id)).await;
        self.inner.edit_text(msg, text, html).await
    }

    async fn delete_messages(&self, chat: ChatId, ids: &[MessageId]) -> Result<()> {
        self.pace(Some(chat)).await;
        self.inner.delete_messages(chat, ids).await
    }
}
