//! In-memory `ChatClient` used by the unit tests.

use std::{
    collections::{HashMap, VecDeque},
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::{
    config::{ConfigStore, ForwardConfig},
    domain::{ChatId, MessageId, MessageRef},
    messaging::{
        port::{ChatClient, ClientFactory},
        types::{
            ClientCapabilities, FileType, Media, OutgoingFile, SendOptions, SourceEvent,
            SourceMessage,
        },
    },
    Error, Result,
};

pub fn photo(file_ref: &str) -> Media {
    Media {
        file_type: FileType::Photo,
        file_ref: file_ref.to_string(),
        file_name: None,
        spoiler: false,
    }
}

pub fn msg(chat: i64, id: i32, text: &str) -> SourceMessage {
    SourceMessage::new(ChatId(chat), MessageId(id), text)
}

pub fn album_member(chat: i64, id: i32, text: &str, group: &str) -> SourceMessage {
    let mut m = msg(chat, id, text);
    m.media = Some(photo(&format!("file-{id}")));
    m.grouped_id = Some(group.to_string());
    m
}

/// Failure injected into the next outbound call.
#[derive(Clone, Debug)]
pub enum Fail {
    RateLimit(Duration),
    Stale,
    Invalid,
    Generic,
}

impl Fail {
    fn into_error(self) -> Error {
        match self {
            Fail::RateLimit(d) => Error::RateLimited(d),
            Fail::Stale => Error::StaleReference("file reference expired".to_string()),
            Fail::Invalid => Error::InvalidMedia("media empty".to_string()),
            Fail::Generic => Error::External("boom".to_string()),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Call {
    Text {
        chat: ChatId,
        text: String,
        opts: SendOptions,
    },
    File {
        chat: ChatId,
        file: OutgoingFile,
        caption: String,
        opts: SendOptions,
    },
    Album {
        chat: ChatId,
        files: Vec<OutgoingFile>,
        caption: String,
        opts: SendOptions,
    },
    Forward {
        to: ChatId,
        from: ChatId,
        ids: Vec<MessageId>,
    },
    Edit {
        msg: MessageRef,
        text: String,
    },
    Delete {
        chat: ChatId,
        ids: Vec<MessageId>,
    },
}

impl Call {
    pub fn chat(&self) -> ChatId {
        match self {
            Call::Text { chat, .. }
            | Call::File { chat, .. }
            | Call::Album { chat, .. }
            | Call::Delete { chat, .. } => *chat,
            Call::Forward { to, .. } => *to,
            Call::Edit { msg, .. } => msg.chat_id,
        }
    }

    pub fn is_send(&self) -> bool {
        matches!(
            self,
            Call::Text { .. } | Call::File { .. } | Call::Album { .. } | Call::Forward { .. }
        )
    }
}

pub struct FakeClient {
    next_id: Mutex<HashMap<ChatId, i32>>,
    calls: Mutex<Vec<Call>>,
    /// Sends/forwards that were attempted, including failed ones.
    attempts: Mutex<Vec<ChatId>>,
    script: Mutex<VecDeque<Fail>>,
    always_fail: Mutex<HashMap<ChatId, Fail>>,
    history: Mutex<HashMap<ChatId, Vec<SourceMessage>>>,
    history_requests: Mutex<Vec<(ChatId, MessageId)>>,
    history_failures: Mutex<VecDeque<Fail>>,
    cursor_failures: Mutex<Vec<(MessageId, Fail)>>,
    no_history: Mutex<bool>,
    replies: Mutex<HashMap<MessageRef, Vec<SourceMessage>>>,
    discussion: Mutex<HashMap<MessageRef, MessageRef>>,
    linked: Mutex<HashMap<ChatId, ChatId>>,
    resolve: Mutex<HashMap<String, ChatId>>,
    forward_stops_after: Mutex<Option<usize>>,
    events_tx: Mutex<Option<mpsc::Sender<SourceEvent>>>,
    events_rx: Mutex<Option<mpsc::Receiver<SourceEvent>>>,
}

impl Default for FakeClient {
    fn default() -> Self {
        let (tx, rx) = mpsc::channel(64);
        Self {
            next_id: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            attempts: Mutex::new(Vec::new()),
            script: Mutex::new(VecDeque::new()),
            always_fail: Mutex::new(HashMap::new()),
            history: Mutex::new(HashMap::new()),
            history_requests: Mutex::new(Vec::new()),
            history_failures: Mutex::new(VecDeque::new()),
            cursor_failures: Mutex::new(Vec::new()),
            no_history: Mutex::new(false),
            replies: Mutex::new(HashMap::new()),
            discussion: Mutex::new(HashMap::new()),
            linked: Mutex::new(HashMap::new()),
            resolve: Mutex::new(HashMap::new()),
            forward_stops_after: Mutex::new(None),
            events_tx: Mutex::new(Some(tx)),
            events_rx: Mutex::new(Some(rx)),
        }
    }
}

impl FakeClient {
    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn sends(&self) -> Vec<Call> {
        self.calls().into_iter().filter(|c| c.is_send()).collect()
    }

    pub fn attempts_to(&self, chat: ChatId) -> usize {
        self.attempts
            .lock()
            .unwrap()
            .iter()
            .filter(|c| **c == chat)
            .count()
    }

    pub fn sent_texts(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Text { text, .. } => Some(text),
                _ => None,
            })
            .collect()
    }

    pub fn fail_next(&self, fail: Fail) {
        self.script.lock().unwrap().push_back(fail);
    }

    pub fn fail_always(&self, chat: ChatId, fail: Fail) {
        self.always_fail.lock().unwrap().insert(chat, fail);
    }

    /// The next multi-message forward copies only the first `n` ids, then fails.
    pub fn stop_forward_after(&self, n: usize) {
        *self.forward_stops_after.lock().unwrap() = Some(n);
    }

    pub fn set_history(&self, chat: ChatId, mut msgs: Vec<SourceMessage>) {
        msgs.sort_by_key(|m| m.id);
        self.history.lock().unwrap().insert(chat, msgs);
    }

    pub fn history_requests(&self) -> Vec<(ChatId, MessageId)> {
        self.history_requests.lock().unwrap().clone()
    }

    /// Fail the next history fetch.
    pub fn fail_history_next(&self, fail: Fail) {
        self.history_failures.lock().unwrap().push_back(fail);
    }

    /// Fail one history fetch that starts after `after`; repeat to fail it again.
    pub fn fail_history_after(&self, after: MessageId, fail: Fail) {
        self.cursor_failures.lock().unwrap().push((after, fail));
    }

    /// Report no history support, like the Bot API adapter.
    pub fn disable_history(&self) {
        *self.no_history.lock().unwrap() = true;
    }

    pub fn set_replies(&self, root: MessageRef, msgs: Vec<SourceMessage>) {
        self.replies.lock().unwrap().insert(root, msgs);
    }

    pub fn set_discussion(&self, post: MessageRef, thread_msg: MessageRef) {
        self.discussion.lock().unwrap().insert(post, thread_msg);
    }

    pub fn set_linked(&self, channel: ChatId, group: ChatId) {
        self.linked.lock().unwrap().insert(channel, group);
    }

    pub fn set_resolve(&self, reference: &str, chat: ChatId) {
        self.resolve
            .lock()
            .unwrap()
            .insert(reference.to_string(), chat);
    }

    pub async fn emit(&self, ev: SourceEvent) {
        let tx = self.events_tx.lock().unwrap().clone();
        if let Some(tx) = tx {
            let _ = tx.send(ev).await;
        }
    }

    /// End the live stream.
    pub fn close_events(&self) {
        self.events_tx.lock().unwrap().take();
    }

    fn alloc(&self, chat: ChatId) -> MessageRef {
        let mut ids = self.next_id.lock().unwrap();
        let next = ids.entry(chat).or_insert(1000);
        let id = *next;
        *next += 1;
        MessageRef::new(chat, MessageId(id))
    }

    fn check(&self, chat: ChatId) -> Result<()> {
        self.attempts.lock().unwrap().push(chat);
        if let Some(f) = self.script.lock().unwrap().pop_front() {
            return Err(f.into_error());
        }
        if let Some(f) = self.always_fail.lock().unwrap().get(&chat).cloned() {
            return Err(f.into_error());
        }
        Ok(())
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl ChatClient for FakeClient {
    fn capabilities(&self) -> ClientCapabilities {
        ClientCapabilities {
            supports_history: !*self.no_history.lock().unwrap(),
            max_caption_len: 1024,
        }
    }

    async fn resolve_chat(&self, reference: &str) -> Result<ChatId> {
        if let Some(id) = self.resolve.lock().unwrap().get(reference) {
            return Ok(*id);
        }
        reference
            .trim()
            .parse::<i64>()
            .map(ChatId)
            .map_err(|_| Error::External(format!("cannot resolve {reference}")))
    }

    async fn history_page(
        &self,
        chat: ChatId,
        after: MessageId,
        limit: usize,
    ) -> Result<Vec<SourceMessage>> {
        self.history_requests.lock().unwrap().push((chat, after));
        if let Some(f) = self.history_failures.lock().unwrap().pop_front() {
            return Err(f.into_error());
        }
        {
            let mut scripted = self.cursor_failures.lock().unwrap();
            if let Some(pos) = scripted.iter().position(|(at, _)| *at == after) {
                return Err(scripted.remove(pos).1.into_error());
            }
        }
        let history = self.history.lock().unwrap();
        Ok(history
            .get(&chat)
            .map(|msgs| {
                msgs.iter()
                    .filter(|m| m.id > after)
                    .take(limit)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn recent_messages(&self, chat: ChatId, limit: usize) -> Result<Vec<SourceMessage>> {
        let history = self.history.lock().unwrap();
        Ok(history
            .get(&chat)
            .map(|msgs| msgs.iter().rev().take(limit).cloned().collect())
            .unwrap_or_default())
    }

    async fn replies(
        &self,
        chat: ChatId,
        msg: MessageId,
        limit: usize,
    ) -> Result<Vec<SourceMessage>> {
        let replies = self.replies.lock().unwrap();
        match replies.get(&MessageRef::new(chat, msg)) {
            Some(list) => Ok(list.iter().take(limit).cloned().collect()),
            None => Err(Error::Unsupported("no reply listing".to_string())),
        }
    }

    async fn discussion_message(
        &self,
        chat: ChatId,
        post: MessageId,
    ) -> Result<Option<MessageRef>> {
        Ok(self
            .discussion
            .lock()
            .unwrap()
            .get(&MessageRef::new(chat, post))
            .copied())
    }

    async fn linked_group(&self, chat: ChatId) -> Result<Option<ChatId>> {
        Ok(self.linked.lock().unwrap().get(&chat).copied())
    }

    async fn subscribe(&self, _chats: Vec<ChatId>) -> Result<mpsc::Receiver<SourceEvent>> {
        self.events_rx
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| Error::External("already subscribed".to_string()))
    }

    async fn send_text(&self, chat: ChatId, text: &str, opts: &SendOptions) -> Result<MessageRef> {
        self.check(chat)?;
        self.record(Call::Text {
            chat,
            text: text.to_string(),
            opts: opts.clone(),
        });
        Ok(self.alloc(chat))
    }

    async fn send_file(
        &self,
        chat: ChatId,
        file: &OutgoingFile,
        caption: &str,
        opts: &SendOptions,
    ) -> Result<MessageRef> {
        self.check(chat)?;
        self.record(Call::File {
            chat,
            file: file.clone(),
            caption: caption.to_string(),
            opts: opts.clone(),
        });
        Ok(self.alloc(chat))
    }

    async fn send_album(
        &self,
        chat: ChatId,
        files: &[OutgoingFile],
        caption: &str,
        opts: &SendOptions,
    ) -> Result<Vec<MessageRef>> {
        self.check(chat)?;
        self.record(Call::Album {
            chat,
            files: files.to_vec(),
            caption: caption.to_string(),
            opts: opts.clone(),
        });
        Ok(files.iter().map(|_| self.alloc(chat)).collect())
    }

    async fn forward(
        &self,
        to: ChatId,
        from: ChatId,
        ids: &[MessageId],
    ) -> Result<Vec<MessageRef>> {
        self.check(to)?;
        let stop = self.forward_stops_after.lock().unwrap().take();
        let done = stop.unwrap_or(ids.len()).min(ids.len());
        self.record(Call::Forward {
            to,
            from,
            ids: ids[..done].to_vec(),
        });
        let forwarded: Vec<MessageRef> = ids[..done].iter().map(|_| self.alloc(to)).collect();
        if done < ids.len() {
            return Err(Error::PartialForward {
                forwarded,
                cause: Box::new(Fail::Generic.into_error()),
            });
        }
        Ok(forwarded)
    }

    async fn download_media(&self, media: &Media, dir: &Path) -> Result<PathBuf> {
        let ext = match media.file_type {
            FileType::Photo => "jpg",
            _ => "bin",
        };
        let path = dir.join(format!("{}.{ext}", media.file_ref));
        std::fs::write(&path, media.file_ref.as_bytes())?;
        Ok(path)
    }

    async fn edit_text(&self, msg: MessageRef, text: &str, _html: bool) -> Result<()> {
        self.check(msg.chat_id)?;
        self.record(Call::Edit {
            msg,
            text: text.to_string(),
        });
        Ok(())
    }

    async fn delete_messages(&self, chat: ChatId, ids: &[MessageId]) -> Result<()> {
        self.check(chat)?;
        self.record(Call::Delete {
            chat,
            ids: ids.to_vec(),
        });
        Ok(())
    }
}

pub struct FakeFactory {
    client: Arc<FakeClient>,
    connected: Mutex<Vec<String>>,
}

impl FakeFactory {
    pub fn new(client: Arc<FakeClient>) -> Self {
        Self {
            client,
            connected: Mutex::new(Vec::new()),
        }
    }

    pub fn connected_with(&self) -> Vec<String> {
        self.connected.lock().unwrap().clone()
    }
}

#[async_trait]
impl ClientFactory for FakeFactory {
    async fn connect(&self, credentials: &str) -> Result<Arc<dyn ChatClient>> {
        self.connected
            .lock()
            .unwrap()
            .push(credentials.to_string());
        Ok(self.client.clone())
    }
}

/// In-memory `ConfigStore`; keeps every saved snapshot.
#[derive(Default)]
pub struct MemoryStore {
    current: Mutex<ForwardConfig>,
    saves: Mutex<Vec<ForwardConfig>>,
}

impl MemoryStore {
    pub fn new(config: ForwardConfig) -> Self {
        Self {
            current: Mutex::new(config),
            saves: Mutex::new(Vec::new()),
        }
    }

    /// Offsets of connection `idx` in save order.
    pub fn saved_offsets(&self, idx: usize) -> Vec<i32> {
        self.saves
            .lock()
            .unwrap()
            .iter()
            .filter_map(|c| c.connections.get(idx).map(|c| c.offset))
            .collect()
    }
}

impl ConfigStore for MemoryStore {
    fn load(&self) -> Result<ForwardConfig> {
        Ok(self.current.lock().unwrap().clone())
    }

    fn save(&self, config: &ForwardConfig) -> Result<()> {
        *self.current.lock().unwrap() = config.clone();
        self.saves.lock().unwrap().push(config.clone());
        Ok(())
    }
}
