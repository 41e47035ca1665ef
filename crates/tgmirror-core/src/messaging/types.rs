use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::domain::{ChatId, MessageId, MessageRef};

/// Attachment category of a message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileType {
    Audio,
    Gif,
    Video,
    VideoNote,
    Sticker,
    Contact,
    Photo,
    Document,
    None,
}

impl FileType {
    /// Whether this kind of attachment can be a member of an outgoing album.
    pub fn albumable(self) -> bool {
        matches!(
            self,
            FileType::Photo | FileType::Video | FileType::Document | FileType::Audio
        )
    }
}

/// Content categories a destination cannot receive as copies.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MessageKind {
    Regular,
    /// Join/leave/pin/etc. notices.
    Service,
    Game,
    Poll,
    Dice,
}

impl MessageKind {
    pub fn is_unsupported(self) -> bool {
        matches!(self, MessageKind::Game | MessageKind::Poll | MessageKind::Dice)
    }
}

/// Remote attachment handle as reported by the source client.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Media {
    pub file_type: FileType,
    /// Opaque platform handle (file id / file reference) usable to re-send without upload.
    pub file_ref: String,
    pub file_name: Option<String>,
    pub spoiler: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReplyRef {
    pub msg_id: MessageId,
    /// Root of the reply chain (the discussion-thread message) when the platform reports it.
    pub top_id: Option<MessageId>,
}

impl ReplyRef {
    pub fn thread_root(&self) -> MessageId {
        self.top_id.unwrap_or(self.msg_id)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Sender {
    pub id: i64,
    pub is_bot: bool,
}

/// URL-button layout attached to a message.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct InlineKeyboard {
    pub rows: Vec<Vec<InlineButton>>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InlineButton {
    pub label: String,
    pub url: String,
}

impl InlineKeyboard {
    pub fn new(rows: Vec<Vec<InlineButton>>) -> Self {
        Self { rows }
    }

    pub fn is_empty(&self) -> bool {
        self.rows.iter().all(|r| r.is_empty())
    }
}

/// One inbound message as seen by the core.
#[derive(Clone, Debug)]
pub struct SourceMessage {
    pub chat_id: ChatId,
    pub id: MessageId,
    pub text: String,
    pub media: Option<Media>,
    /// Album identifier shared by all members of one grouped post.
    pub grouped_id: Option<String>,
    pub reply_to: Option<ReplyRef>,
    pub sender: Option<Sender>,
    pub kind: MessageKind,
    pub buttons: Option<InlineKeyboard>,
    /// Channel post this message is an automatic copy of (discussion-group linkage message).
    pub linked_post: Option<MessageRef>,
}

impl SourceMessage {
    /// Plain text message with no extras; adapters fill in the rest.
    pub fn new(chat_id: ChatId, id: MessageId, text: impl Into<String>) -> Self {
        Self {
            chat_id,
            id,
            text: text.into(),
            media: None,
            grouped_id: None,
            reply_to: None,
            sender: None,
            kind: MessageKind::Regular,
            buttons: None,
            linked_post: None,
        }
    }

    pub fn msg_ref(&self) -> MessageRef {
        MessageRef::new(self.chat_id, self.id)
    }

    pub fn file_type(&self) -> FileType {
        self.media
            .as_ref()
            .map(|m| m.file_type)
            .unwrap_or(FileType::None)
    }
}

/// Push events delivered by a live subscription.
#[derive(Clone, Debug)]
pub enum SourceEvent {
    New(SourceMessage),
    Edited(SourceMessage),
    Deleted { chat_id: ChatId, ids: Vec<MessageId> },
}

impl SourceEvent {
    pub fn chat_id(&self) -> ChatId {
        match self {
            SourceEvent::New(m) | SourceEvent::Edited(m) => m.chat_id,
            SourceEvent::Deleted { chat_id, .. } => *chat_id,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FileSource {
    /// Re-send by platform handle.
    Remote(String),
    /// Upload from a local path.
    Local(PathBuf),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutgoingFile {
    pub source: FileSource,
    pub file_type: FileType,
    pub spoiler: bool,
}

/// Per-call send options.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SendOptions {
    pub reply_to: Option<MessageId>,
    pub buttons: Option<InlineKeyboard>,
    /// Text/caption is HTML rather than plain text.
    pub html: bool,
}

/// What a client implementation can do.
#[derive(Clone, Copy, Debug)]
pub struct ClientCapabilities {
    /// `history_page` works; past mode refuses to start without it.
    pub supports_history: bool,
    /// Longest caption a media message may carry, in characters.
    pub max_caption_len: usize,
}
