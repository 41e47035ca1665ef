//! Telegram adapter (teloxide).
//!
//! Implements the `tgmirror-core` `ChatClient` port over the Telegram Bot API.
//!
//! The Bot API has no history, reply or recent-message queries and never reports
//! deletions, so those calls return `Error::Unsupported`. Discussion threads are learned
//! from the automatic forwards a linked group receives while the bot is polling.

use std::{
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
};

use async_trait::async_trait;
use teloxide::{
    net::Download,
    prelude::*,
    types::{
        InlineKeyboardButton, InlineKeyboardMarkup, InputFile, InputMedia, InputMediaAudio,
        InputMediaDocument, InputMediaPhoto, InputMediaVideo, ParseMode, Recipient,
    },
    RequestError,
};
use tokio::sync::mpsc;

pub mod convert;
mod updates;

use tgmirror_core::{
    domain::{ChatId, MessageId, MessageRef},
    errors::Error,
    mapping::{BoundedMap, DEFAULT_CAPACITY},
    messaging::{
        port::{ChatClient, ClientFactory},
        types::{
            ClientCapabilities, FileSource, FileType, InlineKeyboard, Media, OutgoingFile,
            SendOptions, SourceEvent, SourceMessage,
        },
    },
    Result,
};

/// Channel post → discussion-group thread message.
pub(crate) type ThreadCache = BoundedMap<MessageRef, MessageRef>;

const EVENT_BUFFER: usize = 256;

pub struct TelegramClient {
    bot: Bot,
    threads: Arc<Mutex<ThreadCache>>,
    downloads: AtomicU64,
}

impl TelegramClient {
    pub fn new(bot: Bot) -> Self {
        Self {
            bot,
            threads: Arc::new(Mutex::new(ThreadCache::new(DEFAULT_CAPACITY))),
            downloads: AtomicU64::new(0),
        }
    }

    pub fn from_token(token: impl Into<String>) -> Self {
        Self::new(Bot::new(token))
    }

    fn tg_chat(chat_id: ChatId) -> teloxide::types::ChatId {
        teloxide::types::ChatId(chat_id.0)
    }

    fn tg_msg_id(message_id: MessageId) -> teloxide::types::MessageId {
        teloxide::types::MessageId(message_id.0)
    }

    fn msg_ref(chat_id: ChatId, msg: &Message) -> MessageRef {
        MessageRef::new(chat_id, MessageId(msg.id.0))
    }
}

/// Sort a Bot API failure into the signals the delivery engine reacts to.
fn map_err(e: RequestError) -> Error {
    if let RequestError::RetryAfter(wait) = e {
        return Error::RateLimited(wait);
    }
    let text = e.to_string();
    let lower = text.to_lowercase();
    if lower.contains("wrong file identifier")
        || lower.contains("file reference")
        || lower.contains("wrong remote file")
    {
        Error::StaleReference(text)
    } else if lower.contains("media is empty")
        || lower.contains("wrong type of the web page content")
        || lower.contains("failed to get http url content")
        || lower.contains("can't use file of type")
    {
        Error::InvalidMedia(text)
    } else {
        Error::External(format!("telegram error: {text}"))
    }
}

/// Failure partway through a per-message forward; earlier copies are reported so the
/// caller can remove them.
fn partial(forwarded: Vec<MessageRef>, cause: Error) -> Error {
    if forwarded.is_empty() {
        cause
    } else {
        Error::PartialForward {
            forwarded,
            cause: Box::new(cause),
        }
    }
}

fn markup(kb: &InlineKeyboard) -> InlineKeyboardMarkup {
    let rows: Vec<Vec<InlineKeyboardButton>> = kb
        .rows
        .iter()
        .map(|row| {
            row.iter()
                .filter_map(|b| match reqwest::Url::parse(&b.url) {
                    Ok(url) => Some(InlineKeyboardButton::url(b.label.clone(), url)),
                    Err(e) => {
                        tracing::debug!(url = %b.url, "dropping button with bad url: {e}");
                        None
                    }
                })
                .collect::<Vec<_>>()
        })
        .filter(|row| !row.is_empty())
        .collect();
    InlineKeyboardMarkup::new(rows)
}

fn input_file(source: &FileSource) -> InputFile {
    match source {
        FileSource::Remote(id) => InputFile::file_id(id.clone()),
        FileSource::Local(path) => InputFile::file(path.clone()),
    }
}

/// Reply target and buttons, shared by every send request.
macro_rules! with_opts {
    ($req:expr, $opts:expr) => {{
        let mut req = $req;
        if let Some(id) = $opts.reply_to {
            req = req.reply_to_message_id(TelegramClient::tg_msg_id(id));
        }
        if let Some(kb) = &$opts.buttons {
            req = req.reply_markup(markup(kb));
        }
        req
    }};
}

macro_rules! with_caption {
    ($req:expr, $caption:expr, $html:expr) => {{
        let mut req = $req;
        if !$caption.is_empty() {
            req = req.caption($caption.to_string());
            if $html {
                req = req.parse_mode(ParseMode::Html);
            }
        }
        req
    }};
}

fn album_member(file: &OutgoingFile, caption: Option<&str>, html: bool) -> Result<InputMedia> {
    let input = input_file(&file.source);
    let caption = caption.unwrap_or_default();
    let media = match file.file_type {
        FileType::Photo => {
            let mut m = with_caption!(InputMediaPhoto::new(input), caption, html);
            m.has_spoiler = file.spoiler;
            InputMedia::Photo(m)
        }
        FileType::Video => {
            let mut m = with_caption!(InputMediaVideo::new(input), caption, html);
            m.has_spoiler = file.spoiler;
            InputMedia::Video(m)
        }
        FileType::Document => {
            InputMedia::Document(with_caption!(InputMediaDocument::new(input), caption, html))
        }
        FileType::Audio => {
            InputMedia::Audio(with_caption!(InputMediaAudio::new(input), caption, html))
        }
        other => {
            return Err(Error::InvalidMedia(format!(
                "{other:?} cannot be part of an album"
            )))
        }
    };
    Ok(media)
}

fn extension(file_type: FileType) -> &'static str {
    match file_type {
        FileType::Photo => ".jpg",
        FileType::Video | FileType::VideoNote | FileType::Gif => ".mp4",
        FileType::Audio => ".mp3",
        FileType::Sticker => ".webp",
        _ => "",
    }
}

#[async_trait]
impl ChatClient for TelegramClient {
    fn capabilities(&self) -> ClientCapabilities {
        ClientCapabilities {
            supports_history: false,
            max_caption_len: 1024,
        }
    }

    async fn resolve_chat(&self, reference: &str) -> Result<ChatId> {
        let reference = reference.trim();
        if let Ok(id) = reference.parse::<i64>() {
            return Ok(ChatId(id));
        }
        let username = reference
            .trim_start_matches("https://t.me/")
            .trim_start_matches("t.me/")
            .trim_start_matches('@');
        if username.is_empty() || username.starts_with('+') || username.contains('/') {
            return Err(Error::Unsupported(format!(
                "cannot resolve {reference:?} without joining; use a numeric id"
            )));
        }
        let chat = self
            .bot
            .get_chat(Recipient::ChannelUsername(format!("@{username}")))
            .await
            .map_err(map_err)?;
        Ok(ChatId(chat.id.0))
    }

    async fn history_page(
        &self,
        _chat: ChatId,
        _after: MessageId,
        _limit: usize,
    ) -> Result<Vec<SourceMessage>> {
        Err(Error::Unsupported(
            "the Bot API cannot read chat history".to_string(),
        ))
    }

    async fn recent_messages(&self, _chat: ChatId, _limit: usize) -> Result<Vec<SourceMessage>> {
        Err(Error::Unsupported(
            "the Bot API cannot read recent messages".to_string(),
        ))
    }

    async fn replies(
        &self,
        _chat: ChatId,
        _msg: MessageId,
        _limit: usize,
    ) -> Result<Vec<SourceMessage>> {
        Err(Error::Unsupported(
            "the Bot API cannot list replies".to_string(),
        ))
    }

    async fn discussion_message(
        &self,
        chat: ChatId,
        post: MessageId,
    ) -> Result<Option<MessageRef>> {
        let threads = self
            .threads
            .lock()
            .map_err(|_| Error::External("thread cache poisoned".to_string()))?;
        Ok(threads.get(&MessageRef::new(chat, post)).copied())
    }

    async fn linked_group(&self, chat: ChatId) -> Result<Option<ChatId>> {
        let chat = self
            .bot
            .get_chat(Self::tg_chat(chat))
            .await
            .map_err(map_err)?;
        Ok(chat.linked_chat_id().map(ChatId))
    }

    async fn subscribe(&self, chats: Vec<ChatId>) -> Result<mpsc::Receiver<SourceEvent>> {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        updates::spawn(
            self.bot.clone(),
            updates::EventSink::new(tx, chats, self.threads.clone()),
        );
        Ok(rx)
    }

    async fn send_text(&self, chat: ChatId, text: &str, opts: &SendOptions) -> Result<MessageRef> {
        let mut req = with_opts!(self.bot.send_message(Self::tg_chat(chat), text.to_string()), opts);
        if opts.html {
            req = req.parse_mode(ParseMode::Html);
        }
        let msg = req.await.map_err(map_err)?;
        Ok(Self::msg_ref(chat, &msg))
    }

    async fn send_file(
        &self,
        chat: ChatId,
        file: &OutgoingFile,
        caption: &str,
        opts: &SendOptions,
    ) -> Result<MessageRef> {
        let to = Self::tg_chat(chat);
        let input = input_file(&file.source);
        let sent = match file.file_type {
            FileType::Photo => {
                let req = with_opts!(self.bot.send_photo(to, input), opts);
                with_caption!(req, caption, opts.html)
                    .has_spoiler(file.spoiler)
                    .await
            }
            FileType::Video => {
                let req = with_opts!(self.bot.send_video(to, input), opts);
                with_caption!(req, caption, opts.html)
                    .has_spoiler(file.spoiler)
                    .await
            }
            FileType::Gif => {
                let req = with_opts!(self.bot.send_animation(to, input), opts);
                with_caption!(req, caption, opts.html)
                    .has_spoiler(file.spoiler)
                    .await
            }
            FileType::Document => {
                let req = with_opts!(self.bot.send_document(to, input), opts);
                with_caption!(req, caption, opts.html).await
            }
            FileType::Audio => {
                let req = with_opts!(self.bot.send_audio(to, input), opts);
                with_caption!(req, caption, opts.html).await
            }
            // No captions on these.
            FileType::Sticker => {
                // teloxide-core 0.9 types this payload's reply id as a raw i32.
                let mut req = self.bot.send_sticker(to, input);
                if let Some(id) = opts.reply_to {
                    req = req.reply_to_message_id(Self::tg_msg_id(id).0);
                }
                if let Some(kb) = &opts.buttons {
                    req = req.reply_markup(markup(kb));
                }
                req.await
            }
            FileType::VideoNote => with_opts!(self.bot.send_video_note(to, input), opts).await,
            FileType::Contact => {
                let FileSource::Remote(handle) = &file.source else {
                    return Err(Error::InvalidMedia("contact cannot be uploaded".to_string()));
                };
                let (phone, name) = convert::parse_contact_ref(handle).ok_or_else(|| {
                    Error::InvalidMedia(format!("malformed contact handle {handle:?}"))
                })?;
                with_opts!(self.bot.send_contact(to, phone, name), opts).await
            }
            FileType::None => {
                return Err(Error::InvalidMedia("no attachment to send".to_string()));
            }
        };
        let msg = sent.map_err(map_err)?;
        Ok(Self::msg_ref(chat, &msg))
    }

    async fn send_album(
        &self,
        chat: ChatId,
        files: &[OutgoingFile],
        caption: &str,
        opts: &SendOptions,
    ) -> Result<Vec<MessageRef>> {
        let media = files
            .iter()
            .enumerate()
            .map(|(i, f)| album_member(f, (i == 0).then_some(caption), opts.html))
            .collect::<Result<Vec<_>>>()?;

        // Albums cannot carry inline buttons.
        let mut req = self.bot.send_media_group(Self::tg_chat(chat), media);
        if let Some(id) = opts.reply_to {
            req = req.reply_to_message_id(Self::tg_msg_id(id));
        }
        let msgs = req.await.map_err(map_err)?;
        Ok(msgs.iter().map(|m| Self::msg_ref(chat, m)).collect())
    }

    /// One `forwardMessage` per id, so forwarded album members arrive ungrouped.
    async fn forward(&self, to: ChatId, from: ChatId, ids: &[MessageId]) -> Result<Vec<MessageRef>> {
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            let sent = self
                .bot
                .forward_message(Self::tg_chat(to), Self::tg_chat(from), Self::tg_msg_id(*id))
                .await
                .map_err(map_err);
            match sent {
                Ok(msg) => out.push(Self::msg_ref(to, &msg)),
                Err(cause) => return Err(partial(out, cause)),
            }
        }
        Ok(out)
    }

    async fn download_media(&self, media: &Media, dir: &Path) -> Result<PathBuf> {
        let file = self
            .bot
            .get_file(media.file_ref.clone())
            .await
            .map_err(map_err)?;

        let seq = self.downloads.fetch_add(1, Ordering::Relaxed);
        let name = match &media.file_name {
            Some(n) => format!("tgmirror-{}-{seq}-{n}", std::process::id()),
            None => format!(
                "tgmirror-{}-{seq}{}",
                std::process::id(),
                extension(media.file_type)
            ),
        };
        let path = dir.join(name.replace(['/', '\\'], "_"));

        let mut dst = tokio::fs::File::create(&path).await?;
        if let Err(e) = self.bot.download_file(&file.path, &mut dst).await {
            let _ = tokio::fs::remove_file(&path).await;
            return Err(Error::External(format!("download failed: {e}")));
        }
        Ok(path)
    }

    async fn edit_text(&self, msg: MessageRef, text: &str, html: bool) -> Result<()> {
        let chat = Self::tg_chat(msg.chat_id);
        let id = Self::tg_msg_id(msg.message_id);

        let mut req = self.bot.edit_message_text(chat, id, text.to_string());
        if html {
            req = req.parse_mode(ParseMode::Html);
        }
        match req.await {
            Ok(_) => Ok(()),
            Err(e) if e.to_string().contains("no text in the message") => {
                let mut req = self.bot.edit_message_caption(chat, id).caption(text.to_string());
                if html {
                    req = req.parse_mode(ParseMode::Html);
                }
                req.await.map_err(map_err)?;
                Ok(())
            }
            Err(e) => Err(map_err(e)),
        }
    }

    async fn delete_messages(&self, chat: ChatId, ids: &[MessageId]) -> Result<()> {
        for id in ids {
            self.bot
                .delete_message(Self::tg_chat(chat), Self::tg_msg_id(*id))
                .await
                .map_err(map_err)?;
        }
        Ok(())
    }
}

/// Opens a bot client per token for the sender-override stage.
#[derive(Clone, Copy, Debug, Default)]
pub struct TelegramFactory;

#[async_trait]
impl ClientFactory for TelegramFactory {
    async fn connect(&self, credentials: &str) -> Result<Arc<dyn ChatClient>> {
        let token = credentials.trim();
        if token.is_empty() {
            return Err(Error::Config("empty bot token".to_string()));
        }
        Ok(Arc::new(TelegramClient::from_token(token)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use teloxide::ApiError;

    #[test]
    fn retry_after_becomes_rate_limit() {
        let e = map_err(RequestError::RetryAfter(Duration::from_secs(42)));
        assert_eq!(e.retry_after(), Some(Duration::from_secs(42)));
    }

    #[test]
    fn wrong_file_id_is_stale() {
        let e = map_err(RequestError::Api(ApiError::WrongFileId));
        assert!(matches!(e, Error::StaleReference(_)), "{e:?}");
    }

    #[test]
    fn other_api_errors_are_external() {
        let e = map_err(RequestError::Api(ApiError::BotBlocked));
        assert!(matches!(e, Error::External(_)), "{e:?}");
    }

    #[test]
    fn buttons_with_bad_urls_are_dropped() {
        let kb = InlineKeyboard::new(vec![
            vec![
                tgmirror_core::messaging::types::InlineButton {
                    label: "site".to_string(),
                    url: "https://example.com".to_string(),
                },
                tgmirror_core::messaging::types::InlineButton {
                    label: "broken".to_string(),
                    url: "not a url".to_string(),
                },
            ],
            vec![tgmirror_core::messaging::types::InlineButton {
                label: "also broken".to_string(),
                url: "::".to_string(),
            }],
        ]);
        let m = markup(&kb);
        assert_eq!(m.inline_keyboard.len(), 1);
        assert_eq!(m.inline_keyboard[0].len(), 1);
        assert_eq!(m.inline_keyboard[0][0].text, "site");
    }

    #[test]
    fn only_album_kinds_become_group_members() {
        let sticker = OutgoingFile {
            source: FileSource::Remote("x".to_string()),
            file_type: FileType::Sticker,
            spoiler: false,
        };
        assert!(matches!(
            album_member(&sticker, None, false),
            Err(Error::InvalidMedia(_))
        ));
    }

    #[test]
    fn forward_failure_after_copies_reports_them() {
        let copy = MessageRef::new(ChatId(-200), MessageId(9));
        match partial(vec![copy], Error::External("down".to_string())) {
            Error::PartialForward { forwarded, cause } => {
                assert_eq!(forwarded, vec![copy]);
                assert!(matches!(*cause, Error::External(_)));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(
            partial(Vec::new(), Error::RateLimited(Duration::from_secs(3))),
            Error::RateLimited(_)
        ));
    }

    #[test]
    fn thread_cache_forgets_oldest_posts() {
        let client = TelegramClient::from_token("123:abc");
        let mut threads = client.threads.lock().unwrap();
        for i in 0..=DEFAULT_CAPACITY as i32 {
            threads.insert(
                MessageRef::new(ChatId(-100), MessageId(i)),
                MessageRef::new(ChatId(-200), MessageId(i)),
            );
        }
        assert_eq!(threads.len(), DEFAULT_CAPACITY);
        assert!(!threads.contains_key(&MessageRef::new(ChatId(-100), MessageId(0))));
    }

    #[tokio::test]
    async fn discussion_threads_come_from_the_cache() {
        let client = TelegramClient::from_token("123:abc");
        let post = MessageRef::new(ChatId(-100), MessageId(5));
        let thread = MessageRef::new(ChatId(-200), MessageId(77));
        client.threads.lock().unwrap().insert(post, thread);

        assert_eq!(
            client.discussion_message(ChatId(-100), MessageId(5)).await.unwrap(),
            Some(thread)
        );
        assert_eq!(
            client.discussion_message(ChatId(-100), MessageId(6)).await.unwrap(),
            None
        );
    }
}
