//! teloxide `Message` → core `SourceMessage`.

use teloxide::types::{
    Contact, InlineKeyboardButtonKind, MediaKind, Message, MessageKind as TgKind,
};

use tgmirror_core::{
    domain::{ChatId, MessageId, MessageRef},
    messaging::types::{
        FileType, InlineButton, InlineKeyboard, Media, MessageKind, ReplyRef, Sender,
        SourceMessage,
    },
};

pub fn source_message(msg: &Message) -> SourceMessage {
    let text = msg.text().or_else(|| msg.caption()).unwrap_or_default();
    let mut out = SourceMessage::new(ChatId(msg.chat.id.0), MessageId(msg.id.0), text);

    out.media = media(msg);
    out.grouped_id = msg.media_group_id().map(str::to_string);
    out.reply_to = reply_ref(msg);
    out.sender = msg.from().map(|u| Sender {
        id: u.id.0 as i64,
        is_bot: u.is_bot,
    });
    out.kind = kind(msg);
    out.buttons = buttons(msg);
    out.linked_post = linked_post(msg);
    out
}

/// Channel post this message is the automatic discussion-group copy of.
pub fn linked_post(msg: &Message) -> Option<MessageRef> {
    if !msg.is_automatic_forward() {
        return None;
    }
    let chat = msg.forward_from_chat()?;
    let id = msg.forward_from_message_id()?;
    Some(MessageRef::new(ChatId(chat.id.0), MessageId(id)))
}

fn reply_ref(msg: &Message) -> Option<ReplyRef> {
    let parent = msg.reply_to_message()?;
    let top_id = msg
        .thread_id
        .or_else(|| parent.is_automatic_forward().then_some(parent.id.0))
        .map(MessageId);
    Some(ReplyRef {
        msg_id: MessageId(parent.id.0),
        top_id,
    })
}

fn kind(msg: &Message) -> MessageKind {
    if msg.dice().is_some() {
        MessageKind::Dice
    } else if msg.poll().is_some() {
        MessageKind::Poll
    } else if msg.game().is_some() {
        MessageKind::Game
    } else if matches!(msg.kind, TgKind::Common(_)) {
        MessageKind::Regular
    } else {
        MessageKind::Service
    }
}

fn spoiler(msg: &Message) -> bool {
    let TgKind::Common(common) = &msg.kind else {
        return false;
    };
    match &common.media_kind {
        MediaKind::Photo(p) => p.has_media_spoiler,
        MediaKind::Video(v) => v.has_media_spoiler,
        MediaKind::Animation(a) => a.has_media_spoiler,
        _ => false,
    }
}

fn media(msg: &Message) -> Option<Media> {
    let (file_type, file_ref, file_name) = if let Some(sizes) = msg.photo() {
        // Largest size comes last.
        (FileType::Photo, sizes.last()?.file.id.clone(), None)
    } else if let Some(v) = msg.video() {
        (FileType::Video, v.file.id.clone(), v.file_name.clone())
    } else if let Some(a) = msg.animation() {
        (FileType::Gif, a.file.id.clone(), a.file_name.clone())
    } else if let Some(a) = msg.audio() {
        (FileType::Audio, a.file.id.clone(), a.file_name.clone())
    } else if let Some(v) = msg.voice() {
        (FileType::Audio, v.file.id.clone(), None)
    } else if let Some(n) = msg.video_note() {
        (FileType::VideoNote, n.file.id.clone(), None)
    } else if let Some(s) = msg.sticker() {
        (FileType::Sticker, s.file.id.clone(), None)
    } else if let Some(c) = msg.contact() {
        (FileType::Contact, contact_ref(c), None)
    } else if let Some(d) = msg.document() {
        (FileType::Document, d.file.id.clone(), d.file_name.clone())
    } else {
        return None;
    };

    Some(Media {
        file_type,
        file_ref,
        file_name,
        spoiler: spoiler(msg),
    })
}

/// Contacts have no file; the phone number and name travel in the handle.
pub(crate) fn contact_ref(c: &Contact) -> String {
    format!("{}\n{}", c.phone_number, c.first_name)
}

pub(crate) fn parse_contact_ref(handle: &str) -> Option<(String, String)> {
    let (phone, name) = handle.split_once('\n')?;
    Some((phone.to_string(), name.to_string()))
}

fn buttons(msg: &Message) -> Option<InlineKeyboard> {
    let markup = msg.reply_markup()?;
    let rows: Vec<Vec<InlineButton>> = markup
        .inline_keyboard
        .iter()
        .map(|row| {
            row.iter()
                .filter_map(|b| match &b.kind {
                    InlineKeyboardButtonKind::Url(url) => Some(InlineButton {
                        label: b.text.clone(),
                        url: url.to_string(),
                    }),
                    _ => None,
                })
                .collect::<Vec<_>>()
        })
        .filter(|row| !row.is_empty())
        .collect();
    let kb = InlineKeyboard::new(rows);
    (!kb.is_empty()).then_some(kb)
}
