//! Long-polling update stream feeding live mode.

use std::{
    collections::HashSet,
    sync::{Arc, Mutex},
};

use teloxide::{dispatching::Dispatcher, dptree, prelude::*};
use tokio::sync::mpsc;

use tgmirror_core::{
    domain::ChatId,
    messaging::types::SourceEvent,
};

use crate::{convert, ThreadCache};

pub(crate) struct EventSink {
    tx: mpsc::Sender<SourceEvent>,
    chats: HashSet<ChatId>,
    threads: Arc<Mutex<ThreadCache>>,
}

impl EventSink {
    pub(crate) fn new(
        tx: mpsc::Sender<SourceEvent>,
        chats: Vec<ChatId>,
        threads: Arc<Mutex<ThreadCache>>,
    ) -> Self {
        Self {
            tx,
            chats: chats.into_iter().collect(),
            threads,
        }
    }

    async fn push(&self, msg: &Message, edited: bool) {
        let m = convert::source_message(msg);
        if let Some(post) = m.linked_post {
            if let Ok(mut threads) = self.threads.lock() {
                threads.insert(post, m.msg_ref());
            }
        }
        if !self.chats.contains(&m.chat_id) {
            return;
        }
        let event = if edited {
            SourceEvent::Edited(m)
        } else {
            SourceEvent::New(m)
        };
        if self.tx.send(event).await.is_err() {
            tracing::debug!("live consumer gone; dropping update");
        }
    }
}

async fn on_new(msg: Message, sink: Arc<EventSink>) -> ResponseResult<()> {
    sink.push(&msg, false).await;
    Ok(())
}

async fn on_edit(msg: Message, sink: Arc<EventSink>) -> ResponseResult<()> {
    sink.push(&msg, true).await;
    Ok(())
}

/// Poll updates until the bot is stopped. Dropping the sink closes the event channel.
pub(crate) fn spawn(bot: Bot, sink: EventSink) {
    let sink = Arc::new(sink);
    tokio::spawn(async move {
        let handler = dptree::entry()
            .branch(Update::filter_channel_post().endpoint(on_new))
            .branch(Update::filter_message().endpoint(on_new))
            .branch(Update::filter_edited_channel_post().endpoint(on_edit))
            .branch(Update::filter_edited_message().endpoint(on_edit));

        Dispatcher::builder(bot, handler)
            .dependencies(dptree::deps![sink])
            .build()
            .dispatch()
            .await;
        tracing::info!("telegram update stream stopped");
    });
}

