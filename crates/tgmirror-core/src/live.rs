//! Live mode: forward push events as they arrive.
//!
//! One event loop owns the album coalescer and dispatches work. With
//! `sequential_updates` every chat gets its own worker queue so its units, edits and
//! deletions run strictly in arrival order; otherwise each item runs as its own task and
//! different items may overlap.

use std::{collections::HashMap, sync::Arc, time::Duration};

use tokio::{sync::mpsc, task::JoinSet};

use crate::{
    coalescer::{Batch, LiveCoalescer},
    comments::CommentRoute,
    config::{ForwardConfig, LiveSettings},
    domain::{ChatId, MessageId},
    forward::{Forwarder, Route},
    messaging::types::{SourceEvent, SourceMessage},
    Error, Result,
};

enum Work {
    Unit(Arc<Route>, Batch),
    Edit(Arc<Route>, SourceMessage),
    Delete(Arc<Route>, Vec<MessageId>),
    Comments(Arc<CommentRoute>, Batch),
}

async fn execute(forwarder: &Forwarder, work: Work) {
    match work {
        Work::Unit(route, batch) => {
            forwarder.forward(&route, batch).await;
        }
        Work::Edit(route, msg) => forwarder.edit(&route, msg).await,
        Work::Delete(route, ids) => forwarder.delete(&route, &ids).await,
        Work::Comments(route, batch) => forwarder.mirror().handle_live(route, batch).await,
    }
}

/// Resolved routing tables for the subscribed chats.
#[derive(Default)]
struct Routes {
    by_source: HashMap<ChatId, Vec<Arc<Route>>>,
    by_group: HashMap<ChatId, Vec<Arc<CommentRoute>>>,
}

impl Routes {
    fn chats(&self) -> Vec<ChatId> {
        let mut chats: Vec<ChatId> = self
            .by_source
            .keys()
            .chain(self.by_group.keys())
            .copied()
            .collect();
        chats.sort();
        chats.dedup();
        chats
    }
}

struct Dispatcher {
    forwarder: Arc<Forwarder>,
    sequential: bool,
    queues: HashMap<ChatId, mpsc::UnboundedSender<Work>>,
    tasks: JoinSet<()>,
}

impl Dispatcher {
    fn dispatch(&mut self, key: ChatId, work: Work) {
        let forwarder = self.forwarder.clone();
        if !self.sequential {
            self.tasks.spawn(async move { execute(&forwarder, work).await });
            return;
        }

        let tx = self.queues.entry(key).or_insert_with(|| {
            let (tx, mut rx) = mpsc::unbounded_channel::<Work>();
            self.tasks.spawn(async move {
                while let Some(work) = rx.recv().await {
                    execute(&forwarder, work).await;
                }
            });
            tx
        });
        if tx.send(work).is_err() {
            tracing::error!(chat = %key, "worker queue closed; update dropped");
        }
    }

    fn reap(&self, res: std::result::Result<(), tokio::task::JoinError>) {
        if let Err(e) = res {
            tracing::error!("live handler task failed: {e}");
        }
    }

    async fn shutdown(mut self) {
        self.queues.clear();
        while let Some(res) = self.tasks.join_next().await {
            self.reap(res);
        }
    }
}

pub struct LiveRunner {
    forwarder: Arc<Forwarder>,
    settings: LiveSettings,
}

impl LiveRunner {
    pub fn new(forwarder: Arc<Forwarder>, settings: LiveSettings) -> Self {
        Self {
            forwarder,
            settings,
        }
    }

    async fn routes(&self, config: &ForwardConfig) -> Routes {
        let mut routes = Routes::default();
        for (idx, conn) in config.connections.iter().enumerate() {
            if !conn.enabled {
                continue;
            }
            let route = match self.forwarder.resolve(idx, conn).await {
                Ok(r) => Arc::new(r),
                Err(e) => {
                    tracing::error!(connection = %conn.label(), "cannot resolve connection, skipping: {e}");
                    continue;
                }
            };
            if let Some(comments) = &route.comments {
                match comments.source_group {
                    Some(group) => routes
                        .by_group
                        .entry(group)
                        .or_default()
                        .push(comments.clone()),
                    None => tracing::warn!(
                        connection = %route.label,
                        "comments enabled but the source has no discussion group"
                    ),
                }
            }
            routes
                .by_source
                .entry(route.source)
                .or_default()
                .push(route);
        }
        routes
    }

    /// Run until the event stream ends. Buffered albums are flushed and in-flight work is
    /// awaited before returning.
    pub async fn run(&self, config: &ForwardConfig) -> Result<()> {
        let routes = self.routes(config).await;
        if routes.by_source.is_empty() {
            return Err(Error::Config("no connection could be resolved".to_string()));
        }

        let chats = routes.chats();
        let mut events = self.forwarder.client().subscribe(chats.clone()).await?;
        tracing::info!(chats = ?chats, "live forwarding started");

        let (flush_tx, mut flush_rx) = mpsc::unbounded_channel::<Batch>();
        let coalescer = LiveCoalescer::new(
            Duration::from_millis(self.settings.group_timeout_ms),
            flush_tx,
        );
        let mut dispatcher = Dispatcher {
            forwarder: self.forwarder.clone(),
            sequential: self.settings.sequential_updates,
            queues: HashMap::new(),
            tasks: JoinSet::new(),
        };

        loop {
            tokio::select! {
                biased;
                Some(batch) = flush_rx.recv() => self.route_batch(&routes, &mut dispatcher, batch),
                Some(res) = dispatcher.tasks.join_next(), if !dispatcher.tasks.is_empty() => {
                    dispatcher.reap(res)
                }
                ev = events.recv() => match ev {
                    Some(ev) => self.on_event(&routes, &coalescer, &mut dispatcher, ev).await,
                    None => break,
                },
            }
        }

        tracing::info!("event stream closed; flushing buffered albums");
        drop(coalescer);
        while let Some(batch) = flush_rx.recv().await {
            self.route_batch(&routes, &mut dispatcher, batch);
        }
        dispatcher.shutdown().await;
        Ok(())
    }

    async fn on_event(
        &self,
        routes: &Routes,
        coalescer: &Arc<LiveCoalescer>,
        dispatcher: &mut Dispatcher,
        ev: SourceEvent,
    ) {
        let chat = ev.chat_id();
        match ev {
            SourceEvent::New(msg) => {
                if let Some(groups) = routes.by_group.get(&chat) {
                    let mirror = self.forwarder.mirror();
                    if groups.iter().any(|g| mirror.note_thread_message(g, &msg)) {
                        return;
                    }
                }
                if routes.by_source.contains_key(&chat) || routes.by_group.contains_key(&chat) {
                    coalescer.add(msg).await;
                }
            }
            SourceEvent::Edited(msg) => {
                for route in routes.by_source.get(&chat).into_iter().flatten() {
                    dispatcher.dispatch(chat, Work::Edit(route.clone(), msg.clone()));
                }
            }
            SourceEvent::Deleted { ids, .. } => {
                if !self.settings.delete_sync {
                    return;
                }
                for route in routes.by_source.get(&chat).into_iter().flatten() {
                    dispatcher.dispatch(chat, Work::Delete(route.clone(), ids.clone()));
                }
            }
        }
    }

    fn route_batch(&self, routes: &Routes, dispatcher: &mut Dispatcher, batch: Batch) {
        let Some(chat) = batch.first().map(|m| m.chat_id) else {
            return;
        };
        if let Some(list) = routes.by_source.get(&chat) {
            for route in list {
                dispatcher.dispatch(chat, Work::Unit(route.clone(), batch.clone()));
            }
        } else if let Some(list) = routes.by_group.get(&chat) {
            for comments in list {
                dispatcher.dispatch(chat, Work::Comments(comments.clone(), batch.clone()));
            }
        }
    }
}
