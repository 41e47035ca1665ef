//! Per-unit processing shared by past and live mode:
//! pipeline, delivery to every destination, mapping update, comment scheduling.

use std::{collections::BTreeMap, future::Future, sync::Arc};

use crate::{
    coalescer::Batch,
    comments::{CommentMirror, CommentRoute},
    config::Connection,
    delivery::{resolve_reply_target, DeliveryEngine, Unit},
    domain::{ChatId, MessageId, MessageRef},
    envelope::Envelope,
    mapping::Mappings,
    messaging::{port::ChatClient, types::SourceMessage},
    pipeline::Pipeline,
    Result,
};

/// A connection with its identifiers resolved.
#[derive(Clone, Debug)]
pub struct Route {
    /// Position in `ForwardConfig::connections`.
    pub index: usize,
    pub label: String,
    pub source: ChatId,
    pub dests: Vec<ChatId>,
    pub comments: Option<Arc<CommentRoute>>,
}

/// Result of forwarding one unit.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Forwarded {
    /// Lead source message of the unit; comments hang off this post.
    pub post: MessageRef,
    /// Destinations that received the unit.
    pub reached: usize,
}

/// Run a batch of source messages through the pipeline.
pub async fn build_unit(
    pipeline: &Pipeline,
    client: &Arc<dyn ChatClient>,
    batch: Batch,
) -> Option<Unit> {
    let grouped = batch.len() > 1;
    let mut envs: Vec<Envelope> = batch
        .into_iter()
        .map(|m| Envelope::new(m, client.clone()))
        .collect();

    let out = if grouped {
        pipeline.apply_group(envs).await
    } else {
        match envs.pop() {
            Some(env) => pipeline.apply(env).await.into_iter().collect(),
            None => Vec::new(),
        }
    };
    Unit::from_envelopes(out, grouped)
}

pub struct Forwarder {
    client: Arc<dyn ChatClient>,
    pipeline: Arc<Pipeline>,
    engine: Arc<DeliveryEngine>,
    mappings: Mappings,
    mirror: Arc<CommentMirror>,
}

impl Forwarder {
    pub fn new(
        client: Arc<dyn ChatClient>,
        pipeline: Arc<Pipeline>,
        engine: Arc<DeliveryEngine>,
        mappings: Mappings,
        mirror: Arc<CommentMirror>,
    ) -> Self {
        Self {
            client,
            pipeline,
            engine,
            mappings,
            mirror,
        }
    }

    pub fn client(&self) -> &Arc<dyn ChatClient> {
        &self.client
    }

    pub fn mappings(&self) -> &Mappings {
        &self.mappings
    }

    pub fn mirror(&self) -> &Arc<CommentMirror> {
        &self.mirror
    }

    /// Resolve a connection's source, destinations and comment policy once.
    pub async fn resolve(&self, index: usize, conn: &Connection) -> Result<Route> {
        let source = self.client.resolve_chat(&conn.source).await?;
        let mut dests = Vec::with_capacity(conn.dest.len());
        for d in &conn.dest {
            dests.push(self.client.resolve_chat(d).await?);
        }
        let comments = CommentRoute::resolve(self.client.as_ref(), &conn.comments, source, &dests)
            .await?
            .map(Arc::new);

        Ok(Route {
            index,
            label: conn.label().to_string(),
            source,
            dests,
            comments,
        })
    }

    /// Transform and deliver one unit to every destination of `route`.
    ///
    /// `None` when the pipeline dropped the unit. Delivery failures are already logged
    /// and dead-lettered by the engine; they only lower `reached`.
    pub async fn forward(&self, route: &Route, batch: Batch) -> Option<Forwarded> {
        let first = batch.first().map(SourceMessage::msg_ref)?;
        let Some(unit) = build_unit(&self.pipeline, &self.client, batch).await else {
            tracing::debug!(connection = %route.label, post = %first.message_id, "dropped by pipeline");
            return None;
        };
        let lead = unit.lead()?.source.clone();
        let ids = unit.source_ids();

        let mut reached = 0;
        for dest in &route.dests {
            let reply_to = resolve_reply_target(&self.mappings, &lead, *dest);
            let Some(delivered) = self.engine.send(*dest, &unit, reply_to).await else {
                continue;
            };
            for (src, dst) in delivered.pair_with(&ids) {
                self.mappings
                    .record_post_mapping(MessageRef::new(lead.chat_id, src), dst);
            }
            reached += 1;
        }

        tracing::info!(
            connection = %route.label,
            post = %lead.id,
            members = ids.len(),
            "forwarded to {reached}/{} destinations",
            route.dests.len()
        );
        Some(Forwarded {
            post: lead.msg_ref(),
            reached,
        })
    }

    /// Comment mirroring job for a delivered post, when the route mirrors comments.
    pub fn comment_job(
        &self,
        route: &Route,
        post: MessageRef,
    ) -> Option<impl Future<Output = ()> + Send + 'static> {
        let comments = route.comments.clone()?;
        let mirror = self.mirror.clone();
        Some(async move {
            mirror.mirror_post(&comments, post).await;
        })
    }

    /// Re-run an edited source message through the pipeline and edit its copies.
    pub async fn edit(&self, route: &Route, msg: SourceMessage) {
        let targets: Vec<MessageRef> = self
            .mappings
            .dest_posts(msg.msg_ref())
            .into_iter()
            .filter(|t| route.dests.contains(&t.chat_id))
            .collect();
        if targets.is_empty() {
            tracing::debug!(chat = %msg.chat_id, id = %msg.id, "edit of unmapped message ignored");
            return;
        }

        let id = msg.id;
        let Some(env) = self
            .pipeline
            .apply(Envelope::new(msg, self.client.clone()))
            .await
        else {
            tracing::debug!(connection = %route.label, id = %id, "edited message dropped by pipeline");
            return;
        };
        if env.text.trim().is_empty() {
            return;
        }

        for target in targets {
            if let Err(e) = env.client.edit_text(target, &env.text, env.html).await {
                tracing::warn!(
                    connection = %route.label,
                    dest = %target.chat_id,
                    id = %target.message_id,
                    "failed to edit mirrored message: {e}"
                );
            }
        }
    }

    /// Delete the destination copies of deleted source messages.
    pub async fn delete(&self, route: &Route, ids: &[MessageId]) {
        let mut by_chat: BTreeMap<ChatId, Vec<MessageId>> = BTreeMap::new();
        for id in ids {
            for t in self.mappings.dest_posts(MessageRef::new(route.source, *id)) {
                if route.dests.contains(&t.chat_id) {
                    by_chat.entry(t.chat_id).or_default().push(t.message_id);
                }
            }
        }

        for (chat, ids) in by_chat {
            match self.client.delete_messages(chat, &ids).await {
                Ok(()) => tracing::info!(connection = %route.label, dest = %chat, count = ids.len(), "deleted mirrored messages"),
                Err(e) => tracing::warn!(connection = %route.label, dest = %chat, "failed to delete mirrored messages: {e}"),
            }
        }
    }
}
