//! Comment thread mirroring.
//!
//! A channel post's comments live in the channel's linked discussion group, under an
//! automatic copy of the post (the thread message). Mirroring a post's comments means
//! finding that thread on the source side, waiting until the post itself has a copy on
//! each destination, finding the copy's thread there, and replying under it.

use std::{collections::HashMap, sync::Arc, time::Duration};

use rand::Rng;
use tokio::{sync::Mutex, time::sleep};

use crate::{
    coalescer::{group_ordered, Batch},
    config::{CommentDestMode, CommentFilters, CommentPolicy, CommentSettings},
    delivery::DeliveryEngine,
    domain::{ChatId, MessageRef},
    forward::build_unit,
    mapping::Mappings,
    messaging::{
        port::ChatClient,
        types::{MessageKind, SourceMessage},
    },
    pipeline::Pipeline,
    Error, Result,
};

/// Comment settings of one connection with chats resolved.
#[derive(Clone, Debug)]
pub struct CommentRoute {
    pub channel: ChatId,
    /// Discussion group of the source channel, when known up front.
    pub source_group: Option<ChatId>,
    pub dests: Vec<ChatId>,
    /// Manually configured destination group; `None` uses each destination's own thread.
    pub dest_group: Option<ChatId>,
    pub filters: CommentFilters,
}

impl CommentRoute {
    /// `None` when the policy is disabled.
    pub async fn resolve(
        client: &dyn ChatClient,
        policy: &CommentPolicy,
        channel: ChatId,
        dests: &[ChatId],
    ) -> Result<Option<Self>> {
        if !policy.enabled {
            return Ok(None);
        }

        let source_group = match &policy.source_group {
            Some(reference) => Some(client.resolve_chat(reference).await?),
            None => match client.linked_group(channel).await {
                Ok(group) => group,
                Err(e) => {
                    tracing::warn!(channel = %channel, "cannot look up discussion group: {e}");
                    None
                }
            },
        };
        let dest_group = match &policy.dest_mode {
            CommentDestMode::Discussion => None,
            CommentDestMode::Group(reference) => Some(client.resolve_chat(reference).await?),
        };

        Ok(Some(Self {
            channel,
            source_group,
            dests: dests.to_vec(),
            dest_group,
            filters: policy.filters.clone(),
        }))
    }
}

/// Where comments for one destination go.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Target {
    dest: ChatId,
    thread: MessageRef,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Strategy {
    /// Comments listed as direct replies to the post.
    DirectReplies,
    /// Replies to the post's discussion-thread message.
    ThreadReplies,
    /// Recent discussion messages whose reply chain starts at the thread message.
    ThreadScan,
    /// Rebuild the post/thread link from the discussion group, then list the thread.
    GroupRebuild,
}

const STRATEGIES: [Strategy; 4] = [
    Strategy::DirectReplies,
    Strategy::ThreadReplies,
    Strategy::ThreadScan,
    Strategy::GroupRebuild,
];

pub struct CommentMirror {
    client: Arc<dyn ChatClient>,
    pipeline: Arc<Pipeline>,
    engine: Arc<DeliveryEngine>,
    mappings: Mappings,
    settings: CommentSettings,
    /// Live comments whose parent post has no destination copy yet, keyed by that post.
    /// Each key has exactly one waiter task.
    pending: Mutex<HashMap<MessageRef, Vec<Batch>>>,
}

impl CommentMirror {
    pub fn new(
        client: Arc<dyn ChatClient>,
        pipeline: Arc<Pipeline>,
        engine: Arc<DeliveryEngine>,
        mappings: Mappings,
        settings: CommentSettings,
    ) -> Self {
        Self {
            client,
            pipeline,
            engine,
            mappings,
            settings,
            pending: Mutex::new(HashMap::new()),
        }
    }

    fn parent_wait(&self) -> Duration {
        Duration::from_secs(self.settings.parent_wait_secs)
    }

    fn pass_delay(&self, pass: u32) -> Duration {
        Duration::from_secs(self.settings.discovery_delay_secs * u64::from(pass + 1))
    }

    /// Mirror the comment thread of a forwarded channel post. Returns the number of
    /// comment units delivered (summed over destinations).
    pub async fn mirror_post(&self, route: &CommentRoute, post: MessageRef) -> usize {
        let comments: Vec<SourceMessage> = self
            .discover(route, post)
            .await
            .into_iter()
            .filter(|m| keep_comment(m, &route.filters))
            .collect();
        if comments.is_empty() {
            tracing::debug!(channel = %post.chat_id, post = %post.message_id, "no comments to mirror");
            return 0;
        }

        let targets = self.resolve_targets(route, post, self.parent_wait()).await;
        if targets.is_empty() {
            return 0;
        }

        let units = group_ordered(comments);
        let total = units.len();
        let mut delivered = 0;
        for (i, unit) in units.into_iter().enumerate() {
            delivered += self.deliver(&targets, unit).await;
            if i + 1 < total {
                sleep(self.jitter()).await;
            }
        }
        tracing::info!(
            channel = %post.chat_id,
            post = %post.message_id,
            "mirrored {total} comment units ({delivered} deliveries)"
        );
        delivered
    }

    /// Collect a post's comments, oldest first. Strategies run in fixed order until one
    /// yields comments; the whole set is retried with a growing delay because the
    /// platform links discussion threads asynchronously.
    pub async fn discover(&self, route: &CommentRoute, post: MessageRef) -> Vec<SourceMessage> {
        let passes = self.settings.discovery_passes.max(1);
        for pass in 0..passes {
            for strategy in STRATEGIES {
                match self.run_strategy(strategy, route, post).await {
                    Ok(mut found) if !found.is_empty() => {
                        found.sort_by_key(|m| m.id);
                        found.dedup_by_key(|m| m.id);
                        tracing::debug!(post = %post.message_id, ?strategy, count = found.len(), "comments found");
                        return found;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::debug!(post = %post.message_id, ?strategy, "comment discovery failed: {e}")
                    }
                }
            }
            if pass + 1 < passes {
                sleep(self.pass_delay(pass)).await;
            }
        }
        Vec::new()
    }

    async fn run_strategy(
        &self,
        strategy: Strategy,
        route: &CommentRoute,
        post: MessageRef,
    ) -> Result<Vec<SourceMessage>> {
        let limit = self.settings.scan_limit;
        match strategy {
            Strategy::DirectReplies => {
                self.client
                    .replies(post.chat_id, post.message_id, limit)
                    .await
            }
            Strategy::ThreadReplies => {
                let thread = self.source_thread(post).await?;
                self.client
                    .replies(thread.chat_id, thread.message_id, limit)
                    .await
            }
            Strategy::ThreadScan => {
                let thread = self.source_thread(post).await?;
                self.scan_thread(thread).await
            }
            Strategy::GroupRebuild => {
                let group = match route.source_group {
                    Some(g) => g,
                    None => self
                        .client
                        .linked_group(post.chat_id)
                        .await?
                        .ok_or_else(|| Error::Unsupported("channel has no discussion group".into()))?,
                };
                let thread = match self.mappings.lookup_thread_message_from_channel_post(post) {
                    Some(t) => t,
                    None => self
                        .find_linked(group, post)
                        .await?
                        .ok_or_else(|| Error::External("thread message not found".into()))?,
                };
                match self
                    .client
                    .replies(thread.chat_id, thread.message_id, limit)
                    .await
                {
                    Ok(found) if !found.is_empty() => Ok(found),
                    _ => self.scan_thread(thread).await,
                }
            }
        }
    }

    /// Discussion-thread message of a source post, cached in the mapping store.
    async fn source_thread(&self, post: MessageRef) -> Result<MessageRef> {
        if let Some(t) = self.mappings.lookup_thread_message_from_channel_post(post) {
            return Ok(t);
        }
        let thread = self
            .client
            .discussion_message(post.chat_id, post.message_id)
            .await?
            .ok_or_else(|| Error::External("post has no discussion thread".into()))?;
        self.mappings.record_thread_mapping(thread, post);
        Ok(thread)
    }

    async fn scan_thread(&self, thread: MessageRef) -> Result<Vec<SourceMessage>> {
        let recent = self
            .client
            .recent_messages(thread.chat_id, self.settings.scan_limit)
            .await?;
        Ok(recent
            .into_iter()
            .filter(|m| m.reply_to.map(|r| r.thread_root()) == Some(thread.message_id))
            .collect())
    }

    /// Find the automatic copy of `post` among a group's recent messages and record it.
    async fn find_linked(&self, group: ChatId, post: MessageRef) -> Result<Option<MessageRef>> {
        let recent = self
            .client
            .recent_messages(group, self.settings.scan_limit)
            .await?;
        let found = recent
            .iter()
            .find(|m| m.linked_post == Some(post))
            .map(SourceMessage::msg_ref);
        if let Some(thread) = found {
            self.mappings.record_thread_mapping(thread, post);
        }
        Ok(found)
    }

    /// Destination threads for `post`, waiting up to `wait` per destination for the post
    /// copy to exist. Destinations that never get one are skipped with a warning.
    async fn resolve_targets(
        &self,
        route: &CommentRoute,
        post: MessageRef,
        wait: Duration,
    ) -> Vec<Target> {
        let mut out = Vec::with_capacity(route.dests.len());
        for dest in &route.dests {
            let Some(dest_post) = self.mappings.wait_for_dest_post(post, *dest, wait).await else {
                tracing::warn!(
                    channel = %post.chat_id,
                    post = %post.message_id,
                    dest = %dest,
                    "parent post not mirrored after {}s; skipping its comments",
                    wait.as_secs()
                );
                continue;
            };
            let dest_post = MessageRef::new(*dest, dest_post);
            match self.dest_thread(route, dest_post).await {
                Some(thread) => out.push(Target {
                    dest: *dest,
                    thread,
                }),
                None => tracing::warn!(
                    dest = %dest,
                    post = %dest_post.message_id,
                    "destination post has no discussion thread; skipping its comments"
                ),
            }
        }
        out
    }

    async fn dest_thread(&self, route: &CommentRoute, dest_post: MessageRef) -> Option<MessageRef> {
        if let Some(t) = self.mappings.lookup_thread_message_from_channel_post(dest_post) {
            return Some(t);
        }
        let passes = self.settings.discovery_passes.max(1);
        for pass in 0..passes {
            let found = match route.dest_group {
                None => {
                    self.client
                        .discussion_message(dest_post.chat_id, dest_post.message_id)
                        .await
                }
                Some(group) => self.find_linked(group, dest_post).await,
            };
            match found {
                Ok(Some(thread)) => {
                    self.mappings.record_thread_mapping(thread, dest_post);
                    return Some(thread);
                }
                Ok(None) => {}
                Err(e) => tracing::debug!(dest = %dest_post.chat_id, "thread lookup failed: {e}"),
            }
            if pass + 1 < passes {
                sleep(self.pass_delay(pass)).await;
            }
        }
        None
    }

    /// Deliver one comment unit under each target thread. Returns the number of targets
    /// that received it.
    async fn deliver(&self, targets: &[Target], batch: Batch) -> usize {
        let Some(unit) = build_unit(&self.pipeline, &self.client, batch).await else {
            return 0;
        };
        let Some(lead) = unit.lead().map(|e| e.source.clone()) else {
            return 0;
        };
        let ids = unit.source_ids();

        let mut reached = 0;
        for t in targets {
            let chat = t.thread.chat_id;
            // Replies to an already mirrored comment nest under its copy.
            let reply_to = lead
                .reply_to
                .and_then(|r| {
                    self.mappings
                        .lookup_comment_dest(MessageRef::new(lead.chat_id, r.msg_id), chat)
                })
                .unwrap_or(t.thread.message_id);

            let Some(delivered) = self.engine.send(chat, &unit, Some(reply_to)).await else {
                tracing::error!(
                    dest = %t.dest,
                    comment = %lead.id,
                    "comment delivery failed"
                );
                continue;
            };
            for (src, dst) in delivered.pair_with(&ids) {
                self.mappings
                    .record_comment_mapping(MessageRef::new(lead.chat_id, src), dst);
            }
            reached += 1;
        }
        reached
    }

    fn jitter(&self) -> Duration {
        let lo = self.settings.jitter_min_ms;
        let hi = self.settings.jitter_max_ms.max(lo);
        Duration::from_millis(rand::thread_rng().gen_range(lo..=hi))
    }

    /// Record the thread link announced by an automatic post copy in a discussion group.
    /// Returns `false` for anything else.
    pub fn note_thread_message(&self, route: &CommentRoute, msg: &SourceMessage) -> bool {
        match msg.linked_post {
            Some(post) if post.chat_id == route.channel => {
                self.mappings.record_thread_mapping(msg.msg_ref(), post);
                true
            }
            _ => false,
        }
    }

    /// Mirror a comment unit received live from the source discussion group.
    ///
    /// Comments whose parent post has not reached every destination yet are parked; one
    /// waiter per post flushes them once the copies exist, or drops them with a warning
    /// after the parent wait timeout.
    pub async fn handle_live(self: &Arc<Self>, route: Arc<CommentRoute>, batch: Batch) {
        let batch: Batch = batch
            .into_iter()
            .filter(|m| keep_comment(m, &route.filters))
            .collect();
        let Some(lead) = batch.first() else {
            return;
        };
        let Some(root) = lead.reply_to.map(|r| r.thread_root()) else {
            tracing::debug!(chat = %lead.chat_id, id = %lead.id, "group message outside a thread ignored");
            return;
        };
        let Some(post) = self
            .mappings
            .lookup_channel_post_from_thread(MessageRef::new(lead.chat_id, root))
        else {
            tracing::debug!(chat = %lead.chat_id, id = %lead.id, "comment on unknown thread ignored");
            return;
        };

        let mut pending = self.pending.lock().await;
        if let Some(parked) = pending.get_mut(&post) {
            parked.push(batch);
            return;
        }
        let ready = route
            .dests
            .iter()
            .all(|d| self.mappings.lookup_dest_post(post, *d).is_some());
        if ready {
            drop(pending);
            let targets = self.resolve_targets(&route, post, Duration::ZERO).await;
            self.deliver(&targets, batch).await;
            return;
        }

        pending.insert(post, vec![batch]);
        drop(pending);
        tracing::debug!(post = %post.message_id, "parking comments until the post is mirrored");

        let mirror = Arc::clone(self);
        tokio::spawn(async move {
            mirror.flush_pending(&route, post).await;
        });
    }

    async fn flush_pending(&self, route: &CommentRoute, post: MessageRef) {
        let targets = self.resolve_targets(route, post, self.parent_wait()).await;
        let parked = self
            .pending
            .lock()
            .await
            .remove(&post)
            .unwrap_or_default();

        if targets.is_empty() {
            tracing::warn!(
                channel = %post.chat_id,
                post = %post.message_id,
                "dropping {} parked comment units",
                parked.len()
            );
            return;
        }
        for batch in parked {
            self.deliver(&targets, batch).await;
        }
    }

    pub async fn pending_posts(&self) -> usize {
        self.pending.lock().await.len()
    }
}

/// Whether a discussion message should be mirrored as a comment.
pub fn keep_comment(msg: &SourceMessage, filters: &CommentFilters) -> bool {
    if msg.linked_post.is_some() || msg.kind == MessageKind::Service {
        return false;
    }
    if filters.skip_bots && msg.sender.map(|s| s.is_bot).unwrap_or(false) {
        return false;
    }
    if filters.media_only && msg.media.is_none() {
        return false;
    }
    if filters.text_only && msg.media.is_some() {
        return false;
    }
    if !filters.blacklist.is_empty() {
        let text = msg.text.to_lowercase();
        if filters
            .blacklist
            .iter()
            .any(|w| !w.is_empty() && text.contains(&w.to_lowercase()))
        {
            return false;
        }
    }
    true
}
