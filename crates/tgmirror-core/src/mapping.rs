//! Source <-> destination identifier memory.
//!
//! Three independent maps, each capped at the N most recently *inserted* keys:
//! - post:    (source chat, source post) -> {dest chat: dest post}
//! - thread:  (discussion group, thread message) <-> (channel, channel post)
//! - comment: (source group, source comment) -> {dest chat: dest message}
//!
//! Reads never refresh recency.

use std::{
    collections::{HashMap, VecDeque},
    hash::Hash,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use tokio::sync::Notify;

use crate::domain::{ChatId, MessageId, MessageRef};

pub const DEFAULT_CAPACITY: usize = 50_000;

/// Insertion-ordered map that evicts the oldest key once `cap` is exceeded.
#[derive(Debug)]
pub struct BoundedMap<K, V> {
    cap: usize,
    map: HashMap<K, V>,
    order: VecDeque<K>,
}

impl<K: Eq + Hash + Clone, V> BoundedMap<K, V> {
    pub fn new(cap: usize) -> Self {
        Self {
            cap: cap.max(1),
            map: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        self.map.get(key)
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.map.contains_key(key)
    }

    /// Insert or replace. Replacing keeps the key's original position.
    pub fn insert(&mut self, key: K, value: V) {
        if let Some(slot) = self.map.get_mut(&key) {
            *slot = value;
            return;
        }
        self.order.push_back(key.clone());
        self.map.insert(key, value);
        self.evict();
    }

    /// Mutable access to the value for `key`, inserting `V::default()` first if absent.
    pub fn entry_or_default(&mut self, key: K) -> &mut V
    where
        V: Default,
    {
        if !self.map.contains_key(&key) {
            self.order.push_back(key.clone());
            self.map.insert(key.clone(), V::default());
            self.evict();
        }
        self.map.entry(key).or_default()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    fn evict(&mut self) {
        while self.map.len() > self.cap {
            let Some(oldest) = self.order.pop_front() else {
                break;
            };
            self.map.remove(&oldest);
        }
    }
}

type PostKey = (ChatId, MessageId);
type Targets = HashMap<ChatId, MessageId>;

#[derive(Debug)]
pub struct MappingStore {
    posts: BoundedMap<PostKey, Targets>,
    thread_to_post: BoundedMap<PostKey, MessageRef>,
    post_to_thread: BoundedMap<PostKey, MessageRef>,
    comments: BoundedMap<PostKey, Targets>,
}

impl Default for MappingStore {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl MappingStore {
    pub fn new(cap: usize) -> Self {
        Self {
            posts: BoundedMap::new(cap),
            thread_to_post: BoundedMap::new(cap),
            post_to_thread: BoundedMap::new(cap),
            comments: BoundedMap::new(cap),
        }
    }

    pub fn record_post_mapping(&mut self, source: MessageRef, dest: MessageRef) {
        self.posts
            .entry_or_default((source.chat_id, source.message_id))
            .insert(dest.chat_id, dest.message_id);
    }

    pub fn lookup_dest_post(&self, source: MessageRef, dest_chat: ChatId) -> Option<MessageId> {
        self.posts
            .get(&(source.chat_id, source.message_id))
            .and_then(|t| t.get(&dest_chat).copied())
    }

    /// All destination copies of a source post.
    pub fn dest_posts(&self, source: MessageRef) -> Vec<MessageRef> {
        let mut out: Vec<MessageRef> = self
            .posts
            .get(&(source.chat_id, source.message_id))
            .map(|t| t.iter().map(|(c, m)| MessageRef::new(*c, *m)).collect())
            .unwrap_or_default();
        out.sort_by_key(|r| (r.chat_id, r.message_id));
        out
    }

    /// Link a discussion-group message to the channel post it is about (both directions).
    pub fn record_thread_mapping(&mut self, thread_msg: MessageRef, channel_post: MessageRef) {
        self.thread_to_post.insert(
            (thread_msg.chat_id, thread_msg.message_id),
            channel_post,
        );
        self.post_to_thread.insert(
            (channel_post.chat_id, channel_post.message_id),
            thread_msg,
        );
    }

    pub fn lookup_channel_post_from_thread(&self, thread_msg: MessageRef) -> Option<MessageRef> {
        self.thread_to_post
            .get(&(thread_msg.chat_id, thread_msg.message_id))
            .copied()
    }

    pub fn lookup_thread_message_from_channel_post(
        &self,
        channel_post: MessageRef,
    ) -> Option<MessageRef> {
        self.post_to_thread
            .get(&(channel_post.chat_id, channel_post.message_id))
            .copied()
    }

    pub fn record_comment_mapping(&mut self, source: MessageRef, dest: MessageRef) {
        self.comments
            .entry_or_default((source.chat_id, source.message_id))
            .insert(dest.chat_id, dest.message_id);
    }

    pub fn lookup_comment_dest(&self, source: MessageRef, dest_chat: ChatId) -> Option<MessageId> {
        self.comments
            .get(&(source.chat_id, source.message_id))
            .and_then(|t| t.get(&dest_chat).copied())
    }

    pub fn post_count(&self) -> usize {
        self.posts.len()
    }

    pub fn comment_count(&self) -> usize {
        self.comments.len()
    }
}

/// Shared handle to one `MappingStore`.
///
/// Locks are held only for the duration of a synchronous call, never across an await.
/// Writers of post mappings wake any task waiting for a parent mapping.
#[derive(Clone, Default)]
pub struct Mappings {
    inner: Arc<MappingsInner>,
}

#[derive(Default)]
struct MappingsInner {
    store: Mutex<MappingStore>,
    posted: Notify,
}

impl Mappings {
    pub fn new(cap: usize) -> Self {
        Self {
            inner: Arc::new(MappingsInner {
                store: Mutex::new(MappingStore::new(cap)),
                posted: Notify::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MappingStore> {
        // A panic while holding the lock cannot leave the maps half-written.
        self.inner
            .store
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Run `f` against the store.
    pub fn read<T>(&self, f: impl FnOnce(&MappingStore) -> T) -> T {
        f(&self.lock())
    }

    pub fn record_post_mapping(&self, source: MessageRef, dest: MessageRef) {
        self.lock().record_post_mapping(source, dest);
        self.inner.posted.notify_waiters();
    }

    pub fn lookup_dest_post(&self, source: MessageRef, dest_chat: ChatId) -> Option<MessageId> {
        self.lock().lookup_dest_post(source, dest_chat)
    }

    pub fn dest_posts(&self, source: MessageRef) -> Vec<MessageRef> {
        self.lock().dest_posts(source)
    }

    pub fn record_thread_mapping(&self, thread_msg: MessageRef, channel_post: MessageRef) {
        self.lock().record_thread_mapping(thread_msg, channel_post);
    }

    pub fn lookup_channel_post_from_thread(&self, thread_msg: MessageRef) -> Option<MessageRef> {
        self.lock().lookup_channel_post_from_thread(thread_msg)
    }

    pub fn lookup_thread_message_from_channel_post(
        &self,
        channel_post: MessageRef,
    ) -> Option<MessageRef> {
        self.lock().lookup_thread_message_from_channel_post(channel_post)
    }

    pub fn record_comment_mapping(&self, source: MessageRef, dest: MessageRef) {
        self.lock().record_comment_mapping(source, dest);
    }

    pub fn lookup_comment_dest(&self, source: MessageRef, dest_chat: ChatId) -> Option<MessageId> {
        self.lock().lookup_comment_dest(source, dest_chat)
    }

    /// Wait until `source` has a destination post on `dest_chat`, up to `timeout`.
    pub async fn wait_for_dest_post(
        &self,
        source: MessageRef,
        dest_chat: ChatId,
        timeout: Duration,
    ) -> Option<MessageId> {
        let wait = async {
            loop {
                let notified = self.inner.posted.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();

                if let Some(id) = self.lookup_dest_post(source, dest_chat) {
                    return id;
                }
                notified.await;
            }
        };
        tokio::time::timeout(timeout, wait).await.ok()
    }
}
