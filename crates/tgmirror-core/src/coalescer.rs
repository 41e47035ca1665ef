//! Album reassembly.
//!
//! Members of one album arrive as independent messages. History iteration is strictly
//! ordered, so an album ends as soon as a message with another (or no) album id shows
//! up. Push events have no such guarantee; there each album waits for a quiet period.

use std::{collections::HashMap, sync::Arc, time::Duration};

use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::{domain::ChatId, messaging::types::SourceMessage};

/// One delivery unit: a single message, or every member of one album in arrival order.
pub type Batch = Vec<SourceMessage>;

/// Boundary-based grouping for ordered input.
#[derive(Debug, Default)]
pub struct OrderedGrouper {
    current: Option<String>,
    buffer: Vec<SourceMessage>,
}

impl OrderedGrouper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed the next message; returns the units completed by it, in order.
    pub fn push(&mut self, msg: SourceMessage) -> Vec<Batch> {
        let mut ready = Vec::new();
        match msg.grouped_id.clone() {
            Some(gid) if self.current.as_deref() == Some(gid.as_str()) => {
                self.buffer.push(msg);
            }
            Some(gid) => {
                ready.extend(self.flush());
                self.current = Some(gid);
                self.buffer.push(msg);
            }
            None => {
                ready.extend(self.flush());
                ready.push(vec![msg]);
            }
        }
        ready
    }

    /// The album still buffered when input ends.
    pub fn finish(&mut self) -> Option<Batch> {
        self.flush()
    }

    fn flush(&mut self) -> Option<Batch> {
        self.current = None;
        if self.buffer.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.buffer))
        }
    }
}

/// Group consecutive messages sharing an album id.
pub fn group_ordered(msgs: impl IntoIterator<Item = SourceMessage>) -> Vec<Batch> {
    let mut grouper = OrderedGrouper::new();
    let mut out = Vec::new();
    for m in msgs {
        out.extend(grouper.push(m));
    }
    out.extend(grouper.finish());
    out
}

struct PendingAlbum {
    items: Vec<SourceMessage>,
    cancel: CancellationToken,
}

/// Quiet-period grouping for push events.
///
/// Each album id has one timer task; a new member cancels and restarts it. When a timer
/// expires, the buffered members are sent to `flush_tx` as one batch for the caller's
/// event loop to process. A flushed album is never re-buffered.
pub struct LiveCoalescer {
    timeout: Duration,
    flush_tx: mpsc::UnboundedSender<Batch>,
    pending: Mutex<HashMap<(ChatId, String), PendingAlbum>>,
}

impl LiveCoalescer {
    pub fn new(timeout: Duration, flush_tx: mpsc::UnboundedSender<Batch>) -> Arc<Self> {
        Arc::new(Self {
            timeout,
            flush_tx,
            pending: Mutex::new(HashMap::new()),
        })
    }

    /// Buffer an album member. Messages without an album id are flushed immediately.
    pub async fn add(self: &Arc<Self>, msg: SourceMessage) {
        let Some(gid) = msg.grouped_id.clone() else {
            let _ = self.flush_tx.send(vec![msg]);
            return;
        };
        let key = (msg.chat_id, gid);

        let cancel = CancellationToken::new();
        {
            let mut map = self.pending.lock().await;
            match map.get_mut(&key) {
                Some(group) => {
                    // Existing album: push and reset the quiet period.
                    group.cancel.cancel();
                    group.cancel = cancel.clone();
                    group.items.push(msg);
                }
                None => {
                    map.insert(
                        key.clone(),
                        PendingAlbum {
                            items: vec![msg],
                            cancel: cancel.clone(),
                        },
                    );
                }
            }
        }

        self.spawn_timer(key, cancel);
    }

    pub async fn pending_albums(&self) -> usize {
        self.pending.lock().await.len()
    }

    fn spawn_timer(self: &Arc<Self>, key: (ChatId, String), cancel: CancellationToken) {
        let buffer = Arc::clone(self);
        let timeout = self.timeout;
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(timeout) => {
                    buffer.flush(&key, &cancel).await;
                }
            }
        });
    }

    async fn flush(&self, key: &(ChatId, String), cancel: &CancellationToken) {
        let group = {
            let mut map = self.pending.lock().await;
            // A newer member may have re-armed the timer between expiry and this lock.
            if cancel.is_cancelled() {
                return;
            }
            map.remove(key)
        };
        let Some(group) = group else {
            return;
        };
        tracing::debug!(
            chat = %key.0,
            album = %key.1,
            members = group.items.len(),
            "album complete"
        );
        let _ = self.flush_tx.send(group.items);
    }
}
