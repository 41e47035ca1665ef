//! Sends one transformed unit to one destination.
//!
//! Never returns an error: every failure is either recovered here (rate limits, stale
//! media handles, unsupported content) or logged, dead-lettered and reported as `None`.
//! Recording mappings for delivered messages is the caller's job.

use std::{future::Future, path::PathBuf, sync::Arc, time::Duration};

use tokio::time::sleep;

use crate::{
    config::DeliverySettings,
    deadletter::{DeadLetter, DeadLetterLog},
    domain::{ChatId, MessageId, MessageRef},
    envelope::Envelope,
    mapping::Mappings,
    messaging::types::{FileSource, OutgoingFile, SendOptions, SourceMessage},
    Error, Result,
};

pub const UNSUPPORTED_NOTICE: &str = "[original message contained an unsupported content type]";

/// A transformed delivery unit.
#[derive(Debug)]
pub enum Unit {
    Single(Envelope),
    /// Album members in arrival order; delivered with one send call.
    Album(Vec<Envelope>),
}

impl Unit {
    /// Wrap pipeline output. `None` when nothing survived.
    pub fn from_envelopes(mut envs: Vec<Envelope>, grouped: bool) -> Option<Self> {
        match envs.len() {
            0 => None,
            1 if !grouped => envs.pop().map(Unit::Single),
            _ => Some(Unit::Album(envs)),
        }
    }

    pub fn envelopes(&self) -> &[Envelope] {
        match self {
            Unit::Single(e) => std::slice::from_ref(e),
            Unit::Album(v) => v,
        }
    }

    pub fn lead(&self) -> Option<&Envelope> {
        self.envelopes().first()
    }

    pub fn source_ids(&self) -> Vec<MessageId> {
        self.envelopes().iter().map(|e| e.source.id).collect()
    }

    pub fn source_chat(&self) -> Option<ChatId> {
        self.lead().map(|e| e.source.chat_id)
    }
}

/// Destination messages created for one unit, in member order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Delivered {
    pub messages: Vec<MessageRef>,
}

impl Delivered {
    pub fn first(&self) -> Option<MessageRef> {
        self.messages.first().copied()
    }

    /// Pair each source member with its destination copy. Surplus members map to the
    /// first destination message so every source id stays reply-targetable.
    pub fn pair_with(&self, source_ids: &[MessageId]) -> Vec<(MessageId, MessageRef)> {
        let Some(first) = self.first() else {
            return Vec::new();
        };
        source_ids
            .iter()
            .enumerate()
            .map(|(i, id)| (*id, self.messages.get(i).copied().unwrap_or(first)))
            .collect()
    }
}

#[derive(Clone, Debug)]
pub struct DeliveryPolicy {
    pub max_retries: u32,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    pub flood_margin: Duration,
    pub max_rate_limit_waits: u32,
    pub preserve_attribution: bool,
    pub temp_dir: PathBuf,
}

impl DeliveryPolicy {
    pub fn from_settings(s: &DeliverySettings, temp_dir: PathBuf) -> Self {
        Self {
            max_retries: s.max_retries.max(1),
            backoff_base: Duration::from_secs(s.backoff_base_secs),
            backoff_cap: Duration::from_secs(s.backoff_cap_secs),
            flood_margin: Duration::from_secs(s.flood_margin_secs),
            max_rate_limit_waits: s.max_rate_limit_waits,
            preserve_attribution: s.preserve_attribution,
            temp_dir,
        }
    }

    /// Exponential backoff after the `failures`-th generic failure, capped.
    pub fn backoff(&self, failures: u32) -> Duration {
        let factor = 1u32 << failures.saturating_sub(1).min(16);
        self.backoff_base.saturating_mul(factor).min(self.backoff_cap)
    }
}

impl Default for DeliveryPolicy {
    fn default() -> Self {
        Self::from_settings(&DeliverySettings::default(), std::env::temp_dir())
    }
}

/// Identifies a unit in logs and dead letters.
struct Attempt<'a> {
    source: ChatId,
    dest: ChatId,
    ids: &'a [MessageId],
}

pub struct DeliveryEngine {
    policy: DeliveryPolicy,
    dead_letters: Option<Arc<DeadLetterLog>>,
}

impl DeliveryEngine {
    pub fn new(policy: DeliveryPolicy, dead_letters: Option<Arc<DeadLetterLog>>) -> Self {
        Self {
            policy,
            dead_letters,
        }
    }

    pub fn policy(&self) -> &DeliveryPolicy {
        &self.policy
    }

    /// Deliver `unit` to `dest`, optionally as a reply to `reply_to`.
    pub async fn send(
        &self,
        dest: ChatId,
        unit: &Unit,
        reply_to: Option<MessageId>,
    ) -> Option<Delivered> {
        match unit {
            Unit::Single(env) => self.send_single(dest, env, reply_to).await,
            Unit::Album(envs) => self.send_album(dest, envs, reply_to).await,
        }
    }

    async fn send_single(
        &self,
        dest: ChatId,
        env: &Envelope,
        reply_to: Option<MessageId>,
    ) -> Option<Delivered> {
        let ids = [env.source.id];
        let attempt = Attempt {
            source: env.source.chat_id,
            dest,
            ids: &ids,
        };

        if env.source.kind.is_unsupported() {
            return self.send_unsupported_notice(&attempt, env, reply_to).await;
        }
        if !env.has_media() && env.text.trim().is_empty() {
            tracing::debug!(chat = %env.source.chat_id, id = %env.source.id, "empty message skipped");
            return None;
        }

        let sent = self
            .with_retries(&attempt, || self.try_single(dest, env, reply_to))
            .await?;
        Some(Delivered {
            messages: vec![sent],
        })
    }

    async fn send_unsupported_notice(
        &self,
        attempt: &Attempt<'_>,
        env: &Envelope,
        reply_to: Option<MessageId>,
    ) -> Option<Delivered> {
        if env.text.trim().is_empty() {
            tracing::warn!(
                source = %attempt.source,
                id = %env.source.id,
                "unsupported content without text dropped"
            );
            return None;
        }
        let text = format!("{}\n\n{UNSUPPORTED_NOTICE}", env.text);
        let opts = SendOptions {
            reply_to,
            buttons: None,
            html: env.html,
        };
        let sent = self
            .with_retries(attempt, || env.client.send_text(attempt.dest, &text, &opts))
            .await?;
        Some(Delivered {
            messages: vec![sent],
        })
    }

    /// One retry cycle over the fallback tiers.
    async fn try_single(
        &self,
        dest: ChatId,
        env: &Envelope,
        reply_to: Option<MessageId>,
    ) -> Result<MessageRef> {
        let full = SendOptions {
            reply_to,
            buttons: env.buttons.clone(),
            html: env.html,
        };

        let err = match self.send_once(dest, env, &full).await {
            Ok(r) => return Ok(r),
            Err(e) => e,
        };

        match err {
            Error::RateLimited(_) => Err(err),
            Error::StaleReference(_) => self.reupload(dest, env, &full).await,
            Error::InvalidMedia(_) => self.text_only(dest, env, &full, err).await,
            other if full.buttons.is_some() => {
                tracing::warn!(dest = %dest, id = %env.source.id, "send with buttons failed ({other}), retrying without");
                let plain = SendOptions {
                    buttons: None,
                    ..full
                };
                match self.send_once(dest, env, &plain).await {
                    Ok(r) => Ok(r),
                    Err(Error::StaleReference(_)) => self.reupload(dest, env, &plain).await,
                    Err(e @ Error::InvalidMedia(_)) => self.text_only(dest, env, &plain, e).await,
                    Err(e) => Err(e),
                }
            }
            other => Err(other),
        }
    }

    async fn send_once(&self, dest: ChatId, env: &Envelope, opts: &SendOptions) -> Result<MessageRef> {
        match outgoing_file(env) {
            None => env.client.send_text(dest, &env.text, opts).await,
            Some(file) if file.spoiler => self.send_spoiler(dest, env, &file, opts).await,
            Some(file) => env.client.send_file(dest, &file, &env.text, opts).await,
        }
    }

    /// Spoiler media must carry the marking on the outgoing object; a stale handle is
    /// replaced by a fresh upload that keeps the marking.
    async fn send_spoiler(
        &self,
        dest: ChatId,
        env: &Envelope,
        file: &OutgoingFile,
        opts: &SendOptions,
    ) -> Result<MessageRef> {
        match env.client.send_file(dest, file, &env.text, opts).await {
            Err(Error::StaleReference(reason)) => {
                tracing::info!(dest = %dest, id = %env.source.id, "spoiler media reference expired ({reason}), re-uploading");
                self.reupload(dest, env, opts).await
            }
            other => other,
        }
    }

    /// Download the original attachment and send it as a fresh upload.
    async fn reupload(&self, dest: ChatId, env: &Envelope, opts: &SendOptions) -> Result<MessageRef> {
        if env.new_file.is_some() {
            return Err(Error::External(
                "upload of regenerated file was rejected".to_string(),
            ));
        }
        let media = env
            .source
            .media
            .as_ref()
            .ok_or_else(|| Error::InvalidMedia("no attachment to re-upload".to_string()))?;

        tokio::fs::create_dir_all(&self.policy.temp_dir).await?;
        let path = env.client.download_media(media, &self.policy.temp_dir).await?;
        let file = OutgoingFile {
            source: FileSource::Local(path.clone()),
            file_type: env.file_type,
            spoiler: media.spoiler,
        };
        let res = env.client.send_file(dest, &file, &env.text, opts).await;
        remove_temp(&path);
        res
    }

    async fn text_only(
        &self,
        dest: ChatId,
        env: &Envelope,
        opts: &SendOptions,
        cause: Error,
    ) -> Result<MessageRef> {
        if env.text.trim().is_empty() {
            return Err(cause);
        }
        tracing::warn!(dest = %dest, id = %env.source.id, "media rejected ({cause}), sending text only");
        env.client.send_text(dest, &env.text, opts).await
    }

    async fn send_album(
        &self,
        dest: ChatId,
        envs: &[Envelope],
        reply_to: Option<MessageId>,
    ) -> Option<Delivered> {
        let lead = envs.first()?;
        let source = lead.source.chat_id;
        let ids: Vec<MessageId> = envs.iter().map(|e| e.source.id).collect();
        let attempt = Attempt {
            source,
            dest,
            ids: &ids,
        };

        if self.policy.preserve_attribution {
            match lead.client.forward(dest, source, &ids).await {
                Ok(messages) if !messages.is_empty() => return Some(Delivered { messages }),
                Ok(_) => tracing::warn!(dest = %dest, "native forward returned nothing, copying instead"),
                Err(Error::PartialForward { forwarded, cause }) => {
                    tracing::warn!(
                        dest = %dest,
                        forwarded = forwarded.len(),
                        "native forward stopped midway ({cause}), removing copies before copying"
                    );
                    let stray: Vec<MessageId> = forwarded.iter().map(|m| m.message_id).collect();
                    if let Err(e) = lead.client.delete_messages(dest, &stray).await {
                        tracing::error!(dest = %dest, ids = ?stray, "failed to remove partial forward: {e}");
                    }
                }
                Err(e) => tracing::warn!(dest = %dest, "native forward failed ({e}), copying instead"),
            }
        }

        let caption = combined_caption(envs);
        let html = envs.iter().any(|e| e.html);
        let opts = SendOptions {
            reply_to,
            buttons: None,
            html,
        };

        let members: Vec<&Envelope> = envs
            .iter()
            .filter(|e| !e.source.kind.is_unsupported() && e.has_media() && e.file_type.albumable())
            .collect();

        if members.is_empty() {
            if caption.trim().is_empty() {
                tracing::warn!(source = %source, dest = %dest, ids = ?ids, "album has no deliverable members");
                return None;
            }
            let sent = self
                .with_retries(&attempt, || lead.client.send_text(dest, &caption, &opts))
                .await?;
            return Some(Delivered {
                messages: vec![sent],
            });
        }

        // An oversized caption would be rejected on every attempt; it follows the album
        // as a reply instead.
        let limit = lead.client.capabilities().max_caption_len;
        let overflow = caption.chars().count() > limit;
        let album_caption = if overflow { "" } else { caption.as_str() };

        let messages = self
            .with_retries(&attempt, || self.try_album(dest, &members, album_caption, &opts))
            .await?;

        if overflow {
            tracing::info!(dest = %dest, len = caption.chars().count(), "album caption over {limit} chars, sending as reply");
            let follow = SendOptions {
                reply_to: messages.first().map(|m| m.message_id),
                buttons: None,
                html,
            };
            self.with_retries(&attempt, || lead.client.send_text(dest, &caption, &follow))
                .await;
        }
        Some(Delivered { messages })
    }

    async fn try_album(
        &self,
        dest: ChatId,
        members: &[&Envelope],
        caption: &str,
        opts: &SendOptions,
    ) -> Result<Vec<MessageRef>> {
        let Some(lead) = members.first() else {
            return Err(Error::InvalidMedia("empty album".to_string()));
        };
        let files: Vec<OutgoingFile> = members.iter().filter_map(|e| outgoing_file(e)).collect();

        let err = match send_files(lead, dest, &files, caption, opts).await {
            Ok(r) => return Ok(r),
            Err(e) => e,
        };

        match err {
            Error::StaleReference(reason) => {
                tracing::info!(dest = %dest, "album media reference expired ({reason}), re-uploading");
                self.reupload_album(dest, members, caption, opts).await
            }
            e @ Error::InvalidMedia(_) if !caption.trim().is_empty() => {
                tracing::warn!(dest = %dest, "album media rejected ({e}), sending caption only");
                let sent = lead.client.send_text(dest, caption, opts).await?;
                Ok(vec![sent])
            }
            other => Err(other),
        }
    }

    async fn reupload_album(
        &self,
        dest: ChatId,
        members: &[&Envelope],
        caption: &str,
        opts: &SendOptions,
    ) -> Result<Vec<MessageRef>> {
        tokio::fs::create_dir_all(&self.policy.temp_dir).await?;

        let mut files = Vec::with_capacity(members.len());
        let mut downloaded = Vec::new();
        let mut failure = None;
        for env in members {
            match (&env.new_file, &env.source.media) {
                (Some(path), _) => files.push(OutgoingFile {
                    source: FileSource::Local(path.clone()),
                    file_type: env.file_type,
                    spoiler: env.source.media.as_ref().map(|m| m.spoiler).unwrap_or(false),
                }),
                (None, Some(media)) => {
                    match env.client.download_media(media, &self.policy.temp_dir).await {
                        Ok(path) => {
                            downloaded.push(path.clone());
                            files.push(OutgoingFile {
                                source: FileSource::Local(path),
                                file_type: env.file_type,
                                spoiler: media.spoiler,
                            });
                        }
                        Err(e) => {
                            failure = Some(e);
                            break;
                        }
                    }
                }
                (None, None) => {}
            }
        }

        let res = match failure {
            Some(e) => Err(e),
            None => match members.first() {
                Some(lead) => send_files(lead, dest, &files, caption, opts).await,
                None => Err(Error::InvalidMedia("empty album".to_string())),
            },
        };
        for path in &downloaded {
            remove_temp(path);
        }
        res
    }

    /// Run `op` until it succeeds, the generic-failure ceiling is hit, or a terminal error
    /// occurs. Rate-limit signals sleep for the requested wait plus a margin and do not
    /// count against the ceiling.
    async fn with_retries<T, F, Fut>(&self, attempt: &Attempt<'_>, mut op: F) -> Option<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut failures = 0u32;
        let mut waits = 0u32;
        loop {
            let err = match op().await {
                Ok(v) => return Some(v),
                Err(e) => e,
            };

            match err {
                Error::RateLimited(wait) => {
                    waits += 1;
                    if waits > self.policy.max_rate_limit_waits {
                        self.give_up(attempt, &err);
                        return None;
                    }
                    let pause = wait + self.policy.flood_margin;
                    tracing::warn!(
                        source = %attempt.source,
                        dest = %attempt.dest,
                        "rate limited, sleeping {}s",
                        pause.as_secs()
                    );
                    sleep(pause).await;
                }
                Error::InvalidMedia(_) | Error::Unsupported(_) => {
                    self.give_up(attempt, &err);
                    return None;
                }
                other => {
                    failures += 1;
                    if failures >= self.policy.max_retries {
                        self.give_up(attempt, &other);
                        return None;
                    }
                    let delay = self.policy.backoff(failures);
                    tracing::warn!(
                        source = %attempt.source,
                        dest = %attempt.dest,
                        "send failed (attempt {failures}/{}): {other}; retrying in {}s",
                        self.policy.max_retries,
                        delay.as_secs()
                    );
                    sleep(delay).await;
                }
            }
        }
    }

    fn give_up(&self, attempt: &Attempt<'_>, err: &Error) {
        tracing::error!(
            source = %attempt.source,
            dest = %attempt.dest,
            posts = ?attempt.ids.iter().map(|m| m.0).collect::<Vec<_>>(),
            "delivery failed permanently: {err}"
        );
        if let Some(log) = &self.dead_letters {
            log.record(DeadLetter::new(
                attempt.source,
                attempt.dest,
                attempt.ids,
                &err.to_string(),
            ));
        }
    }
}

/// Non-empty member captions in member order, separated by a blank line.
pub fn combined_caption(envs: &[Envelope]) -> String {
    envs.iter()
        .map(|e| e.text.as_str())
        .filter(|t| !t.trim().is_empty())
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Destination message to reply to, if `msg` replies to something already mirrored there.
pub fn resolve_reply_target(
    mappings: &Mappings,
    msg: &SourceMessage,
    dest: ChatId,
) -> Option<MessageId> {
    let reply = msg.reply_to?;
    mappings.lookup_dest_post(MessageRef::new(msg.chat_id, reply.msg_id), dest)
}

fn outgoing_file(env: &Envelope) -> Option<OutgoingFile> {
    let spoiler = env.source.media.as_ref().map(|m| m.spoiler).unwrap_or(false);
    if let Some(path) = &env.new_file {
        return Some(OutgoingFile {
            source: FileSource::Local(path.clone()),
            file_type: env.file_type,
            spoiler,
        });
    }
    env.source.media.as_ref().map(|m| OutgoingFile {
        source: FileSource::Remote(m.file_ref.clone()),
        file_type: env.file_type,
        spoiler,
    })
}

async fn send_files(
    lead: &Envelope,
    dest: ChatId,
    files: &[OutgoingFile],
    caption: &str,
    opts: &SendOptions,
) -> Result<Vec<MessageRef>> {
    match files {
        [] => Err(Error::InvalidMedia("no files".to_string())),
        [one] => Ok(vec![lead.client.send_file(dest, one, caption, opts).await?]),
        many => lead.client.send_album(dest, many, caption, opts).await,
    }
}

fn remove_temp(path: &std::path::Path) {
    if let Err(e) = std::fs::remove_file(path) {
        tracing::debug!("failed to remove {}: {e}", path.display());
    }
}
