//! Past mode: replay each enabled connection's history, oldest first, from its
//! persisted offset.
//!
//! The offset is saved after every unit, delivered or not. A unit whose delivery failed
//! on every retry is dead-lettered and skipped so one bad post cannot stall a backlog.
//! A history fetch that keeps failing abandons the connection for this run without
//! sending or persisting a partly read album.

use std::{sync::Arc, time::Duration};

use rand::Rng;
use tokio::{task::JoinSet, time::sleep};

use crate::{
    coalescer::{Batch, OrderedGrouper},
    config::{ConfigStore, ForwardConfig, PastSettings},
    delivery::DeliveryPolicy,
    domain::MessageId,
    forward::{Forwarder, Route},
    messaging::types::SourceMessage,
    Error, Result,
};

/// Totals of one past-mode run.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PastReport {
    pub connections: usize,
    pub units: usize,
    pub delivered: usize,
}

pub struct PastRunner {
    forwarder: Arc<Forwarder>,
    store: Arc<dyn ConfigStore>,
    settings: PastSettings,
    policy: DeliveryPolicy,
}

impl PastRunner {
    pub fn new(
        forwarder: Arc<Forwarder>,
        store: Arc<dyn ConfigStore>,
        settings: PastSettings,
        policy: DeliveryPolicy,
    ) -> Self {
        Self {
            forwarder,
            store,
            settings,
            policy,
        }
    }

    /// Process every enabled connection's backlog in configuration order.
    pub async fn run(&self) -> Result<PastReport> {
        if !self.forwarder.client().capabilities().supports_history {
            return Err(Error::Config(
                "past mode needs a client that can read channel history".to_string(),
            ));
        }
        let mut config = self.store.load()?;
        let mut report = PastReport::default();

        for idx in 0..config.connections.len() {
            let conn = config.connections[idx].clone();
            if !conn.enabled {
                continue;
            }
            let route = match self.forwarder.resolve(idx, &conn).await {
                Ok(r) => r,
                Err(e) => {
                    tracing::error!(connection = %conn.label(), "cannot resolve connection, skipping: {e}");
                    continue;
                }
            };

            tracing::info!(
                connection = %route.label,
                offset = conn.offset,
                end = ?conn.end,
                "replaying history"
            );
            self.run_connection(&route, &mut config, &mut report).await;
            report.connections += 1;
        }

        Ok(report)
    }

    async fn run_connection(
        &self,
        route: &Route,
        config: &mut ForwardConfig,
        report: &mut PastReport,
    ) {
        let conn = &config.connections[route.index];
        let end = conn.end.map(MessageId);
        let mut cursor = MessageId(conn.offset);
        let mut grouper = OrderedGrouper::new();
        let mut jobs = JoinSet::new();

        let exhausted = 'pages: loop {
            let Some(page) = self.fetch_page(route, cursor).await else {
                break false;
            };
            if page.is_empty() {
                break true;
            }

            for msg in page {
                if end.is_some_and(|e| msg.id > e) {
                    break 'pages true;
                }
                cursor = cursor.max(msg.id);
                for batch in grouper.push(msg) {
                    self.process(route, batch, config, report, &mut jobs).await;
                }
            }
        };

        match grouper.finish() {
            Some(batch) if exhausted => {
                self.process(route, batch, config, report, &mut jobs).await;
            }
            Some(batch) => tracing::warn!(
                connection = %route.label,
                held = batch.len(),
                "dropping partly read album; it is replayed on the next run"
            ),
            None => {}
        }

        while let Some(res) = jobs.join_next().await {
            if let Err(e) = res {
                tracing::error!(connection = %route.label, "comment mirror task failed: {e}");
            }
        }
        tracing::info!(connection = %route.label, "backlog complete");
    }

    async fn process(
        &self,
        route: &Route,
        batch: Batch,
        config: &mut ForwardConfig,
        report: &mut PastReport,
        jobs: &mut JoinSet<()>,
    ) {
        let Some(last) = batch.last().map(|m| m.id) else {
            return;
        };
        report.units += 1;

        let forwarded = self.forwarder.forward(route, batch).await;
        if let Some(f) = &forwarded {
            if f.reached > 0 {
                report.delivered += 1;
                if let Some(job) = self.forwarder.comment_job(route, f.post) {
                    jobs.spawn(job);
                }
            }
        }

        self.persist_offset(route, last, config);

        if forwarded.is_some() {
            sleep(self.inter_post_delay()).await;
        }
    }

    /// One history page after `cursor`. Rate limits wait in place; generic failures back
    /// off like deliveries do. `None` abandons the connection for this run.
    async fn fetch_page(&self, route: &Route, cursor: MessageId) -> Option<Vec<SourceMessage>> {
        let limit = self.settings.page_size.max(1);
        let mut failures = 0u32;
        let mut waits = 0u32;
        loop {
            let err = match self
                .forwarder
                .client()
                .history_page(route.source, cursor, limit)
                .await
            {
                Ok(page) => return Some(page),
                Err(e) => e,
            };

            match err {
                Error::RateLimited(wait) => {
                    waits += 1;
                    if waits > self.policy.max_rate_limit_waits {
                        tracing::error!(connection = %route.label, after = %cursor, "history fetch still rate limited after {} waits", waits - 1);
                        return None;
                    }
                    sleep(wait + self.policy.flood_margin).await;
                }
                e @ (Error::Unsupported(_) | Error::Config(_)) => {
                    tracing::error!(connection = %route.label, after = %cursor, "history unavailable: {e}");
                    return None;
                }
                e => {
                    failures += 1;
                    if failures >= self.policy.max_retries {
                        tracing::error!(connection = %route.label, after = %cursor, "history fetch failed {failures} times, giving up: {e}");
                        return None;
                    }
                    let delay = self.policy.backoff(failures);
                    tracing::warn!(
                        connection = %route.label,
                        after = %cursor,
                        "history fetch failed ({e}); retrying in {}s",
                        delay.as_secs()
                    );
                    sleep(delay).await;
                }
            }
        }
    }

    fn persist_offset(&self, route: &Route, last: MessageId, config: &mut ForwardConfig) {
        let conn = &mut config.connections[route.index];
        if last.0 <= conn.offset {
            return;
        }
        conn.offset = last.0;
        if let Err(e) = self.store.save(config) {
            tracing::error!(connection = %route.label, offset = last.0, "failed to persist offset: {e}");
        }
    }

    fn inter_post_delay(&self) -> Duration {
        let lo = self.settings.delay_min_secs;
        let hi = self.settings.delay_max_secs.max(lo);
        Duration::from_secs(rand::thread_rng().gen_range(lo..=hi))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::{CommentPolicy, Connection},
        domain::ChatId,
        forward::tests::forwarder,
        pipeline::{filter::FilterConfig, FilterStage, Pipeline, Stage},
        testing::{album_member, msg, Call, Fail, FakeClient, MemoryStore},
    };

    const SRC: ChatId = ChatId(-100);
    const DST: ChatId = ChatId(-200);

    fn config(offset: i32, end: Option<i32>) -> ForwardConfig {
        ForwardConfig {
            connections: vec![Connection {
                name: "news".to_string(),
                source: SRC.0.to_string(),
                dest: vec![DST.0.to_string()],
                offset,
                end,
                enabled: true,
                comments: CommentPolicy::default(),
            }],
            past: PastSettings {
                delay_min_secs: 0,
                delay_max_secs: 0,
                page_size: 2,
            },
            ..ForwardConfig::default()
        }
    }

    fn runner(
        client: &Arc<FakeClient>,
        pipeline: Pipeline,
        cfg: ForwardConfig,
    ) -> (PastRunner, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new(cfg.clone()));
        let runner = PastRunner::new(
            Arc::new(forwarder(client, pipeline)),
            store.clone(),
            cfg.past.clone(),
            DeliveryPolicy::default(),
        );
        (runner, store)
    }

    fn history() -> Vec<crate::messaging::types::SourceMessage> {
        vec![
            msg(SRC.0, 99, "already done"),
            msg(SRC.0, 100, "already done"),
            album_member(SRC.0, 101, "one", "A"),
            album_member(SRC.0, 102, "two", "A"),
            album_member(SRC.0, 103, "three", "A"),
            msg(SRC.0, 104, "single"),
        ]
    }

    #[tokio::test(start_paused = true)]
    async fn album_then_single_persists_offsets_in_order() {
        let client = Arc::new(FakeClient::default());
        client.set_history(SRC, history());
        let (runner, store) = runner(&client, Pipeline::default(), config(100, None));

        let report = runner.run().await.unwrap();
        assert_eq!(report.units, 2);
        assert_eq!(report.delivered, 2);

        let sends = client.sends();
        assert_eq!(sends.len(), 2);
        match &sends[0] {
            Call::Album { files, caption, .. } => {
                assert_eq!(files.len(), 3);
                assert_eq!(caption, "one\n\ntwo\n\nthree");
            }
            other => panic!("unexpected call {other:?}"),
        }
        assert_eq!(client.sent_texts(), vec!["single"]);
        assert_eq!(store.saved_offsets(0), vec![103, 104]);
    }

    #[tokio::test(start_paused = true)]
    async fn second_run_resumes_after_persisted_offset() {
        let client = Arc::new(FakeClient::default());
        client.set_history(SRC, history());
        let (runner, store) = runner(&client, Pipeline::default(), config(100, None));
        runner.run().await.unwrap();
        let sent_first = client.sends().len();

        // A fresh runner on the saved config, as after a restart.
        let saved = store.load().unwrap();
        let (second, _) = self::runner(&client, Pipeline::default(), saved);
        let before = client.history_requests().len();
        second.run().await.unwrap();

        let requests = client.history_requests();
        assert_eq!(requests[before], (SRC, MessageId(104)));
        assert_eq!(client.sends().len(), sent_first);
    }

    #[tokio::test(start_paused = true)]
    async fn stops_at_end_id() {
        let client = Arc::new(FakeClient::default());
        client.set_history(SRC, (1..=10).map(|i| msg(SRC.0, i, "m")).collect());
        let (runner, store) = runner(&client, Pipeline::default(), config(0, Some(4)));

        runner.run().await.unwrap();
        assert_eq!(client.sends().len(), 4);
        assert_eq!(store.saved_offsets(0), vec![1, 2, 3, 4]);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_and_vetoed_units_still_advance_offset() {
        let client = Arc::new(FakeClient::default());
        client.set_history(
            SRC,
            vec![msg(SRC.0, 1, "spam here"), msg(SRC.0, 2, "a"), msg(SRC.0, 3, "b")],
        );
        client.fail_always(DST, Fail::Generic);
        let mut filter = FilterConfig::default();
        filter.enabled = true;
        filter.text.blacklist = vec!["spam".to_string()];
        let pipeline = Pipeline::new(vec![Stage::Filter(FilterStage::new(filter).unwrap())]);
        let (runner, store) = runner(&client, pipeline, config(0, None));

        let report = runner.run().await.unwrap();
        assert_eq!(report.units, 3);
        assert_eq!(report.delivered, 0);
        // Two surviving messages, three attempts each.
        assert_eq!(client.attempts_to(DST), 6);
        assert_eq!(store.saved_offsets(0), vec![1, 2, 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limited_history_fetch_is_retried_in_place() {
        let client = Arc::new(FakeClient::default());
        client.set_history(SRC, vec![msg(SRC.0, 1, "a")]);
        client.fail_history_next(Fail::RateLimit(Duration::from_secs(20)));
        let (runner, store) = runner(&client, Pipeline::default(), config(0, None));

        let start = tokio::time::Instant::now();
        runner.run().await.unwrap();
        assert!(start.elapsed() >= Duration::from_secs(25));
        assert_eq!(store.saved_offsets(0), vec![1]);
        let requests = client.history_requests();
        assert_eq!(requests[0], (SRC, MessageId(0)));
        assert_eq!(requests[1], (SRC, MessageId(0)));
    }

    #[tokio::test(start_paused = true)]
    async fn transient_history_failure_is_retried_without_skipping() {
        let client = Arc::new(FakeClient::default());
        client.set_history(SRC, (1..=6).map(|i| msg(SRC.0, i, "m")).collect());
        client.fail_history_after(MessageId(2), Fail::Generic);
        let (runner, store) = runner(&client, Pipeline::default(), config(0, None));

        let start = tokio::time::Instant::now();
        let report = runner.run().await.unwrap();
        assert_eq!(report.delivered, 6);
        assert_eq!(store.saved_offsets(0), vec![1, 2, 3, 4, 5, 6]);
        // One backoff step before the same page is asked for again.
        assert!(start.elapsed() >= Duration::from_secs(5));
        let after_two = client
            .history_requests()
            .iter()
            .filter(|(_, after)| *after == MessageId(2))
            .count();
        assert_eq!(after_two, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_fetch_never_splits_an_album() {
        let client = Arc::new(FakeClient::default());
        client.set_history(SRC, history());
        // Page two starts after 102, mid-album; it fails on every retry.
        for _ in 0..3 {
            client.fail_history_after(MessageId(102), Fail::Generic);
        }
        let (runner, store) = runner(&client, Pipeline::default(), config(100, None));

        let report = runner.run().await.unwrap();
        assert_eq!(report.units, 0);
        assert!(client.sends().is_empty());
        assert!(store.saved_offsets(0).is_empty());

        // The next run replays the whole album as one unit.
        let saved = store.load().unwrap();
        let (second, store) = self::runner(&client, Pipeline::default(), saved);
        second.run().await.unwrap();
        match &client.sends()[..] {
            [Call::Album { files, .. }, Call::Text { text, .. }] => {
                assert_eq!(files.len(), 3);
                assert_eq!(text, "single");
            }
            other => panic!("unexpected calls {other:?}"),
        }
        assert_eq!(store.saved_offsets(0), vec![103, 104]);
    }

    #[tokio::test(start_paused = true)]
    async fn endless_rate_limits_on_history_give_up() {
        let client = Arc::new(FakeClient::default());
        client.set_history(SRC, vec![msg(SRC.0, 1, "a")]);
        let policy = DeliveryPolicy {
            max_rate_limit_waits: 2,
            ..DeliveryPolicy::default()
        };
        for _ in 0..3 {
            client.fail_history_after(MessageId(0), Fail::RateLimit(Duration::from_secs(1)));
        }
        let cfg = config(0, None);
        let store = Arc::new(MemoryStore::new(cfg.clone()));
        let runner = PastRunner::new(
            Arc::new(forwarder(&client, Pipeline::default())),
            store.clone(),
            cfg.past.clone(),
            policy,
        );

        runner.run().await.unwrap();
        assert_eq!(client.history_requests().len(), 3);
        assert!(client.sends().is_empty());
        assert!(store.saved_offsets(0).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn refuses_to_start_without_history_support() {
        let client = Arc::new(FakeClient::default());
        client.disable_history();
        let (runner, _) = runner(&client, Pipeline::default(), config(0, None));

        assert!(matches!(runner.run().await, Err(Error::Config(_))));
        assert!(client.history_requests().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn disabled_connections_are_skipped() {
        let client = Arc::new(FakeClient::default());
        client.set_history(SRC, history());
        let mut cfg = config(0, None);
        cfg.connections[0].enabled = false;
        let (runner, _) = runner(&client, Pipeline::default(), cfg);

        let report = runner.run().await.unwrap();
        assert_eq!(report.connections, 0);
        assert!(client.history_requests().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn mirrors_comments_of_delivered_posts() {
        let client = Arc::new(FakeClient::default());
        client.set_history(SRC, vec![msg(SRC.0, 1, "post")]);
        let mut c = msg(-101, 10, "comment");
        c.reply_to = Some(crate::messaging::types::ReplyRef {
            msg_id: MessageId(5),
            top_id: Some(MessageId(5)),
        });
        client.set_replies(crate::domain::MessageRef::new(SRC, MessageId(1)), vec![c]);
        client.set_discussion(
            crate::domain::MessageRef::new(DST, MessageId(1000)),
            crate::domain::MessageRef::new(ChatId(-201), MessageId(900)),
        );

        let mut cfg = config(0, None);
        cfg.connections[0].comments.enabled = true;
        let (runner, _) = runner(&client, Pipeline::default(), cfg);
        runner.run().await.unwrap();

        let comment = client
            .sends()
            .into_iter()
            .find(|c| c.chat() == ChatId(-201));
        match comment {
            Some(Call::Text { text, opts, .. }) => {
                assert_eq!(text, "comment");
                assert_eq!(opts.reply_to, Some(MessageId(900)));
            }
            other => panic!("comment not mirrored: {other:?}"),
        }
    }
}
