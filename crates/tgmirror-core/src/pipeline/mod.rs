//! Ordered transform pipeline.
//!
//! Stages come from a fixed registry and always run in registry order, so the filter
//! vetoes before expensive media stages touch the network or spawn processes.
//! A stage returning `None` drops the message; the remaining stages never run.

use std::{collections::BTreeMap, path::PathBuf, sync::Arc};

use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::{envelope::Envelope, messaging::port::ClientFactory, Result};

pub mod caption;
pub mod external;
pub mod filter;
pub mod format;
pub mod replace;
pub mod sender;

pub use caption::CaptionStage;
pub use external::{OcrStage, WatermarkStage};
pub use filter::FilterStage;
pub use format::FormatStage;
pub use replace::ReplaceStage;
pub use sender::SenderStage;

/// Registry order. Configuration can only enable/disable entries, never reorder them.
pub const STAGE_ORDER: [&str; 7] = [
    "filter",
    "ocr",
    "replace",
    "caption",
    "format",
    "watermark",
    "sender",
];

/// Result of one stage on one envelope.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verdict {
    Keep,
    Drop,
}

pub enum Stage {
    Filter(FilterStage),
    Ocr(OcrStage),
    Replace(ReplaceStage),
    Caption(CaptionStage),
    Format(FormatStage),
    Watermark(WatermarkStage),
    Sender(SenderStage),
}

impl Stage {
    pub fn name(&self) -> &'static str {
        match self {
            Stage::Filter(_) => "filter",
            Stage::Ocr(_) => "ocr",
            Stage::Replace(_) => "replace",
            Stage::Caption(_) => "caption",
            Stage::Format(_) => "format",
            Stage::Watermark(_) => "watermark",
            Stage::Sender(_) => "sender",
        }
    }

    async fn transform(&self, env: &mut Envelope) -> Result<Verdict> {
        match self {
            Stage::Filter(s) => Ok(s.check(env)),
            Stage::Ocr(s) => s.apply(env).await,
            Stage::Replace(s) => {
                s.apply(env);
                Ok(Verdict::Keep)
            }
            Stage::Caption(s) => {
                s.apply(env);
                Ok(Verdict::Keep)
            }
            Stage::Format(s) => {
                s.apply(env);
                Ok(Verdict::Keep)
            }
            Stage::Watermark(s) => s.apply(env).await,
            Stage::Sender(s) => {
                s.apply(env);
                Ok(Verdict::Keep)
            }
        }
    }

    /// Apply this stage to one envelope. `None` is a veto.
    ///
    /// A failing stage passes the envelope through untouched; stages only commit their
    /// mutation once every fallible step has succeeded.
    pub async fn modify(&self, mut env: Envelope) -> Option<Envelope> {
        match self.transform(&mut env).await {
            Ok(Verdict::Keep) => Some(env),
            Ok(Verdict::Drop) => None,
            Err(e) => {
                tracing::error!(
                    stage = self.name(),
                    chat = %env.source.chat_id,
                    id = %env.source.id,
                    "stage failed, passing message through: {e}"
                );
                Some(env)
            }
        }
    }

    /// Album-aware variant. Defaults to `modify` over each member, dropping vetoed ones.
    pub async fn modify_group(&self, envs: Vec<Envelope>) -> Vec<Envelope> {
        if let Stage::Caption(s) = self {
            return s.apply_group(envs);
        }
        let mut out = Vec::with_capacity(envs.len());
        for env in envs {
            if let Some(env) = self.modify(env).await {
                out.push(env);
            }
        }
        out
    }
}

/// Inputs some stages need while being built.
#[derive(Clone)]
pub struct StageContext {
    pub temp_dir: PathBuf,
    pub factory: Option<Arc<dyn ClientFactory>>,
}

#[derive(Default)]
pub struct Pipeline {
    stages: Vec<Stage>,
}

#[derive(Deserialize)]
struct Toggle {
    #[serde(default)]
    enabled: bool,
}

impl Pipeline {
    pub fn new(stages: Vec<Stage>) -> Self {
        Self { stages }
    }

    /// Build the enabled stages from plugin configuration.
    ///
    /// Unknown names and unparsable configs are logged and skipped. A stage whose
    /// one-time initialisation fails is left out; the rest of the pipeline still runs.
    pub async fn from_config(
        plugins: &BTreeMap<String, serde_json::Value>,
        ctx: &StageContext,
    ) -> Self {
        for name in plugins.keys() {
            if !STAGE_ORDER.contains(&name.as_str()) {
                tracing::error!("unknown plugin '{name}' ignored");
            }
        }

        let mut stages = Vec::new();
        for name in STAGE_ORDER {
            let Some(raw) = plugins.get(name) else {
                continue;
            };
            match serde_json::from_value::<Toggle>(raw.clone()) {
                Ok(t) if t.enabled => {}
                Ok(_) => continue,
                Err(e) => {
                    tracing::error!("plugin '{name}' config is invalid: {e}");
                    continue;
                }
            }

            match build_stage(name, raw, ctx).await {
                Ok(stage) => {
                    tracing::info!("loaded plugin '{name}'");
                    stages.push(stage);
                }
                Err(e) => tracing::error!("failed to load plugin '{name}': {e}"),
            }
        }

        Self { stages }
    }

    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    pub async fn apply(&self, mut env: Envelope) -> Option<Envelope> {
        for stage in &self.stages {
            env = stage.modify(env).await?;
        }
        Some(env)
    }

    pub async fn apply_group(&self, mut envs: Vec<Envelope>) -> Vec<Envelope> {
        for stage in &self.stages {
            if envs.is_empty() {
                break;
            }
            envs = stage.modify_group(envs).await;
        }
        envs
    }
}

fn parse<T: DeserializeOwned>(raw: &serde_json::Value) -> Result<T> {
    Ok(serde_json::from_value(raw.clone())?)
}

async fn build_stage(name: &str, raw: &serde_json::Value, ctx: &StageContext) -> Result<Stage> {
    let stage = match name {
        "filter" => Stage::Filter(FilterStage::new(parse(raw)?)?),
        "ocr" => Stage::Ocr(OcrStage::new(parse(raw)?, ctx.temp_dir.clone())),
        "replace" => Stage::Replace(ReplaceStage::new(parse(raw)?)?),
        "caption" => Stage::Caption(CaptionStage::new(parse(raw)?)),
        "format" => Stage::Format(FormatStage::new(parse(raw)?)),
        "watermark" => Stage::Watermark(WatermarkStage::new(parse(raw)?, ctx.temp_dir.clone())),
        "sender" => Stage::Sender(SenderStage::init(parse(raw)?, ctx.factory.as_deref()).await?),
        other => {
            return Err(crate::Error::Config(format!("no such stage: {other}")));
        }
    };
    Ok(stage)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ChatId, MessageId};
    use crate::messaging::types::SourceMessage;
    use crate::testing::FakeClient;
    use serde_json::json;

    fn env(id: i32, text: &str) -> Envelope {
        Envelope::new(
            SourceMessage::new(ChatId(1), MessageId(id), text),
            Arc::new(FakeClient::default()),
        )
    }

    fn ctx() -> StageContext {
        StageContext {
            temp_dir: std::env::temp_dir(),
            factory: None,
        }
    }

    #[tokio::test]
    async fn builds_enabled_stages_in_registry_order() {
        let plugins: BTreeMap<String, serde_json::Value> = serde_json::from_value(json!({
            "caption": { "enabled": true, "footer": "\n-- via mirror" },
            "filter": { "enabled": true, "text": { "blacklist": ["spam"] } },
            "format": { "enabled": false, "style": "bold" },
            "bogus": { "enabled": true },
            "replace": { "enabled": true, "text": [{ "find": 42 }] }
        }))
        .unwrap();

        let p = Pipeline::from_config(&plugins, &ctx()).await;
        assert_eq!(p.stage_names(), vec!["filter", "caption"]);
    }

    #[tokio::test]
    async fn veto_short_circuits_later_stages() {
        let plugins: BTreeMap<String, serde_json::Value> = serde_json::from_value(json!({
            "filter": { "enabled": true, "text": { "blacklist": ["spam"] } },
            "caption": { "enabled": true, "header": "H: " }
        }))
        .unwrap();
        let p = Pipeline::from_config(&plugins, &ctx()).await;

        assert!(p.apply(env(1, "buy spam now")).await.is_none());
        let kept = p.apply(env(2, "hello")).await.unwrap();
        assert_eq!(kept.text, "H: hello");
    }

    #[tokio::test]
    async fn group_drops_vetoed_members_only() {
        let plugins: BTreeMap<String, serde_json::Value> = serde_json::from_value(json!({
            "filter": { "enabled": true, "text": { "blacklist": ["nsfw"] } }
        }))
        .unwrap();
        let p = Pipeline::from_config(&plugins, &ctx()).await;

        let out = p
            .apply_group(vec![env(1, "a"), env(2, "nsfw b"), env(3, "c")])
            .await;
        let ids: Vec<i32> = out.iter().map(|e| e.source.id.0).collect();
        assert_eq!(ids, vec![1, 3]);
    }

    #[tokio::test]
    async fn failing_stage_passes_through() {
        let dir = tempfile::tempdir().unwrap();
        let stage = Stage::Ocr(OcrStage::new(
            serde_json::from_value(json!({
                "enabled": true,
                "command": ["tgmirror-test-no-such-binary", "{file}"]
            }))
            .unwrap(),
            dir.path().to_path_buf(),
        ));
        let p = Pipeline::new(vec![stage]);

        let mut msg = SourceMessage::new(ChatId(1), MessageId(1), "text");
        msg.media = Some(crate::testing::photo("remote-1"));
        let out = p
            .apply(Envelope::new(msg, Arc::new(FakeClient::default())))
            .await
            .unwrap();
        assert_eq!(out.text, "text");
        assert!(out.new_file.is_none());
        // The downloaded input was cleaned up.
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
