use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};

use tgmirror_core::{
    comments::CommentMirror,
    config::{Config, ConfigStore, JsonFileStore},
    deadletter::DeadLetterLog,
    delivery::{DeliveryEngine, DeliveryPolicy},
    forward::Forwarder,
    live::LiveRunner,
    mapping::Mappings,
    messaging::{port::ChatClient, throttled::ThrottledClient},
    past::PastRunner,
    pipeline::{Pipeline, StageContext},
};
use tgmirror_telegram::{TelegramClient, TelegramFactory};

#[derive(Parser)]
#[command(name = "tgmirror", version, about = "Mirror channel posts and their comments")]
struct Cli {
    /// Forwarding rules file (overrides TGMIRROR_CONFIG).
    #[arg(long, env = "TGMIRROR_CONFIG")]
    config: Option<std::path::PathBuf>,

    #[command(subcommand)]
    mode: Mode,
}

#[derive(Subcommand, Clone, Copy)]
enum Mode {
    /// Replay history from each connection's offset, then exit.
    Past,
    /// Forward new posts, edits and comments as they arrive.
    Live,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    tgmirror_core::logging::init("tgmirror")?;

    let mut cfg = Config::load()?;
    if let Some(path) = cli.config {
        cfg.config_path = path;
    }
    let store: Arc<dyn ConfigStore> = Arc::new(JsonFileStore::new(cfg.config_path.clone()));
    let forward = store
        .load()
        .with_context(|| format!("reading {}", cfg.config_path.display()))?;

    if let Err(e) = cfg.validate(&forward) {
        tracing::error!("{e}");
        std::process::exit(1);
    }

    let telegram: Arc<dyn ChatClient> = Arc::new(TelegramClient::from_token(cfg.bot_token.clone()));
    let client: Arc<dyn ChatClient> = Arc::new(ThrottledClient::new(telegram, cfg.throttle));

    let pipeline = Arc::new(
        Pipeline::from_config(
            &forward.plugins,
            &StageContext {
                temp_dir: cfg.temp_dir.clone(),
                factory: Some(Arc::new(TelegramFactory)),
            },
        )
        .await,
    );
    tracing::info!(stages = ?pipeline.stage_names(), "pipeline ready");

    let dead_letters = cfg.dead_letter_path.clone().map(|p| Arc::new(DeadLetterLog::new(p)));
    let policy = DeliveryPolicy::from_settings(&forward.delivery, cfg.temp_dir.clone());
    let engine = Arc::new(DeliveryEngine::new(policy.clone(), dead_letters));
    let mappings = Mappings::default();
    let mirror = Arc::new(CommentMirror::new(
        client.clone(),
        pipeline.clone(),
        engine.clone(),
        mappings.clone(),
        forward.comments.clone(),
    ));
    let forwarder = Arc::new(Forwarder::new(client, pipeline, engine, mappings, mirror));

    match cli.mode {
        Mode::Past => {
            let runner = PastRunner::new(forwarder, store, forward.past.clone(), policy);
            let report = match runner.run().await {
                Ok(r) => r,
                Err(e) => {
                    tracing::error!("{e}");
                    std::process::exit(1);
                }
            };
            tracing::info!(
                connections = report.connections,
                units = report.units,
                delivered = report.delivered,
                "past mode finished"
            );
        }
        Mode::Live => {
            LiveRunner::new(forwarder, forward.live.clone())
                .run(&forward)
                .await?;
            tracing::info!("live mode stopped");
        }
    }

    Ok(())
}
