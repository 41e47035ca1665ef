use serde::Deserialize;

use crate::envelope::Envelope;

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct CaptionConfig {
    pub enabled: bool,
    pub header: String,
    pub footer: String,
}

/// Adds a fixed header and/or footer.
pub struct CaptionStage {
    header: String,
    footer: String,
}

impl CaptionStage {
    pub fn new(cfg: CaptionConfig) -> Self {
        Self {
            header: cfg.header,
            footer: cfg.footer,
        }
    }

    pub fn apply(&self, env: &mut Envelope) {
        env.text = format!("{}{}{}", self.header, env.text, self.footer);
    }

    /// Albums share one combined caption: header goes on the first member, footer on the last.
    pub fn apply_group(&self, mut envs: Vec<Envelope>) -> Vec<Envelope> {
        if let Some(first) = envs.first_mut() {
            first.text = format!("{}{}", self.header, first.text);
        }
        if let Some(last) = envs.last_mut() {
            last.text = format!("{}{}", last.text, self.footer);
        }
        envs
    }
}
