use serde::Deserialize;

use crate::envelope::Envelope;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Style {
    Bold,
    Italic,
    Code,
    Strike,
    Spoiler,
    #[default]
    Preserve,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct FormatConfig {
    pub enabled: bool,
    pub style: Style,
}

/// Escape text for Telegram HTML parse mode.
pub fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

/// Render `text` as HTML in the given style.
pub fn render(text: &str, style: Style) -> String {
    let escaped = escape_html(text);
    let (open, close) = match style {
        Style::Bold => ("<b>", "</b>"),
        Style::Italic => ("<i>", "</i>"),
        Style::Code => ("<code>", "</code>"),
        Style::Strike => ("<s>", "</s>"),
        Style::Spoiler => ("<tg-spoiler>", "</tg-spoiler>"),
        Style::Preserve => ("", ""),
    };
    format!("{open}{escaped}{close}")
}

/// Applies one text style to the whole message, switching it to HTML.
pub struct FormatStage {
    style: Style,
}

impl FormatStage {
    pub fn new(cfg: FormatConfig) -> Self {
        Self { style: cfg.style }
    }

    pub fn apply(&self, env: &mut Envelope) {
        if env.text.trim().is_empty() || env.html {
            return;
        }
        env.text = render(&env.text, self.style);
        env.html = true;
    }
}
