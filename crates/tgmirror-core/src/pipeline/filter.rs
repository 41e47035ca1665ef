use regex::{Regex, RegexBuilder};
use serde::Deserialize;

use crate::{envelope::Envelope, messaging::types::FileType, pipeline::Verdict, Error, Result};

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    pub enabled: bool,
    pub text: TextFilter,
    pub users: ListFilter<i64>,
    pub files: ListFilter<FileType>,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct TextFilter {
    pub blacklist: Vec<String>,
    pub whitelist: Vec<String>,
    /// Treat entries as regular expressions instead of substrings.
    pub regex: bool,
    pub case_sensitive: bool,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ListFilter<T> {
    pub blacklist: Vec<T>,
    pub whitelist: Vec<T>,
}

impl<T> Default for ListFilter<T> {
    fn default() -> Self {
        Self {
            blacklist: Vec::new(),
            whitelist: Vec::new(),
        }
    }
}

impl<T: PartialEq> ListFilter<T> {
    fn allows(&self, value: &T) -> bool {
        if self.blacklist.contains(value) {
            return false;
        }
        self.whitelist.is_empty() || self.whitelist.contains(value)
    }
}

/// Vetoes messages by text, sender and attachment type.
pub struct FilterStage {
    blacklist: Vec<Regex>,
    whitelist: Vec<Regex>,
    users: ListFilter<i64>,
    files: ListFilter<FileType>,
}

impl FilterStage {
    pub fn new(cfg: FilterConfig) -> Result<Self> {
        Ok(Self {
            blacklist: compile(&cfg.text.blacklist, &cfg.text)?,
            whitelist: compile(&cfg.text.whitelist, &cfg.text)?,
            users: cfg.users,
            files: cfg.files,
        })
    }

    pub fn check(&self, env: &Envelope) -> Verdict {
        if self.passes(env) {
            Verdict::Keep
        } else {
            tracing::debug!(chat = %env.source.chat_id, id = %env.source.id, "filtered out");
            Verdict::Drop
        }
    }

    fn passes(&self, env: &Envelope) -> bool {
        if !self.files.allows(&env.file_type) {
            return false;
        }

        // Messages without a known sender (channel posts) are only subject to the blacklist.
        match env.sender_id {
            Some(id) if !self.users.allows(&id) => return false,
            None if !self.users.whitelist.is_empty() => return false,
            _ => {}
        }

        let text = env.text.as_str();
        if self.blacklist.iter().any(|re| re.is_match(text)) {
            return false;
        }
        self.whitelist.is_empty() || self.whitelist.iter().any(|re| re.is_match(text))
    }
}

fn compile(patterns: &[String], cfg: &TextFilter) -> Result<Vec<Regex>> {
    patterns
        .iter()
        .filter(|p| !p.is_empty())
        .map(|p| {
            let src = if cfg.regex {
                p.clone()
            } else {
                regex::escape(p)
            };
            RegexBuilder::new(&src)
                .case_insensitive(!cfg.case_sensitive)
                .build()
                .map_err(|e| Error::Config(format!("invalid filter pattern '{p}': {e}")))
        })
        .collect()
}
