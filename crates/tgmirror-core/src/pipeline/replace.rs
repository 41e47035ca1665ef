use regex::Regex;
use serde::Deserialize;

use crate::{envelope::Envelope, Error, Result};

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct ReplaceConfig {
    pub enabled: bool,
    pub text: Vec<Replacement>,
    pub regex: bool,
}

#[derive(Clone, Debug, Deserialize)]
pub struct Replacement {
    pub find: String,
    #[serde(default)]
    pub replace: String,
}

enum Rule {
    Plain(String, String),
    Pattern(Regex, String),
}

impl Rule {
    fn apply(&self, input: &str) -> String {
        match self {
            Rule::Plain(find, with) => input.replace(find.as_str(), with),
            Rule::Pattern(re, with) => re.replace_all(input, with.as_str()).into_owned(),
        }
    }
}

/// Ordered text replacements over the message text and button labels.
pub struct ReplaceStage {
    rules: Vec<Rule>,
}

impl ReplaceStage {
    pub fn new(cfg: ReplaceConfig) -> Result<Self> {
        let mut rules = Vec::with_capacity(cfg.text.len());
        for r in cfg.text.into_iter().filter(|r| !r.find.is_empty()) {
            let rule = if cfg.regex {
                let re = Regex::new(&r.find).map_err(|e| {
                    Error::Config(format!("invalid replace pattern '{}': {e}", r.find))
                })?;
                Rule::Pattern(re, r.replace)
            } else {
                Rule::Plain(r.find, r.replace)
            };
            rules.push(rule);
        }
        Ok(Self { rules })
    }

    fn run(&self, input: &str) -> String {
        self.rules
            .iter()
            .fold(input.to_string(), |acc, rule| rule.apply(&acc))
    }

    pub fn apply(&self, env: &mut Envelope) {
        if !env.text.is_empty() {
            env.text = self.run(&env.text);
        }
        if let Some(kb) = env.buttons.as_mut() {
            for button in kb.rows.iter_mut().flatten() {
                button.label = self.run(&button.label);
            }
        }
    }
}
