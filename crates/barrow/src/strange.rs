//! Classification of subprocess stderr.
//!
//! Every line a pipeline stage writes on stderr is matched against an
//! ordered list of rules. The first match decides what happens to it; a
//! line no rule knows about is "strange" and kept verbatim in the journal.

use regex::Regex;
use serde::Deserialize;
use tracing::{debug, error, info};

use crate::config::{ConfigError, RuleConfig};
use crate::journal::{Entry, JournalHandle};
use crate::oplog::OpLog;
use crate::pipeline::LineHandler;

/// What to do with a matching line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleAction {
    Discard,
    Strange,
    Note,
    Warning,
    Error,
}

#[derive(Debug, Clone)]
struct Rule {
    name: String,
    regex: Regex,
    action: RuleAction,
    message: Option<String>,
}

/// Outcome of classifying one line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classified {
    /// Name of the matching rule, `None` when nothing matched.
    pub rule: Option<String>,
    pub action: RuleAction,
    pub message: String,
}

/// An ordered, compiled rule list.
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    rules: Vec<Rule>,
}

impl RuleSet {
    pub fn compile(configs: &[RuleConfig]) -> Result<Self, ConfigError> {
        let rules = configs
            .iter()
            .map(|c| {
                let regex = Regex::new(&c.pattern).map_err(|source| ConfigError::Rule {
                    name: c.name.clone(),
                    source,
                })?;
                Ok(Rule {
                    name: c.name.clone(),
                    regex,
                    action: c.action,
                    message: c.message.clone(),
                })
            })
            .collect::<Result<Vec<_>, ConfigError>>()?;
        Ok(Self { rules })
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn classify(&self, line: &str) -> Classified {
        for rule in &self.rules {
            let Some(caps) = rule.regex.captures(line) else {
                continue;
            };
            let message = match &rule.message {
                Some(template) => {
                    let mut message = String::new();
                    caps.expand(template, &mut message);
                    message
                }
                None => line.to_string(),
            };
            return Classified {
                rule: Some(rule.name.clone()),
                action: rule.action,
                message,
            };
        }

        Classified {
            rule: None,
            action: RuleAction::Strange,
            message: line.to_string(),
        }
    }
}

/// Routes classified stderr lines to the journal and the operator log.
pub struct StrangeParser<'a> {
    rules: &'a RuleSet,
    journal: JournalHandle,
    log: OpLog,
}

impl<'a> StrangeParser<'a> {
    pub fn new(rules: &'a RuleSet, journal: JournalHandle, log: OpLog) -> Self {
        Self {
            rules,
            journal,
            log,
        }
    }

    fn record(&self, entry: Entry) {
        if let Err(err) = self.journal.record(entry) {
            error!(%err, "could not record stderr line");
        }
    }
}

impl LineHandler for StrangeParser<'_> {
    fn line(&self, source: &str, line: &str) {
        let classified = self.rules.classify(line);
        match classified.action {
            RuleAction::Discard => {
                debug!(source, rule = ?classified.rule, line, "discarded");
            }
            RuleAction::Strange => self.record(Entry::Strange {
                source: source.to_string(),
                line: classified.message,
            }),
            RuleAction::Note => {
                info!(source, "{}", classified.message);
                self.record(Entry::Note {
                    message: classified.message,
                });
            }
            RuleAction::Warning => self.log.warning(format!("{source}: {}", classified.message)),
            RuleAction::Error => self.log.error(format!("{source}: {}", classified.message)),
        }
    }
}
