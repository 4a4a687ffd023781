//! Run naming
//!
//! A run name is a correlation key for logs and checkpoints. It is never
//! parsed back.

use std::collections::HashMap;

use chrono::{DateTime, Local};
use uuid::Uuid;

use crate::{Error, Result};

/// Framework tag, phase tag, timestamp and a random suffix against
/// collisions within one second
pub const DEFAULT_RUN_NAME_TEMPLATE: &str = "{framework}-{phase}-{timestamp}-{uid}";

const TIMESTAMP_FORMAT: &str = "%Y_%m_%d_%H_%M_%S";

/// Expand `{placeholder}` names in `template` from `substitutions`.
///
/// `{{` and `}}` produce literal braces.
pub fn make_run_name(template: &str, substitutions: &HashMap<&str, String>) -> Result<String> {
    let invalid = |message: String| {
        Error::config(&["RUN.run_name_template"], message)
    };

    let mut out = String::with_capacity(template.len() + 32);
    let mut chars = template.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '{' if chars.peek() == Some(&'{') => {
                chars.next();
                out.push('{');
            }
            '}' if chars.peek() == Some(&'}') => {
                chars.next();
                out.push('}');
            }
            '{' => {
                let mut key = String::new();
                loop {
                    match chars.next() {
                        Some('}') => break,
                        Some(ch) => key.push(ch),
                        None => return Err(invalid(format!("unclosed placeholder in {template:?}"))),
                    }
                }
                let value = substitutions
                    .get(key.as_str())
                    .ok_or_else(|| invalid(format!("unknown placeholder {{{key}}}")))?;
                out.push_str(value);
            }
            '}' => return Err(invalid(format!("unmatched '}}' in {template:?}"))),
            other => out.push(other),
        }
    }

    Ok(out)
}

/// Values substituted into the run name template
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunNameParts {
    pub framework: String,
    pub phase: String,
    pub timestamp: String,
    pub uid: String,
}

impl RunNameParts {
    /// Parts for a run starting now
    pub fn now(framework: &str, phase: &str) -> Self {
        Self::at(framework, phase, Local::now())
    }

    pub fn at(framework: &str, phase: &str, time: DateTime<Local>) -> Self {
        let uid = Uuid::new_v4().simple().to_string();
        Self {
            framework: framework.to_string(),
            phase: phase.to_string(),
            timestamp: time.format(TIMESTAMP_FORMAT).to_string(),
            uid: uid[..8].to_string(),
        }
    }

    pub fn substitutions(&self) -> HashMap<&'static str, String> {
        HashMap::from([
            ("framework", self.framework.clone()),
            ("phase", self.phase.clone()),
            ("timestamp", self.timestamp.clone()),
            ("uid", self.uid.clone()),
        ])
    }

    pub fn render(&self, template: &str) -> Result<String> {
        make_run_name(template, &self.substitutions())
    }
}
