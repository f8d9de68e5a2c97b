//! Rule actions and the message edits a `modify` action applies.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::message::parse::parse_start_line;
use crate::message::{Header, HighlightColor, MalformedMessage, Message};
use crate::rules::predicate::compile_regex;
use crate::rules::RuleError;

/// Declarative action as written in config and the admin API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ActionConfig {
    Forward,
    Modify {
        edits: Vec<EditConfig>,
        /// Stop evaluating after this rule.
        #[serde(default)]
        stop: bool,
    },
    Drop,
    Hold,
}

/// Declarative edit. Also used by observers to amend a held message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EditConfig {
    SetHeader {
        name: String,
        value: String,
    },
    AppendHeader {
        name: String,
        value: String,
    },
    RemoveHeader {
        name: String,
    },
    ReplaceBody {
        body: String,
    },
    /// Regex replacement over the decoded body (`$1` style captures).
    ReplaceInBody {
        pattern: String,
        replacement: String,
    },
    SetStartLine {
        line: String,
    },
    Annotate {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        highlight: Option<HighlightColor>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        note: Option<String>,
    },
}

/// Compiled action.
#[derive(Debug, Clone)]
pub enum Action {
    Forward,
    Modify { edits: Vec<Edit>, stop: bool },
    Drop,
    Hold,
}

impl Action {
    pub fn compile(config: &ActionConfig) -> Result<Self, RuleError> {
        Ok(match config {
            ActionConfig::Forward => Action::Forward,
            ActionConfig::Drop => Action::Drop,
            ActionConfig::Hold => Action::Hold,
            ActionConfig::Modify { edits, stop } => Action::Modify {
                edits: compile_edits(edits)?,
                stop: *stop,
            },
        })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Action::Forward => "forward",
            Action::Modify { .. } => "modify",
            Action::Drop => "drop",
            Action::Hold => "hold",
        }
    }
}

/// Compiled edit.
#[derive(Debug, Clone)]
pub enum Edit {
    SetHeader { name: String, value: String },
    AppendHeader { name: String, value: String },
    RemoveHeader(String),
    ReplaceBody(Bytes),
    ReplaceInBody {
        regex: regex::bytes::Regex,
        replacement: Vec<u8>,
    },
    SetStartLine(String),
    Annotate {
        highlight: Option<HighlightColor>,
        note: Option<String>,
    },
}

impl Edit {
    pub fn compile(config: &EditConfig) -> Result<Self, RuleError> {
        let edit = match config {
            EditConfig::SetHeader { name, value } => {
                check_header(name, value)?;
                Edit::SetHeader {
                    name: name.clone(),
                    value: value.clone(),
                }
            }
            EditConfig::AppendHeader { name, value } => {
                check_header(name, value)?;
                Edit::AppendHeader {
                    name: name.clone(),
                    value: value.clone(),
                }
            }
            EditConfig::RemoveHeader { name } => Edit::RemoveHeader(name.clone()),
            EditConfig::ReplaceBody { body } => Edit::ReplaceBody(Bytes::from(body.clone().into_bytes())),
            EditConfig::ReplaceInBody { pattern, replacement } => Edit::ReplaceInBody {
                regex: compile_regex(pattern)?,
                replacement: replacement.clone().into_bytes(),
            },
            EditConfig::SetStartLine { line } => {
                if line.contains(['\r', '\n']) {
                    return Err(RuleError::Invalid("start line contains a line break".into()));
                }
                Edit::SetStartLine(line.clone())
            }
            EditConfig::Annotate { highlight, note } => Edit::Annotate {
                highlight: *highlight,
                note: note.clone(),
            },
        };
        Ok(edit)
    }

    /// Apply to `message`, producing a new version.
    pub fn apply(&self, message: &Message) -> Result<Message, MalformedMessage> {
        match self {
            Edit::SetHeader { name, value } => message.with_header(name, value),
            Edit::AppendHeader { name, value } => message.with_appended_header(name, value),
            Edit::RemoveHeader(name) => Ok(message.without_header(name)),
            Edit::ReplaceBody(body) => Ok(message.with_body(body.clone())),
            Edit::ReplaceInBody { regex, replacement } => {
                let body = message.decoded_body()?;
                if !regex.is_match(&body) {
                    return Ok(message.clone());
                }
                let replaced = regex.replace_all(&body, replacement.as_slice()).into_owned();
                Ok(message.with_body(replaced))
            }
            Edit::SetStartLine(line) => {
                let start = parse_start_line(line, message.direction())?;
                message.with_start_line(start)
            }
            Edit::Annotate { highlight, note } => {
                let mut next = message.clone();
                if highlight.is_some() {
                    next = next.with_highlight(*highlight);
                }
                if let Some(note) = note {
                    next = next.with_note(note.clone());
                }
                Ok(next)
            }
        }
    }
}

pub fn compile_edits(configs: &[EditConfig]) -> Result<Vec<Edit>, RuleError> {
    configs.iter().map(Edit::compile).collect()
}

/// Apply edits in order. All or nothing: on error the input is untouched.
pub fn apply_edits(message: &Message, edits: &[Edit]) -> Result<Message, MalformedMessage> {
    let mut current = message.clone();
    for edit in edits {
        current = edit.apply(&current)?;
    }
    Ok(current)
}

fn check_header(name: &str, value: &str) -> Result<(), RuleError> {
    Header::new(name, value)
        .map(|_| ())
        .map_err(|e| RuleError::Invalid(e.to_string()))
}
