// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Decides which bus messages flush, rotate or upload the capture files.
//!
//! A trigger fires when its subject pattern matches and, if configured, its XPath
//! and regex both accept the payload. Evaluation never fails: malformed payloads and
//! broken expressions simply make the trigger not fire.

use regex::bytes::Regex;
use sxd_xpath::{Context, Factory, Value};
use tracing::warn;

use crate::config::{EventConfig, LoggerConfig};
use crate::errors::ConfigError;
use crate::message::Message;
use crate::subject::Subject;

/// A configured rule deciding whether a message should cause an action.
pub trait TriggerRule {
    fn subject(&self) -> &Subject;

    /// Evaluates the payload part of the rule.
    fn evaluate(&self, payload: &[u8]) -> bool;

    fn matches(&self, message: &Message) -> bool {
        self.subject().matches(&message.subject) && self.evaluate(&message.payload)
    }
}

/// Returns the first rule, in order, that matches the message.
pub fn first_match<'a, R: TriggerRule>(rules: &'a [R], message: &Message) -> Option<&'a R> {
    rules.iter().find(|rule| rule.matches(message))
}

#[derive(Debug, Clone)]
pub struct Trigger {
    subject: Subject,
    xpath: Option<String>,
    regex: Option<Regex>,
}

/// Outcome of the XPath step.
enum XPathOutcome {
    Text(String),
    Other(bool),
}

impl Trigger {
    pub fn new(subject: Subject, xpath: Option<String>, regex: Option<Regex>) -> Self {
        Self {
            subject,
            xpath,
            regex,
        }
    }

    pub fn from_event(event: &EventConfig) -> Result<Self, ConfigError> {
        let subject = Subject::parse(&event.subject)?;
        let regex = event
            .regex
            .as_deref()
            .map(Regex::new)
            .transpose()
            .map_err(|source| ConfigError::Regex {
                subject: event.subject.clone(),
                source,
            })?;
        let xpath = event.xpath.clone().filter(|x| !x.trim().is_empty());
        Ok(Self::new(subject, xpath, regex))
    }

    fn evaluate_xpath(&self, expression: &str, payload: &[u8]) -> XPathOutcome {
        let Ok(text) = std::str::from_utf8(payload) else {
            warn!("Payload for event {} not valid XML: not UTF-8", self.subject);
            return XPathOutcome::Other(false);
        };
        let package = match sxd_document::parser::parse(text) {
            Ok(package) => package,
            Err(e) => {
                warn!("Payload for event {} not valid XML: {:?}", self.subject, e);
                return XPathOutcome::Other(false);
            }
        };
        let document = package.as_document();

        let xpath = match Factory::new().build(expression) {
            Ok(Some(xpath)) => xpath,
            Ok(None) => {
                warn!("Xpath for event {} is empty", self.subject);
                return XPathOutcome::Other(false);
            }
            Err(e) => {
                warn!("Xpath for event {} not valid: {:?}", self.subject, e);
                return XPathOutcome::Other(false);
            }
        };

        match xpath.evaluate(&Context::new(), document.root()) {
            Ok(Value::Nodeset(nodes)) => XPathOutcome::Other(nodes.size() > 0),
            Ok(Value::Number(n)) => XPathOutcome::Other(n != 0.0),
            Ok(Value::String(s)) => XPathOutcome::Text(s),
            Ok(Value::Boolean(b)) => XPathOutcome::Other(b),
            Err(e) => {
                warn!("Xpath for event {} failed to evaluate: {:?}", self.subject, e);
                XPathOutcome::Other(false)
            }
        }
    }
}

impl TriggerRule for Trigger {
    fn subject(&self) -> &Subject {
        &self.subject
    }

    fn evaluate(&self, payload: &[u8]) -> bool {
        let text = match &self.xpath {
            None => None,
            Some(expression) => match self.evaluate_xpath(expression, payload) {
                XPathOutcome::Other(found) => return found,
                XPathOutcome::Text(text) if text.is_empty() => return false,
                XPathOutcome::Text(text) => Some(text),
            },
        };
        match &self.regex {
            None => true,
            Some(regex) => match &text {
                Some(text) => regex.is_match(text.as_bytes()),
                None => regex.is_match(payload),
            },
        }
    }
}

/// Which actions a message triggered.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TriggerActions {
    pub upload: bool,
    pub flush: bool,
    pub new_file: bool,
}

impl TriggerActions {
    #[must_use]
    pub fn any(&self) -> bool {
        self.upload || self.flush || self.new_file
    }
}

/// The three trigger categories, each in configuration order.
#[derive(Debug, Default, Clone)]
pub struct TriggerSet {
    pub upload: Vec<Trigger>,
    pub flush: Vec<Trigger>,
    pub new_file: Vec<Trigger>,
}

impl TriggerSet {
    pub fn from_config(config: &LoggerConfig) -> Result<Self, ConfigError> {
        let compile = |events: &[EventConfig]| -> Result<Vec<Trigger>, ConfigError> {
            events.iter().map(Trigger::from_event).collect()
        };
        Ok(Self {
            upload: compile(config.upload_events())?,
            flush: compile(config.flush_events())?,
            new_file: compile(config.new_file_events())?,
        })
    }

    /// Subject patterns of every trigger, for subscribing.
    pub fn subjects(&self) -> impl Iterator<Item = &Subject> {
        self.upload
            .iter()
            .chain(&self.flush)
            .chain(&self.new_file)
            .map(TriggerRule::subject)
    }

    /// Evaluates every category independently; within a category the first match wins.
    #[must_use]
    pub fn evaluate(&self, message: &Message) -> TriggerActions {
        TriggerActions {
            upload: first_match(&self.upload, message).is_some(),
            flush: first_match(&self.flush, message).is_some(),
            new_file: first_match(&self.new_file, message).is_some(),
        }
    }
}
