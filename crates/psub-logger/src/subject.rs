// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Hierarchical bus subjects and subscription pattern matching.

use std::fmt;
use std::str::FromStr;

use crate::errors::SubjectError;

/// Token that matches any remaining tokens when it ends a pattern, or exactly one
/// token anywhere else.
pub const WILDCARD: &str = "*";

const SEPARATOR: char = '/';

/// An ordered, non-empty sequence of non-empty tokens, e.g. `Stat/Heartbeat`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Subject {
    tokens: Vec<String>,
}

impl Subject {
    /// Builds a subject from its tokens.
    ///
    /// # Errors
    ///
    /// Returns an error if there are no tokens or any token is empty.
    pub fn new<I, S>(tokens: I) -> Result<Self, SubjectError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let tokens: Vec<String> = tokens.into_iter().map(Into::into).collect();
        if tokens.is_empty() {
            return Err(SubjectError::Empty);
        }
        if tokens.iter().any(String::is_empty) {
            return Err(SubjectError::EmptyToken(tokens.join("/")));
        }
        Ok(Self { tokens })
    }

    /// Parses the textual form of a subject.
    ///
    /// Surrounding whitespace is trimmed.
    ///
    /// # Examples
    ///
    /// ```
    /// use psub_logger::subject::Subject;
    ///
    /// let subject = Subject::parse("Stat/Heartbeat").unwrap();
    /// assert_eq!(subject.tokens(), ["Stat", "Heartbeat"]);
    /// assert!(Subject::parse("Stat//Heartbeat").is_err());
    /// assert!(Subject::parse("").is_err());
    /// ```
    pub fn parse(text: &str) -> Result<Self, SubjectError> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Err(SubjectError::Empty);
        }
        Self::new(trimmed.split(SEPARATOR))
    }

    #[must_use]
    pub fn tokens(&self) -> &[String] {
        &self.tokens
    }

    /// Returns true if this pattern matches `subject`.
    ///
    /// Tokens are compared in order. A trailing `*` matches any remaining tokens,
    /// including none, so the single-token pattern `*` matches every subject.
    ///
    /// ```
    /// use psub_logger::subject::Subject;
    ///
    /// let pattern = Subject::parse("A/*").unwrap();
    /// assert!(pattern.matches(&Subject::parse("A/B/C").unwrap()));
    /// assert!(!Subject::parse("A/B").unwrap().matches(&Subject::parse("A").unwrap()));
    /// ```
    #[must_use]
    pub fn matches(&self, subject: &Subject) -> bool {
        let last = self.tokens.len() - 1;
        for (i, token) in self.tokens.iter().enumerate() {
            if i == last && token == WILDCARD {
                return true;
            }
            match subject.tokens.get(i) {
                Some(other) if token == WILDCARD || token == other => {}
                _ => return false,
            }
        }
        self.tokens.len() == subject.tokens.len()
    }
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for token in &self.tokens {
            if !first {
                write!(f, "{SEPARATOR}")?;
            }
            write!(f, "{token}")?;
            first = false;
        }
        Ok(())
    }
}

impl FromStr for Subject {
    type Err = SubjectError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Parses a subject that is known to be valid, such as the control subjects in
/// [`crate::constants`].
pub(crate) fn known(text: &'static str) -> Subject {
    Subject {
        tokens: text.split(SEPARATOR).map(str::to_string).collect(),
    }
}
