// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::subject::Subject;

/// A message carried by the bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub subject: Subject,
    pub payload: Vec<u8>,
    /// Validity in milliseconds. Negative means valid until superseded.
    pub ttl: i64,
    /// Milliseconds since the message was first published.
    pub age: u64,
    /// Hop markers appended by each relay the message traversed.
    pub postmarks: Vec<u32>,
}

impl Message {
    #[must_use]
    pub fn new(subject: Subject, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            subject,
            payload: payload.into(),
            ttl: 0,
            age: 0,
            postmarks: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_ttl(mut self, ttl: i64) -> Self {
        self.ttl = ttl;
        self
    }

    /// Payload as text, replacing invalid UTF-8 sequences.
    #[must_use]
    pub fn payload_lossy(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_defaults() {
        let subject = Subject::parse("Here/Logger").expect("valid subject");
        let message = Message::new(subject.clone(), "1.0").with_ttl(-5);
        assert_eq!(message.subject, subject);
        assert_eq!(message.payload, b"1.0");
        assert_eq!(message.ttl, -5);
        assert_eq!(message.age, 0);
        assert!(message.postmarks.is_empty());
        assert_eq!(message.payload_lossy(), "1.0");
    }
}
