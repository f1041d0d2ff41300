// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

/// Errors raised by the task scheduler
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TaskError {
    #[error("task {0} is stopped")]
    Stopped(&'static str),
}

/// Errors raised while building a subject
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SubjectError {
    #[error("subject has no tokens")]
    Empty,
    #[error("subject '{0}' contains an empty token")]
    EmptyToken(String),
}

/// Errors raised while decoding bus frames
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("frame of {0} bytes exceeds the maximum frame size")]
    FrameTooLarge(usize),
    #[error("frame body truncated while reading {0}")]
    Truncated(&'static str),
    #[error("{0} trailing bytes after frame body")]
    TrailingBytes(usize),
    #[error("subject token is not valid UTF-8")]
    InvalidUtf8,
    #[error("invalid subject: {0}")]
    Subject(#[from] SubjectError),
    #[error("{0} does not fit in its length field")]
    Oversized(&'static str),
}

/// Errors raised while loading the bus-delivered configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("configuration is not valid XML: {0}")]
    Parse(#[from] quick_xml::DeError),
    #[error("invalid configuration: {0}")]
    Invalid(String),
    #[error("invalid regex for event '{subject}': {source}")]
    Regex {
        subject: String,
        #[source]
        source: regex::Error,
    },
    #[error("invalid event subject: {0}")]
    Subject(#[from] SubjectError),
}

/// Errors raised by the capture sink
#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("capture file I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("capture sink is unavailable: {0}")]
    Unavailable(String),
}

/// Errors raised while uploading capture files
#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("upload I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("remote session failed: {0}")]
    Session(String),
    #[error("remote file is already larger than local ({remote} > {local} bytes)")]
    RemoteLarger { remote: u64, local: u64 },
    #[error("remote stopped accepting data after {0} attempts")]
    Stalled(u32),
    #[error("no remote transport available: {0}")]
    Unsupported(String),
}
