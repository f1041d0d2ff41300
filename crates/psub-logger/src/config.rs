// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Configuration: process settings fixed at startup, plus the logger and shared
//! configuration documents delivered over the bus as XML.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::constants::{
    CONFIG_RETRY_INTERVAL, DEFAULT_BUS_HOST, DEFAULT_BUS_PORT, HEARTBEAT_INTERVAL,
    RECONNECT_DELAY, UPLOAD_RETRY_DELAY,
};
use crate::errors::ConfigError;

/// Delays used by the bus components.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timings {
    pub reconnect_delay: Duration,
    pub heartbeat_interval: Duration,
    pub config_retry_interval: Duration,
    pub upload_retry_delay: Duration,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            reconnect_delay: RECONNECT_DELAY,
            heartbeat_interval: HEARTBEAT_INTERVAL,
            config_retry_interval: CONFIG_RETRY_INTERVAL,
            upload_retry_delay: UPLOAD_RETRY_DELAY,
        }
    }
}

/// Read-only process settings, built once at startup and shared by every component.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Bus host name or address
    pub bus_host: String,
    /// Bus TCP port
    pub bus_port: u16,
    /// Version carried by the Alive announcement and configuration requests
    pub version: String,
    pub timings: Timings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            bus_host: DEFAULT_BUS_HOST.to_string(),
            bus_port: DEFAULT_BUS_PORT,
            version: env!("CARGO_PKG_VERSION").to_string(),
            timings: Timings::default(),
        }
    }
}

impl Settings {
    #[must_use]
    pub fn bus_address(&self) -> String {
        format!("{}:{}", self.bus_host, self.bus_port)
    }
}

/// One `Event` element: a subject pattern with optional payload filters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct EventConfig {
    #[serde(rename = "$text", default)]
    pub subject: String,
    #[serde(rename = "@xpath", default)]
    pub xpath: Option<String>,
    #[serde(rename = "@regex", default)]
    pub regex: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct EventList {
    #[serde(rename = "Event", default)]
    pub events: Vec<EventConfig>,
}

#[derive(Clone, Default, PartialEq, Eq, Deserialize)]
pub struct UploadConfig {
    #[serde(rename = "Host")]
    pub host: String,
    #[serde(rename = "username", default)]
    pub username: String,
    #[serde(rename = "password", default)]
    pub password: String,
    #[serde(rename = "path", default)]
    pub path: String,
    #[serde(rename = "Event", default)]
    pub events: Vec<EventConfig>,
}

impl fmt::Debug for UploadConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UploadConfig")
            .field("host", &self.host)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("path", &self.path)
            .field("events", &self.events)
            .finish()
    }
}

/// The logger's own configuration document, root element `Logger`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LoggerConfig {
    #[serde(rename = "LogPath")]
    pub log_path: PathBuf,
    #[serde(rename = "FileNameRoot")]
    pub file_name_root: String,
    #[serde(rename = "MaxFileCount")]
    pub max_file_count: u32,
    #[serde(rename = "MaxFileEventCount", default)]
    pub max_file_event_count: Option<u32>,
    #[serde(rename = "FlushSec", default)]
    pub flush_sec: Option<u64>,
    #[serde(rename = "Flush", default)]
    pub flush: Option<EventList>,
    #[serde(rename = "NewFile", default)]
    pub new_file: Option<EventList>,
    #[serde(rename = "FtpUpload", default)]
    pub upload: Option<UploadConfig>,
}

impl LoggerConfig {
    pub fn from_xml(xml: &str) -> Result<Self, ConfigError> {
        let config: Self = quick_xml::de::from_str(xml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.log_path.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("LogPath cannot be empty".to_string()));
        }
        let root = self.file_name_root.trim();
        if root.is_empty() || root.contains(['/', '\\']) {
            return Err(ConfigError::Invalid(format!(
                "FileNameRoot '{}' must be a non-empty file name",
                self.file_name_root
            )));
        }
        if self.max_file_count == 0 {
            return Err(ConfigError::Invalid(
                "MaxFileCount must be at least 1".to_string(),
            ));
        }
        if self.max_file_event_count == Some(0) {
            return Err(ConfigError::Invalid(
                "MaxFileEventCount must be at least 1".to_string(),
            ));
        }
        if let Some(upload) = &self.upload {
            if upload.host.trim().is_empty() {
                return Err(ConfigError::Invalid(
                    "FtpUpload Host cannot be empty".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Periodic flush interval, if one is configured.
    #[must_use]
    pub fn flush_interval(&self) -> Option<Duration> {
        self.flush_sec
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }

    pub fn flush_events(&self) -> &[EventConfig] {
        self.flush.as_ref().map_or(&[], |f| &f.events)
    }

    pub fn new_file_events(&self) -> &[EventConfig] {
        self.new_file.as_ref().map_or(&[], |f| &f.events)
    }

    pub fn upload_events(&self) -> &[EventConfig] {
        self.upload.as_ref().map_or(&[], |u| &u.events)
    }

    /// Prefix shared by every capture file name.
    #[must_use]
    pub fn file_prefix(&self) -> String {
        format!("{}_", self.file_name_root.trim())
    }
}

/// Site-wide configuration shared by every bus participant, root element `Shared`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct SharedConfig {
    #[serde(rename = "uuid", default)]
    pub uuid: Option<String>,
    #[serde(rename = "TerminalID", default)]
    pub terminal_id: Option<String>,
}

impl SharedConfig {
    pub fn from_xml(xml: &str) -> Result<Self, ConfigError> {
        Ok(quick_xml::de::from_str(xml)?)
    }

    /// Prefix identifying this site in remote file names.
    #[must_use]
    pub fn remote_prefix(&self) -> String {
        let non_empty = |v: &Option<String>| v.as_deref().map(str::trim).filter(|v| !v.is_empty()).map(str::to_string);
        non_empty(&self.uuid)
            .or_else(|| non_empty(&self.terminal_id))
            .map(|id| format!("{id}_"))
            .unwrap_or_default()
    }
}
