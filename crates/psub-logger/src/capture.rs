// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Rotating, zstd-compressed record log of every message seen on the bus.

use std::fmt::Write as _;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use crate::config::LoggerConfig;
use crate::connection::{BusSink, ConnectionState};
use crate::constants::{CAPTURE_FILE_EXTENSION, CAPTURE_STAMP_FORMAT, ZSTD_LEVEL};
use crate::errors::{CaptureError, TaskError};
use crate::message::Message;
use crate::task::{ActiveTask, Handler, ScheduledEvent, TaskHandle};

type Encoder = zstd::stream::write::Encoder<'static, BufWriter<File>>;

#[derive(Debug)]
pub enum CaptureEvent {
    Write(Message),
    Rotate,
    /// Rotates and reports the new file, or why it could not be opened.
    RotateAndReport(oneshot::Sender<Result<PathBuf, CaptureError>>),
    Flush,
}

struct LiveFile {
    path: PathBuf,
    encoder: Encoder,
    event_count: u32,
    created: Instant,
    last_record: Instant,
}

/// Lists the capture files in `dir` whose names start with `prefix`, oldest first.
pub fn list_capture_files(dir: &Path, prefix: &str) -> io::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let is_capture = entry
            .file_name()
            .to_str()
            .is_some_and(|name| name.starts_with(prefix));
        if is_capture && entry.file_type()?.is_file() {
            files.push(entry.path());
        }
    }
    files.sort_by(|a, b| a.file_name().cmp(&b.file_name()));
    Ok(files)
}

/// Reads the record lines of a capture file.
///
/// Decoding stops at the unfinished tail of a file that is still being written, so
/// the live file can be inspected as far as it has been flushed.
pub fn read_capture_lines(path: &Path) -> io::Result<Vec<String>> {
    let mut decoder = zstd::stream::read::Decoder::new(File::open(path)?)?;
    let mut out = Vec::new();
    let mut buf = [0u8; 8192];
    loop {
        match decoder.read(&mut buf) {
            Ok(0) | Err(_) => break,
            Ok(n) => out.extend_from_slice(&buf[..n]),
        }
    }
    Ok(String::from_utf8_lossy(&out)
        .lines()
        .map(str::to_string)
        .collect())
}

fn format_stamp(stamp: &DateTime<Utc>) -> String {
    format!(
        "{}.{:03}",
        stamp.format(CAPTURE_STAMP_FORMAT),
        stamp.timestamp_subsec_millis()
    )
}

/// Formats one record line, terminated by a newline.
fn format_record(delta_ms: u128, message: &Message) -> String {
    let mut line = format!("{} {} {}", delta_ms, message.ttl, message.age);
    for postmark in &message.postmarks {
        let _ = write!(line, " {postmark}");
    }
    let _ = writeln!(
        line,
        " {} {}",
        message.subject,
        STANDARD.encode(&message.payload)
    );
    line
}

pub struct CaptureSink {
    config: Arc<LoggerConfig>,
    live: Option<LiveFile>,
    last_stamp: Option<DateTime<Utc>>,
    flush_timer: Option<ScheduledEvent>,
}

impl CaptureSink {
    pub fn new(config: Arc<LoggerConfig>) -> (ActiveTask<Self>, CaptureHandle) {
        let sink = Self {
            config,
            live: None,
            last_stamp: None,
            flush_timer: None,
        };
        let (task, handle) = ActiveTask::new(sink);
        (task, CaptureHandle { task: handle })
    }

    /// Picks a file name strictly later than the previous one and not yet taken.
    fn next_file_name(&mut self) -> (DateTime<Utc>, PathBuf) {
        let now = Utc::now();
        let mut stamp = DateTime::<Utc>::from_timestamp_millis(now.timestamp_millis()).unwrap_or(now);
        if let Some(last) = self.last_stamp {
            if stamp <= last {
                stamp = last + ChronoDuration::milliseconds(1);
            }
        }
        let prefix = self.config.file_prefix();
        loop {
            let path = self.config.log_path.join(format!(
                "{prefix}{}.{CAPTURE_FILE_EXTENSION}",
                format_stamp(&stamp)
            ));
            if !path.exists() {
                self.last_stamp = Some(stamp);
                return (stamp, path);
            }
            stamp += ChronoDuration::milliseconds(1);
        }
    }

    /// Deletes the oldest files so that one more still fits under `MaxFileCount`.
    fn enforce_retention(&self) -> io::Result<()> {
        let files = list_capture_files(&self.config.log_path, &self.config.file_prefix())?;
        let keep = self.config.max_file_count.saturating_sub(1) as usize;
        let excess = files.len().saturating_sub(keep);
        for old in &files[..excess] {
            match fs::remove_file(old) {
                Ok(()) => info!("Removed old capture file {}", old.display()),
                Err(e) => warn!("Could not remove old capture file {}: {}", old.display(), e),
            }
        }
        Ok(())
    }

    fn close_live(&mut self) {
        let Some(live) = self.live.take() else {
            return;
        };
        let result = live.encoder.finish().and_then(|mut writer| writer.flush());
        match result {
            Ok(()) => debug!(
                "Closed capture file {} after {} records in {:?}",
                live.path.display(),
                live.event_count,
                live.created.elapsed()
            ),
            Err(e) => error!("Could not finish capture file {}: {}", live.path.display(), e),
        }
    }

    fn rotate(&mut self, ctx: &TaskHandle<CaptureEvent>) -> Result<PathBuf, CaptureError> {
        self.close_live();
        fs::create_dir_all(&self.config.log_path)?;
        self.enforce_retention()?;

        let (stamp, path) = self.next_file_name();
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)?;
        let mut encoder = Encoder::new(BufWriter::new(file), ZSTD_LEVEL)?;
        writeln!(encoder, "START {}", format_stamp(&stamp))?;
        encoder.flush()?;

        let now = Instant::now();
        self.live = Some(LiveFile {
            path: path.clone(),
            encoder,
            event_count: 0,
            created: now,
            last_record: now,
        });

        let next_flush = self
            .config
            .flush_interval()
            .map(|period| ctx.enqueue_repeating_with(|| CaptureEvent::Flush, period));
        if let Some(previous) = std::mem::replace(&mut self.flush_timer, next_flush) {
            previous.cancel();
        }

        info!("Created new capture file {}", path.display());
        Ok(path)
    }

    fn write(&mut self, message: &Message, ctx: &TaskHandle<CaptureEvent>) -> Result<(), CaptureError> {
        if self.live.is_none() {
            self.rotate(ctx)?;
        }
        let Some(live) = self.live.as_mut() else {
            return Err(CaptureError::Unavailable("no capture file open".to_string()));
        };
        let now = Instant::now();
        let delta = now.duration_since(live.last_record).as_millis();
        live.encoder
            .write_all(format_record(delta, message).as_bytes())?;
        live.last_record = now;
        live.event_count += 1;

        let full = self
            .config
            .max_file_event_count
            .is_some_and(|cap| live.event_count >= cap);
        if full {
            self.rotate(ctx)?;
        }
        Ok(())
    }

    fn flush(&mut self) -> io::Result<()> {
        if let Some(live) = self.live.as_mut() {
            live.encoder.flush()?;
            debug!("Flushed capture file {}", live.path.display());
        }
        Ok(())
    }
}

#[async_trait]
impl Handler for CaptureSink {
    type Event = CaptureEvent;
    type Error = std::convert::Infallible;

    fn name(&self) -> &'static str {
        "capture-sink"
    }

    async fn handle(
        &mut self,
        event: CaptureEvent,
        ctx: &TaskHandle<CaptureEvent>,
    ) -> Result<(), Self::Error> {
        match event {
            CaptureEvent::Write(message) => {
                if let Err(e) = self.write(&message, ctx) {
                    warn!("Could not record message on {}: {}", message.subject, e);
                }
            }
            CaptureEvent::Rotate => {
                if let Err(e) = self.rotate(ctx) {
                    warn!("Could not rotate capture file: {}", e);
                }
            }
            CaptureEvent::RotateAndReport(reply) => {
                let result = self.rotate(ctx);
                if let Err(e) = &result {
                    warn!("Could not rotate capture file: {}", e);
                }
                let _ = reply.send(result);
            }
            CaptureEvent::Flush => {
                if let Err(e) = self.flush() {
                    warn!("Could not flush capture file: {}", e);
                }
            }
        }
        Ok(())
    }

    async fn stopped(&mut self) {
        if let Some(timer) = self.flush_timer.take() {
            timer.cancel();
        }
        self.close_live();
    }
}

/// Cloneable access to a running [`CaptureSink`].
#[derive(Clone)]
pub struct CaptureHandle {
    task: TaskHandle<CaptureEvent>,
}

impl CaptureHandle {
    pub fn write(&self, message: Message) -> Result<(), TaskError> {
        self.task.enqueue(CaptureEvent::Write(message))
    }

    pub fn rotate(&self) -> Result<(), TaskError> {
        self.task.enqueue(CaptureEvent::Rotate)
    }

    pub fn flush(&self) -> Result<(), TaskError> {
        self.task.enqueue(CaptureEvent::Flush)
    }

    /// Rotates and waits for the sink to answer with the new current file.
    pub async fn rotate_and_wait(&self) -> Result<PathBuf, CaptureError> {
        let (reply, response) = oneshot::channel();
        self.task
            .enqueue(CaptureEvent::RotateAndReport(reply))
            .map_err(|e| CaptureError::Unavailable(e.to_string()))?;
        response
            .await
            .map_err(|_| CaptureError::Unavailable("capture sink dropped the request".to_string()))?
    }

    /// Stops the sink, finishing the current file.
    pub async fn shutdown(&self) {
        self.task.stop_and_wait().await;
    }
}

impl BusSink for CaptureHandle {
    fn deliver(&self, message: Message) {
        if let Err(e) = self.write(message) {
            debug!("Dropping captured message: {}", e);
        }
    }

    fn connection_changed(&self, state: ConnectionState) {
        if state == ConnectionState::Connected {
            if let Err(e) = self.rotate() {
                debug!("Cannot rotate on reconnect: {}", e);
            }
        }
    }
}
