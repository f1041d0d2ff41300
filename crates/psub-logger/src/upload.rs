// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Ships completed capture files to the remote archive.
//!
//! A run first asks the capture sink to rotate so that every file but the new one is
//! complete, then transfers those files on the blocking pool. Transfers resume where
//! the remote copy stops, and a local file is deleted only once its remote copy is
//! complete and closed.

use std::fs::{self, File};
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, error, info, warn};

use crate::capture::{list_capture_files, CaptureHandle};
use crate::config::{LoggerConfig, UploadConfig};
use crate::constants::{UPLOAD_CHUNK_SIZE, UPLOAD_MAX_STALLS};
use crate::errors::{TaskError, UploadError};
use crate::task::{ActiveTask, Handler, TaskHandle};

/// A remote archive able to open authenticated sessions.
pub trait RemoteStore: Send + Sync + 'static {
    fn open_session(&self) -> Result<Box<dyn RemoteSession>, UploadError>;
}

pub trait RemoteSession {
    /// Opens `path` for writing, creating it if needed. Existing content is kept.
    fn open(&mut self, path: &str) -> Result<Box<dyn RemoteFile + '_>, UploadError>;

    fn shutdown(self: Box<Self>);
}

pub trait RemoteFile {
    fn size(&mut self) -> io::Result<u64>;

    fn seek(&mut self, position: u64) -> io::Result<()>;

    /// Writes part of `buf`. `Ok(0)` and [`io::ErrorKind::WouldBlock`] mean "try again later".
    fn write(&mut self, buf: &[u8]) -> io::Result<usize>;

    fn close(self: Box<Self>) -> io::Result<()>;
}

/// Stands in for the remote archive when no transport is compiled in.
#[derive(Debug, Clone)]
pub struct UnavailableStore {
    reason: String,
}

impl UnavailableStore {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

impl RemoteStore for UnavailableStore {
    fn open_session(&self) -> Result<Box<dyn RemoteSession>, UploadError> {
        Err(UploadError::Unsupported(self.reason.clone()))
    }
}

/// Builds the remote store for an upload configuration.
#[cfg(feature = "sftp")]
pub fn default_store(upload: &UploadConfig) -> Arc<dyn RemoteStore> {
    Arc::new(crate::sftp::SftpStore::new(upload))
}

/// Builds the remote store for an upload configuration.
#[cfg(not(feature = "sftp"))]
pub fn default_store(_upload: &UploadConfig) -> Arc<dyn RemoteStore> {
    Arc::new(UnavailableStore::new(
        "built without the sftp feature",
    ))
}

/// How long to wait on a remote that accepts no data, and how often.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub delay: Duration,
    pub max_stalls: u32,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BatchReport {
    pub uploaded: usize,
    pub failed: usize,
    pub bytes_sent: u64,
}

fn remote_path(remote_dir: &str, prefix: &str, local: &Path) -> Option<String> {
    let name = local.file_name()?.to_str()?;
    let dir = remote_dir.trim_end_matches('/');
    Some(if dir.is_empty() {
        format!("{prefix}{name}")
    } else {
        format!("{dir}/{prefix}{name}")
    })
}

/// Sends the part of `local` the remote copy lacks. Returns the number of bytes sent.
pub fn upload_file(
    session: &mut dyn RemoteSession,
    local: &Path,
    remote_path: &str,
    retry: RetryPolicy,
) -> Result<u64, UploadError> {
    let mut file = File::open(local)?;
    let local_size = file.metadata()?.len();

    let mut remote = session.open(remote_path)?;
    let remote_size = remote.size()?;
    if remote_size > local_size {
        return Err(UploadError::RemoteLarger {
            remote: remote_size,
            local: local_size,
        });
    }
    remote.seek(remote_size)?;
    file.seek(SeekFrom::Start(remote_size))?;

    let mut buf = vec![0u8; UPLOAD_CHUNK_SIZE];
    let mut sent = 0u64;
    loop {
        let read = file.read(&mut buf)?;
        if read == 0 {
            break;
        }
        let mut pending = &buf[..read];
        let mut stalls = 0u32;
        while !pending.is_empty() {
            match remote.write(pending) {
                Ok(0) => {}
                Ok(written) => {
                    pending = &pending[written..];
                    sent += written as u64;
                    stalls = 0;
                    continue;
                }
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                    ) => {}
                Err(e) => return Err(e.into()),
            }
            stalls += 1;
            if stalls > retry.max_stalls {
                return Err(UploadError::Stalled(stalls));
            }
            std::thread::sleep(retry.delay);
        }
    }
    remote.close()?;
    Ok(sent)
}

/// Uploads `files` over one session, deleting each local file once it is complete remotely.
pub fn run_batch(
    store: &dyn RemoteStore,
    remote_dir: &str,
    prefix: &str,
    files: &[PathBuf],
    retry: RetryPolicy,
) -> Result<BatchReport, UploadError> {
    let mut session = store.open_session()?;
    let mut report = BatchReport::default();
    for local in files {
        let Some(target) = remote_path(remote_dir, prefix, local) else {
            warn!("Skipping upload of {}: not a valid file name", local.display());
            report.failed += 1;
            continue;
        };
        match upload_file(session.as_mut(), local, &target, retry) {
            Ok(sent) => {
                report.uploaded += 1;
                report.bytes_sent += sent;
                debug!("Uploaded {} to {} ({} bytes)", local.display(), target, sent);
                if let Err(e) = fs::remove_file(local) {
                    warn!("Uploaded {} but could not delete it: {}", local.display(), e);
                }
            }
            Err(e) => {
                report.failed += 1;
                warn!("Upload of {} failed: {}", local.display(), e);
            }
        }
    }
    session.shutdown();
    Ok(report)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadEvent {
    /// Uploads every completed file, naming remote copies with `prefix`.
    Run { prefix: String },
}

pub struct Uploader {
    config: Arc<LoggerConfig>,
    capture: CaptureHandle,
    store: Arc<dyn RemoteStore>,
    retry: RetryPolicy,
}

impl Uploader {
    pub fn new(
        config: Arc<LoggerConfig>,
        capture: CaptureHandle,
        store: Arc<dyn RemoteStore>,
        retry_delay: Duration,
    ) -> (ActiveTask<Self>, UploaderHandle) {
        let uploader = Self {
            config,
            capture,
            store,
            retry: RetryPolicy {
                delay: retry_delay,
                max_stalls: UPLOAD_MAX_STALLS,
            },
        };
        let (task, handle) = ActiveTask::new(uploader);
        (task, UploaderHandle { task: handle })
    }

    async fn run(&self, prefix: String) {
        let Some(upload) = self.config.upload.as_ref() else {
            debug!("No upload section configured, nothing to do");
            return;
        };
        let current = match self.capture.rotate_and_wait().await {
            Ok(current) => current,
            Err(e) => {
                warn!("Upload abandoned, could not rotate capture file: {}", e);
                return;
            }
        };
        let files: Vec<PathBuf> =
            match list_capture_files(&self.config.log_path, &self.config.file_prefix()) {
                // Names grow strictly with creation time. Anything from the current
                // file on may still be open in the sink.
                Ok(files) => files
                    .into_iter()
                    .filter(|f| f.file_name() < current.file_name())
                    .collect(),
                Err(e) => {
                    warn!("Upload abandoned, could not list capture files: {}", e);
                    return;
                }
            };
        if files.is_empty() {
            debug!("No completed capture files to upload");
            return;
        }

        info!("Uploading {} capture files to {}", files.len(), upload.host);
        let store = Arc::clone(&self.store);
        let remote_dir = upload.path.clone();
        let retry = self.retry;
        let result = tokio::task::spawn_blocking(move || {
            run_batch(store.as_ref(), &remote_dir, &prefix, &files, retry)
        })
        .await;
        match result {
            Ok(Ok(report)) => info!(
                "Upload finished: {} uploaded, {} failed, {} bytes sent",
                report.uploaded, report.failed, report.bytes_sent
            ),
            Ok(Err(e)) => warn!("Upload failed: {}", e),
            Err(e) => error!("Upload worker died: {}", e),
        }
    }
}

#[async_trait]
impl Handler for Uploader {
    type Event = UploadEvent;
    type Error = std::convert::Infallible;

    fn name(&self) -> &'static str {
        "uploader"
    }

    async fn handle(
        &mut self,
        event: UploadEvent,
        _ctx: &TaskHandle<UploadEvent>,
    ) -> Result<(), Self::Error> {
        match event {
            UploadEvent::Run { prefix } => self.run(prefix).await,
        }
        Ok(())
    }
}

#[derive(Clone)]
pub struct UploaderHandle {
    task: TaskHandle<UploadEvent>,
}

impl UploaderHandle {
    pub fn run(&self, prefix: String) -> Result<(), TaskError> {
        self.task.enqueue(UploadEvent::Run { prefix })
    }

    pub async fn shutdown(&self) {
        self.task.stop_and_wait().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{read_capture_lines, CaptureSink};
    use crate::message::Message;
    use crate::subject::known;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use tempfile::TempDir;

    #[derive(Default)]
    struct Remote {
        files: HashMap<String, Vec<u8>>,
        writes: usize,
        sessions_closed: usize,
    }

    /// In-memory remote that accepts at most `max_write` bytes per call and refuses
    /// the first `stalls` writes.
    #[derive(Clone, Default)]
    struct MemoryStore {
        remote: Arc<Mutex<Remote>>,
        max_write: usize,
        stalls: Arc<Mutex<u32>>,
        fail_path: Option<String>,
    }

    struct MemorySession(MemoryStore);

    struct MemoryFile<'a> {
        store: &'a MemoryStore,
        path: String,
        position: usize,
    }

    impl RemoteStore for MemoryStore {
        fn open_session(&self) -> Result<Box<dyn RemoteSession>, UploadError> {
            Ok(Box::new(MemorySession(self.clone())))
        }
    }

    impl RemoteSession for MemorySession {
        fn open(&mut self, path: &str) -> Result<Box<dyn RemoteFile + '_>, UploadError> {
            if self.0.fail_path.as_deref() == Some(path) {
                return Err(UploadError::Session("permission denied".to_string()));
            }
            self.0
                .remote
                .lock()
                .expect("lock")
                .files
                .entry(path.to_string())
                .or_default();
            Ok(Box::new(MemoryFile {
                store: &self.0,
                path: path.to_string(),
                position: 0,
            }))
        }

        fn shutdown(self: Box<Self>) {
            self.0.remote.lock().expect("lock").sessions_closed += 1;
        }
    }

    impl RemoteFile for MemoryFile<'_> {
        fn size(&mut self) -> io::Result<u64> {
            let remote = self.store.remote.lock().expect("lock");
            Ok(remote.files[&self.path].len() as u64)
        }

        fn seek(&mut self, position: u64) -> io::Result<()> {
            self.position = position as usize;
            Ok(())
        }

        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            {
                let mut stalls = self.store.stalls.lock().expect("lock");
                if *stalls > 0 {
                    *stalls -= 1;
                    return Err(io::ErrorKind::WouldBlock.into());
                }
            }
            let mut remote = self.store.remote.lock().expect("lock");
            remote.writes += 1;
            let n = buf.len().min(self.store.max_write.max(1));
            let file = remote.files.get_mut(&self.path).expect("opened");
            file.truncate(self.position);
            file.extend_from_slice(&buf[..n]);
            self.position += n;
            Ok(n)
        }

        fn close(self: Box<Self>) -> io::Result<()> {
            Ok(())
        }
    }

    const RETRY: RetryPolicy = RetryPolicy {
        delay: Duration::from_millis(1),
        max_stalls: 3,
    };

    fn local_file(dir: &TempDir, name: &str, content: &[u8]) -> PathBuf {
        let path = dir.path().join(name);
        fs::write(&path, content).expect("write local file");
        path
    }

    fn store(max_write: usize) -> MemoryStore {
        MemoryStore {
            max_write,
            ..MemoryStore::default()
        }
    }

    #[test]
    fn test_resume_sends_only_missing_bytes() {
        let dir = TempDir::new().expect("tempdir");
        let content: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        let local = local_file(&dir, "cap_1.rec.zst", &content);
        let store = store(usize::MAX);
        store
            .remote
            .lock()
            .expect("lock")
            .files
            .insert("/in/site_cap_1.rec.zst".to_string(), content[..70_000].to_vec());

        let report = run_batch(&store, "/in/", "site_", &[local.clone()], RETRY).expect("batch");

        assert_eq!(report.bytes_sent, 130_000);
        assert_eq!(report.uploaded, 1);
        assert!(!local.exists());
        let remote = store.remote.lock().expect("lock");
        assert_eq!(remote.files["/in/site_cap_1.rec.zst"], content);
        assert_eq!(remote.sessions_closed, 1);
    }

    #[test]
    fn test_partial_writes_are_continued() {
        let dir = TempDir::new().expect("tempdir");
        let local = local_file(&dir, "cap_1.rec.zst", &[7u8; 1000]);
        let store = store(64);
        *store.stalls.lock().expect("lock") = 2;

        let mut session = store.open_session().expect("session");
        let sent = upload_file(session.as_mut(), &local, "cap_1.rec.zst", RETRY).expect("upload");
        assert_eq!(sent, 1000);
        assert_eq!(store.remote.lock().expect("lock").writes, 16);
    }

    #[test]
    fn test_remote_larger_fails_and_keeps_local() {
        let dir = TempDir::new().expect("tempdir");
        let local = local_file(&dir, "cap_1.rec.zst", b"short");
        let store = store(usize::MAX);
        store
            .remote
            .lock()
            .expect("lock")
            .files
            .insert("cap_1.rec.zst".to_string(), b"much longer".to_vec());

        let report = run_batch(&store, "", "", &[local.clone()], RETRY).expect("batch");
        assert_eq!(report.failed, 1);
        assert!(local.exists());
    }

    #[test]
    fn test_stalled_remote_fails_file() {
        let dir = TempDir::new().expect("tempdir");
        let local = local_file(&dir, "cap_1.rec.zst", b"data");
        let store = store(usize::MAX);
        *store.stalls.lock().expect("lock") = 100;

        let mut session = store.open_session().expect("session");
        let result = upload_file(session.as_mut(), &local, "cap_1.rec.zst", RETRY);
        assert!(matches!(result, Err(UploadError::Stalled(4))));
        assert!(local.exists());
    }

    #[test]
    fn test_failed_file_does_not_stop_batch() {
        let dir = TempDir::new().expect("tempdir");
        let first = local_file(&dir, "cap_1.rec.zst", b"one");
        let second = local_file(&dir, "cap_2.rec.zst", b"two");
        let store = MemoryStore {
            fail_path: Some("out/cap_1.rec.zst".to_string()),
            ..store(usize::MAX)
        };

        let report =
            run_batch(&store, "out", "", &[first.clone(), second.clone()], RETRY).expect("batch");
        assert_eq!(report.uploaded, 1);
        assert_eq!(report.failed, 1);
        assert!(first.exists());
        assert!(!second.exists());
        assert_eq!(store.remote.lock().expect("lock").sessions_closed, 1);
    }

    #[test]
    fn test_unavailable_store() {
        let store = UnavailableStore::new("no transport");
        let result = run_batch(&store, "", "", &[], RETRY);
        assert!(matches!(result, Err(UploadError::Unsupported(_))));
    }

    #[test]
    fn test_remote_path() {
        let local = Path::new("/var/log/cap_1.rec.zst");
        assert_eq!(
            remote_path("/in/", "site_", local).as_deref(),
            Some("/in/site_cap_1.rec.zst")
        );
        assert_eq!(
            remote_path("", "", local).as_deref(),
            Some("cap_1.rec.zst")
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_runs_skip_files_opened_after_the_handshake() {
        const WRITES: usize = 600;
        let dir = TempDir::new().expect("tempdir");
        let config = Arc::new(LoggerConfig {
            log_path: dir.path().to_path_buf(),
            file_name_root: "cap".to_string(),
            max_file_count: 100_000,
            max_file_event_count: Some(1),
            flush_sec: None,
            flush: None,
            new_file: None,
            upload: Some(UploadConfig {
                host: "archive".to_string(),
                path: "/in".to_string(),
                ..UploadConfig::default()
            }),
        });
        let (sink_task, sink) = CaptureSink::new(Arc::clone(&config));
        sink_task.start();
        let store = store(usize::MAX);
        let (uploader_task, uploader) = Uploader::new(
            Arc::clone(&config),
            sink.clone(),
            Arc::new(store.clone()),
            Duration::from_millis(1),
        );
        uploader_task.start();

        // Every record rotates the file, so the sink keeps opening new files while
        // the uploader lists and ships the completed ones.
        let writer = {
            let sink = sink.clone();
            tokio::spawn(async move {
                for i in 0..WRITES {
                    sink.write(Message::new(known("Data/Sensor"), i.to_string()))
                        .expect("write");
                    if i % 25 == 0 {
                        tokio::task::yield_now().await;
                    }
                }
            })
        };
        for _ in 0..10 {
            uploader.run("site_".to_string()).expect("run");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        writer.await.expect("writer");
        // FIFO: once this answers, every write has reached a file.
        sink.rotate_and_wait().await.expect("drain");
        uploader.shutdown().await;
        sink.shutdown().await;

        let mut records = 0;
        let remote = store.remote.lock().expect("lock");
        assert!(!remote.files.is_empty());
        for (name, bytes) in &remote.files {
            let text = zstd::decode_all(bytes.as_slice()).expect("complete zstd stream");
            let text = String::from_utf8(text).expect("utf-8");
            let lines: Vec<&str> = text.lines().collect();
            assert!(lines[0].starts_with("START "), "{name} has no START marker");
            assert!(lines.len() <= 2, "{name} holds {} records", lines.len() - 1);
            records += lines.len() - 1;
        }
        for local in list_capture_files(dir.path(), "cap_").expect("list") {
            records += read_capture_lines(&local).expect("read").len() - 1;
        }
        assert_eq!(records, WRITES);
    }
}
