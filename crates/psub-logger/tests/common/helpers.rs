// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Helpers shared by the integration tests

use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use psub_logger::config::{Settings, Timings};
use psub_logger::errors::UploadError;
use psub_logger::upload::{RemoteFile, RemoteSession, RemoteStore};
use tokio::time::{sleep, Instant};

/// Settings pointing at a local bus, with every delay shortened
pub fn fast_settings(port: u16) -> Arc<Settings> {
    Arc::new(Settings {
        bus_host: "127.0.0.1".to_string(),
        bus_port: port,
        timings: Timings {
            reconnect_delay: Duration::from_millis(100),
            heartbeat_interval: Duration::from_millis(100),
            config_retry_interval: Duration::from_millis(300),
            upload_retry_delay: Duration::from_millis(10),
        },
        ..Settings::default()
    })
}

/// Poll `check` until it holds or `timeout` elapses
pub async fn eventually<F: FnMut() -> bool>(timeout: Duration, mut check: F) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if check() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        sleep(Duration::from_millis(20)).await;
    }
}

/// Remote archive kept in memory
#[derive(Clone, Default)]
pub struct MemoryStore {
    pub files: Arc<Mutex<HashMap<String, Vec<u8>>>>,
}

impl RemoteStore for MemoryStore {
    fn open_session(&self) -> Result<Box<dyn RemoteSession>, UploadError> {
        Ok(Box::new(self.clone()))
    }
}

impl RemoteSession for MemoryStore {
    fn open(&mut self, path: &str) -> Result<Box<dyn RemoteFile + '_>, UploadError> {
        self.files
            .lock()
            .unwrap()
            .entry(path.to_string())
            .or_default();
        Ok(Box::new(MemoryFile {
            files: self.files.clone(),
            path: path.to_string(),
        }))
    }

    fn shutdown(self: Box<Self>) {}
}

struct MemoryFile {
    files: Arc<Mutex<HashMap<String, Vec<u8>>>>,
    path: String,
}

impl RemoteFile for MemoryFile {
    fn size(&mut self) -> io::Result<u64> {
        Ok(self.files.lock().unwrap()[&self.path].len() as u64)
    }

    fn seek(&mut self, _position: u64) -> io::Result<()> {
        Ok(())
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut files = self.files.lock().unwrap();
        files.get_mut(&self.path).unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn close(self: Box<Self>) -> io::Result<()> {
        Ok(())
    }
}
