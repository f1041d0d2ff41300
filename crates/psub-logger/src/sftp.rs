// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! SFTP transport for the uploader, over libssh2.

use std::io::{self, Seek, SeekFrom, Write};
use std::net::TcpStream;
use std::path::Path;

use ssh2::{OpenFlags, OpenType, Session, Sftp};
use tracing::debug;

use crate::config::UploadConfig;
use crate::constants::SFTP_PORT;
use crate::errors::UploadError;
use crate::upload::{RemoteFile, RemoteSession, RemoteStore};

const REMOTE_FILE_MODE: i32 = 0o644;

fn session_error(context: &str, e: ssh2::Error) -> UploadError {
    UploadError::Session(format!("{context}: {e}"))
}

/// Password-authenticated SFTP access to `<Host>:22`.
pub struct SftpStore {
    host: String,
    username: String,
    password: String,
}

impl SftpStore {
    pub fn new(upload: &UploadConfig) -> Self {
        Self {
            host: upload.host.trim().to_string(),
            username: upload.username.clone(),
            password: upload.password.clone(),
        }
    }
}

impl RemoteStore for SftpStore {
    fn open_session(&self) -> Result<Box<dyn RemoteSession>, UploadError> {
        let tcp = TcpStream::connect((self.host.as_str(), SFTP_PORT))?;
        let mut session = Session::new().map_err(|e| session_error("ssh init", e))?;
        session.set_tcp_stream(tcp);
        session
            .handshake()
            .map_err(|e| session_error("ssh handshake", e))?;
        session
            .userauth_password(&self.username, &self.password)
            .map_err(|e| session_error("authentication", e))?;
        let sftp = session.sftp().map_err(|e| session_error("sftp subsystem", e))?;
        debug!("Opened SFTP session to {}", self.host);
        Ok(Box::new(SftpSession { session, sftp }))
    }
}

struct SftpSession {
    session: Session,
    sftp: Sftp,
}

impl RemoteSession for SftpSession {
    fn open(&mut self, path: &str) -> Result<Box<dyn RemoteFile + '_>, UploadError> {
        let file = self
            .sftp
            .open_mode(
                Path::new(path),
                OpenFlags::WRITE | OpenFlags::CREATE,
                REMOTE_FILE_MODE,
                OpenType::File,
            )
            .map_err(|e| session_error(path, e))?;
        Ok(Box::new(SftpFile { file }))
    }

    fn shutdown(self: Box<Self>) {
        let SftpSession { session, sftp } = *self;
        drop(sftp);
        if let Err(e) = session.disconnect(None, "upload finished", None) {
            debug!("SFTP disconnect failed: {}", e);
        }
    }
}

struct SftpFile {
    file: ssh2::File,
}

impl RemoteFile for SftpFile {
    fn size(&mut self) -> io::Result<u64> {
        let stat = self.file.stat().map_err(io::Error::from)?;
        Ok(stat.size.unwrap_or(0))
    }

    fn seek(&mut self, position: u64) -> io::Result<()> {
        self.file.seek(SeekFrom::Start(position)).map(|_| ())
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file.write(buf)
    }

    fn close(mut self: Box<Self>) -> io::Result<()> {
        self.file.flush()?;
        self.file.close().map_err(io::Error::from)
    }
}
