// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

/// Name this process announces itself as on the bus.
pub const APP_NAME: &str = "Logger";

/// Bus port used when the configured address carries none.
pub const DEFAULT_BUS_PORT: u16 = 3101;
pub const DEFAULT_BUS_HOST: &str = "127.0.0.1";

pub const RECONNECT_DELAY: Duration = Duration::from_secs(1);
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(2);
pub const CONFIG_RETRY_INTERVAL: Duration = Duration::from_secs(3);
pub const UPLOAD_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Up to 12 hours or until superseded by the next announcement.
pub const TTL_LONGTIME_MS: i64 = -12 * 60 * 60 * 1000;
pub const TTL_STATUS_MS: i64 = 60 * 1000;

pub const READ_BUFFER_SIZE: usize = 8192;
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

pub const UPLOAD_CHUNK_SIZE: usize = 0xFFFF;
/// Consecutive zero-byte or would-block writes tolerated before a file is abandoned.
pub const UPLOAD_MAX_STALLS: u32 = 120;
pub const SFTP_PORT: u16 = 22;

pub const CAPTURE_FILE_EXTENSION: &str = "rec.zst";
pub const CAPTURE_STAMP_FORMAT: &str = "%Y%m%d%H%M%S";
pub const ZSTD_LEVEL: i32 = 3;

pub const DUMP_TARGET: &str = "psub_logger::dump";

// Subjects, written in their textual form.
pub const PUB_ALIVE: &str = "Alive/Logger";
pub const PUB_HERE: &str = "Here/Logger";
pub const PUB_DEAD: &str = "Dead/Logger";
pub const SUB_CFG: &str = "CFG/Logger";
pub const SUB_SHARED_CFG: &str = "CFG/Shared";
pub const PUB_CFG_REQUEST: &str = "CFG/Request/Logger";
pub const PUB_SHARED_CFG_REQUEST: &str = "CFG/Request/Shared";
pub const SUB_NEW_FILE: &str = "Logger/Newfile";
pub const SUB_FLUSH_FILE: &str = "Logger/Flush";
pub const PUB_CONFIG_ERROR: &str = "Error/Logger/Config";
pub const PUB_SHARED_CONFIG_ERROR: &str = "Error/Logger/Config/Shared";
