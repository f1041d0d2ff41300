// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod capture;
pub mod codec;
pub mod config;
pub mod connection;
pub mod constants;
pub mod dispatcher;
pub mod errors;
pub mod message;
#[cfg(feature = "sftp")]
pub mod sftp;
pub mod subject;
pub mod task;
pub mod trigger;
pub mod upload;
pub mod util;
