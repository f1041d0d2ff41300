// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Common test utilities for the integration tests

#![allow(dead_code)]

pub mod fake_bus;
pub mod helpers;
