// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod batch;
pub mod cache;
pub mod config;
pub mod counters;
pub mod dispatch;
pub mod envelope;
pub mod error;
pub mod event;
pub mod nozzle;
pub mod sink;
pub mod source;
pub mod stats;
pub mod transform;
