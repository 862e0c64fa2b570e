// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::config::ConfigError;
use crate::source::StreamError;

#[derive(Debug, thiserror::Error)]
pub enum NozzleError {
    #[error("firehose stream failed: {0}")]
    Stream(#[from] StreamError),

    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
}
