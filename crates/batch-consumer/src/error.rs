// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;

/// Errors raised while collecting, dispatching or disposing batches
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    #[error("Expected batch message type: {expected} (received {actual})")]
    TypeMismatch {
        expected: &'static str,
        actual: &'static str,
    },

    #[error("Batch consumer failed: {0}")]
    Downstream(Arc<anyhow::Error>),

    #[error("Failed to dispose batch collector: {0}")]
    CollectorDisposal(String),

    #[error("Batch collector has been disposed")]
    CollectorDisposed,

    #[error("Invalid batch state: {0}")]
    InvalidState(&'static str),

    #[error("Batch was discarded at shutdown")]
    BatchDiscarded,

    #[error("Batch consumption stopped without an outcome")]
    ConsumptionAborted,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Failed to create consumer: {0}")]
    ConsumerFactory(String),
}

impl Error {
    pub(crate) fn downstream(error: anyhow::Error) -> Self {
        Self::Downstream(Arc::new(error))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
