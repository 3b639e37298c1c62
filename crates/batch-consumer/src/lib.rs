// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! # Batch Consumer
//!
//! Turns individually received messages into bounded batches that are
//! handed to a single consumer invocation.
//!
//! ## Overview
//!
//! ```text
//! message ──> BatchConsumerFactory::send ──> BatchCollector::collect ──> Batch
//!                     │                                                   │
//!                     └──> next stage (BatchConsumeContext) <─────────────┘
//!                               │ waits for the batch to close
//!                               └──> Consumer::consume (once per batch)
//! ```
//!
//! A batch closes when it holds `message_limit` messages, when
//! `time_limit` has elapsed since it was opened, or when its collector is
//! disposed. Every message that contributed to a batch sends its own
//! context downstream; exactly one of those calls runs the consumer and the
//! others observe its outcome.
//!
//! - [`batch`]: the accumulation buffer and its completion signal
//! - [`collector`]: membership and closure of the current batch
//! - [`factory`]: the per-message entry point of a stage
//! - [`consumer`]: the downstream stage that consumes a closed batch
//! - [`probe`]: structured diagnostics

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod batch;
pub mod collector;
pub mod config;
pub mod consumer;
pub mod context;
pub mod error;
pub mod factory;
pub mod pipe;
pub mod probe;

pub use batch::{Batch, CloseReason};
pub use collector::{BatchCollector, CollectorSnapshot, DefaultBatchCollector};
pub use config::{BatchOptions, ShutdownPolicy};
pub use consumer::{BatchConsumerPipe, Consumer, ConsumerFactory};
pub use context::{BatchConsumeContext, ConsumeContext, MessageContext};
pub use error::{Error, Result};
pub use factory::BatchConsumerFactory;
pub use pipe::Pipe;
pub use probe::{Probe, ProbeScope};
