// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Message contexts handed to a batching stage.
//!
//! The intake side produces a type-erased [`MessageContext`]. A stage that
//! batches messages of type `M` narrows it to a [`ConsumeContext<M>`], and
//! the downstream stage receives a [`BatchConsumeContext<M>`] that presents
//! the batch as the consumer target while keeping the original context.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::SystemTime;

use crate::batch::Batch;

/// A received message as supplied by the intake adapter
#[derive(Clone)]
pub struct MessageContext {
    message_id: String,
    headers: HashMap<String, String>,
    sent_time: SystemTime,
    payload: Arc<dyn Any + Send + Sync>,
    message_type: &'static str,
}

impl MessageContext {
    pub fn new<T>(message_id: impl Into<String>, payload: T) -> Self
    where
        T: Any + Send + Sync,
    {
        Self {
            message_id: message_id.into(),
            headers: HashMap::new(),
            sent_time: SystemTime::now(),
            payload: Arc::new(payload),
            message_type: short_type_name::<T>(),
        }
    }

    #[must_use]
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_sent_time(mut self, sent_time: SystemTime) -> Self {
        self.sent_time = sent_time;
        self
    }

    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    pub fn headers(&self) -> &HashMap<String, String> {
        &self.headers
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }

    pub fn sent_time(&self) -> SystemTime {
        self.sent_time
    }

    /// Short name of the payload's runtime type
    pub fn message_type(&self) -> &'static str {
        self.message_type
    }

    /// Narrows this context to a typed one when the payload is an `M`
    pub fn downcast<M>(&self) -> Option<ConsumeContext<M>>
    where
        M: Any + Send + Sync,
    {
        let message = Arc::clone(&self.payload).downcast::<M>().ok()?;
        Some(ConsumeContext {
            message,
            context: self.clone(),
        })
    }
}

impl fmt::Debug for MessageContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageContext")
            .field("message_id", &self.message_id)
            .field("message_type", &self.message_type)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

/// A message context whose payload is known to be an `M`
pub struct ConsumeContext<M> {
    message: Arc<M>,
    context: MessageContext,
}

impl<M> ConsumeContext<M> {
    pub fn message(&self) -> &M {
        &self.message
    }

    pub fn context(&self) -> &MessageContext {
        &self.context
    }

    pub fn message_id(&self) -> &str {
        self.context.message_id()
    }
}

impl<M> Clone for ConsumeContext<M> {
    fn clone(&self) -> Self {
        Self {
            message: Arc::clone(&self.message),
            context: self.context.clone(),
        }
    }
}

impl<M> fmt::Debug for ConsumeContext<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsumeContext")
            .field("context", &self.context)
            .finish_non_exhaustive()
    }
}

/// Context sent downstream for one contributing message
///
/// The batch takes the place of the consumer, the original message context
/// stays available for acknowledgement and error handling.
pub struct BatchConsumeContext<M> {
    context: MessageContext,
    batch: Arc<Batch<M>>,
}

impl<M> BatchConsumeContext<M> {
    pub fn new(context: MessageContext, batch: Arc<Batch<M>>) -> Self {
        Self { context, batch }
    }

    pub fn context(&self) -> &MessageContext {
        &self.context
    }

    pub fn batch(&self) -> &Arc<Batch<M>> {
        &self.batch
    }
}

impl<M> fmt::Debug for BatchConsumeContext<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchConsumeContext")
            .field("context", &self.context)
            .field("batch_id", &self.batch.id())
            .finish()
    }
}

/// Type name without its module path, generic arguments keep theirs
pub(crate) fn short_type_name<T: ?Sized>() -> &'static str {
    let name = std::any::type_name::<T>();
    let base = name.split('<').next().unwrap_or(name);
    match base.rfind("::") {
        Some(idx) => &name[idx + 2..],
        None => name,
    }
}
