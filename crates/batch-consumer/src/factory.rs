// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Per-message entry point of a batching stage.
//!
//! [`BatchConsumerFactory::send`] takes one received message, adds it to
//! the current batch and forwards a [`BatchConsumeContext`] to the next
//! stage. When the next stage returns, the message is completed on the
//! collector if its batch is closed, whether or not the next stage failed.

use std::marker::PhantomData;
use std::sync::Arc;

use tracing::{debug_span, warn, Instrument};

use crate::batch::Batch;
use crate::collector::{BatchCollector, DefaultBatchCollector};
use crate::config::BatchOptions;
use crate::consumer::{BatchConsumerPipe, Consumer, ConsumerFactory};
use crate::context::{short_type_name, BatchConsumeContext, ConsumeContext, MessageContext};
use crate::error::{Error, Result};
use crate::pipe::Pipe;
use crate::probe::{Probe, ProbeScope};

pub struct BatchConsumerFactory<M, C, F>
where
    M: Send + Sync + 'static,
{
    options: BatchOptions,
    consumer_factory: Arc<F>,
    collector: Arc<dyn BatchCollector<M>>,
    _consumer: PhantomData<fn() -> C>,
}

impl<M, C, F> BatchConsumerFactory<M, C, F>
where
    M: Send + Sync + 'static,
    C: Consumer<M> + 'static,
    F: ConsumerFactory<C> + 'static,
{
    /// Creates a stage with its own [`DefaultBatchCollector`]
    pub fn new(options: BatchOptions, consumer_factory: F) -> Result<Self> {
        let collector = DefaultBatchCollector::new(options.clone())?;
        Ok(Self::with_collector(
            options,
            consumer_factory,
            Arc::new(collector),
        ))
    }

    /// Creates a stage around an existing collector, which must not be shared with another stage
    pub fn with_collector(
        options: BatchOptions,
        consumer_factory: F,
        collector: Arc<dyn BatchCollector<M>>,
    ) -> Self {
        Self {
            options,
            consumer_factory: Arc::new(consumer_factory),
            collector,
            _consumer: PhantomData,
        }
    }

    pub fn options(&self) -> &BatchOptions {
        &self.options
    }

    /// Downstream stage that runs this factory's consumers
    pub fn consumer_pipe(&self) -> BatchConsumerPipe<C, F> {
        BatchConsumerPipe::new(Arc::clone(&self.consumer_factory))
    }

    /// Adds `context` to the current batch and hands it to `next`
    ///
    /// Fails with [`Error::TypeMismatch`] without touching any batch when the
    /// payload is not an `M`. Errors returned by `next` are passed through
    /// unchanged after the message has been completed.
    pub async fn send<P>(&self, context: MessageContext, next: &P) -> Result<()>
    where
        P: Pipe<BatchConsumeContext<M>> + ?Sized,
    {
        let span = debug_span!("dispatch", message_id = context.message_id());
        async move {
            let Some(message) = context.downcast::<M>() else {
                let error = Error::TypeMismatch {
                    expected: short_type_name::<M>(),
                    actual: context.message_type(),
                };
                warn!("Rejecting message: {error}");
                return Err(error);
            };

            let batch = self.collector.collect(message.clone())?;
            let _complete = CompleteOnExit {
                collector: self.collector.as_ref(),
                message,
                batch: Arc::clone(&batch),
            };

            next.send(BatchConsumeContext::new(context, batch)).await
        }
        .instrument(span)
        .await
    }

    /// Sends `context` through this factory's own [`BatchConsumerPipe`]
    pub async fn dispatch(&self, context: MessageContext) -> Result<()> {
        let pipe = self.consumer_pipe();
        self.send(context, &pipe).await
    }

    /// Closes the open batch according to the shutdown policy and stops the timer
    pub async fn dispose(&self) -> Result<()> {
        self.collector.dispose().await
    }
}

impl<M, C, F> Probe for BatchConsumerFactory<M, C, F>
where
    M: Send + Sync + 'static,
    C: Consumer<M>,
    F: ConsumerFactory<C>,
{
    fn probe(&self, scope: &mut ProbeScope) {
        let scope = scope.create_consumer_factory_scope::<dyn Consumer<M>>("batch");
        scope.add("timeLimit", format!("{:?}", self.options.time_limit));
        scope.add("messageLimit", self.options.message_limit);

        self.consumer_factory.probe(scope);
        self.collector.probe(scope);
    }
}

/// Completes a message on its collector when dropped, if its batch has closed
///
/// Dropping covers normal returns, errors from the next stage and
/// cancellation of the per-message future.
struct CompleteOnExit<'a, M>
where
    M: Send + Sync + 'static,
{
    collector: &'a dyn BatchCollector<M>,
    message: ConsumeContext<M>,
    batch: Arc<Batch<M>>,
}

impl<M> Drop for CompleteOnExit<'_, M>
where
    M: Send + Sync + 'static,
{
    fn drop(&mut self) {
        if self.batch.is_completed() {
            self.collector.complete(&self.message, &self.batch);
        }
    }
}
