// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The downstream stage that performs the real consumption of a batch.
//!
//! Every message that joined a batch sends its own [`BatchConsumeContext`]
//! through [`BatchConsumerPipe`]. The first of those calls starts the
//! batch's consumption task, which builds a consumer once the batch closes;
//! every call, the first included, only waits for that task's outcome.

use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, error};

use crate::batch::Batch;
use crate::context::{short_type_name, BatchConsumeContext};
use crate::error::{Error, Result};
use crate::pipe::Pipe;
use crate::probe::ProbeScope;

/// User logic that handles a closed batch
#[async_trait]
pub trait Consumer<M>: Send + Sync
where
    M: Send + Sync + 'static,
{
    async fn consume(&self, batch: &Batch<M>) -> anyhow::Result<()>;
}

/// Builds the consumer used for one batch
pub trait ConsumerFactory<C>: Send + Sync {
    fn create(&self) -> Result<C>;

    fn probe(&self, scope: &mut ProbeScope) {
        scope
            .create_scope("consumer")
            .add("consumerType", short_type_name::<C>());
    }
}

impl<C, F> ConsumerFactory<C> for F
where
    F: Fn() -> C + Send + Sync,
{
    fn create(&self) -> Result<C> {
        Ok(self())
    }
}

pub struct BatchConsumerPipe<C, F> {
    factory: Arc<F>,
    _consumer: PhantomData<fn() -> C>,
}

impl<C, F> BatchConsumerPipe<C, F>
where
    F: ConsumerFactory<C>,
{
    pub fn new(factory: Arc<F>) -> Self {
        Self {
            factory,
            _consumer: PhantomData,
        }
    }
}

impl<C, F> Clone for BatchConsumerPipe<C, F> {
    fn clone(&self) -> Self {
        Self {
            factory: Arc::clone(&self.factory),
            _consumer: PhantomData,
        }
    }
}

#[async_trait]
impl<M, C, F> Pipe<BatchConsumeContext<M>> for BatchConsumerPipe<C, F>
where
    M: Send + Sync + 'static,
    C: Consumer<M> + 'static,
    F: ConsumerFactory<C> + 'static,
{
    async fn send(&self, context: BatchConsumeContext<M>) -> Result<()> {
        let batch = Arc::clone(context.batch());
        let consumed = Arc::clone(&batch);
        let factory = Arc::clone(&self.factory);

        batch
            .consume_once(move |reason| async move {
                let consumer = factory.create()?;
                debug!(
                    batch_id = consumed.id(),
                    length = consumed.len(),
                    %reason,
                    "Consuming batch"
                );
                consumer.consume(&consumed).await.map_err(|e| {
                    error!(batch_id = consumed.id(), "Batch consumer failed: {e:#}");
                    Error::downstream(e)
                })
            })
            .await
    }

    fn probe(&self, scope: &mut ProbeScope) {
        self.factory.probe(scope);
    }
}
