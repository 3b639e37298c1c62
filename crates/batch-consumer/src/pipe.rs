// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use crate::probe::ProbeScope;

/// Next processing stage of a pipeline
#[async_trait]
pub trait Pipe<C>: Send + Sync
where
    C: Send + 'static,
{
    async fn send(&self, context: C) -> Result<()>;

    fn probe(&self, _scope: &mut ProbeScope) {}
}

#[async_trait]
impl<C, P> Pipe<C> for Arc<P>
where
    C: Send + 'static,
    P: Pipe<C> + ?Sized,
{
    async fn send(&self, context: C) -> Result<()> {
        (**self).send(context).await
    }

    fn probe(&self, scope: &mut ProbeScope) {
        (**self).probe(scope);
    }
}
