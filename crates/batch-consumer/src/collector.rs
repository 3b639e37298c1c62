// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Batch membership and closure.
//!
//! The collector owns the current open batch of a stage. Every message
//! goes through [`BatchCollector::collect`], which appends it to the open
//! batch (opening one if needed) and closes the batch when the message
//! limit is reached. A timer armed when a batch opens closes it once the
//! time limit elapses.
//!
//! ```text
//!   collect(m1) ──┐
//!   collect(m2) ──┼──> [ lock ] ──> current batch ──> count reached? ──> close
//!   timer(id)  ───┘                                   time elapsed?  ──> close
//! ```
//!
//! All mutations of the current-batch reference and of batch contents
//! happen under one mutex, so concurrent contributors always observe the
//! same batch instance and items keep the order in which callers acquired
//! the lock.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, debug_span, error, warn};

use crate::batch::{Batch, CloseReason};
use crate::config::{BatchOptions, ShutdownPolicy};
use crate::context::ConsumeContext;
use crate::error::{Error, Result};
use crate::probe::ProbeScope;

/// Decides which batch a message joins and when batches close
#[async_trait]
pub trait BatchCollector<M>: Send + Sync
where
    M: Send + Sync + 'static,
{
    /// Adds the message to the current batch and returns that batch.
    ///
    /// The returned batch may already be closed if this message reached the
    /// message limit. Callers await completion themselves.
    fn collect(&self, message: ConsumeContext<M>) -> Result<Arc<Batch<M>>>;

    /// Per-message cleanup once downstream processing of a closed batch returned.
    ///
    /// Called once per contributing message; batch-wide teardown runs only
    /// for the first call on a given batch.
    fn complete(&self, message: &ConsumeContext<M>, batch: &Arc<Batch<M>>);

    /// Releases the timer and closes any batch that is still open.
    async fn dispose(&self) -> Result<()>;

    fn probe(&self, scope: &mut ProbeScope);
}

/// Counters describing what a collector has done so far
#[derive(Debug, Default)]
struct CollectorStats {
    batches_formed: AtomicU64,
    closed_by_count: AtomicU64,
    closed_by_time: AtomicU64,
    closed_by_shutdown: AtomicU64,
    messages_collected: AtomicU64,
    messages_completed: AtomicU64,
    batches_released: AtomicU64,
}

impl CollectorStats {
    fn record_close(&self, reason: CloseReason) {
        let counter = match reason {
            CloseReason::CountReached => &self.closed_by_count,
            CloseReason::TimeElapsed => &self.closed_by_time,
            CloseReason::Shutdown => &self.closed_by_shutdown,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Point-in-time copy of a collector's counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectorSnapshot {
    pub batches_formed: u64,
    pub closed_by_count: u64,
    pub closed_by_time: u64,
    pub closed_by_shutdown: u64,
    pub messages_collected: u64,
    pub messages_completed: u64,
    pub batches_released: u64,
}

struct OpenBatch<M> {
    batch: Arc<Batch<M>>,
    timer: JoinHandle<()>,
    cancel: CancellationToken,
}

struct CollectorState<M> {
    current: Option<OpenBatch<M>>,
    next_id: u64,
    disposed: bool,
}

struct Shared<M> {
    state: Mutex<CollectorState<M>>,
    stats: CollectorStats,
}

impl<M> Shared<M> {
    fn lock(&self) -> MutexGuard<'_, CollectorState<M>> {
        // State transitions complete before any call that could panic.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn close(&self, batch: &Batch<M>, reason: CloseReason) {
        if batch.mark_closed(reason) {
            self.stats.record_close(reason);
            debug!(
                batch_id = batch.id(),
                length = batch.len(),
                %reason,
                "Batch closed"
            );
        }
    }

    /// Closes the current batch if it is still the one identified by `batch_id`
    fn close_current(&self, batch_id: u64, reason: CloseReason) {
        let mut state = self.lock();
        let is_current = state
            .current
            .as_ref()
            .is_some_and(|open| open.batch.id() == batch_id);
        if !is_current {
            return;
        }
        if let Some(open) = state.current.take() {
            self.close(&open.batch, reason);
        }
    }
}

/// Mutex-guarded collector for a single pipeline stage
///
/// Must be used from within a tokio runtime: opening a batch spawns its
/// timer task.
pub struct DefaultBatchCollector<M> {
    options: BatchOptions,
    shared: Arc<Shared<M>>,
}

impl<M> DefaultBatchCollector<M>
where
    M: Send + Sync + 'static,
{
    pub fn new(options: BatchOptions) -> Result<Self> {
        options.validate()?;
        Ok(Self {
            options,
            shared: Arc::new(Shared {
                state: Mutex::new(CollectorState {
                    current: None,
                    next_id: 0,
                    disposed: false,
                }),
                stats: CollectorStats::default(),
            }),
        })
    }

    pub fn options(&self) -> &BatchOptions {
        &self.options
    }

    pub fn stats(&self) -> CollectorSnapshot {
        let stats = &self.shared.stats;
        CollectorSnapshot {
            batches_formed: stats.batches_formed.load(Ordering::Relaxed),
            closed_by_count: stats.closed_by_count.load(Ordering::Relaxed),
            closed_by_time: stats.closed_by_time.load(Ordering::Relaxed),
            closed_by_shutdown: stats.closed_by_shutdown.load(Ordering::Relaxed),
            messages_collected: stats.messages_collected.load(Ordering::Relaxed),
            messages_completed: stats.messages_completed.load(Ordering::Relaxed),
            batches_released: stats.batches_released.load(Ordering::Relaxed),
        }
    }

    /// The batch currently accepting messages, if any
    pub fn current_batch(&self) -> Option<Arc<Batch<M>>> {
        self.shared
            .lock()
            .current
            .as_ref()
            .map(|open| Arc::clone(&open.batch))
    }

    fn open_batch(&self, id: u64) -> OpenBatch<M> {
        let batch = Arc::new(Batch::new(id, self.options.message_limit));
        let cancel = CancellationToken::new();
        let timer = tokio::spawn(run_timer(
            Arc::clone(&self.shared),
            id,
            self.options.time_limit,
            cancel.clone(),
        ));

        self.shared
            .stats
            .batches_formed
            .fetch_add(1, Ordering::Relaxed);
        debug!(batch_id = id, "Batch opened");

        OpenBatch {
            batch,
            timer,
            cancel,
        }
    }
}

async fn run_timer<M>(
    shared: Arc<Shared<M>>,
    batch_id: u64,
    time_limit: Duration,
    cancel: CancellationToken,
) {
    tokio::select! {
        () = cancel.cancelled() => {}
        () = tokio::time::sleep(time_limit) => {
            shared.close_current(batch_id, CloseReason::TimeElapsed);
        }
    }
}

#[async_trait]
impl<M> BatchCollector<M> for DefaultBatchCollector<M>
where
    M: Send + Sync + 'static,
{
    fn collect(&self, message: ConsumeContext<M>) -> Result<Arc<Batch<M>>> {
        let span = debug_span!("collect", message_id = message.message_id());
        let _enter = span.enter();

        let mut guard = self.shared.lock();
        let state = &mut *guard;
        if state.disposed {
            return Err(Error::CollectorDisposed);
        }

        let open = state.current.get_or_insert_with(|| {
            state.next_id += 1;
            self.open_batch(state.next_id)
        });
        let batch = Arc::clone(&open.batch);

        let limit_reached = batch.append(message)?;
        self.shared
            .stats
            .messages_collected
            .fetch_add(1, Ordering::Relaxed);

        if limit_reached {
            if let Some(open) = state.current.take() {
                open.cancel.cancel();
            }
            self.shared.close(&batch, CloseReason::CountReached);
        }

        Ok(batch)
    }

    fn complete(&self, message: &ConsumeContext<M>, batch: &Arc<Batch<M>>) {
        self.shared
            .stats
            .messages_completed
            .fetch_add(1, Ordering::Relaxed);

        if !batch.is_completed() {
            warn!(
                batch_id = batch.id(),
                message_id = message.message_id(),
                "Completing a message of a batch that is still open"
            );
            return;
        }

        if batch.release() {
            self.shared
                .stats
                .batches_released
                .fetch_add(1, Ordering::Relaxed);
            debug!(
                batch_id = batch.id(),
                consumed = batch.is_consumed(),
                "Batch released"
            );
        }
    }

    async fn dispose(&self) -> Result<()> {
        let open = {
            let mut state = self.shared.lock();
            if state.disposed {
                return Ok(());
            }
            state.disposed = true;
            state.current.take()
        };

        let Some(open) = open else {
            debug!("Batch collector disposed with no open batch");
            return Ok(());
        };

        open.cancel.cancel();

        // Waiters are released before the timer is joined so a failing timer
        // cannot leave them suspended.
        if self.options.shutdown_policy == ShutdownPolicy::Discard {
            warn!(
                batch_id = open.batch.id(),
                length = open.batch.len(),
                "Discarding open batch at shutdown"
            );
            open.batch.discard();
        }
        self.shared.close(&open.batch, CloseReason::Shutdown);

        open.timer.await.map_err(|e| {
            error!("Batch timer task failed during dispose: {e}");
            Error::CollectorDisposal(format!("batch timer task failed: {e}"))
        })
    }

    fn probe(&self, scope: &mut ProbeScope) {
        let scope = scope.create_scope("collector");
        scope.add("messageLimit", self.options.message_limit);
        scope.add("timeLimit", format!("{:?}", self.options.time_limit));
        scope.add("shutdownPolicy", format!("{:?}", self.options.shutdown_policy));

        let stats = self.stats();
        scope.add("batchesFormed", stats.batches_formed);
        scope.add("messagesProcessed", stats.messages_completed);
        scope.add("counters", stats);
        if let Some(batch) = self.current_batch() {
            scope.add("openBatchLength", batch.len());
        }
    }
}
