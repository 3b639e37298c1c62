// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::context::ConsumeContext;
use crate::error::{Error, Result};
use serde::Serialize;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::Instrument;

/// Trigger that ended a batch's open period
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum CloseReason {
    CountReached,
    TimeElapsed,
    Shutdown,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            CloseReason::CountReached => "count_reached",
            CloseReason::TimeElapsed => "time_elapsed",
            CloseReason::Shutdown => "shutdown",
        };
        f.write_str(reason)
    }
}

/// Messages accumulated for one consumer invocation
///
/// A batch is open until [`Batch::mark_closed`] is called once; closing
/// wakes every task waiting in [`Batch::await_completion`]. Once closed the
/// batch never reopens and rejects further messages.
pub struct Batch<M> {
    id: u64,
    message_limit: usize,
    created_at: Instant,
    messages: Mutex<Vec<ConsumeContext<M>>>,
    completed: watch::Sender<Option<CloseReason>>,
    consumption_started: AtomicBool,
    outcome: watch::Sender<Option<Result<()>>>,
    discarded: AtomicBool,
    released: AtomicBool,
}

impl<M> Batch<M> {
    pub(crate) fn new(id: u64, message_limit: usize) -> Self {
        let (completed, _) = watch::channel(None);
        let (outcome, _) = watch::channel(None);
        Self {
            id,
            message_limit,
            created_at: Instant::now(),
            messages: Mutex::new(Vec::with_capacity(message_limit)),
            completed,
            consumption_started: AtomicBool::new(false),
            outcome,
            discarded: AtomicBool::new(false),
            released: AtomicBool::new(false),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<ConsumeContext<M>>> {
        // A panic while holding this lock cannot leave the vector half-written.
        self.messages
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Appends a message, returning whether the batch reached its message limit
    pub fn append(&self, message: ConsumeContext<M>) -> Result<bool> {
        let mut messages = self.lock();
        if self.is_completed() {
            return Err(Error::InvalidState("cannot append to a closed batch"));
        }
        messages.push(message);
        Ok(messages.len() >= self.message_limit)
    }

    /// Closes the batch and wakes every waiter
    ///
    /// Returns `false` when the batch was already closed, in which case the
    /// original close reason is kept.
    pub fn mark_closed(&self, reason: CloseReason) -> bool {
        let _messages = self.lock();
        self.completed.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(reason);
            true
        })
    }

    /// Waits until the batch is closed and returns why it closed
    pub async fn await_completion(&self) -> CloseReason {
        let mut rx = self.completed.subscribe();
        // The sender is owned by `self`, so the channel cannot close while we wait.
        let reason = match rx.wait_for(Option::is_some).await {
            Ok(reason) => *reason,
            Err(_) => self.close_reason(),
        };
        reason.unwrap_or(CloseReason::Shutdown)
    }

    pub fn is_completed(&self) -> bool {
        self.completed.borrow().is_some()
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        *self.completed.borrow()
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Snapshot of the messages in arrival order
    pub fn messages(&self) -> Vec<ConsumeContext<M>> {
        self.lock().clone()
    }

    pub fn first_message_received(&self) -> Option<SystemTime> {
        self.lock().iter().map(|m| m.context().sent_time()).min()
    }

    pub fn last_message_received(&self) -> Option<SystemTime> {
        self.lock().iter().map(|m| m.context().sent_time()).max()
    }

    pub fn is_discarded(&self) -> bool {
        self.discarded.load(Ordering::Acquire)
    }

    pub(crate) fn discard(&self) {
        self.discarded.store(true, Ordering::Release);
    }

    /// Whether the consuming task has finished with an outcome
    pub fn is_consumed(&self) -> bool {
        self.outcome.borrow().is_some() && !self.is_discarded()
    }

    /// Returns `true` for the first caller only
    pub(crate) fn release(&self) -> bool {
        !self.released.swap(true, Ordering::AcqRel)
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }
}

impl<M> Batch<M>
where
    M: Send + Sync + 'static,
{
    /// Runs `consume` at most once for this batch and waits for its outcome
    ///
    /// The first call starts a detached task that waits for the batch to
    /// close and then runs `consume`; later calls drop their closure. Every
    /// caller receives the same outcome. Dropping a caller's future only
    /// stops its wait: the consumption keeps running and is never restarted.
    pub async fn consume_once<F, Fut>(self: &Arc<Self>, consume: F) -> Result<()>
    where
        F: FnOnce(CloseReason) -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        if !self.consumption_started.swap(true, Ordering::AcqRel) {
            let batch = Arc::clone(self);
            tokio::spawn(
                async move {
                    let outcome = PublishOnExit {
                        outcome: &batch.outcome,
                    };
                    let reason = batch.await_completion().await;
                    let result = if batch.is_discarded() {
                        Err(Error::BatchDiscarded)
                    } else {
                        consume(reason).await
                    };
                    outcome.publish(result);
                }
                .in_current_span(),
            );
        }

        let mut rx = self.outcome.subscribe();
        // The sender is owned by `self`, so the channel cannot close while we wait.
        let result = match rx.wait_for(Option::is_some).await {
            Ok(outcome) => outcome.clone(),
            Err(_) => None,
        };
        result.unwrap_or(Err(Error::ConsumptionAborted))
    }
}

/// Publishes the consumption outcome, or [`Error::ConsumptionAborted`] if the
/// consuming task stops without one
struct PublishOnExit<'a> {
    outcome: &'a watch::Sender<Option<Result<()>>>,
}

impl PublishOnExit<'_> {
    fn publish(&self, result: Result<()>) -> bool {
        self.outcome.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(result);
            true
        })
    }
}

impl Drop for PublishOnExit<'_> {
    fn drop(&mut self) {
        self.publish(Err(Error::ConsumptionAborted));
    }
}

impl<M> fmt::Debug for Batch<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Batch")
            .field("id", &self.id)
            .field("length", &self.len())
            .field("message_limit", &self.message_limit)
            .field("close_reason", &self.close_reason())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::MessageContext;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use std::time::Duration;

    fn message(id: u32) -> ConsumeContext<u32> {
        MessageContext::new(format!("m-{id}"), id)
            .downcast::<u32>()
            .expect("payload is a u32")
    }

    #[test]
    fn test_append_reports_message_limit() {
        let batch = Batch::new(1, 2);
        assert!(!batch.append(message(1)).unwrap());
        assert!(batch.append(message(2)).unwrap());
        assert_eq!(batch.len(), 2);
    }

    #[test]
    fn test_append_after_close_fails() {
        let batch = Batch::new(1, 5);
        batch.append(message(1)).unwrap();
        assert!(batch.mark_closed(CloseReason::TimeElapsed));

        let result = batch.append(message(2));
        assert!(matches!(result, Err(Error::InvalidState(_))));
        assert_eq!(batch.len(), 1);
    }

    #[test]
    fn test_mark_closed_is_idempotent() {
        let batch = Batch::<u32>::new(1, 5);
        assert!(!batch.is_completed());
        assert!(batch.mark_closed(CloseReason::CountReached));
        assert!(!batch.mark_closed(CloseReason::Shutdown));
        assert!(batch.is_completed());
        assert_eq!(batch.close_reason(), Some(CloseReason::CountReached));
    }

    #[test]
    fn test_messages_keep_arrival_order() {
        let batch = Batch::new(1, 10);
        for i in 0..4 {
            batch.append(message(i)).unwrap();
        }
        let ids: Vec<u32> = batch.messages().iter().map(|m| *m.message()).collect();
        assert_eq!(ids, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_message_received_bounds() {
        let early = SystemTime::UNIX_EPOCH + Duration::from_secs(10);
        let late = SystemTime::UNIX_EPOCH + Duration::from_secs(20);
        let batch = Batch::new(1, 10);
        for sent_time in [late, early] {
            let context = MessageContext::new("m", 1_u32).with_sent_time(sent_time);
            batch.append(context.downcast::<u32>().unwrap()).unwrap();
        }
        assert_eq!(batch.first_message_received(), Some(early));
        assert_eq!(batch.last_message_received(), Some(late));
    }

    #[tokio::test]
    async fn test_all_waiters_observe_same_reason() {
        let batch = Arc::new(Batch::<u32>::new(1, 5));
        let waiters: Vec<_> = (0..8)
            .map(|_| {
                let batch = Arc::clone(&batch);
                tokio::spawn(async move { batch.await_completion().await })
            })
            .collect();

        tokio::task::yield_now().await;
        batch.mark_closed(CloseReason::TimeElapsed);
        batch.mark_closed(CloseReason::Shutdown);

        for waiter in waiters {
            assert_eq!(waiter.await.unwrap(), CloseReason::TimeElapsed);
        }
    }

    #[tokio::test]
    async fn test_await_completion_after_close_returns_immediately() {
        let batch = Batch::<u32>::new(1, 5);
        batch.mark_closed(CloseReason::CountReached);
        assert_eq!(batch.await_completion().await, CloseReason::CountReached);
    }

    fn closed_batch() -> Arc<Batch<u32>> {
        let batch = Arc::new(Batch::new(1, 1));
        batch.append(message(1)).unwrap();
        batch.mark_closed(CloseReason::CountReached);
        batch
    }

    #[tokio::test]
    async fn test_consume_once_runs_single_consumption() {
        let batch = closed_batch();
        let calls = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..10)
            .map(|_| {
                let batch = Arc::clone(&batch);
                let calls = Arc::clone(&calls);
                tokio::spawn(async move {
                    batch
                        .consume_once(move |_| async move {
                            calls.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(5)).await;
                            Ok(())
                        })
                        .await
                })
            })
            .collect();

        for task in tasks {
            assert!(task.await.unwrap().is_ok());
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(batch.is_consumed());
    }

    #[tokio::test]
    async fn test_consume_once_shares_failure() {
        let batch = closed_batch();

        let first = batch
            .consume_once(|_| async { Err(Error::downstream(anyhow::anyhow!("boom"))) })
            .await;
        let second = batch.consume_once(|_| async { Ok(()) }).await;

        assert!(matches!(first, Err(Error::Downstream(_))));
        assert!(matches!(second, Err(Error::Downstream(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_consume_once_waits_for_close() {
        let batch = Arc::new(Batch::new(1, 5));
        batch.append(message(1)).unwrap();

        let waiter = {
            let batch = Arc::clone(&batch);
            tokio::spawn(async move {
                batch
                    .consume_once(|reason| async move {
                        assert_eq!(reason, CloseReason::TimeElapsed);
                        Ok(())
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!batch.is_consumed());

        batch.mark_closed(CloseReason::TimeElapsed);
        assert!(waiter.await.unwrap().is_ok());
        assert!(batch.is_consumed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_waiter_does_not_restart_consumption() {
        let batch = closed_batch();
        let calls = Arc::new(AtomicUsize::new(0));

        let first = {
            let batch = Arc::clone(&batch);
            let calls = Arc::clone(&calls);
            tokio::spawn(async move {
                batch
                    .consume_once(move |_| async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        Ok(())
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        first.abort();
        assert!(first.await.unwrap_err().is_cancelled());

        let restarted = Arc::clone(&calls);
        let second = batch
            .consume_once(move |_| async move {
                restarted.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await;

        assert!(second.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_consume_once_reports_crashed_consumer() {
        let batch = closed_batch();
        let crash = true;
        let result = batch
            .consume_once(move |_| async move {
                if crash {
                    panic!("consumer crashed");
                }
                Ok(())
            })
            .await;

        assert!(matches!(result, Err(Error::ConsumptionAborted)));
    }

    #[tokio::test]
    async fn test_consume_once_skips_discarded_batch() {
        let batch = Arc::new(Batch::new(1, 5));
        batch.append(message(1)).unwrap();
        batch.discard();
        batch.mark_closed(CloseReason::Shutdown);

        let calls = Arc::new(AtomicUsize::new(0));
        let counted = Arc::clone(&calls);
        let discarded = batch
            .consume_once(move |_| async move {
                counted.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await;

        assert!(matches!(discarded, Err(Error::BatchDiscarded)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(!batch.is_consumed());
    }

    #[test]
    fn test_release_only_once() {
        let batch = Batch::<u32>::new(1, 1);
        assert!(batch.release());
        assert!(!batch.release());
        assert!(batch.is_released());
    }
}
