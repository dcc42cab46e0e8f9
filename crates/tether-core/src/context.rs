// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Request and response contexts.
//!
//! A [`CorrelationRequestContext`] is the client half of a request/reply
//! exchange: the send orchestrator completes it with the reply (or the
//! transport error) and the paired receive-reply awaits it.
//! A [`CorrelationResponseContext`] is the server half: the receive path
//! registers it, the paired send-reply completes it, and the dispatcher
//! awaits the outcome through a [`ResponseWaiter`] to hand back to the
//! transport.

use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::watch;
use uuid::Uuid;

use crate::error::{Result, TetherError};
use crate::message::Message;

type Outcome = Option<Result<Message>>;

/// Single-assignment completion slot shared by both context kinds.
#[derive(Debug)]
struct Completion {
    tx: watch::Sender<Outcome>,
}

impl Completion {
    fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx }
    }

    /// First completion wins; returns whether this call completed the slot.
    fn complete(&self, outcome: Result<Message>) -> bool {
        let mut outcome = Some(outcome);
        self.tx.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = outcome.take();
            true
        })
    }

    fn is_completed(&self) -> bool {
        self.tx.borrow().is_some()
    }

    fn peek(&self) -> Outcome {
        self.tx.borrow().clone()
    }

    async fn wait(&self) -> Result<Message> {
        let mut rx = self.tx.subscribe();
        let value = rx
            .wait_for(Option::is_some)
            .await
            .map_err(|_| TetherError::Cancelled)?;
        match &*value {
            Some(outcome) => outcome.clone(),
            None => Err(TetherError::Cancelled),
        }
    }
}

/// Pending client request awaiting its reply.
#[derive(Debug, Clone)]
pub struct CorrelationRequestContext {
    inner: Arc<RequestInner>,
}

#[derive(Debug)]
struct RequestInner {
    id: Uuid,
    completion: Completion,
}

impl Default for CorrelationRequestContext {
    fn default() -> Self {
        Self::new()
    }
}

impl CorrelationRequestContext {
    /// New pending request.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RequestInner {
                id: Uuid::new_v4(),
                completion: Completion::new(),
            }),
        }
    }

    /// Identifier, for logging.
    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    /// Deliver the reply. Fault replies complete the request with the fault.
    pub fn reply(&self, message: Message) -> bool {
        let outcome = match message.to_fault_error() {
            Some(fault) => Err(fault),
            None => Ok(message),
        };
        self.inner.completion.complete(outcome)
    }

    /// Complete with an error.
    pub fn fail(&self, error: TetherError) -> bool {
        self.inner.completion.complete(Err(error))
    }

    /// Complete with [`TetherError::Cancelled`], signalling every waiter.
    pub fn cancel(&self) -> bool {
        self.inner.completion.complete(Err(TetherError::Cancelled))
    }

    /// Whether a reply, error or cancellation has been recorded.
    pub fn is_completed(&self) -> bool {
        self.inner.completion.is_completed()
    }

    /// The outcome, if it already arrived.
    pub fn try_get_reply(&self) -> Option<Result<Message>> {
        self.inner.completion.peek()
    }

    /// Wait for the outcome.
    pub async fn wait_for_reply(&self) -> Result<Message> {
        self.inner.completion.wait().await
    }

    /// Whether both values refer to the same request.
    pub fn same_as(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

/// Server-side context through which a paired send-reply answers a request.
///
/// Every clone is a workflow-side holder. When the last one is dropped
/// without an answer, the exchange completes with [`TetherError::Cancelled`]
/// so the transport side waiting through a [`ResponseWaiter`] is released.
#[derive(Debug, Clone)]
pub struct CorrelationResponseContext {
    inner: Arc<ResponseInner>,
    holders: Arc<AbandonOnDrop>,
}

#[derive(Debug)]
struct AbandonOnDrop(Arc<ResponseInner>);

impl Drop for AbandonOnDrop {
    fn drop(&mut self) {
        self.0.completion.complete(Err(TetherError::Cancelled));
    }
}

/// Transport-side view of a response context.
///
/// Waiting does not count as holding the exchange open.
#[derive(Debug, Clone)]
pub struct ResponseWaiter {
    inner: Arc<ResponseInner>,
}

impl ResponseWaiter {
    /// Wait for the paired send-reply, or for every holder to go away.
    pub async fn wait_for_reply(&self) -> Result<Message> {
        self.inner.completion.wait().await
    }

    /// Whether the exchange has been answered or abandoned.
    pub fn is_completed(&self) -> bool {
        self.inner.completion.is_completed()
    }
}

#[derive(Debug)]
struct ResponseInner {
    id: Uuid,
    exception: Mutex<Option<TetherError>>,
    completion: Completion,
}

impl Default for CorrelationResponseContext {
    fn default() -> Self {
        Self::new()
    }
}

impl CorrelationResponseContext {
    /// New open response context.
    pub fn new() -> Self {
        let inner = Arc::new(ResponseInner {
            id: Uuid::new_v4(),
            exception: Mutex::new(None),
            completion: Completion::new(),
        });
        Self {
            holders: Arc::new(AbandonOnDrop(inner.clone())),
            inner,
        }
    }

    /// A waiter that does not keep the exchange open.
    pub fn waiter(&self) -> ResponseWaiter {
        ResponseWaiter {
            inner: self.inner.clone(),
        }
    }

    /// Identifier, for logging.
    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    /// Stash an error the paired send-reply must return as a fault.
    pub fn set_exception(&self, error: TetherError) {
        *self
            .inner
            .exception
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(error);
    }

    /// The stashed error, if any.
    pub fn exception(&self) -> Option<TetherError> {
        self.inner
            .exception
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Answer with a reply message.
    pub fn send_reply(&self, message: Message) -> bool {
        self.inner.completion.complete(Ok(message))
    }

    /// Answer with a fault.
    pub fn send_fault(&self, error: TetherError) -> bool {
        self.inner.completion.complete(Err(error))
    }

    /// Abandon the exchange.
    pub fn cancel(&self) -> bool {
        self.inner.completion.complete(Err(TetherError::Cancelled))
    }

    /// Whether the exchange has been answered or abandoned.
    pub fn is_completed(&self) -> bool {
        self.inner.completion.is_completed()
    }

    /// Wait for the paired send-reply.
    pub async fn wait_for_reply(&self) -> Result<Message> {
        self.inner.completion.wait().await
    }

    /// Whether both values refer to the same exchange.
    pub fn same_as(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_request_reply_first_completion_wins() {
        let ctx = CorrelationRequestContext::new();
        assert!(ctx.try_get_reply().is_none());

        assert!(ctx.reply(Message::new("urn:reply")));
        assert!(!ctx.fail(TetherError::Cancelled));

        let reply = ctx.wait_for_reply().await.unwrap();
        assert_eq!(reply.action(), Some("urn:reply"));
        assert!(ctx.is_completed());
    }

    #[tokio::test]
    async fn test_request_fault_reply_surfaces_as_error() {
        let ctx = CorrelationRequestContext::new();
        ctx.reply(Message::fault("Receiver", "boom"));

        let err = ctx.wait_for_reply().await.unwrap_err();
        assert_eq!(err.error_code(), "FAULT");
    }

    #[tokio::test]
    async fn test_cancel_wakes_waiter() {
        let ctx = CorrelationRequestContext::new();
        let waiter = {
            let ctx = ctx.clone();
            tokio::spawn(async move { ctx.wait_for_reply().await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(ctx.cancel());

        let result = waiter.await.unwrap();
        assert_eq!(result.unwrap_err(), TetherError::Cancelled);
    }

    #[tokio::test]
    async fn test_response_context_fault_and_exception() {
        let ctx = CorrelationResponseContext::new();
        assert!(ctx.exception().is_none());

        ctx.set_exception(TetherError::invalid_operation("insufficient funds"));
        assert!(ctx.exception().is_some());

        ctx.send_fault(ctx.exception().unwrap());
        assert!(ctx.is_completed());
        assert!(!ctx.send_reply(Message::new("urn:late")));
        assert_eq!(ctx.wait_for_reply().await.unwrap_err().error_code(), "INVALID_OPERATION");
    }

    #[tokio::test]
    async fn test_dropping_last_holder_releases_waiter() {
        let ctx = CorrelationResponseContext::new();
        let waiter = ctx.waiter();
        let held = ctx.clone();

        drop(ctx);
        assert!(!waiter.is_completed());

        drop(held);
        assert_eq!(waiter.wait_for_reply().await.unwrap_err(), TetherError::Cancelled);
    }

    #[tokio::test]
    async fn test_answer_survives_holder_drop() {
        let ctx = CorrelationResponseContext::new();
        let waiter = ctx.waiter();

        assert!(ctx.send_reply(Message::new("urn:reply")));
        drop(ctx);

        let reply = waiter.wait_for_reply().await.unwrap();
        assert_eq!(reply.action(), Some("urn:reply"));
    }
}
