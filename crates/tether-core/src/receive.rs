// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Receive orchestration.
//!
//! Server side, inbound messages go through the [`ReceiveDispatcher`], which
//! resolves the target instance and resumes the bookmark a
//! [`ReceiveOrchestrator::receive`] is suspended on:
//!
//! ```text
//!  dispatch ─► ResolvingCorrelation ─► [EnteringTransaction] ─► DeliveringToInstance
//!                                                                    │ not ready: wait once, retry once
//!                                                                    ▼
//!                                                AwaitingReply (two-way) ─► Finalizing
//!
//!  receive  ─► WaitingForMessage ─► ResolvingCorrelation ─► [EnteringTransaction] ─► Completed
//! ```
//!
//! Client side, [`ReceiveOrchestrator::receive_reply`] claims the pending
//! request a two-way send registered and waits for its outcome.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tracing::{debug, info, instrument, warn};

use crate::bookmark::{BookmarkHost, BookmarkName, BookmarkResumptionResult, Delivery};
use crate::context::{CorrelationRequestContext, CorrelationResponseContext};
use crate::contract::{ContractDescription, MessageDirection, TransactionFlow, default_action};
use crate::correlation::{initialize_correlations, resolve_instance_key, resolve_request_reply_handle};
use crate::error::{Result, TetherError};
use crate::handle::{CorrelationHandle, CorrelationInitializer};
use crate::key::InstanceKey;
use crate::message::Message;
use crate::query::CorrelationKeyCalculator;
use crate::scope::ExecutionScope;
use crate::transaction::{DependentCloneGuard, Transaction, TransactionFactory};

/// States of a receive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveState {
    /// Suspended on the bookmark.
    WaitingForMessage,
    /// Working out the target instance and initializing handles.
    ResolvingCorrelation,
    /// Checking or creating the transaction the message runs under.
    EnteringTransaction,
    /// Resuming the instance.
    DeliveringToInstance,
    /// Two-way only: waiting for the paired send-reply.
    AwaitingReply,
    /// Recording the outcome.
    Finalizing,
    /// Terminal success.
    Completed,
    /// Terminal failure.
    Faulted,
}

impl ReceiveState {
    /// Name used in logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::WaitingForMessage => "waiting_for_message",
            Self::ResolvingCorrelation => "resolving_correlation",
            Self::EnteringTransaction => "entering_transaction",
            Self::DeliveringToInstance => "delivering_to_instance",
            Self::AwaitingReply => "awaiting_reply",
            Self::Finalizing => "finalizing",
            Self::Completed => "completed",
            Self::Faulted => "faulted",
        }
    }
}

fn enter(state: ReceiveState) {
    debug!(state = state.as_str(), "Receive state");
}

/// Static definition of a receive activity.
#[derive(Debug, Clone)]
pub struct ReceiveMessage {
    contract: Arc<ContractDescription>,
    operation: String,
    is_one_way: bool,
    requires_transaction: bool,
    calculator: Option<CorrelationKeyCalculator>,
}

impl ReceiveMessage {
    /// Receive for `operation` of `contract`.
    ///
    /// Operations with mandatory transaction flow require a transaction.
    pub fn new(contract: Arc<ContractDescription>, operation: &str) -> Result<Self> {
        let description = contract.operation(operation).ok_or_else(|| {
            TetherError::validation(
                "operation",
                format!(
                    "contract '{}' has no operation '{operation}'",
                    contract.name
                ),
            )
        })?;
        let is_one_way = description.is_one_way;
        let requires_transaction = description.transaction_flow == TransactionFlow::Mandatory;

        Ok(Self {
            contract,
            operation: operation.to_string(),
            is_one_way,
            requires_transaction,
            calculator: None,
        })
    }

    /// Builder: route inbound messages by these correlation queries.
    pub fn with_correlation(mut self, calculator: CorrelationKeyCalculator) -> Self {
        self.calculator = Some(calculator);
        self
    }

    /// Builder: run delivered messages under a transaction, creating one
    /// when none flowed.
    pub fn requiring_transaction(mut self) -> Self {
        self.requires_transaction = true;
        self
    }

    /// The contract.
    pub fn contract(&self) -> &Arc<ContractDescription> {
        &self.contract
    }

    /// Operation name.
    pub fn operation(&self) -> &str {
        &self.operation
    }

    /// Whether the operation has no reply.
    pub fn is_one_way(&self) -> bool {
        self.is_one_way
    }

    /// Whether delivery needs a transaction.
    pub fn requires_transaction(&self) -> bool {
        self.requires_transaction
    }

    /// Key calculator for inbound routing.
    pub fn calculator(&self) -> Option<&CorrelationKeyCalculator> {
        self.calculator.as_ref()
    }

    /// Bookmark the receive suspends on.
    pub fn bookmark_name(&self) -> BookmarkName {
        BookmarkName::new(&self.contract.name, &self.operation)
    }

    /// Action of the reply a paired send-reply sends.
    pub fn reply_action(&self) -> String {
        self.contract
            .operation(&self.operation)
            .and_then(|op| op.reply_action())
            .map(str::to_string)
            .unwrap_or_else(|| {
                default_action(
                    &self.contract.namespace,
                    &self.contract.name,
                    &self.operation,
                    MessageDirection::Output,
                )
            })
    }
}

/// Per-execution input of a receive.
#[derive(Debug, Default, Clone)]
pub struct ReceiveRequest {
    /// Handle the receive continues a conversation on.
    pub correlates_with: Option<CorrelationHandle>,
    /// Handles this receive initializes.
    pub initializers: Vec<CorrelationInitializer>,
}

impl ReceiveRequest {
    /// Empty request.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder: continue the conversation on `handle`.
    pub fn correlates_with(mut self, handle: CorrelationHandle) -> Self {
        self.correlates_with = Some(handle);
        self
    }

    /// Builder: add an initializer.
    pub fn initialize(mut self, initializer: CorrelationInitializer) -> Self {
        self.initializers.push(initializer);
        self
    }
}

#[derive(Debug, Clone)]
struct RegisteredOperation {
    is_one_way: bool,
    calculator: Option<CorrelationKeyCalculator>,
}

/// Routes inbound messages to the instances waiting for them.
pub struct ReceiveDispatcher {
    bookmarks: Arc<dyn BookmarkHost>,
    buffered_receive_delay: Duration,
    operations: DashMap<BookmarkName, RegisteredOperation>,
}

impl fmt::Debug for ReceiveDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReceiveDispatcher")
            .field("buffered_receive_delay", &self.buffered_receive_delay)
            .field("operations", &self.operations.len())
            .finish()
    }
}

impl ReceiveDispatcher {
    /// Dispatcher resuming bookmarks on `bookmarks`.
    ///
    /// A message for an instance that is not yet waiting is retried once
    /// after `buffered_receive_delay`.
    pub fn new(bookmarks: Arc<dyn BookmarkHost>, buffered_receive_delay: Duration) -> Self {
        Self {
            bookmarks,
            buffered_receive_delay,
            operations: DashMap::new(),
        }
    }

    /// Accept messages for the operation of `receive`.
    pub fn register(&self, receive: &ReceiveMessage) {
        let name = receive.bookmark_name();
        info!(bookmark = %name, one_way = receive.is_one_way, "Registered receive operation");
        self.operations.insert(
            name,
            RegisteredOperation {
                is_one_way: receive.is_one_way,
                calculator: receive.calculator.clone(),
            },
        );
    }

    /// Deliver an inbound message.
    ///
    /// Returns the reply for two-way operations, `None` for one-way ones.
    /// Faults from the paired send-reply come back as errors.
    #[instrument(skip(self, message, transaction), fields(action = message.resolved_action()))]
    pub async fn dispatch(
        &self,
        contract: &str,
        operation: &str,
        message: Message,
        transaction: Option<Arc<dyn Transaction>>,
    ) -> Result<Option<Message>> {
        let name = BookmarkName::new(contract, operation);
        let registered = self
            .operations
            .get(&name)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| not_available(&name))?;

        enter(ReceiveState::ResolvingCorrelation);
        let key = resolve_instance_key(&message, registered.calculator.as_ref()).map_err(|error| {
            debug!(error = %error, "Inbound message carries no usable instance key");
            not_available(&name)
        })?;

        if let Some(transaction) = &transaction {
            enter(ReceiveState::EnteringTransaction);
            if let Some(key) = &key
                && let Some(attached) = self.bookmarks.attached_transaction(key)
                && attached != transaction.id()
            {
                warn!(instance = %key, "Flowed transaction does not match the instance's transaction");
                return Err(TetherError::TransactionMismatch {
                    instance_id: key.to_string(),
                });
            }
        }

        let response_context = (!registered.is_one_way).then(CorrelationResponseContext::new);
        let waiter = response_context.as_ref().map(CorrelationResponseContext::waiter);
        let mut delivery = Delivery {
            message,
            transaction_guard: DependentCloneGuard::block_commit(transaction.as_ref()),
            transaction,
            response_context,
        };

        enter(ReceiveState::DeliveringToInstance);
        let mut retried = false;
        loop {
            match self.bookmarks.resume_bookmark(key.as_ref(), &name, delivery) {
                BookmarkResumptionResult::Success(instance) => {
                    debug!(instance = %instance, "Message delivered");
                    break;
                }
                BookmarkResumptionResult::NotReady(returned) if !retried => {
                    debug!(
                        delay_ms = self.buffered_receive_delay.as_millis() as u64,
                        "Instance not waiting yet, retrying once"
                    );
                    retried = true;
                    delivery = returned;
                    tokio::time::sleep(self.buffered_receive_delay).await;
                }
                BookmarkResumptionResult::NotReady(_) | BookmarkResumptionResult::NotFound(_) => {
                    enter(ReceiveState::Faulted);
                    return Err(not_available(&name));
                }
            }
        }

        let Some(response) = waiter else {
            enter(ReceiveState::Completed);
            return Ok(None);
        };

        enter(ReceiveState::AwaitingReply);
        let reply = response.wait_for_reply().await;
        enter(ReceiveState::Finalizing);
        reply.map(Some)
    }
}

fn not_available(name: &BookmarkName) -> TetherError {
    TetherError::OperationNotAvailable {
        contract: name.contract.clone(),
        operation: name.operation.clone(),
    }
}

/// Cancels a claimed request when the wait for its reply is dropped.
struct CancelOnDrop(CorrelationRequestContext);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.cancel();
    }
}

/// Drives receives for workflow instances.
pub struct ReceiveOrchestrator {
    bookmarks: Arc<dyn BookmarkHost>,
    transactions: Option<Arc<dyn TransactionFactory>>,
}

impl fmt::Debug for ReceiveOrchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReceiveOrchestrator")
            .field("transactions", &self.transactions.is_some())
            .finish()
    }
}

impl ReceiveOrchestrator {
    /// Orchestrator suspending on `bookmarks`; `transactions` creates fresh
    /// transactions for receives that require one.
    pub fn new(
        bookmarks: Arc<dyn BookmarkHost>,
        transactions: Option<Arc<dyn TransactionFactory>>,
    ) -> Self {
        Self {
            bookmarks,
            transactions,
        }
    }

    /// Suspend until a message for `definition` arrives for this instance.
    ///
    /// Initializers run against the delivered message. For two-way
    /// operations the response context is registered on the request/reply
    /// (or ambient) handle for the paired send-reply. Any failure after the
    /// message arrived answers the sender with a fault.
    #[instrument(
        skip_all,
        fields(
            contract = %definition.contract.name,
            operation = %definition.operation,
            instance_id = %scope.instance_id()
        )
    )]
    pub async fn receive(
        &self,
        definition: &ReceiveMessage,
        request: ReceiveRequest,
        scope: &ExecutionScope,
    ) -> Result<Delivery> {
        let ReceiveRequest {
            correlates_with,
            initializers,
        } = request;

        let request_reply = resolve_request_reply_handle(
            &definition.operation,
            definition.is_one_way,
            &initializers,
            scope.ambient_handle(),
        )?;
        let instance = scope.instance_key().cloned().ok_or_else(|| {
            TetherError::validation(
                "instance_key",
                "a receive needs the key its instance waits under",
            )
        })?;
        if definition.requires_transaction && self.transactions.is_none() {
            return Err(TetherError::validation(
                "transaction",
                format!(
                    "operation '{}' requires a transaction but no transaction factory is configured",
                    definition.operation
                ),
            ));
        }
        if let Some(key) = correlates_with.as_ref().and_then(CorrelationHandle::instance_key) {
            self.bookmarks.associate_key(&instance, &key);
        }

        enter(ReceiveState::WaitingForMessage);
        let receiver = self
            .bookmarks
            .create_bookmark(&instance, definition.bookmark_name());
        let mut delivery = receiver.await.map_err(|_| TetherError::Cancelled)?;

        if let Err(error) = self.accept(
            definition,
            &instance,
            &initializers,
            request_reply.as_ref(),
            &mut delivery,
        ) {
            if let Some(response) = &delivery.response_context {
                response.send_fault(error.clone());
            }
            enter(ReceiveState::Faulted);
            return Err(error);
        }

        delivery.transaction_guard.complete();
        enter(ReceiveState::Completed);
        Ok(delivery)
    }

    fn accept(
        &self,
        definition: &ReceiveMessage,
        instance: &InstanceKey,
        initializers: &[CorrelationInitializer],
        request_reply: Option<&CorrelationHandle>,
        delivery: &mut Delivery,
    ) -> Result<()> {
        enter(ReceiveState::ResolvingCorrelation);
        for key in initialize_correlations(&delivery.message, initializers)? {
            self.bookmarks.associate_key(instance, &key);
        }

        if let (Some(response), Some(handle)) = (&delivery.response_context, request_reply)
            && !handle.try_register_response_context(response.clone())
        {
            return Err(TetherError::invalid_operation(format!(
                "handle '{}' already holds an open response",
                handle.name()
            )));
        }

        if definition.requires_transaction && delivery.transaction.is_none() {
            enter(ReceiveState::EnteringTransaction);
            if let Some(factory) = &self.transactions {
                let transaction = factory.create();
                debug!(transaction_id = %transaction.id(), "Created transaction for receive");
                delivery.transaction = Some(transaction);
            }
        }
        Ok(())
    }

    /// Wait for the reply to the request a two-way send registered.
    ///
    /// Returns immediately when the reply already arrived. Dropping the
    /// returned future cancels the pending request. Query, context and
    /// callback initializers run against the reply; query initializers also
    /// accept replies that carry no action.
    #[instrument(skip_all, fields(instance_id = %scope.instance_id()))]
    pub async fn receive_reply(
        &self,
        request: ReceiveRequest,
        scope: &ExecutionScope,
    ) -> Result<Message> {
        let ReceiveRequest {
            correlates_with,
            initializers,
        } = request;

        let handle = correlates_with
            .as_ref()
            .or(scope.ambient_handle())
            .ok_or_else(|| {
                TetherError::validation(
                    "correlates_with",
                    "receiving a reply needs a request/reply handle or an ambient handle",
                )
            })?;
        let context = handle.try_acquire_request_context().ok_or_else(|| {
            TetherError::invalid_operation(format!(
                "handle '{}' has no pending request",
                handle.name()
            ))
        })?;
        let _cancel = CancelOnDrop(context.clone());

        let reply = match context.try_get_reply() {
            Some(outcome) => {
                debug!("Reply already available");
                outcome
            }
            None => {
                enter(ReceiveState::AwaitingReply);
                context.wait_for_reply().await
            }
        }?;

        enter(ReceiveState::Finalizing);
        let initializers: Vec<_> = initializers
            .into_iter()
            .map(CorrelationInitializer::for_reply)
            .collect();
        initialize_correlations(&reply, &initializers)?;
        enter(ReceiveState::Completed);
        Ok(reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bookmark::InMemoryBookmarkHost;
    use uuid::Uuid;

    fn contract() -> Arc<ContractDescription> {
        Arc::new(
            ContractDescription::new("http://tempuri.org", "IBank")
                .with_operation("Deposit", true)
                .with_operation("Balance", false),
        )
    }

    #[test]
    fn test_default_reply_action() {
        let receive = ReceiveMessage::new(contract(), "Balance").unwrap();
        assert!(!receive.is_one_way());
        assert_eq!(
            receive.reply_action(),
            "http://tempuri.org/IBank/BalanceResponse"
        );
        assert_eq!(receive.bookmark_name().to_string(), "IBank|Balance");
    }

    #[tokio::test]
    async fn test_unregistered_operation_is_not_available() {
        let dispatcher = ReceiveDispatcher::new(
            Arc::new(InMemoryBookmarkHost::new()),
            Duration::from_millis(1),
        );
        let err = dispatcher
            .dispatch("IBank", "Deposit", Message::new("urn:deposit"), None)
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "OPERATION_NOT_AVAILABLE");
    }

    #[tokio::test]
    async fn test_receive_without_instance_key_fails() {
        let orchestrator =
            ReceiveOrchestrator::new(Arc::new(InMemoryBookmarkHost::new()), None);
        let receive = ReceiveMessage::new(contract(), "Deposit").unwrap();

        let err = orchestrator
            .receive(&receive, ReceiveRequest::new(), &ExecutionScope::new(Uuid::new_v4()))
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "VALIDATION_ERROR");
    }

    #[tokio::test]
    async fn test_two_way_receive_without_handle_fails_fast() {
        let orchestrator =
            ReceiveOrchestrator::new(Arc::new(InMemoryBookmarkHost::new()), None);
        let receive = ReceiveMessage::new(contract(), "Balance").unwrap();
        let scope = ExecutionScope::new(Uuid::new_v4())
            .with_instance_key(InstanceKey::new(Uuid::new_v4()));

        let err = orchestrator
            .receive(&receive, ReceiveRequest::new(), &scope)
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "VALIDATION_ERROR");
    }

    #[tokio::test]
    async fn test_receive_reply_returns_available_reply() {
        let orchestrator =
            ReceiveOrchestrator::new(Arc::new(InMemoryBookmarkHost::new()), None);
        let handle = CorrelationHandle::new("rr");
        let context = CorrelationRequestContext::new();
        assert!(handle.try_register_request_context(context.clone()));
        context.reply(Message::new("urn:reply"));

        let reply = orchestrator
            .receive_reply(
                ReceiveRequest::new().correlates_with(handle.clone()),
                &ExecutionScope::new(Uuid::new_v4()),
            )
            .await
            .unwrap();
        assert_eq!(reply.action(), Some("urn:reply"));
        assert!(handle.try_acquire_request_context().is_none());
    }

    #[tokio::test]
    async fn test_dropped_reply_wait_cancels_request() {
        let orchestrator =
            ReceiveOrchestrator::new(Arc::new(InMemoryBookmarkHost::new()), None);
        let handle = CorrelationHandle::new("rr");
        let context = CorrelationRequestContext::new();
        assert!(handle.try_register_request_context(context.clone()));

        let scope = ExecutionScope::new(Uuid::new_v4());
        let wait = orchestrator.receive_reply(ReceiveRequest::new().correlates_with(handle), &scope);
        let timed_out = tokio::time::timeout(Duration::from_millis(10), wait).await;

        assert!(timed_out.is_err());
        assert!(matches!(
            context.try_get_reply(),
            Some(Err(TetherError::Cancelled))
        ));
    }
}
