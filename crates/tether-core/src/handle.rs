// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Correlation handles and initializers.
//!
//! A [`CorrelationHandle`] is the mutable slot a workflow variable points at.
//! Orchestrators receive handles explicitly and write into them through the
//! `try_register_*` operations, which refuse to overwrite an active context
//! instead of silently replacing it.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use uuid::Uuid;

use crate::context::{CorrelationRequestContext, CorrelationResponseContext};
use crate::key::InstanceKey;
use crate::message::{CallbackContextProperty, ContextProperty};
use crate::query::CorrelationKeyCalculator;

/// Bookmark scope a handle is bound to.
///
/// The scope becomes initialized once a conversation key is known; until
/// then the first outbound message of the conversation mints one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CorrelationScope {
    key: Option<InstanceKey>,
}

impl CorrelationScope {
    /// Whether a key is bound.
    pub fn is_initialized(&self) -> bool {
        self.key.is_some()
    }

    /// The bound key.
    pub fn key(&self) -> Option<&InstanceKey> {
        self.key.as_ref()
    }
}

#[derive(Debug, Default)]
struct HandleState {
    request_context: Option<CorrelationRequestContext>,
    response_context: Option<CorrelationResponseContext>,
    instance_key: Option<InstanceKey>,
    transient_instance_key: Option<InstanceKey>,
    callback_context: Option<CallbackContextProperty>,
    context: Option<ContextProperty>,
    e2e_trace_id: Option<Uuid>,
    scope: CorrelationScope,
}

/// Named, shareable correlation slot.
#[derive(Clone)]
pub struct CorrelationHandle {
    name: Arc<str>,
    state: Arc<Mutex<HandleState>>,
}

impl fmt::Debug for CorrelationHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CorrelationHandle")
            .field("name", &self.name)
            .field("initialized", &self.is_initialized())
            .finish()
    }
}

impl CorrelationHandle {
    /// Empty handle.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: Arc::from(name.into()),
            state: Arc::new(Mutex::new(HandleState::default())),
        }
    }

    fn state(&self) -> MutexGuard<'_, HandleState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Handle name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether both values refer to the same slot.
    pub fn same_as(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.state, &other.state)
    }

    /// Claim the pending outbound request for a following reply.
    ///
    /// Returns `None` when no request is pending or it was already claimed.
    pub fn try_acquire_request_context(&self) -> Option<CorrelationRequestContext> {
        self.state().request_context.take()
    }

    /// Record a pending request. Fails while another uncompleted request is held.
    pub fn try_register_request_context(&self, context: CorrelationRequestContext) -> bool {
        let mut state = self.state();
        if state
            .request_context
            .as_ref()
            .is_some_and(|existing| !existing.is_completed())
        {
            return false;
        }
        state.request_context = Some(context);
        true
    }

    /// Record a server response context. Fails while another open one is held.
    pub fn try_register_response_context(&self, context: CorrelationResponseContext) -> bool {
        let mut state = self.state();
        if state
            .response_context
            .as_ref()
            .is_some_and(|existing| !existing.is_completed())
        {
            return false;
        }
        state.response_context = Some(context);
        true
    }

    /// Claim the response context registered by a paired receive.
    pub fn try_acquire_response_context(&self) -> Option<CorrelationResponseContext> {
        let mut state = self.state();
        match state.response_context.take() {
            Some(context) if !context.is_completed() => Some(context),
            _ => None,
        }
    }

    /// The resolved instance key.
    pub fn instance_key(&self) -> Option<InstanceKey> {
        self.state().instance_key.clone()
    }

    /// Bind a resolved key into the handle and its scope.
    pub fn initialize_key(&self, key: InstanceKey) {
        let mut state = self.state();
        if !state.scope.is_initialized() {
            state.scope.key = Some(key.clone());
        }
        state.instance_key = Some(key);
    }

    /// The bookmark scope.
    pub fn scope(&self) -> CorrelationScope {
        self.state().scope.clone()
    }

    /// Bind a key into the scope only.
    pub fn initialize_scope(&self, key: InstanceKey) {
        self.state().scope.key = Some(key);
    }

    /// The transient request/reply key.
    pub fn transient_instance_key(&self) -> Option<InstanceKey> {
        self.state().transient_instance_key.clone()
    }

    /// Replace the transient key.
    pub fn set_transient_instance_key(&self, key: Option<InstanceKey>) {
        self.state().transient_instance_key = key;
    }

    /// The end-to-end trace id.
    pub fn e2e_trace_id(&self) -> Option<Uuid> {
        self.state().e2e_trace_id
    }

    /// Replace the end-to-end trace id.
    pub fn set_e2e_trace_id(&self, id: Option<Uuid>) {
        self.state().e2e_trace_id = id;
    }

    /// The duplex callback context.
    pub fn callback_context(&self) -> Option<CallbackContextProperty> {
        self.state().callback_context.clone()
    }

    /// Replace the callback context.
    pub fn set_callback_context(&self, context: Option<CallbackContextProperty>) {
        self.state().callback_context = context;
    }

    /// The exchanged context.
    pub fn context(&self) -> Option<ContextProperty> {
        self.state().context.clone()
    }

    /// Replace the exchanged context.
    pub fn set_context(&self, context: Option<ContextProperty>) {
        self.state().context = context;
    }

    /// Whether the handle carries enough state for a following operation.
    pub fn is_initialized(&self) -> bool {
        let state = self.state();
        state.request_context.is_some()
            || state.response_context.is_some()
            || state.instance_key.is_some()
            || state.callback_context.is_some()
            || state.context.is_some()
    }
}

/// How a handle gets initialized by a send or receive.
#[derive(Debug, Clone)]
pub enum CorrelationInitializer {
    /// Request/reply link between a send and its paired receive.
    RequestReply(CorrelationHandle),
    /// Key computed by evaluating queries against the message.
    Query {
        /// Target handle.
        handle: CorrelationHandle,
        /// Calculator producing the key.
        calculator: CorrelationKeyCalculator,
    },
    /// Key taken from the exchanged context.
    Context(CorrelationHandle),
    /// Duplex callback context.
    Callback(CorrelationHandle),
}

impl CorrelationInitializer {
    /// The same initializer applied to a reply message.
    pub fn for_reply(self) -> Self {
        match self {
            Self::Query { handle, calculator } => Self::Query {
                handle,
                calculator: calculator.for_reply(),
            },
            other => other,
        }
    }

    /// The handle this initializer writes into.
    pub fn handle(&self) -> &CorrelationHandle {
        match self {
            Self::RequestReply(handle)
            | Self::Context(handle)
            | Self::Callback(handle)
            | Self::Query { handle, .. } => handle,
        }
    }
}

/// The explicit request/reply handle among the initializers, if any.
pub fn explicit_request_reply_handle(
    initializers: &[CorrelationInitializer],
) -> Option<&CorrelationHandle> {
    initializers.iter().find_map(|init| match init {
        CorrelationInitializer::RequestReply(handle) => Some(handle),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_context_single_claim() {
        let handle = CorrelationHandle::new("reply");
        assert!(handle.try_acquire_request_context().is_none());

        let ctx = CorrelationRequestContext::new();
        assert!(handle.try_register_request_context(ctx.clone()));
        assert!(handle.is_initialized());

        let claimed = handle.try_acquire_request_context().unwrap();
        assert!(claimed.same_as(&ctx));
        assert!(handle.try_acquire_request_context().is_none());
    }

    #[test]
    fn test_register_request_twice_fails_until_completed() {
        let handle = CorrelationHandle::new("reply");
        let first = CorrelationRequestContext::new();
        assert!(handle.try_register_request_context(first.clone()));
        assert!(!handle.try_register_request_context(CorrelationRequestContext::new()));

        first.cancel();
        assert!(handle.try_register_request_context(CorrelationRequestContext::new()));
    }

    #[test]
    fn test_register_response_twice_fails() {
        let handle = CorrelationHandle::new("server");
        assert!(handle.try_register_response_context(CorrelationResponseContext::new()));
        assert!(!handle.try_register_response_context(CorrelationResponseContext::new()));

        let acquired = handle.try_acquire_response_context().unwrap();
        assert!(handle.try_acquire_response_context().is_none());
        acquired.send_reply(crate::message::Message::new("urn:r"));
    }

    #[test]
    fn test_initialize_key_binds_scope_once() {
        let handle = CorrelationHandle::new("h");
        assert!(!handle.scope().is_initialized());

        let first = InstanceKey::new(Uuid::new_v4());
        let second = InstanceKey::new(Uuid::new_v4());
        handle.initialize_key(first.clone());
        handle.initialize_key(second.clone());

        assert_eq!(handle.instance_key(), Some(second));
        assert_eq!(handle.scope().key(), Some(&first));
    }

    #[test]
    fn test_transient_and_trace_id_are_rewritable() {
        let handle = CorrelationHandle::new("h");
        handle.set_transient_instance_key(Some(InstanceKey::transient_request_reply()));
        handle.set_transient_instance_key(Some(InstanceKey::transient_request_reply()));
        handle.set_e2e_trace_id(Some(Uuid::new_v4()));
        handle.set_e2e_trace_id(None);

        assert!(handle.transient_instance_key().unwrap().is_request_reply());
        assert!(handle.e2e_trace_id().is_none());
        // Transient state alone does not initialize a handle.
        assert!(!handle.is_initialized());
    }

    #[test]
    fn test_explicit_request_reply_handle() {
        let rr = CorrelationHandle::new("rr");
        let ctx = CorrelationHandle::new("ctx");
        let initializers = vec![
            CorrelationInitializer::Context(ctx),
            CorrelationInitializer::RequestReply(rr.clone()),
        ];
        assert!(explicit_request_reply_handle(&initializers).unwrap().same_as(&rr));
        assert!(explicit_request_reply_handle(&[]).is_none());
    }
}
