// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Execution scope passed into every orchestrated operation.

use std::fmt;
use std::sync::Arc;

use uuid::Uuid;

use crate::error::Result;
use crate::handle::CorrelationHandle;
use crate::key::InstanceKey;
use crate::message::Message;
use crate::transaction::Transaction;

/// Hook invoked on every outbound message after the channel is populated.
pub trait SendMessageCallback: Send + Sync {
    /// Inspect or amend the outgoing message.
    fn on_send_message(&self, message: &mut Message, instance_id: Uuid) -> Result<()>;
}

/// What the surrounding workflow activity makes available to a send or receive.
///
/// Nothing is looked up ambiently; the workflow host builds one of these per
/// activity execution and hands it to the orchestrator.
#[derive(Clone, Default)]
pub struct ExecutionScope {
    instance_id: Uuid,
    instance_key: Option<InstanceKey>,
    ambient_handle: Option<CorrelationHandle>,
    transaction: Option<Arc<dyn Transaction>>,
    e2e_trace_id: Option<Uuid>,
    send_callbacks: Vec<Arc<dyn SendMessageCallback>>,
}

impl fmt::Debug for ExecutionScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionScope")
            .field("instance_id", &self.instance_id)
            .field("instance_key", &self.instance_key)
            .field("ambient_handle", &self.ambient_handle)
            .field("transaction", &self.transaction.as_ref().map(|t| t.id()))
            .field("e2e_trace_id", &self.e2e_trace_id)
            .field("send_callbacks", &self.send_callbacks.len())
            .finish()
    }
}

impl ExecutionScope {
    /// Scope for the given workflow instance.
    pub fn new(instance_id: Uuid) -> Self {
        Self {
            instance_id,
            ..Self::default()
        }
    }

    /// Builder: key under which the instance's receives wait.
    pub fn with_instance_key(mut self, key: InstanceKey) -> Self {
        self.instance_key = Some(key);
        self
    }

    /// Builder: ambient correlation handle.
    pub fn with_ambient_handle(mut self, handle: CorrelationHandle) -> Self {
        self.ambient_handle = Some(handle);
        self
    }

    /// Builder: ambient transaction.
    pub fn with_transaction(mut self, transaction: Arc<dyn Transaction>) -> Self {
        self.transaction = Some(transaction);
        self
    }

    /// Builder: end-to-end trace id.
    pub fn with_e2e_trace_id(mut self, id: Uuid) -> Self {
        self.e2e_trace_id = Some(id);
        self
    }

    /// Builder: register a send callback.
    pub fn with_send_callback(mut self, callback: Arc<dyn SendMessageCallback>) -> Self {
        self.send_callbacks.push(callback);
        self
    }

    /// Workflow instance id.
    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    /// Key under which the instance's receives wait.
    pub fn instance_key(&self) -> Option<&InstanceKey> {
        self.instance_key.as_ref()
    }

    /// Ambient correlation handle.
    pub fn ambient_handle(&self) -> Option<&CorrelationHandle> {
        self.ambient_handle.as_ref()
    }

    /// Ambient transaction.
    pub fn transaction(&self) -> Option<&Arc<dyn Transaction>> {
        self.transaction.as_ref()
    }

    /// End-to-end trace id.
    pub fn e2e_trace_id(&self) -> Option<Uuid> {
        self.e2e_trace_id
    }

    /// Registered send callbacks.
    pub fn send_callbacks(&self) -> &[Arc<dyn SendMessageCallback>] {
        &self.send_callbacks
    }
}
