// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Message model and the correlation-related message properties.
//!
//! Framing and serialization belong to the transport; a [`Message`] here is
//! an action, a header map, a JSON body and a set of typed properties that
//! the correlation engine reads and writes.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::TetherError;
use crate::key::InstanceKey;
use crate::synchronizer::CorrelationSynchronizer;

/// Context entry holding the remote-assigned instance identifier.
pub const INSTANCE_ID_CONTEXT_KEY: &str = "instanceId";

/// Context dictionary exchanged with the remote party.
pub type ContextDictionary = BTreeMap<String, String>;

/// A message travelling through the send or receive path.
#[derive(Debug, Clone, Default)]
pub struct Message {
    action: Option<String>,
    headers: BTreeMap<String, String>,
    body: serde_json::Value,
    is_fault: bool,
    properties: MessageProperties,
}

/// Typed properties attached to a message.
#[derive(Debug, Clone, Default)]
pub struct MessageProperties {
    /// Instance keys computed for the message.
    pub correlation: Option<CorrelationMessageProperty>,
    /// Context dictionary for context-exchange correlation.
    pub context: Option<ContextProperty>,
    /// Duplex callback context.
    pub callback_context: Option<CallbackContextProperty>,
    /// Present when the channel stack must call back before transmitting.
    pub correlation_callback: Option<CorrelationCallbackProperty>,
}

impl Message {
    /// Message with the given action and a null body.
    pub fn new(action: impl Into<String>) -> Self {
        Self {
            action: Some(action.into()),
            ..Self::default()
        }
    }

    /// Message without an action header.
    pub fn without_action() -> Self {
        Self::default()
    }

    /// Fault message carrying a code and reason.
    pub fn fault(code: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            action: None,
            body: serde_json::json!({ "code": code.into(), "reason": reason.into() }),
            is_fault: true,
            ..Self::default()
        }
    }

    /// Builder: add a header.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Builder: set the body.
    pub fn with_body(mut self, body: serde_json::Value) -> Self {
        self.body = body;
        self
    }

    /// The action header, if any.
    pub fn action(&self) -> Option<&str> {
        self.action.as_deref()
    }

    /// The action used for filter matching; a missing action matches `""`.
    pub fn resolved_action(&self) -> &str {
        self.action.as_deref().unwrap_or("")
    }

    /// Replace the action.
    pub fn set_action(&mut self, action: Option<String>) {
        self.action = action;
    }

    /// A header value.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    /// All headers.
    pub fn headers(&self) -> &BTreeMap<String, String> {
        &self.headers
    }

    /// The body.
    pub fn body(&self) -> &serde_json::Value {
        &self.body
    }

    /// Whether this message is a fault.
    pub fn is_fault(&self) -> bool {
        self.is_fault
    }

    /// The fault this message carries, as an error.
    pub fn to_fault_error(&self) -> Option<TetherError> {
        if !self.is_fault {
            return None;
        }
        let field = |name: &str| {
            self.body
                .get(name)
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string()
        };
        Some(TetherError::Fault {
            code: field("code"),
            reason: field("reason"),
        })
    }

    /// Message properties.
    pub fn properties(&self) -> &MessageProperties {
        &self.properties
    }

    /// Mutable message properties.
    pub fn properties_mut(&mut self) -> &mut MessageProperties {
        &mut self.properties
    }

    /// The context dictionary, if the message carries one.
    pub fn context(&self) -> Option<&ContextDictionary> {
        self.properties.context.as_ref().map(|c| &c.context)
    }

    /// Add a transient key to the correlation property, creating it if needed.
    ///
    /// An existing primary key is preserved.
    pub fn add_transient_key(&mut self, key: InstanceKey) {
        match self.properties.correlation.as_mut() {
            Some(property) => property.transient_keys.push(key),
            None => {
                self.properties.correlation = Some(CorrelationMessageProperty {
                    correlation_key: InstanceKey::invalid(),
                    additional_keys: Vec::new(),
                    transient_keys: vec![key],
                });
            }
        }
    }
}

/// Instance keys attached to a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CorrelationMessageProperty {
    /// Primary key; the invalid sentinel when only transient keys are set.
    pub correlation_key: InstanceKey,
    /// Keys produced by additional query sets.
    pub additional_keys: Vec<InstanceKey>,
    /// Short-lived keys such as request/reply links.
    pub transient_keys: Vec<InstanceKey>,
}

impl CorrelationMessageProperty {
    /// Property with just a primary key.
    pub fn new(correlation_key: InstanceKey) -> Self {
        Self {
            correlation_key,
            additional_keys: Vec::new(),
            transient_keys: Vec::new(),
        }
    }

    /// The request/reply transient key, if one was added.
    pub fn request_reply_key(&self) -> Option<&InstanceKey> {
        self.transient_keys.iter().find(|k| k.is_request_reply())
    }
}

/// Context dictionary property.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextProperty {
    /// Context entries.
    pub context: ContextDictionary,
}

impl ContextProperty {
    /// Property wrapping the given dictionary.
    pub fn new(context: ContextDictionary) -> Self {
        Self { context }
    }

    /// The remote-assigned instance identifier.
    pub fn instance_id(&self) -> Option<&str> {
        self.context.get(INSTANCE_ID_CONTEXT_KEY).map(String::as_str)
    }
}

/// Duplex callback context: where and how the remote party calls back.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallbackContextProperty {
    /// Address the callback should be sent to.
    pub listen_address: Option<String>,
    /// Context the callback must carry.
    pub context: ContextDictionary,
}

/// Asks the channel stack to hand the message back to the workflow for
/// correlation before transmitting it.
#[derive(Clone)]
pub struct CorrelationCallbackProperty {
    /// Names of the data items the channel stack supplies.
    pub send_names: Vec<String>,
    /// Latch shared with the send orchestrator.
    pub synchronizer: Arc<CorrelationSynchronizer>,
}

impl std::fmt::Debug for CorrelationCallbackProperty {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CorrelationCallbackProperty")
            .field("send_names", &self.send_names)
            .field("synchronizer", &"...")
            .finish()
    }
}
