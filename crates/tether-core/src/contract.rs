// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Contract and operation metadata.
//!
//! Descriptions are produced by contract inference outside this crate and are
//! consumed here as immutable values. The only logic this module owns is the
//! default action rule and the shape comparison used by the factory cache.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Direction of a message relative to the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageDirection {
    /// Request sent to the service.
    Input,
    /// Reply sent by the service.
    Output,
}

/// Message protection requirement.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProtectionLevel {
    /// No protection.
    #[default]
    None,
    /// Signed.
    Sign,
    /// Encrypted and signed.
    EncryptAndSign,
}

/// Whether the contract requires a session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionMode {
    /// Sessions allowed but not required.
    #[default]
    Allowed,
    /// A session is required.
    Required,
    /// Sessions are not allowed.
    NotAllowed,
}

/// Transaction flow requirement of an operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransactionFlow {
    /// Transactions never flow.
    #[default]
    NotAllowed,
    /// A transaction may flow.
    Allowed,
    /// A transaction must flow.
    Mandatory,
}

/// One message of an operation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageDescription {
    /// Action string.
    pub action: String,
    /// Direction.
    pub direction: MessageDirection,
}

/// One operation of a contract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationDescription {
    /// Operation name.
    pub name: String,
    /// One-way operations have no reply message.
    pub is_one_way: bool,
    /// Protection level.
    pub protection_level: ProtectionLevel,
    /// Transaction flow requirement.
    pub transaction_flow: TransactionFlow,
    /// Messages in order: input first, then output for two-way operations.
    pub messages: Vec<MessageDescription>,
    /// Declared fault names.
    #[serde(default)]
    pub faults: Vec<String>,
}

impl OperationDescription {
    /// The request action.
    pub fn request_action(&self) -> Option<&str> {
        self.message(MessageDirection::Input)
    }

    /// The reply action; `None` for one-way operations.
    pub fn reply_action(&self) -> Option<&str> {
        self.message(MessageDirection::Output)
    }

    fn message(&self, direction: MessageDirection) -> Option<&str> {
        self.messages
            .iter()
            .find(|m| m.direction == direction)
            .map(|m| m.action.as_str())
    }

    fn is_equivalent(&self, other: &Self) -> bool {
        self.name == other.name
            && self.protection_level == other.protection_level
            && self.is_one_way == other.is_one_way
            && self.transaction_flow == other.transaction_flow
            && self.messages == other.messages
    }
}

/// Immutable description of a service contract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractDescription {
    /// Contract name.
    pub name: String,
    /// Contract namespace.
    pub namespace: String,
    /// Name used in endpoint configuration.
    pub configuration_name: String,
    /// Protection level.
    pub protection_level: ProtectionLevel,
    /// Session requirement.
    pub session_mode: SessionMode,
    /// Declared contract type, absent for inferred contracts.
    pub contract_type: Option<String>,
    /// Number of contract behaviors attached.
    pub behavior_count: usize,
    /// Operations.
    pub operations: Vec<OperationDescription>,
}

impl ContractDescription {
    /// Empty contract in the given namespace.
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            configuration_name: name.clone(),
            name,
            namespace: namespace.into(),
            protection_level: ProtectionLevel::None,
            session_mode: SessionMode::Allowed,
            contract_type: None,
            behavior_count: 0,
            operations: Vec::new(),
        }
    }

    /// Builder: add an operation with default actions.
    pub fn with_operation(mut self, name: &str, is_one_way: bool) -> Self {
        self.add_operation(name, is_one_way, TransactionFlow::NotAllowed);
        self
    }

    /// Builder: add a two-way operation that accepts flowed transactions.
    pub fn with_transacted_operation(mut self, name: &str, flow: TransactionFlow) -> Self {
        self.add_operation(name, false, flow);
        self
    }

    fn add_operation(&mut self, name: &str, is_one_way: bool, transaction_flow: TransactionFlow) {
        let mut messages = vec![MessageDescription {
            action: default_action(&self.namespace, &self.name, name, MessageDirection::Input),
            direction: MessageDirection::Input,
        }];
        if !is_one_way {
            messages.push(MessageDescription {
                action: default_action(&self.namespace, &self.name, name, MessageDirection::Output),
                direction: MessageDirection::Output,
            });
        }
        self.operations.push(OperationDescription {
            name: name.to_string(),
            is_one_way,
            protection_level: self.protection_level,
            transaction_flow,
            messages,
            faults: Vec::new(),
        });
    }

    /// Look up an operation by name.
    pub fn operation(&self, name: &str) -> Option<&OperationDescription> {
        self.operations.iter().find(|op| op.name == name)
    }

    /// Structural comparison used by the factory cache key.
    ///
    /// Operations are compared by name regardless of order; messages within
    /// an operation are compared in order.
    pub fn is_equivalent(&self, other: &Self) -> bool {
        if self.name != other.name
            || self.namespace != other.namespace
            || self.configuration_name != other.configuration_name
            || self.protection_level != other.protection_level
            || self.session_mode != other.session_mode
            || self.contract_type != other.contract_type
            || self.behavior_count != other.behavior_count
            || self.operations.len() != other.operations.len()
        {
            return false;
        }

        let theirs: HashMap<&str, &OperationDescription> = other
            .operations
            .iter()
            .map(|op| (op.name.as_str(), op))
            .collect();

        self.operations.iter().all(|op| {
            theirs
                .get(op.name.as_str())
                .is_some_and(|other_op| op.is_equivalent(other_op))
        })
    }
}

/// Default action for an operation message.
///
/// Requests use `{ns}/{contract}/{operation}`, replies append `Response`.
/// The namespace gets a trailing `/` when it lacks one.
pub fn default_action(
    namespace: &str,
    contract: &str,
    operation: &str,
    direction: MessageDirection,
) -> String {
    let separator = if namespace.ends_with('/') { "" } else { "/" };
    let suffix = match direction {
        MessageDirection::Input => "",
        MessageDirection::Output => "Response",
    };
    format!("{namespace}{separator}{contract}/{operation}{suffix}")
}
