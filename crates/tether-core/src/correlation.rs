// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Correlation engine: applies initializers to messages and resolves the
//! instance key an inbound message belongs to.

use tracing::debug;

use crate::error::{Result, TetherError};
use crate::handle::{CorrelationHandle, CorrelationInitializer, explicit_request_reply_handle};
use crate::key::InstanceKey;
use crate::message::Message;
use crate::query::CorrelationKeyCalculator;

/// Pick the handle that carries request/reply state for an operation.
///
/// One-way operations must not name a request/reply handle. Two-way
/// operations use the explicit initializer target, falling back to the
/// ambient handle, and fail when neither exists. Both checks run before any
/// I/O.
pub fn resolve_request_reply_handle(
    operation: &str,
    is_one_way: bool,
    initializers: &[CorrelationInitializer],
    ambient: Option<&CorrelationHandle>,
) -> Result<Option<CorrelationHandle>> {
    let explicit = explicit_request_reply_handle(initializers);

    if is_one_way {
        if explicit.is_some() {
            return Err(TetherError::validation(
                "correlation_initializers",
                format!(
                    "one-way operation '{operation}' cannot use a request/reply correlation initializer"
                ),
            ));
        }
        return Ok(None);
    }

    match explicit.or(ambient) {
        Some(handle) => Ok(Some(handle.clone())),
        None => Err(TetherError::validation(
            "correlation_initializers",
            format!(
                "two-way operation '{operation}' needs a request/reply correlation handle or an ambient handle"
            ),
        )),
    }
}

/// Run query, context and callback initializers against a message.
///
/// Request/reply initializers are handled by the orchestrators. Returns the
/// keys that were bound so the caller can associate them with the instance.
pub fn initialize_correlations(
    message: &Message,
    initializers: &[CorrelationInitializer],
) -> Result<Vec<InstanceKey>> {
    let mut keys = Vec::new();

    for initializer in initializers {
        match initializer {
            CorrelationInitializer::RequestReply(_) => {}
            CorrelationInitializer::Query { handle, calculator } => {
                let calculated = calculator.calculate(message)?.ok_or_else(|| {
                    TetherError::InvalidInstanceKey(format!(
                        "no correlation query in scope '{}' matches action '{}'",
                        calculator.scope_name(),
                        message.resolved_action()
                    ))
                })?;
                debug!(handle = handle.name(), key = %calculated.key, "Query correlation initialized");
                handle.initialize_key(calculated.key.clone());
                keys.push(calculated.key);
                keys.extend(calculated.additional);
            }
            CorrelationInitializer::Context(handle) => {
                let Some(context) = message.properties().context.clone() else {
                    continue;
                };
                if let Some(instance_id) = context.instance_id() {
                    let key = InstanceKey::parse(instance_id)?;
                    debug!(handle = handle.name(), key = %key, "Context correlation initialized");
                    handle.initialize_key(key.clone());
                    keys.push(key);
                }
                handle.set_context(Some(context));
            }
            CorrelationInitializer::Callback(handle) => {
                if let Some(callback) = message.properties().callback_context.clone() {
                    handle.set_callback_context(Some(callback));
                }
            }
        }
    }

    Ok(keys)
}

/// Work out which instance an inbound message belongs to.
///
/// Keys attached by the transport win, then the remote-assigned instance id
/// in the context, then the endpoint's correlation queries.
pub fn resolve_instance_key(
    message: &Message,
    calculator: Option<&CorrelationKeyCalculator>,
) -> Result<Option<InstanceKey>> {
    if let Some(property) = &message.properties().correlation {
        if property.correlation_key.is_valid() {
            return Ok(Some(property.correlation_key.clone()));
        }
    }

    if let Some(instance_id) = message
        .properties()
        .context
        .as_ref()
        .and_then(|c| c.instance_id())
    {
        return InstanceKey::parse(instance_id).map(Some);
    }

    match calculator {
        Some(calculator) => Ok(calculator.calculate(message)?.map(|keys| keys.key)),
        None => Ok(None),
    }
}
