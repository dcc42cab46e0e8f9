// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Transport collaborator traits.
//!
//! Synchronous and asynchronous completion are both expressed as futures: a
//! transport that finishes inline simply returns a ready future.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;

use crate::contract::ContractDescription;
use crate::endpoint::Endpoint;
use crate::error::Result;
use crate::message::Message;

/// Lifecycle state of a channel or channel factory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommunicationState {
    /// Built but not opened.
    Created,
    /// Open in progress.
    Opening,
    /// Ready for use.
    Opened,
    /// Close in progress.
    Closing,
    /// Closed.
    Closed,
    /// Broken by a transport error.
    Faulted,
}

impl CommunicationState {
    /// Lowercase name for logging.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Opening => "opening",
            Self::Opened => "opened",
            Self::Closing => "closing",
            Self::Closed => "closed",
            Self::Faulted => "faulted",
        }
    }
}

/// Anything with an open/close/abort lifecycle.
#[async_trait]
pub trait CommunicationObject: Send + Sync {
    /// Current state.
    fn state(&self) -> CommunicationState;

    /// Open.
    async fn open(&self) -> Result<()>;

    /// Graceful close.
    async fn close(&self, timeout: Duration) -> Result<()>;

    /// Immediate teardown; never fails.
    fn abort(&self);
}

/// A transport channel to one remote address.
#[async_trait]
pub trait Channel: CommunicationObject {
    /// Remote address.
    fn remote_address(&self) -> &str;

    /// State of the underlying session binder, for session channels.
    fn binder_state(&self) -> Option<CommunicationState> {
        None
    }

    /// One-way send.
    async fn send(&self, message: Message) -> Result<()>;

    /// Two-way request.
    async fn request(&self, message: Message) -> Result<Message>;
}

/// Creates channels for one contract and binding.
#[async_trait]
pub trait ChannelFactory: CommunicationObject {
    /// New channel to `address`; output-only when `one_way`.
    fn create_channel(&self, address: &str, one_way: bool) -> Result<Arc<dyn Channel>>;
}

/// Builds channel factories for endpoints.
pub trait ChannelFactoryProvider: Send + Sync {
    /// New, unopened factory.
    fn create_factory(
        &self,
        endpoint: &Endpoint,
        contract: &Arc<ContractDescription>,
        one_way: bool,
    ) -> Result<Arc<dyn ChannelFactory>>;
}

/// Whether a pooled channel is still usable.
pub fn is_channel_usable(channel: &dyn Channel) -> bool {
    channel.state() == CommunicationState::Opened
        && channel
            .binder_state()
            .is_none_or(|state| state == CommunicationState::Opened)
}

/// Close gracefully if open, abort otherwise or when closing fails.
///
/// Never returns an error.
pub async fn dispose_communication_object<C>(object: &C, close_timeout: Duration)
where
    C: CommunicationObject + ?Sized,
{
    if object.state() != CommunicationState::Opened {
        object.abort();
        return;
    }

    match tokio::time::timeout(close_timeout, object.close(close_timeout)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            warn!(error = %e, "Close failed, aborting");
            object.abort();
        }
        Err(_) => {
            warn!(timeout_ms = close_timeout.as_millis() as u64, "Close timed out, aborting");
            object.abort();
        }
    }
}
