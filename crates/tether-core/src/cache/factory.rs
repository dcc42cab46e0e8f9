// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Channel factory references and their cache key.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tracing::{debug, instrument};

use super::object_cache::{CacheLease, ChannelCacheSettings, ObjectCache};
use super::pool::Pool;
use crate::channel::{
    Channel, ChannelFactory, CommunicationState, dispose_communication_object, is_channel_usable,
};
use crate::contract::ContractDescription;
use crate::endpoint::{EndpointIdentity, TokenImpersonationLevel};
use crate::error::Result;
use crate::query::{CorrelationQuery, queries_equivalent};

/// Pool of open channels to one address.
pub type ChannelPool = Mutex<Pool<Arc<dyn Channel>>>;

/// Structural key of the factory cache.
///
/// Two keys are equal when the endpoint identity, impersonation level and
/// one-way flag match, the contracts are equivalent in shape, and the
/// correlation queries are the same regardless of order.
#[derive(Debug, Clone)]
pub struct FactoryCacheKey {
    endpoint: EndpointIdentity,
    impersonation_level: TokenImpersonationLevel,
    one_way: bool,
    contract: Arc<ContractDescription>,
    correlation_queries: Vec<CorrelationQuery>,
}

impl FactoryCacheKey {
    /// Build a key.
    pub fn new(
        endpoint: EndpointIdentity,
        impersonation_level: TokenImpersonationLevel,
        one_way: bool,
        contract: Arc<ContractDescription>,
        correlation_queries: Vec<CorrelationQuery>,
    ) -> Self {
        Self {
            endpoint,
            impersonation_level,
            one_way,
            contract,
            correlation_queries,
        }
    }

    /// Whether factories for this key create output-only channels.
    pub fn is_one_way(&self) -> bool {
        self.one_way
    }

    /// The contract.
    pub fn contract(&self) -> &Arc<ContractDescription> {
        &self.contract
    }
}

impl PartialEq for FactoryCacheKey {
    fn eq(&self, other: &Self) -> bool {
        self.endpoint == other.endpoint
            && self.impersonation_level == other.impersonation_level
            && self.one_way == other.one_way
            && (Arc::ptr_eq(&self.contract, &other.contract)
                || self.contract.is_equivalent(&other.contract))
            && queries_equivalent(&self.correlation_queries, &other.correlation_queries)
    }
}

impl Eq for FactoryCacheKey {}

impl Hash for FactoryCacheKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.contract.name.hash(state);
        self.contract.namespace.hash(state);
        self.endpoint.hash(state);
        self.one_way.hash(state);
    }
}

/// A channel factory plus per-address pools of open channels.
pub struct ChannelFactoryReference {
    key: FactoryCacheKey,
    factory: Arc<dyn ChannelFactory>,
    channel_cache: ObjectCache<String, ChannelPool>,
    pool_capacity: usize,
    close_timeout: Duration,
    // Shared by factory disposal and individual channel disposal so a
    // graceful factory close never races a channel abort.
    dispose_lock: tokio::sync::Mutex<()>,
}

impl fmt::Debug for ChannelFactoryReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelFactoryReference")
            .field("contract", &self.key.contract.name)
            .field("one_way", &self.key.one_way)
            .field("state", &self.factory.state())
            .field("pools", &self.channel_cache.len())
            .finish()
    }
}

impl ChannelFactoryReference {
    /// Wrap an unopened factory.
    pub fn new(
        key: FactoryCacheKey,
        factory: Arc<dyn ChannelFactory>,
        channel_settings: ChannelCacheSettings,
        close_timeout: Duration,
    ) -> Self {
        Self {
            key,
            factory,
            channel_cache: ObjectCache::new(channel_settings),
            pool_capacity: channel_settings.max_items,
            close_timeout,
            dispose_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// The cache key this reference was built for.
    pub fn key(&self) -> &FactoryCacheKey {
        &self.key
    }

    /// Factory state.
    pub fn state(&self) -> CommunicationState {
        self.factory.state()
    }

    /// Only a freshly created factory needs opening.
    pub fn needs_open(&self) -> bool {
        self.factory.state() == CommunicationState::Created
    }

    /// Open the factory.
    pub async fn open(&self) -> Result<()> {
        self.factory.open().await
    }

    /// Limits of the per-address channel pools.
    pub fn channel_settings(&self) -> ChannelCacheSettings {
        self.channel_cache.settings()
    }

    /// Abort the factory without closing its pooled channels.
    pub fn abort(&self) {
        self.factory.abort();
    }

    /// Number of per-address pools currently cached.
    pub fn pool_count(&self) -> usize {
        self.channel_cache.len()
    }

    /// Take a channel to `address` from its pool, or create one.
    ///
    /// Pooled channels that are no longer open, or whose session binder is
    /// no longer open, are aborted and replaced. The returned pool lease
    /// must be handed back to [`return_channel`](Self::return_channel).
    #[instrument(skip(self), fields(contract = %self.key.contract.name))]
    pub async fn take_channel(
        &self,
        address: &str,
    ) -> Result<(Arc<dyn Channel>, CacheLease<ChannelPool>)> {
        let capacity = self.pool_capacity;
        let pool = self
            .channel_cache
            .take_or_create(address.to_string(), || Mutex::new(Pool::new(capacity)));

        let pooled = pool
            .value()
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if let Some(channel) = pooled {
            if is_channel_usable(channel.as_ref()) {
                debug!("Reusing pooled channel");
                return Ok((channel, pool));
            }
            debug!(state = channel.state().as_str(), "Aborting stale pooled channel");
            let _guard = self.dispose_lock.lock().await;
            channel.abort();
        }

        let channel = self.factory.create_channel(address, self.key.one_way)?;
        debug!("Created channel");
        Ok((channel, pool))
    }

    /// Give a channel back after a send.
    ///
    /// Channels that are no longer open, or that do not fit in the pool, are
    /// disposed, unless the factory itself is already closing.
    pub async fn return_channel(&self, channel: Arc<dyn Channel>, pool: CacheLease<ChannelPool>) {
        let rejected = if channel.state() == CommunicationState::Opened {
            pool.value()
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .try_return(channel)
                .err()
        } else {
            Some(channel)
        };

        if let Some(channel) = rejected {
            let _guard = self.dispose_lock.lock().await;
            if !self.factory_closing() {
                dispose_communication_object(channel.as_ref(), self.close_timeout).await;
            }
        }

        if let Some(orphaned) = pool.release() {
            self.dispose_channel_pool(&orphaned).await;
        }
    }

    /// Abort a channel that hit a transport fault instead of pooling it.
    pub async fn discard_channel(&self, channel: Arc<dyn Channel>, pool: CacheLease<ChannelPool>) {
        debug!(address = channel.remote_address(), "Aborting faulted channel");
        {
            let _guard = self.dispose_lock.lock().await;
            channel.abort();
        }
        if let Some(orphaned) = pool.release() {
            self.dispose_channel_pool(&orphaned).await;
        }
    }

    /// Dispose every channel in a pool evicted from the channel cache.
    pub async fn dispose_channel_pool(&self, pool: &ChannelPool) {
        let channels = pool.lock().unwrap_or_else(PoisonError::into_inner).drain();
        for channel in channels {
            let _guard = self.dispose_lock.lock().await;
            if !self.factory_closing() {
                dispose_communication_object(channel.as_ref(), self.close_timeout).await;
            }
        }
    }

    /// Evict idle channel pools and dispose their channels.
    pub async fn sweep_channels(&self) {
        for pool in self.channel_cache.sweep() {
            self.dispose_channel_pool(&pool).await;
        }
    }

    /// Dispose every pool, then the factory.
    ///
    /// Errors during close are absorbed by aborting.
    #[instrument(skip(self), fields(contract = %self.key.contract.name))]
    pub async fn dispose(&self) {
        for pool in self.channel_cache.dispose_all() {
            self.dispose_channel_pool(&pool).await;
        }
        let _guard = self.dispose_lock.lock().await;
        dispose_communication_object(self.factory.as_ref(), self.close_timeout).await;
        debug!("Channel factory disposed");
    }

    fn factory_closing(&self) -> bool {
        matches!(
            self.factory.state(),
            CommunicationState::Closing | CommunicationState::Closed
        )
    }
}
