// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The host-owned channel cache shared by all sends.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use super::factory::{ChannelFactoryReference, FactoryCacheKey};
use super::object_cache::{ChannelCacheSettings, ObjectCache};
use crate::config::Config;

/// Factory cache plus the settings sends apply to it.
///
/// Owned by the messaging host and passed to the send orchestrator; there is
/// no process-wide instance.
#[derive(Debug)]
pub struct SendMessageChannelCache {
    factory_cache: ObjectCache<FactoryCacheKey, ChannelFactoryReference>,
    channel_settings: ChannelCacheSettings,
    allow_unsafe_caching: bool,
    close_timeout: Duration,
}

impl SendMessageChannelCache {
    /// New empty cache.
    pub fn new(
        factory_settings: ChannelCacheSettings,
        channel_settings: ChannelCacheSettings,
        allow_unsafe_caching: bool,
    ) -> Self {
        Self {
            factory_cache: ObjectCache::new(factory_settings),
            channel_settings,
            allow_unsafe_caching,
            close_timeout: Config::default().close_timeout,
        }
    }

    /// Cache configured from [`Config`].
    pub fn from_config(config: &Config) -> Self {
        Self {
            close_timeout: config.close_timeout,
            ..Self::new(
                config.factory_cache,
                config.channel_cache,
                config.allow_unsafe_caching,
            )
        }
    }

    /// The shared factory cache.
    pub fn factory_cache(&self) -> &ObjectCache<FactoryCacheKey, ChannelFactoryReference> {
        &self.factory_cache
    }

    /// Channel pool settings for cached factories.
    pub fn channel_settings(&self) -> ChannelCacheSettings {
        self.channel_settings
    }

    /// Whether configuration-resolved endpoints may share the cache.
    pub fn allow_unsafe_caching(&self) -> bool {
        self.allow_unsafe_caching
    }

    /// Graceful close timeout for disposal.
    pub fn close_timeout(&self) -> Duration {
        self.close_timeout
    }

    /// Evict idle factories and idle channel pools.
    pub async fn sweep(&self) {
        let evicted = self.factory_cache.sweep();
        if !evicted.is_empty() {
            debug!(count = evicted.len(), "Evicting idle channel factories");
        }
        for factory in evicted {
            factory.dispose().await;
        }
        for factory in self.factory_cache.values() {
            factory.sweep_channels().await;
        }
    }

    /// Dispose every cached factory and its channels.
    ///
    /// Factories still leased by in-flight sends are disposed when those
    /// sends release them.
    pub async fn dispose_all(&self) {
        let factories = self.factory_cache.dispose_all();
        info!(count = factories.len(), "Disposing channel cache");
        for factory in factories {
            factory.dispose().await;
        }
    }
}

impl Default for SendMessageChannelCache {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// Shared handle to the channel cache.
pub type SharedChannelCache = Arc<SendMessageChannelCache>;
