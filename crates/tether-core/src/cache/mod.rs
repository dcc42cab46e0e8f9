// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Channel factory and channel caching.
//!
//! ```text
//! SendMessageChannelCache
//!   └─ ObjectCache<FactoryCacheKey, ChannelFactoryReference>   (refcounted, idle/lease eviction)
//!        └─ ChannelFactoryReference
//!             ├─ ChannelFactory                                 (opened once, then shared)
//!             └─ ObjectCache<address, Pool<Channel>>            (one lock per address)
//! ```

pub mod channel_cache;
pub mod factory;
pub mod object_cache;
pub mod pool;

pub use channel_cache::{SendMessageChannelCache, SharedChannelCache};
pub use factory::{ChannelFactoryReference, ChannelPool, FactoryCacheKey};
pub use object_cache::{CacheItem, CacheLease, ChannelCacheSettings, ObjectCache};
pub use pool::Pool;
