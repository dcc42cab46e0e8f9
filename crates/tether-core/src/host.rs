// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable messaging host.
//!
//! [`MessagingHost`] owns the channel cache and wires the send and receive
//! orchestrators to it, so nothing in the crate is process-global.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use tether_core::host::MessagingHost;
//!
//! let host = MessagingHost::builder()
//!     .config(tether_core::Config::from_env()?)
//!     .channel_factory_provider(Arc::new(MyTransport::new()))
//!     .bookmark_host(Arc::new(MyWorkflowEngine::new()))
//!     .build()?
//!     .start()
//!     .await?;
//!
//! host.send().send(&definition, request, &scope).await?;
//!
//! // Drains the cache: every cached factory and channel is closed.
//! host.shutdown().await?;
//! ```

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::bookmark::BookmarkHost;
use crate::cache::{SendMessageChannelCache, SharedChannelCache};
use crate::channel::ChannelFactoryProvider;
use crate::config::Config;
use crate::receive::{ReceiveDispatcher, ReceiveOrchestrator};
use crate::send::SendOrchestrator;
use crate::transaction::TransactionFactory;

/// Builder for creating a [`MessagingHost`].
#[derive(Default)]
pub struct MessagingHostBuilder {
    config: Config,
    provider: Option<Arc<dyn ChannelFactoryProvider>>,
    bookmarks: Option<Arc<dyn BookmarkHost>>,
    transactions: Option<Arc<dyn TransactionFactory>>,
}

impl std::fmt::Debug for MessagingHostBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessagingHostBuilder")
            .field("config", &self.config)
            .field("provider", &self.provider.as_ref().map(|_| "..."))
            .field("bookmarks", &self.bookmarks.as_ref().map(|_| "..."))
            .field("transactions", &self.transactions.as_ref().map(|_| "..."))
            .finish()
    }
}

impl MessagingHostBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the configuration.
    ///
    /// Default: [`Config::default`]
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Set the transport's channel factory provider (required).
    pub fn channel_factory_provider(mut self, provider: Arc<dyn ChannelFactoryProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    /// Set the workflow engine's bookmark host (required).
    pub fn bookmark_host(mut self, bookmarks: Arc<dyn BookmarkHost>) -> Self {
        self.bookmarks = Some(bookmarks);
        self
    }

    /// Set the transaction factory used by receives that require a
    /// transaction when none flowed.
    pub fn transaction_factory(mut self, transactions: Arc<dyn TransactionFactory>) -> Self {
        self.transactions = Some(transactions);
        self
    }

    /// Build the host configuration.
    ///
    /// Returns an error if required fields are missing.
    pub fn build(self) -> Result<MessagingHostConfig> {
        let provider = self
            .provider
            .ok_or_else(|| anyhow::anyhow!("channel factory provider is required"))?;
        let bookmarks = self
            .bookmarks
            .ok_or_else(|| anyhow::anyhow!("bookmark host is required"))?;
        if self.config.sweep_interval.is_zero() {
            anyhow::bail!("sweep interval must be greater than zero");
        }

        Ok(MessagingHostConfig {
            config: self.config,
            provider,
            bookmarks,
            transactions: self.transactions,
        })
    }
}

/// Configuration for a [`MessagingHost`].
pub struct MessagingHostConfig {
    config: Config,
    provider: Arc<dyn ChannelFactoryProvider>,
    bookmarks: Arc<dyn BookmarkHost>,
    transactions: Option<Arc<dyn TransactionFactory>>,
}

impl std::fmt::Debug for MessagingHostConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessagingHostConfig")
            .field("config", &self.config)
            .field("provider", &"...")
            .field("bookmarks", &"...")
            .field("transactions", &self.transactions.as_ref().map(|_| "..."))
            .finish()
    }
}

impl MessagingHostConfig {
    /// Start the host, spawning the cache sweeper task.
    pub async fn start(self) -> Result<MessagingHost> {
        let cache: SharedChannelCache = Arc::new(SendMessageChannelCache::from_config(&self.config));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let sweeper_handle = tokio::spawn(run_cache_sweeper(
            cache.clone(),
            self.config.sweep_interval,
            shutdown_rx,
        ));

        let send = SendOrchestrator::new(cache.clone(), self.provider);
        let receive = ReceiveOrchestrator::new(self.bookmarks.clone(), self.transactions);
        let dispatcher = ReceiveDispatcher::new(self.bookmarks, self.config.buffered_receive_delay);

        info!(
            factory_cache_max_items = self.config.factory_cache.max_items,
            channel_cache_max_items = self.config.channel_cache.max_items,
            allow_unsafe_caching = self.config.allow_unsafe_caching,
            "MessagingHost started"
        );

        Ok(MessagingHost {
            sweeper_handle,
            shutdown_tx,
            cache,
            send,
            receive,
            dispatcher,
            config: self.config,
        })
    }
}

/// A running messaging host.
///
/// The host manages:
/// - the shared channel factory cache and its background sweeper
/// - the send orchestrator
/// - the receive orchestrator and inbound dispatcher
///
/// Call [`shutdown`](Self::shutdown) for graceful termination.
pub struct MessagingHost {
    sweeper_handle: JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
    cache: SharedChannelCache,
    send: SendOrchestrator,
    receive: ReceiveOrchestrator,
    dispatcher: ReceiveDispatcher,
    config: Config,
}

impl std::fmt::Debug for MessagingHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessagingHost")
            .field("config", &self.config)
            .field("cache", &self.cache)
            .field("running", &self.is_running())
            .finish()
    }
}

impl MessagingHost {
    /// Create a new builder for configuring the host.
    pub fn builder() -> MessagingHostBuilder {
        MessagingHostBuilder::new()
    }

    /// Configuration in effect.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The shared channel cache.
    pub fn cache(&self) -> &SharedChannelCache {
        &self.cache
    }

    /// Send orchestrator over the shared cache.
    pub fn send(&self) -> &SendOrchestrator {
        &self.send
    }

    /// Receive orchestrator.
    pub fn receive(&self) -> &ReceiveOrchestrator {
        &self.receive
    }

    /// Dispatcher for inbound messages.
    pub fn dispatcher(&self) -> &ReceiveDispatcher {
        &self.dispatcher
    }

    /// Gracefully shut down the host.
    ///
    /// Stops the sweeper, then disposes every cached channel factory and
    /// its pooled channels.
    pub async fn shutdown(self) -> Result<()> {
        info!("MessagingHost shutting down...");

        // Signal shutdown
        let _ = self.shutdown_tx.send(true);

        let joined = self.sweeper_handle.await;
        self.cache.dispose_all().await;

        match joined {
            Ok(()) => {
                info!("MessagingHost shutdown complete");
                Ok(())
            }
            Err(e) => {
                error!("Cache sweeper task panicked: {}", e);
                Err(anyhow::anyhow!("cache sweeper task panicked: {}", e))
            }
        }
    }

    /// Check if the host is still running.
    pub fn is_running(&self) -> bool {
        !self.sweeper_handle.is_finished()
    }
}

/// Periodically evict idle factories and channels until shutdown.
async fn run_cache_sweeper(
    cache: SharedChannelCache,
    interval: std::time::Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    debug!(interval_secs = interval.as_secs(), "Cache sweeper starting");

    loop {
        tokio::select! {
            biased;

            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    debug!("Cache sweeper received shutdown signal");
                    break;
                }
            }

            _ = tokio::time::sleep(interval) => {
                cache.sweep().await;
            }
        }
    }

    debug!("Cache sweeper stopped");
}
