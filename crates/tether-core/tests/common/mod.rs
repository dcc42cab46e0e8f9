// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for tether-core integration tests.
//!
//! Provides TestContext wiring mock transport, bookmark host and
//! transactions into the send and receive orchestrators.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use tether_core::bookmark::{BookmarkName, InMemoryBookmarkHost};
use tether_core::cache::{ChannelCacheSettings, SendMessageChannelCache, SharedChannelCache};
use tether_core::contract::{ContractDescription, TransactionFlow};
use tether_core::endpoint::{Binding, Endpoint, EndpointSource};
use tether_core::message::CorrelationMessageProperty;
use tether_core::mock::{MockChannelFactoryProvider, MockTransactionFactory};
use tether_core::{
    InstanceKey, Message, ReceiveDispatcher, ReceiveOrchestrator, SendOrchestrator,
};

pub const SERVICE_ADDRESS: &str = "net.tcp://bank.example/service";

/// Install a test subscriber once; honours `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// The bank contract used across tests.
pub fn bank_contract() -> Arc<ContractDescription> {
    Arc::new(
        ContractDescription::new("http://bank.example/", "IBank")
            .with_operation("Deposit", true)
            .with_operation("Balance", false)
            .with_transacted_operation("Transfer", TransactionFlow::Allowed),
    )
}

/// Endpoint declared with the send.
pub fn bank_endpoint() -> EndpointSource {
    EndpointSource::Explicit(Endpoint::new(
        Binding::new("netTcpBinding", "net.tcp"),
        Some(SERVICE_ADDRESS.to_string()),
    ))
}

/// Endpoint resolved by configuration name.
pub fn configured_bank_endpoint() -> EndpointSource {
    EndpointSource::Configuration {
        name: "BankEndpoint".to_string(),
        endpoint: Endpoint::new(
            Binding::new("netTcpBinding", "net.tcp"),
            Some(SERVICE_ADDRESS.to_string()),
        ),
    }
}

/// Cache settings small enough to exercise eviction.
pub fn small_cache_settings() -> ChannelCacheSettings {
    ChannelCacheSettings {
        max_items: 4,
        idle_timeout: Duration::from_secs(60),
        lease_timeout: Duration::from_secs(600),
    }
}

/// Inbound bank message addressed to `key`.
pub fn keyed_message(operation: &str, key: &InstanceKey, body: serde_json::Value) -> Message {
    let mut message = Message::new(format!("http://bank.example/IBank/{operation}")).with_body(body);
    message.properties_mut().correlation = Some(CorrelationMessageProperty::new(key.clone()));
    message
}

/// Yield until `instance` is suspended on `name`.
pub async fn wait_for_bookmark(
    bookmarks: &InMemoryBookmarkHost,
    instance: &InstanceKey,
    name: &BookmarkName,
) {
    while !bookmarks.is_waiting(instance, name) {
        tokio::task::yield_now().await;
    }
}

/// Test context with every collaborator mocked in memory.
pub struct TestContext {
    pub provider: Arc<MockChannelFactoryProvider>,
    pub cache: SharedChannelCache,
    pub send: SendOrchestrator,
    pub bookmarks: Arc<InMemoryBookmarkHost>,
    pub transactions: Arc<MockTransactionFactory>,
    pub receive: ReceiveOrchestrator,
    pub dispatcher: ReceiveDispatcher,
}

impl TestContext {
    /// Context whose factories open immediately.
    pub fn new() -> Self {
        Self::with_open_delay(Duration::ZERO)
    }

    /// Context whose factories take `open_delay` to open.
    pub fn with_open_delay(open_delay: Duration) -> Self {
        Self::build(
            open_delay,
            SendMessageChannelCache::new(small_cache_settings(), small_cache_settings(), false),
            Duration::from_millis(50),
        )
    }

    /// Context with a custom cache and buffered receive delay.
    pub fn build(
        open_delay: Duration,
        cache: SendMessageChannelCache,
        buffered_receive_delay: Duration,
    ) -> Self {
        init_tracing();

        let provider = Arc::new(MockChannelFactoryProvider::new(open_delay));
        let cache = Arc::new(cache);
        let send = SendOrchestrator::new(cache.clone(), provider.clone());
        let bookmarks = Arc::new(InMemoryBookmarkHost::new());
        let transactions = Arc::new(MockTransactionFactory::default());
        let receive = ReceiveOrchestrator::new(bookmarks.clone(), Some(transactions.clone()));
        let dispatcher = ReceiveDispatcher::new(bookmarks.clone(), buffered_receive_delay);

        Self {
            provider,
            cache,
            send,
            bookmarks,
            transactions,
            receive,
            dispatcher,
        }
    }
}
