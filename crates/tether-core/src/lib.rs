// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tether Core - Message Correlation and Send/Receive Orchestration
//!
//! This crate pairs outgoing and incoming messages with running workflow
//! instances through correlation keys, caches channel factories and channels
//! across sends, and keeps transactional commit in step with asynchronous
//! message exchanges.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                            MessagingHost                                │
//! │             (owns the cache, sweeper task, orchestrators)               │
//! └─────────────────────────────────────────────────────────────────────────┘
//!            │                                              │
//!            ▼                                              ▼
//! ┌───────────────────────┐                    ┌─────────────────────────────┐
//! │   SendOrchestrator    │                    │  ReceiveDispatcher /        │
//! │  send, send_reply     │                    │  ReceiveOrchestrator        │
//! └───────────────────────┘                    └─────────────────────────────┘
//!     │            │                                  │             │
//!     ▼            ▼                                  ▼             ▼
//! ┌──────────┐ ┌──────────────────┐          ┌──────────────┐ ┌──────────────┐
//! │ Channel  │ │ Correlation      │          │ BookmarkHost │ │ Transaction  │
//! │ cache    │ │ Synchronizer     │          │ (workflow    │ │ Factory      │
//! │          │ │                  │          │  engine)     │ │              │
//! └──────────┘ └──────────────────┘          └──────────────┘ └──────────────┘
//!     │
//!     ▼
//! ┌─────────────────────────────┐
//! │ ChannelFactoryProvider      │
//! │ (transport)                 │
//! └─────────────────────────────┘
//! ```
//!
//! Both orchestrators read and write [`CorrelationHandle`]s and compute
//! [`InstanceKey`]s from messages.
//!
//! # Send
//!
//! | State | What happens |
//! |-------|--------------|
//! | `Initializing` | Request/reply handle resolved and validated, no I/O yet |
//! | `AcquiringFactory` | Factory taken from the cache, or created and opened |
//! | `PopulatingChannel` | Channel taken from its pool, context properties applied |
//! | `InitializingCorrelation` | Keys computed, or deferred to the channel stack |
//! | `Transmitting` | The only network I/O; a dependent clone blocks commit |
//! | `Finalizing` | Staged error re-raised, handles updated |
//!
//! # Receive
//!
//! | State | What happens |
//! |-------|--------------|
//! | `WaitingForMessage` | Suspended on the `(contract, operation)` bookmark |
//! | `ResolvingCorrelation` | Target instance resolved, handles initialized |
//! | `EnteringTransaction` | Flowed transaction checked, or a fresh one created |
//! | `DeliveringToInstance` | Bookmark resumed; retried once if not ready |
//! | `AwaitingReply` | Two-way only, until the paired send-reply answers |
//!
//! # Configuration
//!
//! Configuration is loaded from environment variables:
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `TETHER_FACTORY_CACHE_MAX_ITEMS` | No | `16` | Factory cache capacity |
//! | `TETHER_CHANNEL_CACHE_MAX_ITEMS` | No | `16` | Channels kept per address |
//! | `TETHER_ALLOW_UNSAFE_CACHING` | No | `false` | Cache factories for configuration-resolved endpoints |
//! | `TETHER_CLOSE_TIMEOUT_MS` | No | `5000` | Graceful close timeout before abort |
//! | `TETHER_BUFFERED_RECEIVE_DELAY_MS` | No | `500` | Delay before the single receive retry |
//! | `TETHER_SWEEP_INTERVAL_SECS` | No | `30` | Cache sweeper period |
//!
//! See [`Config::from_env`] for the full list.
//!
//! # Modules
//!
//! - [`send`] and [`receive`]: the orchestrators
//! - [`cache`]: factory cache and channel pools
//! - [`synchronizer`]: finalize-once latch for deferred correlation
//! - [`host`]: embeddable host with start/shutdown lifecycle
//! - [`mock`]: in-memory transport, transaction and bookmark collaborators

#![warn(missing_docs)]

/// Workflow bookmark collaborator and an in-memory implementation.
pub mod bookmark;

/// Channel factory cache, channel pools and the generic refcounted cache.
pub mod cache;

/// Transport collaborator traits.
pub mod channel;

/// Configuration loaded from environment variables.
pub mod config;

/// Pending request and response contexts.
pub mod context;

/// Contract and operation metadata.
pub mod contract;

/// Applying correlation initializers and resolving inbound instance keys.
pub mod correlation;

/// Endpoints and bindings.
pub mod endpoint;

/// Error types with stable error codes.
pub mod error;

/// Correlation handles and initializers.
pub mod handle;

/// Embeddable messaging host.
pub mod host;

/// Instance and correlation keys.
pub mod key;

/// Message model and correlation properties.
pub mod message;

/// In-memory collaborators for tests and local development.
pub mod mock;

/// Correlation queries and key calculation.
pub mod query;

/// Receive orchestration and inbound dispatch.
pub mod receive;

/// What a workflow activity hands to the orchestrators.
pub mod scope;

/// Send orchestration.
pub mod send;

/// Two-party completion latch for deferred correlation.
pub mod synchronizer;

/// Transaction collaborator traits and the dependent clone guard.
pub mod transaction;

pub use config::Config;
pub use error::{Result, TetherError};
pub use handle::{CorrelationHandle, CorrelationInitializer};
pub use host::MessagingHost;
pub use key::{CorrelationKey, InstanceKey};
pub use message::Message;
pub use receive::{ReceiveDispatcher, ReceiveMessage, ReceiveOrchestrator, ReceiveRequest};
pub use scope::ExecutionScope;
pub use send::{SendMessage, SendOrchestrator, SendRequest};
