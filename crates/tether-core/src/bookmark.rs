// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Workflow suspension and resumption collaborator.
//!
//! A receive suspends its workflow on a bookmark named after the contract
//! and operation it waits for. The dispatcher resumes that bookmark with the
//! inbound [`Delivery`]. Scheduling and persistence stay with the workflow
//! engine; [`InMemoryBookmarkHost`] is a minimal engine-free implementation.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::oneshot;
use tracing::debug;
use uuid::Uuid;

use crate::context::CorrelationResponseContext;
use crate::key::InstanceKey;
use crate::message::Message;
use crate::transaction::{DependentCloneGuard, Transaction};

/// Bookmark identity: the operation a receive waits for.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BookmarkName {
    /// Contract name.
    pub contract: String,
    /// Operation name.
    pub operation: String,
}

impl BookmarkName {
    /// Bookmark for an operation.
    pub fn new(contract: impl Into<String>, operation: impl Into<String>) -> Self {
        Self {
            contract: contract.into(),
            operation: operation.into(),
        }
    }
}

impl fmt::Display for BookmarkName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}", self.contract, self.operation)
    }
}

/// Value a resumed receive gets.
pub struct Delivery {
    /// The inbound message.
    pub message: Message,
    /// Transaction flowed with the message.
    pub transaction: Option<Arc<dyn Transaction>>,
    /// Where the paired send-reply answers, for two-way operations.
    pub response_context: Option<CorrelationResponseContext>,
    /// Holds the flowed transaction's commit until delivery finishes.
    pub transaction_guard: DependentCloneGuard,
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("action", &self.message.action())
            .field("transaction", &self.transaction.as_ref().map(|t| t.id()))
            .field("two_way", &self.response_context.is_some())
            .finish()
    }
}

impl Delivery {
    /// Delivery without transaction or reply.
    pub fn one_way(message: Message) -> Self {
        Self {
            message,
            transaction: None,
            response_context: None,
            transaction_guard: DependentCloneGuard::default(),
        }
    }
}

/// Outcome of resuming a bookmark.
#[derive(Debug)]
pub enum BookmarkResumptionResult {
    /// Delivered to the instance with this key.
    Success(InstanceKey),
    /// No such instance or no receive for this operation anywhere.
    NotFound(Delivery),
    /// The instance exists but is not waiting on this bookmark yet.
    NotReady(Delivery),
}

/// The workflow engine's bookmark primitives.
pub trait BookmarkHost: Send + Sync {
    /// Suspend `instance` on `name`; the receiver resolves on resumption.
    fn create_bookmark(&self, instance: &InstanceKey, name: BookmarkName) -> oneshot::Receiver<Delivery>;

    /// Resume the bookmark `name` of the instance owning `key`.
    ///
    /// With no key, any instance waiting on `name` is resumed.
    fn resume_bookmark(
        &self,
        key: Option<&InstanceKey>,
        name: &BookmarkName,
        delivery: Delivery,
    ) -> BookmarkResumptionResult;

    /// Associate an additional correlation key with an instance.
    fn associate_key(&self, _instance: &InstanceKey, _key: &InstanceKey) {}

    /// Identifier of the transaction the instance currently runs under.
    fn attached_transaction(&self, _key: &InstanceKey) -> Option<Uuid> {
        None
    }
}

#[derive(Default)]
struct InstanceEntry {
    bookmarks: HashMap<BookmarkName, oneshot::Sender<Delivery>>,
    transaction: Option<Uuid>,
}

#[derive(Default)]
struct HostState {
    instances: HashMap<InstanceKey, InstanceEntry>,
    aliases: HashMap<InstanceKey, InstanceKey>,
}

impl HostState {
    fn resolve(&self, key: &InstanceKey) -> Option<InstanceKey> {
        if self.instances.contains_key(key) {
            return Some(key.clone());
        }
        self.aliases.get(key).cloned()
    }
}

/// In-memory bookmark table.
#[derive(Default)]
pub struct InMemoryBookmarkHost {
    state: Mutex<HostState>,
}

impl fmt::Debug for InMemoryBookmarkHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryBookmarkHost")
            .field("instances", &self.state().instances.len())
            .finish()
    }
}

impl InMemoryBookmarkHost {
    /// Empty table.
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, HostState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make an instance known before it waits on anything.
    pub fn register_instance(&self, instance: &InstanceKey) {
        self.state().instances.entry(instance.clone()).or_default();
    }

    /// Record the transaction an instance runs under.
    pub fn attach_transaction(&self, instance: &InstanceKey, transaction: Option<Uuid>) {
        self.state()
            .instances
            .entry(instance.clone())
            .or_default()
            .transaction = transaction;
    }

    /// Whether the instance waits on `name`.
    pub fn is_waiting(&self, instance: &InstanceKey, name: &BookmarkName) -> bool {
        let state = self.state();
        state
            .resolve(instance)
            .and_then(|key| state.instances.get(&key))
            .is_some_and(|entry| {
                entry
                    .bookmarks
                    .get(name)
                    .is_some_and(|tx| !tx.is_closed())
            })
    }
}

impl BookmarkHost for InMemoryBookmarkHost {
    fn create_bookmark(&self, instance: &InstanceKey, name: BookmarkName) -> oneshot::Receiver<Delivery> {
        let (tx, rx) = oneshot::channel();
        debug!(instance = %instance, bookmark = %name, "Bookmark created");
        self.state()
            .instances
            .entry(instance.clone())
            .or_default()
            .bookmarks
            .insert(name, tx);
        rx
    }

    fn resume_bookmark(
        &self,
        key: Option<&InstanceKey>,
        name: &BookmarkName,
        delivery: Delivery,
    ) -> BookmarkResumptionResult {
        let mut state = self.state();

        let target = match key {
            Some(key) => match state.resolve(key) {
                Some(instance) => instance,
                None => return BookmarkResumptionResult::NotFound(delivery),
            },
            None => {
                let waiting = state.instances.iter().find_map(|(instance, entry)| {
                    entry
                        .bookmarks
                        .get(name)
                        .filter(|tx| !tx.is_closed())
                        .map(|_| instance.clone())
                });
                match waiting {
                    Some(instance) => instance,
                    None => return BookmarkResumptionResult::NotFound(delivery),
                }
            }
        };

        let Some(entry) = state.instances.get_mut(&target) else {
            return BookmarkResumptionResult::NotFound(delivery);
        };
        let Some(tx) = entry.bookmarks.remove(name) else {
            return BookmarkResumptionResult::NotReady(delivery);
        };

        match tx.send(delivery) {
            Ok(()) => BookmarkResumptionResult::Success(target),
            // The waiting receive went away; the instance no longer expects this.
            Err(delivery) => BookmarkResumptionResult::NotReady(delivery),
        }
    }

    fn associate_key(&self, instance: &InstanceKey, key: &InstanceKey) {
        if instance != key {
            self.state().aliases.insert(key.clone(), instance.clone());
        }
    }

    fn attached_transaction(&self, key: &InstanceKey) -> Option<Uuid> {
        let state = self.state();
        state
            .resolve(key)
            .and_then(|instance| state.instances.get(&instance))
            .and_then(|entry| entry.transaction)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name() -> BookmarkName {
        BookmarkName::new("IBank", "Deposit")
    }

    #[tokio::test]
    async fn test_resume_waiting_bookmark() {
        let host = InMemoryBookmarkHost::new();
        let instance = InstanceKey::new(Uuid::new_v4());
        let rx = host.create_bookmark(&instance, name());
        assert!(host.is_waiting(&instance, &name()));

        let result =
            host.resume_bookmark(Some(&instance), &name(), Delivery::one_way(Message::new("urn:d")));
        assert!(matches!(result, BookmarkResumptionResult::Success(ref k) if *k == instance));

        let delivery = rx.await.unwrap();
        assert_eq!(delivery.message.action(), Some("urn:d"));
        assert!(!host.is_waiting(&instance, &name()));
    }

    #[test]
    fn test_known_instance_without_bookmark_is_not_ready() {
        let host = InMemoryBookmarkHost::new();
        let instance = InstanceKey::new(Uuid::new_v4());
        host.register_instance(&instance);

        let result =
            host.resume_bookmark(Some(&instance), &name(), Delivery::one_way(Message::new("urn:d")));
        assert!(matches!(result, BookmarkResumptionResult::NotReady(_)));
    }

    #[test]
    fn test_unknown_instance_is_not_found() {
        let host = InMemoryBookmarkHost::new();
        let result = host.resume_bookmark(
            Some(&InstanceKey::new(Uuid::new_v4())),
            &name(),
            Delivery::one_way(Message::new("urn:d")),
        );
        assert!(matches!(result, BookmarkResumptionResult::NotFound(_)));

        let result = host.resume_bookmark(None, &name(), Delivery::one_way(Message::new("urn:d")));
        assert!(matches!(result, BookmarkResumptionResult::NotFound(_)));
    }

    #[tokio::test]
    async fn test_alias_resolves_to_instance() {
        let host = InMemoryBookmarkHost::new();
        let instance = InstanceKey::new(Uuid::new_v4());
        let alias = InstanceKey::new(Uuid::new_v4());
        let rx = host.create_bookmark(&instance, name());
        host.associate_key(&instance, &alias);
        host.attach_transaction(&instance, Some(Uuid::nil()));

        assert_eq!(host.attached_transaction(&alias), Some(Uuid::nil()));
        let result =
            host.resume_bookmark(Some(&alias), &name(), Delivery::one_way(Message::new("urn:d")));
        assert!(matches!(result, BookmarkResumptionResult::Success(_)));
        assert!(rx.await.is_ok());
    }
}
