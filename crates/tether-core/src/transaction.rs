// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Transaction collaborator.
//!
//! The core never runs two-phase commit itself. It only derives dependent
//! clones that hold the parent's commit open while a send or delivery is in
//! flight, and completes them.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::Result;

/// How a dependent clone affects its parent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DependentCloneOption {
    /// Commit of the parent waits until the clone completes.
    BlockCommitUntilComplete,
    /// The parent rolls back if the clone is not completed before commit.
    RollbackIfNotComplete,
}

/// Opaque transaction resource.
#[async_trait]
pub trait Transaction: Send + Sync {
    /// Transaction identifier, used for the flowed-versus-ambient check.
    fn id(&self) -> Uuid;

    /// Derive a dependent clone.
    fn dependent_clone(&self, option: DependentCloneOption) -> Box<dyn DependentTransaction>;

    /// Commit the transaction.
    async fn commit(&self) -> Result<()>;
}

/// A clone that must be completed exactly once.
pub trait DependentTransaction: Send + Sync {
    /// Identifier of the parent transaction.
    fn transaction_id(&self) -> Uuid;

    /// Release the parent's commit.
    fn complete(self: Box<Self>);
}

/// Creates fresh transactions when a receive requires one and none flowed.
pub trait TransactionFactory: Send + Sync {
    /// A new transaction.
    fn create(&self) -> Arc<dyn Transaction>;
}

/// Holds a dependent clone and completes it when dropped.
///
/// Orchestrators keep the guard alive across the I/O it protects, so the
/// clone is released on success, on error and when the future is dropped.
#[derive(Default)]
pub struct DependentCloneGuard {
    clone: Option<Box<dyn DependentTransaction>>,
}

impl fmt::Debug for DependentCloneGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DependentCloneGuard")
            .field(
                "transaction_id",
                &self.clone.as_ref().map(|c| c.transaction_id()),
            )
            .finish()
    }
}

impl DependentCloneGuard {
    /// Guard over a blocking clone of `transaction`, if there is one.
    pub fn block_commit(transaction: Option<&Arc<dyn Transaction>>) -> Self {
        Self {
            clone: transaction
                .map(|t| t.dependent_clone(DependentCloneOption::BlockCommitUntilComplete)),
        }
    }

    /// Whether a clone is still held.
    pub fn is_active(&self) -> bool {
        self.clone.is_some()
    }

    /// Complete the clone now.
    pub fn complete(&mut self) {
        if let Some(clone) = self.clone.take() {
            clone.complete();
        }
    }
}

impl Drop for DependentCloneGuard {
    fn drop(&mut self) {
        self.complete();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockTransaction;

    #[test]
    fn test_guard_completes_once() {
        let tx = Arc::new(MockTransaction::new());
        let as_dyn: Arc<dyn Transaction> = tx.clone();

        let mut guard = DependentCloneGuard::block_commit(Some(&as_dyn));
        assert!(guard.is_active());
        guard.complete();
        guard.complete();
        drop(guard);

        assert_eq!(tx.clones_created(), 1);
        assert_eq!(tx.clones_completed(), 1);
    }

    #[test]
    fn test_guard_completes_on_drop() {
        let tx = Arc::new(MockTransaction::new());
        let as_dyn: Arc<dyn Transaction> = tx.clone();

        {
            let _guard = DependentCloneGuard::block_commit(Some(&as_dyn));
        }

        assert_eq!(tx.clones_completed(), 1);
    }

    #[test]
    fn test_guard_without_transaction_is_noop() {
        let guard = DependentCloneGuard::block_commit(None);
        assert!(!guard.is_active());
    }
}
