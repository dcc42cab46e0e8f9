// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Concurrency tests for the correlation synchronizer.
//!
//! Both sides of the latch race from separate worker threads; exactly one of
//! them must be told to finalize.

use std::sync::Arc;

use tether_core::Message;
use tether_core::synchronizer::{CorrelationSynchronizer, SyncState};
use tokio::sync::Barrier;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_exactly_one_side_finalizes_under_contention() {
    for _ in 0..200 {
        let synchronizer = Arc::new(CorrelationSynchronizer::new());
        let barrier = Arc::new(Barrier::new(2));

        let send_side = {
            let synchronizer = synchronizer.clone();
            let barrier = barrier.clone();
            tokio::spawn(async move {
                barrier.wait().await;
                synchronizer.notify_send_complete()
            })
        };
        let workflow_side = {
            let synchronizer = synchronizer.clone();
            let barrier = barrier.clone();
            tokio::spawn(async move {
                barrier.wait().await;
                synchronizer.notify_workflow_correlation_processing_complete()
            })
        };

        let send_finalized = send_side.await.unwrap();
        let workflow_finalized = workflow_side.await.unwrap();

        assert!(
            send_finalized ^ workflow_finalized,
            "exactly one side must finalize (send={send_finalized}, workflow={workflow_finalized})"
        );
        assert_eq!(synchronizer.state(), SyncState::Finalized);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_channel_and_workflow_meet_in_either_order() {
    for channel_first in [true, false] {
        let synchronizer = Arc::new(CorrelationSynchronizer::new());

        let workflow = {
            let synchronizer = synchronizer.clone();
            async move {
                synchronizer.wait_for_channel().await;
                let seen = synchronizer.channel_message().unwrap();
                synchronizer.notify_message_updated_by_workflow(
                    seen.with_header("correlated", "yes"),
                );
                synchronizer.notify_workflow_correlation_processing_complete()
            }
        };
        let channel = {
            let synchronizer = synchronizer.clone();
            async move {
                synchronizer
                    .request_from_workflow(Message::new("urn:order"))
                    .await
            }
        };

        let (finalized_by_workflow, returned) = if channel_first {
            let channel = tokio::spawn(channel);
            tokio::task::yield_now().await;
            let finalized = workflow.await;
            (finalized, channel.await.unwrap())
        } else {
            let workflow = tokio::spawn(workflow);
            tokio::task::yield_now().await;
            let returned = channel.await;
            (workflow.await.unwrap(), returned)
        };

        let returned = returned.unwrap();
        assert_eq!(returned.header("correlated"), Some("yes"));
        assert!(!finalized_by_workflow);
        assert!(synchronizer.notify_send_complete());
    }
}
