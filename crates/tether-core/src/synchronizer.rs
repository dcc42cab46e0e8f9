// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Correlation synchronizer.
//!
//! Some correlation protocols need the channel stack to see the outgoing
//! message before the workflow can compute its keys (the channel adds the
//! context the keys are derived from). Two things then complete
//! independently:
//!
//! ```text
//!   transport send returns ──► notify_send_complete() ─────────────┐
//!                                                                  ├─► finalize (once)
//!   workflow correlated msg ─► notify_workflow_correlation_        │
//!                              processing_complete() ──────────────┘
//! ```
//!
//! Whichever call observes the other side already done returns `true` and
//! its caller finalizes. The state is a single atomic compare-and-set:
//!
//! | from                  | event               | to                    | returns |
//! |-----------------------|---------------------|-----------------------|---------|
//! | `None`                | send complete       | `SendComplete`        | false   |
//! | `None`                | correlation complete| `CorrelationComplete` | false   |
//! | `CorrelationComplete` | send complete       | `Finalized`           | true    |
//! | `SendComplete`        | correlation complete| `Finalized`           | true    |

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::oneshot;

use crate::error::{Result, TetherError};
use crate::message::Message;

/// Continuation the channel stack registers to receive the correlated message.
pub type ChannelContinuation = Box<dyn FnOnce(Message) + Send>;

/// Wake-up registered by the workflow side.
pub type WorkflowNotification = Box<dyn FnOnce() + Send>;

/// Completion state of a synchronized send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SyncState {
    /// Neither side has completed.
    None = 0,
    /// The transport send returned first.
    SendComplete = 1,
    /// Workflow correlation processing finished first.
    CorrelationComplete = 2,
    /// Both sides completed; finalize has been claimed.
    Finalized = 3,
}

impl From<u8> for SyncState {
    fn from(value: u8) -> Self {
        match value {
            1 => Self::SendComplete,
            2 => Self::CorrelationComplete,
            3 => Self::Finalized,
            _ => Self::None,
        }
    }
}

#[derive(Default)]
struct Callbacks {
    channel_work_complete: bool,
    workflow_notification: Option<WorkflowNotification>,
    channel_continuation: Option<ChannelContinuation>,
    channel_message: Option<Message>,
    updated_message: Option<Message>,
}

/// Two-party completion latch for one send.
pub struct CorrelationSynchronizer {
    state: AtomicU8,
    callbacks: Mutex<Callbacks>,
}

impl fmt::Debug for CorrelationSynchronizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CorrelationSynchronizer")
            .field("state", &self.state())
            .field("channel_work_complete", &self.is_channel_work_complete())
            .finish()
    }
}

impl Default for CorrelationSynchronizer {
    fn default() -> Self {
        Self::new()
    }
}

impl CorrelationSynchronizer {
    /// New latch in the `None` state.
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(SyncState::None as u8),
            callbacks: Mutex::new(Callbacks::default()),
        }
    }

    fn callbacks(&self) -> MutexGuard<'_, Callbacks> {
        self.callbacks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current state.
    pub fn state(&self) -> SyncState {
        self.state.load(Ordering::Acquire).into()
    }

    fn try_set_state(&self, expected: SyncState, new: SyncState) -> std::result::Result<(), SyncState> {
        self.state
            .compare_exchange(expected as u8, new as u8, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(SyncState::from)
    }

    /// Record one side's completion; `true` if the caller must finalize.
    fn complete_side(&self, mine: SyncState, other: SyncState) -> bool {
        match self.try_set_state(SyncState::None, mine) {
            Ok(()) => false,
            Err(actual) if actual == other => {
                self.try_set_state(other, SyncState::Finalized).is_ok()
            }
            Err(_) => false,
        }
    }

    /// The transport send returned. `true` iff correlation already completed.
    pub fn notify_send_complete(&self) -> bool {
        self.complete_side(SyncState::SendComplete, SyncState::CorrelationComplete)
    }

    /// The workflow finished correlating the message.
    ///
    /// Hands the updated message (or, failing that, the channel's view of
    /// it) to the channel continuation, then returns `true` iff the send
    /// side already completed.
    pub fn notify_workflow_correlation_processing_complete(&self) -> bool {
        let (continuation, message) = {
            let mut callbacks = self.callbacks();
            let message = callbacks
                .updated_message
                .take()
                .or_else(|| callbacks.channel_message.take());
            (callbacks.channel_continuation.take(), message)
        };

        if let (Some(continuation), Some(message)) = (continuation, message) {
            continuation(message);
        }

        self.complete_side(SyncState::CorrelationComplete, SyncState::SendComplete)
    }

    /// Called by the channel stack when it needs the correlated message.
    ///
    /// Stores the channel's view of the message and the continuation to
    /// resume transmission with, marks channel work complete and wakes the
    /// workflow side if it registered first.
    pub fn notify_request_set_by_channel(&self, message: Message, continuation: ChannelContinuation) {
        let notification = {
            let mut callbacks = self.callbacks();
            callbacks.channel_message = Some(message);
            callbacks.channel_continuation = Some(continuation);
            callbacks.channel_work_complete = true;
            callbacks.workflow_notification.take()
        };

        if let Some(notify) = notification {
            notify();
        }
    }

    /// Register the workflow wake-up.
    ///
    /// Returns `true` without keeping the callback when channel work had
    /// already completed; the caller must not wait in that case.
    pub fn set_workflow_notification_callback(&self, notification: WorkflowNotification) -> bool {
        let mut callbacks = self.callbacks();
        if callbacks.channel_work_complete {
            return true;
        }
        callbacks.workflow_notification = Some(notification);
        false
    }

    /// Whether the channel stack has handed over the message.
    pub fn is_channel_work_complete(&self) -> bool {
        self.callbacks().channel_work_complete
    }

    /// The message as the channel stack saw it.
    pub fn channel_message(&self) -> Option<Message> {
        self.callbacks().channel_message.clone()
    }

    /// Store the message after workflow correlation changed it.
    pub fn notify_message_updated_by_workflow(&self, message: Message) {
        self.callbacks().updated_message = Some(message);
    }

    /// Drop the pending channel continuation so a waiting channel gives up.
    pub fn abandon(&self) {
        let continuation = self.callbacks().channel_continuation.take();
        drop(continuation);
    }

    /// Channel-side helper: hand over `message` and wait for the workflow to
    /// return the correlated version.
    pub async fn request_from_workflow(&self, message: Message) -> Result<Message> {
        let (tx, rx) = oneshot::channel();
        self.notify_request_set_by_channel(
            message,
            Box::new(move |correlated| {
                let _ = tx.send(correlated);
            }),
        );
        rx.await.map_err(|_| TetherError::Cancelled)
    }

    /// Workflow-side helper: wait until the channel stack has handed over
    /// the message.
    pub async fn wait_for_channel(&self) {
        let (tx, rx) = oneshot::channel::<()>();
        let ready = self.set_workflow_notification_callback(Box::new(move || {
            let _ = tx.send(());
        }));
        if !ready {
            let _ = rx.await;
        }
    }
}
