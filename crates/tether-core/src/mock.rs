// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory collaborators for tests and local development.
//!
//! Every mock counts what happened to it so tests can assert on opens,
//! channel creation, aborts and dependent-clone completion.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use crate::channel::{
    Channel, ChannelFactory, ChannelFactoryProvider, CommunicationObject, CommunicationState,
};
use crate::contract::ContractDescription;
use crate::endpoint::Endpoint;
use crate::error::{Result, TetherError};
use crate::message::{ContextDictionary, ContextProperty, Message};
use crate::transaction::{DependentCloneOption, DependentTransaction, Transaction, TransactionFactory};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

type Responder = Box<dyn Fn(&Message) -> Result<Message> + Send + Sync>;

/// Behaviour shared by every channel of a mock factory.
#[derive(Default)]
pub struct MockTransport {
    responder: Mutex<Option<Responder>>,
    fail_requests: AtomicBool,
    fail_sends: AtomicBool,
    request_delay: Mutex<Duration>,
    close_delay: Mutex<Duration>,
    channel_context: Mutex<Option<ContextDictionary>>,
    transmitted: Mutex<Vec<Message>>,
}

impl MockTransport {
    /// Transport that echoes `{action}Response` replies.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Reply with whatever `responder` returns.
    pub fn set_responder<F>(&self, responder: F)
    where
        F: Fn(&Message) -> Result<Message> + Send + Sync + 'static,
    {
        *lock(&self.responder) = Some(Box::new(responder));
    }

    /// Make requests fail with a communication error after `delay`.
    pub fn fail_requests(&self, fail: bool) {
        self.fail_requests.store(fail, Ordering::SeqCst);
    }

    /// Make one-way sends fail with a communication error.
    pub fn fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    /// Delay every request by `delay`.
    pub fn set_request_delay(&self, delay: Duration) {
        *lock(&self.request_delay) = delay;
    }

    /// Delay every graceful factory close by `delay`.
    pub fn set_close_delay(&self, delay: Duration) {
        *lock(&self.close_delay) = delay;
    }

    /// Context the channel stack adds when asked to call back for correlation.
    pub fn set_channel_context(&self, context: Option<ContextDictionary>) {
        *lock(&self.channel_context) = context;
    }

    /// Messages that reached the wire.
    pub fn transmitted(&self) -> Vec<Message> {
        lock(&self.transmitted).clone()
    }

    fn reply_to(&self, message: &Message) -> Result<Message> {
        match lock(&self.responder).as_ref() {
            Some(responder) => responder(message),
            None => Ok(Message::new(format!("{}Response", message.resolved_action()))),
        }
    }
}

/// Mock transport channel.
pub struct MockChannel {
    id: Uuid,
    address: String,
    one_way: bool,
    state: Mutex<CommunicationState>,
    binder_state: Mutex<Option<CommunicationState>>,
    transport: Arc<MockTransport>,
    opens: AtomicUsize,
    closes: AtomicUsize,
    aborts: AtomicUsize,
}

impl MockChannel {
    /// New channel in the `Created` state.
    pub fn new(address: &str, one_way: bool, transport: Arc<MockTransport>) -> Self {
        Self {
            id: Uuid::new_v4(),
            address: address.to_string(),
            one_way,
            state: Mutex::new(CommunicationState::Created),
            binder_state: Mutex::new(None),
            transport,
            opens: AtomicUsize::new(0),
            closes: AtomicUsize::new(0),
            aborts: AtomicUsize::new(0),
        }
    }

    /// Channel identifier.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Force a state, e.g. to simulate a channel that faulted while pooled.
    pub fn set_state(&self, state: CommunicationState) {
        *lock(&self.state) = state;
    }

    /// Simulate a session channel whose binder is in `state`.
    pub fn set_binder_state(&self, state: Option<CommunicationState>) {
        *lock(&self.binder_state) = state;
    }

    /// Number of opens.
    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    /// Number of graceful closes.
    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    /// Number of aborts.
    pub fn aborts(&self) -> usize {
        self.aborts.load(Ordering::SeqCst)
    }

    fn ensure_open(&self, operation: &str) -> Result<()> {
        let state = *lock(&self.state);
        if state != CommunicationState::Opened {
            return Err(TetherError::communication(
                operation,
                format!("channel is {}", state.as_str()),
            ));
        }
        Ok(())
    }

    fn fault(&self, operation: &str) -> TetherError {
        self.set_state(CommunicationState::Faulted);
        TetherError::communication(operation, format!("transport fault on {}", self.address))
    }

    async fn correlate(&self, mut message: Message) -> Result<Message> {
        let Some(callback) = message.properties_mut().correlation_callback.take() else {
            return Ok(message);
        };
        if let Some(context) = lock(&self.transport.channel_context).clone() {
            message.properties_mut().context = Some(ContextProperty::new(context));
        }
        callback.synchronizer.request_from_workflow(message).await
    }
}

#[async_trait]
impl CommunicationObject for MockChannel {
    fn state(&self) -> CommunicationState {
        *lock(&self.state)
    }

    async fn open(&self) -> Result<()> {
        let mut state = lock(&self.state);
        if *state != CommunicationState::Created {
            return Err(TetherError::invalid_operation(format!(
                "cannot open a {} channel",
                state.as_str()
            )));
        }
        *state = CommunicationState::Opened;
        self.opens.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self, _timeout: Duration) -> Result<()> {
        self.set_state(CommunicationState::Closed);
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn abort(&self) {
        self.set_state(CommunicationState::Closed);
        self.aborts.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Channel for MockChannel {
    fn remote_address(&self) -> &str {
        &self.address
    }

    fn binder_state(&self) -> Option<CommunicationState> {
        *lock(&self.binder_state)
    }

    async fn send(&self, message: Message) -> Result<()> {
        self.ensure_open("send")?;
        if !self.one_way {
            return Err(TetherError::invalid_operation("send on a request channel"));
        }
        let message = self.correlate(message).await?;
        if self.transport.fail_sends.load(Ordering::SeqCst) {
            return Err(self.fault("send"));
        }
        lock(&self.transport.transmitted).push(message);
        Ok(())
    }

    async fn request(&self, message: Message) -> Result<Message> {
        self.ensure_open("request")?;
        if self.one_way {
            return Err(TetherError::invalid_operation("request on an output channel"));
        }
        let message = self.correlate(message).await?;

        let delay = *lock(&self.transport.request_delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.transport.fail_requests.load(Ordering::SeqCst) {
            return Err(self.fault("request"));
        }

        let reply = self.transport.reply_to(&message);
        lock(&self.transport.transmitted).push(message);
        reply
    }
}

/// Mock channel factory.
pub struct MockChannelFactory {
    state: Mutex<CommunicationState>,
    open_delay: Duration,
    transport: Arc<MockTransport>,
    channels: Mutex<Vec<Arc<MockChannel>>>,
    opens: AtomicUsize,
    closes: AtomicUsize,
    aborts: AtomicUsize,
}

impl MockChannelFactory {
    /// Factory whose open completes after `open_delay`.
    pub fn new(open_delay: Duration, transport: Arc<MockTransport>) -> Self {
        Self {
            state: Mutex::new(CommunicationState::Created),
            open_delay,
            transport,
            channels: Mutex::new(Vec::new()),
            opens: AtomicUsize::new(0),
            closes: AtomicUsize::new(0),
            aborts: AtomicUsize::new(0),
        }
    }

    /// Channels created so far.
    pub fn channels(&self) -> Vec<Arc<MockChannel>> {
        lock(&self.channels).clone()
    }

    /// Number of opens.
    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    /// Number of graceful closes.
    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    /// Number of aborts.
    pub fn aborts(&self) -> usize {
        self.aborts.load(Ordering::SeqCst)
    }

    fn set_state(&self, state: CommunicationState) {
        *lock(&self.state) = state;
    }
}

#[async_trait]
impl CommunicationObject for MockChannelFactory {
    fn state(&self) -> CommunicationState {
        *lock(&self.state)
    }

    async fn open(&self) -> Result<()> {
        {
            let mut state = lock(&self.state);
            if *state != CommunicationState::Created {
                return Err(TetherError::invalid_operation(format!(
                    "cannot open a {} factory",
                    state.as_str()
                )));
            }
            *state = CommunicationState::Opening;
        }
        if !self.open_delay.is_zero() {
            tokio::time::sleep(self.open_delay).await;
        }
        self.set_state(CommunicationState::Opened);
        self.opens.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self, _timeout: Duration) -> Result<()> {
        self.set_state(CommunicationState::Closing);
        let delay = *lock(&self.transport.close_delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.set_state(CommunicationState::Closed);
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn abort(&self) {
        self.set_state(CommunicationState::Closed);
        self.aborts.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl ChannelFactory for MockChannelFactory {
    fn create_channel(&self, address: &str, one_way: bool) -> Result<Arc<dyn Channel>> {
        if self.state() != CommunicationState::Opened {
            return Err(TetherError::communication(
                "create_channel",
                "factory is not open",
            ));
        }
        let channel = Arc::new(MockChannel::new(address, one_way, self.transport.clone()));
        lock(&self.channels).push(channel.clone());
        Ok(channel)
    }
}

/// Provider handing out [`MockChannelFactory`] instances.
pub struct MockChannelFactoryProvider {
    open_delay: Duration,
    transport: Arc<MockTransport>,
    factories: Mutex<Vec<Arc<MockChannelFactory>>>,
}

impl Default for MockChannelFactoryProvider {
    fn default() -> Self {
        Self::new(Duration::ZERO)
    }
}

impl MockChannelFactoryProvider {
    /// Provider whose factories open after `open_delay`.
    pub fn new(open_delay: Duration) -> Self {
        Self {
            open_delay,
            transport: MockTransport::new(),
            factories: Mutex::new(Vec::new()),
        }
    }

    /// Transport shared by every channel of every factory.
    pub fn transport(&self) -> &Arc<MockTransport> {
        &self.transport
    }

    /// Factories created so far.
    pub fn factories(&self) -> Vec<Arc<MockChannelFactory>> {
        lock(&self.factories).clone()
    }

    /// Channels created across all factories.
    pub fn channels(&self) -> Vec<Arc<MockChannel>> {
        self.factories()
            .iter()
            .flat_map(|factory| factory.channels())
            .collect()
    }
}

impl ChannelFactoryProvider for MockChannelFactoryProvider {
    fn create_factory(
        &self,
        _endpoint: &Endpoint,
        _contract: &Arc<ContractDescription>,
        _one_way: bool,
    ) -> Result<Arc<dyn ChannelFactory>> {
        let factory = Arc::new(MockChannelFactory::new(
            self.open_delay,
            self.transport.clone(),
        ));
        lock(&self.factories).push(factory.clone());
        Ok(factory)
    }
}

/// Mock transaction counting dependent clones.
#[derive(Debug)]
pub struct MockTransaction {
    id: Uuid,
    clones_created: Arc<AtomicUsize>,
    clones_completed: Arc<AtomicUsize>,
    commits: AtomicUsize,
}

impl Default for MockTransaction {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTransaction {
    /// New transaction with a random id.
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            clones_created: Arc::new(AtomicUsize::new(0)),
            clones_completed: Arc::new(AtomicUsize::new(0)),
            commits: AtomicUsize::new(0),
        }
    }

    /// Dependent clones created.
    pub fn clones_created(&self) -> usize {
        self.clones_created.load(Ordering::SeqCst)
    }

    /// Dependent clones completed.
    pub fn clones_completed(&self) -> usize {
        self.clones_completed.load(Ordering::SeqCst)
    }

    /// Commits.
    pub fn commits(&self) -> usize {
        self.commits.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transaction for MockTransaction {
    fn id(&self) -> Uuid {
        self.id
    }

    fn dependent_clone(&self, _option: DependentCloneOption) -> Box<dyn DependentTransaction> {
        self.clones_created.fetch_add(1, Ordering::SeqCst);
        Box::new(MockDependentTransaction {
            transaction_id: self.id,
            completed: self.clones_completed.clone(),
        })
    }

    async fn commit(&self) -> Result<()> {
        let outstanding = self.clones_created() - self.clones_completed();
        if outstanding > 0 {
            return Err(TetherError::invalid_operation(format!(
                "{outstanding} dependent clone(s) still block commit"
            )));
        }
        self.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct MockDependentTransaction {
    transaction_id: Uuid,
    completed: Arc<AtomicUsize>,
}

impl DependentTransaction for MockDependentTransaction {
    fn transaction_id(&self) -> Uuid {
        self.transaction_id
    }

    fn complete(self: Box<Self>) {
        self.completed.fetch_add(1, Ordering::SeqCst);
    }
}

/// Factory creating [`MockTransaction`]s and remembering them.
#[derive(Default)]
pub struct MockTransactionFactory {
    created: Mutex<Vec<Arc<MockTransaction>>>,
}

impl MockTransactionFactory {
    /// Transactions created so far.
    pub fn created(&self) -> Vec<Arc<MockTransaction>> {
        lock(&self.created).clone()
    }
}

impl TransactionFactory for MockTransactionFactory {
    fn create(&self) -> Arc<dyn Transaction> {
        let transaction = Arc::new(MockTransaction::new());
        lock(&self.created).push(transaction.clone());
        transaction
    }
}
