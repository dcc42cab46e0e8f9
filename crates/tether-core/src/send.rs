// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Send orchestration.
//!
//! ```text
//! Initializing ─► AcquiringFactory ─► PopulatingChannel ─► InitializingCorrelation
//!                                                                 │
//!                        ┌────────────────────────────────────────┴───────┐
//!                        ▼                                                ▼
//!             SynchronizingCorrelation                              Transmitting
//!                        └─────────────────► Finalizing ◄─────────────────┘
//!                                                │
//!                                       Completed | Faulted
//! ```
//!
//! Validation of the request/reply handle happens before any I/O. The only
//! network I/O is in `Transmitting`. Transport faults abort the channel
//! instead of returning it to its pool, and a dependent clone of the
//! ambient transaction blocks commit for exactly the duration of the
//! transmission.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, Weak};

use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::cache::{
    CacheItem, CacheLease, ChannelCacheSettings, ChannelFactoryReference, FactoryCacheKey,
    SendMessageChannelCache, SharedChannelCache,
};
use crate::channel::{Channel, ChannelFactoryProvider, CommunicationState};
use crate::context::CorrelationRequestContext;
use crate::contract::{ContractDescription, MessageDirection, default_action};
use crate::correlation::{initialize_correlations, resolve_request_reply_handle};
use crate::endpoint::{EndpointSource, TokenImpersonationLevel};
use crate::error::{Result, TetherError};
use crate::handle::{CorrelationHandle, CorrelationInitializer};
use crate::key::InstanceKey;
use crate::message::{
    CallbackContextProperty, ContextProperty, CorrelationCallbackProperty,
    CorrelationMessageProperty, INSTANCE_ID_CONTEXT_KEY, Message,
};
use crate::query::CorrelationQuery;
use crate::receive::ReceiveMessage;
use crate::scope::ExecutionScope;
use crate::synchronizer::CorrelationSynchronizer;
use crate::transaction::DependentCloneGuard;

/// States of a send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendState {
    /// Resolving handles and validating the request/reply contract.
    Initializing,
    /// Taking or opening a channel factory.
    AcquiringFactory,
    /// Taking a channel and applying message properties.
    PopulatingChannel,
    /// Computing correlation keys.
    InitializingCorrelation,
    /// Transmitting while the channel stack drives correlation.
    SynchronizingCorrelation,
    /// Transmitting.
    Transmitting,
    /// Recording the outcome.
    Finalizing,
    /// Terminal success.
    Completed,
    /// Terminal failure.
    Faulted,
}

impl SendState {
    /// Name used in logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initializing => "initializing",
            Self::AcquiringFactory => "acquiring_factory",
            Self::PopulatingChannel => "populating_channel",
            Self::InitializingCorrelation => "initializing_correlation",
            Self::SynchronizingCorrelation => "synchronizing_correlation",
            Self::Transmitting => "transmitting",
            Self::Finalizing => "finalizing",
            Self::Completed => "completed",
            Self::Faulted => "faulted",
        }
    }
}

fn enter(state: SendState) {
    debug!(state = state.as_str(), "Send state");
}

struct LastUsedFactory {
    item: CacheItem<ChannelFactoryReference>,
    cache: Weak<SendMessageChannelCache>,
}

/// Static definition of a send activity.
///
/// Built once per workflow definition and shared by every execution. It
/// remembers the factory it last used, so repeated sends skip the cache
/// lookup while that factory stays cached.
pub struct SendMessage {
    contract: Arc<ContractDescription>,
    operation: String,
    is_one_way: bool,
    endpoint: EndpointSource,
    impersonation_level: TokenImpersonationLevel,
    correlation_queries: Vec<CorrelationQuery>,
    correlation_send_names: Vec<String>,
    callback_listen_address: Option<String>,
    cache_key: OnceLock<FactoryCacheKey>,
    last_used: Mutex<Option<LastUsedFactory>>,
}

impl fmt::Debug for SendMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SendMessage")
            .field("contract", &self.contract.name)
            .field("operation", &self.operation)
            .field("is_one_way", &self.is_one_way)
            .field("endpoint", &self.endpoint)
            .field("correlation_send_names", &self.correlation_send_names)
            .finish()
    }
}

impl SendMessage {
    /// Send for `operation` of `contract` to `endpoint`.
    ///
    /// The operation must exist on the contract; its one-way flag decides
    /// whether the send is a request.
    pub fn new(
        contract: Arc<ContractDescription>,
        operation: &str,
        endpoint: EndpointSource,
    ) -> Result<Self> {
        let is_one_way = contract
            .operation(operation)
            .map(|op| op.is_one_way)
            .ok_or_else(|| {
                TetherError::validation(
                    "operation",
                    format!(
                        "contract '{}' has no operation '{operation}'",
                        contract.name
                    ),
                )
            })?;

        Ok(Self {
            contract,
            operation: operation.to_string(),
            is_one_way,
            endpoint,
            impersonation_level: TokenImpersonationLevel::default(),
            correlation_queries: Vec::new(),
            correlation_send_names: Vec::new(),
            callback_listen_address: None,
            cache_key: OnceLock::new(),
            last_used: Mutex::new(None),
        })
    }

    /// Builder: queries the channel stack evaluates on outgoing messages.
    pub fn with_correlation_queries(mut self, queries: Vec<CorrelationQuery>) -> Self {
        self.correlation_queries = queries;
        self.cache_key = OnceLock::new();
        self
    }

    /// Builder: data items the channel stack supplies before correlation.
    ///
    /// A non-empty list defers query and context initializers until the
    /// channel hands the message back.
    pub fn with_correlation_send_names(mut self, names: Vec<String>) -> Self {
        self.correlation_send_names = names;
        self
    }

    /// Builder: address this side listens on for duplex callbacks.
    pub fn with_callback_listen_address(mut self, address: impl Into<String>) -> Self {
        self.callback_listen_address = Some(address.into());
        self
    }

    /// Builder: client impersonation level.
    pub fn with_impersonation_level(mut self, level: TokenImpersonationLevel) -> Self {
        self.impersonation_level = level;
        self.cache_key = OnceLock::new();
        self
    }

    /// The contract.
    pub fn contract(&self) -> &Arc<ContractDescription> {
        &self.contract
    }

    /// Operation name.
    pub fn operation(&self) -> &str {
        &self.operation
    }

    /// Whether the operation has no reply.
    pub fn is_one_way(&self) -> bool {
        self.is_one_way
    }

    /// The endpoint.
    pub fn endpoint(&self) -> &EndpointSource {
        &self.endpoint
    }

    /// Action stamped on messages sent without one.
    pub fn request_action(&self) -> String {
        self.contract
            .operation(&self.operation)
            .and_then(|op| op.request_action())
            .map(str::to_string)
            .unwrap_or_else(|| {
                default_action(
                    &self.contract.namespace,
                    &self.contract.name,
                    &self.operation,
                    MessageDirection::Input,
                )
            })
    }

    /// Factory cache key, computed once.
    pub fn cache_key(&self) -> &FactoryCacheKey {
        self.cache_key.get_or_init(|| {
            FactoryCacheKey::new(
                self.endpoint.identity(),
                self.impersonation_level,
                self.is_one_way,
                self.contract.clone(),
                self.correlation_queries.clone(),
            )
        })
    }

    fn uses_synchronizer(&self, initializers: &[CorrelationInitializer]) -> bool {
        !self.correlation_send_names.is_empty()
            && initializers.iter().any(|init| {
                matches!(
                    init,
                    CorrelationInitializer::Query { .. } | CorrelationInitializer::Context(_)
                )
            })
    }

    fn last_used(&self) -> MutexGuard<'_, Option<LastUsedFactory>> {
        self.last_used.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn take_last_used(
        &self,
        cache: &SharedChannelCache,
    ) -> Option<CacheLease<ChannelFactoryReference>> {
        let mut slot = self.last_used();
        let last = slot.as_ref()?;
        if !std::ptr::eq(last.cache.as_ptr(), Arc::as_ptr(cache)) {
            *slot = None;
            return None;
        }
        match last.item.try_add_reference() {
            Some(lease) => Some(lease),
            None => {
                *slot = None;
                None
            }
        }
    }

    fn remember(&self, item: CacheItem<ChannelFactoryReference>, cache: &SharedChannelCache) {
        *self.last_used() = Some(LastUsedFactory {
            item,
            cache: Arc::downgrade(cache),
        });
    }
}

/// Per-execution input of a send.
#[derive(Debug, Default)]
pub struct SendRequest {
    /// Message to send.
    pub message: Message,
    /// Handle the send continues a conversation on.
    pub correlates_with: Option<CorrelationHandle>,
    /// Handles this send initializes.
    pub initializers: Vec<CorrelationInitializer>,
    /// Address overriding the endpoint's default.
    pub endpoint_address: Option<String>,
}

impl SendRequest {
    /// Request carrying `message`.
    pub fn new(message: Message) -> Self {
        Self {
            message,
            ..Self::default()
        }
    }

    /// Builder: continue the conversation on `handle`.
    pub fn correlates_with(mut self, handle: CorrelationHandle) -> Self {
        self.correlates_with = Some(handle);
        self
    }

    /// Builder: add an initializer.
    pub fn initialize(mut self, initializer: CorrelationInitializer) -> Self {
        self.initializers.push(initializer);
        self
    }

    /// Builder: send to `address` instead of the endpoint default.
    pub fn to_address(mut self, address: impl Into<String>) -> Self {
        self.endpoint_address = Some(address.into());
        self
    }
}

/// Cancels a registered request when the send is dropped mid-flight.
struct PendingRequest {
    context: CorrelationRequestContext,
}

impl Drop for PendingRequest {
    fn drop(&mut self) {
        // No-op once the request completed.
        self.context.cancel();
    }
}

/// Aborts a taken channel unless the send got as far as handing it back.
struct ChannelGuard {
    channel: Option<Arc<dyn Channel>>,
}

impl ChannelGuard {
    fn new(channel: Arc<dyn Channel>) -> Self {
        Self {
            channel: Some(channel),
        }
    }

    fn disarm(mut self) {
        self.channel = None;
    }
}

impl Drop for ChannelGuard {
    fn drop(&mut self) {
        if let Some(channel) = self.channel.take() {
            debug!(address = channel.remote_address(), "Send dropped mid-flight, aborting channel");
            channel.abort();
        }
    }
}

/// Lease on the factory a send runs on.
///
/// Dropping it unreleased still disposes the factory when the send held its
/// last reference and the factory is no longer cached.
struct FactoryLease {
    reference: Arc<ChannelFactoryReference>,
    lease: Option<CacheLease<ChannelFactoryReference>>,
}

impl FactoryLease {
    fn new(lease: CacheLease<ChannelFactoryReference>) -> Self {
        Self {
            reference: lease.value().clone(),
            lease: Some(lease),
        }
    }

    fn into_inner(mut self) -> Option<CacheLease<ChannelFactoryReference>> {
        self.lease.take()
    }

    /// Release without disposing, once the reference moved elsewhere.
    fn disarm(self) {
        if let Some(lease) = self.into_inner() {
            lease.release();
        }
    }

    async fn dispose(self) {
        if let Some(orphaned) = self.into_inner().and_then(CacheLease::release) {
            orphaned.dispose().await;
        }
    }
}

impl Drop for FactoryLease {
    fn drop(&mut self) {
        let Some(orphaned) = self.lease.take().and_then(CacheLease::release) else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                debug!("Send dropped mid-flight, disposing uncached channel factory");
                runtime.spawn(async move { orphaned.dispose().await });
            }
            Err(_) => {
                warn!("No runtime to dispose an uncached channel factory, aborting it");
                orphaned.abort();
            }
        }
    }
}

/// Drives sends over the shared channel cache.
pub struct SendOrchestrator {
    cache: SharedChannelCache,
    provider: Arc<dyn ChannelFactoryProvider>,
}

impl fmt::Debug for SendOrchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SendOrchestrator")
            .field("cache", &self.cache)
            .field("provider", &"...")
            .finish()
    }
}

impl SendOrchestrator {
    /// Orchestrator over `cache`, creating factories through `provider`.
    pub fn new(cache: SharedChannelCache, provider: Arc<dyn ChannelFactoryProvider>) -> Self {
        Self { cache, provider }
    }

    /// The channel cache.
    pub fn cache(&self) -> &SharedChannelCache {
        &self.cache
    }

    /// Send a client message.
    ///
    /// Two-way sends register a pending request on the request/reply (or
    /// ambient) handle before any I/O; the reply is picked up with
    /// [`ReceiveOrchestrator::receive_reply`](crate::receive::ReceiveOrchestrator::receive_reply).
    /// Failures complete that request with the same error.
    #[instrument(
        skip_all,
        fields(
            contract = %definition.contract.name,
            operation = %definition.operation,
            instance_id = %scope.instance_id()
        )
    )]
    pub async fn send(
        &self,
        definition: &SendMessage,
        request: SendRequest,
        scope: &ExecutionScope,
    ) -> Result<()> {
        let SendRequest {
            mut message,
            correlates_with,
            initializers,
            endpoint_address,
        } = request;

        enter(SendState::Initializing);
        let request_reply = resolve_request_reply_handle(
            &definition.operation,
            definition.is_one_way,
            &initializers,
            scope.ambient_handle(),
        )?;

        let pending = match &request_reply {
            Some(handle) => {
                let context = CorrelationRequestContext::new();
                if !handle.try_register_request_context(context.clone()) {
                    return Err(TetherError::invalid_operation(format!(
                        "handle '{}' already holds a pending request",
                        handle.name()
                    )));
                }
                Some(PendingRequest { context })
            }
            None => None,
        };

        if message.action().is_none() {
            message.set_action(Some(definition.request_action()));
        }
        let transient_key = request_reply
            .as_ref()
            .map(|_| InstanceKey::transient_request_reply());
        if let Some(key) = &transient_key {
            message.add_transient_key(key.clone());
        }

        let outcome = self
            .run(
                definition,
                message,
                correlates_with.as_ref(),
                &initializers,
                endpoint_address.as_deref(),
                scope,
            )
            .await;

        enter(SendState::Finalizing);
        match outcome {
            Ok(reply) => {
                if let (Some(pending), Some(reply)) = (&pending, reply) {
                    pending.context.reply(reply);
                }
                if let Some(handle) = &request_reply {
                    handle.set_transient_instance_key(transient_key);
                    handle.set_e2e_trace_id(scope.e2e_trace_id());
                }
                if let Some(handle) = &correlates_with {
                    handle.set_e2e_trace_id(scope.e2e_trace_id());
                }
                enter(SendState::Completed);
                Ok(())
            }
            Err(error) => {
                if let Some(pending) = &pending {
                    pending.context.fail(error.clone());
                }
                warn!(error = %error, code = error.error_code(), "Send failed");
                enter(SendState::Faulted);
                Err(error)
            }
        }
    }

    async fn run(
        &self,
        definition: &SendMessage,
        message: Message,
        correlates_with: Option<&CorrelationHandle>,
        initializers: &[CorrelationInitializer],
        endpoint_address: Option<&str>,
        scope: &ExecutionScope,
    ) -> Result<Option<Message>> {
        enter(SendState::AcquiringFactory);
        let factory = self.acquire_factory(definition).await?;
        let reference = factory.reference.clone();

        let outcome = self
            .run_on_factory(
                &reference,
                definition,
                message,
                correlates_with,
                initializers,
                endpoint_address,
                scope,
            )
            .await;

        if let Some(lease) = factory.into_inner() {
            self.release_factory(definition, lease).await;
        }
        outcome
    }

    async fn acquire_factory(&self, definition: &SendMessage) -> Result<FactoryLease> {
        let cacheable =
            definition.endpoint.is_safe_for_cache() || self.cache.allow_unsafe_caching();

        if cacheable {
            if let Some(lease) = definition.take_last_used(&self.cache) {
                debug!("Reusing last-used channel factory");
                return Ok(FactoryLease::new(lease));
            }
            if let Some(lease) = self.cache.factory_cache().take(definition.cache_key()) {
                debug!("Channel factory cache hit");
                return Ok(FactoryLease::new(lease));
            }
        }

        let factory = self.provider.create_factory(
            definition.endpoint.endpoint(),
            &definition.contract,
            definition.is_one_way,
        )?;
        // Factories that never enter the cache do not pool channels either.
        let channel_settings = if cacheable {
            self.cache.channel_settings()
        } else {
            ChannelCacheSettings::empty()
        };
        let reference = Arc::new(ChannelFactoryReference::new(
            definition.cache_key().clone(),
            factory,
            channel_settings,
            self.cache.close_timeout(),
        ));
        let pending = FactoryLease::new(CacheLease::detached(reference.clone()));

        if reference.needs_open() {
            debug!(cacheable, "Opening channel factory");
            if let Err(error) = reference.open().await {
                pending.dispose().await;
                return Err(error);
            }
        }

        if !cacheable {
            return Ok(pending);
        }
        pending.disarm();
        Ok(FactoryLease::new(
            self.cache
                .factory_cache()
                .add(definition.cache_key().clone(), reference),
        ))
    }

    async fn release_factory(
        &self,
        definition: &SendMessage,
        lease: CacheLease<ChannelFactoryReference>,
    ) {
        let item = lease.item();
        let cached = lease.is_cached();
        if let Some(orphaned) = lease.release() {
            debug!("Disposing uncached channel factory");
            orphaned.dispose().await;
            return;
        }
        if cached {
            definition.remember(item, &self.cache);
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_on_factory(
        &self,
        reference: &ChannelFactoryReference,
        definition: &SendMessage,
        mut message: Message,
        correlates_with: Option<&CorrelationHandle>,
        initializers: &[CorrelationInitializer],
        endpoint_address: Option<&str>,
        scope: &ExecutionScope,
    ) -> Result<Option<Message>> {
        enter(SendState::PopulatingChannel);
        let address = resolve_address(definition, correlates_with, endpoint_address)?;
        let (channel, pool) = reference.take_channel(&address).await?;
        let guard = ChannelGuard::new(channel.clone());

        let outcome = match populate(definition, &mut message, correlates_with, scope) {
            Ok(()) => {
                enter(SendState::InitializingCorrelation);
                if definition.uses_synchronizer(initializers) {
                    enter(SendState::SynchronizingCorrelation);
                    transmit_synchronized(&channel, definition, message, initializers, scope)
                        .await
                } else {
                    match initialize_correlations(&message, initializers) {
                        Ok(keys) => {
                            attach_keys(&mut message, keys);
                            enter(SendState::Transmitting);
                            transmit(&channel, message, definition.is_one_way, scope).await
                        }
                        Err(error) => Err(error),
                    }
                }
            }
            Err(error) => Err(error),
        };

        guard.disarm();
        match &outcome {
            Err(error) if error.is_transport_fault() => {
                reference.discard_channel(channel, pool).await;
            }
            _ => reference.return_channel(channel, pool).await,
        }
        outcome
    }

    /// Answer the request a paired receive registered.
    ///
    /// The response context is claimed from the correlates-with handle, or
    /// the ambient handle. An error stashed on it, or a fault message, is
    /// sent as a fault. Correlation is initialized from the outgoing reply
    /// before it is handed over.
    #[instrument(
        skip_all,
        fields(
            contract = %receive.contract().name,
            operation = %receive.operation(),
            instance_id = %scope.instance_id()
        )
    )]
    pub async fn send_reply(
        &self,
        receive: &ReceiveMessage,
        request: SendRequest,
        scope: &ExecutionScope,
    ) -> Result<()> {
        let SendRequest {
            mut message,
            correlates_with,
            initializers,
            ..
        } = request;

        enter(SendState::Initializing);
        if receive.is_one_way() {
            return Err(TetherError::validation(
                "operation",
                format!("one-way operation '{}' has no reply", receive.operation()),
            ));
        }
        let handle = correlates_with
            .as_ref()
            .or(scope.ambient_handle())
            .ok_or_else(|| {
                TetherError::invalid_operation(format!(
                    "reply to '{}' needs a correlated request",
                    receive.operation()
                ))
            })?;
        let response = handle.try_acquire_response_context().ok_or_else(|| {
            TetherError::invalid_operation(format!(
                "handle '{}' has no pending request to reply to",
                handle.name()
            ))
        })?;

        if message.action().is_none() && !message.is_fault() {
            message.set_action(Some(receive.reply_action()));
        }

        let has_context_initializer = initializers
            .iter()
            .any(|init| matches!(init, CorrelationInitializer::Context(_)));
        if has_context_initializer && message.properties().context.is_none() {
            let instance_id = scope
                .instance_key()
                .map(InstanceKey::id)
                .unwrap_or(scope.instance_id());
            message.properties_mut().context = Some(ContextProperty::new(BTreeMap::from([(
                INSTANCE_ID_CONTEXT_KEY.to_string(),
                instance_id.to_string(),
            )])));
        }

        enter(SendState::InitializingCorrelation);
        let prepared = initialize_correlations(&message, &initializers).and_then(|_| {
            scope
                .send_callbacks()
                .iter()
                .try_for_each(|callback| callback.on_send_message(&mut message, scope.instance_id()))
        });
        if let Err(error) = prepared {
            response.send_fault(error.clone());
            enter(SendState::Faulted);
            return Err(error);
        }

        enter(SendState::Transmitting);
        let delivered = match response.exception() {
            Some(error) => response.send_fault(error),
            None => match message.to_fault_error() {
                Some(fault) => response.send_fault(fault),
                None => response.send_reply(message),
            },
        };

        enter(SendState::Finalizing);
        if !delivered {
            enter(SendState::Faulted);
            return Err(TetherError::invalid_operation(
                "the request was already answered",
            ));
        }
        handle.set_e2e_trace_id(scope.e2e_trace_id());
        enter(SendState::Completed);
        Ok(())
    }
}

fn resolve_address(
    definition: &SendMessage,
    correlates_with: Option<&CorrelationHandle>,
    endpoint_address: Option<&str>,
) -> Result<String> {
    correlates_with
        .and_then(|handle| handle.callback_context())
        .and_then(|callback| callback.listen_address)
        .or_else(|| endpoint_address.map(str::to_string))
        .or_else(|| definition.endpoint.endpoint().address.clone())
        .ok_or_else(|| {
            TetherError::validation(
                "endpoint_address",
                format!("no address to send '{}' to", definition.operation),
            )
        })
}

fn populate(
    definition: &SendMessage,
    message: &mut Message,
    correlates_with: Option<&CorrelationHandle>,
    scope: &ExecutionScope,
) -> Result<()> {
    if let Some(handle) = correlates_with {
        if let Some(context) = handle.context() {
            merge_context(message, context)?;
        }
        if let Some(callback) = handle.callback_context()
            && !callback.context.is_empty()
        {
            merge_context(message, ContextProperty::new(callback.context))?;
        }
    }

    if let Some(listen_address) = &definition.callback_listen_address
        && message.properties().callback_context.is_none()
    {
        let instance_id = conversation_instance_id(correlates_with.or(scope.ambient_handle()));
        message.properties_mut().callback_context = Some(CallbackContextProperty {
            listen_address: Some(listen_address.clone()),
            context: BTreeMap::from([(
                INSTANCE_ID_CONTEXT_KEY.to_string(),
                instance_id.to_string(),
            )]),
        });
    }

    for callback in scope.send_callbacks() {
        callback.on_send_message(message, scope.instance_id())?;
    }
    Ok(())
}

fn merge_context(message: &mut Message, context: ContextProperty) -> Result<()> {
    match &message.properties().context {
        Some(existing) if *existing != context => Err(TetherError::invalid_operation(
            "message already carries a different context",
        )),
        Some(_) => Ok(()),
        None => {
            message.properties_mut().context = Some(context);
            Ok(())
        }
    }
}

/// Instance id announced in the callback context.
///
/// The first message of a conversation mints one and binds it into the
/// handle's scope; later messages reuse it.
fn conversation_instance_id(handle: Option<&CorrelationHandle>) -> Uuid {
    if let Some(id) = handle.and_then(|h| h.scope().key().map(InstanceKey::id)) {
        return id;
    }
    let id = Uuid::new_v4();
    if let Some(handle) = handle {
        debug!(handle = handle.name(), instance_id = %id, "Conversation scope initialized");
        handle.initialize_scope(InstanceKey::new(id));
    }
    id
}

fn attach_keys(message: &mut Message, keys: Vec<InstanceKey>) {
    let mut keys = keys.into_iter();
    let Some(primary) = keys.next() else {
        return;
    };
    match message.properties_mut().correlation.as_mut() {
        Some(property) if property.correlation_key.is_valid() => {
            property
                .additional_keys
                .extend(std::iter::once(primary).chain(keys));
        }
        Some(property) => {
            property.correlation_key = primary;
            property.additional_keys.extend(keys);
        }
        None => {
            message.properties_mut().correlation = Some(CorrelationMessageProperty {
                correlation_key: primary,
                additional_keys: keys.collect(),
                transient_keys: Vec::new(),
            });
        }
    }
}

async fn transmit(
    channel: &Arc<dyn Channel>,
    message: Message,
    is_one_way: bool,
    scope: &ExecutionScope,
) -> Result<Option<Message>> {
    if channel.state() == CommunicationState::Created {
        channel.open().await?;
    }

    let mut clone = DependentCloneGuard::block_commit(scope.transaction());
    let result = if is_one_way {
        channel.send(message).await.map(|()| None)
    } else {
        channel.request(message).await.map(Some)
    };
    clone.complete();
    result
}

/// Transmit while the channel stack hands the message back for correlation.
///
/// Both halves run concurrently; the synchronizer decides which one
/// finalizes. When the transport finishes without ever asking for the
/// message, keys are computed from the message as it was sent.
async fn transmit_synchronized(
    channel: &Arc<dyn Channel>,
    definition: &SendMessage,
    mut message: Message,
    initializers: &[CorrelationInitializer],
    scope: &ExecutionScope,
) -> Result<Option<Message>> {
    let synchronizer = Arc::new(CorrelationSynchronizer::new());
    let as_sent = message.clone();
    message.properties_mut().correlation_callback = Some(CorrelationCallbackProperty {
        send_names: definition.correlation_send_names.clone(),
        synchronizer: synchronizer.clone(),
    });

    let transmission = transmit(channel, message, definition.is_one_way, scope);
    let correlation = correlate_deferred(&synchronizer, initializers);
    tokio::pin!(transmission);
    tokio::pin!(correlation);

    let mut transmitted: Option<Result<Option<Message>>> = None;
    let mut correlated: Option<Result<bool>> = None;
    let mut finalized_by_send = false;

    while transmitted.is_none() || correlated.is_none() {
        tokio::select! {
            result = &mut transmission, if transmitted.is_none() => {
                finalized_by_send = synchronizer.notify_send_complete();
                transmitted = Some(result);
                if correlated.is_none() && !synchronizer.is_channel_work_complete() {
                    break;
                }
            }
            result = &mut correlation, if correlated.is_none() => {
                correlated = Some(result);
            }
        }
    }

    let correlation = match correlated {
        Some(result) => result,
        None => {
            debug!("Channel never requested correlation, correlating the sent message");
            initialize_correlations(&as_sent, initializers).map(|_| false)
        }
    };
    let finalized_by_correlation = *correlation.as_ref().unwrap_or(&false);
    debug!(
        finalized_by = if finalized_by_send {
            "send"
        } else if finalized_by_correlation {
            "correlation"
        } else {
            "none"
        },
        "Synchronized send finalized"
    );

    correlation?;
    transmitted.unwrap_or(Err(TetherError::Cancelled))
}

async fn correlate_deferred(
    synchronizer: &CorrelationSynchronizer,
    initializers: &[CorrelationInitializer],
) -> Result<bool> {
    synchronizer.wait_for_channel().await;

    let Some(mut message) = synchronizer.channel_message() else {
        synchronizer.abandon();
        return Err(TetherError::invalid_operation(
            "channel requested correlation without a message",
        ));
    };
    message.properties_mut().correlation_callback = None;

    match initialize_correlations(&message, initializers) {
        Ok(keys) => {
            attach_keys(&mut message, keys);
            synchronizer.notify_message_updated_by_workflow(message);
            Ok(synchronizer.notify_workflow_correlation_processing_complete())
        }
        Err(error) => {
            synchronizer.abandon();
            Err(error)
        }
    }
}
