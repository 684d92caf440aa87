use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock},
};

use ditto_core::{
    AccessToken, AckCompletion, Acknowledgement, Acknowledgements, Channel, ClassificationKey,
    ClientError, ConsumptionOptions, ConsumptionPhase, ConsumptionStateMachine,
    CredentialProvider, DedicatedScheduler, Dispatcher, Envelope, ErrorCategory, EventStream,
    Inbound, RegistrationHandle, Retry, Selector, SessionChannels, SessionEvent, SessionState,
    Signal, SubStream, Subscriber, TokenRefresher, TokenSink, acknowledgements_from_envelope,
    acks::AcknowledgementAggregator, consumption::sub_streams_for, is_recoverable,
    protocol::token_frame,
};
use tokio::{runtime::Handle, sync::mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::{
    config::SessionConfig,
    transport::{Transport, TransportLink},
};

const EVENT_BUFFER: usize = 256;

/// Executors the session runs its work on.
#[derive(Clone, Debug)]
pub struct Executors {
    /// Runs user handlers, never the transport reader.
    pub delivery: Handle,
    /// Runs connect retries.
    pub reconnect: Handle,
    /// Runs token refresh timers; `None` gives every refresher its own thread.
    pub token_refresh: Option<Handle>,
}

impl Executors {
    /// Everything on the ambient runtime.
    pub fn current() -> Self {
        let handle = Handle::current();
        Self {
            delivery: handle.clone(),
            reconnect: handle.clone(),
            token_refresh: Some(handle),
        }
    }
}

/// Outcome of [`DittoSession::send`].
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    /// The correlated response envelope.
    Reply(Envelope),
    /// Every requested acknowledgement, all successful.
    Acknowledged(Acknowledgements),
}

/// Sender of the current connection, swapped on reconnect.
#[derive(Default)]
struct Outbound {
    sender: RwLock<Option<mpsc::Sender<String>>>,
}

impl Outbound {
    fn install(&self, sender: mpsc::Sender<String>) {
        *self.sender.write().unwrap_or_else(PoisonError::into_inner) = Some(sender);
    }

    fn clear(&self) {
        self.sender
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    fn current(&self) -> Result<mpsc::Sender<String>, ClientError> {
        self.sender
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(not_connected)
    }
}

struct TransportTokenSink {
    outbound: Arc<Outbound>,
    channels: SessionChannels,
}

impl TokenSink for TransportTokenSink {
    fn push(&self, token: &AccessToken) -> Result<(), ClientError> {
        self.outbound
            .current()?
            .try_send(token_frame(&token.token))
            .map_err(|err| {
                ClientError::new(
                    ErrorCategory::Network,
                    "token_push_failed",
                    format!("could not queue token frame: {err}"),
                )
            })?;
        self.channels.emit(SessionEvent::TokenPushed);
        Ok(())
    }
}

/// One consumption control command awaiting its `:ACK`.
struct Handshake {
    sub_stream: SubStream,
    command: String,
    ack: String,
    /// Options to keep for a start; `None` for a stop.
    starting: Option<ConsumptionOptions>,
}

struct SessionInner<T> {
    session_id: String,
    config: SessionConfig,
    transport: Arc<T>,
    executors: Executors,
    dispatcher: Dispatcher,
    acks: AcknowledgementAggregator,
    consumption: ConsumptionStateMachine,
    consumption_options: Mutex<HashMap<SubStream, ConsumptionOptions>>,
    outbound: Arc<Outbound>,
    channels: SessionChannels,
    reconnect_scheduler: Mutex<Option<DedicatedScheduler>>,
    token_refresher: Mutex<Option<TokenRefresher>>,
    stop: CancellationToken,
}

/// One multiplexed connection to the backend.
pub struct DittoSession<T: Transport> {
    inner: Arc<SessionInner<T>>,
}

impl<T: Transport> DittoSession<T> {
    /// Connect, retrying recoverable failures on `executors.reconnect`.
    pub async fn connect(
        config: SessionConfig,
        transport: Arc<T>,
        executors: Executors,
    ) -> Result<Self, ClientError> {
        Self::connect_inner(config, transport, executors, None).await
    }

    /// Connect with retries and token refreshes on dedicated scheduler
    /// threads and delivery on the ambient runtime.
    pub async fn connect_dedicated(
        config: SessionConfig,
        transport: Arc<T>,
    ) -> Result<Self, ClientError> {
        let scheduler = DedicatedScheduler::start("ditto-reconnect")?;
        let executors = Executors {
            delivery: Handle::current(),
            reconnect: scheduler.handle(),
            token_refresh: None,
        };
        Self::connect_inner(config, transport, executors, Some(scheduler)).await
    }

    async fn connect_inner(
        config: SessionConfig,
        transport: Arc<T>,
        executors: Executors,
        reconnect_scheduler: Option<DedicatedScheduler>,
    ) -> Result<Self, ClientError> {
        let session_id = format!("{}-{}", config.session_name, Uuid::new_v4());
        let inner = Arc::new(SessionInner {
            session_id,
            dispatcher: Dispatcher::new(executors.delivery.clone()),
            acks: AcknowledgementAggregator::new(),
            consumption: ConsumptionStateMachine::new(),
            consumption_options: Mutex::new(HashMap::new()),
            outbound: Arc::new(Outbound::default()),
            channels: SessionChannels::new(EVENT_BUFFER),
            reconnect_scheduler: Mutex::new(reconnect_scheduler),
            token_refresher: Mutex::new(None),
            stop: CancellationToken::new(),
            config,
            transport,
            executors,
        });

        info!(
            session = %inner.session_id,
            endpoint = %inner.config.endpoint,
            "connecting session"
        );
        inner.emit_state(SessionState::Connecting);
        let session = Self { inner };
        session.inner.establish().await?;
        Ok(session)
    }

    pub fn session_id(&self) -> &str {
        &self.inner.session_id
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    /// Subscribe to connection, consumption and token events.
    pub fn subscribe_events(&self) -> EventStream {
        self.inner.channels.subscribe()
    }

    /// Send a signal and wait for its response, or for every requested
    /// acknowledgement when the signal requests any.
    pub async fn send(&self, signal: Signal) -> Result<Response, ClientError> {
        let inner = &self.inner;
        let correlation_id = signal.correlation_id().to_owned();
        let frame = signal.to_json()?;

        if signal.requested_acks().is_empty() {
            let pending = inner
                .dispatcher
                .expect_once(ClassificationKey::correlation_id(&correlation_id));
            inner.transmit(frame).await?;
            let reply = pending.wait(inner.config.request_timeout).await?;
            return reply_envelope(reply).map(Response::Reply);
        }

        let completion = inner
            .acks
            .expect_all(&correlation_id, signal.requested_acks().iter().cloned())?;
        if let Err(err) = inner.transmit(frame).await {
            inner.acks.discard(&correlation_id);
            return Err(err);
        }
        inner
            .await_acknowledgements(&correlation_id, completion)
            .await
            .map(Response::Acknowledged)
    }

    /// Send a signal and hand every requested acknowledgement to `handler`
    /// as it arrives, without aggregating them.
    pub async fn send_with_ack_handler(
        &self,
        signal: Signal,
        handler: impl Fn(Acknowledgement) + Send + Sync + 'static,
    ) -> Result<(), ClientError> {
        let inner = &self.inner;
        let correlation_id = signal.correlation_id().to_owned();
        let frame = signal.to_json()?;

        inner.acks.expect_each(
            &correlation_id,
            signal.requested_acks().iter().cloned(),
            Arc::new(handler),
        )?;
        if let Err(err) = inner.transmit(frame).await {
            inner.acks.discard(&correlation_id);
            return Err(err);
        }

        let waited = inner.config.acknowledgement_timeout;
        let weak = Arc::downgrade(inner);
        inner.executors.delivery.spawn(async move {
            tokio::time::sleep(waited).await;
            if let Some(inner) = weak.upgrade() {
                inner.acks.expire(&correlation_id, waited);
            }
        });
        Ok(())
    }

    /// Route change notifications whose resource pointer matches `selector`
    /// to `handler`. `id` must be unique within the session.
    pub fn register(
        &self,
        id: impl Into<String>,
        selector: Selector,
        handler: impl Fn(Envelope) + Send + Sync + 'static,
    ) -> Result<RegistrationHandle<Subscriber>, ClientError> {
        let id = id.into();
        debug!(session = %self.inner.session_id, id = %id, selector = %selector, "registering change handler");
        self.inner
            .dispatcher
            .register(id, selector, envelope_handler(handler))
    }

    pub fn deregister(&self, id: &str) -> bool {
        self.inner.dispatcher.deregister(id)
    }

    /// Deliver results of one search subscription to `handler` in arrival
    /// order.
    pub fn subscribe_search(
        &self,
        subscription_id: impl Into<String>,
        handler: impl Fn(Envelope) + Send + Sync + 'static,
    ) -> RegistrationHandle<Subscriber> {
        self.inner.dispatcher.subscribe(
            ClassificationKey::search_subscription(subscription_id),
            envelope_handler(handler),
        )
    }

    /// Start consuming the given sub-streams of `channel`, all of them when
    /// `sub_streams` is empty.
    pub async fn start_consumption(
        &self,
        channel: Channel,
        sub_streams: &[SubStream],
    ) -> Result<(), ClientError> {
        self.start_consumption_with(channel, sub_streams, ConsumptionOptions::default())
            .await
    }

    pub async fn start_consumption_with(
        &self,
        channel: Channel,
        sub_streams: &[SubStream],
        options: ConsumptionOptions,
    ) -> Result<(), ClientError> {
        let inner = &self.inner;
        let requested = sub_streams_for(channel, sub_streams)?;
        let acquired = inner.consumption.begin_start(&requested)?;

        let handshakes = acquired
            .into_iter()
            .map(|sub_stream| {
                inner.emit_phase(sub_stream);
                Handshake {
                    sub_stream,
                    command: options.start_command(sub_stream),
                    ack: sub_stream.start_ack(),
                    starting: Some(options.clone()),
                }
            })
            .collect::<Vec<_>>();
        inner.run_handshakes(handshakes).await
    }

    /// Stop every active sub-stream of `channel`.
    pub async fn stop_consumption(&self, channel: Channel) -> Result<(), ClientError> {
        let inner = &self.inner;
        let acquired = inner.consumption.begin_stop(channel.sub_streams())?;

        let handshakes = acquired
            .into_iter()
            .map(|sub_stream| {
                inner.emit_phase(sub_stream);
                Handshake {
                    sub_stream,
                    command: sub_stream.stop_command().to_owned(),
                    ack: sub_stream.stop_ack(),
                    starting: None,
                }
            })
            .collect::<Vec<_>>();
        inner.run_handshakes(handshakes).await
    }

    pub fn consumption_phase(&self, sub_stream: SubStream) -> ConsumptionPhase {
        self.inner.consumption.phase(sub_stream)
    }

    /// Keep the connection authorized by pushing a fresh token before
    /// `initial` expires. Replaces a previously enabled refresher.
    pub fn enable_token_refresh<P: CredentialProvider>(
        &self,
        provider: Arc<P>,
        initial: &AccessToken,
    ) -> Result<TokenRefresher, ClientError> {
        let inner = &self.inner;
        let sink = TransportTokenSink {
            outbound: Arc::clone(&inner.outbound),
            channels: inner.channels.clone(),
        };
        let grace = inner.config.token_grace_period;
        let refresher = match &inner.executors.token_refresh {
            Some(handle) => TokenRefresher::start(provider, sink, grace, handle, initial),
            None => TokenRefresher::start_dedicated(provider, sink, grace, initial)?,
        };
        if let Some(previous) = lock(&inner.token_refresher).replace(refresher.clone()) {
            previous.destroy();
        }
        Ok(refresher)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.stop.is_cancelled()
    }

    /// Stop every session task, fail pending requests and release the
    /// session's scheduler threads. Idempotent.
    pub fn close(&self) {
        self.inner.close();
    }
}

impl<T: Transport> Drop for DittoSession<T> {
    fn drop(&mut self) {
        self.inner.close();
    }
}

impl<T: Transport> SessionInner<T> {
    async fn establish(self: &Arc<Self>) -> Result<(), ClientError> {
        let channels = self.channels.clone();
        let stop = self.stop.clone();
        let retry = Retry::builder("connect")
            .in_session(self.session_id.clone())
            .on_scheduler(self.executors.reconnect.clone())
            .recoverable_if(move |err| !stop.is_cancelled() && is_recoverable(err))
            .notify_errors_to(move |err, attempt| {
                channels.emit(SessionEvent::ConnectAttemptFailed {
                    attempt,
                    code: err.code.clone(),
                    message: err.message.clone(),
                });
            })
            .build()?;

        let transport = Arc::clone(&self.transport);
        let stop = self.stop.clone();
        let link = retry
            .complete_eventually(move || {
                let transport = Arc::clone(&transport);
                let stop = stop.clone();
                async move {
                    if stop.is_cancelled() {
                        return Err(ClientError::session_closed());
                    }
                    transport.connect().await
                }
            })
            .await?;

        if self.stop.is_cancelled() {
            return Err(ClientError::session_closed());
        }
        let TransportLink { outbound, inbound } = link;
        self.outbound.install(outbound);
        self.emit_state(SessionState::Connected);
        info!(session = %self.session_id, "session connected");
        self.spawn_reader(inbound);
        Ok(())
    }

    /// The transport reader is the only dispatch entry point.
    fn spawn_reader(self: &Arc<Self>, mut inbound: mpsc::Receiver<String>) {
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = inner.stop.cancelled() => return,
                    frame = inbound.recv() => match frame {
                        Some(frame) => inner.handle_frame(&frame),
                        None => break,
                    },
                }
            }

            inner.outbound.clear();
            if inner.stop.is_cancelled() {
                return;
            }
            warn!(session = %inner.session_id, "connection lost, reconnecting");
            inner.emit_state(SessionState::Reconnecting);
            match inner.establish().await {
                Ok(()) => inner.resume_consumption().await,
                Err(err) => {
                    error!(session = %inner.session_id, error = %err, "reconnect failed permanently");
                    inner.close();
                }
            }
        });
    }

    fn handle_frame(&self, frame: &str) {
        let inbound = match Inbound::parse(frame) {
            Ok(inbound) => inbound,
            Err(err) => {
                warn!(session = %self.session_id, error = %err, "dropping unparseable frame");
                return;
            }
        };
        match inbound {
            Inbound::Control(control) => {
                let key = ClassificationKey::literal(control.clone());
                if self.dispatcher.dispatch_key(&key, Inbound::Control(control)) == 0 {
                    debug!(session = %self.session_id, frame = %key.value(), "unclaimed control frame");
                }
            }
            Inbound::Envelope(envelope) => self.route_envelope(envelope),
        }
    }

    fn route_envelope(&self, envelope: Envelope) {
        let correlation_id = envelope.correlation_id().map(str::to_owned);

        if let Some(correlation_id) = correlation_id.as_deref() {
            if let Some(acks) = acknowledgements_from_envelope(&envelope)
                && let Some(deliveries) = self.acks.accept(correlation_id, acks)
            {
                for delivery in deliveries {
                    self.executors.delivery.spawn(async move { delivery.run() });
                }
                return;
            }
            if let Some(status) = envelope.status
                && status >= 400
                && !envelope.is_acknowledgement()
                && self.acks.fail(
                    correlation_id,
                    ClientError::from_status(status, envelope.error_description()),
                )
            {
                return;
            }
        }

        if let Some(subscription_id) = envelope.search_subscription_id().map(str::to_owned) {
            let key = ClassificationKey::search_subscription(subscription_id);
            self.dispatcher.dispatch_key(&key, Inbound::Envelope(envelope));
            return;
        }

        if let Some(correlation_id) = correlation_id {
            let key = ClassificationKey::correlation_id(correlation_id);
            if self
                .dispatcher
                .dispatch_key(&key, Inbound::Envelope(envelope.clone()))
                > 0
            {
                return;
            }
        }

        if envelope.is_change_notification() {
            let pointer = envelope.resource_pointer();
            let delivered = self
                .dispatcher
                .dispatch_pointer(&pointer, Inbound::Envelope(envelope));
            trace!(session = %self.session_id, pointer = %pointer, delivered, "change notification routed");
        } else if envelope.is_response() {
            debug!(
                session = %self.session_id,
                topic = %envelope.topic,
                status = ?envelope.status,
                correlation_id = ?envelope.correlation_id(),
                "unclaimed response"
            );
        } else {
            debug!(session = %self.session_id, topic = %envelope.topic, "unclaimed envelope");
        }
    }

    async fn transmit(&self, frame: String) -> Result<(), ClientError> {
        if self.stop.is_cancelled() {
            return Err(ClientError::session_closed());
        }
        let sender = self.outbound.current()?;
        sender.send(frame).await.map_err(|_| {
            ClientError::new(
                ErrorCategory::Network,
                "transport_closed",
                "connection dropped before the frame was sent",
            )
        })
    }

    async fn await_acknowledgements(
        &self,
        correlation_id: &str,
        mut completion: AckCompletion,
    ) -> Result<Acknowledgements, ClientError> {
        let waited = self.config.acknowledgement_timeout;
        let outcome = match tokio::time::timeout(waited, &mut completion).await {
            Ok(outcome) => outcome,
            Err(_) => {
                self.acks.expire(correlation_id, waited);
                completion.await
            }
        };
        outcome.map_err(|_| ClientError::session_closed())?
    }

    /// Send a control command and wait for its `:ACK`.
    async fn handshake(&self, command: String, ack: String) -> Result<(), ClientError> {
        let pending = self.dispatcher.expect_once(ClassificationKey::literal(ack));
        self.transmit(command).await?;
        pending.wait(self.config.consumption_timeout).await.map(|_| ())
    }

    /// Run one handshake per sub-stream concurrently. Every sub-stream
    /// settles its own state; the first failure to arrive is returned.
    /// Options of a start are kept only once the backend acknowledged it.
    async fn run_handshakes(self: &Arc<Self>, handshakes: Vec<Handshake>) -> Result<(), ClientError> {
        let (tx, mut rx) = mpsc::channel(handshakes.len().max(1));
        for Handshake {
            sub_stream,
            command,
            ack,
            starting,
        } in handshakes
        {
            let inner = Arc::clone(self);
            let tx = tx.clone();
            tokio::spawn(async move {
                let result = inner.handshake(command, ack).await;
                let acknowledged = result.is_ok();
                match starting {
                    Some(options) => {
                        inner.consumption.finish_start(sub_stream, acknowledged);
                        if acknowledged {
                            lock(&inner.consumption_options).insert(sub_stream, options);
                        }
                    }
                    None => {
                        inner.consumption.finish_stop(sub_stream, acknowledged);
                        if acknowledged {
                            lock(&inner.consumption_options).remove(&sub_stream);
                        }
                    }
                }
                inner.emit_phase(sub_stream);
                let _ = tx.send((sub_stream, result)).await;
            });
        }
        drop(tx);

        while let Some((sub_stream, result)) = rx.recv().await {
            match result {
                Ok(()) => debug!(session = %self.session_id, %sub_stream, "consumption handshake acknowledged"),
                Err(err) => {
                    warn!(session = %self.session_id, %sub_stream, error = %err, "consumption handshake failed");
                    return Err(err);
                }
            }
        }
        Ok(())
    }

    /// Re-issue start commands for active sub-streams on a fresh connection.
    async fn resume_consumption(&self) {
        for sub_stream in self.consumption.active() {
            let command = lock(&self.consumption_options)
                .get(&sub_stream)
                .cloned()
                .unwrap_or_default()
                .start_command(sub_stream);
            if let Err(err) = self.transmit(command).await {
                warn!(session = %self.session_id, %sub_stream, error = %err, "failed to resume consumption");
            }
        }
    }

    fn emit_state(&self, state: SessionState) {
        self.channels.emit(SessionEvent::StateChanged { state });
    }

    fn emit_phase(&self, sub_stream: SubStream) {
        self.channels.emit(SessionEvent::ConsumptionChanged {
            sub_stream,
            phase: self.consumption.phase(sub_stream),
        });
    }

    fn close(&self) {
        if self.stop.is_cancelled() {
            return;
        }
        self.stop.cancel();
        self.outbound.clear();
        self.dispatcher.clear();
        self.acks.abandon_all(&ClientError::session_closed());
        self.consumption.reset();
        lock(&self.consumption_options).clear();
        if let Some(refresher) = lock(&self.token_refresher).take() {
            refresher.destroy();
        }
        if let Some(scheduler) = lock(&self.reconnect_scheduler).take() {
            scheduler.shutdown();
        }
        self.emit_state(SessionState::Closed);
        info!(session = %self.session_id, "session closed");
    }
}

fn envelope_handler(
    handler: impl Fn(Envelope) + Send + Sync + 'static,
) -> ditto_core::Handler {
    Arc::new(move |inbound: Inbound| {
        if let Inbound::Envelope(envelope) = inbound {
            handler(envelope);
        }
    })
}

fn reply_envelope(reply: Inbound) -> Result<Envelope, ClientError> {
    match reply {
        Inbound::Envelope(envelope) => match envelope.status {
            Some(status) if status >= 400 => Err(ClientError::from_status(
                status,
                envelope.error_description(),
            )),
            _ => Ok(envelope),
        },
        Inbound::Control(frame) => Err(ClientError::new(
            ErrorCategory::Internal,
            "unexpected_control_frame",
            format!("expected a response envelope, got '{frame}'"),
        )),
    }
}

fn not_connected() -> ClientError {
    ClientError::new(
        ErrorCategory::Network,
        "not_connected",
        "session has no live connection",
    )
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
