use std::sync::Arc;

use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

use herald_api::codec::encode_envelope;
use herald_api::{
    BrokerMessage, BrokerSubscription, BrokerTransport, BusError, Envelope, Header,
    OverflowPolicy, Routing, Unit,
};

use crate::config::BusConfig;
use crate::registry::{Binding, HandlerDescriptor, HandlerRegistry};

const DEFAULT_BUFFER: usize = 1024;

/// Routes inbound messages to the handlers bound to their wire type and
/// publishes replies when the sender asked for one.
pub struct EventBus {
    registry: HandlerRegistry,
    transport: Arc<dyn BrokerTransport>,
    buffer: usize,
    overflow: OverflowPolicy,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("registry", &self.registry)
            .field("buffer", &self.buffer)
            .field("overflow", &self.overflow)
            .finish()
    }
}

impl EventBus {
    pub fn new(registry: HandlerRegistry, transport: Arc<dyn BrokerTransport>) -> Self {
        Self {
            registry,
            transport,
            buffer: DEFAULT_BUFFER,
            overflow: OverflowPolicy::BackPressure,
        }
    }

    /// Bus using the subscription buffer and overflow policy of `config`.
    pub fn from_config(
        registry: HandlerRegistry,
        transport: Arc<dyn BrokerTransport>,
        config: &BusConfig,
    ) -> Self {
        Self::new(registry, transport)
            .with_subscription(config.subscription_buffer, config.overflow)
    }

    /// Buffer size and overflow policy of the broker subscriptions opened by
    /// [`listen`](Self::listen).
    pub fn with_subscription(mut self, buffer: usize, overflow: OverflowPolicy) -> Self {
        self.buffer = buffer;
        self.overflow = overflow;
        self
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    pub fn wire_types(&self) -> Vec<String> {
        self.registry.wire_types()
    }

    /// Check that every wire type has a handler. The error names all
    /// missing types at once.
    pub fn validate<I, S>(&self, wire_types: I) -> Result<(), BusError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let missing = self.registry.missing(wire_types);
        if missing.is_empty() {
            Ok(())
        } else {
            Err(BusError::EventHandlerNotFound {
                wire_types: missing,
            })
        }
    }

    /// Handle one inbound message.
    ///
    /// A message whose sender awaits a reply goes to the single bound
    /// handler, and that handler's error is returned. A lone fire-and-forget
    /// handler answers with `Unit`. Errors of invocations nobody waits on are
    /// logged only.
    pub async fn dispatch(&self, message: BrokerMessage) -> Result<(), BusError> {
        let envelope = Envelope::decode(&message.payload)?;
        let wire_type = envelope.wire_type().to_string();
        let Some(binding) = self.registry.binding(&wire_type) else {
            return Err(BusError::EventHandlerNotFound {
                wire_types: vec![wire_type],
            });
        };

        match binding {
            Binding::Reply(descriptor) => match &message.reply_to {
                Some(reply_to) => {
                    let reply = descriptor.invoke(envelope, true).await?;
                    self.reply(&wire_type, descriptor, reply_to, &message, reply).await
                }
                None => {
                    if let Err(e) = descriptor.invoke(envelope, false).await {
                        tracing::error!(
                            %wire_type,
                            handler = descriptor.handler(),
                            error = %e,
                            "handler failed"
                        );
                    }
                    Ok(())
                }
            },
            Binding::Listeners(listeners) => match (&message.reply_to, listeners.as_slice()) {
                // A lone handler answers with `Unit` when the sender waits.
                (Some(reply_to), [only]) => {
                    let reply = only.invoke(envelope, true).await?;
                    self.reply(&wire_type, only, reply_to, &message, reply).await
                }
                (reply_to, _) => {
                    if reply_to.is_some() {
                        tracing::warn!(
                            %wire_type,
                            correlation_id = %message.correlation_id,
                            listeners = listeners.len(),
                            "reply requested but several fire-and-forget handlers are bound"
                        );
                    }
                    run_listeners(&wire_type, listeners, envelope).await;
                    Ok(())
                }
            },
        }
    }

    async fn reply(
        &self,
        wire_type: &str,
        descriptor: &HandlerDescriptor,
        reply_to: &str,
        request: &BrokerMessage,
        reply: serde_json::Value,
    ) -> Result<(), BusError> {
        let reply_type = match descriptor.reply_type() {
            Some(reply_type) => reply_type,
            None => self.registry.resolver().resolve::<Unit>(),
        };
        let header = Header::with_correlation_id(request.correlation_id.clone());
        let payload = encode_envelope(reply_type, &header, &reply)?;

        let routing = self
            .transport
            .publish(BrokerMessage {
                routing_key: reply_to.to_string(),
                payload,
                correlation_id: request.correlation_id.clone(),
                reply_to: None,
            })
            .await
            .map_err(|e| e.with_context(format!("reply to '{wire_type}'")))?;

        if routing == Routing::Unroutable {
            tracing::debug!(
                %wire_type,
                correlation_id = %request.correlation_id,
                "reply address gone, caller no longer waiting"
            );
        }
        Ok(())
    }

    /// Subscribe every bound wire type on the transport and spawn one
    /// processing loop per subscription.
    ///
    /// Dispatch failures are logged and the loop keeps going; loops stop
    /// when `token` is cancelled or the broker closes the subscription.
    pub async fn listen(
        self: Arc<Self>,
        token: CancellationToken,
    ) -> Result<Vec<JoinHandle<()>>, BusError> {
        let mut handles: Vec<JoinHandle<()>> = Vec::new();
        for wire_type in self.registry.wire_types() {
            let subscription = match self
                .transport
                .subscribe(&wire_type, self.buffer, self.overflow)
                .await
            {
                Ok(subscription) => subscription,
                Err(e) => {
                    for handle in &handles {
                        handle.abort();
                    }
                    return Err(e.with_context(format!("subscribe '{wire_type}'")));
                }
            };
            handles.push(spawn_listener(self.clone(), subscription, token.clone()));
        }
        tracing::info!(wire_types = handles.len(), "event bus listening");
        Ok(handles)
    }
}

/// Run every listener independently; failures and panics are logged.
async fn run_listeners(wire_type: &str, listeners: &[HandlerDescriptor], envelope: Envelope) {
    let mut set = JoinSet::new();
    for listener in listeners {
        let handler = listener.handler();
        let invocation = listener.invoke(envelope.clone(), false);
        set.spawn(async move { (handler, invocation.await) });
    }

    while let Some(joined) = set.join_next().await {
        match joined {
            Ok((_, Ok(_))) => {}
            Ok((handler, Err(e))) => {
                tracing::error!(%wire_type, handler, error = %e, "handler failed");
            }
            Err(e) => {
                tracing::error!(%wire_type, error = %e, "handler panicked");
            }
        }
    }
}

fn spawn_listener(
    bus: Arc<EventBus>,
    mut subscription: Box<dyn BrokerSubscription>,
    token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let wire_type = subscription.routing_key().to_string();
        loop {
            tokio::select! {
                message = subscription.recv() => {
                    match message {
                        Some(message) => {
                            let correlation_id = message.correlation_id.clone();
                            if let Err(e) = bus.dispatch(message).await {
                                tracing::error!(
                                    %wire_type,
                                    %correlation_id,
                                    error = %e,
                                    "dispatch failed"
                                );
                            }
                        }
                        None => break,
                    }
                }
                _ = token.cancelled() => break,
            }
        }
        tracing::info!(%wire_type, "listener stopped");
    })
}

#[cfg(test)]
mod tests {
    use std::future::Future;
    use std::pin::Pin;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    use serde::{Deserialize, Serialize};

    use super::*;
    use crate::memory::MemoryBroker;
    use herald_api::{CorrelationId, Event, ReplyChannel, Request, Unit, WireTypeResolver};

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Ping {
        seq: u32,
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Pong {
        seq: u32,
    }

    impl herald_api::Reply for Pong {}

    impl Request for Ping {
        type Reply = Pong;
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Audit {
        note: String,
    }

    impl Request for Audit {
        type Reply = Unit;
    }

    fn inbound<T: Serialize>(
        wire_type: &str,
        payload: &T,
        reply_to: Option<&str>,
    ) -> BrokerMessage {
        let header = Header::new();
        BrokerMessage {
            routing_key: wire_type.to_string(),
            payload: encode_envelope(wire_type, &header, payload).unwrap(),
            correlation_id: header.correlation_id().clone(),
            reply_to: reply_to.map(str::to_string),
        }
    }

    fn bus(registry: HandlerRegistry, broker: &MemoryBroker) -> EventBus {
        EventBus::new(registry, Arc::new(broker.clone()))
    }

    #[tokio::test]
    async fn unbound_wire_type_is_not_found() {
        let broker = MemoryBroker::new();
        let bus = bus(HandlerRegistry::default(), &broker);

        let err = bus.dispatch(inbound("Ping", &Ping { seq: 1 }, None)).await.unwrap_err();
        assert_eq!(
            err,
            BusError::EventHandlerNotFound {
                wire_types: vec!["Ping".into()]
            }
        );
    }

    #[tokio::test]
    async fn validate_names_all_missing_types() {
        let broker = MemoryBroker::new();
        let mut registry = HandlerRegistry::default();
        registry
            .subscribe::<Audit, _>(|_: Event<Audit>| async { Ok::<(), BusError>(()) })
            .unwrap();
        let bus = bus(registry, &broker);

        assert!(bus.validate(["Audit"]).is_ok());
        let err = bus.validate(["Ping", "Audit", "Refund", "Close"]).unwrap_err();
        assert_eq!(
            err,
            BusError::EventHandlerNotFound {
                wire_types: vec!["Ping".into(), "Refund".into(), "Close".into()]
            }
        );
    }

    #[tokio::test]
    async fn reply_is_published_to_reply_address() {
        let broker = MemoryBroker::new();
        let mut registry = HandlerRegistry::default();
        registry
            .subscribe_reply::<Ping, _>(|event: Event<Ping>| async move {
                assert!(event.expects_reply());
                Ok::<_, BusError>(Pong { seq: event.payload().seq + 1 })
            })
            .unwrap();
        let bus = bus(registry, &broker);

        let mut channel = broker.reply_channel(&CorrelationId::new()).await.unwrap();
        let request = inbound("Ping", &Ping { seq: 41 }, Some(channel.address()));
        let request_id = request.correlation_id.clone();
        bus.dispatch(request).await.unwrap();

        let reply = channel.recv().await.unwrap();
        assert_eq!(reply.correlation_id, request_id);
        let envelope = Envelope::decode(&reply.payload).unwrap();
        assert_eq!(envelope.wire_type(), "Pong");
        assert_eq!(envelope.header().correlation_id(), &request_id);
        assert_eq!(envelope.into_payload::<Pong>().unwrap(), Pong { seq: 42 });
    }

    #[tokio::test]
    async fn reply_handler_error_propagates_when_reply_expected() {
        let broker = MemoryBroker::new();
        let mut registry = HandlerRegistry::default();
        registry
            .subscribe_reply::<Ping, _>(|_: Event<Ping>| async {
                Err::<Pong, _>(BusError::application("ledger closed"))
            })
            .unwrap();
        let bus = bus(registry, &broker);

        let channel = broker.reply_channel(&CorrelationId::new()).await.unwrap();
        let err = bus
            .dispatch(inbound("Ping", &Ping { seq: 1 }, Some(channel.address())))
            .await
            .unwrap_err();
        assert_eq!(err, BusError::Application("ledger closed".into()));
    }

    #[tokio::test]
    async fn reply_handler_error_is_swallowed_without_reply() {
        let broker = MemoryBroker::new();
        let calls = Arc::new(AtomicU32::new(0));
        let seen = calls.clone();
        let mut registry = HandlerRegistry::default();
        registry
            .subscribe_reply::<Ping, _>(move |event: Event<Ping>| {
                let seen = seen.clone();
                async move {
                    assert!(!event.expects_reply());
                    seen.fetch_add(1, Ordering::SeqCst);
                    Err::<Pong, _>(BusError::application("ignored"))
                }
            })
            .unwrap();
        let bus = bus(registry, &broker);

        bus.dispatch(inbound("Ping", &Ping { seq: 1 }, None)).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn every_listener_runs_even_if_one_fails() {
        let broker = MemoryBroker::new();
        let notes = Arc::new(Mutex::new(Vec::new()));
        let mut registry = HandlerRegistry::default();

        registry
            .subscribe::<Audit, _>(|_: Event<Audit>| async {
                Err::<(), _>(BusError::application("disk full"))
            })
            .unwrap();
        for name in ["first", "second"] {
            let notes = notes.clone();
            registry
                .subscribe::<Audit, _>(move |event: Event<Audit>| {
                    let notes = notes.clone();
                    async move {
                        notes.lock().unwrap().push(format!("{name}:{}", event.payload().note));
                        Ok::<(), BusError>(())
                    }
                })
                .unwrap();
        }
        let bus = bus(registry, &broker);

        bus.dispatch(inbound("Audit", &Audit { note: "x".into() }, None))
            .await
            .unwrap();

        let mut notes = notes.lock().unwrap().clone();
        notes.sort();
        assert_eq!(notes, vec!["first:x".to_string(), "second:x".to_string()]);
    }

    #[tokio::test]
    async fn renamed_type_dispatches_like_native_name() {
        #[derive(Debug, Clone, Serialize, Deserialize)]
        struct PingV2 {
            seq: u32,
        }

        impl Request for PingV2 {
            type Reply = Pong;
        }

        let broker = MemoryBroker::new();
        let mut registry = HandlerRegistry::new(WireTypeResolver::new().rename::<PingV2>("Ping"));
        registry
            .subscribe_reply::<PingV2, _>(|event: Event<PingV2>| async move {
                Ok::<_, BusError>(Pong { seq: event.payload().seq })
            })
            .unwrap();
        let bus = bus(registry, &broker);

        let mut channel = broker.reply_channel(&CorrelationId::new()).await.unwrap();
        bus.dispatch(inbound("Ping", &Ping { seq: 7 }, Some(channel.address())))
            .await
            .unwrap();
        let reply = channel.recv().await.unwrap();
        let pong: Pong = Envelope::decode(&reply.payload).unwrap().into_payload().unwrap();
        assert_eq!(pong, Pong { seq: 7 });
    }

    #[tokio::test]
    async fn malformed_payload_is_a_deserialization_error() {
        let broker = MemoryBroker::new();
        let mut registry = HandlerRegistry::default();
        registry
            .subscribe_reply::<Ping, _>(|event: Event<Ping>| async move {
                Ok::<_, BusError>(Pong { seq: event.payload().seq })
            })
            .unwrap();
        let bus = bus(registry, &broker);

        let channel = broker.reply_channel(&CorrelationId::new()).await.unwrap();
        let bad = inbound("Ping", &Audit { note: "wrong shape".into() }, Some(channel.address()));
        let err = bus.dispatch(bad).await.unwrap_err();
        assert!(matches!(err, BusError::Deserialization(_)));
    }

    #[tokio::test]
    async fn listen_processes_broker_messages_until_cancelled() {
        let broker = MemoryBroker::new();
        let seen = Arc::new(AtomicU32::new(0));
        let counter = seen.clone();
        let mut registry = HandlerRegistry::default();
        registry
            .subscribe::<Audit, _>(move |_: Event<Audit>| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok::<(), BusError>(())
                }
            })
            .unwrap();
        let bus = Arc::new(bus(registry, &broker));

        let token = CancellationToken::new();
        let handles = bus.listen(token.clone()).await.unwrap();
        assert_eq!(broker.subscriber_count("Audit"), 1);

        for _ in 0..3 {
            broker
                .publish(inbound("Audit", &Audit { note: "n".into() }, None))
                .await
                .unwrap();
        }
        for _ in 0..100 {
            if seen.load(Ordering::SeqCst) == 3 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert_eq!(seen.load(Ordering::SeqCst), 3);

        token.cancel();
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(broker.subscriber_count("Audit"), 0);
    }

    #[tokio::test]
    async fn lone_listener_answers_with_unit_when_reply_expected() {
        let broker = MemoryBroker::new();
        let calls = Arc::new(AtomicU32::new(0));
        let seen = calls.clone();
        let mut registry = HandlerRegistry::default();
        registry
            .subscribe::<Audit, _>(move |event: Event<Audit>| {
                let seen = seen.clone();
                async move {
                    assert!(event.expects_reply());
                    seen.fetch_add(1, Ordering::SeqCst);
                    Ok::<(), BusError>(())
                }
            })
            .unwrap();
        let bus = bus(registry, &broker);

        let mut channel = broker.reply_channel(&CorrelationId::new()).await.unwrap();
        let request = inbound("Audit", &Audit { note: "n".into() }, Some(channel.address()));
        let request_id = request.correlation_id.clone();
        bus.dispatch(request).await.unwrap();

        let reply = channel.recv().await.unwrap();
        assert_eq!(reply.correlation_id, request_id);
        let envelope = Envelope::decode(&reply.payload).unwrap();
        assert_eq!(envelope.wire_type(), "Unit");
        assert_eq!(envelope.into_payload::<Unit>().unwrap(), Unit);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn lone_listener_error_propagates_when_reply_expected() {
        let broker = MemoryBroker::new();
        let mut registry = HandlerRegistry::default();
        registry
            .subscribe::<Audit, _>(|_: Event<Audit>| async {
                Err::<(), _>(BusError::application("audit log sealed"))
            })
            .unwrap();
        let bus = bus(registry, &broker);

        let channel = broker.reply_channel(&CorrelationId::new()).await.unwrap();
        let err = bus
            .dispatch(inbound("Audit", &Audit { note: "n".into() }, Some(channel.address())))
            .await
            .unwrap_err();
        assert_eq!(err, BusError::Application("audit log sealed".into()));
    }

    type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

    /// Delegates to a [`MemoryBroker`] but refuses every subscription after the first.
    struct OneSubscription {
        inner: MemoryBroker,
        subscribed: AtomicU32,
    }

    impl BrokerTransport for OneSubscription {
        fn publish(&self, message: BrokerMessage) -> BoxFuture<'_, Result<Routing, BusError>> {
            self.inner.publish(message)
        }

        fn subscribe(
            &self,
            routing_key: &str,
            buffer: usize,
            overflow: OverflowPolicy,
        ) -> BoxFuture<'_, Result<Box<dyn BrokerSubscription>, BusError>> {
            if self.subscribed.fetch_add(1, Ordering::SeqCst) == 0 {
                self.inner.subscribe(routing_key, buffer, overflow)
            } else {
                Box::pin(async { Err(BusError::unreachable("subscriptions exhausted")) })
            }
        }

        fn reply_channel(
            &self,
            correlation_id: &CorrelationId,
        ) -> BoxFuture<'_, Result<Box<dyn ReplyChannel>, BusError>> {
            self.inner.reply_channel(correlation_id)
        }
    }

    #[tokio::test]
    async fn failed_listen_stops_listeners_already_started() {
        let broker = MemoryBroker::new();
        let mut registry = HandlerRegistry::default();
        registry
            .subscribe::<Audit, _>(|_: Event<Audit>| async { Ok::<(), BusError>(()) })
            .unwrap()
            .subscribe_reply::<Ping, _>(|event: Event<Ping>| async move {
                Ok::<_, BusError>(Pong { seq: event.payload().seq })
            })
            .unwrap();
        let transport = OneSubscription {
            inner: broker.clone(),
            subscribed: AtomicU32::new(0),
        };
        let bus = Arc::new(EventBus::new(registry, Arc::new(transport)));

        let err = bus.listen(CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, BusError::Transport { .. }));

        for _ in 0..100 {
            if broker.subscriber_count("Audit") == 0 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert_eq!(broker.subscriber_count("Audit"), 0);
        assert!(broker.routing_keys().is_empty());
    }
}
