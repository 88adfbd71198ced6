use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio_util::sync::CancellationToken;

use herald_api::codec::encode_envelope;
use herald_api::{
    BrokerMessage, BrokerTransport, BusError, Command, DEFAULT_TTL, Envelope, Header, Reply,
    Request, Routing, WireTypeResolver,
};

use crate::config::BusConfig;
use crate::retry::{RetryPolicy, RetryStrategy};

/// Sends commands over a broker and awaits their correlated replies.
///
/// Safe to share between tasks: each call owns its reply channel, so
/// concurrent calls never see each other's replies.
#[derive(Clone)]
pub struct CommandDispatcher {
    transport: Arc<dyn BrokerTransport>,
    resolver: WireTypeResolver,
    retry: RetryStrategy,
    default_ttl: Duration,
}

impl std::fmt::Debug for CommandDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandDispatcher")
            .field("resolver", &self.resolver)
            .field("retry", &self.retry)
            .field("default_ttl", &self.default_ttl)
            .finish()
    }
}

impl CommandDispatcher {
    pub fn new(
        transport: Arc<dyn BrokerTransport>,
        resolver: WireTypeResolver,
        retry: RetryStrategy,
    ) -> Self {
        Self {
            transport,
            resolver,
            retry,
            default_ttl: DEFAULT_TTL,
        }
    }

    pub fn from_config(transport: Arc<dyn BrokerTransport>, config: &BusConfig) -> Self {
        Self::new(
            transport,
            config.resolver(),
            RetryStrategy::new(config.retry.policy()),
        )
        .with_default_ttl(config.default_ttl())
    }

    /// Reply deadline for commands that carry no ttl of their own.
    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    pub fn resolver(&self) -> &WireTypeResolver {
        &self.resolver
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        self.retry.policy()
    }

    /// Publish `command` and wait for its reply.
    ///
    /// Transient failures (including a reply that missed its ttl) are
    /// retried per the retry policy, each retry under a fresh correlation
    /// id. Commands built with `without_reply()` return as soon as the
    /// publish succeeds.
    pub async fn execute<P: Request>(
        &self,
        command: Command<P>,
        token: &CancellationToken,
    ) -> Result<P::Reply, BusError> {
        let wire_type = self.resolver.resolve::<P>().to_string();
        let payload = serde_json::to_value(command.payload())
            .map_err(|e| BusError::Serialization(e.to_string()))?;

        if !command.expect_reply() {
            return self.publish_only::<P>(&wire_type, &command, &payload, token).await;
        }

        let ttl = command.ttl_or(self.default_ttl);
        let (wire_type, payload) = (wire_type.as_str(), &payload);
        // The first attempt carries the command's own header; retries get fresh ones.
        let mut first = Some(command.header().clone());
        self.retry
            .acquire(
                move || {
                    let header = first.take().unwrap_or_default();
                    self.attempt::<P::Reply>(wire_type, header, payload, ttl, token)
                },
                token,
            )
            .await
    }

    async fn publish_only<P: Request>(
        &self,
        wire_type: &str,
        command: &Command<P>,
        payload: &Value,
        token: &CancellationToken,
    ) -> Result<P::Reply, BusError> {
        let Some(unawaited) = <P::Reply as Reply>::unawaited() else {
            return Err(BusError::Configuration(format!(
                "'{wire_type}' expects a reply and cannot be sent without one"
            )));
        };

        let bytes = encode_envelope(wire_type, command.header(), payload)?;
        let routing = self
            .retry
            .acquire(
                || {
                    self.transport.publish(BrokerMessage {
                        routing_key: wire_type.to_string(),
                        payload: bytes.clone(),
                        correlation_id: command.correlation_id().clone(),
                        reply_to: None,
                    })
                },
                token,
            )
            .await?;

        if routing == Routing::Unroutable {
            tracing::debug!(
                %wire_type,
                correlation_id = %command.correlation_id(),
                "fire-and-forget command had no subscriber"
            );
        }
        Ok(unawaited)
    }

    async fn attempt<R: Reply>(
        &self,
        wire_type: &str,
        header: Header,
        payload: &Value,
        ttl: Duration,
        token: &CancellationToken,
    ) -> Result<R, BusError> {
        let correlation_id = header.correlation_id().clone();
        // Released on every exit path, so a late reply finds no address.
        let mut channel = self.transport.reply_channel(&correlation_id).await?;

        let bytes = encode_envelope(wire_type, &header, payload)?;
        let routing = self
            .transport
            .publish(BrokerMessage {
                routing_key: wire_type.to_string(),
                payload: bytes,
                correlation_id: correlation_id.clone(),
                reply_to: Some(channel.address().to_string()),
            })
            .await?;

        if routing == Routing::Unroutable {
            return Err(BusError::NoSubscriptionFound {
                wire_type: wire_type.to_string(),
            });
        }
        tracing::debug!(
            %wire_type,
            %correlation_id,
            ttl_ms = ttl.as_millis() as u64,
            "awaiting reply"
        );

        let wait_for_reply = async {
            loop {
                match channel.recv().await {
                    Some(reply) if reply.correlation_id == correlation_id => return Some(reply),
                    Some(stray) => {
                        tracing::debug!(
                            %wire_type,
                            expected = %correlation_id,
                            got = %stray.correlation_id,
                            "ignoring reply with foreign correlation id"
                        );
                    }
                    None => return None,
                }
            }
        };

        let reply = tokio::select! {
            biased;
            _ = token.cancelled() => return Err(BusError::Cancelled),
            result = tokio::time::timeout(ttl, wait_for_reply) => match result {
                Ok(Some(reply)) => reply,
                Ok(None) => {
                    return Err(BusError::connectivity(format!(
                        "reply channel for '{wire_type}' closed"
                    )));
                }
                Err(_) => {
                    return Err(BusError::TimedOut {
                        wire_type: wire_type.to_string(),
                        correlation_id: correlation_id.clone(),
                        ttl,
                    });
                }
            },
        };

        Envelope::decode(&reply.payload)?.into_payload()
    }
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};

    use super::*;
    use crate::memory::MemoryBroker;
    use herald_api::{BrokerSubscription, CorrelationId, OverflowPolicy, Unit};

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Charge {
        cents: u64,
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Receipt {
        id: String,
    }

    impl Reply for Receipt {}

    impl Request for Charge {
        type Reply = Receipt;
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Notify {
        text: String,
    }

    impl Request for Notify {
        type Reply = Unit;
    }

    fn dispatcher(broker: &MemoryBroker, policy: RetryPolicy) -> CommandDispatcher {
        CommandDispatcher::new(
            Arc::new(broker.clone()),
            WireTypeResolver::new(),
            RetryStrategy::new(policy),
        )
    }

    #[tokio::test]
    async fn no_subscriber_fails_fast() {
        let broker = MemoryBroker::new();
        let dispatcher = dispatcher(&broker, RetryPolicy::new(Duration::from_millis(1), 3));

        let err = dispatcher
            .execute(Command::new(Charge { cents: 100 }), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(
            err,
            BusError::NoSubscriptionFound {
                wire_type: "Charge".into()
            }
        );
        assert_eq!(broker.pending_replies(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn silent_subscriber_times_out_after_ttl() {
        let broker = MemoryBroker::new();
        let _sub = broker.subscribe("Charge", 8, OverflowPolicy::Drop).await.unwrap();
        let dispatcher = dispatcher(&broker, RetryPolicy::none());

        let command = Command::new(Charge { cents: 5 }).ttl(Duration::from_millis(50));
        let id = command.correlation_id().clone();
        let start = tokio::time::Instant::now();
        let err = dispatcher.execute(command, &CancellationToken::new()).await.unwrap_err();

        assert_eq!(
            err,
            BusError::TimedOut {
                wire_type: "Charge".into(),
                correlation_id: id,
                ttl: Duration::from_millis(50),
            }
        );
        assert!(start.elapsed() >= Duration::from_millis(50));
        assert_eq!(broker.pending_replies(), 0);
    }

    #[tokio::test]
    async fn fire_and_forget_returns_unit_without_subscriber() {
        let broker = MemoryBroker::new();
        let dispatcher = dispatcher(&broker, RetryPolicy::none());

        let reply = dispatcher
            .execute(
                Command::new(Notify { text: "hi".into() }).without_reply(),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(reply, Unit);
        assert_eq!(broker.pending_replies(), 0);
    }

    #[tokio::test]
    async fn fire_and_forget_carries_no_reply_address() {
        let broker = MemoryBroker::new();
        let mut sub = broker.subscribe("Notify", 8, OverflowPolicy::Drop).await.unwrap();
        let dispatcher = dispatcher(&broker, RetryPolicy::none());

        let command = Command::new(Notify { text: "hi".into() }).without_reply();
        let id = command.correlation_id().clone();
        dispatcher.execute(command, &CancellationToken::new()).await.unwrap();

        let message = sub.recv().await.unwrap();
        assert_eq!(message.reply_to, None);
        assert_eq!(message.correlation_id, id);
        let envelope = Envelope::decode(&message.payload).unwrap();
        assert_eq!(envelope.wire_type(), "Notify");
    }

    #[tokio::test]
    async fn cancelled_before_start() {
        let broker = MemoryBroker::new();
        let dispatcher = dispatcher(&broker, RetryPolicy::new(Duration::from_millis(1), 3));
        let token = CancellationToken::new();
        token.cancel();

        let err = dispatcher
            .execute(Command::new(Charge { cents: 1 }), &token)
            .await
            .unwrap_err();
        assert_eq!(err, BusError::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_while_waiting_for_reply() {
        let broker = MemoryBroker::new();
        let _sub = broker.subscribe("Charge", 8, OverflowPolicy::Drop).await.unwrap();
        let dispatcher = dispatcher(&broker, RetryPolicy::none());
        let token = CancellationToken::new();
        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            canceller.cancel();
        });

        let err = dispatcher
            .execute(Command::new(Charge { cents: 1 }).ttl(Duration::from_secs(5)), &token)
            .await
            .unwrap_err();
        assert_eq!(err, BusError::Cancelled);
        assert_eq!(broker.pending_replies(), 0);
    }

    #[tokio::test]
    async fn first_attempt_keeps_caller_correlation_id() {
        let broker = MemoryBroker::new();
        let mut sub = broker.subscribe("Charge", 8, OverflowPolicy::Drop).await.unwrap();
        let dispatcher = dispatcher(&broker, RetryPolicy::none());

        let id = CorrelationId::from_string("order-17");
        let command = Command::with_correlation_id(id.clone(), Charge { cents: 9 });
        let responder = {
            let broker = broker.clone();
            tokio::spawn(async move {
                let request = sub.recv().await.unwrap();
                assert_eq!(request.correlation_id, CorrelationId::from_string("order-17"));
                let header = Header::with_correlation_id(request.correlation_id.clone());
                let receipt = Receipt { id: "r-1".into() };
                let body = encode_envelope("Receipt", &header, &receipt).unwrap();
                broker
                    .publish(BrokerMessage {
                        routing_key: request.reply_to.unwrap(),
                        payload: body,
                        correlation_id: request.correlation_id,
                        reply_to: None,
                    })
                    .await
                    .unwrap();
            })
        };

        let receipt = dispatcher.execute(command, &CancellationToken::new()).await.unwrap();
        responder.await.unwrap();
        assert_eq!(receipt, Receipt { id: "r-1".into() });
        assert_eq!(id.as_str(), "order-17");
    }

    #[tokio::test]
    async fn first_attempt_sends_the_command_header_unchanged() {
        let broker = MemoryBroker::new();
        let mut sub = broker.subscribe("Charge", 8, OverflowPolicy::Drop).await.unwrap();
        let dispatcher = dispatcher(&broker, RetryPolicy::none());

        let command = Command::new(Charge { cents: 3 }).ttl(Duration::from_millis(20));
        let header = command.header().clone();
        tokio::time::sleep(Duration::from_millis(15)).await;

        let err = dispatcher.execute(command, &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, BusError::TimedOut { .. }));

        let sent = sub.recv().await.unwrap();
        let envelope = Envelope::decode(&sent.payload).unwrap();
        assert_eq!(envelope.header(), &header);
        assert_eq!(envelope.header().created_at(), header.created_at());
    }

    #[tokio::test]
    async fn reply_of_wrong_shape_is_a_deserialization_error() {
        let broker = MemoryBroker::new();
        let mut sub = broker.subscribe("Charge", 8, OverflowPolicy::Drop).await.unwrap();
        let dispatcher = dispatcher(&broker, RetryPolicy::new(Duration::from_millis(1), 3));

        let responder = {
            let broker = broker.clone();
            tokio::spawn(async move {
                let request = sub.recv().await.unwrap();
                let header = Header::with_correlation_id(request.correlation_id.clone());
                let wrong = Notify { text: "?".into() };
                let body = encode_envelope("Receipt", &header, &wrong).unwrap();
                broker
                    .publish(BrokerMessage {
                        routing_key: request.reply_to.unwrap(),
                        payload: body,
                        correlation_id: request.correlation_id,
                        reply_to: None,
                    })
                    .await
                    .unwrap();
            })
        };

        let err = dispatcher
            .execute(Command::new(Charge { cents: 1 }), &CancellationToken::new())
            .await
            .unwrap_err();
        responder.await.unwrap();
        assert!(matches!(err, BusError::Deserialization(_)));
    }
}
