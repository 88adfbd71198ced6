use std::future::Future;
use std::pin::Pin;

use serde::{Deserialize, Serialize};

use crate::error::BusError;
use crate::message::CorrelationId;

// ════════════════════════════════════════════════════════════════
//  Broker message
// ════════════════════════════════════════════════════════════════

/// A message as the broker sees it: routing key, opaque bytes and
/// request/reply addressing.
#[derive(Debug, Clone, PartialEq)]
pub struct BrokerMessage {
    pub routing_key: String,
    pub payload: Vec<u8>,
    pub correlation_id: CorrelationId,
    /// Address the receiver should publish its reply to, if any.
    pub reply_to: Option<String>,
}

/// Outcome of a publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Routing {
    /// Handed to this many consumers.
    Delivered(usize),
    /// No consumer bound to the routing key.
    Unroutable,
}

/// What a subscription does when its buffer is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// try_send(): drop the message and log it.
    Drop,
    /// .send().await: wait for room (back-pressure on the publisher).
    #[serde(alias = "backpressure")]
    BackPressure,
}

// ════════════════════════════════════════════════════════════════
//  Broker traits
// ════════════════════════════════════════════════════════════════

/// Stream of messages bound to one routing key. Dropping it unsubscribes.
pub trait BrokerSubscription: Send {
    fn routing_key(&self) -> &str;

    /// Next message. None = broker closed the subscription.
    fn recv(&mut self) -> Pin<Box<dyn Future<Output = Option<BrokerMessage>> + Send + '_>>;
}

/// Ephemeral reply address scoped to one correlation id.
/// Dropping it releases the address; later replies are discarded.
pub trait ReplyChannel: Send {
    fn address(&self) -> &str;

    /// Next reply. None = broker closed the channel.
    fn recv(&mut self) -> Pin<Box<dyn Future<Output = Option<BrokerMessage>> + Send + '_>>;
}

/// Publish/subscribe channel with correlation and reply-to addressing.
///
/// Connection management, reconnection and durability belong to the
/// implementation. Implementations report a broker they cannot reach as
/// `BusError::Transport { kind: Unreachable, .. }`.
pub trait BrokerTransport: Send + Sync {
    /// Publish a message. Fire-and-forget: does not wait for consumers.
    ///
    /// A routing key equal to a live reply address delivers to that reply channel.
    fn publish(
        &self,
        message: BrokerMessage,
    ) -> Pin<Box<dyn Future<Output = Result<Routing, BusError>> + Send + '_>>;

    /// Bind a consumer to a routing key.
    ///
    /// - `buffer`: capacity of the delivery channel
    /// - `overflow`: behavior when that channel is full
    #[allow(clippy::type_complexity)]
    fn subscribe(
        &self,
        routing_key: &str,
        buffer: usize,
        overflow: OverflowPolicy,
    ) -> Pin<Box<dyn Future<Output = Result<Box<dyn BrokerSubscription>, BusError>> + Send + '_>>;

    /// Allocate an ephemeral reply address for one correlation id.
    #[allow(clippy::type_complexity)]
    fn reply_channel(
        &self,
        correlation_id: &CorrelationId,
    ) -> Pin<Box<dyn Future<Output = Result<Box<dyn ReplyChannel>, BusError>> + Send + '_>>;
}
