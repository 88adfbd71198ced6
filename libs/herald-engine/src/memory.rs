use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::mpsc;

use herald_api::{
    BrokerMessage, BrokerSubscription, BrokerTransport, BusError, CorrelationId, OverflowPolicy,
    ReplyChannel, Routing,
};

/// Prefix of every reply address handed out by [`MemoryBroker`]. Neither `@`
/// nor `/` occurs in a Rust type name; subscriptions under it are refused.
pub const REPLY_PREFIX: &str = "@reply/";

/// Capacity of a reply channel. One reply is expected; extras are dropped.
const REPLY_BUFFER: usize = 4;

// ═══════════════════════════════════════════════════════════════
//  Subscriber
// ═══════════════════════════════════════════════════════════════

struct Subscriber {
    id: u64,
    tx: mpsc::Sender<BrokerMessage>,
    overflow: OverflowPolicy,
}

#[derive(Default)]
struct Shared {
    routes: Mutex<HashMap<String, Vec<Subscriber>>>,
    /// Pending replies: reply address → waiting channel.
    replies: Mutex<HashMap<String, mpsc::Sender<BrokerMessage>>>,
    unreachable: AtomicBool,
    next_id: AtomicU64,
}

fn lock<'a, T>(mutex: &'a Mutex<T>, what: &'static str) -> MutexGuard<'a, T> {
    match mutex.lock() {
        Ok(g) => g,
        Err(poisoned) => {
            tracing::warn!(lock = what, "memory broker lock was poisoned, recovering");
            poisoned.into_inner()
        }
    }
}

impl Shared {
    fn unsubscribe(&self, routing_key: &str, id: u64) {
        let mut routes = lock(&self.routes, "routes");
        if let Some(subs) = routes.get_mut(routing_key) {
            subs.retain(|s| s.id != id);
            if subs.is_empty() {
                routes.remove(routing_key);
            }
        }
    }

    fn release_reply(&self, address: &str) {
        lock(&self.replies, "replies").remove(address);
    }
}

// ═══════════════════════════════════════════════════════════════
//  Subscription / reply channel
// ═══════════════════════════════════════════════════════════════

pub struct MemorySubscription {
    routing_key: String,
    id: u64,
    rx: mpsc::Receiver<BrokerMessage>,
    shared: Arc<Shared>,
}

impl BrokerSubscription for MemorySubscription {
    fn routing_key(&self) -> &str {
        &self.routing_key
    }

    fn recv(&mut self) -> Pin<Box<dyn Future<Output = Option<BrokerMessage>> + Send + '_>> {
        Box::pin(async { self.rx.recv().await })
    }
}

impl Drop for MemorySubscription {
    fn drop(&mut self) {
        self.shared.unsubscribe(&self.routing_key, self.id);
    }
}

pub struct MemoryReplyChannel {
    address: String,
    rx: mpsc::Receiver<BrokerMessage>,
    shared: Arc<Shared>,
}

impl ReplyChannel for MemoryReplyChannel {
    fn address(&self) -> &str {
        &self.address
    }

    fn recv(&mut self) -> Pin<Box<dyn Future<Output = Option<BrokerMessage>> + Send + '_>> {
        Box::pin(async { self.rx.recv().await })
    }
}

impl Drop for MemoryReplyChannel {
    fn drop(&mut self) {
        self.shared.release_reply(&self.address);
    }
}

// ═══════════════════════════════════════════════════════════════
//  MemoryBroker
// ═══════════════════════════════════════════════════════════════

/// In-process broker: fan-out per routing key, reply addresses kept in a
/// pending-reply map.
///
/// Every subscriber of a routing key receives its own copy of each message,
/// subject to the subscriber's overflow policy. A reply published to an
/// address nobody waits on any more is dropped silently.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for MemoryBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBroker")
            .field("routing_keys", &self.routing_keys())
            .field("pending_replies", &self.pending_replies())
            .finish()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate the broker going away (`false`) or coming back (`true`).
    /// While unreachable every operation fails with an unreachable transport error.
    pub fn set_reachable(&self, reachable: bool) {
        self.shared.unreachable.store(!reachable, Ordering::SeqCst);
    }

    pub fn subscriber_count(&self, routing_key: &str) -> usize {
        lock(&self.shared.routes, "routes")
            .get(routing_key)
            .map(|subs| subs.iter().filter(|s| !s.tx.is_closed()).count())
            .unwrap_or(0)
    }

    pub fn routing_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = lock(&self.shared.routes, "routes").keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Reply addresses currently awaiting a reply.
    pub fn pending_replies(&self) -> usize {
        lock(&self.shared.replies, "replies").len()
    }

    fn ensure_reachable(&self) -> Result<(), BusError> {
        if self.shared.unreachable.load(Ordering::SeqCst) {
            return Err(BusError::unreachable("memory broker is offline"));
        }
        Ok(())
    }

    fn deliver_reply(&self, message: BrokerMessage) -> Routing {
        let tx = lock(&self.shared.replies, "replies")
            .get(&message.routing_key)
            .cloned();
        let Some(tx) = tx else {
            tracing::debug!(
                address = %message.routing_key,
                correlation_id = %message.correlation_id,
                "reply for abandoned correlation id dropped"
            );
            return Routing::Unroutable;
        };
        match tx.try_send(message) {
            Ok(()) => Routing::Delivered(1),
            Err(mpsc::error::TrySendError::Full(m)) => {
                tracing::warn!(address = %m.routing_key, "reply channel full, dropping");
                Routing::Delivered(0)
            }
            Err(mpsc::error::TrySendError::Closed(m)) => {
                tracing::debug!(address = %m.routing_key, "reply channel closed, dropping");
                Routing::Unroutable
            }
        }
    }

    async fn fan_out(&self, message: BrokerMessage) -> Routing {
        // Back-pressure sends happen after the lock is released.
        let mut blocking = Vec::new();
        let delivered = {
            let mut routes = lock(&self.shared.routes, "routes");
            let Some(subs) = routes.get_mut(&message.routing_key) else {
                return Routing::Unroutable;
            };
            subs.retain(|s| !s.tx.is_closed());

            for sub in subs.iter() {
                match sub.overflow {
                    OverflowPolicy::Drop => match sub.tx.try_send(message.clone()) {
                        Ok(()) => {}
                        Err(mpsc::error::TrySendError::Full(_)) => {
                            tracing::warn!(
                                routing_key = %message.routing_key,
                                "subscriber channel full, dropping"
                            );
                        }
                        Err(mpsc::error::TrySendError::Closed(_)) => {}
                    },
                    OverflowPolicy::BackPressure => blocking.push(sub.tx.clone()),
                }
            }
            subs.len()
        };

        for tx in blocking {
            if tx.send(message.clone()).await.is_err() {
                tracing::debug!(
                    routing_key = %message.routing_key,
                    "subscriber closed during backpressure send"
                );
            }
        }

        if delivered == 0 {
            Routing::Unroutable
        } else {
            Routing::Delivered(delivered)
        }
    }
}

impl BrokerTransport for MemoryBroker {
    fn publish(
        &self,
        message: BrokerMessage,
    ) -> Pin<Box<dyn Future<Output = Result<Routing, BusError>> + Send + '_>> {
        Box::pin(async move {
            self.ensure_reachable()?;
            if message.routing_key.starts_with(REPLY_PREFIX) {
                return Ok(self.deliver_reply(message));
            }
            Ok(self.fan_out(message).await)
        })
    }

    fn subscribe(
        &self,
        routing_key: &str,
        buffer: usize,
        overflow: OverflowPolicy,
    ) -> Pin<Box<dyn Future<Output = Result<Box<dyn BrokerSubscription>, BusError>> + Send + '_>>
    {
        let routing_key = routing_key.to_string();
        Box::pin(async move {
            self.ensure_reachable()?;
            if buffer == 0 {
                return Err(BusError::Configuration(format!(
                    "subscription to '{routing_key}' needs a buffer of at least 1"
                )));
            }
            if routing_key.starts_with(REPLY_PREFIX) {
                return Err(BusError::Configuration(format!(
                    "'{routing_key}' lies in the reply address space '{REPLY_PREFIX}'"
                )));
            }

            let (tx, rx) = mpsc::channel(buffer);
            let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
            lock(&self.shared.routes, "routes")
                .entry(routing_key.clone())
                .or_default()
                .push(Subscriber { id, tx, overflow });

            tracing::debug!(%routing_key, id, "subscribed");
            Ok(Box::new(MemorySubscription {
                routing_key,
                id,
                rx,
                shared: self.shared.clone(),
            }) as Box<dyn BrokerSubscription>)
        })
    }

    fn reply_channel(
        &self,
        correlation_id: &CorrelationId,
    ) -> Pin<Box<dyn Future<Output = Result<Box<dyn ReplyChannel>, BusError>> + Send + '_>> {
        let address = format!("{REPLY_PREFIX}{correlation_id}");
        Box::pin(async move {
            self.ensure_reachable()?;
            let (tx, rx) = mpsc::channel(REPLY_BUFFER);
            let mut replies = lock(&self.shared.replies, "replies");
            if replies.contains_key(&address) {
                return Err(BusError::Configuration(format!(
                    "reply address '{address}' is already in use"
                )));
            }
            replies.insert(address.clone(), tx);
            drop(replies);

            Ok(Box::new(MemoryReplyChannel {
                address,
                rx,
                shared: self.shared.clone(),
            }) as Box<dyn ReplyChannel>)
        })
    }
}
