use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::Value;

use herald_api::{BusError, Envelope, Event, Request, WireTypeResolver, simple_name};

// ═══════════════════════════════════════════════════════════════
//  Handler capabilities
// ═══════════════════════════════════════════════════════════════

/// Fire-and-forget handler for events of payload type `P`.
pub trait EventHandler<P>: Send + Sync + 'static {
    fn handle(
        &self,
        event: Event<P>,
    ) -> Pin<Box<dyn Future<Output = Result<(), BusError>> + Send + '_>>;
}

/// Reply-capable handler for requests of payload type `P`.
pub trait ReplyHandler<P: Request>: Send + Sync + 'static {
    #[allow(clippy::type_complexity)]
    fn handle(
        &self,
        event: Event<P>,
    ) -> Pin<Box<dyn Future<Output = Result<P::Reply, BusError>> + Send + '_>>;
}

impl<P, F, Fut> EventHandler<P> for F
where
    F: Fn(Event<P>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), BusError>> + Send + 'static,
{
    fn handle(
        &self,
        event: Event<P>,
    ) -> Pin<Box<dyn Future<Output = Result<(), BusError>> + Send + '_>> {
        Box::pin(self(event))
    }
}

impl<P, F, Fut> ReplyHandler<P> for F
where
    P: Request,
    F: Fn(Event<P>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<P::Reply, BusError>> + Send + 'static,
{
    fn handle(
        &self,
        event: Event<P>,
    ) -> Pin<Box<dyn Future<Output = Result<P::Reply, BusError>> + Send + '_>> {
        Box::pin(self(event))
    }
}

// ═══════════════════════════════════════════════════════════════
//  Descriptors
// ═══════════════════════════════════════════════════════════════

pub(crate) type Invocation =
    Pin<Box<dyn Future<Output = Result<Value, BusError>> + Send + 'static>>;

/// Decodes the envelope payload, runs the handler and returns its reply
/// as an untyped value (`{}` for fire-and-forget handlers).
type Invoker = Arc<dyn Fn(Envelope, bool) -> Invocation + Send + Sync>;

/// One registered handler: what it is, what it replies with, how to call it.
#[derive(Clone)]
pub struct HandlerDescriptor {
    handler: &'static str,
    reply_type: Option<String>,
    invoke: Invoker,
}

impl std::fmt::Debug for HandlerDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerDescriptor")
            .field("handler", &self.handler)
            .field("reply_type", &self.reply_type)
            .finish()
    }
}

impl HandlerDescriptor {
    /// Type name of the handler, for logs.
    pub fn handler(&self) -> &'static str {
        self.handler
    }

    /// Wire type of the reply, None for fire-and-forget handlers.
    pub fn reply_type(&self) -> Option<&str> {
        self.reply_type.as_deref()
    }

    pub(crate) fn invoke(&self, envelope: Envelope, expects_reply: bool) -> Invocation {
        (self.invoke)(envelope, expects_reply)
    }
}

/// Handlers bound to one wire type.
#[derive(Debug, Clone)]
pub enum Binding {
    /// Exactly one reply-capable handler.
    Reply(HandlerDescriptor),
    /// One or more fire-and-forget handlers.
    Listeners(Vec<HandlerDescriptor>),
}

// ═══════════════════════════════════════════════════════════════
//  HandlerRegistry
// ═══════════════════════════════════════════════════════════════

/// Wire type → handler binding table, filled once at composition time and
/// then handed to an [`EventBus`](crate::EventBus).
///
/// A wire type holds either one reply handler or any number of
/// fire-and-forget handlers; mixing the two, or binding a second reply
/// handler, is rejected at registration.
#[derive(Debug, Default)]
pub struct HandlerRegistry {
    resolver: WireTypeResolver,
    bindings: HashMap<String, Binding>,
}

impl HandlerRegistry {
    pub fn new(resolver: WireTypeResolver) -> Self {
        Self {
            resolver,
            bindings: HashMap::new(),
        }
    }

    pub fn resolver(&self) -> &WireTypeResolver {
        &self.resolver
    }

    /// Bind a fire-and-forget handler under the wire type of `P`.
    pub fn subscribe<P, H>(&mut self, handler: H) -> Result<&mut Self, BusError>
    where
        P: DeserializeOwned + Send + 'static,
        H: EventHandler<P>,
    {
        let wire_type = self.resolver.resolve::<P>().to_string();
        let handler = Arc::new(handler);
        let invoke: Invoker = Arc::new(move |envelope: Envelope, replying: bool| -> Invocation {
            let handler = handler.clone();
            Box::pin(async move {
                let payload: P = envelope.payload()?;
                let event = Event::from_parts(envelope.header().clone(), payload, replying);
                handler.handle(event).await?;
                Ok(Value::Object(Default::default()))
            })
        });
        let descriptor = HandlerDescriptor {
            handler: simple_name::<H>(),
            reply_type: None,
            invoke,
        };

        match self.bindings.get_mut(&wire_type) {
            None => {
                self.bindings.insert(wire_type.clone(), Binding::Listeners(vec![descriptor]));
            }
            Some(Binding::Listeners(listeners)) => listeners.push(descriptor),
            Some(Binding::Reply(existing)) => {
                return Err(BusError::Configuration(format!(
                    "'{wire_type}' already has reply handler {}; \
                     cannot add fire-and-forget handler {}",
                    existing.handler,
                    simple_name::<H>()
                )));
            }
        }

        tracing::debug!(%wire_type, handler = simple_name::<H>(), "subscribed event handler");
        Ok(self)
    }

    /// Bind the single reply-capable handler under the wire type of `P`.
    pub fn subscribe_reply<P, H>(&mut self, handler: H) -> Result<&mut Self, BusError>
    where
        P: Request,
        H: ReplyHandler<P>,
    {
        let wire_type = self.resolver.resolve::<P>().to_string();
        if let Some(existing) = self.bindings.get(&wire_type) {
            let existing = match existing {
                Binding::Reply(d) => d.handler.to_string(),
                Binding::Listeners(ls) => ls
                    .iter()
                    .map(|d| d.handler)
                    .collect::<Vec<_>>()
                    .join(", "),
            };
            return Err(BusError::Configuration(format!(
                "'{wire_type}' is already bound to {existing}; cannot add reply handler {}",
                simple_name::<H>()
            )));
        }

        let handler = Arc::new(handler);
        let invoke: Invoker = Arc::new(move |envelope: Envelope, replying: bool| -> Invocation {
            let handler = handler.clone();
            Box::pin(async move {
                let payload: P = envelope.payload()?;
                let event = Event::from_parts(envelope.header().clone(), payload, replying);
                let reply = handler.handle(event).await?;
                serde_json::to_value(&reply).map_err(|e| BusError::Serialization(e.to_string()))
            })
        });
        let descriptor = HandlerDescriptor {
            handler: simple_name::<H>(),
            reply_type: Some(self.resolver.resolve::<P::Reply>().to_string()),
            invoke,
        };
        self.bindings.insert(wire_type.clone(), Binding::Reply(descriptor));

        tracing::debug!(%wire_type, handler = simple_name::<H>(), "subscribed reply handler");
        Ok(self)
    }

    pub fn binding(&self, wire_type: &str) -> Option<&Binding> {
        self.bindings.get(wire_type)
    }

    /// Bound wire types, sorted.
    pub fn wire_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.bindings.keys().cloned().collect();
        types.sort();
        types
    }

    /// Which of `wire_types` have no handler, in the order given.
    pub fn missing<I, S>(&self, wire_types: I) -> Vec<String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        wire_types
            .into_iter()
            .filter(|t| !self.bindings.contains_key(t.as_ref()))
            .map(|t| t.as_ref().to_string())
            .collect()
    }
}
