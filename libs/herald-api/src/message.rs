use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Reply deadline applied when neither the command nor the dispatcher sets one.
pub const DEFAULT_TTL: Duration = Duration::from_secs(30);

// ════════════════════════════════════════════════════════════════
//  Correlation Id
// ════════════════════════════════════════════════════════════════

/// Opaque identifier linking a request to its reply.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(String);

impl CorrelationId {
    /// Fresh random (UUID v4) identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Wrap an identifier received from elsewhere.
    pub fn from_string(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

// ════════════════════════════════════════════════════════════════
//  Header
// ════════════════════════════════════════════════════════════════

/// Identity shared by every message: correlation id and creation time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    correlation_id: CorrelationId,
    created_at: DateTime<Utc>,
}

impl Header {
    /// New header with a generated correlation id, stamped now.
    pub fn new() -> Self {
        Self::with_correlation_id(CorrelationId::new())
    }

    /// New header reusing a supplied correlation id, stamped now.
    pub fn with_correlation_id(correlation_id: CorrelationId) -> Self {
        Self {
            correlation_id,
            created_at: Utc::now(),
        }
    }

    /// Rebuild a header from wire fields.
    pub fn from_parts(correlation_id: CorrelationId, created_at: DateTime<Utc>) -> Self {
        Self {
            correlation_id,
            created_at,
        }
    }

    pub fn correlation_id(&self) -> &CorrelationId {
        &self.correlation_id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}

impl Default for Header {
    fn default() -> Self {
        Self::new()
    }
}

// ════════════════════════════════════════════════════════════════
//  Unit
// ════════════════════════════════════════════════════════════════

/// The no-value result. Travels on the wire as an empty map.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Unit;

impl Serialize for Unit {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeMap;
        serializer.serialize_map(Some(0))?.end()
    }
}

impl<'de> Deserialize<'de> for Unit {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct UnitVisitor;

        impl<'de> serde::de::Visitor<'de> for UnitVisitor {
            type Value = Unit;

            fn expecting(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str("an empty map or unit")
            }

            fn visit_unit<E: serde::de::Error>(self) -> Result<Unit, E> {
                Ok(Unit)
            }

            // Header keys of a reply envelope may still be present; they carry nothing for Unit.
            fn visit_map<A: serde::de::MapAccess<'de>>(self, mut map: A) -> Result<Unit, A::Error> {
                while map
                    .next_entry::<serde::de::IgnoredAny, serde::de::IgnoredAny>()?
                    .is_some()
                {}
                Ok(Unit)
            }
        }

        deserializer.deserialize_any(UnitVisitor)
    }
}

// ════════════════════════════════════════════════════════════════
//  Request / Reply capabilities
// ════════════════════════════════════════════════════════════════

/// A type that can travel back as the reply to a request.
pub trait Reply: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Value handed to the caller when no reply is awaited.
    ///
    /// Only `Unit` has one; fire-and-forget commands are restricted to it.
    fn unawaited() -> Option<Self> {
        None
    }
}

impl Reply for Unit {
    fn unawaited() -> Option<Self> {
        Some(Unit)
    }
}

/// Payload of a command or reply-expecting event, declaring its reply type.
pub trait Request: Serialize + DeserializeOwned + Send + Sync + 'static {
    type Reply: Reply;
}

// ════════════════════════════════════════════════════════════════
//  Command
// ════════════════════════════════════════════════════════════════

/// Outbound request expecting at most one typed reply.
///
/// Built once, then handed to the dispatcher; fields are read-only.
#[derive(Debug, Clone)]
pub struct Command<P: Request> {
    header: Header,
    payload: P,
    expect_reply: bool,
    ttl: Option<Duration>,
}

impl<P: Request> Command<P> {
    pub fn new(payload: P) -> Self {
        Self::with_header(Header::new(), payload)
    }

    /// Command reusing a caller-supplied correlation id.
    pub fn with_correlation_id(correlation_id: CorrelationId, payload: P) -> Self {
        Self::with_header(Header::with_correlation_id(correlation_id), payload)
    }

    fn with_header(header: Header, payload: P) -> Self {
        Self {
            header,
            payload,
            expect_reply: true,
            ttl: None,
        }
    }

    /// Per-call reply deadline; the dispatcher default applies otherwise.
    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn correlation_id(&self) -> &CorrelationId {
        self.header.correlation_id()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.header.created_at()
    }

    pub fn payload(&self) -> &P {
        &self.payload
    }

    pub fn expect_reply(&self) -> bool {
        self.expect_reply
    }

    pub fn ttl_or(&self, default: Duration) -> Duration {
        self.ttl.unwrap_or(default)
    }

    pub fn into_payload(self) -> P {
        self.payload
    }
}

impl<P: Request<Reply = Unit>> Command<P> {
    /// Publish without waiting for any reply; late replies are discarded.
    pub fn without_reply(mut self) -> Self {
        self.expect_reply = false;
        self
    }
}

// ════════════════════════════════════════════════════════════════
//  Event
// ════════════════════════════════════════════════════════════════

/// Inbound notification routed by wire type to local handlers.
#[derive(Debug, Clone)]
pub struct Event<P> {
    header: Header,
    payload: P,
    expects_reply: bool,
}

impl<P> Event<P> {
    pub fn new(payload: P) -> Self {
        Self::from_parts(Header::new(), payload, false)
    }

    pub fn from_parts(header: Header, payload: P, expects_reply: bool) -> Self {
        Self {
            header,
            payload,
            expects_reply,
        }
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn correlation_id(&self) -> &CorrelationId {
        self.header.correlation_id()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.header.created_at()
    }

    pub fn payload(&self) -> &P {
        &self.payload
    }

    /// Whether the sender left a reply address.
    pub fn expects_reply(&self) -> bool {
        self.expects_reply
    }

    pub fn into_payload(self) -> P {
        self.payload
    }
}
