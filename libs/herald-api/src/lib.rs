pub mod codec;
pub mod error;
pub mod http;
pub mod message;
pub mod transport;
pub mod vocabulary;
pub mod wire;

pub use codec::Envelope;
pub use error::{BusError, TransportErrorKind};
pub use http::{HTTP_METHODS, HttpMethod, HttpStatus};
pub use message::{
    Command, CorrelationId, DEFAULT_TTL, Event, Header, Reply, Request, Unit,
};
pub use transport::{
    BrokerMessage, BrokerSubscription, BrokerTransport, OverflowPolicy, ReplyChannel, Routing,
};
pub use vocabulary::{UnknownLiteral, Vocabulary};
pub use wire::{WireTypeResolver, simple_name};
