pub mod config;
pub mod dispatcher;
pub mod event_bus;
pub mod memory;
pub mod registry;
pub mod retry;

pub use config::{BusConfig, RetryConfig, WireTypeAlias};
pub use dispatcher::CommandDispatcher;
pub use event_bus::EventBus;
pub use memory::{MemoryBroker, REPLY_PREFIX};
pub use registry::{Binding, EventHandler, HandlerDescriptor, HandlerRegistry, ReplyHandler};
pub use retry::{RetryPolicy, RetryStrategy, TransientPredicate};
