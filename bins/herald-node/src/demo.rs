use serde::{Deserialize, Serialize};

use herald_api::{BusError, Event, HttpMethod, HttpStatus, Reply, Request, Unit, WireTypeResolver};
use herald_engine::HandlerRegistry;

/// Liveness probe; answered with the same sequence number.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ping {
    pub seq: u32,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pong {
    pub seq: u32,
    pub node_name: String,
}

impl Reply for Pong {}

impl Request for Ping {
    type Reply = Pong;
}

/// Broadcast notice, no reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Announce {
    pub text: String,
}

impl Request for Announce {
    type Reply = Unit;
}

/// Ask the node how it would answer an HTTP request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeEndpoint {
    pub method: HttpMethod,
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeResult {
    pub method: HttpMethod,
    pub status: HttpStatus,
}

impl Reply for ProbeResult {}

impl Request for ProbeEndpoint {
    type Reply = ProbeResult;
}

fn probe(method: &HttpMethod, path: &str) -> HttpStatus {
    match (method.as_str(), path) {
        ("GET" | "HEAD", "/health") => HttpStatus::new(200),
        (_, "/health") => HttpStatus::new(405),
        _ => HttpStatus::new(404),
    }
}

/// Handlers of every demo message, bound under the names `resolver` gives them.
pub fn registry(node_name: &str, resolver: WireTypeResolver) -> Result<HandlerRegistry, BusError> {
    let mut registry = HandlerRegistry::new(resolver);
    let name = node_name.to_string();

    registry
        .subscribe_reply::<Ping, _>(move |event: Event<Ping>| {
            let node_name = name.clone();
            async move {
                tracing::debug!(
                    seq = event.payload().seq,
                    message = %event.payload().message,
                    "ping"
                );
                Ok::<_, BusError>(Pong {
                    seq: event.payload().seq,
                    node_name,
                })
            }
        })?
        .subscribe_reply::<ProbeEndpoint, _>(|event: Event<ProbeEndpoint>| async move {
            let request = event.into_payload();
            let status = probe(&request.method, &request.path);
            Ok::<_, BusError>(ProbeResult {
                method: request.method,
                status,
            })
        })?
        .subscribe::<Announce, _>(|event: Event<Announce>| async move {
            tracing::info!(
                correlation_id = %event.correlation_id(),
                text = %event.payload().text,
                "announcement"
            );
            Ok::<(), BusError>(())
        })?
        .subscribe::<Announce, _>(|event: Event<Announce>| async move {
            if event.payload().text.is_empty() {
                return Err(BusError::application("empty announcement"));
            }
            Ok::<(), BusError>(())
        })?;

    Ok(registry)
}
