use std::sync::Arc;
use std::time::Instant;

use tokio_util::sync::CancellationToken;

use herald_api::{BrokerTransport, Command, HttpMethod};
use herald_engine::{CommandDispatcher, EventBus, MemoryBroker};

use crate::config::{NodeConfig, PingArgs};
use crate::demo::{self, Announce, Ping, ProbeEndpoint};
use crate::error::NodeError;

pub async fn run(args: PingArgs) -> Result<(), NodeError> {
    let config = NodeConfig::load(args.config.as_deref())?;
    tracing::info!(node = %config.node_name, "herald-node starting");

    let broker = MemoryBroker::new();
    let transport: Arc<dyn BrokerTransport> = Arc::new(broker.clone());

    let registry = demo::registry(&config.node_name, config.bus.resolver())?;
    let bus = Arc::new(EventBus::from_config(registry, transport.clone(), &config.bus));
    let dispatcher = CommandDispatcher::from_config(transport, &config.bus);

    // --- CancellationToken for graceful shutdown ---
    let token = CancellationToken::new();
    let handles = bus.clone().listen(token.clone()).await?;
    tracing::info!(wire_types = ?bus.wire_types(), "bus ready");

    let ctrl_c = {
        let token = token.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("interrupted");
                token.cancel();
            }
        })
    };

    let result = exchange(&dispatcher, &args, &token).await;

    token.cancel();
    ctrl_c.abort();
    for h in handles {
        let _ = h.await;
    }
    tracing::info!(pending_replies = broker.pending_replies(), "herald-node stopped");
    result
}

async fn exchange(
    dispatcher: &CommandDispatcher,
    args: &PingArgs,
    token: &CancellationToken,
) -> Result<(), NodeError> {
    for seq in 0..args.count {
        let started = Instant::now();
        let pong = dispatcher
            .execute(
                Command::new(Ping {
                    seq,
                    message: args.message.clone(),
                }),
                token,
            )
            .await?;
        println!(
            "pong seq={} from {} in {:?}",
            pong.seq,
            pong.node_name,
            started.elapsed()
        );
    }

    dispatcher
        .execute(
            Command::new(Announce {
                text: format!("{} pings answered", args.count),
            })
            .without_reply(),
            token,
        )
        .await?;

    let endpoints = [
        (HttpMethod::GET, "/health"),
        (HttpMethod::DELETE, "/health"),
        (HttpMethod::GET, "/nope"),
    ];
    for (method, path) in endpoints {
        let result = dispatcher
            .execute(
                Command::new(ProbeEndpoint {
                    method,
                    path: path.to_string(),
                }),
                token,
            )
            .await?;
        println!("{} {path} -> {}", result.method, result.status);
    }
    Ok(())
}
