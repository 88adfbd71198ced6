use std::sync::Arc;

use herald_engine::{Binding, EventBus, MemoryBroker};

use crate::config::{CheckArgs, NodeConfig};
use crate::demo;
use crate::error::NodeError;

pub fn run(args: CheckArgs) -> Result<(), NodeError> {
    let config = NodeConfig::load(args.config.as_deref())?;
    let registry = demo::registry(&config.node_name, config.bus.resolver())?;
    let bus = EventBus::new(registry, Arc::new(MemoryBroker::new()));

    bus.validate(&args.wire_types)?;

    for wire_type in &args.wire_types {
        match bus.registry().binding(wire_type) {
            Some(Binding::Reply(d)) => println!(
                "{wire_type}: reply handler {} -> {}",
                d.handler(),
                d.reply_type().unwrap_or("-")
            ),
            Some(Binding::Listeners(ls)) => {
                println!("{wire_type}: {} fire-and-forget handler(s)", ls.len())
            }
            None => {}
        }
    }
    Ok(())
}
