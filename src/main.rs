//! respin driver: connect to a RESP server, send one command, print the
//! reply, and disconnect.
//!
//! Endpoints, loop capacity, and logging come from CLI arguments or a
//! TOML file; see [`respin::config`].

use respin::config::{split_endpoint, Config};
use respin::{Client, EventLoop, PumpFlags};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load()?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        server = %config.server,
        replicas = config.replicas.len(),
        command = ?config.command,
        "starting respin driver"
    );

    let mut event_loop = EventLoop::with_capacity(config.setsize)?;

    let (host, port) = split_endpoint(&config.server)?;
    let client = Client::connect(&host, port);
    for replica in &config.replicas {
        let (host, port) = split_endpoint(replica)?;
        client.add_endpoint(&host, port)?;
    }

    let argv: Vec<Vec<u8>> = config
        .command
        .iter()
        .map(|arg| arg.clone().into_bytes())
        .collect();
    let argv: Vec<&[u8]> = argv.iter().map(|arg| arg.as_slice()).collect();
    client.command_argv(
        &argv,
        Some(Box::new(|ctx, reply| {
            match reply {
                Some(reply) => info!(?reply, "reply"),
                None => error!("command was flushed without a reply"),
            }
            ctx.disconnect();
        })),
    )?;

    event_loop.attach(
        &client,
        Some(Box::new(|_, status| match status {
            Ok(()) => info!("connected"),
            Err(err) => error!(%err, "connect failed"),
        })),
        Some(Box::new(|_, status| match status {
            Ok(()) => info!("disconnected"),
            Err(err) => error!(%err, "disconnected with error"),
        })),
    )?;

    event_loop.pump(PumpFlags::ALL);
    Ok(())
}
