//! Autobus demo: two buses over one broker, in-process by default.
//!
//! The server bus binds a `Pinger` implementation and publishes `Pinged` for every
//! request it answers; the client bus fires `--requests` pings concurrently and
//! counts the events it sees.
//!
//! ```bash
//! RUST_LOG=autobus=debug autobus-demo --requests 1000 --publishers 8
//! autobus-demo --consistent-hashing
//! autobus-demo --amqp --broker-host rabbit.local   # needs the `amqp` feature
//! ```

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use autobus::{
    BrokerConnectionConfig, BrokerTransport, BrokerTransportConfig, Bus, BusBuilder,
    MemoryBroker, MessageHandler, ServiceImplementation, Transport,
};
use autobus::broker::BrokerConnector;
use autobus_core::{ServiceContract, ServiceInterfaceModel};
use clap::Parser;
use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Ping/pong round trips over an in-process or AMQP broker.
#[derive(Parser, Debug)]
#[command(name = "autobus-demo")]
#[command(version)]
struct Args {
    /// Number of concurrent requests
    #[arg(long, env = "AUTOBUS_DEMO_REQUESTS", default_value_t = 100)]
    requests: u32,

    /// Publisher channels per transport
    #[arg(long, env = "AUTOBUS_DEMO_PUBLISHERS", default_value_t = 4)]
    publishers: usize,

    /// Request timeout in milliseconds
    #[arg(long, env = "AUTOBUS_DEMO_TIMEOUT_MS", default_value_t = 5_000)]
    timeout_ms: u64,

    /// Bind requests through a consistent-hash exchange instead of a shared queue
    #[arg(long, env = "AUTOBUS_DEMO_CONSISTENT_HASHING")]
    consistent_hashing: bool,

    /// Connect to a network AMQP broker instead of the in-process one
    #[arg(long, env = "AUTOBUS_DEMO_AMQP")]
    amqp: bool,

    /// AMQP broker host
    #[arg(long, env = "AUTOBUS_BROKER_HOST", default_value = "localhost")]
    broker_host: String,

    /// AMQP broker port
    #[arg(long, env = "AUTOBUS_BROKER_PORT", default_value_t = 5672)]
    broker_port: u16,

    /// AMQP virtual host
    #[arg(long, env = "AUTOBUS_BROKER_VHOST", default_value = "/")]
    broker_vhost: String,

    /// AMQP user name
    #[arg(long, env = "AUTOBUS_BROKER_USER", default_value = "guest")]
    broker_user: String,

    /// AMQP password
    #[arg(long, env = "AUTOBUS_BROKER_PASSWORD", default_value = "guest", hide_env_values = true)]
    broker_password: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct Ping {
    id: u32,
}

#[derive(Debug, Serialize, Deserialize)]
struct Pong {
    id: u32,
}

#[derive(Debug, Serialize, Deserialize)]
struct Pinged {
    id: u32,
}

fn pinger() -> anyhow::Result<ServiceContract> {
    Ok(ServiceContract::builder("Pinger")
        .interface(
            ServiceInterfaceModel::builder("IPinger")
                .request::<Ping, Pong>()
                .build(),
        )
        .event::<Pinged>()
        .build()?)
}

#[cfg(feature = "amqp")]
fn connector(args: &Args) -> anyhow::Result<Arc<dyn BrokerConnector>> {
    if args.amqp {
        return Ok(Arc::new(autobus::broker::AmqpConnector));
    }
    Ok(Arc::new(MemoryBroker::new()))
}

#[cfg(not(feature = "amqp"))]
fn connector(args: &Args) -> anyhow::Result<Arc<dyn BrokerConnector>> {
    if args.amqp {
        anyhow::bail!("--amqp requires autobus-demo built with the amqp feature");
    }
    Ok(Arc::new(MemoryBroker::new()))
}

async fn start_bus(broker: &dyn BrokerConnector, args: &Args) -> anyhow::Result<Bus> {
    let config = BrokerTransportConfig {
        connection: BrokerConnectionConfig {
            host: args.broker_host.clone(),
            port: args.broker_port,
            virtual_host: args.broker_vhost.clone(),
            username: args.broker_user.clone(),
            password: args.broker_password.clone(),
        },
        publisher_pool_size: args.publishers,
        prefetch_count: 64,
        use_consistent_hashing: args.consistent_hashing,
        ..BrokerTransportConfig::default()
    };
    let transport: Arc<dyn Transport> = Arc::new(BrokerTransport::connect(broker, config).await?);
    Ok(BusBuilder::new()
        .use_service(pinger()?)
        .use_request_timeout(Duration::from_millis(args.timeout_ms))
        .use_transport(transport)
        .build()
        .await?)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    let broker = connector(&args)?;
    let server = start_bus(&*broker, &args).await.context("starting server bus")?;
    let client = start_bus(&*broker, &args).await.context("starting client bus")?;

    let events = server.clone();
    let implementation = ServiceImplementation::new()
        .implements("IPinger")
        .on_request::<Ping, Pong>(Arc::new(move |ping: Ping| {
            let events = events.clone();
            async move {
                events.publish(&Pinged { id: ping.id }).await?;
                anyhow::Ok(Pong { id: ping.id })
            }
        }));
    let binding = server.bind("Pinger", implementation).await?;

    let seen = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&seen);
    let on_pinged: Arc<dyn MessageHandler<Pinged>> = Arc::new(move |_: Pinged| {
        let counter = Arc::clone(&counter);
        async move {
            counter.fetch_add(1, Ordering::Relaxed);
            anyhow::Ok(())
        }
    });
    client.subscribe_event(Arc::clone(&on_pinged)).await?;

    let started = Instant::now();
    let mut calls = JoinSet::new();
    for id in 0..args.requests {
        let client = client.clone();
        calls.spawn(async move { client.request::<Ping, Pong>(&Ping { id }).await });
    }
    let mut answered = 0_usize;
    let mut failed = 0_usize;
    while let Some(joined) = calls.join_next().await {
        match joined? {
            Ok(_) => answered += 1,
            Err(e) => {
                failed += 1;
                tracing::warn!(error = %e, "request failed");
            }
        }
    }
    let elapsed = started.elapsed();

    // Events travel independently of replies; give the last ones a moment.
    let deadline = Instant::now() + Duration::from_secs(1);
    while seen.load(Ordering::Relaxed) < answered && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    info!(
        answered,
        failed,
        events = seen.load(Ordering::Relaxed),
        elapsed_ms = elapsed.as_millis(),
        consistent_hashing = args.consistent_hashing,
        amqp = args.amqp,
        "demo finished"
    );

    client.unsubscribe_event(&on_pinged).await?;
    server.unbind(binding).await?;
    client.shutdown().await?;
    server.shutdown().await?;
    Ok(())
}
