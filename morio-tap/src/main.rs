/*!
 * MORIO TAP - service entry point
 *
 * Wires config, store, cache worker, broker clients, processors, counters
 * and the throughput reporter, then consumes until a termination signal.
 *
 * Shutdown order: stop the reporter, flush pending cache writes,
 * disconnect the consumer, disconnect the producer.
 */

use anyhow::{Context, Result};
use morio_tap::broker::{MqttConsumer, MqttPublisher};
use morio_tap::config::load_config;
use morio_tap::inventory::{HttpInventory, Inventory};
use morio_tap::processors::builtin::builtins;
use morio_tap::store::ValkeyStore;
use morio_tap::tools::short_uuid;
use morio_tap::{Cache, Counters, Dispatcher, ProcessorRegistry, Producer, ThroughputReporter, Tools};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[cfg(unix)]
async fn terminated() -> Result<&'static str> {
    use tokio::signal::unix::{signal, SignalKind};
    let mut term = signal(SignalKind::terminate())?;
    let mut usr1 = signal(SignalKind::user_defined1())?;
    let mut usr2 = signal(SignalKind::user_defined2())?;
    Ok(tokio::select! {
        _ = tokio::signal::ctrl_c() => "SIGINT",
        _ = term.recv() => "SIGTERM",
        _ = usr1.recv() => "SIGUSR1",
        _ = usr2.recv() => "SIGUSR2",
    })
}

#[cfg(not(unix))]
async fn terminated() -> Result<&'static str> {
    tokio::signal::ctrl_c().await?;
    Ok("Ctrl-C")
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("morio_tap=info")))
        .init();

    let cfg = load_config().await.context("Failed to load configuration")?;
    let broker_conf = match cfg.validate() {
        Ok(conf) => conf.clone(),
        Err(e) => {
            error!("{}", e);
            return Err(e).context("Refusing to start");
        }
    };
    info!("Starting tap {} on {}", short_uuid(&cfg.node.uuid), cfg.node.fqdn);

    // store + cache worker
    let store = Arc::new(ValkeyStore::connect(&cfg.store.url).context("Failed to create store pool")?);
    let cache = Cache::spawn(store, cfg.cache.clone(), cfg.store.queue_capacity);

    // processors
    let registry = ProcessorRegistry::from_config(&cfg.processors, builtins());
    if registry.is_empty() {
        info!("No processors enabled, only counting messages");
    }
    let topics = registry.topics();

    // broker clients
    let publisher = Arc::new(
        MqttPublisher::connect(&broker_conf, &cfg.node)
            .await
            .context("Failed to create producer")?,
    );
    let mut consumer = MqttConsumer::connect(&broker_conf, &cfg.node, &topics)
        .await
        .context("Failed to create consumer")?;

    let produce = Producer::new(publisher.clone(), cache.clone());
    let executor = HttpInventory::new(&cfg.inventory.url, Duration::from_secs(cfg.inventory.timeout_secs))
        .context("Failed to create inventory client")?;
    let inventory = Inventory::new(Arc::new(executor), cache.clone());
    let tools = Tools {
        cache: cache.clone(),
        produce: produce.clone(),
        inventory,
        node: cfg.node.clone(),
    };

    // counters + reporter
    let counters = Counters::new(topics.iter().cloned(), registry.names()).shared();
    let tick = Duration::from_millis(cfg.counters.tick_ms);
    let reporter = ThroughputReporter::new(counters.clone(), produce, cache.clone(), cfg.node.clone(), tick).spawn();

    let dispatcher = Dispatcher::new(Arc::new(registry), counters, tools);

    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        match terminated().await {
            Ok(signal) => info!("Received {}, shutting down", signal),
            Err(e) => {
                error!("Failed to listen for signals: {}", e);
                std::future::pending::<()>().await;
            }
        }
        let _ = shutdown_tx.send(true);
    });

    info!("Consuming {} topics", topics.len());
    consumer.run(&dispatcher, &mut shutdown_rx).await;

    reporter.abort();
    cache.flush().await;
    if cache.dropped() > 0 {
        info!("{} cache writes were dropped while the queue was full", cache.dropped());
    }
    consumer.disconnect().await;
    publisher.disconnect().await;
    info!("Bye");
    Ok(())
}
