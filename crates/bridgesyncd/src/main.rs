//! bridgesyncd entry point.
//!
//! Builds the object graph explicitly (pool, cache, port registry,
//! translator, tap manager, event pump) and wires the flow-table driver
//! to it. With no real control channel configured the driver runs over
//! the tracing channel, which logs every message it would send.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Context;
use tokio::signal;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

use swbridge_flowdriver::{FlowTableDriver, TracingChannel};
use swbridge_types::{Northbound, PacketPool};

use bridgesyncd::bridge::BridgeStateTranslator;
use bridgesyncd::cache::ObjectCache;
use bridgesyncd::config::BridgesyncConfig;
use bridgesyncd::nbi::NorthboundHandler;
use bridgesyncd::netlink::AsyncNetlinkSocket;
use bridgesyncd::ports::PortRegistry;
use bridgesyncd::pump::{EventPump, SyncEngine};
use bridgesyncd::tap::TapManager;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging()?;

    info!("bridgesyncd: starting bridge synchronization daemon");

    match run_daemon().await {
        Ok(()) => {
            info!("bridgesyncd: exiting normally");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "bridgesyncd: exiting with error");
            Err(e)
        }
    }
}

fn init_logging() -> anyhow::Result<()> {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_target(true)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber).context("failed to set logger")?;
    Ok(())
}

async fn run_daemon() -> anyhow::Result<()> {
    let shutdown = setup_signal_handlers();

    let config = match std::env::args().nth(1) {
        Some(path) => BridgesyncConfig::load_or_default(path)?,
        None => BridgesyncConfig::load()?,
    };
    config.validate()?;

    let pool = Arc::new(PacketPool::new(
        config.pool.size,
        config.pool.max_frame_size,
    ));
    let cache = Arc::new(ObjectCache::new());
    let ports = Arc::new(PortRegistry::new());
    let translator = Arc::new(BridgeStateTranslator::new(ports.clone(), &config.bridge));
    let taps = Arc::new(TapManager::new(pool.clone()));

    let socket = AsyncNetlinkSocket::new().context("failed to open kernel channel")?;
    let engine = SyncEngine::new(cache, ports.clone(), translator.clone(), taps.clone());
    let (pump, pump_handle) = EventPump::new(socket, engine, &config.pump);

    let northbound = NorthboundHandler::new(ports, translator, taps, pump_handle);

    // no control-channel endpoint configured: dry-run over the tracing
    // channel, logging every flow and group message
    let driver = Arc::new(FlowTableDriver::new(
        Arc::new(TracingChannel::default()),
        pool,
    ));
    northbound.register_switch(driver);

    let pump_task = tokio::spawn(pump.run());
    info!("bridgesyncd: listening for kernel bridge events");

    loop {
        if shutdown.load(Ordering::Relaxed) {
            info!("bridgesyncd: received shutdown signal");
            break;
        }
        if pump_task.is_finished() {
            anyhow::bail!("event pump terminated unexpectedly");
        }
        tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
    }

    pump_task.abort();
    info!("bridgesyncd: graceful shutdown complete");
    Ok(())
}

fn setup_signal_handlers() -> Arc<AtomicBool> {
    let shutdown_flag = Arc::new(AtomicBool::new(false));
    let flag = shutdown_flag.clone();

    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            info!("bridgesyncd: received SIGINT/SIGTERM");
            flag.store(true, Ordering::Relaxed);
        }
    });

    shutdown_flag
}
