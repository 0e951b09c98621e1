//! # Remote-ID Telemetry Gateway
//!
//! Ingests drone Remote-ID detections and host-system status from two
//! subscriber streams, tracks per-entity lifecycle state, and fans live
//! state out to tactical-map consumers (multicast and direct delivery), a
//! device-discovery publish bus, and an optional entity-tracking export.
//! Each reader and sink runs as its own task wired to the single-owner
//! orchestrator loop; a failing sink never stalls the others.

use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use tokio::signal;
use tokio::sync::{broadcast, mpsc};

mod remoteid_logic;
use remoteid_logic::affiliation::AffiliationTable;
use remoteid_logic::gate::UpdateGate;
use remoteid_logic::ingest::{self, ConflatingQueue, StreamKind};
use remoteid_logic::orchestrator::{Orchestrator, OrchestratorSettings, SinkChannels};
use remoteid_logic::registry::Registry;
use remoteid_logic::{config, export, logger, mqtt, sinks};

const SINK_CHANNEL_CAPACITY: usize = 256;

#[tokio::main]
async fn main() -> Result<()> {
    let config = config::load_config();
    logger::setup_logging(
        config.log_dir.as_deref().unwrap_or(Path::new("./logs")),
        config.log_level.as_deref().unwrap_or("info"),
    )?;

    // Misconfiguration is fatal before anything starts running.
    if let Err(e) = config.validate() {
        log::error!("Configuration error: {e:#}");
        std::process::exit(1);
    }

    let (shutdown_tx, _) = broadcast::channel(1);
    let mut sink_handles = Vec::new();
    let mut channels = SinkChannels::default();

    // Resync requests flow from the bus sink back to the orchestrator.
    let (resync_tx, resync_rx) = mpsc::channel(1);

    if let Some(multicast_cfg) = config.multicast_config()? {
        let (tx, rx) = mpsc::channel(SINK_CHANNEL_CAPACITY);
        channels.multicast = Some(tx);
        sink_handles.push(tokio::spawn(sinks::run_multicast(multicast_cfg, rx)));
    }

    if let Some(direct_cfg) = config.direct_config()? {
        let (tx, rx) = mpsc::channel(SINK_CHANNEL_CAPACITY);
        channels.direct = Some(tx);
        sink_handles.push(tokio::spawn(sinks::run_direct(direct_cfg, rx)));
    }

    if let Some(bus_cfg) = config.bus_config() {
        let (tx, rx) = mpsc::channel(SINK_CHANNEL_CAPACITY * 4);
        channels.bus = Some(tx);
        sink_handles.push(tokio::spawn(mqtt::run(bus_cfg, rx, resync_tx.clone())));
    }
    drop(resync_tx);

    if let Some(export_cfg) = config.export_config()? {
        let (tx, rx) = mpsc::channel(SINK_CHANNEL_CAPACITY);
        channels.export = Some(tx);
        sink_handles.push(tokio::spawn(export::run(export_cfg, rx)));
    }

    let telemetry_queue = Arc::new(ConflatingQueue::new(config.ingest_buffer()));
    let status_queue = Arc::new(ConflatingQueue::new(config.ingest_buffer()));

    let mut reader_handles = Vec::new();
    reader_handles.push(tokio::spawn(ingest::run_reader(
        StreamKind::Detection,
        config.detection_endpoint(),
        Arc::clone(&telemetry_queue),
        shutdown_tx.subscribe(),
    )));
    if let Some(status_endpoint) = config.status_endpoint() {
        reader_handles.push(tokio::spawn(ingest::run_reader(
            StreamKind::Status,
            status_endpoint,
            Arc::clone(&status_queue),
            shutdown_tx.subscribe(),
        )));
    } else {
        log::info!("No status stream port configured; status ingestion disabled.");
    }

    let orchestrator = Orchestrator::new(
        Registry::new(config.max_entities(), config.inactivity_timeout()),
        UpdateGate::new(config.tactical_thresholds(), config.bus_thresholds()),
        AffiliationTable::new(config.affiliation_file.clone()),
        channels,
        OrchestratorSettings {
            inactivity_timeout: config.inactivity_timeout(),
            sweep_interval: config.sweep_interval(),
            bus_naming: config.bus_naming(),
            export_source_name: config.export_source_name(),
        },
    );
    let orchestrator_handle = tokio::spawn(orchestrator.run(
        telemetry_queue,
        status_queue,
        resync_rx,
        shutdown_tx.subscribe(),
    ));

    // Wait for shutdown signal
    tokio::select! {
        _ = signal::ctrl_c() => {
            log::info!("Ctrl-C received, initiating shutdown.");
        }
        _ = async {
            #[cfg(unix)]
            {
                let mut term_signal = signal::unix::signal(signal::unix::SignalKind::terminate())
                    .expect("failed to install signal handler");
                term_signal.recv().await;
                log::info!("SIGTERM received, initiating shutdown.");
            }
            #[cfg(not(unix))]
            {
                // On non-unix platforms, just wait forever.
                std::future::pending::<()>().await;
            }
        } => {}
    }

    // Send shutdown signal to all components. The orchestrator drains (one
    // final sweep, then closes the sink channels) before the sinks exit.
    let _ = shutdown_tx.send(());
    let _ = orchestrator_handle.await;

    let grace = config.shutdown_grace();
    for handle in reader_handles.into_iter().chain(sink_handles) {
        if tokio::time::timeout(grace, handle).await.is_err() {
            log::warn!("a component did not stop within the grace period; proceeding");
        }
    }

    log::info!("Shutdown complete.");
    Ok(())
}
