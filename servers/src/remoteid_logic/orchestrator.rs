//! # Dispatch Orchestrator
//!
//! The single owner of the entity registry and the update gate. Merges the
//! two inbound streams, the periodic timeout sweep and bus resync requests
//! into one loop, applies updates, and fans each resulting delta out through
//! the gate to the encoders and sink channels. Sink handoff is `try_send`:
//! a slow or dead sink drops its own traffic and never stalls the loop or
//! the other sinks.
//!
//! Lifecycle of the process: `Starting` while components are wired up,
//! `Running` for the steady state, `Draining` after a stop request (one
//! final sweep so a pending offline transition still goes out, then the
//! sink channels close), and `Stopped`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::{broadcast, mpsc};
use tokio::time::MissedTickBehavior;

use crate::remoteid_logic::affiliation::AffiliationTable;
use crate::remoteid_logic::cot;
use crate::remoteid_logic::export::{self, ExportClass, ExportRecord};
use crate::remoteid_logic::gate::{SinkId, UpdateGate};
use crate::remoteid_logic::ingest::ConflatingQueue;
use crate::remoteid_logic::model::{
    DeltaKind, Entity, EntityDelta, EntityId, EntityKind, Lifecycle, Update,
};
use crate::remoteid_logic::mqtt::{self, BusMessage, BusNaming};
use crate::remoteid_logic::registry::Registry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayPhase {
    Starting,
    Running,
    Draining,
    Stopped,
}

/// Outbound handoff points; `None` for sinks that are not enabled.
#[derive(Default)]
pub struct SinkChannels {
    pub multicast: Option<mpsc::Sender<Vec<u8>>>,
    pub direct: Option<mpsc::Sender<Vec<u8>>>,
    pub bus: Option<mpsc::Sender<BusMessage>>,
    pub export: Option<mpsc::Sender<ExportRecord>>,
}

pub struct OrchestratorSettings {
    pub inactivity_timeout: StdDuration,
    pub sweep_interval: StdDuration,
    pub bus_naming: BusNaming,
    pub export_source_name: String,
}

pub struct Orchestrator {
    phase: GatewayPhase,
    registry: Registry,
    gate: UpdateGate,
    affiliations: AffiliationTable,
    /// Metadata fingerprint per entity whose discovery has been published.
    announced: HashMap<EntityId, u64>,
    channels: SinkChannels,
    settings: OrchestratorSettings,
    dropped_sends: u64,
}

impl Orchestrator {
    pub fn new(
        registry: Registry,
        gate: UpdateGate,
        affiliations: AffiliationTable,
        channels: SinkChannels,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            phase: GatewayPhase::Starting,
            registry,
            gate,
            affiliations,
            announced: HashMap::new(),
            channels,
            settings,
            dropped_sends: 0,
        }
    }

    fn set_phase(&mut self, phase: GatewayPhase) {
        if self.phase != phase {
            log::info!("gateway {:?} -> {:?}", self.phase, phase);
            self.phase = phase;
        }
    }

    pub async fn run(
        mut self,
        telemetry: Arc<ConflatingQueue<Update>>,
        status: Arc<ConflatingQueue<Update>>,
        mut resync_rx: mpsc::Receiver<()>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        self.set_phase(GatewayPhase::Running);
        let mut sweep = tokio::time::interval(self.settings.sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                update = telemetry.pop() => self.handle_update(&update, Utc::now()),
                update = status.pop() => self.handle_update(&update, Utc::now()),
                _ = sweep.tick() => self.handle_sweep(Utc::now()),
                Some(()) = resync_rx.recv() => self.handle_resync(),
                _ = shutdown.recv() => break,
            }
        }

        self.set_phase(GatewayPhase::Draining);
        // One final sweep: an offline transition that became due while we
        // were asked to stop still reaches every sink before the channels
        // close.
        self.handle_sweep(Utc::now());
        if self.dropped_sends > 0 {
            log::warn!("{} sink handoffs were dropped this run", self.dropped_sends);
        }
        self.channels = SinkChannels::default();
        self.set_phase(GatewayPhase::Stopped);
    }

    pub fn handle_update(&mut self, update: &Update, now: DateTime<Utc>) {
        let deltas = self.registry.apply(update, now);
        self.dispatch_all(deltas, now);
    }

    pub fn handle_sweep(&mut self, now: DateTime<Utc>) {
        let deltas = self.registry.sweep(now);
        self.dispatch_all(deltas, now);
    }

    fn dispatch_all(&mut self, deltas: Vec<EntityDelta>, now: DateTime<Utc>) {
        for delta in deltas {
            self.dispatch(&delta, now);
        }
    }

    /// A fresh bus consumer has no prior state: publish discovery and current
    /// state for everything we know, then incremental updates resume.
    pub fn handle_resync(&mut self) {
        if self.channels.bus.is_none() {
            return;
        }
        log::info!(
            "bus resync requested; announcing {} entities",
            self.registry.len()
        );
        let entities: Vec<Entity> = self.registry.iter().cloned().collect();
        let naming = self.settings.bus_naming.clone();
        for entity in entities {
            let (discovery, state) = match entity.kind {
                EntityKind::Drone => (
                    mqtt::drone_discovery_messages(&naming, &entity),
                    mqtt::drone_state_messages(&naming, &entity),
                ),
                EntityKind::SystemHost => (
                    mqtt::host_discovery_messages(&naming, &entity),
                    mqtt::host_state_messages(&naming, &entity),
                ),
            };
            self.send_bus(discovery);
            if entity.state == Lifecycle::Offline {
                self.send_bus(self.offline_messages(&entity.id, entity.kind));
            } else {
                self.send_bus(state);
            }
            self.announced
                .insert(entity.id.clone(), mqtt::metadata_fingerprint(&entity));
        }
    }

    fn dispatch(&mut self, delta: &EntityDelta, now: DateTime<Utc>) {
        if delta.change == DeltaKind::Evicted {
            self.gate.forget(&delta.id);
            self.announced.remove(&delta.id);
            // A consumer must not keep showing a live dot for an entity the
            // gateway forgot.
            let msgs = self.offline_messages(&delta.id, delta.kind);
            self.send_bus(msgs);
            return;
        }

        let Some(entity) = self.registry.get(&delta.id).cloned() else {
            return;
        };
        let transition = delta.change.is_transition();

        if (self.channels.multicast.is_some() || self.channels.direct.is_some())
            && self
                .gate
                .should_forward(&entity, SinkId::Tactical, transition, now)
        {
            self.send_tactical_entity(&entity, now);
        }

        if self.channels.bus.is_some()
            && self
                .gate
                .should_forward(&entity, SinkId::Bus, transition, now)
        {
            self.send_bus_entity(&entity, delta.change);
        }

        // The export sink governs its own cadence per entity class.
        if self.channels.export.is_some() {
            self.send_export_entity(&entity, transition, now);
        }
    }

    fn stale_time(&self, entity: &Entity, now: DateTime<Utc>) -> DateTime<Utc> {
        if entity.state == Lifecycle::Offline {
            // Already stale: consumers fade the mark but keep coordinates.
            now
        } else {
            let window = Duration::from_std(self.settings.inactivity_timeout)
                .unwrap_or_else(|_| Duration::seconds(60));
            entity.last_seen + window
        }
    }

    fn send_tactical_entity(&mut self, entity: &Entity, now: DateTime<Utc>) {
        let stale = self.stale_time(entity, now);
        let affiliation = self.affiliations.lookup(&entity.id);

        let mut documents = Vec::new();
        match entity.kind {
            EntityKind::Drone => {
                match cot::drone_event(entity, affiliation, now, stale) {
                    Ok(doc) => documents.push(doc),
                    Err(e) => log::warn!("tactical encode failed for {}: {e:#}", entity.id),
                }
                if let Some(d) = entity.drone() {
                    if let (Some(lat), Some(lon)) = (d.pilot_lat, d.pilot_lon) {
                        match cot::pilot_event(entity, lat, lon, affiliation, now, stale) {
                            Ok(doc) => documents.push(doc),
                            Err(e) => {
                                log::warn!("pilot encode failed for {}: {e:#}", entity.id)
                            }
                        }
                    }
                    if let (Some(lat), Some(lon)) = (d.home_lat, d.home_lon) {
                        match cot::home_event(entity, lat, lon, affiliation, now, stale) {
                            Ok(doc) => documents.push(doc),
                            Err(e) => log::warn!("home encode failed for {}: {e:#}", entity.id),
                        }
                    }
                }
            }
            EntityKind::SystemHost => match cot::host_event(entity, now, stale) {
                Ok(doc) => documents.push(doc),
                Err(e) => log::warn!("tactical encode failed for {}: {e:#}", entity.id),
            },
        }

        for doc in documents {
            if let Some(direct) = &self.channels.direct {
                if direct.try_send(doc.clone()).is_err() {
                    self.dropped_sends += 1;
                    log::debug!("direct sink backlogged; dropped a document");
                }
            }
            if let Some(multicast) = &self.channels.multicast {
                if multicast.try_send(doc).is_err() {
                    self.dropped_sends += 1;
                    log::debug!("multicast sink backlogged; dropped a document");
                }
            }
        }
    }

    fn offline_messages(&self, id: &str, kind: EntityKind) -> Vec<BusMessage> {
        match kind {
            EntityKind::Drone => mqtt::drone_offline_messages(&self.settings.bus_naming, id),
            EntityKind::SystemHost => {
                let serial = id.strip_prefix("host-").unwrap_or(id);
                mqtt::host_offline_messages(&self.settings.bus_naming, serial)
            }
        }
    }

    fn send_bus_entity(&mut self, entity: &Entity, change: DeltaKind) {
        let naming = self.settings.bus_naming.clone();

        // Discovery first, once per entity or when descriptive metadata
        // changes, so consumers can register the device before telemetry.
        let fingerprint = mqtt::metadata_fingerprint(entity);
        if self.announced.get(&entity.id) != Some(&fingerprint) {
            let discovery = match entity.kind {
                EntityKind::Drone => mqtt::drone_discovery_messages(&naming, entity),
                EntityKind::SystemHost => mqtt::host_discovery_messages(&naming, entity),
            };
            self.send_bus(discovery);
            self.announced.insert(entity.id.clone(), fingerprint);
        }

        let msgs = if change == DeltaKind::WentOffline {
            self.offline_messages(&entity.id, entity.kind)
        } else {
            match entity.kind {
                EntityKind::Drone => mqtt::drone_state_messages(&naming, entity),
                EntityKind::SystemHost => mqtt::host_state_messages(&naming, entity),
            }
        };
        self.send_bus(msgs);
    }

    fn send_bus(&mut self, messages: Vec<BusMessage>) {
        let Some(bus) = &self.channels.bus else {
            return;
        };
        for msg in messages {
            if bus.try_send(msg).is_err() {
                self.dropped_sends += 1;
                log::debug!("bus sink backlogged; dropped a message");
            }
        }
    }

    fn send_export_entity(&mut self, entity: &Entity, transition: bool, now: DateTime<Utc>) {
        let source = self.settings.export_source_name.clone();
        let mut records = Vec::new();
        match entity.kind {
            EntityKind::Drone => {
                records.push(ExportRecord {
                    entity_id: entity.id.clone(),
                    class: ExportClass::Drone,
                    transition,
                    payload: export::encode_drone(entity, &source, now),
                });
                if let Some(d) = entity.drone() {
                    if let (Some(lat), Some(lon)) = (d.pilot_lat, d.pilot_lon) {
                        records.push(ExportRecord {
                            entity_id: format!("pilot-{}", crate::remoteid_logic::model::id_tail(&entity.id)),
                            class: ExportClass::Pilot,
                            transition,
                            payload: export::encode_point(
                                entity,
                                ExportClass::Pilot,
                                lat,
                                lon,
                                &source,
                                now,
                            ),
                        });
                    }
                    if let (Some(lat), Some(lon)) = (d.home_lat, d.home_lon) {
                        records.push(ExportRecord {
                            entity_id: format!("home-{}", crate::remoteid_logic::model::id_tail(&entity.id)),
                            class: ExportClass::Home,
                            transition,
                            payload: export::encode_point(
                                entity,
                                ExportClass::Home,
                                lat,
                                lon,
                                &source,
                                now,
                            ),
                        });
                    }
                }
            }
            EntityKind::SystemHost => {
                records.push(ExportRecord {
                    entity_id: entity.id.clone(),
                    class: ExportClass::Host,
                    transition,
                    payload: export::encode_host(entity, &source, now),
                });
            }
        }

        let Some(export_tx) = &self.channels.export else {
            return;
        };
        for record in records {
            if export_tx.try_send(record).is_err() {
                self.dropped_sends += 1;
                log::debug!("export sink backlogged; dropped a record");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remoteid_logic::gate::GateThresholds;
    use crate::remoteid_logic::model::DroneUpdate;

    fn t0() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2025-06-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn naming() -> BusNaming {
        BusNaming {
            base: "skywatch".into(),
            discovery_prefix: "homeassistant".into(),
            device_base: "skywatch_drone".into(),
            retain_state: true,
        }
    }

    struct Harness {
        orchestrator: Orchestrator,
        multicast_rx: mpsc::Receiver<Vec<u8>>,
        bus_rx: mpsc::Receiver<BusMessage>,
        export_rx: mpsc::Receiver<ExportRecord>,
    }

    fn harness(thresholds: GateThresholds) -> Harness {
        let (multicast_tx, multicast_rx) = mpsc::channel(256);
        let (bus_tx, bus_rx) = mpsc::channel(1024);
        let (export_tx, export_rx) = mpsc::channel(256);
        let orchestrator = Orchestrator::new(
            Registry::new(10, StdDuration::from_secs(60)),
            UpdateGate::new(thresholds, thresholds),
            AffiliationTable::new(None),
            SinkChannels {
                multicast: Some(multicast_tx),
                direct: None,
                bus: Some(bus_tx),
                export: Some(export_tx),
            },
            OrchestratorSettings {
                inactivity_timeout: StdDuration::from_secs(60),
                sweep_interval: StdDuration::from_secs(5),
                bus_naming: naming(),
                export_source_name: "skywatch".into(),
            },
        );
        Harness {
            orchestrator,
            multicast_rx,
            bus_rx,
            export_rx,
        }
    }

    fn drone_update(lat: f64, lon: f64) -> Update {
        Update::Drone(DroneUpdate {
            id: Some("drone-SN1".into()),
            lat: Some(lat),
            lon: Some(lon),
            alt: Some(85.0),
            speed: Some(0.5),
            pilot_lat: Some(42.21),
            pilot_lon: Some(-70.90),
            ..DroneUpdate::default()
        })
    }

    fn drain_bus(rx: &mut mpsc::Receiver<BusMessage>) -> Vec<BusMessage> {
        let mut out = Vec::new();
        while let Ok(m) = rx.try_recv() {
            out.push(m);
        }
        out
    }

    fn strict_thresholds() -> GateThresholds {
        GateThresholds {
            min_interval: StdDuration::from_secs(1000),
            movement_m: 1e9,
            altitude_m: 1e9,
            speed_mps: 1e9,
        }
    }

    #[test]
    fn first_state_reaches_every_sink_with_discovery_first() {
        let mut h = harness(strict_thresholds());
        h.orchestrator.handle_update(&drone_update(42.2165, -70.9025), t0());

        // Tactical: drone document plus the linked pilot document.
        let mut tactical = Vec::new();
        while let Ok(doc) = h.multicast_rx.try_recv() {
            tactical.push(String::from_utf8(doc).unwrap());
        }
        assert_eq!(tactical.len(), 2);
        assert!(tactical[0].contains(r#"uid="drone-SN1""#));
        assert!(tactical[1].contains(r#"uid="pilot-SN1""#));

        // Bus: discovery documents precede state.
        let bus = drain_bus(&mut h.bus_rx);
        assert!(!bus.is_empty());
        assert!(bus[0].topic.starts_with("homeassistant/"));
        assert!(bus.iter().any(|m| m.topic == "skywatch/drone/drone-SN1"));

        // Export: drone and pilot records.
        let mut export = Vec::new();
        while let Ok(r) = h.export_rx.try_recv() {
            export.push(r);
        }
        assert_eq!(export.len(), 2);
        assert_eq!(export[0].class, ExportClass::Drone);
    }

    #[test]
    fn in_threshold_update_is_suppressed_but_offline_bypasses() {
        let mut h = harness(strict_thresholds());
        h.orchestrator.handle_update(&drone_update(42.2165, -70.9025), t0());
        while h.multicast_rx.try_recv().is_ok() {}
        drain_bus(&mut h.bus_rx);

        // Second in-threshold update: nothing through the gated sinks.
        h.orchestrator
            .handle_update(&drone_update(42.2165, -70.9025), t0() + Duration::seconds(2));
        assert!(h.multicast_rx.try_recv().is_err());
        assert!(drain_bus(&mut h.bus_rx).is_empty());

        // Timeout sweep: the offline transition reaches every sink despite
        // the unreachable thresholds.
        h.orchestrator.handle_sweep(t0() + Duration::seconds(70));
        let doc = h.multicast_rx.try_recv().expect("tactical offline document");
        let doc = String::from_utf8(doc).unwrap();
        assert!(doc.contains(r#"uid="drone-SN1""#));

        let bus = drain_bus(&mut h.bus_rx);
        assert!(bus
            .iter()
            .any(|m| m.topic == "skywatch/drone/drone-SN1/availability" && m.payload == "offline"));

        let mut export_transitions = Vec::new();
        while let Ok(r) = h.export_rx.try_recv() {
            export_transitions.push(r);
        }
        assert!(export_transitions.iter().any(|r| r.transition));
    }

    #[test]
    fn offline_tactical_document_is_already_stale() {
        let mut h = harness(strict_thresholds());
        h.orchestrator.handle_update(&drone_update(42.2165, -70.9025), t0());
        while h.multicast_rx.try_recv().is_ok() {}

        let sweep_at = t0() + Duration::seconds(70);
        h.orchestrator.handle_sweep(sweep_at);
        let doc = String::from_utf8(h.multicast_rx.try_recv().unwrap()).unwrap();
        let stale = format!(
            r#"stale="{}""#,
            sweep_at.format("%Y-%m-%dT%H:%M:%S%.6fZ")
        );
        assert!(doc.contains(&stale), "document was not already stale: {doc}");
        assert!(doc.contains(r#"lat="42.2165""#));
    }

    #[test]
    fn discovery_not_repeated_until_metadata_changes() {
        let loose = GateThresholds {
            min_interval: StdDuration::from_millis(0),
            ..GateThresholds::default()
        };
        let mut h = harness(loose);
        h.orchestrator.handle_update(&drone_update(42.2165, -70.9025), t0());
        drain_bus(&mut h.bus_rx);

        h.orchestrator
            .handle_update(&drone_update(42.3, -70.9), t0() + Duration::seconds(5));
        let bus = drain_bus(&mut h.bus_rx);
        assert!(bus.iter().all(|m| !m.topic.starts_with("homeassistant/")));

        // New description: discovery goes out again.
        h.orchestrator.handle_update(
            &Update::Drone(DroneUpdate {
                id: Some("drone-SN1".into()),
                lat: Some(42.3),
                lon: Some(-70.9),
                description: Some("renamed".into()),
                ..DroneUpdate::default()
            }),
            t0() + Duration::seconds(10),
        );
        let bus = drain_bus(&mut h.bus_rx);
        assert!(bus.iter().any(|m| m.topic.starts_with("homeassistant/")));
    }

    #[test]
    fn resync_replays_discovery_for_known_entities() {
        let mut h = harness(GateThresholds::default());
        h.orchestrator.handle_update(&drone_update(42.2165, -70.9025), t0());
        drain_bus(&mut h.bus_rx);

        h.orchestrator.handle_resync();
        let bus = drain_bus(&mut h.bus_rx);
        assert!(bus
            .iter()
            .any(|m| m.topic
                == "homeassistant/device_tracker/skywatch_drone_drone-SN1/config"));
        assert!(bus.iter().any(|m| m.topic == "skywatch/drone/drone-SN1"));
    }

    #[test]
    fn eviction_forgets_gate_state_and_flips_availability() {
        let (bus_tx, mut bus_rx) = mpsc::channel(1024);
        let mut orchestrator = Orchestrator::new(
            Registry::new(1, StdDuration::from_secs(60)),
            UpdateGate::new(strict_thresholds(), strict_thresholds()),
            AffiliationTable::new(None),
            SinkChannels {
                multicast: None,
                direct: None,
                bus: Some(bus_tx),
                export: None,
            },
            OrchestratorSettings {
                inactivity_timeout: StdDuration::from_secs(60),
                sweep_interval: StdDuration::from_secs(5),
                bus_naming: naming(),
                export_source_name: "skywatch".into(),
            },
        );

        orchestrator.handle_update(&drone_update(42.0, -70.0), t0());
        orchestrator.handle_sweep(t0() + Duration::seconds(70));
        while bus_rx.try_recv().is_ok() {}

        // A second identifier evicts the offline first one.
        orchestrator.handle_update(
            &Update::Drone(DroneUpdate {
                id: Some("drone-SN2".into()),
                lat: Some(1.0),
                lon: Some(2.0),
                ..DroneUpdate::default()
            }),
            t0() + Duration::seconds(80),
        );
        let mut msgs = Vec::new();
        while let Ok(m) = bus_rx.try_recv() {
            msgs.push(m);
        }
        assert!(msgs
            .iter()
            .any(|m| m.topic == "skywatch/drone/drone-SN1/availability"
                && m.payload == "offline"));
        assert!(msgs.iter().any(|m| m.topic == "skywatch/drone/drone-SN2"));
    }
}
