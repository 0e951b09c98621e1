//! # Entity Registry
//!
//! Single source of truth for every tracked entity. Owned exclusively by the
//! orchestrator task; all operations take `now` explicitly so lifecycle
//! logic stays pure and testable against synthetic time.
//!
//! Lifecycle: an entity is `Active` while updates arrive within the
//! inactivity window and `Offline` afterwards, keeping its last-known fields.
//! Any later update for the same identifier flips it back to `Active`.
//! Offline entities are only ever removed under capacity pressure: when the
//! configured maximum is exceeded, the least-recently-seen `Offline` entity
//! is evicted. Live data is never rejected; if nothing is offline, eviction
//! is deferred.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};

use crate::remoteid_logic::model::{
    DeltaKind, Entity, EntityDelta, EntityId, Lifecycle, StatusUpdate, Update,
};

pub struct Registry {
    entities: HashMap<EntityId, Entity>,
    max_entities: usize,
    inactivity_timeout: Duration,
    /// Detections that addressed no known entity (e.g. CAA-only broadcasts
    /// with an unseen MAC).
    pub unmatched: u64,
    pub evictions: u64,
}

impl Registry {
    pub fn new(max_entities: usize, inactivity_timeout: std::time::Duration) -> Self {
        Self {
            entities: HashMap::new(),
            max_entities,
            inactivity_timeout: Duration::from_std(inactivity_timeout)
                .unwrap_or_else(|_| Duration::seconds(60)),
            unmatched: 0,
            evictions: 0,
        }
    }

    pub fn get(&self, id: &str) -> Option<&Entity> {
        self.entities.get(id)
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Entity> {
        self.entities.values()
    }

    /// Upsert the addressed entity, then recompute lifecycle state across the
    /// registry. The returned deltas drive the orchestrator's fan-out and
    /// include timeout transitions detected on this pass and any eviction.
    pub fn apply(&mut self, update: &Update, now: DateTime<Utc>) -> Vec<EntityDelta> {
        let mut deltas = Vec::new();

        match update {
            Update::Drone(u) => {
                let id = match &u.id {
                    Some(id) => Some(id.clone()),
                    // CAA-only broadcast: addresses the drone with this MAC.
                    None => u.mac.as_deref().and_then(|mac| {
                        self.entities
                            .values()
                            .find(|e| e.drone().is_some_and(|d| d.mac.as_deref() == Some(mac)))
                            .map(|e| e.id.clone())
                    }),
                };
                match id {
                    Some(id) => {
                        if let Some(entity) = self.entities.get_mut(&id) {
                            let change = if entity.state == Lifecycle::Offline {
                                entity.state = Lifecycle::Active;
                                DeltaKind::CameOnline
                            } else {
                                DeltaKind::Updated
                            };
                            entity.apply_drone(u, now);
                            deltas.push(EntityDelta {
                                id,
                                kind: entity.kind,
                                change,
                            });
                        } else {
                            self.evict_if_full(now, &mut deltas);
                            let mut entity = Entity::new_drone(id.clone(), now);
                            entity.apply_drone(u, now);
                            let kind = entity.kind;
                            self.entities.insert(id.clone(), entity);
                            deltas.push(EntityDelta {
                                id,
                                kind,
                                change: DeltaKind::Updated,
                            });
                        }
                    }
                    None => {
                        self.unmatched += 1;
                        log::debug!("detection without serial matched no tracked MAC; skipping");
                    }
                }
            }
            Update::Status(u) => {
                deltas.extend(self.apply_status(u, now));
            }
        }

        self.expire(now, &mut deltas);
        deltas
    }

    fn apply_status(&mut self, u: &StatusUpdate, now: DateTime<Utc>) -> Vec<EntityDelta> {
        let id = format!("host-{}", u.serial);
        let mut deltas = Vec::new();
        if let Some(entity) = self.entities.get_mut(&id) {
            let change = if entity.state == Lifecycle::Offline {
                entity.state = Lifecycle::Active;
                DeltaKind::CameOnline
            } else {
                DeltaKind::Updated
            };
            entity.apply_status(u, now);
            deltas.push(EntityDelta {
                id,
                kind: entity.kind,
                change,
            });
        } else {
            self.evict_if_full(now, &mut deltas);
            let mut entity = Entity::new_host(id.clone(), u.serial.clone(), now);
            entity.apply_status(u, now);
            let kind = entity.kind;
            self.entities.insert(id.clone(), entity);
            deltas.push(EntityDelta {
                id,
                kind,
                change: DeltaKind::Updated,
            });
        }
        deltas
    }

    /// Timer-driven pass. Detects inactivity timeouts even when no messages
    /// arrive at all, so an offline transition is emitted within one sweep
    /// interval of the timeout elapsing.
    pub fn sweep(&mut self, now: DateTime<Utc>) -> Vec<EntityDelta> {
        let mut deltas = Vec::new();
        self.expire(now, &mut deltas);
        deltas
    }

    fn expire(&mut self, now: DateTime<Utc>, deltas: &mut Vec<EntityDelta>) {
        for entity in self.entities.values_mut() {
            if entity.state == Lifecycle::Active && now - entity.last_seen > self.inactivity_timeout
            {
                entity.state = Lifecycle::Offline;
                deltas.push(EntityDelta {
                    id: entity.id.clone(),
                    kind: entity.kind,
                    change: DeltaKind::WentOffline,
                });
            }
        }
    }

    fn evict_if_full(&mut self, now: DateTime<Utc>, deltas: &mut Vec<EntityDelta>) {
        if self.entities.len() < self.max_entities {
            return;
        }
        // Flag anything already past its window first, so a full registry of
        // quiet entities can still make room. These transitions are real and
        // flow out with the rest of the batch.
        self.expire(now, deltas);

        let victim = self
            .entities
            .values()
            .filter(|e| e.state == Lifecycle::Offline)
            .min_by_key(|e| e.last_seen)
            .map(|e| e.id.clone());
        match victim {
            Some(id) => {
                if let Some(entity) = self.entities.remove(&id) {
                    self.evictions += 1;
                    log::debug!("evicted {} (offline, last seen {})", id, entity.last_seen);
                    deltas.push(EntityDelta {
                        id,
                        kind: entity.kind,
                        change: DeltaKind::Evicted,
                    });
                }
            }
            None => {
                // Everything is live; accept the newcomer and defer.
                log::debug!(
                    "registry at capacity ({}) with no offline entity; deferring eviction",
                    self.max_entities
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remoteid_logic::model::DroneUpdate;
    use std::time::Duration as StdDuration;

    fn drone_update(id: &str, lat: f64, lon: f64) -> Update {
        Update::Drone(DroneUpdate {
            id: Some(id.to_string()),
            lat: Some(lat),
            lon: Some(lon),
            alt: Some(100.0),
            speed: Some(1.0),
            ..DroneUpdate::default()
        })
    }

    fn t0() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2025-06-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn first_update_creates_entity() {
        let mut r = Registry::new(10, StdDuration::from_secs(60));
        let deltas = r.apply(&drone_update("drone-A", 1.0, 2.0), t0());
        assert_eq!(deltas.len(), 1);
        assert_eq!(deltas[0].change, DeltaKind::Updated);
        assert_eq!(r.get("drone-A").unwrap().position(), Some((1.0, 2.0)));
    }

    #[test]
    fn duplicate_update_keeps_position_and_bumps_last_seen() {
        let mut r = Registry::new(10, StdDuration::from_secs(60));
        let u = drone_update("drone-A", 1.0, 2.0);
        r.apply(&u, t0());
        let later = t0() + Duration::seconds(2);
        r.apply(&u, later);
        let e = r.get("drone-A").unwrap();
        assert_eq!(e.position(), Some((1.0, 2.0)));
        assert_eq!(e.last_seen, later);
    }

    #[test]
    fn sweep_marks_offline_without_traffic() {
        let mut r = Registry::new(10, StdDuration::from_secs(60));
        r.apply(&drone_update("drone-A", 1.0, 2.0), t0());
        assert!(r.sweep(t0() + Duration::seconds(59)).is_empty());
        let deltas = r.sweep(t0() + Duration::seconds(61));
        assert_eq!(deltas.len(), 1);
        assert_eq!(deltas[0].change, DeltaKind::WentOffline);
        // Last position survives the transition.
        assert_eq!(r.get("drone-A").unwrap().position(), Some((1.0, 2.0)));
        // Repeated sweep does not re-emit.
        assert!(r.sweep(t0() + Duration::seconds(120)).is_empty());
    }

    #[test]
    fn host_offline_after_65s_retains_position() {
        let mut r = Registry::new(10, StdDuration::from_secs(60));
        let status = Update::Status(StatusUpdate {
            serial: "WD-1".into(),
            lat: Some(42.0),
            lon: Some(-70.0),
            ..StatusUpdate::default()
        });
        r.apply(&status, t0());
        let deltas = r.sweep(t0() + Duration::seconds(65));
        assert_eq!(deltas.len(), 1);
        assert_eq!(deltas[0].id, "host-WD-1");
        assert_eq!(deltas[0].change, DeltaKind::WentOffline);
        assert_eq!(r.get("host-WD-1").unwrap().position(), Some((42.0, -70.0)));
    }

    #[test]
    fn update_brings_offline_entity_back() {
        let mut r = Registry::new(10, StdDuration::from_secs(60));
        r.apply(&drone_update("drone-A", 1.0, 2.0), t0());
        r.sweep(t0() + Duration::seconds(90));
        let deltas = r.apply(&drone_update("drone-A", 1.1, 2.1), t0() + Duration::seconds(95));
        assert_eq!(deltas[0].change, DeltaKind::CameOnline);
        assert_eq!(r.get("drone-A").unwrap().state, Lifecycle::Active);
    }

    #[test]
    fn timeout_detected_on_apply_of_other_entity() {
        let mut r = Registry::new(10, StdDuration::from_secs(60));
        r.apply(&drone_update("drone-A", 1.0, 2.0), t0());
        let deltas = r.apply(
            &drone_update("drone-B", 3.0, 4.0),
            t0() + Duration::seconds(70),
        );
        assert!(deltas
            .iter()
            .any(|d| d.id == "drone-A" && d.change == DeltaKind::WentOffline));
        assert!(deltas
            .iter()
            .any(|d| d.id == "drone-B" && d.change == DeltaKind::Updated));
    }

    #[test]
    fn eviction_removes_oldest_offline_at_cap() {
        let mut r = Registry::new(2, StdDuration::from_secs(60));
        r.apply(&drone_update("drone-A", 1.0, 1.0), t0());
        r.apply(&drone_update("drone-B", 2.0, 2.0), t0() + Duration::seconds(10));
        r.apply(&drone_update("drone-C", 3.0, 3.0), t0() + Duration::seconds(20));
        // A and B never evicted while live: cap exceeded but deferred.
        assert_eq!(r.len(), 3);

        // Age A out, then a fourth identifier arrives.
        r.sweep(t0() + Duration::seconds(75));
        let deltas = r.apply(&drone_update("drone-D", 4.0, 4.0), t0() + Duration::seconds(82));
        assert!(deltas
            .iter()
            .any(|d| d.id == "drone-A" && d.change == DeltaKind::Evicted));
        assert!(r.get("drone-A").is_none());
        assert!(r.get("drone-D").is_some());
    }

    #[test]
    fn caa_only_update_matches_by_mac() {
        let mut r = Registry::new(10, StdDuration::from_secs(60));
        r.apply(
            &Update::Drone(DroneUpdate {
                id: Some("drone-A".into()),
                mac: Some("AA:BB".into()),
                lat: Some(1.0),
                lon: Some(2.0),
                ..DroneUpdate::default()
            }),
            t0(),
        );
        let deltas = r.apply(
            &Update::Drone(DroneUpdate {
                caa_id: Some("CAA-9".into()),
                mac: Some("AA:BB".into()),
                ..DroneUpdate::default()
            }),
            t0() + Duration::seconds(1),
        );
        assert_eq!(deltas.len(), 1);
        assert_eq!(deltas[0].id, "drone-A");
        assert_eq!(
            r.get("drone-A").unwrap().drone().unwrap().caa_id.as_deref(),
            Some("CAA-9")
        );
    }

    #[test]
    fn caa_only_update_with_unknown_mac_is_counted() {
        let mut r = Registry::new(10, StdDuration::from_secs(60));
        let deltas = r.apply(
            &Update::Drone(DroneUpdate {
                caa_id: Some("CAA-9".into()),
                mac: Some("FF:FF".into()),
                ..DroneUpdate::default()
            }),
            t0(),
        );
        assert!(deltas.is_empty());
        assert_eq!(r.unmatched, 1);
    }
}
