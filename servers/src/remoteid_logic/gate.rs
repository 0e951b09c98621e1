//! # Update Gate
//!
//! Decides, per entity and per sink independently, whether the entity's
//! current state is worth forwarding now. The rule is hybrid: forward when
//! enough time has passed since the last forward to that sink, or when the
//! entity moved, climbed or changed speed beyond the sink's thresholds.
//! The first-ever state and lifecycle transitions always forward, bypassing
//! every threshold. On a forward the gate records the new snapshot as that
//! sink's baseline, so sinks never interfere with each other's cadence.

use std::collections::HashMap;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};

use crate::remoteid_logic::model::{Entity, EntityId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SinkId {
    /// Tactical event delivery (multicast and direct transports share one
    /// cadence; they carry the same document).
    Tactical,
    /// The publish-bus (discovery + telemetry) sink.
    Bus,
}

#[derive(Debug, Clone, Copy)]
pub struct GateThresholds {
    pub min_interval: StdDuration,
    pub movement_m: f64,
    pub altitude_m: f64,
    pub speed_mps: f64,
}

impl Default for GateThresholds {
    fn default() -> Self {
        Self {
            min_interval: StdDuration::from_secs(1),
            movement_m: 25.0,
            altitude_m: 10.0,
            speed_mps: 2.0,
        }
    }
}

#[derive(Debug, Clone)]
struct Baseline {
    at: DateTime<Utc>,
    lat: Option<f64>,
    lon: Option<f64>,
    alt: Option<f64>,
    speed: Option<f64>,
}

impl Baseline {
    fn of(entity: &Entity, now: DateTime<Utc>) -> Self {
        let (lat, lon) = match entity.position() {
            Some((a, b)) => (Some(a), Some(b)),
            None => (None, None),
        };
        Self {
            at: now,
            lat,
            lon,
            alt: entity.altitude(),
            speed: entity.speed(),
        }
    }
}

pub struct UpdateGate {
    tactical: GateThresholds,
    bus: GateThresholds,
    baselines: HashMap<(EntityId, SinkId), Baseline>,
}

impl UpdateGate {
    pub fn new(tactical: GateThresholds, bus: GateThresholds) -> Self {
        Self {
            tactical,
            bus,
            baselines: HashMap::new(),
        }
    }

    fn thresholds(&self, sink: SinkId) -> &GateThresholds {
        match sink {
            SinkId::Tactical => &self.tactical,
            SinkId::Bus => &self.bus,
        }
    }

    /// Evaluate and, when the answer is yes, record the entity's current
    /// state as the new baseline for this sink.
    pub fn should_forward(
        &mut self,
        entity: &Entity,
        sink: SinkId,
        transition: bool,
        now: DateTime<Utc>,
    ) -> bool {
        let th = *self.thresholds(sink);
        let key = (entity.id.clone(), sink);

        let forward = match self.baselines.get(&key) {
            None => true,
            Some(_) if transition => true,
            Some(b) => {
                let min_interval =
                    Duration::from_std(th.min_interval).unwrap_or_else(|_| Duration::seconds(1));
                let elapsed = now - b.at >= min_interval;
                let moved = match (b.lat, b.lon, entity.position()) {
                    (Some(lat0), Some(lon0), Some((lat1, lon1))) => {
                        haversine_m(lat0, lon0, lat1, lon1) >= th.movement_m
                    }
                    // Position appearing or disappearing is a change worth
                    // forwarding.
                    (None, None, Some(_)) => true,
                    _ => false,
                };
                let climbed = match (b.alt, entity.altitude()) {
                    (Some(a0), Some(a1)) => (a1 - a0).abs() >= th.altitude_m,
                    (None, Some(_)) => true,
                    _ => false,
                };
                let accelerated = match (b.speed, entity.speed()) {
                    (Some(s0), Some(s1)) => (s1 - s0).abs() >= th.speed_mps,
                    (None, Some(_)) => true,
                    _ => false,
                };
                elapsed || moved || climbed || accelerated
            }
        };

        if forward {
            self.baselines.insert(key, Baseline::of(entity, now));
        }
        forward
    }

    /// Drop every baseline for an evicted entity.
    pub fn forget(&mut self, id: &str) {
        self.baselines.retain(|(eid, _), _| eid != id);
    }

    #[cfg(test)]
    fn baseline_count(&self) -> usize {
        self.baselines.len()
    }
}

/// Great-circle distance in meters (haversine).
pub fn haversine_m(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    const EARTH_RADIUS_M: f64 = 6_371_000.0;
    let dlat = (lat2 - lat1).to_radians();
    let dlon = (lon2 - lon1).to_radians();
    let a = (dlat / 2.0).sin().powi(2)
        + lat1.to_radians().cos() * lat2.to_radians().cos() * (dlon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_M * a.sqrt().atan2((1.0 - a).sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remoteid_logic::model::{DroneUpdate, Entity};

    fn entity_at(lat: f64, lon: f64, alt: f64, speed: f64, now: DateTime<Utc>) -> Entity {
        let mut e = Entity::new_drone("drone-D1".into(), now);
        e.apply_drone(
            &DroneUpdate {
                lat: Some(lat),
                lon: Some(lon),
                alt: Some(alt),
                speed: Some(speed),
                ..DroneUpdate::default()
            },
            now,
        );
        e
    }

    fn t0() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2025-06-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn scenario_thresholds() -> GateThresholds {
        GateThresholds {
            min_interval: StdDuration::from_secs(30),
            movement_m: 25.0,
            altitude_m: 10.0,
            speed_mps: 2.0,
        }
    }

    #[test]
    fn stationary_drone_suppressed_until_interval_elapses() {
        let mut gate = UpdateGate::new(scenario_thresholds(), GateThresholds::default());
        let now = t0();
        let e = entity_at(42.2165, -70.9025, 85.0, 0.5, now);

        // First-ever state always forwards.
        assert!(gate.should_forward(&e, SinkId::Tactical, false, now));

        // 2 s later, same position: below every threshold.
        let now2 = now + Duration::seconds(2);
        let e2 = entity_at(42.2165, -70.9025, 85.0, 0.5, now2);
        assert!(!gate.should_forward(&e2, SinkId::Tactical, false, now2));

        // 35 s after that: elapsed time alone forwards.
        let now3 = now2 + Duration::seconds(35);
        let e3 = entity_at(42.2165, -70.9025, 85.0, 0.5, now3);
        assert!(gate.should_forward(&e3, SinkId::Tactical, false, now3));
    }

    #[test]
    fn movement_beyond_threshold_forwards_early() {
        let mut gate = UpdateGate::new(scenario_thresholds(), GateThresholds::default());
        let now = t0();
        let e = entity_at(42.2165, -70.9025, 85.0, 0.5, now);
        gate.should_forward(&e, SinkId::Tactical, false, now);

        // ~33 m north, 1 s later.
        let now2 = now + Duration::seconds(1);
        let e2 = entity_at(42.2168, -70.9025, 85.0, 0.5, now2);
        assert!(gate.should_forward(&e2, SinkId::Tactical, false, now2));
    }

    #[test]
    fn altitude_and_speed_deltas_forward_early() {
        let mut gate = UpdateGate::new(scenario_thresholds(), GateThresholds::default());
        let now = t0();
        let e = entity_at(42.2165, -70.9025, 85.0, 0.5, now);
        gate.should_forward(&e, SinkId::Tactical, false, now);

        let now2 = now + Duration::seconds(1);
        let climbed = entity_at(42.2165, -70.9025, 96.0, 0.5, now2);
        assert!(gate.should_forward(&climbed, SinkId::Tactical, false, now2));

        let now3 = now2 + Duration::seconds(1);
        let faster = entity_at(42.2165, -70.9025, 96.0, 3.0, now3);
        assert!(gate.should_forward(&faster, SinkId::Tactical, false, now3));
    }

    #[test]
    fn transition_bypasses_thresholds() {
        let mut gate = UpdateGate::new(scenario_thresholds(), GateThresholds::default());
        let now = t0();
        let e = entity_at(42.2165, -70.9025, 85.0, 0.5, now);
        gate.should_forward(&e, SinkId::Tactical, false, now);

        let now2 = now + Duration::seconds(1);
        assert!(!gate.should_forward(&e, SinkId::Tactical, false, now2));
        assert!(gate.should_forward(&e, SinkId::Tactical, true, now2));
    }

    #[test]
    fn sinks_keep_independent_baselines() {
        let tight = GateThresholds {
            min_interval: StdDuration::from_secs(30),
            ..GateThresholds::default()
        };
        let loose = GateThresholds {
            min_interval: StdDuration::from_secs(1),
            ..GateThresholds::default()
        };
        let mut gate = UpdateGate::new(tight, loose);
        let now = t0();
        let e = entity_at(42.2165, -70.9025, 85.0, 0.5, now);
        gate.should_forward(&e, SinkId::Tactical, false, now);
        gate.should_forward(&e, SinkId::Bus, false, now);

        let now2 = now + Duration::seconds(2);
        let e2 = entity_at(42.2165, -70.9025, 85.0, 0.5, now2);
        assert!(!gate.should_forward(&e2, SinkId::Tactical, false, now2));
        assert!(gate.should_forward(&e2, SinkId::Bus, false, now2));
    }

    #[test]
    fn forget_drops_every_sink_baseline() {
        let mut gate = UpdateGate::new(GateThresholds::default(), GateThresholds::default());
        let now = t0();
        let e = entity_at(1.0, 2.0, 0.0, 0.0, now);
        gate.should_forward(&e, SinkId::Tactical, false, now);
        gate.should_forward(&e, SinkId::Bus, false, now);
        assert_eq!(gate.baseline_count(), 2);
        gate.forget("drone-D1");
        assert_eq!(gate.baseline_count(), 0);
    }

    #[test]
    fn haversine_known_distance() {
        // One degree of longitude at the equator is ~111.19 km.
        let d = haversine_m(0.0, 0.0, 0.0, 1.0);
        assert!((d - 111_195.0).abs() < 100.0, "distance was {d}");
    }
}
