//! # Entity-tracking export sink
//!
//! Flattened entity snapshots pushed to an external registry over HTTP,
//! authenticated by bearer token. The destination has its own ingestion-rate
//! ceiling, so this sink is rate-governed independently of the update gate:
//! one minimum interval per entity class (drone, host, pilot, home), with
//! lifecycle transitions always let through. An authentication failure
//! disables the sink until reconfigured instead of hammering a doomed
//! endpoint; every other sink keeps running.

use std::time::{Duration, Instant};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde_json::{json, Value};
use tokio::sync::mpsc;

use crate::remoteid_logic::model::{id_tail, Entity, EntityDetail, Lifecycle};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExportClass {
    Drone,
    Host,
    Pilot,
    Home,
}

/// One snapshot bound for the external registry.
#[derive(Debug, Clone)]
pub struct ExportRecord {
    pub entity_id: String,
    pub class: ExportClass,
    /// Lifecycle transitions bypass the rate governor.
    pub transition: bool,
    pub payload: Value,
}

/// Per-class minimum-interval governor.
pub struct RateGovernor {
    drone_period: Duration,
    host_period: Duration,
    point_period: Duration,
    last: [Option<Instant>; 4],
}

impl RateGovernor {
    pub fn new(drone_hz: f64, host_hz: f64) -> Self {
        let period = |hz: f64| Duration::from_secs_f64(1.0 / hz.max(1e-6));
        Self {
            drone_period: period(drone_hz),
            host_period: period(host_hz),
            point_period: Duration::from_secs(1),
            last: [None; 4],
        }
    }

    fn slot(class: ExportClass) -> usize {
        match class {
            ExportClass::Drone => 0,
            ExportClass::Host => 1,
            ExportClass::Pilot => 2,
            ExportClass::Home => 3,
        }
    }

    fn period(&self, class: ExportClass) -> Duration {
        match class {
            ExportClass::Drone => self.drone_period,
            ExportClass::Host => self.host_period,
            ExportClass::Pilot | ExportClass::Home => self.point_period,
        }
    }

    pub fn allow(&mut self, class: ExportClass, now: Instant) -> bool {
        let slot = Self::slot(class);
        let ok = match self.last[slot] {
            Some(prev) => now.duration_since(prev) >= self.period(class),
            None => true,
        };
        if ok {
            self.last[slot] = Some(now);
        }
        ok
    }
}

/// Drone snapshot. `is_live` reflects the lifecycle flag so offline entities
/// fade at the destination while keeping their last position.
pub fn encode_drone(entity: &Entity, source_name: &str, now: DateTime<Utc>) -> Value {
    let d = match &entity.detail {
        EntityDetail::Drone(d) => d,
        _ => return Value::Null,
    };
    json!({
        "entity_id": entity.id,
        "is_live": entity.state == Lifecycle::Active,
        "name": entity.id,
        "kind": "track",
        "platform_type": "Small UAS",
        "location": {
            "latitude_degrees": d.lat,
            "longitude_degrees": d.lon,
            "altitude_hae_meters": d.alt,
            "speed_mps": d.speed,
            "heading_degrees": d.course,
        },
        "metadata": {
            "mac": d.mac,
            "rssi_dbm": d.rssi,
            "frequency_hz": d.freq_hz,
            "ua_type": d.ua_type_name,
            "id_type": d.id_type,
            "caa_id": d.caa_id,
            "operator_id": d.operator_id,
            "description": d.description,
        },
        "provenance": {
            "integration_name": source_name,
            "data_type": "remoteid-detection",
            "source_update_time": now.to_rfc3339(),
        },
        "expiry_time": (now + ChronoDuration::minutes(5)).to_rfc3339(),
    })
}

/// Pilot or home point snapshot, tied back to its drone by id.
pub fn encode_point(
    entity: &Entity,
    class: ExportClass,
    lat: f64,
    lon: f64,
    source_name: &str,
    now: DateTime<Utc>,
) -> Value {
    let (suffix, platform, expiry) = match class {
        ExportClass::Pilot => ("pilot", "Operator", ChronoDuration::minutes(30)),
        ExportClass::Home => ("home", "Home Point", ChronoDuration::hours(4)),
        _ => return Value::Null,
    };
    json!({
        "entity_id": format!("{}-{}", suffix, id_tail(&entity.id)),
        "is_live": entity.state == Lifecycle::Active,
        "name": format!("{} of {}", platform, entity.id),
        "kind": "track",
        "platform_type": platform,
        "location": {
            "latitude_degrees": lat,
            "longitude_degrees": lon,
        },
        "related_entity_id": entity.id,
        "provenance": {
            "integration_name": source_name,
            "data_type": "remoteid-detection",
            "source_update_time": now.to_rfc3339(),
        },
        "expiry_time": (now + expiry).to_rfc3339(),
    })
}

/// Host snapshot with component health readings.
pub fn encode_host(entity: &Entity, source_name: &str, now: DateTime<Utc>) -> Value {
    let h = match &entity.detail {
        EntityDetail::Host(h) => h,
        _ => return Value::Null,
    };
    json!({
        "entity_id": entity.id,
        "is_live": entity.state == Lifecycle::Active,
        "name": format!("Sensor Host {}", h.serial),
        "kind": "asset",
        "platform_type": "Antenna",
        "location": {
            "latitude_degrees": h.lat,
            "longitude_degrees": h.lon,
            "altitude_hae_meters": h.alt,
            "speed_mps": h.speed,
            "heading_degrees": h.track,
        },
        "health": {
            "cpu_usage_pct": h.cpu_usage,
            "memory_available_mb": h.memory_available_mb,
            "memory_total_mb": h.memory_total_mb,
            "disk_used_mb": h.disk_used_mb,
            "disk_total_mb": h.disk_total_mb,
            "temperature_c": h.temperature_c,
            "uptime_s": h.uptime_s,
            "pluto_temp_c": h.pluto_temp_c,
            "zynq_temp_c": h.zynq_temp_c,
        },
        "provenance": {
            "integration_name": source_name,
            "data_type": "remoteid-host",
            "source_update_time": now.to_rfc3339(),
        },
        "expiry_time": (now + ChronoDuration::minutes(10)).to_rfc3339(),
    })
}

#[derive(Debug, Clone)]
pub struct ExportConfig {
    pub base_url: String,
    pub token: String,
    pub drone_hz: f64,
    pub host_hz: f64,
}

/// Sink task. Consumes records until the channel closes. HTTP 401/403
/// disables the sink (reported once); transient errors are logged and the
/// next record simply tries again.
pub async fn run(cfg: ExportConfig, mut rx: mpsc::Receiver<ExportRecord>) {
    let client = match reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()
    {
        Ok(c) => c,
        Err(e) => {
            log::error!("export sink disabled, HTTP client build failed: {e}");
            while rx.recv().await.is_some() {}
            return;
        }
    };
    let base = cfg.base_url.trim_end_matches('/').to_string();
    let mut governor = RateGovernor::new(cfg.drone_hz, cfg.host_hz);
    let mut disabled = false;
    let mut send_failures: u64 = 0;

    while let Some(record) = rx.recv().await {
        if disabled {
            continue;
        }
        if !record.transition && !governor.allow(record.class, Instant::now()) {
            continue;
        }
        let url = format!("{}/api/v1/entities/{}", base, record.entity_id);
        match client
            .put(&url)
            .bearer_auth(&cfg.token)
            .json(&record.payload)
            .send()
            .await
        {
            Ok(resp) => {
                let status = resp.status();
                if status == reqwest::StatusCode::UNAUTHORIZED
                    || status == reqwest::StatusCode::FORBIDDEN
                {
                    disabled = true;
                    log::error!(
                        "export registry rejected credentials ({status}); \
                         export sink disabled until reconfigured"
                    );
                } else if !status.is_success() {
                    log::warn!("export of {} returned {status}", record.entity_id);
                }
            }
            Err(e) => {
                send_failures += 1;
                log::warn!(
                    "export of {} failed ({send_failures} total): {e}",
                    record.entity_id
                );
            }
        }
    }
    log::info!("export sink stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remoteid_logic::model::{DroneUpdate, Update};
    use crate::remoteid_logic::registry::Registry;

    fn t0() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2025-06-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn sample_drone() -> Entity {
        let mut r = Registry::new(10, Duration::from_secs(60));
        r.apply(
            &Update::Drone(DroneUpdate {
                id: Some("drone-SN1".into()),
                lat: Some(42.2165),
                lon: Some(-70.9025),
                alt: Some(85.0),
                speed: Some(0.5),
                ..DroneUpdate::default()
            }),
            t0(),
        );
        r.get("drone-SN1").unwrap().clone()
    }

    #[test]
    fn drone_snapshot_is_flat_and_live() {
        let v = encode_drone(&sample_drone(), "skywatch", t0());
        assert_eq!(v["entity_id"], "drone-SN1");
        assert_eq!(v["is_live"], true);
        assert_eq!(v["location"]["latitude_degrees"].as_f64(), Some(42.2165));
        assert_eq!(v["provenance"]["integration_name"], "skywatch");
        assert!(v["expiry_time"].as_str().unwrap().starts_with("2025-06-01T12:05:00"));
    }

    #[test]
    fn point_snapshot_references_drone() {
        let v = encode_point(
            &sample_drone(),
            ExportClass::Pilot,
            42.21,
            -70.90,
            "skywatch",
            t0(),
        );
        assert_eq!(v["entity_id"], "pilot-SN1");
        assert_eq!(v["related_entity_id"], "drone-SN1");
    }

    #[test]
    fn governor_enforces_per_class_intervals() {
        let mut g = RateGovernor::new(1.0, 0.2);
        let start = Instant::now();
        assert!(g.allow(ExportClass::Drone, start));
        assert!(!g.allow(ExportClass::Drone, start + Duration::from_millis(500)));
        assert!(g.allow(ExportClass::Drone, start + Duration::from_millis(1100)));

        // Host cadence is independent of drone cadence.
        assert!(g.allow(ExportClass::Host, start + Duration::from_millis(500)));
        assert!(!g.allow(ExportClass::Host, start + Duration::from_secs(3)));
        assert!(g.allow(ExportClass::Host, start + Duration::from_secs(6)));
    }
}
