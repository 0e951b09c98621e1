//! # Publish-bus sink (MQTT)
//!
//! Two halves. The encoder half is pure: entity state in, `BusMessage`
//! batches out — device-discovery documents (emitted once per entity, or
//! again when descriptive metadata changes), retained state/attribute
//! payloads, and availability flips. The sink half owns the broker
//! connection: credentials, optional TLS, a last-will that marks the whole
//! service offline, and a resync request back to the orchestrator on every
//! (re)connect so a fresh consumer receives discovery for all currently
//! known entities before incremental telemetry resumes.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS, Transport};
use serde_json::{json, Map, Value};
use tokio::sync::mpsc;

use crate::remoteid_logic::model::{id_tail, Entity, EntityDetail, Lifecycle};

/// One message bound for the broker.
#[derive(Debug, Clone, PartialEq)]
pub struct BusMessage {
    pub topic: String,
    pub payload: String,
    pub retain: bool,
}

/// Topic and discovery naming, derived from configuration.
#[derive(Debug, Clone)]
pub struct BusNaming {
    /// Base topic namespace, e.g. `skywatch`.
    pub base: String,
    /// Auto-discovery namespace, e.g. `homeassistant`.
    pub discovery_prefix: String,
    /// Base for discovery unique ids, e.g. `skywatch_drone`.
    pub device_base: String,
    pub retain_state: bool,
}

impl BusNaming {
    pub fn service_availability_topic(&self) -> String {
        format!("{}/service/availability", self.base)
    }

    fn aggregate_topic(&self) -> String {
        format!("{}/drones", self.base)
    }

    fn drone_topic(&self, id: &str) -> String {
        format!("{}/drone/{}", self.base, id)
    }

    fn host_topic(&self, serial: &str) -> String {
        format!("{}/system/{}", self.base, serial)
    }

    /// (drone, pilot, home) availability topics.
    fn availability_topics(&self, id: &str) -> (String, String, String) {
        let base = self.drone_topic(id);
        (
            format!("{base}/availability"),
            format!("{base}/pilot_availability"),
            format!("{base}/home_availability"),
        )
    }
}

/// Convenience for tests and callers that only need the service flag.
pub fn service_availability(naming: &BusNaming, online: bool) -> BusMessage {
    BusMessage {
        topic: naming.service_availability_topic(),
        payload: if online { "online" } else { "offline" }.to_string(),
        retain: true,
    }
}

/// Frequency in MHz for dashboards; accepts raw Hz or already-MHz values.
pub fn freq_mhz(freq: Option<f64>) -> Option<f64> {
    let f = freq?;
    let mhz = if f > 1e5 { f / 1e6 } else { f };
    Some((mhz * 1000.0).round() / 1000.0)
}

/// Fingerprint of the descriptive metadata that drives discovery documents.
/// When it changes, discovery is published again.
pub fn metadata_fingerprint(entity: &Entity) -> u64 {
    let mut h = DefaultHasher::new();
    entity.id.hash(&mut h);
    match &entity.detail {
        EntityDetail::Drone(d) => {
            d.description.hash(&mut h);
            d.ua_type_name.hash(&mut h);
            d.id_type.hash(&mut h);
            d.operator_id.hash(&mut h);
            d.operator_id_type.hash(&mut h);
            d.mac.hash(&mut h);
        }
        EntityDetail::Host(hst) => {
            hst.serial.hash(&mut h);
        }
    }
    h.finish()
}

/// Full drone state document published to the aggregate and per-drone
/// topics. Key names double as HA value-template inputs, with
/// `latitude`/`longitude` mirrors for device_tracker placement.
pub fn drone_state_payload(entity: &Entity) -> Value {
    let d = match &entity.detail {
        EntityDetail::Drone(d) => d,
        _ => return Value::Null,
    };
    json!({
        "id": entity.id,
        "description": d.description,
        "lat": d.lat,
        "lon": d.lon,
        "latitude": d.lat,
        "longitude": d.lon,
        "alt": d.alt,
        "height": d.height_agl,
        "speed": d.speed,
        "vspeed": d.vspeed,
        "direction": d.course,
        "rssi": d.rssi,
        "mac": d.mac,
        "pilot_lat": d.pilot_lat,
        "pilot_lon": d.pilot_lon,
        "home_lat": d.home_lat,
        "home_lon": d.home_lon,
        "id_type": d.id_type,
        "caa_id": d.caa_id,
        "ua_type": d.ua_type,
        "ua_type_name": d.ua_type_name,
        "operator_id": d.operator_id,
        "operator_id_type": d.operator_id_type,
        "op_status": d.op_status,
        "height_type": d.height_type,
        "ew_dir": d.ew_dir,
        "timestamp": d.source_timestamp,
        "freq": d.freq_hz,
        "freq_mhz": freq_mhz(d.freq_hz),
        "online": entity.state == Lifecycle::Active,
        "first_seen": entity.first_seen.to_rfc3339(),
        "last_seen": entity.last_seen.to_rfc3339(),
    })
}

/// State batch for a drone update: aggregate + per-drone JSON, availability
/// online, and pilot/home attribute documents when those points are known.
pub fn drone_state_messages(naming: &BusNaming, entity: &Entity) -> Vec<BusMessage> {
    let Some(d) = entity.drone() else {
        return Vec::new();
    };
    let payload = drone_state_payload(entity).to_string();
    let (avail, pilot_avail, home_avail) = naming.availability_topics(&entity.id);
    let state_topic = naming.drone_topic(&entity.id);

    let mut out = vec![
        BusMessage {
            topic: naming.aggregate_topic(),
            payload: payload.clone(),
            retain: naming.retain_state,
        },
        BusMessage {
            topic: state_topic.clone(),
            payload,
            retain: naming.retain_state,
        },
        BusMessage {
            topic: avail,
            payload: "online".into(),
            retain: true,
        },
    ];

    if let (Some(lat), Some(lon)) = (d.pilot_lat, d.pilot_lon) {
        out.push(BusMessage {
            topic: format!("{state_topic}/pilot_attrs"),
            payload: json!({"latitude": lat, "longitude": lon}).to_string(),
            retain: true,
        });
        out.push(BusMessage {
            topic: pilot_avail,
            payload: "online".into(),
            retain: true,
        });
    }
    if let (Some(lat), Some(lon)) = (d.home_lat, d.home_lon) {
        out.push(BusMessage {
            topic: format!("{state_topic}/home_attrs"),
            payload: json!({"latitude": lat, "longitude": lon}).to_string(),
            retain: true,
        });
        out.push(BusMessage {
            topic: home_avail,
            payload: "online".into(),
            retain: true,
        });
    }
    out
}

/// Availability flips for a drone that went offline (or was evicted). The
/// retained state topics keep the last position queryable by consumers that
/// retain history.
pub fn drone_offline_messages(naming: &BusNaming, id: &str) -> Vec<BusMessage> {
    let (avail, pilot_avail, home_avail) = naming.availability_topics(id);
    [avail, pilot_avail, home_avail]
        .into_iter()
        .map(|topic| BusMessage {
            topic,
            payload: "offline".into(),
            retain: true,
        })
        .collect()
}

fn config_message(topic: String, mut payload: Map<String, Value>, extras: &[(&str, Value)]) -> BusMessage {
    for (k, v) in extras {
        if !v.is_null() {
            payload.insert((*k).to_string(), v.clone());
        }
    }
    BusMessage {
        topic,
        payload: Value::Object(payload).to_string(),
        retain: true,
    }
}

fn sensor_config(
    naming: &BusNaming,
    device: &Value,
    state_topic: &str,
    uid: String,
    name: &str,
    template: &str,
    unit: Option<&str>,
    device_class: Option<&str>,
    icon: Option<&str>,
) -> BusMessage {
    let topic = format!("{}/sensor/{}/config", naming.discovery_prefix, uid);
    let mut payload = Map::new();
    payload.insert("name".into(), json!(name));
    payload.insert("state_topic".into(), json!(state_topic));
    payload.insert("unique_id".into(), json!(uid));
    payload.insert("device".into(), device.clone());
    payload.insert("value_template".into(), json!(template));
    config_message(
        topic,
        payload,
        &[
            ("unit_of_measurement", unit.map(|u| json!(u)).unwrap_or(Value::Null)),
            ("device_class", device_class.map(|c| json!(c)).unwrap_or(Value::Null)),
            ("icon", icon.map(|i| json!(i)).unwrap_or(Value::Null)),
        ],
    )
}

fn tracker_config(
    naming: &BusNaming,
    device: &Value,
    uid: String,
    name: &str,
    state_topic: &str,
    attr_topic: &str,
    availability_topic: &str,
    icon: &str,
) -> Vec<BusMessage> {
    let cfg_topic = format!("{}/device_tracker/{}/config", naming.discovery_prefix, uid);
    let payload = json!({
        "name": name,
        "unique_id": uid,
        "device": device,
        "source_type": "gps",
        "state_topic": state_topic,
        "json_attributes_topic": attr_topic,
        "icon": icon,
        "availability_topic": availability_topic,
        "payload_available": "online",
        "payload_not_available": "offline",
    });
    vec![
        BusMessage {
            topic: cfg_topic,
            payload: payload.to_string(),
            retain: true,
        },
        // Default textual state; position lives in the attribute document.
        BusMessage {
            topic: state_topic.to_string(),
            payload: "not_home".into(),
            retain: true,
        },
        BusMessage {
            topic: availability_topic.to_string(),
            payload: "online".into(),
            retain: true,
        },
    ]
}

/// Discovery batch for a drone: a device_tracker trio (drone/pilot/home map
/// dots sharing one device) plus the telemetry sensor set.
pub fn drone_discovery_messages(naming: &BusNaming, entity: &Entity) -> Vec<BusMessage> {
    if entity.drone().is_none() {
        return Vec::new();
    }
    let id = entity.id.as_str();
    let tail = id_tail(id);
    let base_unique = format!("{}_{}", naming.device_base, id);
    let device = json!({
        "identifiers": [format!("{}:{}", naming.device_base, id)],
        "name": id,
    });
    let state_topic = naming.drone_topic(id);
    let (avail, pilot_avail, home_avail) = naming.availability_topics(id);

    let mut out = Vec::new();
    out.extend(tracker_config(
        naming,
        &device,
        base_unique.clone(),
        id,
        &format!("{state_topic}/state"),
        &state_topic,
        &avail,
        "mdi:drone",
    ));
    out.extend(tracker_config(
        naming,
        &device,
        format!("{base_unique}_pilot"),
        &format!("pilot-{tail}"),
        &format!("{state_topic}/pilot_state"),
        &format!("{state_topic}/pilot_attrs"),
        &pilot_avail,
        "mdi:account",
    ));
    out.extend(tracker_config(
        naming,
        &device,
        format!("{base_unique}_home"),
        &format!("home-{tail}"),
        &format!("{state_topic}/home_state"),
        &format!("{state_topic}/home_attrs"),
        &home_avail,
        "mdi:home",
    ));

    let mut sensor = |suffix: &str,
                      name: &str,
                      template: &str,
                      unit: Option<&str>,
                      device_class: Option<&str>,
                      icon: Option<&str>| {
        out.push(sensor_config(
            naming,
            &device,
            &state_topic,
            format!("{base_unique}_{suffix}"),
            name,
            template,
            unit,
            device_class,
            icon,
        ));
    };

    sensor("lat", "Latitude", "{{ value_json.lat | float | default(0) }}", Some("°"), None, Some("mdi:map-marker"));
    sensor("lon", "Longitude", "{{ value_json.lon | float | default(0) }}", Some("°"), None, Some("mdi:map-marker"));
    sensor("alt", "Altitude", "{{ value_json.alt | float | default(0) }}", Some("m"), Some("distance"), Some("mdi:map-marker-distance"));
    sensor("speed", "Speed", "{{ value_json.speed | float | default(0) }}", Some("m/s"), Some("speed"), Some("mdi:speedometer"));
    sensor("vspeed", "Vertical Speed", "{{ value_json.vspeed | float | default(0) }}", Some("m/s"), None, Some("mdi:axis-z-arrow"));
    sensor("height", "AGL", "{{ value_json.height | float | default(0) }}", Some("m"), None, Some("mdi:altimeter"));
    sensor("dir", "Course", "{{ value_json.direction | float | default(0) }}", Some("°"), None, Some("mdi:compass"));
    sensor("pilot_lat", "Pilot Latitude", "{{ value_json.pilot_lat | float | default(0) }}", Some("°"), None, Some("mdi:account"));
    sensor("pilot_lon", "Pilot Longitude", "{{ value_json.pilot_lon | float | default(0) }}", Some("°"), None, Some("mdi:account"));
    sensor("home_lat", "Home Latitude", "{{ value_json.home_lat | float | default(0) }}", Some("°"), None, Some("mdi:home"));
    sensor("home_lon", "Home Longitude", "{{ value_json.home_lon | float | default(0) }}", Some("°"), None, Some("mdi:home"));
    sensor("rssi", "Signal (RSSI)", "{{ value_json.rssi | float | default(0) }}", Some("dBm"), Some("signal_strength"), Some("mdi:wifi"));
    sensor("freq", "Radio Freq (MHz)", "{{ value_json.freq_mhz | float(0) }}", Some("MHz"), None, Some("mdi:radio-tower"));
    sensor("ua_type", "UA Type", "{{ value_json.ua_type_name | default('') }}", None, None, Some("mdi:airplane"));
    sensor("op_id", "Operator ID", "{{ value_json.operator_id | default('') }}", None, None, Some("mdi:id-card"));
    sensor("main", "Drone", "{{ value_json.description | default('Drone') }}", None, None, Some("mdi:drone"));

    out
}

/// Host state document.
pub fn host_state_payload(entity: &Entity) -> Value {
    let h = match &entity.detail {
        EntityDetail::Host(h) => h,
        _ => return Value::Null,
    };
    json!({
        "id": entity.id,
        "latitude": h.lat,
        "longitude": h.lon,
        "hae": h.alt,
        "speed_mps": h.speed,
        "track_deg": h.track,
        "cpu_usage": h.cpu_usage,
        "memory_total_mb": h.memory_total_mb,
        "memory_available_mb": h.memory_available_mb,
        "disk_total_mb": h.disk_total_mb,
        "disk_used_mb": h.disk_used_mb,
        "temperature_c": h.temperature_c,
        "uptime_s": h.uptime_s,
        "pluto_temp_c": h.pluto_temp_c,
        "zynq_temp_c": h.zynq_temp_c,
        "online": entity.state == Lifecycle::Active,
        "updated": entity.last_seen.to_rfc3339(),
    })
}

pub fn host_state_messages(naming: &BusNaming, entity: &Entity) -> Vec<BusMessage> {
    let Some(h) = entity.host() else {
        return Vec::new();
    };
    let base = naming.host_topic(&h.serial);
    vec![
        BusMessage {
            topic: format!("{base}/attrs"),
            payload: host_state_payload(entity).to_string(),
            retain: naming.retain_state,
        },
        BusMessage {
            topic: format!("{base}/state"),
            payload: "online".into(),
            retain: false,
        },
        BusMessage {
            topic: format!("{base}/availability"),
            payload: "online".into(),
            retain: true,
        },
    ]
}

pub fn host_offline_messages(naming: &BusNaming, serial: &str) -> Vec<BusMessage> {
    vec![BusMessage {
        topic: format!("{}/availability", naming.host_topic(serial)),
        payload: "offline".into(),
        retain: true,
    }]
}

/// Discovery batch for a system host: a device_tracker for the kit position
/// plus the health sensor set.
pub fn host_discovery_messages(naming: &BusNaming, entity: &Entity) -> Vec<BusMessage> {
    let Some(h) = entity.host() else {
        return Vec::new();
    };
    let base = naming.host_topic(&h.serial);
    let unique_base = format!("{}_host_{}", naming.device_base, h.serial);
    let device = json!({
        "identifiers": [format!("{}:host:{}", naming.device_base, h.serial)],
        "name": format!("Sensor Host {}", h.serial),
    });
    let attrs_topic = format!("{base}/attrs");
    let avail = format!("{base}/availability");

    let mut out = tracker_config(
        naming,
        &device,
        unique_base.clone(),
        &format!("Sensor Host {}", h.serial),
        &format!("{base}/state"),
        &attrs_topic,
        &avail,
        "mdi:router-wireless",
    );

    let mut sensor = |suffix: &str,
                      name: &str,
                      template: &str,
                      unit: Option<&str>,
                      device_class: Option<&str>,
                      icon: Option<&str>| {
        out.push(sensor_config(
            naming,
            &device,
            &attrs_topic,
            format!("{unique_base}_{suffix}"),
            name,
            template,
            unit,
            device_class,
            icon,
        ));
    };

    sensor("cpu", "CPU Usage", "{{ value_json.cpu_usage | float(0) }}", Some("%"), None, Some("mdi:cpu-64-bit"));
    sensor("mem_free", "Memory Available", "{{ value_json.memory_available_mb | float(0) }}", Some("MB"), None, Some("mdi:memory"));
    sensor("mem_total", "Memory Total", "{{ value_json.memory_total_mb | float(0) }}", Some("MB"), None, Some("mdi:memory"));
    sensor("disk_used", "Disk Used", "{{ value_json.disk_used_mb | float(0) }}", Some("MB"), None, Some("mdi:harddisk"));
    sensor("disk_total", "Disk Total", "{{ value_json.disk_total_mb | float(0) }}", Some("MB"), None, Some("mdi:harddisk"));
    sensor("temp", "System Temp", "{{ value_json.temperature_c | float(0) }}", Some("°C"), Some("temperature"), Some("mdi:thermometer"));
    sensor("uptime", "Uptime", "{{ (value_json.uptime_s | float(0)) / 3600 }}", Some("h"), None, Some("mdi:timer-outline"));
    sensor("speed", "Ground Speed", "{{ value_json.speed_mps | float(0) }}", Some("m/s"), Some("speed"), Some("mdi:speedometer"));
    sensor("track", "Course", "{{ value_json.track_deg | float(0) }}", Some("°"), None, Some("mdi:compass"));
    sensor("pluto_temp", "Pluto Temp", "{{ value_json.pluto_temp_c | float(0) }}", Some("°C"), Some("temperature"), Some("mdi:thermometer"));
    sensor("zynq_temp", "Zynq Temp", "{{ value_json.zynq_temp_c | float(0) }}", Some("°C"), Some("temperature"), Some("mdi:thermometer"));

    out
}

/// Broker connection settings for the sink task.
#[derive(Debug, Clone)]
pub struct BusConfig {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub tls: bool,
    pub ca_file: Option<PathBuf>,
    pub certfile: Option<PathBuf>,
    pub keyfile: Option<PathBuf>,
    pub tls_insecure: bool,
    pub naming: BusNaming,
}

fn mqtt_options(cfg: &BusConfig) -> Result<MqttOptions> {
    let mut options = MqttOptions::new("remoteid-gateway", cfg.host.clone(), cfg.port);
    options.set_keep_alive(Duration::from_secs(60));
    if let Some(user) = &cfg.username {
        options.set_credentials(user.clone(), cfg.password.clone().unwrap_or_default());
    }
    options.set_last_will(rumqttc::LastWill::new(
        cfg.naming.service_availability_topic(),
        "offline",
        QoS::AtLeastOnce,
        true,
    ));

    if cfg.tls {
        let mut builder = native_tls::TlsConnector::builder();
        if let Some(ca) = &cfg.ca_file {
            let pem = std::fs::read(ca).with_context(|| format!("reading {}", ca.display()))?;
            builder.add_root_certificate(native_tls::Certificate::from_pem(&pem)?);
        }
        if let (Some(cert), Some(key)) = (&cfg.certfile, &cfg.keyfile) {
            let identity = native_tls::Identity::from_pkcs8(
                &std::fs::read(cert).with_context(|| format!("reading {}", cert.display()))?,
                &std::fs::read(key).with_context(|| format!("reading {}", key.display()))?,
            )?;
            builder.identity(identity);
        }
        if cfg.tls_insecure {
            log::warn!("bus TLS verification disabled; not a production posture");
            builder.danger_accept_invalid_certs(true);
            builder.danger_accept_invalid_hostnames(true);
        }
        options.set_transport(Transport::Tls(rumqttc::TlsConfiguration::NativeConnector(
            builder.build()?,
        )));
    }
    Ok(options)
}

/// Sink task. Consumes encoded messages until the channel closes, asking the
/// orchestrator for a discovery resync on every (re)connect. Publish and
/// connection failures are counted and retried locally, never surfaced.
pub async fn run(cfg: BusConfig, mut rx: mpsc::Receiver<BusMessage>, resync_tx: mpsc::Sender<()>) {
    let options = match mqtt_options(&cfg) {
        Ok(o) => o,
        Err(e) => {
            log::error!("bus sink disabled, broker options invalid: {e:#}");
            while rx.recv().await.is_some() {}
            return;
        }
    };

    let (client, mut eventloop) = AsyncClient::new(options, 128);
    let mut publish_failures: u64 = 0;

    loop {
        tokio::select! {
            event = eventloop.poll() => match event {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    log::info!("bus connected to {}:{}", cfg.host, cfg.port);
                    let birth = service_availability(&cfg.naming, true);
                    let _ = client.try_publish(birth.topic, QoS::AtLeastOnce, birth.retain, birth.payload);
                    // Fresh consumers have no prior state; ask for discovery
                    // of everything currently known.
                    let _ = resync_tx.try_send(());
                }
                Ok(_) => {}
                Err(e) => {
                    log::warn!("bus connection error: {e}; retrying in 5s");
                    tokio::time::sleep(Duration::from_secs(5)).await;
                }
            },
            msg = rx.recv() => match msg {
                Some(m) => {
                    if let Err(e) = client.try_publish(m.topic.as_str(), QoS::AtMostOnce, m.retain, m.payload) {
                        publish_failures += 1;
                        log::warn!(
                            "bus publish to {} failed ({publish_failures} total): {e}",
                            m.topic
                        );
                    }
                }
                // Channel closed: the orchestrator finished draining.
                None => break,
            }
        }
    }

    let farewell = service_availability(&cfg.naming, false);
    let _ = client.try_publish(farewell.topic, QoS::AtLeastOnce, farewell.retain, farewell.payload);
    // Let the event loop flush outstanding publishes briefly before closing.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while tokio::time::Instant::now() < deadline {
        match tokio::time::timeout(Duration::from_millis(200), eventloop.poll()).await {
            Ok(Ok(_)) => {}
            _ => break,
        }
    }
    let _ = client.try_disconnect();
    log::info!("bus sink stopped");
}
