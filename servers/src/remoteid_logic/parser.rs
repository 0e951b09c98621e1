//! Inbound message normalization.
//!
//! The detection stream delivers either a structured scheme (a JSON array of
//! single-concern blocks: identity, location/vector, operator ID, ...) or a
//! legacy flat scheme (one JSON object with the same blocks as top-level
//! keys). Both shapes normalize into one canonical [`DroneUpdate`]; anything
//! else fails closed. Missing fields become `None`, never an error.

use serde_json::Value;
use thiserror::Error;

use crate::remoteid_logic::model::{ua_code_from_name, ua_type_name, DroneUpdate, StatusUpdate};

#[derive(Debug, Error, PartialEq)]
pub enum ParseError {
    #[error("unsupported message shape; expected object or array of blocks")]
    UnknownShape,
    #[error("message carried no recognizable fields")]
    NoContent,
    #[error("status message missing serial_number")]
    MissingSerial,
}

/// Numeric field that may arrive as a JSON number or as a string with a
/// trailing unit (e.g. `"0.5 m/s"`). Unparsable values are absent.
fn num(v: Option<&Value>) -> Option<f64> {
    match v? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.split_whitespace().next()?.parse().ok(),
        _ => None,
    }
}

fn int(v: Option<&Value>) -> Option<i64> {
    match v? {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.split_whitespace().next()?.parse().ok(),
        _ => None,
    }
}

fn text(v: Option<&Value>) -> Option<String> {
    let s = v?.as_str()?.trim();
    if s.is_empty() {
        None
    } else {
        Some(s.to_string())
    }
}

/// UA type arrives either as a numeric code or as the display name.
fn ua_type(v: Option<&Value>) -> (Option<u8>, Option<String>) {
    let code = match v {
        Some(Value::Number(n)) => n.as_u64().and_then(|c| u8::try_from(c).ok()),
        Some(Value::String(s)) => s
            .parse::<u8>()
            .ok()
            .or_else(|| ua_code_from_name(s)),
        _ => None,
    };
    match code.and_then(|c| ua_type_name(c).map(|n| (c, n))) {
        Some((c, n)) => (Some(c), Some(n.to_string())),
        None => (None, None),
    }
}

/// The wire encodes "no fix" as an explicit (0, 0) pair for the
/// relationship-derived points; those must come back absent.
fn latlon_pair(lat: Option<f64>, lon: Option<f64>) -> (Option<f64>, Option<f64>) {
    match (lat, lon) {
        (Some(a), Some(b)) if a == 0.0 && b == 0.0 => (None, None),
        other => other,
    }
}

fn apply_block(u: &mut DroneUpdate, key: &str, block: &Value) {
    match key {
        "Basic ID" => {
            let (code, name) = ua_type(block.get("ua_type"));
            if code.is_some() {
                u.ua_type = code;
                u.ua_type_name = name;
            }
            if let Some(mac) = text(block.get("MAC")) {
                u.mac = Some(mac);
            }
            if let Some(rssi) = int(block.get("RSSI")) {
                u.rssi = Some(rssi as i32);
            }
            let id_type = text(block.get("id_type"));
            match id_type.as_deref() {
                Some("Serial Number (ANSI/CTA-2063-A)") => u.id = text(block.get("id")),
                Some("CAA Assigned Registration ID") => u.caa_id = text(block.get("id")),
                _ => {}
            }
            if id_type.is_some() {
                u.id_type = id_type;
            }
        }
        "Operator ID Message" => {
            u.operator_id_type = text(block.get("operator_id_type")).or(u.operator_id_type.take());
            u.operator_id = text(block.get("operator_id")).or(u.operator_id.take());
        }
        "Location/Vector Message" => {
            u.lat = num(block.get("latitude"));
            u.lon = num(block.get("longitude"));
            u.speed = num(block.get("speed"));
            u.vspeed = num(block.get("vert_speed"));
            u.alt = num(block.get("geodetic_altitude"));
            u.height_agl = num(block.get("height_agl"));
            u.course = int(block.get("direction")).map(|d| d as f64);
            u.op_status = text(block.get("op_status"));
            u.height_type = text(block.get("height_type"));
            u.ew_dir = text(block.get("ew_dir_segment"));
            u.vertical_accuracy = text(block.get("vertical_accuracy"));
            u.horizontal_accuracy = text(block.get("horizontal_accuracy"));
            u.baro_accuracy = text(block.get("baro_accuracy"));
            u.speed_accuracy = text(block.get("speed_accuracy"));
            u.source_timestamp = text(block.get("timestamp"));
        }
        "Self-ID Message" => {
            u.description = text(block.get("text"));
        }
        "System Message" => {
            // Structured scheme uses latitude/longitude for the operator,
            // legacy uses operator_lat/operator_lon. Home only on structured.
            let plat = num(block.get("latitude")).or_else(|| num(block.get("operator_lat")));
            let plon = num(block.get("longitude")).or_else(|| num(block.get("operator_lon")));
            (u.pilot_lat, u.pilot_lon) = latlon_pair(plat, plon);
            (u.home_lat, u.home_lon) =
                latlon_pair(num(block.get("home_lat")), num(block.get("home_lon")));
        }
        "Frequency Message" => {
            u.freq_hz = num(block.get("frequency"));
        }
        _ => {}
    }
}

/// Normalize one raw detection-stream message.
pub fn parse_detection(msg: &Value) -> Result<DroneUpdate, ParseError> {
    let mut u = DroneUpdate::default();

    match msg {
        // Structured scheme: array of single-key block objects.
        Value::Array(items) => {
            for item in items {
                let Some(obj) = item.as_object() else {
                    continue;
                };
                if let Some(mac) = text(obj.get("MAC")) {
                    u.mac = Some(mac);
                }
                if let Some(rssi) = int(obj.get("RSSI")) {
                    u.rssi = Some(rssi as i32);
                }
                for (key, block) in obj {
                    apply_block(&mut u, key, block);
                }
            }
        }
        // Legacy flat scheme: blocks are top-level keys of one object.
        Value::Object(obj) => {
            if let Some(adv) = obj.get("AUX_ADV_IND") {
                if let Some(rssi) = int(adv.get("rssi")) {
                    u.rssi = Some(rssi as i32);
                }
            }
            if let Some(adv_a) = obj.get("aext").and_then(|a| a.get("AdvA")) {
                u.mac = text(Some(adv_a)).map(|s| {
                    s.split_whitespace().next().unwrap_or_default().to_string()
                });
            }
            for (key, block) in obj {
                apply_block(&mut u, key, block);
            }
        }
        _ => return Err(ParseError::UnknownShape),
    }

    if u == DroneUpdate::default() {
        return Err(ParseError::NoContent);
    }
    if let Some(id) = u.id.take() {
        u.id = Some(if id.starts_with("drone-") {
            id
        } else {
            format!("drone-{id}")
        });
    }
    Ok(u)
}

/// Normalize one raw status-stream message. The GPS block may be nested
/// (`gps_data`) or flat at the top level.
pub fn parse_status(msg: &Value) -> Result<StatusUpdate, ParseError> {
    let obj = msg.as_object().ok_or(ParseError::UnknownShape)?;
    let serial = text(obj.get("serial_number")).ok_or(ParseError::MissingSerial)?;

    let mut u = StatusUpdate {
        serial,
        ..StatusUpdate::default()
    };

    let gps = obj.get("gps_data").and_then(|g| g.as_object());
    let gps_field = |name: &str| match gps {
        Some(g) => num(g.get(name)),
        None => num(obj.get(name)),
    };
    u.lat = gps_field("latitude");
    u.lon = gps_field("longitude");
    u.alt = gps_field("altitude");
    u.speed = gps_field("speed");
    u.track = gps_field("track");

    if let Some(stats) = obj.get("system_stats") {
        const MB: f64 = 1024.0 * 1024.0;
        u.cpu_usage = num(stats.get("cpu_usage"));
        u.temperature_c = num(stats.get("temperature"));
        u.uptime_s = num(stats.get("uptime"));
        if let Some(mem) = stats.get("memory") {
            u.memory_total_mb = num(mem.get("total")).map(|b| b / MB);
            u.memory_available_mb = num(mem.get("available")).map(|b| b / MB);
        }
        if let Some(disk) = stats.get("disk") {
            u.disk_total_mb = num(disk.get("total")).map(|b| b / MB);
            u.disk_used_mb = num(disk.get("used")).map(|b| b / MB);
        }
    }
    if let Some(temps) = obj.get("ant_sdr_temps") {
        u.pluto_temp_c = num(temps.get("pluto_temp"));
        u.zynq_temp_c = num(temps.get("zynq_temp"));
    }

    Ok(u)
}
