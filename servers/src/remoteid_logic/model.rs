use chrono::{DateTime, Utc};

/// Mapping of Remote-ID UA type codes to display names.
pub const UA_TYPE_NAMES: [(u8, &str); 16] = [
    (0, "No UA type defined"),
    (1, "Aeroplane/Airplane (Fixed wing)"),
    (2, "Helicopter or Multirotor"),
    (3, "Gyroplane"),
    (4, "VTOL (Vertical Take-Off and Landing)"),
    (5, "Ornithopter"),
    (6, "Glider"),
    (7, "Kite"),
    (8, "Free Balloon"),
    (9, "Captive Balloon"),
    (10, "Airship (Blimp)"),
    (11, "Free Fall/Parachute"),
    (12, "Rocket"),
    (13, "Tethered powered aircraft"),
    (14, "Ground Obstacle"),
    (15, "Other type"),
];

pub fn ua_type_name(code: u8) -> Option<&'static str> {
    UA_TYPE_NAMES.iter().find(|(c, _)| *c == code).map(|(_, n)| *n)
}

pub fn ua_code_from_name(name: &str) -> Option<u8> {
    UA_TYPE_NAMES
        .iter()
        .find(|(_, n)| n.eq_ignore_ascii_case(name))
        .map(|(c, _)| *c)
}

pub type EntityId = String;

/// Strip the `drone-` prefix, used when deriving pilot/home identifiers.
pub fn id_tail(id: &str) -> &str {
    id.strip_prefix("drone-").unwrap_or(id)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    Drone,
    SystemHost,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Active,
    Offline,
}

/// Normalized drone detection. Every telemetry field is optional: the two
/// producer schemas both omit blocks freely and absence is never an error.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DroneUpdate {
    /// Serial-derived identifier, already `drone-` prefixed.
    pub id: Option<String>,
    pub caa_id: Option<String>,
    pub mac: Option<String>,
    pub rssi: Option<i32>,
    pub freq_hz: Option<f64>,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    pub alt: Option<f64>,
    pub height_agl: Option<f64>,
    pub speed: Option<f64>,
    pub vspeed: Option<f64>,
    pub course: Option<f64>,
    pub ua_type: Option<u8>,
    pub ua_type_name: Option<String>,
    pub id_type: Option<String>,
    pub operator_id: Option<String>,
    pub operator_id_type: Option<String>,
    pub op_status: Option<String>,
    pub height_type: Option<String>,
    pub ew_dir: Option<String>,
    pub horizontal_accuracy: Option<String>,
    pub vertical_accuracy: Option<String>,
    pub baro_accuracy: Option<String>,
    pub speed_accuracy: Option<String>,
    pub description: Option<String>,
    pub pilot_lat: Option<f64>,
    pub pilot_lon: Option<f64>,
    pub home_lat: Option<f64>,
    pub home_lon: Option<f64>,
    pub source_timestamp: Option<String>,
}

impl DroneUpdate {
    pub fn has_location(&self) -> bool {
        self.lat.is_some() || self.lon.is_some()
    }
}

/// Normalized host-status report from the status stream.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatusUpdate {
    pub serial: String,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    pub alt: Option<f64>,
    pub speed: Option<f64>,
    pub track: Option<f64>,
    pub cpu_usage: Option<f64>,
    pub memory_total_mb: Option<f64>,
    pub memory_available_mb: Option<f64>,
    pub disk_total_mb: Option<f64>,
    pub disk_used_mb: Option<f64>,
    pub temperature_c: Option<f64>,
    pub uptime_s: Option<f64>,
    pub pluto_temp_c: Option<f64>,
    pub zynq_temp_c: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Update {
    Drone(DroneUpdate),
    Status(StatusUpdate),
}

/// Last-known drone fields held by the registry.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DroneState {
    pub caa_id: Option<String>,
    pub mac: Option<String>,
    pub rssi: Option<i32>,
    pub freq_hz: Option<f64>,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    pub alt: Option<f64>,
    pub height_agl: Option<f64>,
    pub speed: Option<f64>,
    pub vspeed: Option<f64>,
    pub course: Option<f64>,
    pub ua_type: Option<u8>,
    pub ua_type_name: Option<String>,
    pub id_type: Option<String>,
    pub operator_id: Option<String>,
    pub operator_id_type: Option<String>,
    pub op_status: Option<String>,
    pub height_type: Option<String>,
    pub ew_dir: Option<String>,
    pub horizontal_accuracy: Option<String>,
    pub vertical_accuracy: Option<String>,
    pub baro_accuracy: Option<String>,
    pub speed_accuracy: Option<String>,
    pub description: Option<String>,
    pub pilot_lat: Option<f64>,
    pub pilot_lon: Option<f64>,
    pub home_lat: Option<f64>,
    pub home_lon: Option<f64>,
    pub source_timestamp: Option<String>,
}

/// Last-known host fields held by the registry.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HostState {
    pub serial: String,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    pub alt: Option<f64>,
    pub speed: Option<f64>,
    pub track: Option<f64>,
    pub cpu_usage: Option<f64>,
    pub memory_total_mb: Option<f64>,
    pub memory_available_mb: Option<f64>,
    pub disk_total_mb: Option<f64>,
    pub disk_used_mb: Option<f64>,
    pub temperature_c: Option<f64>,
    pub uptime_s: Option<f64>,
    pub pluto_temp_c: Option<f64>,
    pub zynq_temp_c: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EntityDetail {
    Drone(DroneState),
    Host(HostState),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Entity {
    pub id: EntityId,
    pub kind: EntityKind,
    pub state: Lifecycle,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub detail: EntityDetail,
}

impl Entity {
    pub fn new_drone(id: EntityId, now: DateTime<Utc>) -> Self {
        Self {
            id,
            kind: EntityKind::Drone,
            state: Lifecycle::Active,
            first_seen: now,
            last_seen: now,
            detail: EntityDetail::Drone(DroneState::default()),
        }
    }

    pub fn new_host(id: EntityId, serial: String, now: DateTime<Utc>) -> Self {
        Self {
            id,
            kind: EntityKind::SystemHost,
            state: Lifecycle::Active,
            first_seen: now,
            last_seen: now,
            detail: EntityDetail::Host(HostState {
                serial,
                ..HostState::default()
            }),
        }
    }

    pub fn drone(&self) -> Option<&DroneState> {
        match &self.detail {
            EntityDetail::Drone(d) => Some(d),
            _ => None,
        }
    }

    pub fn host(&self) -> Option<&HostState> {
        match &self.detail {
            EntityDetail::Host(h) => Some(h),
            _ => None,
        }
    }

    /// Apply a drone detection. Position and kinematics are replaced wholesale
    /// when the detection carries a location block; descriptive metadata keeps
    /// its previous value when the detection omits it; pilot/home coordinates
    /// mirror the detection exactly (absent means unset, never stale).
    pub fn apply_drone(&mut self, u: &DroneUpdate, now: DateTime<Utc>) {
        let d = match &mut self.detail {
            EntityDetail::Drone(d) => d,
            _ => return,
        };

        let prev = (d.lat, d.lon);
        if u.has_location() {
            d.lat = u.lat;
            d.lon = u.lon;
            d.alt = u.alt;
            d.height_agl = u.height_agl;
            d.speed = u.speed;
            d.vspeed = u.vspeed;
            d.course = u.course.or_else(|| match (prev, u.lat, u.lon) {
                ((Some(plat), Some(plon)), Some(lat), Some(lon)) => {
                    Some(initial_bearing(plat, plon, lat, lon))
                }
                _ => None,
            });
        }

        d.pilot_lat = u.pilot_lat;
        d.pilot_lon = u.pilot_lon;
        d.home_lat = u.home_lat;
        d.home_lon = u.home_lon;

        if u.mac.is_some() {
            d.mac = u.mac.clone();
        }
        if u.rssi.is_some() {
            d.rssi = u.rssi;
        }
        if u.freq_hz.is_some() {
            d.freq_hz = u.freq_hz;
        }
        if u.caa_id.is_some() {
            d.caa_id = u.caa_id.clone();
        }
        if u.ua_type.is_some() {
            d.ua_type = u.ua_type;
        }
        if u.ua_type_name.is_some() {
            d.ua_type_name = u.ua_type_name.clone();
        }
        if u.id_type.is_some() {
            d.id_type = u.id_type.clone();
        }
        if u.operator_id.is_some() {
            d.operator_id = u.operator_id.clone();
        }
        if u.operator_id_type.is_some() {
            d.operator_id_type = u.operator_id_type.clone();
        }
        if u.op_status.is_some() {
            d.op_status = u.op_status.clone();
        }
        if u.height_type.is_some() {
            d.height_type = u.height_type.clone();
        }
        if u.ew_dir.is_some() {
            d.ew_dir = u.ew_dir.clone();
        }
        if u.horizontal_accuracy.is_some() {
            d.horizontal_accuracy = u.horizontal_accuracy.clone();
        }
        if u.vertical_accuracy.is_some() {
            d.vertical_accuracy = u.vertical_accuracy.clone();
        }
        if u.baro_accuracy.is_some() {
            d.baro_accuracy = u.baro_accuracy.clone();
        }
        if u.speed_accuracy.is_some() {
            d.speed_accuracy = u.speed_accuracy.clone();
        }
        if u.description.is_some() {
            d.description = u.description.clone();
        }
        if u.source_timestamp.is_some() {
            d.source_timestamp = u.source_timestamp.clone();
        }

        if now > self.last_seen {
            self.last_seen = now;
        }
    }

    /// Apply a host-status report. Every field reflects the latest report.
    pub fn apply_status(&mut self, u: &StatusUpdate, now: DateTime<Utc>) {
        let h = match &mut self.detail {
            EntityDetail::Host(h) => h,
            _ => return,
        };
        h.lat = u.lat;
        h.lon = u.lon;
        h.alt = u.alt;
        h.speed = u.speed;
        h.track = u.track;
        h.cpu_usage = u.cpu_usage;
        h.memory_total_mb = u.memory_total_mb;
        h.memory_available_mb = u.memory_available_mb;
        h.disk_total_mb = u.disk_total_mb;
        h.disk_used_mb = u.disk_used_mb;
        h.temperature_c = u.temperature_c;
        h.uptime_s = u.uptime_s;
        h.pluto_temp_c = u.pluto_temp_c;
        h.zynq_temp_c = u.zynq_temp_c;

        if now > self.last_seen {
            self.last_seen = now;
        }
    }

    /// Current position of the entity, when one is known.
    pub fn position(&self) -> Option<(f64, f64)> {
        match &self.detail {
            EntityDetail::Drone(d) => Some((d.lat?, d.lon?)),
            EntityDetail::Host(h) => Some((h.lat?, h.lon?)),
        }
    }

    pub fn altitude(&self) -> Option<f64> {
        match &self.detail {
            EntityDetail::Drone(d) => d.alt,
            EntityDetail::Host(h) => h.alt,
        }
    }

    pub fn speed(&self) -> Option<f64> {
        match &self.detail {
            EntityDetail::Drone(d) => d.speed,
            EntityDetail::Host(h) => h.speed,
        }
    }
}

/// What changed when an update or sweep touched an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeltaKind {
    /// Fields changed, no lifecycle transition.
    Updated,
    /// Entity returned from `Offline` to `Active`.
    CameOnline,
    /// Entity exceeded the inactivity window.
    WentOffline,
    /// Entity removed under capacity pressure.
    Evicted,
}

impl DeltaKind {
    /// Lifecycle transitions bypass every gate threshold.
    pub fn is_transition(self) -> bool {
        matches!(self, DeltaKind::CameOnline | DeltaKind::WentOffline)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EntityDelta {
    pub id: EntityId,
    pub kind: EntityKind,
    pub change: DeltaKind,
}

/// Initial great-circle bearing from (lat1, lon1) to (lat2, lon2), degrees
/// clockwise from true north.
pub fn initial_bearing(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let (lat1, lon1, lat2, lon2) = (
        lat1.to_radians(),
        lon1.to_radians(),
        lat2.to_radians(),
        lon2.to_radians(),
    );
    let dlon = lon2 - lon1;
    let x = dlon.sin() * lat2.cos();
    let y = lat1.cos() * lat2.sin() - lat1.sin() * lat2.cos() * dlon.cos();
    (x.atan2(y).to_degrees() + 360.0) % 360.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ua_type_lookup_by_code_and_name() {
        assert_eq!(ua_type_name(2), Some("Helicopter or Multirotor"));
        assert_eq!(ua_code_from_name("helicopter or multirotor"), Some(2));
        assert_eq!(ua_type_name(99), None);
    }

    #[test]
    fn bearing_due_east_at_equator() {
        let b = initial_bearing(0.0, 0.0, 0.0, 1.0);
        assert!((b - 90.0).abs() < 1e-6, "bearing was {b}");
    }

    #[test]
    fn pilot_coords_cleared_when_absent() {
        let now = Utc::now();
        let mut e = Entity::new_drone("drone-X".into(), now);
        let mut u = DroneUpdate {
            lat: Some(1.0),
            lon: Some(2.0),
            pilot_lat: Some(1.1),
            pilot_lon: Some(2.1),
            ..DroneUpdate::default()
        };
        e.apply_drone(&u, now);
        assert_eq!(e.drone().unwrap().pilot_lat, Some(1.1));

        u.pilot_lat = None;
        u.pilot_lon = None;
        e.apply_drone(&u, now);
        assert_eq!(e.drone().unwrap().pilot_lat, None);
    }

    #[test]
    fn metadata_survives_partial_update() {
        let now = Utc::now();
        let mut e = Entity::new_drone("drone-X".into(), now);
        e.apply_drone(
            &DroneUpdate {
                description: Some("quad".into()),
                operator_id: Some("OP-1".into()),
                ..DroneUpdate::default()
            },
            now,
        );
        e.apply_drone(
            &DroneUpdate {
                lat: Some(5.0),
                lon: Some(6.0),
                ..DroneUpdate::default()
            },
            now,
        );
        let d = e.drone().unwrap();
        assert_eq!(d.description.as_deref(), Some("quad"));
        assert_eq!(d.operator_id.as_deref(), Some("OP-1"));
        assert_eq!(d.lat, Some(5.0));
    }

    #[test]
    fn course_derived_from_previous_position() {
        let now = Utc::now();
        let mut e = Entity::new_drone("drone-X".into(), now);
        e.apply_drone(
            &DroneUpdate {
                lat: Some(0.0),
                lon: Some(0.0),
                ..DroneUpdate::default()
            },
            now,
        );
        e.apply_drone(
            &DroneUpdate {
                lat: Some(0.0),
                lon: Some(1.0),
                ..DroneUpdate::default()
            },
            now,
        );
        let course = e.drone().unwrap().course.unwrap();
        assert!((course - 90.0).abs() < 1e-6);
    }

    #[test]
    fn last_seen_never_decreases() {
        let now = Utc::now();
        let mut e = Entity::new_drone("drone-X".into(), now);
        let earlier = now - chrono::Duration::seconds(10);
        e.apply_drone(&DroneUpdate::default(), earlier);
        assert_eq!(e.last_seen, now);
    }
}
