//! Tactical event encoder.
//!
//! Pure transforms from entity state to Cursor-on-Target event documents.
//! Every physical object keeps a stable event identity: the drone event uid
//! is the entity id, and the pilot/home auxiliary events derive theirs from
//! the drone id tail and carry a `<link>` back-reference to the drone event.
//! Offline entities are encoded with a stale time already in the past so
//! consumers fade them without losing the last-known coordinates.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::Writer;

use crate::remoteid_logic::affiliation::Affiliation;
use crate::remoteid_logic::model::{id_tail, Entity};

/// UA type code to CoT event type. Anything unmapped is treated as a
/// rotorcraft, the most common Remote-ID emitter.
pub fn ua_cot_type(ua_type: Option<u8>) -> &'static str {
    match ua_type {
        Some(1) | Some(5) | Some(6) => "a-f-A-f",
        Some(2) | Some(3) | Some(4) => "a-u-A-M-H-R",
        Some(7..=15) => "b-m-p-s-m",
        _ => "a-u-A-M-H-R",
    }
}

fn cot_timestamp(t: DateTime<Utc>) -> String {
    t.format("%Y-%m-%dT%H:%M:%S%.6fZ").to_string()
}

fn fmt(v: Option<f64>) -> String {
    v.unwrap_or(0.0).to_string()
}

struct EventDoc {
    writer: Writer<Vec<u8>>,
}

impl EventDoc {
    fn open(uid: &str, cot_type: &str, now: DateTime<Utc>, stale: DateTime<Utc>) -> Result<Self> {
        let mut writer = Writer::new(Vec::new());
        writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;

        let mut event = BytesStart::new("event");
        event.push_attribute(("version", "2.0"));
        event.push_attribute(("uid", uid));
        event.push_attribute(("type", cot_type));
        event.push_attribute(("time", cot_timestamp(now).as_str()));
        event.push_attribute(("start", cot_timestamp(now).as_str()));
        event.push_attribute(("stale", cot_timestamp(stale).as_str()));
        event.push_attribute(("how", "m-g"));
        writer.write_event(Event::Start(event))?;
        Ok(Self { writer })
    }

    /// Writes the point element and opens the detail block.
    fn point(&mut self, lat: Option<f64>, lon: Option<f64>, hae: Option<f64>) -> Result<()> {
        let mut point = BytesStart::new("point");
        point.push_attribute(("lat", fmt(lat).as_str()));
        point.push_attribute(("lon", fmt(lon).as_str()));
        point.push_attribute(("hae", fmt(hae).as_str()));
        point.push_attribute(("ce", "35.0"));
        point.push_attribute(("le", "999999"));
        self.writer.write_event(Event::Empty(point))?;
        self.writer
            .write_event(Event::Start(BytesStart::new("detail")))?;
        Ok(())
    }

    fn empty(&mut self, name: &str, attrs: &[(&str, &str)]) -> Result<()> {
        let mut el = BytesStart::new(name);
        for attr in attrs {
            el.push_attribute(*attr);
        }
        self.writer.write_event(Event::Empty(el))?;
        Ok(())
    }

    fn remarks(&mut self, text: &str) -> Result<()> {
        self.writer
            .write_event(Event::Start(BytesStart::new("remarks")))?;
        self.writer.write_event(Event::Text(BytesText::new(text)))?;
        self.writer
            .write_event(Event::End(BytesEnd::new("remarks")))?;
        Ok(())
    }

    fn close(mut self) -> Result<Vec<u8>> {
        self.writer
            .write_event(Event::End(BytesEnd::new("detail")))?;
        self.writer.write_event(Event::End(BytesEnd::new("event")))?;
        Ok(self.writer.into_inner())
    }
}

/// Main drone event.
pub fn drone_event(
    entity: &Entity,
    affiliation: Affiliation,
    now: DateTime<Utc>,
    stale: DateTime<Utc>,
) -> Result<Vec<u8>> {
    let d = entity.drone().context("not a drone entity")?;

    let mut doc = EventDoc::open(&entity.id, ua_cot_type(d.ua_type), now, stale)?;
    doc.point(d.lat, d.lon, d.alt)?;
    doc.empty("contact", &[("callsign", &entity.id)])?;
    doc.empty(
        "precisionlocation",
        &[("geopointsrc", "gps"), ("altsrc", "gps")],
    )?;
    doc.empty(
        "track",
        &[
            ("course", fmt(d.course).as_str()),
            ("speed", fmt(d.speed).as_str()),
        ],
    )?;
    let remarks = format!(
        "MAC: {}, RSSI: {}dBm; ID Type: {}; UA Type: {}; \
         Operator ID: [{}: {}]; Speed: {} m/s; Vert Speed: {} m/s; \
         Altitude: {} m; AGL: {} m; Course: {}",
        d.mac.as_deref().unwrap_or(""),
        d.rssi.map(|r| r.to_string()).unwrap_or_default(),
        d.id_type.as_deref().unwrap_or(""),
        d.ua_type_name.as_deref().unwrap_or("Unknown"),
        d.operator_id_type.as_deref().unwrap_or(""),
        d.operator_id.as_deref().unwrap_or(""),
        fmt(d.speed),
        fmt(d.vspeed),
        fmt(d.alt),
        fmt(d.height_agl),
        fmt(d.course),
    );
    doc.remarks(&remarks)?;
    doc.empty("color", &[("argb", affiliation.argb())])?;
    doc.close()
}

/// Auxiliary pilot event, linked back to the drone event.
pub fn pilot_event(
    entity: &Entity,
    lat: f64,
    lon: f64,
    affiliation: Affiliation,
    now: DateTime<Utc>,
    stale: DateTime<Utc>,
) -> Result<Vec<u8>> {
    let d = entity.drone().context("not a drone entity")?;
    let uid = format!("pilot-{}", id_tail(&entity.id));

    let mut doc = EventDoc::open(&uid, "b-m-p-s-m", now, stale)?;
    doc.point(Some(lat), Some(lon), d.alt)?;
    doc.empty("contact", &[("callsign", &uid)])?;
    doc.empty(
        "precisionlocation",
        &[("geopointsrc", "gps"), ("altsrc", "gps")],
    )?;
    doc.empty(
        "usericon",
        &[(
            "iconsetpath",
            "com.atakmap.android.maps.public/Civilian/Person.png",
        )],
    )?;
    doc.empty("link", &[("uid", entity.id.as_str()), ("relation", "p-p")])?;
    doc.remarks(&format!("Pilot location for drone {}", entity.id))?;
    doc.empty("color", &[("argb", affiliation.argb())])?;
    doc.close()
}

/// Auxiliary home-point event, linked back to the drone event.
pub fn home_event(
    entity: &Entity,
    lat: f64,
    lon: f64,
    affiliation: Affiliation,
    now: DateTime<Utc>,
    stale: DateTime<Utc>,
) -> Result<Vec<u8>> {
    let d = entity.drone().context("not a drone entity")?;
    let uid = format!("home-{}", id_tail(&entity.id));

    let mut doc = EventDoc::open(&uid, "b-m-p-s-m", now, stale)?;
    doc.point(Some(lat), Some(lon), d.alt)?;
    doc.empty("contact", &[("callsign", &uid)])?;
    doc.empty(
        "precisionlocation",
        &[("geopointsrc", "gps"), ("altsrc", "gps")],
    )?;
    doc.empty(
        "usericon",
        &[(
            "iconsetpath",
            "com.atakmap.android.maps.public/Civilian/House.png",
        )],
    )?;
    doc.empty("link", &[("uid", entity.id.as_str()), ("relation", "p-p")])?;
    doc.remarks(&format!("Home location for drone {}", entity.id))?;
    doc.empty("color", &[("argb", affiliation.argb())])?;
    doc.close()
}

/// System-host status event.
pub fn host_event(entity: &Entity, now: DateTime<Utc>, stale: DateTime<Utc>) -> Result<Vec<u8>> {
    let h = entity.host().context("not a host entity")?;

    let mut doc = EventDoc::open(&entity.id, "a-f-G-E-S", now, stale)?;
    doc.point(h.lat, h.lon, h.alt)?;
    doc.empty("contact", &[("callsign", &entity.id)])?;
    doc.empty(
        "precisionlocation",
        &[("geopointsrc", "gps"), ("altsrc", "gps")],
    )?;
    doc.empty(
        "track",
        &[
            ("course", fmt(h.track).as_str()),
            ("speed", fmt(h.speed).as_str()),
        ],
    )?;
    let remarks = format!(
        "CPU: {:.1}%; Memory: {:.1}/{:.1} MB; Disk: {:.1}/{:.1} MB; \
         Temp: {:.1}C; Uptime: {:.0}s; Pluto: {}; Zynq: {}",
        h.cpu_usage.unwrap_or(0.0),
        h.memory_available_mb.unwrap_or(0.0),
        h.memory_total_mb.unwrap_or(0.0),
        h.disk_used_mb.unwrap_or(0.0),
        h.disk_total_mb.unwrap_or(0.0),
        h.temperature_c.unwrap_or(0.0),
        h.uptime_s.unwrap_or(0.0),
        h.pluto_temp_c.map(|t| format!("{t:.1}C")).unwrap_or_else(|| "N/A".into()),
        h.zynq_temp_c.map(|t| format!("{t:.1}C")).unwrap_or_else(|| "N/A".into()),
    );
    doc.remarks(&remarks)?;
    doc.close()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remoteid_logic::model::{DroneUpdate, StatusUpdate, Update};
    use crate::remoteid_logic::registry::Registry;
    use chrono::Duration;

    fn t0() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2025-06-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn sample_drone() -> Entity {
        let mut r = Registry::new(10, std::time::Duration::from_secs(60));
        r.apply(
            &Update::Drone(DroneUpdate {
                id: Some("drone-SN1".into()),
                lat: Some(42.2165),
                lon: Some(-70.9025),
                alt: Some(85.0),
                speed: Some(0.5),
                ua_type: Some(2),
                ua_type_name: Some("Helicopter or Multirotor".into()),
                mac: Some("AA:BB".into()),
                rssi: Some(-60),
                pilot_lat: Some(42.21),
                pilot_lon: Some(-70.90),
                ..DroneUpdate::default()
            }),
            t0(),
        );
        r.get("drone-SN1").unwrap().clone()
    }

    #[test]
    fn drone_event_structure() {
        let e = sample_drone();
        let xml = drone_event(&e, Affiliation::Unknown, t0(), t0() + Duration::seconds(60))
            .unwrap();
        let xml = String::from_utf8(xml).unwrap();
        assert!(xml.contains(r#"uid="drone-SN1""#));
        assert!(xml.contains(r#"type="a-u-A-M-H-R""#));
        assert!(xml.contains(r#"lat="42.2165""#));
        assert!(xml.contains(r#"argb="-256""#));
        assert!(xml.contains("MAC: AA:BB"));
        assert!(xml.contains(r#"stale="2025-06-01T12:01:00"#));
    }

    #[test]
    fn offline_event_is_already_stale() {
        let e = sample_drone();
        // Offline encoding passes stale == now.
        let xml = drone_event(&e, Affiliation::Unknown, t0(), t0()).unwrap();
        let xml = String::from_utf8(xml).unwrap();
        let stale = format!(r#"stale="{}""#, cot_timestamp(t0()));
        assert!(xml.contains(&stale));
        // Coordinates are retained.
        assert!(xml.contains(r#"lat="42.2165""#));
    }

    #[test]
    fn pilot_event_links_back_to_drone() {
        let e = sample_drone();
        let xml = pilot_event(
            &e,
            42.21,
            -70.90,
            Affiliation::Authorized,
            t0(),
            t0() + Duration::seconds(60),
        )
        .unwrap();
        let xml = String::from_utf8(xml).unwrap();
        assert!(xml.contains(r#"uid="pilot-SN1""#));
        assert!(xml.contains(r#"<link uid="drone-SN1" relation="p-p"/>"#));
        assert!(xml.contains("Person.png"));
        assert!(xml.contains(r#"argb="-16776961""#));
    }

    #[test]
    fn fixed_wing_maps_to_fixed_wing_type() {
        assert_eq!(ua_cot_type(Some(1)), "a-f-A-f");
        assert_eq!(ua_cot_type(Some(12)), "b-m-p-s-m");
        assert_eq!(ua_cot_type(None), "a-u-A-M-H-R");
    }

    #[test]
    fn host_event_carries_health_remarks() {
        let mut r = Registry::new(10, std::time::Duration::from_secs(60));
        r.apply(
            &Update::Status(StatusUpdate {
                serial: "WD-1".into(),
                lat: Some(42.0),
                lon: Some(-70.0),
                cpu_usage: Some(35.5),
                memory_total_mb: Some(8192.0),
                memory_available_mb: Some(4096.0),
                ..StatusUpdate::default()
            }),
            t0(),
        );
        let e = r.get("host-WD-1").unwrap().clone();
        let xml = host_event(&e, t0(), t0() + Duration::seconds(60)).unwrap();
        let xml = String::from_utf8(xml).unwrap();
        assert!(xml.contains(r#"uid="host-WD-1""#));
        assert!(xml.contains(r#"type="a-f-G-E-S""#));
        assert!(xml.contains("CPU: 35.5%"));
    }

    #[test]
    fn remarks_text_is_escaped() {
        let mut e = sample_drone();
        if let crate::remoteid_logic::model::EntityDetail::Drone(d) = &mut e.detail {
            d.operator_id = Some("<op>".into());
        }
        let xml = drone_event(&e, Affiliation::Unknown, t0(), t0()).unwrap();
        let xml = String::from_utf8(xml).unwrap();
        assert!(xml.contains("&lt;op&gt;"));
        assert!(!xml.contains("<op>"));
    }
}
