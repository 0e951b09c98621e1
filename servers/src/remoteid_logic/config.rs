use clap::Parser;
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};

use crate::remoteid_logic::gate::GateThresholds;
use crate::remoteid_logic::mqtt::{BusConfig, BusNaming};
use crate::remoteid_logic::sinks::{DirectConfig, DirectTransport, MulticastConfig};

#[derive(Parser, Deserialize, Serialize, Debug, Clone, Default)]
#[clap(about = "Remote-ID Telemetry Gateway", version)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[clap(long, env = "RID_CONFIG_PATH", help = "Path to the JSON configuration file.")]
    pub config_path: Option<PathBuf>,

    #[clap(long, env = "RID_LOG_DIR", help = "Directory for log files.")]
    pub log_dir: Option<PathBuf>,

    #[clap(long, env = "RID_LOG_LEVEL", help = "Logging level (trace, debug, info, warn, error).")]
    pub log_level: Option<String>,

    // --- Inbound streams ---
    #[clap(long, env = "RID_ZMQ_HOST", help = "Host publishing the detection and status streams.")]
    pub zmq_host: Option<String>,

    #[clap(long, env = "RID_ZMQ_PORT", help = "Detection stream port.")]
    pub zmq_port: Option<u16>,

    #[clap(long, env = "RID_ZMQ_STATUS_PORT", help = "Status stream port; status ingestion is off when unset.")]
    pub zmq_status_port: Option<u16>,

    #[clap(long, env = "RID_INGEST_BUFFER", help = "Per-stream receive buffer; oldest entries are conflated away under pressure.")]
    pub ingest_buffer: Option<usize>,

    // --- Tactical multicast sink ---
    #[clap(long, env = "RID_ENABLE_MULTICAST", help = "Enable the multicast tactical sink (true/false).")]
    pub enable_multicast: Option<bool>,

    #[clap(long, env = "RID_MULTICAST_ADDR", help = "Multicast group address.")]
    pub multicast_addr: Option<String>,

    #[clap(long, env = "RID_MULTICAST_PORT", help = "Multicast port.")]
    pub multicast_port: Option<u16>,

    #[clap(long, env = "RID_MULTICAST_INTERFACE", help = "Interface IP address to send multicast from.")]
    pub multicast_interface: Option<String>,

    #[clap(long, env = "RID_MULTICAST_TTL", help = "TTL for multicast packets.")]
    pub multicast_ttl: Option<u32>,

    // --- Tactical direct sink ---
    #[clap(long, env = "RID_TAK_HOST", help = "Tactical server hostname or IP (optional).")]
    pub tak_host: Option<String>,

    #[clap(long, env = "RID_TAK_PORT", help = "Tactical server port (optional).")]
    pub tak_port: Option<u16>,

    #[clap(long, env = "RID_TAK_PROTOCOL", help = "Tactical server transport: tcp or udp.")]
    pub tak_protocol: Option<String>,

    #[clap(long, env = "RID_TAK_P12", help = "Path to the PKCS#12 client certificate bundle (TCP only).")]
    pub tak_p12: Option<PathBuf>,

    #[clap(long, env = "RID_TAK_P12_PASS", help = "Passphrase for the client certificate bundle.")]
    pub tak_p12_pass: Option<String>,

    #[clap(long, env = "RID_TAK_SKIP_VERIFY", help = "(UNSAFE) Skip TLS server identity verification (true/false).")]
    pub tak_skip_verify: Option<bool>,

    // --- Publish-bus sink ---
    #[clap(long, env = "RID_MQTT_ENABLED", help = "Enable the publish-bus sink (true/false).")]
    pub mqtt_enabled: Option<bool>,

    #[clap(long, env = "RID_MQTT_HOST", help = "Broker host.")]
    pub mqtt_host: Option<String>,

    #[clap(long, env = "RID_MQTT_PORT", help = "Broker port.")]
    pub mqtt_port: Option<u16>,

    #[clap(long, env = "RID_MQTT_USERNAME", help = "Broker username.")]
    pub mqtt_username: Option<String>,

    #[clap(long, env = "RID_MQTT_PASSWORD", help = "Broker password.")]
    pub mqtt_password: Option<String>,

    #[clap(long, env = "RID_MQTT_TLS", help = "Enable broker TLS (true/false).")]
    pub mqtt_tls: Option<bool>,

    #[clap(long, env = "RID_MQTT_CA_FILE", help = "CA bundle for broker TLS.")]
    pub mqtt_ca_file: Option<PathBuf>,

    #[clap(long, env = "RID_MQTT_CERTFILE", help = "Client certificate (PEM) for broker TLS.")]
    pub mqtt_certfile: Option<PathBuf>,

    #[clap(long, env = "RID_MQTT_KEYFILE", help = "Client key (PEM) for broker TLS.")]
    pub mqtt_keyfile: Option<PathBuf>,

    #[clap(long, env = "RID_MQTT_TLS_INSECURE", help = "(UNSAFE) Skip broker TLS verification (true/false).")]
    pub mqtt_tls_insecure: Option<bool>,

    #[clap(long, env = "RID_MQTT_BASE_TOPIC", help = "Base topic namespace.")]
    pub mqtt_base_topic: Option<String>,

    #[clap(long, env = "RID_MQTT_DISCOVERY_PREFIX", help = "Auto-discovery namespace used to register device descriptions.")]
    pub mqtt_discovery_prefix: Option<String>,

    #[clap(long, env = "RID_MQTT_DEVICE_BASE", help = "Base for discovery unique ids.")]
    pub mqtt_device_base: Option<String>,

    #[clap(long, env = "RID_MQTT_RETAIN", help = "Retain published state topics (true/false).")]
    pub mqtt_retain: Option<bool>,

    // --- Export sink ---
    #[clap(long, env = "RID_EXPORT_ENABLED", help = "Enable the entity-tracking export sink (true/false).")]
    pub export_enabled: Option<bool>,

    #[clap(long, env = "RID_EXPORT_URL", help = "Export registry base URL.")]
    pub export_url: Option<String>,

    #[clap(long, env = "RID_EXPORT_TOKEN", help = "Bearer token for the export registry.")]
    pub export_token: Option<String>,

    #[clap(long, env = "RID_EXPORT_SOURCE_NAME", help = "Provenance source name attached to exported entities.")]
    pub export_source_name: Option<String>,

    #[clap(long, env = "RID_EXPORT_DRONE_HZ", help = "Drone export rate ceiling (Hz).")]
    pub export_drone_hz: Option<f64>,

    #[clap(long, env = "RID_EXPORT_HOST_HZ", help = "Host-status export rate ceiling (Hz).")]
    pub export_host_hz: Option<f64>,

    // --- Registry & gate ---
    #[clap(long, env = "RID_MAX_ENTITIES", help = "Maximum number of tracked entities.")]
    pub max_entities: Option<usize>,

    #[clap(long, env = "RID_INACTIVITY_TIMEOUT_SECS", help = "Seconds without updates before an entity goes offline.")]
    pub inactivity_timeout_secs: Option<u64>,

    #[clap(long, env = "RID_SWEEP_INTERVAL_SECS", help = "Interval of the timeout-detection sweep.")]
    pub sweep_interval_secs: Option<u64>,

    #[clap(long, env = "RID_TACTICAL_MIN_INTERVAL_SECS", help = "Tactical sink: minimum seconds between forwards per entity.")]
    pub tactical_min_interval_secs: Option<f64>,

    #[clap(long, env = "RID_TACTICAL_MOVEMENT_M", help = "Tactical sink: movement threshold in meters.")]
    pub tactical_movement_m: Option<f64>,

    #[clap(long, env = "RID_TACTICAL_ALTITUDE_M", help = "Tactical sink: altitude-change threshold in meters.")]
    pub tactical_altitude_m: Option<f64>,

    #[clap(long, env = "RID_TACTICAL_SPEED_MPS", help = "Tactical sink: speed-change threshold in m/s.")]
    pub tactical_speed_mps: Option<f64>,

    #[clap(long, env = "RID_BUS_MIN_INTERVAL_SECS", help = "Bus sink: minimum seconds between forwards per entity.")]
    pub bus_min_interval_secs: Option<f64>,

    #[clap(long, env = "RID_BUS_MOVEMENT_M", help = "Bus sink: movement threshold in meters.")]
    pub bus_movement_m: Option<f64>,

    #[clap(long, env = "RID_BUS_ALTITUDE_M", help = "Bus sink: altitude-change threshold in meters.")]
    pub bus_altitude_m: Option<f64>,

    #[clap(long, env = "RID_BUS_SPEED_MPS", help = "Bus sink: speed-change threshold in m/s.")]
    pub bus_speed_mps: Option<f64>,

    #[clap(long, env = "RID_AFFILIATION_FILE", help = "INI file mapping entity ids to affiliations.")]
    pub affiliation_file: Option<PathBuf>,

    #[clap(long, env = "RID_SHUTDOWN_GRACE_SECS", help = "Grace period for sinks to drain on shutdown.")]
    pub shutdown_grace_secs: Option<u64>,
}

impl Config {
    // Merge two Config structs, where 'other' overrides 'self' for Some values
    fn merge(self, other: Config) -> Config {
        Config {
            config_path: other.config_path.or(self.config_path),
            log_dir: other.log_dir.or(self.log_dir),
            log_level: other.log_level.or(self.log_level),
            zmq_host: other.zmq_host.or(self.zmq_host),
            zmq_port: other.zmq_port.or(self.zmq_port),
            zmq_status_port: other.zmq_status_port.or(self.zmq_status_port),
            ingest_buffer: other.ingest_buffer.or(self.ingest_buffer),
            enable_multicast: other.enable_multicast.or(self.enable_multicast),
            multicast_addr: other.multicast_addr.or(self.multicast_addr),
            multicast_port: other.multicast_port.or(self.multicast_port),
            multicast_interface: other.multicast_interface.or(self.multicast_interface),
            multicast_ttl: other.multicast_ttl.or(self.multicast_ttl),
            tak_host: other.tak_host.or(self.tak_host),
            tak_port: other.tak_port.or(self.tak_port),
            tak_protocol: other.tak_protocol.or(self.tak_protocol),
            tak_p12: other.tak_p12.or(self.tak_p12),
            tak_p12_pass: other.tak_p12_pass.or(self.tak_p12_pass),
            tak_skip_verify: other.tak_skip_verify.or(self.tak_skip_verify),
            mqtt_enabled: other.mqtt_enabled.or(self.mqtt_enabled),
            mqtt_host: other.mqtt_host.or(self.mqtt_host),
            mqtt_port: other.mqtt_port.or(self.mqtt_port),
            mqtt_username: other.mqtt_username.or(self.mqtt_username),
            mqtt_password: other.mqtt_password.or(self.mqtt_password),
            mqtt_tls: other.mqtt_tls.or(self.mqtt_tls),
            mqtt_ca_file: other.mqtt_ca_file.or(self.mqtt_ca_file),
            mqtt_certfile: other.mqtt_certfile.or(self.mqtt_certfile),
            mqtt_keyfile: other.mqtt_keyfile.or(self.mqtt_keyfile),
            mqtt_tls_insecure: other.mqtt_tls_insecure.or(self.mqtt_tls_insecure),
            mqtt_base_topic: other.mqtt_base_topic.or(self.mqtt_base_topic),
            mqtt_discovery_prefix: other.mqtt_discovery_prefix.or(self.mqtt_discovery_prefix),
            mqtt_device_base: other.mqtt_device_base.or(self.mqtt_device_base),
            mqtt_retain: other.mqtt_retain.or(self.mqtt_retain),
            export_enabled: other.export_enabled.or(self.export_enabled),
            export_url: other.export_url.or(self.export_url),
            export_token: other.export_token.or(self.export_token),
            export_source_name: other.export_source_name.or(self.export_source_name),
            export_drone_hz: other.export_drone_hz.or(self.export_drone_hz),
            export_host_hz: other.export_host_hz.or(self.export_host_hz),
            max_entities: other.max_entities.or(self.max_entities),
            inactivity_timeout_secs: other.inactivity_timeout_secs.or(self.inactivity_timeout_secs),
            sweep_interval_secs: other.sweep_interval_secs.or(self.sweep_interval_secs),
            tactical_min_interval_secs: other
                .tactical_min_interval_secs
                .or(self.tactical_min_interval_secs),
            tactical_movement_m: other.tactical_movement_m.or(self.tactical_movement_m),
            tactical_altitude_m: other.tactical_altitude_m.or(self.tactical_altitude_m),
            tactical_speed_mps: other.tactical_speed_mps.or(self.tactical_speed_mps),
            bus_min_interval_secs: other.bus_min_interval_secs.or(self.bus_min_interval_secs),
            bus_movement_m: other.bus_movement_m.or(self.bus_movement_m),
            bus_altitude_m: other.bus_altitude_m.or(self.bus_altitude_m),
            bus_speed_mps: other.bus_speed_mps.or(self.bus_speed_mps),
            affiliation_file: other.affiliation_file.or(self.affiliation_file),
            shutdown_grace_secs: other.shutdown_grace_secs.or(self.shutdown_grace_secs),
        }
    }

    pub fn detection_endpoint(&self) -> String {
        format!(
            "tcp://{}:{}",
            self.zmq_host.as_deref().unwrap_or("127.0.0.1"),
            self.zmq_port.unwrap_or(4224)
        )
    }

    pub fn status_endpoint(&self) -> Option<String> {
        self.zmq_status_port.map(|port| {
            format!(
                "tcp://{}:{}",
                self.zmq_host.as_deref().unwrap_or("127.0.0.1"),
                port
            )
        })
    }

    pub fn ingest_buffer(&self) -> usize {
        self.ingest_buffer.unwrap_or(64)
    }

    pub fn inactivity_timeout(&self) -> Duration {
        Duration::from_secs(self.inactivity_timeout_secs.unwrap_or(60))
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.unwrap_or(5).max(1))
    }

    pub fn max_entities(&self) -> usize {
        self.max_entities.unwrap_or(30)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs.unwrap_or(5))
    }

    pub fn tactical_thresholds(&self) -> GateThresholds {
        GateThresholds {
            min_interval: Duration::from_secs_f64(
                self.tactical_min_interval_secs.unwrap_or(1.0).max(0.0),
            ),
            movement_m: self.tactical_movement_m.unwrap_or(25.0),
            altitude_m: self.tactical_altitude_m.unwrap_or(10.0),
            speed_mps: self.tactical_speed_mps.unwrap_or(2.0),
        }
    }

    pub fn bus_thresholds(&self) -> GateThresholds {
        GateThresholds {
            min_interval: Duration::from_secs_f64(
                self.bus_min_interval_secs.unwrap_or(1.0).max(0.0),
            ),
            movement_m: self.bus_movement_m.unwrap_or(25.0),
            altitude_m: self.bus_altitude_m.unwrap_or(10.0),
            speed_mps: self.bus_speed_mps.unwrap_or(2.0),
        }
    }

    pub fn bus_naming(&self) -> BusNaming {
        BusNaming {
            base: self
                .mqtt_base_topic
                .clone()
                .unwrap_or_else(|| "skywatch".to_string()),
            discovery_prefix: self
                .mqtt_discovery_prefix
                .clone()
                .unwrap_or_else(|| "homeassistant".to_string()),
            device_base: self
                .mqtt_device_base
                .clone()
                .unwrap_or_else(|| "skywatch_drone".to_string()),
            retain_state: self.mqtt_retain.unwrap_or(true),
        }
    }

    pub fn export_source_name(&self) -> String {
        self.export_source_name
            .clone()
            .unwrap_or_else(|| "skywatch".to_string())
    }

    pub fn multicast_config(&self) -> Result<Option<MulticastConfig>> {
        if !self.enable_multicast.unwrap_or(false) {
            return Ok(None);
        }
        let group: Ipv4Addr = self
            .multicast_addr
            .as_deref()
            .unwrap_or("239.2.3.1")
            .parse()
            .context("multicast address is not a valid IPv4 address")?;
        let interface = match &self.multicast_interface {
            Some(raw) => Some(
                raw.parse::<Ipv4Addr>()
                    .context("multicast interface is not a valid IPv4 address")?,
            ),
            None => None,
        };
        Ok(Some(MulticastConfig {
            group,
            port: self.multicast_port.unwrap_or(6969),
            interface,
            ttl: self.multicast_ttl.unwrap_or(1),
        }))
    }

    pub fn direct_config(&self) -> Result<Option<DirectConfig>> {
        let (host, port) = match (&self.tak_host, self.tak_port) {
            (Some(host), Some(port)) => (host.clone(), port),
            (None, None) => return Ok(None),
            _ => bail!("direct sink requires both tak_host and tak_port"),
        };
        let transport = match self
            .tak_protocol
            .as_deref()
            .unwrap_or("tcp")
            .to_ascii_lowercase()
            .as_str()
        {
            "tcp" => DirectTransport::Tcp,
            "udp" => DirectTransport::Udp,
            other => bail!("unsupported tak_protocol '{other}'; expected tcp or udp"),
        };
        if transport == DirectTransport::Udp && self.tak_p12.is_some() {
            bail!("client certificate bundles require the tcp transport");
        }
        Ok(Some(DirectConfig {
            host,
            port,
            transport,
            p12_path: self.tak_p12.clone(),
            p12_password: self.tak_p12_pass.clone(),
            skip_verify: self.tak_skip_verify.unwrap_or(false),
        }))
    }

    pub fn bus_config(&self) -> Option<BusConfig> {
        if !self.mqtt_enabled.unwrap_or(false) {
            return None;
        }
        Some(BusConfig {
            host: self
                .mqtt_host
                .clone()
                .unwrap_or_else(|| "127.0.0.1".to_string()),
            port: self.mqtt_port.unwrap_or(1883),
            username: self.mqtt_username.clone(),
            password: self.mqtt_password.clone(),
            tls: self.mqtt_tls.unwrap_or(false),
            ca_file: self.mqtt_ca_file.clone(),
            certfile: self.mqtt_certfile.clone(),
            keyfile: self.mqtt_keyfile.clone(),
            tls_insecure: self.mqtt_tls_insecure.unwrap_or(false),
            naming: self.bus_naming(),
        })
    }

    pub fn export_config(&self) -> Result<Option<crate::remoteid_logic::export::ExportConfig>> {
        if !self.export_enabled.unwrap_or(false) {
            return Ok(None);
        }
        let base_url = self
            .export_url
            .clone()
            .ok_or_else(|| anyhow!("export sink enabled but export_url is missing"))?;
        let token = self
            .export_token
            .clone()
            .ok_or_else(|| anyhow!("export sink enabled but export_token is missing"))?;
        let drone_hz = self.export_drone_hz.unwrap_or(1.0);
        let host_hz = self.export_host_hz.unwrap_or(0.2);
        if drone_hz <= 0.0 || host_hz <= 0.0 {
            bail!("export rate ceilings must be positive");
        }
        Ok(Some(crate::remoteid_logic::export::ExportConfig {
            base_url,
            token,
            drone_hz,
            host_hz,
        }))
    }

    /// Startup validation. Any error here is fatal: the process reports it
    /// and exits non-zero before entering the running state.
    pub fn validate(&self) -> Result<()> {
        let multicast = self.multicast_config()?;
        let direct = self.direct_config()?;
        let bus = self.bus_config();
        let export = self.export_config()?;
        if multicast.is_none() && direct.is_none() && bus.is_none() && export.is_none() {
            bail!("no sink enabled; enable multicast, a tactical server, the bus or the export");
        }
        Ok(())
    }
}

pub fn load_config() -> Config {
    // 1. Defaults that differ from "absent".
    let default_config = Config {
        zmq_host: Some("127.0.0.1".to_string()),
        zmq_port: Some(4224),
        log_dir: Some(PathBuf::from("./logs")),
        log_level: Some("info".to_string()),
        ..Default::default()
    };

    // 2. Load from the config file if present. The CLI may override the
    //    default file location, so parse it early just for that.
    let cli_args_for_path = Config::parse();
    let config_file_path = cli_args_for_path
        .config_path
        .clone()
        .unwrap_or_else(|| PathBuf::from("server_remoteid.conf"));

    let mut current_config = default_config;

    if config_file_path.exists() {
        match fs::read_to_string(&config_file_path) {
            Ok(config_str) => match serde_json::from_str::<Config>(&config_str) {
                Ok(file_config) => current_config = current_config.merge(file_config),
                Err(e) => log::warn!(
                    "Failed to parse config file {}: {e}. Falling back to other sources.",
                    config_file_path.display()
                ),
            },
            Err(e) => log::warn!(
                "Failed to read config file {}: {e}. Falling back to other sources.",
                config_file_path.display()
            ),
        }
    } else {
        log::info!(
            "Config file not found at {}. Using defaults and environment/CLI variables.",
            config_file_path.display()
        );
    }

    // 3. Environment variables and CLI arguments take precedence.
    let cli_args_final = Config::parse();
    current_config.merge(cli_args_final)
}
