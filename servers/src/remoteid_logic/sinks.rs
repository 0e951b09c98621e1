//! Tactical transport sinks.
//!
//! Both transports carry pre-encoded tactical event documents and own their
//! connection lifecycle. A send failure is logged and counted, then the sink
//! reconnects on its own schedule; nothing propagates to the orchestrator.
//! Each task exits when its channel closes, after the orchestrator drains.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::path::PathBuf;

use anyhow::{Context, Result};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio::time::{sleep, Duration};

const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Broadcast-style delivery: UDP multicast, no acknowledgment, no
/// connection state beyond the open socket.
#[derive(Debug, Clone)]
pub struct MulticastConfig {
    pub group: Ipv4Addr,
    pub port: u16,
    /// Interface address to send from; system default when unset.
    pub interface: Option<Ipv4Addr>,
    pub ttl: u32,
}

fn multicast_socket(cfg: &MulticastConfig) -> Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
        .context("creating multicast socket")?;
    socket.set_multicast_ttl_v4(cfg.ttl)?;
    if let Some(iface) = cfg.interface {
        socket.set_multicast_if_v4(&iface)?;
    }
    socket.set_nonblocking(true)?;
    socket.bind(&SocketAddr::from(([0, 0, 0, 0], 0)).into())?;
    UdpSocket::from_std(socket.into()).context("registering multicast socket with tokio")
}

pub async fn run_multicast(cfg: MulticastConfig, mut rx: mpsc::Receiver<Vec<u8>>) {
    let socket = match multicast_socket(&cfg) {
        Ok(s) => s,
        Err(e) => {
            log::error!("multicast sink disabled: {e:#}");
            while rx.recv().await.is_some() {}
            return;
        }
    };
    let dest = SocketAddr::V4(SocketAddrV4::new(cfg.group, cfg.port));
    log::info!("multicast sink sending to {dest} (ttl {})", cfg.ttl);

    let mut send_failures: u64 = 0;
    while let Some(payload) = rx.recv().await {
        if let Err(e) = socket.send_to(&payload, dest).await {
            send_failures += 1;
            log::warn!("multicast send failed ({send_failures} total): {e}");
        }
    }
    log::info!("multicast sink stopped");
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectTransport {
    Tcp,
    Udp,
}

/// Direct unicast delivery to a tactical server. TCP may be wrapped in TLS
/// with a PKCS#12 client certificate bundle; the skip-verify override is for
/// bench use and warns loudly.
#[derive(Debug, Clone)]
pub struct DirectConfig {
    pub host: String,
    pub port: u16,
    pub transport: DirectTransport,
    pub p12_path: Option<PathBuf>,
    pub p12_password: Option<String>,
    pub skip_verify: bool,
}

fn tls_connector(cfg: &DirectConfig) -> Result<Option<tokio_native_tls::TlsConnector>> {
    let Some(p12_path) = &cfg.p12_path else {
        return Ok(None);
    };
    let bundle = std::fs::read(p12_path)
        .with_context(|| format!("reading client certificate bundle {}", p12_path.display()))?;
    let identity =
        native_tls::Identity::from_pkcs12(&bundle, cfg.p12_password.as_deref().unwrap_or(""))
            .context("loading client certificate bundle")?;
    let mut builder = native_tls::TlsConnector::builder();
    builder.identity(identity);
    if cfg.skip_verify {
        log::warn!("direct sink TLS verification disabled; not a production posture");
        builder.danger_accept_invalid_certs(true);
        builder.danger_accept_invalid_hostnames(true);
    }
    Ok(Some(builder.build()?.into()))
}

async fn connect_tcp(
    cfg: &DirectConfig,
    tls: Option<&tokio_native_tls::TlsConnector>,
) -> Result<Box<dyn AsyncWrite + Unpin + Send>> {
    let tcp = TcpStream::connect((cfg.host.as_str(), cfg.port)).await?;
    match tls {
        Some(connector) => Ok(Box::new(connector.connect(&cfg.host, tcp).await?)),
        None => Ok(Box::new(tcp)),
    }
}

pub async fn run_direct(cfg: DirectConfig, mut rx: mpsc::Receiver<Vec<u8>>) {
    match cfg.transport {
        DirectTransport::Udp => run_direct_udp(cfg, rx).await,
        DirectTransport::Tcp => {
            let tls = match tls_connector(&cfg) {
                Ok(t) => t,
                Err(e) => {
                    log::error!("direct sink disabled: {e:#}");
                    while rx.recv().await.is_some() {}
                    return;
                }
            };
            run_direct_tcp(cfg, tls, rx).await;
        }
    }
}

async fn run_direct_udp(cfg: DirectConfig, mut rx: mpsc::Receiver<Vec<u8>>) {
    let socket = match UdpSocket::bind("0.0.0.0:0").await {
        Ok(s) => s,
        Err(e) => {
            log::error!("direct sink disabled, UDP bind failed: {e}");
            while rx.recv().await.is_some() {}
            return;
        }
    };
    log::info!("direct sink sending UDP to {}:{}", cfg.host, cfg.port);

    let mut send_failures: u64 = 0;
    while let Some(payload) = rx.recv().await {
        if let Err(e) = socket
            .send_to(&payload, (cfg.host.as_str(), cfg.port))
            .await
        {
            send_failures += 1;
            log::warn!("direct UDP send failed ({send_failures} total): {e}");
        }
    }
    log::info!("direct sink stopped");
}

async fn run_direct_tcp(
    cfg: DirectConfig,
    tls: Option<tokio_native_tls::TlsConnector>,
    mut rx: mpsc::Receiver<Vec<u8>>,
) {
    let mut send_failures: u64 = 0;
    loop {
        log::info!(
            "connecting direct sink to {}:{}{}",
            cfg.host,
            cfg.port,
            if tls.is_some() { " (tls)" } else { "" }
        );
        let mut stream = match connect_tcp(&cfg, tls.as_ref()).await {
            Ok(s) => {
                log::info!("direct sink connected");
                s
            }
            Err(e) => {
                log::warn!("direct sink connect failed: {e}; retrying");
                sleep(RECONNECT_DELAY).await;
                continue;
            }
        };

        loop {
            match rx.recv().await {
                Some(payload) => {
                    let write = async {
                        stream.write_all(&payload).await?;
                        stream.flush().await
                    };
                    if let Err(e) = write.await {
                        send_failures += 1;
                        log::warn!("direct send failed ({send_failures} total): {e}; reconnecting");
                        break;
                    }
                }
                None => {
                    let _ = stream.shutdown().await;
                    log::info!("direct sink stopped");
                    return;
                }
            }
        }
    }
}
