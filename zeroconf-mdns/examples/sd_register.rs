//! DNS-SD Service Registration Example
//!
//! Advertises a single service instance on the local link. The engine
//! probes for name ownership, announces the service and then answers
//! queries until the process is interrupted, at which point goodbye
//! packets are sent.
//!
//! # Usage
//!
//! ```
//! cargo run --package zeroconf-mdns --example sd_register
//! ```
//!
//! With a custom service:
//! ```
//! cargo run --package zeroconf-mdns --example sd_register -- \
//!     --name music --service-type _http._tcp.local. --port 9000 --text path=/songs
//! ```

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::{Duration, Instant};

use bytes::BytesMut;
use clap::Parser;
use sansio::Protocol;
use tokio::net::UdpSocket;
use zeroconf_mdns::{
    DnsSd, DnsSdConfig, DnsSdEvent, MulticastSocket, ServiceInfo, TaggedBytesMut,
    TransportContext, TransportProtocol, MDNS_PORT,
};

#[derive(Parser, Debug)]
#[command(name = "DNS-SD Register")]
#[command(about = "Advertise a service instance using the sans-I/O zeroconf-mdns engine")]
struct Args {
    /// Service instance name
    #[arg(long, default_value = "demo-web")]
    name: String,

    /// Fully qualified service type
    #[arg(long, default_value = "_http._tcp.local.")]
    service_type: String,

    /// Advertised port
    #[arg(long, default_value = "8080")]
    port: u16,

    /// TXT payload, a single key=value entry
    #[arg(long, default_value = "path=/")]
    text: String,

    /// Host name to claim, without the .local. suffix
    #[arg(long)]
    host: Option<String>,
}

fn get_local_ip() -> IpAddr {
    if let Ok(socket) = std::net::UdpSocket::bind("0.0.0.0:0") {
        if socket.connect("8.8.8.8:80").is_ok() {
            if let Ok(addr) = socket.local_addr() {
                return addr.ip();
            }
        }
    }
    Ipv4Addr::new(127, 0, 0, 1).into()
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let local_ip = get_local_ip();

    let mut config = DnsSdConfig::default().with_local_addr(local_ip);
    if let Some(host) = &args.host {
        config = config.with_host_name(host);
    }
    let mut engine = DnsSd::new(config);

    let info = ServiceInfo::new(
        &args.service_type,
        &args.name,
        args.port,
        0,
        0,
        &args.text,
    )?;
    let qualified = engine.register_service(info)?;
    log::info!(
        "registering {} on {} port {}",
        qualified,
        engine.host_name(),
        args.port
    );

    let multicast_local_addr = SocketAddr::new(local_ip, MDNS_PORT);
    let socket = UdpSocket::from_std(MulticastSocket::new().into_std()?)?;

    let mut buf = vec![0u8; 1500];

    loop {
        while let Some(packet) = engine.poll_write() {
            log::trace!("sending {} bytes", packet.message.len());
            socket
                .send_to(&packet.message, packet.transport.peer_addr)
                .await?;
        }

        while let Some(event) = engine.poll_event() {
            match event {
                DnsSdEvent::HostNameChanged(name) => {
                    log::warn!("host name conflict, now {name}");
                }
                other => log::debug!("{other:?}"),
            }
        }

        let wait_duration = engine
            .poll_timeout()
            .map(|t| t.saturating_duration_since(Instant::now()))
            .unwrap_or(Duration::from_millis(100));

        tokio::select! {
            result = socket.recv_from(&mut buf) => {
                let (len, peer_addr) = result?;
                let msg = TaggedBytesMut {
                    now: Instant::now(),
                    transport: TransportContext {
                        local_addr: multicast_local_addr,
                        peer_addr,
                        transport_protocol: TransportProtocol::UDP,
                    },
                    message: BytesMut::from(&buf[..len]),
                };
                if let Err(e) = engine.handle_read(msg) {
                    log::warn!("handle_read: {e}");
                }
            }
            _ = tokio::time::sleep(wait_duration) => {
                if let Err(e) = engine.handle_timeout(Instant::now()) {
                    log::warn!("handle_timeout: {e}");
                }
            }
            _ = tokio::signal::ctrl_c() => {
                log::info!("unregistering {qualified}");
                engine.close()?;
                while let Some(packet) = engine.poll_write() {
                    socket
                        .send_to(&packet.message, packet.transport.peer_addr)
                        .await?;
                }
                break;
            }
        }
    }

    Ok(())
}
