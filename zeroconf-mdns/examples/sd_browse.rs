//! DNS-SD Browsing Example
//!
//! Watches the local link for service instances of one type, resolving
//! each instance it discovers, or enumerates the service types present
//! on the link.
//!
//! # Usage
//!
//! ```
//! cargo run --package zeroconf-mdns --example sd_browse -- --service-type _http._tcp.local.
//! ```
//!
//! Enumerate service types instead:
//! ```
//! cargo run --package zeroconf-mdns --example sd_browse -- --list-types
//! ```

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::{Duration, Instant};

use bytes::BytesMut;
use chrono::Local;
use clap::Parser;
use sansio::Protocol;
use tokio::net::UdpSocket;
use zeroconf_mdns::{
    DnsSd, DnsSdConfig, DnsSdEvent, MulticastSocket, TaggedBytesMut, TransportContext,
    TransportProtocol, MDNS_PORT,
};

#[derive(Parser, Debug)]
#[command(name = "DNS-SD Browse")]
#[command(about = "Browse for services using the sans-I/O zeroconf-mdns engine")]
struct Args {
    /// Fully qualified service type to browse for
    #[arg(long, default_value = "_http._tcp.local.")]
    service_type: String,

    /// Enumerate service types instead of instances
    #[arg(long)]
    list_types: bool,

    /// How long to browse, in seconds (0 = until interrupted)
    #[arg(long, default_value = "0")]
    timeout: u64,
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

fn stamp() -> String {
    Local::now().format("%H:%M:%S%.3f").to_string()
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let local_ip = get_local_ip();

    let mut engine = DnsSd::new(DnsSdConfig::default().with_local_addr(local_ip));
    if args.list_types {
        engine.add_service_type_listener()?;
        log::info!("enumerating service types");
    } else {
        engine.add_service_listener(&args.service_type)?;
        log::info!("browsing for {}", args.service_type);
    }

    let multicast_local_addr = SocketAddr::new(local_ip, MDNS_PORT);
    let socket = UdpSocket::from_std(MulticastSocket::new().into_std()?)?;

    let deadline = (args.timeout > 0).then(|| Instant::now() + Duration::from_secs(args.timeout));
    let mut buf = vec![0u8; 1500];

    loop {
        while let Some(packet) = engine.poll_write() {
            socket
                .send_to(&packet.message, packet.transport.peer_addr)
                .await?;
        }

        while let Some(event) = engine.poll_event() {
            match event {
                DnsSdEvent::ServiceAdded(ev) => {
                    println!("{} + {} ({})", stamp(), ev.name, ev.service_type);
                    engine.request_service_info(&ev.service_type, &ev.name)?;
                }
                DnsSdEvent::ServiceResolved(ev) => {
                    if let Some(info) = ev.info {
                        println!(
                            "{} = {} at {}:{} {:?}",
                            stamp(),
                            ev.name,
                            info.server().unwrap_or("?"),
                            info.port(),
                            info.properties(),
                        );
                    }
                }
                DnsSdEvent::ServiceRemoved(ev) => {
                    println!("{} - {} ({})", stamp(), ev.name, ev.service_type);
                }
                DnsSdEvent::ResolveTimeout(ev) => {
                    log::warn!("could not resolve {}", ev.name);
                }
                DnsSdEvent::ServiceTypeAdded(ty) => {
                    println!("{} * {ty}", stamp());
                }
                other => log::debug!("{other:?}"),
            }
        }

        if deadline.is_some_and(|d| Instant::now() >= d) {
            break;
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
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    engine.close()?;
    Ok(())
}
