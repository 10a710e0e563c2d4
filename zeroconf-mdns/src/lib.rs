//! # zeroconf-mdns
//!
//! A sans-I/O multicast DNS service discovery (DNS-SD) engine.
//!
//! The engine registers, announces and defends services on the local
//! link, and browses and resolves services published by other hosts,
//! following the multicast DNS draft (probing, announcing,
//! tie-breaking, known-answer suppression, goodbye packets).
//!
//! ## Sans-I/O Design
//!
//! [`DnsSd`] implements the [`sansio::Protocol`] trait and owns no
//! sockets, threads or timers. The caller drives it:
//!
//! 1. Feed received datagrams to `handle_read()`
//! 2. Send datagrams returned by `poll_write()`
//! 3. Call `handle_timeout()` when `poll_timeout()` expires
//! 4. Consume [`DnsSdEvent`]s from `poll_event()`
//!
//! [`MulticastSocket`] builds a UDP socket suitable for step 1 and 2.
//!
//! ## Quick Start
//!
//! ```rust
//! use zeroconf_mdns::{DnsSd, DnsSdConfig, ServiceInfo, MDNS_DEST_ADDR};
//! use sansio::Protocol;
//! use std::net::{IpAddr, Ipv4Addr};
//! use std::time::Instant;
//!
//! let config = DnsSdConfig::new()
//!     .with_host_name("mybox")
//!     .with_local_addr(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 5)));
//! let mut engine = DnsSd::new(config);
//!
//! let info = ServiceInfo::new("_http._tcp.local.", "web", 8080, 0, 0, "path=/")?;
//! let name = engine.register_service(info)?;
//! assert_eq!(name, "web._http._tcp.local.");
//!
//! // drive the probe/announce state machine
//! while let Some(deadline) = engine.poll_timeout() {
//!     if deadline > Instant::now() {
//!         break; // a real driver sleeps here
//!     }
//!     engine.handle_timeout(deadline)?;
//!     while let Some(packet) = engine.poll_write() {
//!         assert_eq!(packet.transport.peer_addr, MDNS_DEST_ADDR);
//!         // send packet.message via UDP
//!     }
//! }
//! # Ok::<(), shared::error::Error>(())
//! ```
#![warn(rust_2018_idioms)]
#![allow(dead_code)]

mod cache;
mod config;
mod engine;
mod host;
pub(crate) mod message;
mod service;
mod socket;
mod state;

pub use config::DnsSdConfig;
pub use engine::{DnsSd, DnsSdEvent, ServiceEvent, MDNS_DEST_ADDR, MDNS_PORT, META_QUERY};
pub use service::ServiceInfo;
pub use socket::MulticastSocket;
pub use state::DnsState;

pub use shared::error::{Error, Result};
pub use shared::{TaggedBytesMut, TransportContext, TransportProtocol};
