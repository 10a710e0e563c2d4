//! Two engines wired back to back through their sans-I/O surfaces,
//! exercising the full advertise/browse exchange over real packets.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Instant;

use sansio::Protocol;
use zeroconf_mdns::{
    DnsSd, DnsSdConfig, DnsSdEvent, ServiceInfo, TaggedBytesMut, TransportContext,
    TransportProtocol, MDNS_PORT,
};

fn engine(host: &str, addr: [u8; 4], seed: u64) -> DnsSd {
    DnsSd::new(
        DnsSdConfig::new()
            .with_host_name(host)
            .with_local_addr(IpAddr::V4(Ipv4Addr::from(addr)))
            .with_seed(seed),
    )
}

// Fire due timers. Writes stay queued for `pump` or `discard`.
fn drive(engine: &mut DnsSd, rounds: usize) {
    for _ in 0..rounds {
        let Some(deadline) = engine.poll_timeout() else {
            break;
        };
        engine.handle_timeout(deadline).unwrap();
    }
}

fn discard(engine: &mut DnsSd) {
    while engine.poll_write().is_some() {}
}

// Hand every pending datagram of `from` to `to`, as the multicast group
// would.
fn pump(from: &mut DnsSd, from_addr: [u8; 4], to: &mut DnsSd) {
    let src = SocketAddr::new(IpAddr::V4(Ipv4Addr::from(from_addr)), MDNS_PORT);
    while let Some(w) = from.poll_write() {
        to.handle_read(TaggedBytesMut {
            now: Instant::now(),
            transport: TransportContext {
                local_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), MDNS_PORT),
                peer_addr: src,
                transport_protocol: TransportProtocol::UDP,
            },
            message: w.message,
        })
        .unwrap();
    }
}

fn events(engine: &mut DnsSd) -> Vec<DnsSdEvent> {
    let mut out = vec![];
    while let Some(e) = engine.poll_event() {
        out.push(e);
    }
    out
}

#[test]
fn test_advertised_service_is_browsable() {
    let mut alpha = engine("alpha", [10, 0, 0, 1], 1);
    let mut beta = engine("beta", [10, 0, 0, 2], 2);

    alpha
        .register_service(ServiceInfo::new("_http._tcp.local.", "web", 8080, 0, 0, "path=/").unwrap())
        .unwrap();
    beta.add_service_listener("_http._tcp.local.").unwrap();
    assert!(beta.list("_http._tcp.local.").unwrap().is_empty());

    // alpha probes and announces, beta overhears everything
    drive(&mut alpha, 10);
    pump(&mut alpha, [10, 0, 0, 1], &mut beta);

    let seen = events(&mut beta);
    assert!(seen.iter().any(|e| matches!(
        e,
        DnsSdEvent::ServiceAdded(ev) if ev.name == "web" && ev.service_type == "_http._tcp.local."
    )));
    assert!(seen.iter().any(|e| matches!(
        e,
        DnsSdEvent::ServiceResolved(ev)
            if ev.info.as_ref().is_some_and(|i| {
                i.port() == 8080
                    && i.server() == Some("alpha.local.")
                    && i.address() == Some(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)))
            })
    )));

    let listed = beta.list("_http._tcp.local.").unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].name(), "web");
    assert_eq!(listed[0].property_string("path"), Some("/".to_owned()));
}

#[test]
fn test_browser_query_is_answered() {
    let mut alpha = engine("alpha", [10, 0, 0, 1], 1);
    let mut beta = engine("beta", [10, 0, 0, 2], 2);

    alpha
        .register_service(ServiceInfo::new("_ipp._tcp.local.", "printer", 631, 0, 0, "rp=lp").unwrap())
        .unwrap();
    drive(&mut alpha, 10);
    discard(&mut alpha);
    drive(&mut beta, 10);
    discard(&mut beta);

    // beta asks, alpha answers, beta resolves from the answer
    beta.request_service_info("_ipp._tcp.local.", "printer")
        .unwrap();
    drive(&mut beta, 1);
    pump(&mut beta, [10, 0, 0, 2], &mut alpha);
    drive(&mut alpha, 6);
    pump(&mut alpha, [10, 0, 0, 1], &mut beta);

    assert!(events(&mut beta).iter().any(|e| matches!(
        e,
        DnsSdEvent::ServiceResolved(ev) if ev.name == "printer"
    )));
}

#[test]
fn test_probe_conflict_renames_the_loser() {
    // same host name; alpha's address compares greater, so beta yields
    let mut alpha = engine("box", [10, 0, 0, 200], 1);
    let mut beta = engine("box", [10, 0, 0, 7], 2);

    drive(&mut alpha, 1);
    pump(&mut alpha, [10, 0, 0, 200], &mut beta);

    assert_eq!(beta.host_name(), "box-2.local.");
    assert!(events(&mut beta)
        .contains(&DnsSdEvent::HostNameChanged("box-2.local.".to_owned())));

    // the winner keeps its name when it hears the renamed probe
    drive(&mut beta, 2);
    pump(&mut beta, [10, 0, 0, 7], &mut alpha);
    assert_eq!(alpha.host_name(), "box.local.");
}

#[test]
fn test_type_enumeration_across_engines() {
    let mut alpha = engine("alpha", [10, 0, 0, 1], 1);
    let mut beta = engine("beta", [10, 0, 0, 2], 2);

    alpha
        .register_service(ServiceInfo::new("_ipp._tcp.local.", "printer", 631, 0, 0, "").unwrap())
        .unwrap();
    drive(&mut alpha, 10);
    discard(&mut alpha);
    drive(&mut beta, 10);
    discard(&mut beta);

    beta.add_service_type_listener().unwrap();
    drive(&mut beta, 1);
    pump(&mut beta, [10, 0, 0, 2], &mut alpha);
    drive(&mut alpha, 6);
    pump(&mut alpha, [10, 0, 0, 1], &mut beta);

    assert!(events(&mut beta)
        .contains(&DnsSdEvent::ServiceTypeAdded("_ipp._tcp.local.".to_owned())));
}

#[test]
fn test_goodbye_propagates_to_browsers() {
    let mut alpha = engine("alpha", [10, 0, 0, 1], 1);
    let mut beta = engine("beta", [10, 0, 0, 2], 2);

    let name = alpha
        .register_service(ServiceInfo::new("_http._tcp.local.", "web", 8080, 0, 0, "").unwrap())
        .unwrap();
    beta.add_service_listener("_http._tcp.local.").unwrap();

    drive(&mut alpha, 10);
    pump(&mut alpha, [10, 0, 0, 1], &mut beta);
    events(&mut beta);

    alpha.unregister_service(&name).unwrap();
    drive(&mut alpha, 2);
    pump(&mut alpha, [10, 0, 0, 1], &mut beta);

    assert!(events(&mut beta).iter().any(|e| matches!(
        e,
        DnsSdEvent::ServiceRemoved(ev) if ev.name == "web"
    )));
}
