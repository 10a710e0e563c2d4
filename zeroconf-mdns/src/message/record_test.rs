use std::cmp::Ordering;
use std::net::Ipv4Addr;
use std::time::{Duration, Instant};

use super::record::{DnsRecord, RecordData};
use super::*;

fn a(name: &str, ip: [u8; 4], ttl: u32, created: Instant) -> DnsRecord {
    DnsRecord::new(
        name.to_owned(),
        CLASS_IN,
        true,
        ttl,
        created,
        RecordData::A(Ipv4Addr::from(ip)),
    )
}

#[test]
fn test_ttl_remaining_and_expiry() {
    let created = Instant::now();
    let rec = a("box.local.", [10, 0, 0, 7], 60, created);

    assert_eq!(rec.remaining_ttl(created), 60);
    assert_eq!(rec.remaining_ttl(created + Duration::from_secs(30)), 30);
    assert_eq!(rec.remaining_ttl(created + Duration::from_secs(61)), 0);

    assert!(!rec.is_expired(created + Duration::from_secs(59)));
    assert!(rec.is_expired(created + Duration::from_millis(60_001)));

    assert!(!rec.is_stale(created + Duration::from_secs(29)));
    assert!(rec.is_stale(created + Duration::from_millis(30_001)));
}

#[test]
fn test_reset_ttl_takes_fresh_lifetime() {
    let created = Instant::now();
    let later = created + Duration::from_secs(50);
    let mut rec = a("box.local.", [10, 0, 0, 7], 60, created);
    let fresh = a("box.local.", [10, 0, 0, 7], 120, later);

    rec.reset_ttl(&fresh);
    assert_eq!(rec.ttl, 120);
    assert_eq!(rec.remaining_ttl(later), 120);
}

#[test]
fn test_entry_and_value_equality() {
    let now = Instant::now();
    let one = a("Box.local.", [10, 0, 0, 7], 60, now);
    let two = a("box.LOCAL.", [10, 0, 0, 7], 3600, now);
    let other_value = a("box.local.", [10, 0, 0, 8], 60, now);

    // names compare case-insensitively, TTL is not part of identity
    assert!(one.entry_eq(&two));
    assert!(one.same_as(&two));
    assert!(one.entry_eq(&other_value));
    assert!(!one.same_as(&other_value));

    let srv = DnsRecord::new(
        "box.local.",
        CLASS_IN,
        true,
        60,
        now,
        RecordData::Srv {
            priority: 0,
            weight: 0,
            port: 80,
            target: "box.local.".to_owned(),
        },
    );
    assert!(!one.entry_eq(&srv));
}

#[test]
fn test_lex_cmp_orders_by_value_bytes() {
    let now = Instant::now();
    let low = a("box.local.", [10, 0, 0, 7], 60, now);
    let high = a("box.local.", [10, 0, 0, 8], 60, now);

    assert_eq!(low.lex_cmp(&high), Ordering::Less);
    assert_eq!(high.lex_cmp(&low), Ordering::Greater);
    assert_eq!(low.lex_cmp(&low), Ordering::Equal);

    // high byte values compare as unsigned
    let signed_low = a("box.local.", [127, 0, 0, 1], 60, now);
    let signed_high = a("box.local.", [192, 168, 0, 1], 60, now);
    assert_eq!(signed_low.lex_cmp(&signed_high), Ordering::Less);
}

#[test]
fn test_lex_cmp_considers_type_before_value() {
    let now = Instant::now();
    let addr = a("box.local.", [255, 255, 255, 255], 60, now);
    let txt = DnsRecord::new(
        "box.local.",
        CLASS_IN,
        true,
        60,
        now,
        RecordData::Txt(vec![1, b'x']),
    );
    // A (type 1) sorts before TXT (type 16) regardless of the data
    assert_eq!(addr.lex_cmp(&txt), Ordering::Less);
}

#[test]
fn test_known_answer_suppression() {
    let now = Instant::now();
    let ours = a("box.local.", [10, 0, 0, 7], DNS_TTL, now);

    let mut fresh = ours.clone();
    fresh.ttl = DNS_TTL;
    assert!(ours.suppressed_by(&[fresh]));

    // at or below half our TTL the answer must be repeated
    let mut stale = ours.clone();
    stale.ttl = DNS_TTL / 2;
    assert!(!ours.suppressed_by(&[stale]));

    // a different value never suppresses
    let other = a("box.local.", [10, 0, 0, 8], DNS_TTL, now);
    assert!(!ours.suppressed_by(&[other]));

    assert!(!ours.suppressed_by(&[]));
}
