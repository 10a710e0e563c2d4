use std::net::{Ipv4Addr, Ipv6Addr};
use std::time::Instant;

use super::builder::MessageBuilder;
use super::name::{pack_name, unpack_name, utf_decode, utf_encode};
use super::question::Question;
use super::record::{DnsRecord, RecordData};
use super::*;

use shared::error::Error;

fn srv(name: &str, port: u16, target: &str, created: Instant) -> DnsRecord {
    DnsRecord::new(
        name.to_owned(),
        CLASS_IN,
        true,
        DNS_TTL,
        created,
        RecordData::Srv {
            priority: 0,
            weight: 0,
            port,
            target: target.to_owned(),
        },
    )
}

#[test]
fn test_name_round_trip() -> Result<()> {
    let mut compression = std::collections::HashMap::new();
    let msg = pack_name(vec![0; HEADER_LEN], "web._http._tcp.local.", &mut compression)?;
    let (name, off) = unpack_name(&msg, HEADER_LEN)?;
    assert_eq!(name, "web._http._tcp.local.");
    assert_eq!(off, msg.len());
    Ok(())
}

#[test]
fn test_name_compression_reuses_suffixes() -> Result<()> {
    let mut compression = std::collections::HashMap::new();
    let msg = pack_name(vec![0; HEADER_LEN], "one._http._tcp.local.", &mut compression)?;
    let before = msg.len();
    let msg = pack_name(msg, "two._http._tcp.local.", &mut compression)?;

    // the second name is one label plus a 2-byte pointer
    assert_eq!(msg.len() - before, 1 + "two".len() + 2);

    let (first, off) = unpack_name(&msg, HEADER_LEN)?;
    let (second, _) = unpack_name(&msg, off)?;
    assert_eq!(first, "one._http._tcp.local.");
    assert_eq!(second, "two._http._tcp.local.");
    Ok(())
}

#[test]
fn test_unpack_name_rejects_pointer_loop() {
    // pointer at offset 0 pointing to itself
    let msg = [0xC0, 0x00];
    assert_eq!(unpack_name(&msg, 0), Err(Error::ErrCircularPointer));

    // two pointers chasing each other
    let msg = [0xC0, 0x02, 0xC0, 0x00];
    assert_eq!(unpack_name(&msg, 2), Err(Error::ErrCircularPointer));
}

#[test]
fn test_unpack_name_rejects_short_buffer() {
    assert_eq!(unpack_name(&[0x05, b'a'], 0), Err(Error::ErrShortBuffer));
    assert_eq!(unpack_name(&[], 0), Err(Error::ErrShortBuffer));
}

#[test]
fn test_modified_utf8_round_trip() -> Result<()> {
    for s in ["plain", "caf\u{e9}", "\u{4e2d}\u{6587}", "emoji \u{1f980}", "nul\0byte"] {
        let encoded = utf_encode(s);
        // modified UTF-8 never emits a zero byte
        assert!(!encoded.contains(&0));
        let (decoded, off) = utf_decode(&encoded, 0, encoded.len())?;
        assert_eq!(decoded, s);
        assert_eq!(off, encoded.len());
    }
    Ok(())
}

#[test]
fn test_query_round_trip() -> Result<()> {
    let now = Instant::now();
    let mut out = MessageBuilder::new(FLAGS_QR_QUERY);
    out.add_question(&Question::new("box.local.", DnsType::Any, CLASS_IN))?;
    out.add_authoritative_answer(&DnsRecord::new(
        "box.local.",
        CLASS_IN,
        true,
        DNS_TTL,
        now,
        RecordData::A(Ipv4Addr::new(10, 0, 0, 7)),
    ))?;
    let payload = out.finish();

    let parsed = Message::unpack(&payload, now)?;
    assert!(parsed.is_query());
    assert!(!parsed.is_truncated());
    assert_eq!(parsed.header.id, 0);
    assert_eq!(parsed.questions.len(), 1);
    assert_eq!(parsed.questions[0].name, "box.local.");
    assert_eq!(parsed.questions[0].typ, DnsType::Any);
    assert_eq!(parsed.answers.len(), 0);
    assert_eq!(parsed.authorities.len(), 1);
    assert_eq!(parsed.authorities[0].name, "box.local.");
    assert!(parsed.authorities[0].unique);
    assert_eq!(
        parsed.authorities[0].data,
        RecordData::A(Ipv4Addr::new(10, 0, 0, 7))
    );
    Ok(())
}

#[test]
fn test_response_round_trip_all_record_types() -> Result<()> {
    let now = Instant::now();
    let mut out = MessageBuilder::new(FLAGS_QR_RESPONSE | FLAGS_AA);
    out.add_answer(
        &DnsRecord::new(
            "_http._tcp.local.",
            CLASS_IN,
            false,
            DNS_TTL,
            now,
            RecordData::Ptr {
                alias: "web._http._tcp.local.".to_owned(),
            },
        ),
        None,
    )?;
    out.add_answer(&srv("web._http._tcp.local.", 8080, "box.local.", now), None)?;
    out.add_answer(
        &DnsRecord::new(
            "web._http._tcp.local.",
            CLASS_IN,
            true,
            DNS_TTL,
            now,
            RecordData::Txt(vec![4, b'a', b'=', b'b']),
        ),
        None,
    )?;
    out.add_answer(
        &DnsRecord::new(
            "box.local.",
            CLASS_IN,
            true,
            DNS_TTL,
            now,
            RecordData::Aaaa(Ipv6Addr::new(0xfe80, 0, 0, 0, 0, 0, 0, 1)),
        ),
        None,
    )?;
    let payload = out.finish();

    let parsed = Message::unpack(&payload, now)?;
    assert!(!parsed.is_query());
    assert_eq!(parsed.answers.len(), 4);
    assert_eq!(
        parsed.answers[1].data,
        RecordData::Srv {
            priority: 0,
            weight: 0,
            port: 8080,
            target: "box.local.".to_owned(),
        }
    );
    assert_eq!(parsed.answers[2].data, RecordData::Txt(vec![4, b'a', b'=', b'b']));
    assert!(!parsed.answers[0].unique);
    assert!(parsed.answers[3].unique);
    Ok(())
}

#[test]
fn test_remaining_ttl_is_written() -> Result<()> {
    let created = Instant::now();
    let now = created + std::time::Duration::from_secs(100);
    let mut out = MessageBuilder::new(FLAGS_QR_QUERY);
    out.add_question(&Question::new("box.local.", DnsType::A, CLASS_IN))?;
    out.add_answer(&srv("web._http._tcp.local.", 80, "box.local.", created), Some(now))?;
    let payload = out.finish();

    let parsed = Message::unpack(&payload, now)?;
    assert_eq!(parsed.answers[0].ttl, DNS_TTL - 100);
    Ok(())
}

#[test]
fn test_expired_answers_are_dropped_silently() -> Result<()> {
    let created = Instant::now();
    let now = created + std::time::Duration::from_secs(DNS_TTL as u64 + 1);
    let mut out = MessageBuilder::new(FLAGS_QR_RESPONSE);
    out.add_answer(&srv("web._http._tcp.local.", 80, "box.local.", created), Some(now))?;
    assert!(out.is_empty());
    Ok(())
}

#[test]
fn test_section_order_is_enforced() -> Result<()> {
    let now = Instant::now();
    let rec = srv("web._http._tcp.local.", 80, "box.local.", now);

    let mut out = MessageBuilder::new(FLAGS_QR_QUERY);
    out.add_answer(&rec, None)?;
    assert_eq!(
        out.add_question(&Question::new("box.local.", DnsType::A, CLASS_IN)),
        Err(Error::ErrQuestionAfterAnswer)
    );

    let mut out = MessageBuilder::new(FLAGS_QR_QUERY);
    out.add_additional_answer(&rec)?;
    assert_eq!(out.add_answer(&rec, None), Err(Error::ErrSectionOutOfOrder));
    assert_eq!(
        out.add_authoritative_answer(&rec),
        Err(Error::ErrSectionOutOfOrder)
    );
    Ok(())
}

#[test]
fn test_known_answer_suppression_in_builder() -> Result<()> {
    let now = Instant::now();
    let ours = srv("web._http._tcp.local.", 8080, "box.local.", now);

    // a matching known answer with a healthy TTL suppresses ours
    let mut out = MessageBuilder::new(FLAGS_QR_RESPONSE);
    out.add_answer_suppressed(std::slice::from_ref(&ours), &ours)?;
    assert!(out.is_empty());

    // at half the TTL or below the peer needs the refresh
    let mut aging = ours.clone();
    aging.ttl = DNS_TTL / 2;
    let mut out = MessageBuilder::new(FLAGS_QR_RESPONSE);
    out.add_answer_suppressed(&[aging], &ours)?;
    assert_eq!(out.num_answers, 1);

    // a known answer with different rdata never suppresses
    let other = srv("web._http._tcp.local.", 9090, "box.local.", now);
    let mut out = MessageBuilder::new(FLAGS_QR_RESPONSE);
    out.add_answer_suppressed(&[other], &ours)?;
    assert_eq!(out.num_answers, 1);
    Ok(())
}

#[test]
fn test_overflowing_record_reports_buffer_full() -> Result<()> {
    let now = Instant::now();
    let mut out = MessageBuilder::new(FLAGS_QR_RESPONSE);
    let mut wrote = 0;
    loop {
        // distinct names defeat compression so the buffer actually fills
        let rec = DnsRecord::new(
            format!("record-{wrote}.local."),
            CLASS_IN,
            true,
            DNS_TTL,
            now,
            RecordData::Txt(vec![64; 65]),
        );
        match out.add_answer(&rec, None) {
            Ok(()) => wrote += 1,
            Err(Error::ErrBufferFull) => break,
            Err(e) => return Err(e),
        }
    }
    assert!(wrote > 0);
    assert!(out.len() <= MAX_MSG_TYPICAL);

    // the failed record must not corrupt the message
    let parsed = Message::unpack(&out.finish(), now)?;
    assert_eq!(parsed.answers.len(), wrote);
    Ok(())
}

#[test]
fn test_truncated_flag() -> Result<()> {
    let now = Instant::now();
    let mut out = MessageBuilder::new(FLAGS_QR_RESPONSE | FLAGS_TC);
    out.add_answer(&srv("web._http._tcp.local.", 80, "box.local.", now), None)?;
    let parsed = Message::unpack(&out.finish(), now)?;
    assert!(parsed.is_truncated());
    Ok(())
}

#[test]
fn test_unknown_record_types_are_skipped() -> Result<()> {
    let now = Instant::now();
    // header with one answer of type 99
    let mut msg = vec![0, 0, 0x84, 0, 0, 0, 0, 1, 0, 0, 0, 0];
    msg.extend_from_slice(&[3, b'f', b'o', b'o', 0]); // "foo."
    msg.extend_from_slice(&99u16.to_be_bytes());
    msg.extend_from_slice(&1u16.to_be_bytes());
    msg.extend_from_slice(&DNS_TTL.to_be_bytes());
    msg.extend_from_slice(&2u16.to_be_bytes());
    msg.extend_from_slice(&[0xAB, 0xCD]);

    let parsed = Message::unpack(&msg, now)?;
    assert!(parsed.answers.is_empty());
    Ok(())
}

#[test]
fn test_unpack_rejects_truncated_header() {
    let now = Instant::now();
    assert_eq!(
        Message::unpack(&[0, 0, 0, 0], now).err(),
        Some(Error::ErrShortBuffer)
    );
}

#[test]
fn test_append_merges_sections() -> Result<()> {
    let now = Instant::now();
    let mut first = MessageBuilder::new(FLAGS_QR_QUERY | FLAGS_TC);
    first.add_question(&Question::new("_http._tcp.local.", DnsType::Ptr, CLASS_IN))?;
    let mut second = MessageBuilder::new(FLAGS_QR_QUERY);
    second.add_answer(&srv("web._http._tcp.local.", 80, "box.local.", now), None)?;

    let mut parsed = Message::unpack(&first.finish(), now)?;
    assert!(parsed.is_truncated());
    parsed.append(Message::unpack(&second.finish(), now)?);

    assert_eq!(parsed.questions.len(), 1);
    assert_eq!(parsed.answers.len(), 1);
    // the continuation clears the truncation flag
    assert!(!parsed.is_truncated());
    Ok(())
}
