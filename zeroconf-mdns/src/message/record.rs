use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::time::{Duration, Instant};

use super::name::*;
use super::packer::*;
use super::*;
use shared::error::{Error, Result};

/// Typed payload of a resource record.
///
/// The record types this engine handles are the service-discovery set:
/// host addresses, service pointers, service locations and text metadata.
/// Everything else is skipped on decode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum RecordData {
    A(Ipv4Addr),
    Aaaa(Ipv6Addr),
    Ptr {
        alias: String,
    },
    Srv {
        priority: u16,
        weight: u16,
        port: u16,
        target: String,
    },
    Txt(Vec<u8>),
}

impl RecordData {
    pub(crate) fn record_type(&self) -> DnsType {
        match self {
            RecordData::A(_) => DnsType::A,
            RecordData::Aaaa(_) => DnsType::Aaaa,
            RecordData::Ptr { .. } => DnsType::Ptr,
            RecordData::Srv { .. } => DnsType::Srv,
            RecordData::Txt(_) => DnsType::Txt,
        }
    }
}

/// A resource record with cache bookkeeping.
///
/// `created` is the local receive (or synthesis) time; TTL arithmetic is
/// relative to it. `unique` mirrors the cache-flush bit of the wire class
/// field, kept separate so the masked class can be compared directly.
#[derive(Debug, Clone)]
pub(crate) struct DnsRecord {
    pub(crate) name: String,
    pub(crate) class: DnsClass,
    pub(crate) unique: bool,
    pub(crate) ttl: u32,
    pub(crate) created: Instant,
    pub(crate) data: RecordData,
}

impl fmt::Display for DnsRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "record[{} {} {} ttl={}]",
            self.name,
            self.record_type(),
            self.class,
            self.ttl
        )
    }
}

impl DnsRecord {
    pub(crate) fn new(
        name: impl Into<String>,
        class: DnsClass,
        unique: bool,
        ttl: u32,
        created: Instant,
        data: RecordData,
    ) -> Self {
        DnsRecord {
            name: name.into(),
            class,
            unique,
            ttl,
            created,
            data,
        }
    }

    pub(crate) fn record_type(&self) -> DnsType {
        self.data.record_type()
    }

    // Identity: (name, type, class), name case-blind.
    pub(crate) fn entry_eq(&self, other: &DnsRecord) -> bool {
        names_equal(&self.name, &other.name)
            && self.record_type() == other.record_type()
            && self.class == other.class
    }

    pub(crate) fn same_value(&self, other: &DnsRecord) -> bool {
        self.data_bytes() == other.data_bytes()
    }

    pub(crate) fn same_as(&self, other: &DnsRecord) -> bool {
        self.entry_eq(other) && self.same_value(other)
    }

    // A known answer makes ours redundant when it carries the same value
    // and still has more than half our TTL left.
    pub(crate) fn suppressed_by(&self, known_answers: &[DnsRecord]) -> bool {
        known_answers
            .iter()
            .any(|other| self.same_as(other) && other.ttl > self.ttl / 2)
    }

    pub(crate) fn expiration(&self, percent: u32) -> Instant {
        self.created + Duration::from_millis(u64::from(self.ttl) * 10 * u64::from(percent))
    }

    pub(crate) fn remaining_ttl(&self, now: Instant) -> u32 {
        let expires = self.expiration(100);
        if expires <= now {
            0
        } else {
            (expires - now).as_secs() as u32
        }
    }

    pub(crate) fn is_expired(&self, now: Instant) -> bool {
        self.expiration(100) <= now
    }

    pub(crate) fn is_stale(&self, now: Instant) -> bool {
        self.expiration(50) <= now
    }

    // Refresh from a newly received copy of the same record.
    pub(crate) fn reset_ttl(&mut self, other: &DnsRecord) {
        self.created = other.created;
        self.ttl = other.ttl;
    }

    // Value payload only, used for same_value and the canonical encoding.
    pub(crate) fn data_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        match &self.data {
            RecordData::A(ip) => out.extend_from_slice(&ip.octets()),
            RecordData::Aaaa(ip) => out.extend_from_slice(&ip.octets()),
            RecordData::Ptr { alias } => out.extend_from_slice(&utf_encode(alias)),
            RecordData::Srv {
                priority,
                weight,
                port,
                target,
            } => {
                out = pack_uint16(out, *priority);
                out = pack_uint16(out, *weight);
                out = pack_uint16(out, *port);
                out.extend_from_slice(&utf_encode(target));
            }
            RecordData::Txt(bytes) => out.extend_from_slice(bytes),
        }
        out
    }

    // Canonical byte encoding used for the probe tie-break: full name in
    // modified UTF-8 (uncompressed), type, masked class, then the value.
    pub(crate) fn canonical_bytes(&self) -> Vec<u8> {
        let mut out = utf_encode(&self.name);
        out = pack_uint16(out, self.record_type() as u16);
        out = pack_uint16(out, self.class.0);
        out.extend_from_slice(&self.data_bytes());
        out
    }

    pub(crate) fn lex_cmp(&self, other: &DnsRecord) -> Ordering {
        self.canonical_bytes().cmp(&other.canonical_bytes())
    }

    // pack appends the wire format of the record to msg. `now` of None
    // writes the full TTL (authoritative records not yet on the clock);
    // otherwise the remaining TTL is written. The unique bit only goes on
    // the wire for multicast responses.
    pub(crate) fn pack(
        &self,
        mut msg: Vec<u8>,
        compression: &mut HashMap<String, usize>,
        now: Option<Instant>,
        multicast: bool,
    ) -> Result<Vec<u8>> {
        msg = pack_name(msg, &self.name, compression)?;
        msg = self.record_type().pack(msg);
        let clazz = if self.unique && multicast {
            self.class.0 | CLASS_UNIQUE
        } else {
            self.class.0
        };
        msg = pack_uint16(msg, clazz);
        let ttl = match now {
            Some(now) => self.remaining_ttl(now),
            None => self.ttl,
        };
        msg = pack_uint32(msg, ttl);

        let len_off = msg.len();
        msg = pack_uint16(msg, 0);
        match &self.data {
            RecordData::A(ip) => msg.extend_from_slice(&ip.octets()),
            RecordData::Aaaa(ip) => msg.extend_from_slice(&ip.octets()),
            RecordData::Ptr { alias } => {
                msg = pack_name(msg, alias, compression)?;
            }
            RecordData::Srv {
                priority,
                weight,
                port,
                target,
            } => {
                msg = pack_uint16(msg, *priority);
                msg = pack_uint16(msg, *weight);
                msg = pack_uint16(msg, *port);
                msg = pack_name(msg, target, compression)?;
            }
            RecordData::Txt(bytes) => msg.extend_from_slice(bytes),
        }
        let rdlen = msg.len() - len_off - 2;
        msg[len_off] = (rdlen >> 8) as u8;
        msg[len_off + 1] = (rdlen & 0xFF) as u8;
        Ok(msg)
    }

    // unpack reads one record starting at off. Types outside the handled
    // set yield None; the caller drops them without disturbing the offsets
    // of what follows, since rdlength delimits every body.
    pub(crate) fn unpack(
        msg: &[u8],
        off: usize,
        now: Instant,
    ) -> Result<(Option<DnsRecord>, usize)> {
        let (name, off) = unpack_name(msg, off)?;
        let (t, off) = unpack_uint16(msg, off)?;
        let (clazz, off) = unpack_uint16(msg, off)?;
        let (ttl, off) = unpack_uint32(msg, off)?;
        let (rdlen, off) = unpack_uint16(msg, off)?;
        let end = off + usize::from(rdlen);
        if end > msg.len() {
            return Err(Error::ErrShortBuffer);
        }

        let data = match DnsType::from(t) {
            DnsType::A => {
                let (bytes, _) = unpack_bytes(msg, off, 4)?;
                RecordData::A(Ipv4Addr::new(bytes[0], bytes[1], bytes[2], bytes[3]))
            }
            DnsType::Aaaa => {
                let (bytes, _) = unpack_bytes(msg, off, 16)?;
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&bytes);
                RecordData::Aaaa(Ipv6Addr::from(octets))
            }
            DnsType::Cname | DnsType::Ptr => {
                let (alias, _) = unpack_name(msg, off)?;
                RecordData::Ptr { alias }
            }
            DnsType::Srv => {
                let (priority, o) = unpack_uint16(msg, off)?;
                let (weight, o) = unpack_uint16(msg, o)?;
                let (port, o) = unpack_uint16(msg, o)?;
                let (target, _) = unpack_name(msg, o)?;
                RecordData::Srv {
                    priority,
                    weight,
                    port,
                    target,
                }
            }
            DnsType::Txt => {
                let (bytes, _) = unpack_bytes(msg, off, usize::from(rdlen))?;
                RecordData::Txt(bytes)
            }
            _ => return Ok((None, end)),
        };

        Ok((
            Some(DnsRecord {
                name,
                class: DnsClass(clazz & CLASS_MASK),
                unique: clazz & CLASS_UNIQUE != 0,
                ttl,
                created: now,
                data,
            }),
            end,
        ))
    }
}
