#[cfg(test)]
mod codec_test;
#[cfg(test)]
mod record_test;

pub(crate) mod builder;
pub(crate) mod name;
mod packer;
pub(crate) mod question;
pub(crate) mod record;

use std::fmt;
use std::time::Instant;

use packer::*;
use question::Question;
use record::DnsRecord;

use shared::error::*;

// Message formats

// A Type is a type of DNS request and response.
#[derive(Default, Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum DnsType {
    A = 1,
    Cname = 5,
    Ptr = 12,
    Hinfo = 13,
    Txt = 16,
    Aaaa = 28,
    Srv = 33,
    Any = 255,

    #[default]
    Unsupported = 0,
}

impl From<u16> for DnsType {
    fn from(v: u16) -> Self {
        match v {
            1 => DnsType::A,
            5 => DnsType::Cname,
            12 => DnsType::Ptr,
            13 => DnsType::Hinfo,
            16 => DnsType::Txt,
            28 => DnsType::Aaaa,
            33 => DnsType::Srv,
            255 => DnsType::Any,

            _ => DnsType::Unsupported,
        }
    }
}

impl fmt::Display for DnsType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match *self {
            DnsType::A => "A",
            DnsType::Cname => "CNAME",
            DnsType::Ptr => "PTR",
            DnsType::Hinfo => "HINFO",
            DnsType::Txt => "TXT",
            DnsType::Aaaa => "AAAA",
            DnsType::Srv => "SRV",
            DnsType::Any => "ANY",
            _ => "Unsupported",
        };
        write!(f, "{s}")
    }
}

impl DnsType {
    // pack appends the wire format of the type to msg.
    pub(crate) fn pack(&self, msg: Vec<u8>) -> Vec<u8> {
        pack_uint16(msg, *self as u16)
    }
}

// A Class is a type of network. Only Internet is ever seen on the wire
// here; the high bit doubles as the mDNS cache-flush ("unique") marker and
// is masked off before the class is stored.
#[derive(Default, Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) struct DnsClass(pub(crate) u16);

pub(crate) const CLASS_IN: DnsClass = DnsClass(1);
pub(crate) const CLASS_MASK: u16 = 0x7FFF;
pub(crate) const CLASS_UNIQUE: u16 = 0x8000;

impl fmt::Display for DnsClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            1 => write!(f, "IN"),
            255 => write!(f, "ANY"),
            other => write!(f, "CLASS{other}"),
        }
    }
}

impl DnsClass {
    pub(crate) fn pack(&self, msg: Vec<u8>) -> Vec<u8> {
        pack_uint16(msg, self.0)
    }
}

// HEADER_LEN is the length (in bytes) of a DNS header.
pub(crate) const HEADER_LEN: usize = 12;

// Normal payload ceiling: Ethernet MTU minus IP and UDP headers. Anything
// that does not fit is sent truncated with a follow-up message.
pub(crate) const MAX_MSG_TYPICAL: usize = 1460;

// Jumbo-frame payload ceiling, 9000 minus IP and UDP headers.
pub(crate) const MAX_MSG_ABSOLUTE: usize = 8972;

pub(crate) const FLAGS_QR_MASK: u16 = 0x8000;
pub(crate) const FLAGS_QR_QUERY: u16 = 0x0000;
pub(crate) const FLAGS_QR_RESPONSE: u16 = 0x8000;
pub(crate) const FLAGS_AA: u16 = 0x0400;
pub(crate) const FLAGS_TC: u16 = 0x0200;

/// Default TTL for records we publish, in seconds.
pub(crate) const DNS_TTL: u32 = 60 * 60;

// A header of a DNS message.
#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub(crate) struct Header {
    pub(crate) id: u16,
    pub(crate) flags: u16,
    pub(crate) num_questions: u16,
    pub(crate) num_answers: u16,
    pub(crate) num_authorities: u16,
    pub(crate) num_additionals: u16,
}

impl Header {
    pub(crate) fn unpack(msg: &[u8], off: usize) -> Result<(Self, usize)> {
        let (id, off) = unpack_uint16(msg, off)?;
        let (flags, off) = unpack_uint16(msg, off)?;
        let (num_questions, off) = unpack_uint16(msg, off)?;
        let (num_answers, off) = unpack_uint16(msg, off)?;
        let (num_authorities, off) = unpack_uint16(msg, off)?;
        let (num_additionals, off) = unpack_uint16(msg, off)?;
        Ok((
            Header {
                id,
                flags,
                num_questions,
                num_answers,
                num_authorities,
                num_additionals,
            },
            off,
        ))
    }
}

// A parsed DNS message. Record counts come from the vector lengths, not
// the header, since unsupported record types are dropped during unpack.
#[derive(Default, Debug, Clone)]
pub(crate) struct Message {
    pub(crate) header: Header,
    pub(crate) questions: Vec<Question>,
    pub(crate) answers: Vec<DnsRecord>,
    pub(crate) authorities: Vec<DnsRecord>,
    pub(crate) additionals: Vec<DnsRecord>,
}

impl Message {
    /// Parse a datagram. `now` becomes the `created` stamp of every record.
    pub(crate) fn unpack(msg: &[u8], now: Instant) -> Result<Self> {
        let (header, mut off) = Header::unpack(msg, 0)?;

        let mut questions = Vec::with_capacity(usize::from(header.num_questions));
        for _ in 0..header.num_questions {
            let (q, o) = Question::unpack(msg, off)?;
            off = o;
            questions.push(q);
        }

        let mut sections = [Vec::new(), Vec::new(), Vec::new()];
        let counts = [
            header.num_answers,
            header.num_authorities,
            header.num_additionals,
        ];
        for (section, count) in sections.iter_mut().zip(counts) {
            for _ in 0..count {
                let (rec, o) = DnsRecord::unpack(msg, off, now)?;
                off = o;
                if let Some(rec) = rec {
                    section.push(rec);
                }
            }
        }
        let [answers, authorities, additionals] = sections;

        Ok(Message {
            header,
            questions,
            answers,
            authorities,
            additionals,
        })
    }

    pub(crate) fn is_query(&self) -> bool {
        self.header.flags & FLAGS_QR_MASK == FLAGS_QR_QUERY
    }

    pub(crate) fn is_truncated(&self) -> bool {
        self.header.flags & FLAGS_TC != 0
    }

    // All records regardless of section; conflict checks and known-answer
    // handling treat probe authorities the same as answers.
    pub(crate) fn all_records(&self) -> impl Iterator<Item = &DnsRecord> {
        self.answers
            .iter()
            .chain(self.authorities.iter())
            .chain(self.additionals.iter())
    }

    // Merge a follow-up datagram into a parked truncated query.
    pub(crate) fn append(&mut self, mut other: Message) {
        self.questions.append(&mut other.questions);
        self.answers.append(&mut other.answers);
        self.authorities.append(&mut other.authorities);
        self.additionals.append(&mut other.additionals);
        self.header.flags = other.header.flags;
    }
}
