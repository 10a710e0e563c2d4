use std::collections::HashMap;
use std::fmt;

use super::name::*;
use super::packer::*;
use super::*;
use shared::error::Result;

// A question is one query entry of a DNS message.
#[derive(Default, Debug, PartialEq, Eq, Clone)]
pub(crate) struct Question {
    pub(crate) name: String,
    pub(crate) typ: DnsType,
    pub(crate) class: DnsClass,
}

impl fmt::Display for Question {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "question[{} {} {}]", self.name, self.typ, self.class)
    }
}

impl Question {
    pub(crate) fn new(name: impl Into<String>, typ: DnsType, class: DnsClass) -> Self {
        Question {
            name: name.into(),
            typ,
            class,
        }
    }

    // pack appends the wire format of the question to msg.
    pub(crate) fn pack(
        &self,
        mut msg: Vec<u8>,
        compression: &mut HashMap<String, usize>,
    ) -> Result<Vec<u8>> {
        msg = pack_name(msg, &self.name, compression)?;
        msg = self.typ.pack(msg);
        Ok(self.class.pack(msg))
    }

    pub(crate) fn unpack(msg: &[u8], off: usize) -> Result<(Self, usize)> {
        let (name, off) = unpack_name(msg, off)?;
        let (t, off) = unpack_uint16(msg, off)?;
        let (c, off) = unpack_uint16(msg, off)?;
        Ok((
            Question {
                name,
                typ: DnsType::from(t),
                class: DnsClass(c & CLASS_MASK),
            },
            off,
        ))
    }
}
