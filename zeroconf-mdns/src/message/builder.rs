use std::collections::HashMap;
use std::time::Instant;

use bytes::BytesMut;

use super::question::Question;
use super::record::DnsRecord;
use super::*;
use shared::error::{Error, Result};

/// Incremental encoder for one outgoing message.
///
/// The 12 header bytes are reserved up front and backpatched by
/// [`finish`](MessageBuilder::finish). Section order is enforced: questions,
/// answers, authorities, additionals. A record that would push the buffer
/// past `MAX_MSG_TYPICAL` is rolled back and reported as
/// [`Error::ErrBufferFull`]; the engine reacts by finishing the message
/// with the TC flag and starting a fresh one.
#[derive(Debug)]
pub(crate) struct MessageBuilder {
    pub(crate) id: u16,
    pub(crate) flags: u16,
    pub(crate) multicast: bool,
    data: Vec<u8>,
    names: HashMap<String, usize>,
    pub(crate) num_questions: u16,
    pub(crate) num_answers: u16,
    pub(crate) num_authorities: u16,
    pub(crate) num_additionals: u16,
}

impl MessageBuilder {
    pub(crate) fn new(flags: u16) -> Self {
        Self::with_multicast(flags, true)
    }

    // Unicast responses echo the query id and leave the cache-flush bit off.
    pub(crate) fn unicast(flags: u16) -> Self {
        Self::with_multicast(flags, false)
    }

    fn with_multicast(flags: u16, multicast: bool) -> Self {
        MessageBuilder {
            id: 0,
            flags,
            multicast,
            data: vec![0; HEADER_LEN],
            names: HashMap::new(),
            num_questions: 0,
            num_answers: 0,
            num_authorities: 0,
            num_additionals: 0,
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.num_questions == 0
            && self.num_answers == 0
            && self.num_authorities == 0
            && self.num_additionals == 0
    }

    pub(crate) fn len(&self) -> usize {
        self.data.len()
    }

    pub(crate) fn add_question(&mut self, question: &Question) -> Result<()> {
        if self.num_answers > 0 || self.num_authorities > 0 || self.num_additionals > 0 {
            return Err(Error::ErrQuestionAfterAnswer);
        }
        let names = self.names.clone();
        match question.pack(self.data.clone(), &mut self.names) {
            Ok(data) if data.len() <= MAX_MSG_TYPICAL => {
                self.data = data;
                self.num_questions += 1;
                Ok(())
            }
            Ok(_) => {
                self.names = names;
                Err(Error::ErrBufferFull)
            }
            Err(e) => {
                self.names = names;
                Err(e)
            }
        }
    }

    /// Add an answer, writing the remaining TTL as of `now`. Records already
    /// expired are silently dropped; `None` writes the full TTL (records we
    /// are about to start announcing).
    pub(crate) fn add_answer(&mut self, rec: &DnsRecord, now: Option<Instant>) -> Result<()> {
        if self.num_authorities > 0 || self.num_additionals > 0 {
            return Err(Error::ErrSectionOutOfOrder);
        }
        if let Some(now) = now {
            if rec.is_expired(now) {
                return Ok(());
            }
        }
        self.write_record(rec, now)?;
        self.num_answers += 1;
        Ok(())
    }

    /// Add an answer unless the query already carried an equivalent one
    /// with more than half our TTL remaining (known-answer suppression).
    pub(crate) fn add_answer_suppressed(
        &mut self,
        known_answers: &[DnsRecord],
        rec: &DnsRecord,
    ) -> Result<()> {
        if rec.suppressed_by(known_answers) {
            return Ok(());
        }
        self.add_answer(rec, None)
    }

    pub(crate) fn add_authoritative_answer(&mut self, rec: &DnsRecord) -> Result<()> {
        if self.num_additionals > 0 {
            return Err(Error::ErrSectionOutOfOrder);
        }
        self.write_record(rec, None)?;
        self.num_authorities += 1;
        Ok(())
    }

    // Additionals are best effort: skipped outright when the buffer is
    // nearly full rather than triggering truncation.
    pub(crate) fn add_additional_answer(&mut self, rec: &DnsRecord) -> Result<()> {
        if self.data.len() >= MAX_MSG_TYPICAL - 200 {
            return Ok(());
        }
        self.write_record(rec, None)?;
        self.num_additionals += 1;
        Ok(())
    }

    // The compression table is checkpointed so a rolled-back record leaves
    // no dangling offsets behind.
    fn write_record(&mut self, rec: &DnsRecord, now: Option<Instant>) -> Result<()> {
        let names = self.names.clone();
        match rec.pack(self.data.clone(), &mut self.names, now, self.multicast) {
            Ok(data) if data.len() <= MAX_MSG_TYPICAL => {
                self.data = data;
                Ok(())
            }
            Ok(_) => {
                self.names = names;
                Err(Error::ErrBufferFull)
            }
            Err(e) => {
                self.names = names;
                Err(e)
            }
        }
    }

    /// Write the header and yield the datagram. Multicast messages carry
    /// id 0, unicast responses echo the id of the query they answer.
    pub(crate) fn finish(mut self) -> BytesMut {
        let id = if self.multicast { 0 } else { self.id };
        self.data[0..2].copy_from_slice(&id.to_be_bytes());
        self.data[2..4].copy_from_slice(&self.flags.to_be_bytes());
        self.data[4..6].copy_from_slice(&self.num_questions.to_be_bytes());
        self.data[6..8].copy_from_slice(&self.num_answers.to_be_bytes());
        self.data[8..10].copy_from_slice(&self.num_authorities.to_be_bytes());
        self.data[10..12].copy_from_slice(&self.num_additionals.to_be_bytes());
        BytesMut::from(&self.data[..])
    }
}
