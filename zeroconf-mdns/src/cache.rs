use std::collections::HashMap;
use std::time::Instant;

use crate::message::record::DnsRecord;
use crate::message::{DnsClass, DnsType};

/// Cache of remote resource records, keyed by lowercase record name.
/// Multiple records may share a name (shared PTR records for one
/// service type, A and SRV for one host).
#[derive(Default, Debug)]
pub(crate) struct DnsCache {
    entries: HashMap<String, Vec<DnsRecord>>,
}

impl DnsCache {
    pub(crate) fn new() -> Self {
        DnsCache::default()
    }

    pub(crate) fn add(&mut self, rec: DnsRecord) {
        self.entries
            .entry(rec.name.to_lowercase())
            .or_default()
            .push(rec);
    }

    /// Removes the cached record with the same name, type, class and
    /// value. Returns true if one was removed.
    pub(crate) fn remove(&mut self, rec: &DnsRecord) -> bool {
        let key = rec.name.to_lowercase();
        if let Some(list) = self.entries.get_mut(&key) {
            if let Some(pos) = list.iter().position(|r| r.same_as(rec)) {
                list.remove(pos);
                if list.is_empty() {
                    self.entries.remove(&key);
                }
                return true;
            }
        }
        false
    }

    /// Looks up the cached record with the same name, type, class and
    /// value as `rec`.
    pub(crate) fn get_mut(&mut self, rec: &DnsRecord) -> Option<&mut DnsRecord> {
        self.entries
            .get_mut(&rec.name.to_lowercase())?
            .iter_mut()
            .find(|r| r.same_as(rec))
    }

    pub(crate) fn get_by(
        &self,
        name: &str,
        typ: DnsType,
        class: DnsClass,
    ) -> Option<&DnsRecord> {
        self.entries
            .get(&name.to_lowercase())?
            .iter()
            .find(|r| r.record_type() == typ && r.class == class)
    }

    pub(crate) fn iter_name(&self, name: &str) -> impl Iterator<Item = &DnsRecord> {
        self.entries
            .get(&name.to_lowercase())
            .into_iter()
            .flatten()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &DnsRecord> {
        self.entries.values().flatten()
    }

    /// Drains every record that has outlived its full TTL.
    pub(crate) fn take_expired(&mut self, now: Instant) -> Vec<DnsRecord> {
        let mut expired = vec![];
        for list in self.entries.values_mut() {
            let mut i = 0;
            while i < list.len() {
                if list[i].is_expired(now) {
                    expired.push(list.remove(i));
                } else {
                    i += 1;
                }
            }
        }
        self.entries.retain(|_, list| !list.is_empty());
        expired
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
    }
}
