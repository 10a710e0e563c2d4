use std::net::IpAddr;
use std::time::Instant;

use crate::message::record::{DnsRecord, RecordData};
use crate::message::{DnsType, CLASS_IN, DNS_TTL};

const LOCAL_SUFFIX: &str = ".local.";

/// The local host entry defended on the link: its `.local.` name and
/// the interface address advertised for it.
#[derive(Debug)]
pub(crate) struct HostInfo {
    pub(crate) name: String,
    pub(crate) address: Option<IpAddr>,
    rename_count: u32,
}

impl HostInfo {
    pub(crate) fn new(name: &str, address: Option<IpAddr>) -> Self {
        // Keep only the first label of whatever the caller supplied and
        // qualify it under .local.
        let label = name.split('.').next().unwrap_or(name);
        let label = if label.is_empty() { "computer" } else { label };
        HostInfo {
            name: format!("{label}{LOCAL_SUFFIX}"),
            address,
            rename_count: 1,
        }
    }

    /// The address record we defend, if an address is configured.
    pub(crate) fn address_record(&self, created: Instant) -> Option<DnsRecord> {
        let data = match self.address? {
            IpAddr::V4(ip) => RecordData::A(ip),
            IpAddr::V6(ip) => RecordData::Aaaa(ip),
        };
        Some(DnsRecord::new(
            self.name.clone(),
            CLASS_IN,
            true,
            DNS_TTL,
            created,
            data,
        ))
    }

    /// The address record answering a question of the given type, when
    /// our configured address is of the matching family.
    pub(crate) fn record_for(&self, typ: DnsType, created: Instant) -> Option<DnsRecord> {
        match (typ, self.address?) {
            (DnsType::A, IpAddr::V4(_)) | (DnsType::Aaaa, IpAddr::V6(_)) => {
                self.address_record(created)
            }
            _ => None,
        }
    }

    /// Picks the next host name after a probe conflict was lost:
    /// `computer.local.` becomes `computer-2.local.`, then
    /// `computer-3.local.` and so on.
    pub(crate) fn increment_name(&mut self) -> &str {
        self.rename_count += 1;
        let base = self.name.strip_suffix(LOCAL_SUFFIX).unwrap_or(&self.name);
        let base = match base.rsplit_once('-') {
            Some((stem, n)) if !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit()) => stem,
            _ => base,
        };
        self.name = format!("{base}-{}{LOCAL_SUFFIX}", self.rename_count);
        &self.name
    }

    /// True for packets looped back from another interface: loopback
    /// source while we speak for a non-loopback address.
    pub(crate) fn should_ignore_packet(&self, src: IpAddr) -> bool {
        match self.address {
            Some(addr) => src.is_loopback() && !addr.is_loopback(),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn test_name_is_qualified_from_first_label() {
        assert_eq!(HostInfo::new("box", None).name, "box.local.");
        assert_eq!(
            HostInfo::new("box.example.com", None).name,
            "box.local."
        );
        assert_eq!(HostInfo::new("", None).name, "computer.local.");
    }

    #[test]
    fn test_increment_name_counts_from_two() {
        let mut host = HostInfo::new("box", None);
        assert_eq!(host.increment_name(), "box-2.local.");
        assert_eq!(host.increment_name(), "box-3.local.");
    }

    #[test]
    fn test_increment_name_keeps_interior_hyphens() {
        let mut host = HostInfo::new("my-box", None);
        assert_eq!(host.increment_name(), "my-box-2.local.");
        assert_eq!(host.increment_name(), "my-box-3.local.");
    }

    #[test]
    fn test_loopback_packets_are_ignored() {
        let host = HostInfo::new("box", Some(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 7))));
        assert!(host.should_ignore_packet(IpAddr::V4(Ipv4Addr::LOCALHOST)));
        assert!(!host.should_ignore_packet(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 8))));

        let unbound = HostInfo::new("box", None);
        assert!(!unbound.should_ignore_packet(IpAddr::V4(Ipv4Addr::LOCALHOST)));
    }

    #[test]
    fn test_record_for_matches_address_family() {
        let now = Instant::now();
        let host = HostInfo::new("box", Some(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 7))));
        assert!(host.record_for(DnsType::A, now).is_some());
        assert!(host.record_for(DnsType::Aaaa, now).is_none());
    }
}
