use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;
use std::time::Instant;

use shared::error::{Error, Result};

use crate::cache::DnsCache;
use crate::engine::task::TaskId;
use crate::message::name::{names_equal, utf_decode, utf_encode};
use crate::message::record::{DnsRecord, RecordData};
use crate::message::{DnsType, CLASS_IN};
use crate::state::DnsState;

/// One DNS-SD service instance: either registered locally or being
/// resolved from the network.
///
/// A locally registered instance is advertised as the record triple
/// `PTR(type -> qualified name)`, `SRV(qualified name -> host, port)`
/// and `TXT(qualified name -> properties)`. A remote instance is
/// considered resolved once its SRV target, an address for that target
/// and its TXT data are all known.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceInfo {
    pub(crate) service_type: String,
    pub(crate) name: String,
    pub(crate) server: Option<String>,
    pub(crate) port: u16,
    pub(crate) weight: u16,
    pub(crate) priority: u16,
    pub(crate) text: Option<Vec<u8>>,
    pub(crate) address: Option<IpAddr>,
    pub(crate) state: DnsState,
    pub(crate) task: Option<TaskId>,
}

impl ServiceInfo {
    /// Creates a service instance for registration. `text` becomes the
    /// single entry of the TXT record and must encode to at most 255
    /// bytes.
    pub fn new(
        service_type: &str,
        name: &str,
        port: u16,
        weight: u16,
        priority: u16,
        text: &str,
    ) -> Result<ServiceInfo> {
        let mut info = ServiceInfo::discovery(service_type, name)?;
        info.port = port;
        info.weight = weight;
        info.priority = priority;
        info.text = Some(encode_entry(utf_encode(text))?);
        Ok(info)
    }

    /// Creates a service instance for registration with `key=value`
    /// TXT properties. A `None` value encodes the bare key. Each
    /// encoded entry must fit in 255 bytes.
    pub fn with_properties(
        service_type: &str,
        name: &str,
        port: u16,
        weight: u16,
        priority: u16,
        properties: &[(&str, Option<&[u8]>)],
    ) -> Result<ServiceInfo> {
        let mut info = ServiceInfo::discovery(service_type, name)?;
        info.port = port;
        info.weight = weight;
        info.priority = priority;

        let mut text = vec![];
        for (key, value) in properties {
            let mut entry = utf_encode(key);
            if let Some(value) = value {
                entry.push(b'=');
                entry.extend_from_slice(value);
            }
            text.extend_from_slice(&encode_entry(entry)?);
        }
        info.text = Some(text);
        Ok(info)
    }

    /// Creates an unresolved placeholder for a remote instance.
    pub(crate) fn discovery(service_type: &str, name: &str) -> Result<ServiceInfo> {
        if !service_type.ends_with('.') {
            return Err(Error::ErrServiceTypeSuffix);
        }
        Ok(ServiceInfo {
            service_type: service_type.to_owned(),
            name: name.to_owned(),
            server: None,
            port: 0,
            weight: 0,
            priority: 0,
            text: None,
            address: None,
            state: DnsState::Probing1,
            task: None,
        })
    }

    pub fn service_type(&self) -> &str {
        &self.service_type
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Fully qualified instance name, `<name>.<type>`.
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.name, self.service_type)
    }

    /// SRV target host, once known.
    pub fn server(&self) -> Option<&str> {
        self.server.as_deref()
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn weight(&self) -> u16 {
        self.weight
    }

    pub fn priority(&self) -> u16 {
        self.priority
    }

    pub fn address(&self) -> Option<IpAddr> {
        self.address
    }

    /// Raw TXT record data.
    pub fn text(&self) -> Option<&[u8]> {
        self.text.as_deref()
    }

    pub fn state(&self) -> DnsState {
        self.state
    }

    /// True once server, address and TXT data are all known.
    pub fn has_data(&self) -> bool {
        self.server.is_some() && self.address.is_some() && self.text.is_some()
    }

    /// Decodes the TXT data as `key[=value]` properties. Returns an
    /// empty map when the data is absent or malformed.
    pub fn properties(&self) -> HashMap<String, Option<Vec<u8>>> {
        let mut props = HashMap::new();
        let Some(text) = &self.text else {
            return props;
        };
        let mut off = 0;
        while off < text.len() {
            let len = text[off] as usize;
            off += 1;
            if len == 0 || off + len > text.len() {
                props.clear();
                return props;
            }
            let entry = &text[off..off + len];
            off += len;
            let (key, value) = match entry.iter().position(|&b| b == b'=') {
                Some(eq) => (&entry[..eq], Some(entry[eq + 1..].to_vec())),
                None => (entry, None),
            };
            match utf_decode(key, 0, key.len()) {
                Ok((key, _)) => {
                    props.insert(key, value);
                }
                Err(_) => {
                    props.clear();
                    return props;
                }
            }
        }
        props
    }

    /// Looks up a property value as a UTF-8 string.
    pub fn property_string(&self, key: &str) -> Option<String> {
        let value = self.properties().remove(key)??;
        String::from_utf8(value).ok()
    }

    /// Looks up a raw property value.
    pub fn property_bytes(&self, key: &str) -> Option<Vec<u8>> {
        self.properties().remove(key)?
    }

    pub(crate) fn advance_state(&mut self) {
        self.state = self.state.advance();
    }

    pub(crate) fn revert_state(&mut self) {
        self.state = self.state.revert();
        self.task = None;
    }

    pub(crate) fn cancel(&mut self) {
        self.state = DnsState::Canceled;
        self.task = None;
    }

    /// Shared PTR record advertising this instance under its type.
    pub(crate) fn ptr_record(&self, created: Instant, ttl: u32) -> DnsRecord {
        DnsRecord::new(
            self.service_type.clone(),
            CLASS_IN,
            false,
            ttl,
            created,
            RecordData::Ptr {
                alias: self.qualified_name(),
            },
        )
    }

    /// SRV record binding this instance to `host`. Probes and goodbyes
    /// leave the cache-flush bit off.
    pub(crate) fn srv_record(
        &self,
        host: &str,
        created: Instant,
        ttl: u32,
        unique: bool,
    ) -> DnsRecord {
        DnsRecord::new(
            self.qualified_name(),
            CLASS_IN,
            unique,
            ttl,
            created,
            RecordData::Srv {
                priority: self.priority,
                weight: self.weight,
                port: self.port,
                target: host.to_owned(),
            },
        )
    }

    pub(crate) fn txt_record(&self, created: Instant, ttl: u32, unique: bool) -> DnsRecord {
        DnsRecord::new(
            self.qualified_name(),
            CLASS_IN,
            unique,
            ttl,
            created,
            RecordData::Txt(self.text.clone().unwrap_or_default()),
        )
    }

    /// Absorbs a received record into this instance. SRV fixes the
    /// target and port and chases a cached address record for the
    /// target; A/AAAA and TXT fill in the remaining pieces. Returns
    /// true if the instance became fully resolved by this record.
    pub(crate) fn update_record(
        &mut self,
        cache: &DnsCache,
        now: Instant,
        rec: &DnsRecord,
    ) -> bool {
        if rec.is_expired(now) {
            return false;
        }
        let had_data = self.has_data();
        match &rec.data {
            RecordData::A(ip) => {
                if self
                    .server
                    .as_deref()
                    .is_some_and(|s| names_equal(s, &rec.name))
                {
                    self.address = Some(IpAddr::V4(*ip));
                }
            }
            RecordData::Aaaa(ip) => {
                if self
                    .server
                    .as_deref()
                    .is_some_and(|s| names_equal(s, &rec.name))
                {
                    self.address = Some(IpAddr::V6(*ip));
                }
            }
            RecordData::Srv {
                priority,
                weight,
                port,
                target,
            } => {
                if names_equal(&rec.name, &self.qualified_name()) {
                    self.priority = *priority;
                    self.weight = *weight;
                    self.port = *port;
                    self.server = Some(target.clone());
                    self.address = None;
                    let addr = cache
                        .get_by(target, DnsType::A, CLASS_IN)
                        .or_else(|| cache.get_by(target, DnsType::Aaaa, CLASS_IN))
                        .cloned();
                    if let Some(addr) = addr {
                        self.update_record(cache, now, &addr);
                    }
                }
            }
            RecordData::Txt(text) => {
                if names_equal(&rec.name, &self.qualified_name()) {
                    self.text = Some(text.clone());
                }
            }
            RecordData::Ptr { .. } => {}
        }
        !had_data && self.has_data()
    }
}

impl fmt::Display for ServiceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "service[{} -> {}:{}]",
            self.qualified_name(),
            self.server.as_deref().unwrap_or("?"),
            self.port
        )
    }
}

fn encode_entry(entry: Vec<u8>) -> Result<Vec<u8>> {
    if entry.len() > 255 {
        return Err(Error::ErrPropertyTooLong);
    }
    let mut out = Vec::with_capacity(entry.len() + 1);
    out.push(entry.len() as u8);
    out.extend_from_slice(&entry);
    Ok(out)
}
