
pub(crate) mod task;

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet, VecDeque};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::{Duration, Instant};

use log::{debug, info, trace, warn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use shared::error::{Error, Result};
use shared::{TaggedBytesMut, TransportContext, TransportProtocol};

use crate::cache::DnsCache;
use crate::config::DnsSdConfig;
use crate::host::HostInfo;
use crate::message::builder::MessageBuilder;
use crate::message::name::names_equal;
use crate::message::question::Question;
use crate::message::record::{DnsRecord, RecordData};
use crate::message::{
    DnsType, Message, CLASS_IN, DNS_TTL, FLAGS_AA, FLAGS_QR_QUERY, FLAGS_QR_RESPONSE, FLAGS_TC,
};
use crate::service::ServiceInfo;
use crate::state::DnsState;
use task::{PendingQuery, Scheduler, Task, TaskId};

pub(crate) const MDNS_MULTICAST_IPV4: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 251);
pub const MDNS_PORT: u16 = 5353;
pub const MDNS_DEST_ADDR: SocketAddr =
    SocketAddr::new(IpAddr::V4(MDNS_MULTICAST_IPV4), MDNS_PORT);

/// Meta-query name under which every known service type is published.
pub const META_QUERY: &str = "_services._mdns._udp.local.";

const PROBE_WAIT_INTERVAL: Duration = Duration::from_millis(250);
const PROBE_CONFLICT_INTERVAL: Duration = Duration::from_millis(1000);
const PROBE_THROTTLE_COUNT: u32 = 10;
const PROBE_THROTTLE_COUNT_INTERVAL: Duration = Duration::from_millis(5000);
const ANNOUNCE_WAIT_INTERVAL: Duration = Duration::from_millis(1000);
const RESPONSE_MIN_WAIT_INTERVAL: u64 = 20;
const RESPONSE_MAX_WAIT_INTERVAL: u64 = 115;
const QUERY_WAIT_INTERVAL: Duration = Duration::from_millis(225);
const RECORD_REAPER_INTERVAL: Duration = Duration::from_millis(10_000);
// Re-announce at 50% of record lifetime.
const ANNOUNCED_RENEWAL_TTL_INTERVAL: Duration = Duration::from_millis(DNS_TTL as u64 * 500);
const DEFAULT_RESOLVE_TIMEOUT: Duration = Duration::from_secs(3);

const RESOLVER_ROUNDS: u8 = 3;
const CANCEL_ROUNDS: u8 = 2;

/// A service appearing, disappearing or resolving on the link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceEvent {
    pub service_type: String,
    /// Unqualified instance name.
    pub name: String,
    /// Present once the instance is fully resolved.
    pub info: Option<ServiceInfo>,
}

/// Events surfaced through `poll_event`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DnsSdEvent {
    /// A PTR record for a watched type appeared. The info is not
    /// resolved yet.
    ServiceAdded(ServiceEvent),
    /// A watched instance left the link or its records expired.
    ServiceRemoved(ServiceEvent),
    /// A requested instance is fully resolved.
    ServiceResolved(ServiceEvent),
    /// A resolve request ran out of time.
    ResolveTimeout(ServiceEvent),
    /// A new service type was observed (type listener active).
    ServiceTypeAdded(String),
    /// Goodbye rounds for this qualified name are done.
    ServiceUnregistered(String),
    /// We lost a probe tie-break and picked a new host name.
    HostNameChanged(String),
}

/// Sans-IO multicast DNS service discovery engine.
///
/// The engine consumes received datagrams via `handle_read`, produces
/// datagrams via `poll_write` and discovery events via `poll_event`,
/// and keeps its own timer wheel driven by `poll_timeout` /
/// `handle_timeout`.
pub struct DnsSd {
    host: HostInfo,
    cache: DnsCache,
    local_addr: SocketAddr,
    resolve_timeout: Duration,

    // Registered services, keyed by lowercase qualified name.
    services: HashMap<String, ServiceInfo>,
    // Observed service types, lowercase -> original spelling.
    service_types: HashMap<String, String>,
    // In-flight resolve placeholders, keyed by lowercase qualified name.
    resolvers: HashMap<String, ServiceInfo>,
    // Types with an active service listener, lowercase.
    watched_types: HashSet<String>,
    type_listening: bool,
    // Resolved instances accumulated per listed type.
    collectors: HashMap<String, HashMap<String, ServiceInfo>>,

    state: DnsState,
    host_task: Option<TaskId>,
    next_task_id: TaskId,
    throttle: u32,
    last_throttle_increment: Option<Instant>,
    // At most one truncated query waiting for its continuation.
    planned_answer: Option<PendingQuery>,

    scheduler: Scheduler,
    rng: StdRng,
    write_outs: VecDeque<TaggedBytesMut>,
    event_outs: VecDeque<DnsSdEvent>,
    closed: bool,
}

impl DnsSd {
    pub fn new(config: DnsSdConfig) -> Self {
        let now = Instant::now();
        let host = HostInfo::new(
            config.host_name.as_deref().unwrap_or("computer"),
            config.local_addr,
        );
        let local_addr = SocketAddr::new(
            config.local_addr.unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED)),
            MDNS_PORT,
        );
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };

        let mut engine = DnsSd {
            host,
            cache: DnsCache::new(),
            local_addr,
            resolve_timeout: config.resolve_timeout.unwrap_or(DEFAULT_RESOLVE_TIMEOUT),
            services: HashMap::new(),
            service_types: HashMap::new(),
            resolvers: HashMap::new(),
            watched_types: HashSet::new(),
            type_listening: false,
            collectors: HashMap::new(),
            state: DnsState::Probing1,
            host_task: None,
            next_task_id: 1,
            throttle: 0,
            last_throttle_increment: None,
            planned_answer: None,
            scheduler: Scheduler::new(),
            rng,
            write_outs: VecDeque::new(),
            event_outs: VecDeque::new(),
            closed: false,
        };
        info!("starting engine for {}", engine.host.name);
        engine.scheduler.schedule(now + RECORD_REAPER_INTERVAL, Task::Reaper);
        engine.start_prober(now);
        engine
    }

    /// Host name currently defended, `<label>.local.`.
    pub fn host_name(&self) -> &str {
        &self.host.name
    }

    pub fn state(&self) -> DnsState {
        self.state
    }

    /// Registers a service for advertisement. The instance name may be
    /// adjusted to avoid a known collision; the chosen qualified name
    /// is returned. Advertisement begins after probing completes.
    pub fn register_service(&mut self, mut info: ServiceInfo) -> Result<String> {
        if self.closed {
            return Err(Error::ErrEngineClosed);
        }
        let now = Instant::now();
        self.register_service_type_internal(&info.service_type.clone());
        self.make_host_name_unique(now);

        info.server = Some(self.host.name.clone());
        info.address = self.host.address;
        info.state = DnsState::Probing1;
        info.task = None;
        self.make_service_name_unique(&mut info, now);

        let qualified = info.qualified_name();
        self.services.insert(qualified.to_lowercase(), info);
        self.start_prober(now);
        info!("registered service {qualified}");
        Ok(qualified)
    }

    /// Starts goodbye rounds for one registered service. Completion is
    /// signalled by a `ServiceUnregistered` event.
    pub fn unregister_service(&mut self, qualified_name: &str) -> Result<()> {
        if self.closed {
            return Err(Error::ErrEngineClosed);
        }
        let mut info = self
            .services
            .remove(&qualified_name.to_lowercase())
            .ok_or(Error::ErrServiceNotRegistered)?;
        info.cancel();
        self.scheduler.schedule(
            Instant::now(),
            Task::Canceler {
                infos: vec![info],
                rounds: 0,
            },
        );
        Ok(())
    }

    /// Starts goodbye rounds for every registered service.
    pub fn unregister_all_services(&mut self) -> Result<()> {
        if self.closed {
            return Err(Error::ErrEngineClosed);
        }
        if self.services.is_empty() {
            return Ok(());
        }
        let mut infos: Vec<ServiceInfo> = self.services.drain().map(|(_, i)| i).collect();
        for info in &mut infos {
            info.cancel();
        }
        self.scheduler
            .schedule(Instant::now(), Task::Canceler { infos, rounds: 0 });
        Ok(())
    }

    /// Resolves one instance, reporting `ServiceResolved` or
    /// `ResolveTimeout` within `timeout`.
    pub fn get_service_info(
        &mut self,
        service_type: &str,
        name: &str,
        timeout: Duration,
    ) -> Result<()> {
        if self.closed {
            return Err(Error::ErrEngineClosed);
        }
        self.start_service_info_resolver(service_type, name, Instant::now(), timeout)
    }

    /// Like [`get_service_info`](DnsSd::get_service_info) with the
    /// configured default timeout, also recording the service type.
    pub fn request_service_info(&mut self, service_type: &str, name: &str) -> Result<()> {
        if self.closed {
            return Err(Error::ErrEngineClosed);
        }
        self.register_service_type_internal(service_type);
        self.start_service_info_resolver(service_type, name, Instant::now(), self.resolve_timeout)
    }

    /// Watches a service type, reporting `ServiceAdded` /
    /// `ServiceRemoved` as instances come and go. Already cached
    /// instances are replayed immediately.
    pub fn add_service_listener(&mut self, service_type: &str) -> Result<()> {
        if self.closed {
            return Err(Error::ErrEngineClosed);
        }
        if !service_type.ends_with('.') {
            return Err(Error::ErrServiceTypeSuffix);
        }
        let now = Instant::now();
        let lower = service_type.to_lowercase();
        if !self.watched_types.insert(lower) {
            return Ok(());
        }
        self.replay_cached_instances(service_type);
        self.scheduler.schedule(
            now,
            Task::ServiceResolver {
                service_type: service_type.to_owned(),
                rounds: 0,
            },
        );
        Ok(())
    }

    pub fn remove_service_listener(&mut self, service_type: &str) {
        self.watched_types.remove(&service_type.to_lowercase());
    }

    /// Watches for new service types on the link (`ServiceTypeAdded`).
    /// Already known types are replayed immediately.
    pub fn add_service_type_listener(&mut self) -> Result<()> {
        if self.closed {
            return Err(Error::ErrEngineClosed);
        }
        self.type_listening = true;
        let known: Vec<String> = self.service_types.values().cloned().collect();
        for ty in known {
            self.event_outs.push_back(DnsSdEvent::ServiceTypeAdded(ty));
        }
        self.scheduler
            .schedule(Instant::now(), Task::TypeResolver { rounds: 0 });
        Ok(())
    }

    pub fn remove_service_type_listener(&mut self) {
        self.type_listening = false;
    }

    /// Returns the resolved instances of a type collected so far,
    /// starting a background collector on first call. The first call
    /// usually returns an empty list; poll again after a couple of
    /// query rounds.
    pub fn list(&mut self, service_type: &str) -> Result<Vec<ServiceInfo>> {
        if self.closed {
            return Err(Error::ErrEngineClosed);
        }
        if !service_type.ends_with('.') {
            return Err(Error::ErrServiceTypeSuffix);
        }
        let now = Instant::now();
        let lower = service_type.to_lowercase();
        if !self.collectors.contains_key(&lower) {
            self.collectors.insert(lower.clone(), HashMap::new());
            self.replay_cached_instances(service_type);
            self.scheduler.schedule(
                now,
                Task::ServiceResolver {
                    service_type: service_type.to_owned(),
                    rounds: 0,
                },
            );
        }
        Ok(self
            .collectors
            .get(&lower)
            .map(|c| c.values().cloned().collect())
            .unwrap_or_default())
    }

    /// Drops all learned state and re-registers every service from
    /// scratch. Called by the driver after an I/O failure, and
    /// internally when a periodic task fails.
    pub fn recover(&mut self) {
        if self.closed {
            return;
        }
        warn!("recovering {}", self.host.name);
        let old: Vec<ServiceInfo> = self.services.drain().map(|(_, i)| i).collect();
        self.cache.clear();
        self.resolvers.clear();
        self.collectors.clear();
        self.planned_answer = None;
        self.scheduler.clear();
        self.write_outs.clear();
        self.host_task = None;
        self.state = DnsState::Probing1;

        let now = Instant::now();
        self.scheduler.schedule(now + RECORD_REAPER_INTERVAL, Task::Reaper);
        if old.is_empty() {
            self.start_prober(now);
        }
        for info in old {
            if let Err(e) = self.register_service(info) {
                warn!("recover: re-register failed: {e}");
            }
        }
    }

    fn alloc_task_id(&mut self) -> TaskId {
        let id = self.next_task_id;
        self.next_task_id += 1;
        id
    }

    fn clear_task(&mut self, id: TaskId) {
        if self.host_task == Some(id) {
            self.host_task = None;
        }
        for info in self.services.values_mut() {
            if info.task == Some(id) {
                info.task = None;
            }
        }
    }

    fn send_to(&mut self, out: MessageBuilder, dst: SocketAddr, now: Instant) {
        if out.is_empty() {
            return;
        }
        let message = out.finish();
        trace!("send {} bytes to {dst}", message.len());
        self.write_outs.push_back(TaggedBytesMut {
            now,
            transport: TransportContext {
                local_addr: self.local_addr,
                peer_addr: dst,
                transport_protocol: TransportProtocol::UDP,
            },
            message,
        });
    }

    fn send_multicast(&mut self, out: MessageBuilder, now: Instant) {
        self.send_to(out, MDNS_DEST_ADDR, now);
    }

    fn register_service_type_internal(&mut self, service_type: &str) {
        let lower = service_type.to_lowercase();
        if lower.contains("._mdns._udp.") || lower.ends_with(".in-addr.arpa.") {
            return;
        }
        if self.service_types.contains_key(&lower) {
            return;
        }
        debug!("new service type {service_type}");
        self.service_types.insert(lower, service_type.to_owned());
        if self.type_listening {
            self.event_outs
                .push_back(DnsSdEvent::ServiceTypeAdded(service_type.to_owned()));
        }
    }

    // Replay cached SRV records of a type as ServiceAdded events, the
    // way a listener attached late sees existing instances.
    fn replay_cached_instances(&mut self, service_type: &str) {
        let mut events = vec![];
        for rec in self.cache.iter() {
            if rec.record_type() == DnsType::Srv
                && rec
                    .name
                    .to_lowercase()
                    .ends_with(&service_type.to_lowercase())
            {
                events.push(DnsSdEvent::ServiceAdded(ServiceEvent {
                    service_type: service_type.to_owned(),
                    name: unqualified_name(&rec.name, service_type),
                    info: None,
                }));
            }
        }
        self.event_outs.extend(events);
    }

    // Picks a new host name while the cache knows an unexpired address
    // record under our name with someone else's address.
    fn make_host_name_unique(&mut self, now: Instant) {
        loop {
            let taken = self.cache.iter_name(&self.host.name).any(|rec| {
                matches!(rec.data, RecordData::A(_) | RecordData::Aaaa(_))
                    && !rec.is_expired(now)
                    && self
                        .host
                        .address_record(now)
                        .is_some_and(|ours| !ours.same_value(rec))
            });
            if !taken {
                return;
            }
            let renamed = self.host.increment_name().to_owned();
            info!("host name taken, trying {renamed}");
            self.event_outs
                .push_back(DnsSdEvent::HostNameChanged(renamed));
        }
    }

    // Picks a fresh instance name while the cache or our own table
    // already has this qualified name bound elsewhere.
    fn make_service_name_unique(&mut self, info: &mut ServiceInfo, now: Instant) {
        loop {
            let qualified = info.qualified_name();
            let lower = qualified.to_lowercase();
            let cache_collision = self.cache.iter_name(&qualified).any(|rec| {
                if rec.is_expired(now) {
                    return false;
                }
                match &rec.data {
                    RecordData::Srv { port, target, .. } => {
                        *port != info.port || !names_equal(target, &self.host.name)
                    }
                    _ => false,
                }
            });
            let local_collision = self.services.contains_key(&lower);
            if !cache_collision && !local_collision {
                return;
            }
            info.name = increment_name(&info.name);
            debug!("service name taken, trying {}", info.qualified_name());
        }
    }

    fn start_prober(&mut self, now: Instant) {
        let id = self.alloc_task_id();
        let mut claimed = false;
        if self.state == DnsState::Probing1 && self.host_task.is_none() {
            self.host_task = Some(id);
            claimed = true;
        }
        for info in self.services.values_mut() {
            if info.state == DnsState::Probing1 && info.task.is_none() {
                info.task = Some(id);
                claimed = true;
            }
        }
        if !claimed {
            return;
        }

        if self
            .last_throttle_increment
            .is_some_and(|t| now.duration_since(t) < PROBE_THROTTLE_COUNT_INTERVAL)
        {
            self.throttle += 1;
        } else {
            self.throttle = 1;
        }
        self.last_throttle_increment = Some(now);

        let delay = if self.throttle < PROBE_THROTTLE_COUNT {
            Duration::from_millis(
                self.rng
                    .random_range(0..=PROBE_WAIT_INTERVAL.as_millis() as u64),
            )
        } else {
            PROBE_CONFLICT_INTERVAL
        };
        self.scheduler.schedule(
            now + delay,
            Task::Prober {
                id,
                phase: DnsState::Probing1,
            },
        );
    }

    fn start_announcer(&mut self, now: Instant) {
        let id = self.alloc_task_id();
        let mut claimed = false;
        if self.state == DnsState::Announcing1 && self.host_task.is_none() {
            self.host_task = Some(id);
            claimed = true;
        }
        for info in self.services.values_mut() {
            if info.state == DnsState::Announcing1 && info.task.is_none() {
                info.task = Some(id);
                claimed = true;
            }
        }
        if claimed {
            self.scheduler.schedule(
                now + ANNOUNCE_WAIT_INTERVAL,
                Task::Announcer {
                    id,
                    phase: DnsState::Announcing1,
                },
            );
        }
    }

    fn start_renewer(&mut self, now: Instant) {
        let id = self.alloc_task_id();
        let mut claimed = false;
        if self.state.is_announced() && self.host_task.is_none() {
            self.host_task = Some(id);
            claimed = true;
        }
        for info in self.services.values_mut() {
            if info.state.is_announced() && info.task.is_none() {
                info.task = Some(id);
                claimed = true;
            }
        }
        if claimed {
            self.scheduler
                .schedule(now + ANNOUNCED_RENEWAL_TTL_INTERVAL, Task::Renewer { id });
        }
    }

    fn start_service_info_resolver(
        &mut self,
        service_type: &str,
        name: &str,
        now: Instant,
        timeout: Duration,
    ) -> Result<()> {
        let placeholder = ServiceInfo::discovery(service_type, name)?;
        let key = placeholder.qualified_name().to_lowercase();
        if self.resolvers.contains_key(&key) {
            return Ok(());
        }
        self.resolvers.insert(key.clone(), placeholder);
        self.scheduler.schedule(
            now,
            Task::ServiceInfoResolver {
                key: key.clone(),
                rounds: 0,
            },
        );
        self.scheduler
            .schedule(now + timeout, Task::ResolveDeadline { key });
        Ok(())
    }

    fn fire(&mut self, task: Task, now: Instant) {
        let result = match task {
            Task::Prober { id, phase } => self.fire_prober(id, phase, now),
            Task::Announcer { id, phase } => self.fire_announcer(id, phase, now),
            Task::Renewer { id } => self.fire_renewer(id, now),
            Task::Responder { query } => self.fire_responder(query, now),
            Task::Canceler { infos, rounds } => self.fire_canceler(infos, rounds, now),
            Task::Reaper => self.fire_reaper(now),
            Task::ServiceInfoResolver { key, rounds } => {
                self.fire_service_info_resolver(key, rounds, now)
            }
            Task::ResolveDeadline { key } => self.fire_resolve_deadline(key),
            Task::ServiceResolver {
                service_type,
                rounds,
            } => self.fire_service_resolver(service_type, rounds, now),
            Task::TypeResolver { rounds } => self.fire_type_resolver(rounds, now),
        };
        if let Err(e) = result {
            warn!("periodic task failed: {e}");
            self.recover();
        }
    }

    // One probe round: ask ANY for every owned name, carrying the
    // records we intend to publish in the authority section.
    fn fire_prober(&mut self, id: TaskId, phase: DnsState, now: Instant) -> Result<()> {
        let host_name = self.host.name.clone();
        let mut out = MessageBuilder::new(FLAGS_QR_QUERY);
        // All questions must precede the authority section, so records the
        // walk produces are held back until every question is written.
        let mut authorities = Vec::new();
        let mut owned = false;

        if self.state == phase && self.host_task == Some(id) {
            out.add_question(&Question::new(host_name.clone(), DnsType::Any, CLASS_IN))?;
            if let Some(rec) = self.host.address_record(now) {
                authorities.push(rec);
            }
            self.state = self.state.advance();
            owned = true;
        }
        let keys: Vec<String> = self.services.keys().cloned().collect();
        for key in keys {
            let Some(info) = self.services.get_mut(&key) else {
                continue;
            };
            if info.state == phase && info.task == Some(id) {
                info.advance_state();
                let question = Question::new(info.qualified_name(), DnsType::Any, CLASS_IN);
                out.add_question(&question)?;
                authorities.push(info.srv_record(&host_name, now, DNS_TTL, false));
                owned = true;
            }
        }
        for rec in &authorities {
            out.add_authoritative_answer(rec)?;
        }

        if !owned {
            // another task already walked these entities forward
            self.clear_task(id);
            return Ok(());
        }
        debug!("probing {host_name} ({phase})");
        self.send_multicast(out, now);

        let next = phase.advance();
        if next.is_probing() {
            self.scheduler
                .schedule(now + PROBE_WAIT_INTERVAL, Task::Prober { id, phase: next });
        } else {
            self.clear_task(id);
            self.start_announcer(now);
        }
        Ok(())
    }

    // One announce round: authoritative response with our address and
    // each owned service's PTR+SRV+TXT triple.
    fn fire_announcer(&mut self, id: TaskId, phase: DnsState, now: Instant) -> Result<()> {
        let host_name = self.host.name.clone();
        let mut out = MessageBuilder::new(FLAGS_QR_RESPONSE | FLAGS_AA);
        let mut owned = false;

        if self.state == phase && self.host_task == Some(id) {
            if let Some(rec) = self.host.address_record(now) {
                out.add_answer(&rec, None)?;
            }
            self.state = self.state.advance();
            owned = true;
        }
        let keys: Vec<String> = self.services.keys().cloned().collect();
        for key in keys {
            let Some(info) = self.services.get_mut(&key) else {
                continue;
            };
            if info.state == phase && info.task == Some(id) {
                info.advance_state();
                let ptr = info.ptr_record(now, DNS_TTL);
                let srv = info.srv_record(&host_name, now, DNS_TTL, true);
                let txt = info.txt_record(now, DNS_TTL, true);
                out.add_answer(&ptr, None)?;
                out.add_answer(&srv, None)?;
                out.add_answer(&txt, None)?;
                owned = true;
            }
        }

        if !owned {
            self.clear_task(id);
            return Ok(());
        }
        debug!("announcing {host_name} ({phase})");
        self.send_multicast(out, now);

        let next = phase.advance();
        if next.is_announcing() {
            self.scheduler.schedule(
                now + ANNOUNCE_WAIT_INTERVAL,
                Task::Announcer { id, phase: next },
            );
        } else {
            self.clear_task(id);
            self.start_renewer(now);
        }
        Ok(())
    }

    // Re-announce everything still owned and announced, halfway through
    // the record lifetime.
    fn fire_renewer(&mut self, id: TaskId, now: Instant) -> Result<()> {
        let host_name = self.host.name.clone();
        let mut out = MessageBuilder::new(FLAGS_QR_RESPONSE | FLAGS_AA);
        let mut owned = false;

        if self.state.is_announced() && self.host_task == Some(id) {
            if let Some(rec) = self.host.address_record(now) {
                out.add_answer(&rec, None)?;
            }
            owned = true;
        }
        let keys: Vec<String> = self.services.keys().cloned().collect();
        for key in keys {
            let Some(info) = self.services.get(&key) else {
                continue;
            };
            if info.state.is_announced() && info.task == Some(id) {
                let ptr = info.ptr_record(now, DNS_TTL);
                let srv = info.srv_record(&host_name, now, DNS_TTL, true);
                let txt = info.txt_record(now, DNS_TTL, true);
                out.add_answer(&ptr, None)?;
                out.add_answer(&srv, None)?;
                out.add_answer(&txt, None)?;
                owned = true;
            }
        }

        if !owned {
            self.clear_task(id);
            return Ok(());
        }
        debug!("renewing announcements for {host_name}");
        self.send_multicast(out, now);
        self.scheduler
            .schedule(now + ANNOUNCED_RENEWAL_TTL_INTERVAL, Task::Renewer { id });
        Ok(())
    }

    // Goodbye round: TTL 0 for everything the cancelled services
    // published, repeated CANCEL_ROUNDS times.
    fn fire_canceler(
        &mut self,
        infos: Vec<ServiceInfo>,
        rounds: u8,
        now: Instant,
    ) -> Result<()> {
        let host_name = self.host.name.clone();
        let mut out = MessageBuilder::new(FLAGS_QR_RESPONSE | FLAGS_AA);
        for info in &infos {
            out.add_answer(&info.ptr_record(now, 0), None)?;
            out.add_answer(&info.srv_record(&host_name, now, 0, false), None)?;
            out.add_answer(&info.txt_record(now, 0, false), None)?;
        }
        if let Some(mut rec) = self.host.address_record(now) {
            rec.ttl = 0;
            rec.unique = false;
            out.add_answer(&rec, None)?;
        }
        self.send_multicast(out, now);

        let rounds = rounds + 1;
        if rounds < CANCEL_ROUNDS {
            self.scheduler
                .schedule(now + ANNOUNCE_WAIT_INTERVAL, Task::Canceler { infos, rounds });
        } else {
            for info in infos {
                info!("unregistered service {}", info.qualified_name());
                self.event_outs
                    .push_back(DnsSdEvent::ServiceUnregistered(info.qualified_name()));
            }
        }
        Ok(())
    }

    // Sweep expired records out of the cache, fanning each removal out
    // to listeners.
    fn fire_reaper(&mut self, now: Instant) -> Result<()> {
        let expired = self.cache.take_expired(now);
        for rec in &expired {
            trace!("reaping {rec}");
            self.update_record(now, rec);
        }
        self.scheduler
            .schedule(now + RECORD_REAPER_INTERVAL, Task::Reaper);
        Ok(())
    }

    // Answer a received query once its response delay elapsed.
    fn fire_responder(&mut self, query: Option<PendingQuery>, now: Instant) -> Result<()> {
        let pending = match query {
            Some(q) => Some(q),
            None => self.planned_answer.take(),
        };
        let Some(pending) = pending else {
            return Ok(());
        };
        if !self.state.is_announced() {
            return Ok(());
        }

        let unicast = pending.src.port() != MDNS_PORT;
        let mut answers: Vec<DnsRecord> = vec![];
        for question in &pending.msg.questions {
            self.collect_answers(question, now, &mut answers);
        }

        if answers.is_empty() {
            return Ok(());
        }

        // Known-answer suppression across every record the query (and
        // its continuations) carried.
        let known: Vec<DnsRecord> = pending.msg.all_records().cloned().collect();
        let dst = if unicast { pending.src } else { MDNS_DEST_ADDR };
        let mut out = self.response_builder(&pending, unicast)?;
        for rec in &answers {
            if let Err(Error::ErrBufferFull) = out.add_answer_suppressed(&known, rec) {
                // flush what fits as a truncated message, continue in a
                // fresh one
                out.flags |= FLAGS_TC;
                self.send_to(out, dst, now);
                out = self.response_builder(&pending, unicast)?;
                out.add_answer_suppressed(&known, rec)?;
            }
        }
        if out.num_answers > 0 {
            debug!(
                "responding with {} answers to {}",
                out.num_answers, pending.src
            );
            self.send_to(out, dst, now);
        }
        Ok(())
    }

    fn response_builder(&self, pending: &PendingQuery, unicast: bool) -> Result<MessageBuilder> {
        let mut out = if unicast {
            let mut b = MessageBuilder::unicast(FLAGS_QR_RESPONSE | FLAGS_AA);
            b.id = pending.msg.header.id;
            b
        } else {
            MessageBuilder::new(FLAGS_QR_RESPONSE | FLAGS_AA)
        };
        if unicast {
            // unicast responses must repeat the questions they answer
            for question in &pending.msg.questions {
                out.add_question(question)?;
            }
        }
        Ok(out)
    }

    fn collect_answers(&self, question: &Question, now: Instant, answers: &mut Vec<DnsRecord>) {
        fn push(answers: &mut Vec<DnsRecord>, rec: DnsRecord) {
            if !answers.iter().any(|a| a.same_as(&rec)) {
                answers.push(rec);
            }
        }
        fn push_opt(answers: &mut Vec<DnsRecord>, rec: Option<DnsRecord>) {
            if let Some(rec) = rec {
                push(answers, rec);
            }
        }

        let mut typ = question.typ;
        if matches!(typ, DnsType::Any | DnsType::Srv) {
            if names_equal(&question.name, &self.host.name) {
                push_opt(answers, self.host.address_record(now));
                return;
            }
            if self
                .service_types
                .contains_key(&question.name.to_lowercase())
            {
                typ = DnsType::Ptr;
            }
        }

        match typ {
            DnsType::A | DnsType::Aaaa => {
                push_opt(answers, self.host.record_for(typ, now));
            }
            DnsType::Ptr => {
                for info in self.services.values() {
                    if info.state.is_announced()
                        && names_equal(&question.name, &info.service_type)
                    {
                        push_opt(answers, self.host.address_record(now));
                        push(answers, info.ptr_record(now, DNS_TTL));
                        push(answers, info.srv_record(&self.host.name, now, DNS_TTL, true));
                        push(answers, info.txt_record(now, DNS_TTL, true));
                    }
                }
                if names_equal(&question.name, META_QUERY) {
                    for ty in self.service_types.values() {
                        push(
                            answers,
                            DnsRecord::new(
                                META_QUERY,
                                CLASS_IN,
                                false,
                                DNS_TTL,
                                now,
                                RecordData::Ptr { alias: ty.clone() },
                            ),
                        );
                    }
                }
            }
            DnsType::Srv | DnsType::Txt | DnsType::Any => {
                if let Some(info) = self.services.get(&question.name.to_lowercase()) {
                    if info.state.is_announced() {
                        push_opt(answers, self.host.address_record(now));
                        push(answers, info.ptr_record(now, DNS_TTL));
                        push(answers, info.srv_record(&self.host.name, now, DNS_TTL, true));
                        push(answers, info.txt_record(now, DNS_TTL, true));
                    }
                }
            }
            _ => {}
        }
    }

    fn fire_service_info_resolver(&mut self, key: String, rounds: u8, now: Instant) -> Result<()> {
        let Some(info) = self.resolvers.get(&key) else {
            return Ok(());
        };
        if info.has_data() {
            self.resolvers.remove(&key);
            return Ok(());
        }
        if !self.state.is_announced() {
            // engine still settling, try again shortly
            self.scheduler.schedule(
                now + QUERY_WAIT_INTERVAL,
                Task::ServiceInfoResolver { key, rounds },
            );
            return Ok(());
        }
        if rounds >= RESOLVER_ROUNDS {
            // stop querying; the resolve deadline decides the outcome
            return Ok(());
        }

        let qualified = info.qualified_name();
        let server = info.server.clone();
        let mut out = MessageBuilder::new(FLAGS_QR_QUERY);
        out.add_question(&Question::new(qualified.clone(), DnsType::Srv, CLASS_IN))?;
        out.add_question(&Question::new(qualified.clone(), DnsType::Txt, CLASS_IN))?;
        if let Some(server) = &server {
            out.add_question(&Question::new(server.clone(), DnsType::A, CLASS_IN))?;
        }

        let mut known: Vec<DnsRecord> = self
            .cache
            .iter_name(&qualified)
            .filter(|r| matches!(r.record_type(), DnsType::Srv | DnsType::Txt))
            .cloned()
            .collect();
        if let Some(server) = &server {
            known.extend(
                self.cache
                    .iter_name(server)
                    .filter(|r| r.record_type() == DnsType::A)
                    .cloned(),
            );
        }
        for rec in &known {
            out.add_answer(rec, Some(now))?;
        }

        self.send_multicast(out, now);
        self.scheduler.schedule(
            now + QUERY_WAIT_INTERVAL,
            Task::ServiceInfoResolver {
                key,
                rounds: rounds + 1,
            },
        );
        Ok(())
    }

    fn fire_resolve_deadline(&mut self, key: String) -> Result<()> {
        if let Some(info) = self.resolvers.remove(&key) {
            if !info.has_data() {
                debug!("resolve timed out for {}", info.qualified_name());
                self.event_outs
                    .push_back(DnsSdEvent::ResolveTimeout(ServiceEvent {
                        service_type: info.service_type.clone(),
                        name: info.name.clone(),
                        info: None,
                    }));
            }
        }
        Ok(())
    }

    fn fire_service_resolver(
        &mut self,
        service_type: String,
        rounds: u8,
        now: Instant,
    ) -> Result<()> {
        let lower = service_type.to_lowercase();
        if !self.watched_types.contains(&lower) && !self.collectors.contains_key(&lower) {
            return Ok(());
        }
        if !self.state.is_announced() {
            self.scheduler.schedule(
                now + QUERY_WAIT_INTERVAL,
                Task::ServiceResolver {
                    service_type,
                    rounds,
                },
            );
            return Ok(());
        }

        let mut out = MessageBuilder::new(FLAGS_QR_QUERY);
        out.add_question(&Question::new(service_type.clone(), DnsType::Ptr, CLASS_IN))?;
        let known: Vec<DnsRecord> = self
            .cache
            .iter_name(&service_type)
            .filter(|r| r.record_type() == DnsType::Ptr)
            .cloned()
            .collect();
        for rec in &known {
            out.add_answer(rec, Some(now))?;
        }
        self.send_multicast(out, now);

        let rounds = rounds + 1;
        if rounds < RESOLVER_ROUNDS {
            self.scheduler.schedule(
                now + QUERY_WAIT_INTERVAL,
                Task::ServiceResolver {
                    service_type,
                    rounds,
                },
            );
        }
        Ok(())
    }

    fn fire_type_resolver(&mut self, rounds: u8, now: Instant) -> Result<()> {
        if !self.type_listening {
            return Ok(());
        }
        if !self.state.is_announced() {
            self.scheduler
                .schedule(now + QUERY_WAIT_INTERVAL, Task::TypeResolver { rounds });
            return Ok(());
        }

        let mut out = MessageBuilder::new(FLAGS_QR_QUERY);
        out.add_question(&Question::new(META_QUERY, DnsType::Ptr, CLASS_IN))?;
        let known: Vec<DnsRecord> = self
            .service_types
            .values()
            .map(|ty| {
                DnsRecord::new(
                    META_QUERY,
                    CLASS_IN,
                    false,
                    DNS_TTL,
                    now,
                    RecordData::Ptr { alias: ty.clone() },
                )
            })
            .collect();
        for rec in &known {
            out.add_answer(rec, Some(now))?;
        }
        self.send_multicast(out, now);

        let rounds = rounds + 1;
        if rounds < RESOLVER_ROUNDS {
            self.scheduler
                .schedule(now + QUERY_WAIT_INTERVAL, Task::TypeResolver { rounds });
        }
        Ok(())
    }

    fn handle_query_message(&mut self, msg: Message, src: SocketAddr, now: Instant) {
        let mut conflict = false;
        let records: Vec<DnsRecord> = msg.all_records().cloned().collect();
        for rec in &records {
            conflict |= self.conflict_check(rec, now, true);
        }

        if let Some(planned) = &mut self.planned_answer {
            // continuation of a truncated query
            planned.msg.append(msg);
        } else {
            let truncated = msg.is_truncated();
            let delay = self.response_delay(&msg, truncated);
            let pending = PendingQuery { msg, src };
            let query = if truncated {
                self.planned_answer = Some(pending);
                None
            } else {
                Some(pending)
            };
            self.scheduler
                .schedule(now + delay, Task::Responder { query });
        }

        if conflict {
            self.start_prober(now);
        }
    }

    // Zero delay when no other host could answer any of the questions,
    // otherwise random jitter so simultaneous responders spread out.
    fn response_delay(&mut self, msg: &Message, truncated: bool) -> Duration {
        let sole_responder = msg.questions.iter().all(|q| {
            matches!(
                q.typ,
                DnsType::Srv | DnsType::Txt | DnsType::A | DnsType::Aaaa
            ) || names_equal(&q.name, &self.host.name)
                || self.services.contains_key(&q.name.to_lowercase())
        });
        if sole_responder && !truncated {
            Duration::ZERO
        } else {
            Duration::from_millis(
                self.rng
                    .random_range(RESPONSE_MIN_WAIT_INTERVAL..=RESPONSE_MAX_WAIT_INTERVAL),
            )
        }
    }

    fn handle_response_message(&mut self, msg: Message, now: Instant) {
        let mut conflict = false;
        let records: Vec<DnsRecord> = msg.all_records().cloned().collect();
        for mut rec in records {
            let mut informative = false;
            let expired = rec.is_expired(now);
            if let Some(cached) = self.cache.get_mut(&rec) {
                if expired {
                    informative = true;
                    let dead = cached.clone();
                    self.cache.remove(&dead);
                } else {
                    cached.reset_ttl(&rec);
                    rec = cached.clone();
                }
            } else if !expired {
                informative = true;
                self.cache.add(rec.clone());
            }

            if let RecordData::Ptr { alias } = &rec.data {
                if rec.name.to_lowercase().contains("._mdns._udp.") {
                    // type enumeration answers carry new types in the alias
                    if !expired && rec.name.to_lowercase().starts_with("_services._mdns._udp.") {
                        self.register_service_type_internal(alias);
                    }
                    continue;
                }
                let name = rec.name.clone();
                self.register_service_type_internal(&name);
            }

            conflict |= self.conflict_check(&rec, now, false);
            if informative {
                self.update_record(now, &rec);
            }
        }
        if conflict {
            self.start_prober(now);
        }
    }

    // Probe/denial conflict handling for records naming things we own.
    // Queries tie-break on the lexicographically greater record value;
    // responses are authoritative denials and always force a rename
    // while we are still probing.
    fn conflict_check(&mut self, rec: &DnsRecord, now: Instant, tie_break: bool) -> bool {
        match &rec.data {
            RecordData::A(_) | RecordData::Aaaa(_) => {
                let Some(ours) = self.host.record_for(rec.record_type(), now) else {
                    return false;
                };
                if !names_equal(&rec.name, &self.host.name) || ours.same_value(rec) {
                    return false;
                }
                debug!("conflicting host record {rec}");
                if self.state.is_probing()
                    && (!tie_break || rec.lex_cmp(&ours) != Ordering::Less)
                {
                    let renamed = self.host.increment_name().to_owned();
                    info!("lost probe for host name, now {renamed}");
                    self.cache.clear();
                    for info in self.services.values_mut() {
                        info.server = Some(renamed.clone());
                        info.revert_state();
                    }
                    self.event_outs
                        .push_back(DnsSdEvent::HostNameChanged(renamed));
                }
                self.state = self.state.revert();
                self.host_task = None;
                true
            }
            RecordData::Srv { port, target, .. } => {
                let host_name = self.host.name.clone();
                let key = rec.name.to_lowercase();
                let Some(info) = self.services.get(&key) else {
                    return false;
                };
                if *port == info.port && names_equal(target, &host_name) {
                    return false;
                }
                debug!("conflicting service record {rec}");
                let lost = info.state.is_probing()
                    && (!tie_break || {
                        let ours = info.srv_record(&host_name, now, DNS_TTL, true);
                        rec.lex_cmp(&ours) != Ordering::Less
                    });
                let Some(mut info) = self.services.remove(&key) else {
                    return false;
                };
                if lost {
                    info.name = increment_name(&info.name);
                    info!(
                        "lost probe for service name, now {}",
                        info.qualified_name()
                    );
                }
                info.revert_state();
                self.services.insert(info.qualified_name().to_lowercase(), info);
                true
            }
            _ => false,
        }
    }

    // Fan a new or expired record out to resolve placeholders, watched
    // types and collectors.
    fn update_record(&mut self, now: Instant, rec: &DnsRecord) {
        let keys: Vec<String> = self.resolvers.keys().cloned().collect();
        for key in keys {
            let Some(mut info) = self.resolvers.remove(&key) else {
                continue;
            };
            if info.update_record(&self.cache, now, rec) {
                debug!("resolved {}", info.qualified_name());
                if let Some(collected) =
                    self.collectors.get_mut(&info.service_type.to_lowercase())
                {
                    collected.insert(info.name.clone(), info.clone());
                }
                self.event_outs
                    .push_back(DnsSdEvent::ServiceResolved(ServiceEvent {
                        service_type: info.service_type.clone(),
                        name: info.name.clone(),
                        info: Some(info.clone()),
                    }));
            }
            self.resolvers.insert(key, info);
        }

        if let RecordData::Ptr { alias } = &rec.data {
            let lower = rec.name.to_lowercase();
            let watched =
                self.watched_types.contains(&lower) || self.collectors.contains_key(&lower);
            if !watched {
                return;
            }
            let name = unqualified_name(alias, &rec.name);
            let event = ServiceEvent {
                service_type: rec.name.clone(),
                name: name.clone(),
                info: None,
            };
            if rec.is_expired(now) {
                if let Some(collected) = self.collectors.get_mut(&lower) {
                    collected.remove(&name);
                }
                self.event_outs
                    .push_back(DnsSdEvent::ServiceRemoved(event));
            } else {
                self.event_outs.push_back(DnsSdEvent::ServiceAdded(event));
                if self.collectors.contains_key(&lower) {
                    // collectors resolve every instance they see
                    let ty = rec.name.clone();
                    if let Err(e) =
                        self.start_service_info_resolver(&ty, &name, now, self.resolve_timeout)
                    {
                        warn!("collector resolve failed: {e}");
                    }
                }
            }
        }
    }
}

fn increment_name(name: &str) -> String {
    if let (Some(l), Some(r)) = (name.rfind('('), name.rfind(')')) {
        if l < r {
            if let Ok(n) = name[l + 1..r].trim().parse::<u32>() {
                return format!("{}({})", &name[..l], n + 1);
            }
        }
    }
    format!("{name} (2)")
}

fn unqualified_name(qualified: &str, service_type: &str) -> String {
    if qualified.len() > service_type.len() {
        let cut = qualified.len() - service_type.len();
        if let (Some(head), Some(tail)) = (qualified.get(..cut), qualified.get(cut..)) {
            if tail.eq_ignore_ascii_case(service_type) && head.ends_with('.') {
                return head[..head.len() - 1].to_owned();
            }
        }
    }
    qualified.to_owned()
}

impl sansio::Protocol<TaggedBytesMut, (), ()> for DnsSd {
    type Rout = ();
    type Wout = TaggedBytesMut;
    type Eout = DnsSdEvent;
    type Error = Error;
    type Time = Instant;

    fn handle_read(&mut self, msg: TaggedBytesMut) -> Result<()> {
        if self.closed {
            return Err(Error::ErrEngineClosed);
        }
        let src = msg.transport.peer_addr;
        if self.host.should_ignore_packet(src.ip()) {
            trace!("ignoring looped-back packet from {src}");
            return Ok(());
        }
        let parsed = match Message::unpack(&msg.message, msg.now) {
            Ok(parsed) => parsed,
            Err(e) => {
                // a bad datagram never takes the engine down
                warn!("dropping malformed packet from {src}: {e}");
                return Ok(());
            }
        };
        if parsed.is_query() {
            self.handle_query_message(parsed, src, msg.now);
        } else {
            self.handle_response_message(parsed, msg.now);
        }
        Ok(())
    }

    fn poll_read(&mut self) -> Option<()> {
        None
    }

    fn handle_write(&mut self, _msg: ()) -> Result<()> {
        Ok(())
    }

    fn poll_write(&mut self) -> Option<TaggedBytesMut> {
        self.write_outs.pop_front()
    }

    fn handle_event(&mut self, _evt: ()) -> Result<()> {
        Ok(())
    }

    fn poll_event(&mut self) -> Option<DnsSdEvent> {
        self.event_outs.pop_front()
    }

    fn handle_timeout(&mut self, now: Instant) -> Result<()> {
        if self.closed {
            return Err(Error::ErrEngineClosed);
        }
        while let Some(task) = self.scheduler.pop_due(now) {
            self.fire(task, now);
        }
        Ok(())
    }

    fn poll_timeout(&mut self) -> Option<Instant> {
        if self.closed {
            None
        } else {
            self.scheduler.next_deadline()
        }
    }

    /// Sends a single best-effort goodbye for everything we advertised
    /// and drops all state. The goodbye datagram stays in the write
    /// queue for the driver to flush.
    fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        info!("closing engine for {}", self.host.name);
        let now = Instant::now();
        let infos: Vec<ServiceInfo> = self.services.drain().map(|(_, i)| i).collect();
        if !infos.is_empty() {
            // single immediate goodbye round; the scheduler is gone
            // after close so the repeat rounds cannot run
            let _ = self.fire_canceler(infos, CANCEL_ROUNDS - 1, now);
        }
        self.scheduler.clear();
        self.cache.clear();
        self.resolvers.clear();
        self.collectors.clear();
        self.planned_answer = None;
        self.state = DnsState::Canceled;
        self.closed = true;
        Ok(())
    }
}
