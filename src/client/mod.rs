//! Per-(service-type, socket) querier: listener registry, burst scheduler,
//! known-answer assembly, resolve mode and callback fan-out.
//!
//! Everything runs on the owning event loop. Listener callbacks are invoked
//! synchronously and must not call back into the client; post a task
//! instead.
use std::cell::RefCell;
use std::rc::Rc;

use log::debug;

use crate::cache::{CacheKey, CachedService, ServiceCache, SocketKey};
use crate::decoder::{CacheEventKind, ResponseDecoder};
use crate::deps::Clock;
use crate::name::DnsName;
use crate::network_order::{PacketWriter, ToNetworkOrder};
use crate::rfc6762::{
    MdnsPacket, MdnsQuestion, MdnsRecord, FLAG_TRUNCATED, MAX_MDNS_PACKET_SIZE, TYPE_A, TYPE_AAAA,
    TYPE_ANY, TYPE_PTR,
};

pub mod scheduler;

pub use scheduler::{QueryMode, QueryScheduler, DEFAULT_QUERIES_BEFORE_BACKOFF};

/// Discovery callbacks, all optional. `from_cache` marks replays synthesized
/// for a late subscriber rather than live network transitions.
pub trait DiscoveryListener {
    fn on_service_name_discovered(&self, _service: &CachedService, _from_cache: bool) {}
    fn on_service_found(&self, _service: &CachedService, _from_cache: bool) {}
    fn on_service_updated(&self, _service: &CachedService) {}
    fn on_service_removed(&self, _service: &CachedService) {}
    fn on_service_name_removed(&self, _service: &CachedService) {}
}

/// Per-listener restrictions and pacing choice.
#[derive(Clone, Default)]
pub struct SearchOptions {
    pub query_mode: QueryMode,
    /// restrict to (and actively resolve) one instance
    pub resolve_instance_name: Option<String>,
    /// restrict callbacks to instances advertising one of these subtypes
    pub subtypes: Vec<String>,
}

#[derive(Clone)]
struct ListenerEntry {
    listener: Rc<dyn DiscoveryListener>,
    options: SearchOptions,
}

/// Snapshot of the pending query task, mostly for diagnostics and tests.
#[derive(Debug, Clone, Copy)]
pub struct QueryTaskConfig {
    pub session_id: u64,
    pub scheduled_at_ms: Option<u64>,
    pub first_of_burst: bool,
    pub queries_sent: usize,
}

pub struct MdnsServiceTypeClient {
    cache_key: CacheKey,
    clock: Rc<dyn Clock>,
    decoder: ResponseDecoder,
    cache: Rc<RefCell<ServiceCache>>,
    listeners: Rc<RefCell<Vec<ListenerEntry>>>,
    scheduler: QueryScheduler,
    /// stale scheduled tasks compare against this and become no-ops
    session_id: u64,
    next_query_at_ms: Option<u64>,
}

impl MdnsServiceTypeClient {
    /// `service_type` is the full type name, e.g. `_http._tcp.local`.
    pub fn new(
        service_type: DnsName,
        socket: SocketKey,
        clock: Rc<dyn Clock>,
        cache: Rc<RefCell<ServiceCache>>,
    ) -> Self {
        let cache_key = CacheKey {
            service_type,
            socket,
        };
        let listeners: Rc<RefCell<Vec<ListenerEntry>>> = Rc::new(RefCell::new(Vec::new()));

        // TTL expiry surfaces as removal callbacks on matching listeners
        let expiry_listeners = listeners.clone();
        cache.borrow_mut().register_expired_callback(
            cache_key.clone(),
            Box::new(move |svc, _replacement| {
                for entry in expiry_listeners.borrow().iter() {
                    if listener_wants(&entry.options, svc) {
                        if svc.is_complete() {
                            entry.listener.on_service_removed(svc);
                        }
                        entry.listener.on_service_name_removed(svc);
                    }
                }
            }),
        );

        Self {
            cache_key,
            clock: clock.clone(),
            decoder: ResponseDecoder::new(clock),
            cache,
            listeners,
            scheduler: QueryScheduler::new(QueryMode::default(), DEFAULT_QUERIES_BEFORE_BACKOFF),
            session_id: 0,
            next_query_at_ms: None,
        }
    }

    pub fn service_type(&self) -> &DnsName {
        &self.cache_key.service_type
    }

    pub fn has_listeners(&self) -> bool {
        !self.listeners.borrow().is_empty()
    }

    /// Register a listener: replay the current cache for it, then (re)start
    /// the query schedule from the first burst.
    pub fn start_send_and_receive(
        &mut self,
        listener: Rc<dyn DiscoveryListener>,
        options: SearchOptions,
    ) {
        let snapshot: Vec<CachedService> = self
            .cache
            .borrow_mut()
            .get_all(&self.cache_key)
            .into_iter()
            .cloned()
            .collect();
        for svc in &snapshot {
            if listener_wants(&options, svc) {
                listener.on_service_name_discovered(svc, true);
                if svc.is_complete() {
                    listener.on_service_found(svc, true);
                }
            }
        }

        // the newest listener's mode drives the burst pacing
        self.scheduler.set_mode(options.query_mode);
        self.listeners
            .borrow_mut()
            .push(ListenerEntry { listener, options });

        self.scheduler.reset();
        self.session_id += 1;
        self.next_query_at_ms = Some(self.clock.elapsed_ms());
    }

    /// Deregister; the last listener leaving cancels the pending query.
    pub fn stop_send_and_receive(&mut self, listener: &Rc<dyn DiscoveryListener>) {
        self.listeners
            .borrow_mut()
            .retain(|e| !Rc::ptr_eq(&e.listener, listener));
        if self.listeners.borrow().is_empty() {
            self.session_id += 1;
            self.next_query_at_ms = None;
            debug!("last listener for {} gone, queries stopped", self.cache_key.service_type);
        }
    }

    /// Merge one inbound packet and fan the resulting transitions out to the
    /// listeners that asked for them.
    pub fn handle_response(&mut self, packet: &MdnsPacket) {
        let events = {
            let mut cache = self.cache.borrow_mut();
            self.decoder.augment_cache(packet, &mut cache, &self.cache_key)
        };

        let entries: Vec<ListenerEntry> = self.listeners.borrow().iter().cloned().collect();
        for event in &events {
            for entry in &entries {
                if !listener_wants(&entry.options, &event.service) {
                    continue;
                }
                match event.kind {
                    CacheEventKind::NameDiscovered => entry
                        .listener
                        .on_service_name_discovered(&event.service, false),
                    CacheEventKind::Found => {
                        entry.listener.on_service_found(&event.service, false)
                    }
                    CacheEventKind::Updated => {
                        entry.listener.on_service_updated(&event.service)
                    }
                    CacheEventKind::Removed => {
                        entry.listener.on_service_removed(&event.service);
                        entry.listener.on_service_name_removed(&event.service);
                    }
                }
            }
        }

        self.reschedule_after_response();
    }

    /// The socket is gone: withdraw every complete service, drop the slice,
    /// cancel scheduling.
    pub fn notify_socket_destroyed(&mut self) {
        let snapshot = self.cache.borrow_mut().clear_key(&self.cache_key);
        let entries: Vec<ListenerEntry> = self.listeners.borrow().iter().cloned().collect();
        for svc in &snapshot {
            if !svc.is_complete() {
                continue;
            }
            for entry in &entries {
                if listener_wants(&entry.options, svc) {
                    entry.listener.on_service_removed(svc);
                    entry.listener.on_service_name_removed(svc);
                }
            }
        }
        self.cache
            .borrow_mut()
            .unregister_expired_callback(&self.cache_key);
        self.session_id += 1;
        self.next_query_at_ms = None;
    }

    /// Absolute time the next query is due, on the engine clock.
    pub fn next_query_at(&self) -> Option<u64> {
        self.next_query_at_ms
    }

    pub fn session_id(&self) -> u64 {
        self.session_id
    }

    pub fn query_task_config(&self) -> QueryTaskConfig {
        QueryTaskConfig {
            session_id: self.session_id,
            scheduled_at_ms: self.next_query_at_ms,
            first_of_burst: self.scheduler.is_first_of_burst(),
            queries_sent: self.scheduler.queries_sent(),
        }
    }

    /// The query timer fired: build the packets to send (possibly split
    /// with TC over the MTU budget) and advance the schedule.
    pub fn on_query_timer(&mut self, session_id: u64) -> Vec<MdnsPacket> {
        if session_id != self.session_id {
            // canceled or rescheduled while queued
            return Vec::new();
        }
        if self.listeners.borrow().is_empty() {
            return Vec::new();
        }
        let now = self.clock.elapsed_ms();
        let mut questions = self.build_questions();
        if questions.is_empty() {
            return Vec::new();
        }

        // the first query of every burst asks for unicast replies
        let unicast = self.scheduler.is_first_of_burst();
        for q in &mut questions {
            q.unicast_reply = unicast;
        }

        let known_answers = self.known_answers(now);
        let packets = split_query(questions, known_answers);

        self.scheduler.record_sent();
        self.schedule_next(now);
        packets
    }

    // Union of the listeners' interests, deduplicated.
    fn build_questions(&self) -> Vec<MdnsQuestion> {
        let mut questions: Vec<MdnsQuestion> = Vec::new();
        let mut discovery = false;
        let mut subtypes: Vec<String> = Vec::new();

        for entry in self.listeners.borrow().iter() {
            match &entry.options.resolve_instance_name {
                Some(instance) => {
                    let name = match self.cache_key.service_type.prepended(instance) {
                        Ok(name) => name,
                        Err(_) => continue,
                    };
                    push_question(&mut questions, MdnsQuestion::new(name.clone(), TYPE_ANY));

                    // SRV in hand but no addresses yet: chase the target host
                    let mut cache = self.cache.borrow_mut();
                    if let Some(svc) = cache.get(&self.cache_key, &name) {
                        if let Some(target) = svc.target_host() {
                            if svc.v4_addrs.is_empty() && svc.v6_addrs.is_empty() {
                                let target = target.clone();
                                push_question(
                                    &mut questions,
                                    MdnsQuestion::new(target.clone(), TYPE_A),
                                );
                                push_question(
                                    &mut questions,
                                    MdnsQuestion::new(target, TYPE_AAAA),
                                );
                            }
                        }
                    }
                }
                None => {
                    discovery = true;
                    for sub in &entry.options.subtypes {
                        if !subtypes.iter().any(|s| s.eq_ignore_ascii_case(sub)) {
                            subtypes.push(sub.clone());
                        }
                    }
                }
            }
        }

        if discovery {
            push_question(
                &mut questions,
                MdnsQuestion::new(self.cache_key.service_type.clone(), TYPE_PTR),
            );
            for sub in &subtypes {
                let owner = self
                    .cache_key
                    .service_type
                    .prepended("_sub")
                    .and_then(|n| n.prepended(sub));
                if let Ok(owner) = owner {
                    push_question(&mut questions, MdnsQuestion::new(owner, TYPE_PTR));
                }
            }
        }

        questions
    }

    // Every cached answer still fresh enough to suppress (remaining TTL
    // above half), carrying its remaining TTL on the wire.
    fn known_answers(&self, now: u64) -> Vec<MdnsRecord> {
        let mut cache = self.cache.borrow_mut();
        let mut out = Vec::new();
        for svc in cache.get_all(&self.cache_key) {
            for rec in svc.records() {
                let remaining = rec.remaining_ttl_ms(now);
                if remaining * 2 > rec.ttl_ms {
                    let mut ka = rec.clone();
                    ka.ttl_ms = remaining;
                    out.push(ka);
                }
            }
        }
        out
    }

    fn schedule_next(&mut self, now: u64) {
        let mut delay = self.scheduler.next_delay_ms();
        if self.scheduler.backoff_engaged() {
            if let Some(min_ttl) = self
                .cache
                .borrow_mut()
                .min_remaining_ttl_ms(&self.cache_key)
            {
                delay = delay.max(min_ttl * 8 / 10);
            }
        }
        let mut at = now + delay;

        if let Some(renewal) = self.resolve_renewal_at() {
            let renewal = renewal.max(now);
            if self.all_listeners_resolved() {
                // nothing left to chase; wake up for the SRV renewal
                at = renewal;
            } else {
                at = at.min(renewal);
            }
        }
        self.next_query_at_ms = Some(at);
    }

    // A fresh response may push a backoff-driven task further out, or bring
    // a resolve renewal closer; either way the pending task is replaced.
    fn reschedule_after_response(&mut self) {
        let at = match self.next_query_at_ms {
            Some(at) => at,
            None => return,
        };
        let now = self.clock.elapsed_ms();
        let mut new_at = at;

        if self.scheduler.backoff_engaged() {
            if let Some(min_ttl) = self
                .cache
                .borrow_mut()
                .min_remaining_ttl_ms(&self.cache_key)
            {
                let candidate = now + min_ttl * 8 / 10;
                if candidate > new_at {
                    new_at = candidate;
                }
            }
        }
        if let Some(renewal) = self.resolve_renewal_at() {
            let renewal = renewal.max(now);
            if self.all_listeners_resolved() {
                new_at = renewal;
            } else {
                new_at = new_at.min(renewal);
            }
        }

        if new_at != at {
            self.session_id += 1;
            self.next_query_at_ms = Some(new_at);
            debug!("query task rescheduled to t+{}ms", new_at.saturating_sub(now));
        }
    }

    // earliest 75%-of-SRV-TTL renewal over the resolved instances
    fn resolve_renewal_at(&self) -> Option<u64> {
        let listeners = self.listeners.borrow();
        let mut cache = self.cache.borrow_mut();
        let mut earliest: Option<u64> = None;
        for entry in listeners.iter() {
            let instance = match &entry.options.resolve_instance_name {
                Some(name) => name,
                None => continue,
            };
            let name = match self.cache_key.service_type.prepended(instance) {
                Ok(name) => name,
                Err(_) => continue,
            };
            if let Some(svc) = cache.get(&self.cache_key, &name) {
                if !svc.is_complete() {
                    continue;
                }
                if let Some(srv) = &svc.srv {
                    let renewal = srv.received_at_ms + srv.ttl_ms * 3 / 4;
                    earliest = Some(earliest.map_or(renewal, |e: u64| e.min(renewal)));
                }
            }
        }
        earliest
    }

    fn all_listeners_resolved(&self) -> bool {
        let listeners = self.listeners.borrow();
        if listeners.is_empty() {
            return false;
        }
        let mut cache = self.cache.borrow_mut();
        listeners.iter().all(|entry| {
            let instance = match &entry.options.resolve_instance_name {
                Some(name) => name,
                None => return false,
            };
            match self.cache_key.service_type.prepended(instance) {
                Ok(name) => cache
                    .get(&self.cache_key, &name)
                    .map(|svc| svc.is_complete())
                    .unwrap_or(false),
                Err(_) => false,
            }
        })
    }
}

fn listener_wants(options: &SearchOptions, svc: &CachedService) -> bool {
    if let Some(instance) = &options.resolve_instance_name {
        let matches = svc
            .service_name
            .labels()
            .first()
            .map(|l| l.eq_ignore_ascii_case(instance))
            .unwrap_or(false);
        if !matches {
            return false;
        }
    }
    if !options.subtypes.is_empty() {
        let observed = svc.subtypes();
        if !options
            .subtypes
            .iter()
            .any(|s| observed.iter().any(|o| o.eq_ignore_ascii_case(s)))
        {
            return false;
        }
    }
    true
}

fn push_question(questions: &mut Vec<MdnsQuestion>, q: MdnsQuestion) {
    let dup = questions
        .iter()
        .any(|e| e.qtype == q.qtype && e.name.equals_ignore_case(&q.name));
    if !dup {
        questions.push(q);
    }
}

// Greedy MTU packing: trial-serialize into the budget, and when a known
// answer no longer fits, close the packet with TC set and continue in a
// questionless follow-up (RFC 6762 §7.2).
fn split_query(questions: Vec<MdnsQuestion>, known_answers: Vec<MdnsRecord>) -> Vec<MdnsPacket> {
    let mut packets = Vec::new();
    let mut current = MdnsPacket::query();
    current.questions = questions;

    let mut writer = PacketWriter::with_limit(MAX_MDNS_PACKET_SIZE);
    let _ = current.to_network_bytes(&mut writer);

    for rec in known_answers {
        let mark = writer.mark();
        match rec.to_network_bytes(&mut writer) {
            Ok(_) => current.answers.push(rec),
            Err(_) => {
                writer.rewind(mark);
                current.flags |= FLAG_TRUNCATED;
                packets.push(std::mem::replace(&mut current, MdnsPacket::query()));

                writer = PacketWriter::with_limit(MAX_MDNS_PACKET_SIZE);
                let _ = current.to_network_bytes(&mut writer);
                let _ = rec.to_network_bytes(&mut writer);
                current.answers.push(rec);
            }
        }
    }
    packets.push(current);
    packets
}
