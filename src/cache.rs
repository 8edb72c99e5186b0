//! TTL-indexed store of remote services, keyed by (service type, socket).
//!
//! Every slice is kept sorted by expiry time, earliest first, so the lazy
//! expiry scan in each accessor only ever looks at the head. Expired entries
//! are handed to the per-key callback as they are dropped.
use std::collections::HashMap;
use std::net::IpAddr;
use std::rc::Rc;

use log::debug;

use crate::deps::Clock;
use crate::name::DnsName;
use crate::rfc6762::{MdnsRecord, RData};

/// Identifies the socket a response arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SocketKey {
    pub network_handle: Option<i64>,
    pub interface_index: u32,
}

/// Cache partition key: one slice per (service type, socket).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub service_type: DnsName,
    pub socket: SocketKey,
}

/// How `add_record` changed a cached service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordChange {
    /// identical content and receipt time
    Unchanged,
    /// identical content, newer receipt time
    Refreshed,
    /// a record this service did not have before
    Added,
    /// same slot, different rdata or TTL
    Replaced,
}

impl RecordChange {
    pub fn is_visible(&self) -> bool {
        matches!(self, RecordChange::Added | RecordChange::Replaced)
    }
}

/// All records known for one remote service instance, merged from possibly
/// many response packets.
#[derive(Debug, Clone, Default)]
pub struct CachedService {
    pub service_name: DnsName,
    pub socket: Option<SocketKey>,
    pub ptr_records: Vec<MdnsRecord>,
    pub subtype_ptrs: Vec<MdnsRecord>,
    pub srv: Option<MdnsRecord>,
    pub txt: Option<MdnsRecord>,
    pub v4_addrs: Vec<MdnsRecord>,
    pub v6_addrs: Vec<MdnsRecord>,
    pub key_record: Option<MdnsRecord>,
}

impl CachedService {
    pub fn new(service_name: DnsName, socket: SocketKey) -> Self {
        Self {
            service_name,
            socket: Some(socket),
            ..Default::default()
        }
    }

    /// SRV, TXT and at least one address are known.
    pub fn is_complete(&self) -> bool {
        self.srv.is_some()
            && self.txt.is_some()
            && (!self.v4_addrs.is_empty() || !self.v6_addrs.is_empty())
    }

    pub fn port(&self) -> Option<u16> {
        match &self.srv {
            Some(rec) => match &rec.rdata {
                RData::Srv(srv) => Some(srv.port),
                _ => None,
            },
            None => None,
        }
    }

    pub fn target_host(&self) -> Option<&DnsName> {
        match &self.srv {
            Some(rec) => match &rec.rdata {
                RData::Srv(srv) => Some(&srv.target),
                _ => None,
            },
            None => None,
        }
    }

    pub fn addresses(&self) -> Vec<IpAddr> {
        let mut out = Vec::new();
        for rec in self.v4_addrs.iter().chain(self.v6_addrs.iter()) {
            match &rec.rdata {
                RData::A(a) => out.push(IpAddr::V4(*a)),
                RData::Aaaa(a) => out.push(IpAddr::V6(*a)),
                _ => {}
            }
        }
        out
    }

    /// Subtype labels observed for this instance (the first label of each
    /// subtype PTR owner name).
    pub fn subtypes(&self) -> Vec<String> {
        self.subtype_ptrs
            .iter()
            .filter_map(|r| r.name.labels().first().cloned())
            .collect()
    }

    pub fn txt_entries(&self) -> &[crate::rfc6762::TxtEntry] {
        match &self.txt {
            Some(rec) => match &rec.rdata {
                RData::Txt(entries) => entries,
                _ => &[],
            },
            None => &[],
        }
    }

    /// Earliest expiry over all records; the slice ordering key.
    pub fn expires_at_ms(&self) -> u64 {
        let mut earliest = u64::MAX;
        for rec in self.records() {
            earliest = earliest.min(rec.expires_at_ms());
        }
        earliest
    }

    pub fn records(&self) -> impl Iterator<Item = &MdnsRecord> {
        self.ptr_records
            .iter()
            .chain(self.subtype_ptrs.iter())
            .chain(self.srv.iter())
            .chain(self.txt.iter())
            .chain(self.v4_addrs.iter())
            .chain(self.v6_addrs.iter())
            .chain(self.key_record.iter())
    }

    /// Merge one record. Identical content with the same receipt time is a
    /// no-op; identical content with a newer receipt time refreshes in
    /// place; same slot with different rdata or TTL replaces. A replaced SRV
    /// whose target moved drops every address record, they belonged to the
    /// old host.
    pub fn add_record(&mut self, rec: MdnsRecord) -> RecordChange {
        match &rec.rdata {
            RData::Srv(new_srv) => {
                let target_changed = match self.target_host() {
                    Some(old) => !old.equals_ignore_case(&new_srv.target),
                    None => false,
                };
                let change = merge_single(&mut self.srv, rec);
                if change.is_visible() && target_changed {
                    self.v4_addrs.clear();
                    self.v6_addrs.clear();
                }
                change
            }
            RData::Txt(_) => merge_single(&mut self.txt, rec),
            RData::Key(_) => merge_single(&mut self.key_record, rec),
            RData::A(_) => {
                if rec.cache_flush {
                    flush_stale(&mut self.v4_addrs, &rec);
                }
                merge_list(&mut self.v4_addrs, rec)
            }
            RData::Aaaa(_) => {
                if rec.cache_flush {
                    flush_stale(&mut self.v6_addrs, &rec);
                }
                merge_list(&mut self.v6_addrs, rec)
            }
            RData::Ptr(_) => {
                // subtype PTRs are distinguished by the `_sub` label in the
                // owner name (RFC 6763 §7.1)
                if rec
                    .name
                    .labels()
                    .iter()
                    .any(|l| l.eq_ignore_ascii_case("_sub"))
                {
                    merge_list(&mut self.subtype_ptrs, rec)
                } else {
                    merge_list(&mut self.ptr_records, rec)
                }
            }
            _ => RecordChange::Unchanged,
        }
    }
}

// Cache-flush eviction (RFC 6762 §10.2): a flush record replaces every
// same-type record for the owner that is more than one second old.
fn flush_stale(list: &mut Vec<MdnsRecord>, rec: &MdnsRecord) {
    list.retain(|e| e.same_record(rec) || e.received_at_ms + 1000 > rec.received_at_ms);
}

fn merge_single(slot: &mut Option<MdnsRecord>, rec: MdnsRecord) -> RecordChange {
    match slot {
        None => {
            *slot = Some(rec);
            RecordChange::Added
        }
        Some(existing) => merge_into(existing, rec),
    }
}

fn merge_list(list: &mut Vec<MdnsRecord>, rec: MdnsRecord) -> RecordChange {
    for existing in list.iter_mut() {
        if existing.same_record(&rec) {
            return merge_into(existing, rec);
        }
    }
    list.push(rec);
    RecordChange::Added
}

fn merge_into(existing: &mut MdnsRecord, rec: MdnsRecord) -> RecordChange {
    if existing.same_record(&rec) && existing.ttl_ms == rec.ttl_ms {
        if rec.received_at_ms > existing.received_at_ms {
            existing.received_at_ms = rec.received_at_ms;
            return RecordChange::Refreshed;
        }
        return RecordChange::Unchanged;
    }
    *existing = rec;
    RecordChange::Replaced
}

/// `(previous, replacement)`; replacement is `None` for TTL expiry
pub type ExpiredCallback = Box<dyn FnMut(&CachedService, Option<&CachedService>)>;

pub struct ServiceCache {
    clock: Rc<dyn Clock>,
    expiry_enabled: bool,
    map: HashMap<CacheKey, Vec<CachedService>>,
    callbacks: HashMap<CacheKey, ExpiredCallback>,
}

impl ServiceCache {
    pub fn new(clock: Rc<dyn Clock>, expiry_enabled: bool) -> Self {
        Self {
            clock,
            expiry_enabled,
            map: HashMap::new(),
            callbacks: HashMap::new(),
        }
    }

    /// Insert or replace by instance name, keeping the slice sorted by
    /// expiry. The sort is stable: equal expiry keeps insertion order.
    pub fn add_or_update(&mut self, key: &CacheKey, service: CachedService) {
        self.expire(key);
        let slice = self.map.entry(key.clone()).or_default();
        slice.retain(|s| !s.service_name.equals_ignore_case(&service.service_name));

        let expiry = service.expires_at_ms();
        let pos = slice.partition_point(|s| s.expires_at_ms() <= expiry);
        slice.insert(pos, service);
    }

    pub fn get(&mut self, key: &CacheKey, name: &DnsName) -> Option<&CachedService> {
        self.expire(key);
        self.map
            .get(key)?
            .iter()
            .find(|s| s.service_name.equals_ignore_case(name))
    }

    pub fn get_all(&mut self, key: &CacheKey) -> Vec<&CachedService> {
        self.expire(key);
        match self.map.get(key) {
            Some(slice) => slice.iter().collect(),
            None => Vec::new(),
        }
    }

    pub fn remove(&mut self, key: &CacheKey, name: &DnsName) -> Option<CachedService> {
        self.expire(key);
        let slice = self.map.get_mut(key)?;
        let pos = slice
            .iter()
            .position(|s| s.service_name.equals_ignore_case(name))?;
        Some(slice.remove(pos))
    }

    /// Drop and return the whole slice for a key, e.g. when its socket goes
    /// away. No expiry callbacks fire for these.
    pub fn clear_key(&mut self, key: &CacheKey) -> Vec<CachedService> {
        self.map.remove(key).unwrap_or_default()
    }

    pub fn register_expired_callback(&mut self, key: CacheKey, cb: ExpiredCallback) {
        self.callbacks.insert(key, cb);
    }

    pub fn unregister_expired_callback(&mut self, key: &CacheKey) {
        self.callbacks.remove(key);
    }

    /// Smallest remaining TTL over every record cached under `key`, the
    /// input to querier backoff.
    pub fn min_remaining_ttl_ms(&mut self, key: &CacheKey) -> Option<u64> {
        self.expire(key);
        let now = self.clock.elapsed_ms();
        self.map.get(key).and_then(|slice| {
            slice
                .iter()
                .flat_map(|s| s.records())
                .map(|r| r.remaining_ttl_ms(now))
                .min()
        })
    }

    // Lazy head expiry; accessors call this before touching a slice.
    fn expire(&mut self, key: &CacheKey) {
        if !self.expiry_enabled {
            return;
        }
        let now = self.clock.elapsed_ms();
        let mut expired = Vec::new();
        if let Some(slice) = self.map.get_mut(key) {
            while let Some(head) = slice.first() {
                if head.expires_at_ms() > now {
                    break;
                }
                expired.push(slice.remove(0));
            }
        }
        if expired.is_empty() {
            return;
        }
        debug!("expired {} cached service(s)", expired.len());
        if let Some(cb) = self.callbacks.get_mut(key) {
            for svc in &expired {
                cb(svc, None);
            }
        }
    }
}
