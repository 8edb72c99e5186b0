//! Inbound response ingestion: merge the records of one packet into the
//! service cache and report the state transitions the merge caused.
//!
//! All records of a packet are merged before any event is reported, so a
//! listener seeing a newly complete service sees all of its fields at once.
use std::collections::HashMap;
use std::rc::Rc;

use log::debug;

use crate::cache::{CacheKey, CachedService, ServiceCache};
use crate::deps::Clock;
use crate::name::DnsName;
use crate::rfc6762::{MdnsPacket, MdnsRecord, RData};

/// State transition of one cached service, in occurrence order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheEventKind {
    /// instance name seen for the first time
    NameDiscovered,
    /// SRV + TXT + at least one address are now all known
    Found,
    /// a field changed while the service was complete
    Updated,
    /// goodbye PTR withdrew the instance
    Removed,
}

#[derive(Debug, Clone)]
pub struct CacheEvent {
    pub kind: CacheEventKind,
    pub service: CachedService,
}

pub struct ResponseDecoder {
    clock: Rc<dyn Clock>,
}

impl ResponseDecoder {
    pub fn new(clock: Rc<dyn Clock>) -> Self {
        Self { clock }
    }

    /// Merge a response packet into the cache slice for `key` and return the
    /// transitions, merge-first and strictly in transition order.
    pub fn augment_cache(
        &self,
        packet: &MdnsPacket,
        cache: &mut ServiceCache,
        key: &CacheKey,
    ) -> Vec<CacheEvent> {
        if !packet.is_response() {
            return Vec::new();
        }
        let now = self.clock.elapsed_ms();

        // working set: instance fold -> (existed, was_complete, entry, changed)
        let mut touched: HashMap<String, Working> = HashMap::new();
        let mut removals: Vec<DnsName> = Vec::new();

        // pass 1: PTR records name instances (and goodbye PTRs withdraw them)
        for rec in packet.all_records() {
            if let RData::Ptr(target) = &rec.rdata {
                if !self.is_for_type(&rec.name, key) {
                    continue;
                }
                if rec.is_goodbye() {
                    removals.push(target.clone());
                    continue;
                }
                let entry = self.working_entry(&mut touched, cache, key, target);
                if entry.entry.add_record(stamp(rec, now)).is_visible() {
                    entry.changed = true;
                }
            }
        }

        // pass 2: SRV / TXT / KEY at instance names under this type
        for rec in packet.all_records() {
            match rec.rdata {
                RData::Srv(_) | RData::Txt(_) | RData::Key(_) => {}
                _ => continue,
            }
            if !self.is_instance_of_type(&rec.name, key) {
                continue;
            }
            let name = rec.name.clone();
            let entry = self.working_entry(&mut touched, cache, key, &name);
            if entry.entry.add_record(stamp(rec, now)).is_visible() {
                entry.changed = true;
            }
        }

        // pass 3: address records attach to every service whose SRV target
        // is the advertised host, including ones this packet did not mention
        for rec in packet.all_records() {
            match rec.rdata {
                RData::A(_) | RData::Aaaa(_) => {}
                _ => continue,
            }
            let host = &rec.name;
            let mut names: Vec<DnsName> = touched
                .values()
                .filter(|w| match w.entry.target_host() {
                    Some(t) => t.equals_ignore_case(host),
                    None => false,
                })
                .map(|w| w.entry.service_name.clone())
                .collect();
            for cached in cache.get_all(key) {
                if let Some(t) = cached.target_host() {
                    if t.equals_ignore_case(host) {
                        names.push(cached.service_name.clone());
                    }
                }
            }
            for name in names {
                let entry = self.working_entry(&mut touched, cache, key, &name);
                if entry.entry.add_record(stamp(rec, now)).is_visible() {
                    entry.changed = true;
                }
            }
        }

        // merges done; now write back and compute transitions
        let mut events = Vec::new();

        for name in removals {
            if let Some(previous) = cache.remove(key, &name) {
                debug!("goodbye for {}", previous.service_name);
                events.push(CacheEvent {
                    kind: CacheEventKind::Removed,
                    service: previous,
                });
            }
        }

        let mut ordered: Vec<Working> = touched.into_values().collect();
        // deterministic fan-out order for one packet
        ordered.sort_by(|a, b| a.entry.service_name.case_fold().cmp(&b.entry.service_name.case_fold()));

        for w in ordered {
            let complete = w.entry.is_complete();
            if !w.existed {
                events.push(CacheEvent {
                    kind: CacheEventKind::NameDiscovered,
                    service: w.entry.clone(),
                });
            }
            if complete && !w.was_complete {
                events.push(CacheEvent {
                    kind: CacheEventKind::Found,
                    service: w.entry.clone(),
                });
            } else if complete && w.was_complete && w.changed {
                events.push(CacheEvent {
                    kind: CacheEventKind::Updated,
                    service: w.entry.clone(),
                });
            }
            cache.add_or_update(key, w.entry);
        }

        events
    }

    // service-type PTR owner: the type itself or `<sub>._sub.<type>`
    fn is_for_type(&self, owner: &DnsName, key: &CacheKey) -> bool {
        if owner.equals_ignore_case(&key.service_type) {
            return true;
        }
        owner.ends_with(&key.service_type)
            && owner
                .labels()
                .iter()
                .any(|l| l.eq_ignore_ascii_case("_sub"))
    }

    // instance names are exactly one label in front of the type
    fn is_instance_of_type(&self, owner: &DnsName, key: &CacheKey) -> bool {
        owner.ends_with(&key.service_type)
            && owner.labels().len() == key.service_type.labels().len() + 1
    }

    fn working_entry<'a>(
        &self,
        touched: &'a mut HashMap<String, Working>,
        cache: &mut ServiceCache,
        key: &CacheKey,
        instance: &DnsName,
    ) -> &'a mut Working {
        let fold = instance.case_fold();
        if !touched.contains_key(&fold) {
            let (existed, was_complete, entry) = match cache.get(key, instance) {
                Some(existing) => (true, existing.is_complete(), existing.clone()),
                None => (
                    false,
                    false,
                    CachedService::new(instance.clone(), key.socket),
                ),
            };
            touched.insert(
                fold.clone(),
                Working {
                    existed,
                    was_complete,
                    changed: false,
                    entry,
                },
            );
        }
        touched.get_mut(&fold).unwrap()
    }
}

struct Working {
    existed: bool,
    was_complete: bool,
    changed: bool,
    entry: CachedService,
}

fn stamp(rec: &MdnsRecord, now: u64) -> MdnsRecord {
    let mut rec = rec.clone();
    if rec.received_at_ms == 0 {
        rec.received_at_ms = now;
    }
    rec
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::SocketKey;
    use crate::deps::ManualClock;
    use crate::rfc6762::{
        MdnsQuestion, SrvData, TxtEntry, DEFAULT_LONG_TTL_MS, DEFAULT_SHORT_TTL_MS,
        FLAGS_AUTHORITATIVE_RESPONSE, TYPE_PTR,
    };

    const TYPE: &str = "_testservice._tcp.local";
    const INSTANCE: &str = "Unit._testservice._tcp.local";
    const HOST: &str = "unit-host.local";

    fn key() -> CacheKey {
        CacheKey {
            service_type: DnsName::try_from(TYPE).unwrap(),
            socket: SocketKey {
                network_handle: None,
                interface_index: 3,
            },
        }
    }

    fn full_response() -> MdnsPacket {
        let mut packet = MdnsPacket::authoritative_response();
        packet.answers.push(MdnsRecord::new(
            DnsName::try_from(TYPE).unwrap(),
            false,
            DEFAULT_LONG_TTL_MS,
            RData::Ptr(DnsName::try_from(INSTANCE).unwrap()),
        ));
        packet.answers.push(MdnsRecord::new(
            DnsName::try_from(INSTANCE).unwrap(),
            true,
            DEFAULT_SHORT_TTL_MS,
            RData::Srv(SrvData {
                priority: 0,
                weight: 0,
                port: 8080,
                target: DnsName::try_from(HOST).unwrap(),
            }),
        ));
        packet.answers.push(MdnsRecord::new(
            DnsName::try_from(INSTANCE).unwrap(),
            true,
            DEFAULT_LONG_TTL_MS,
            RData::Txt(vec![TxtEntry::new("v", "1")]),
        ));
        packet.additional.push(MdnsRecord::new(
            DnsName::try_from(HOST).unwrap(),
            true,
            DEFAULT_SHORT_TTL_MS,
            RData::A("192.0.2.9".parse().unwrap()),
        ));
        packet
    }

    fn setup() -> (Rc<ManualClock>, ServiceCache, ResponseDecoder) {
        let clock = Rc::new(ManualClock::new(1_000));
        let cache = ServiceCache::new(clock.clone(), true);
        let decoder = ResponseDecoder::new(clock.clone());
        (clock, cache, decoder)
    }

    #[test]
    fn complete_response_discovers_and_finds_in_one_shot() {
        let (_clock, mut cache, decoder) = setup();
        let events = decoder.augment_cache(&full_response(), &mut cache, &key());

        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind, CacheEventKind::NameDiscovered);
        assert_eq!(events[1].kind, CacheEventKind::Found);
        // merge-before-callbacks: the Found snapshot already has the address
        assert_eq!(events[1].service.addresses().len(), 1);
        assert_eq!(events[1].service.port(), Some(8080));
    }

    #[test]
    fn partial_then_address_completes_later() {
        let (_clock, mut cache, decoder) = setup();

        let mut partial = full_response();
        partial.additional.clear(); // no address yet
        let events = decoder.augment_cache(&partial, &mut cache, &key());
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, CacheEventKind::NameDiscovered);

        // a bare address response for the SRV target completes the service
        let mut addr_only = MdnsPacket::authoritative_response();
        addr_only.answers.push(MdnsRecord::new(
            DnsName::try_from(HOST).unwrap(),
            true,
            DEFAULT_SHORT_TTL_MS,
            RData::A("192.0.2.9".parse().unwrap()),
        ));
        let events = decoder.augment_cache(&addr_only, &mut cache, &key());
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, CacheEventKind::Found);
    }

    #[test]
    fn txt_change_on_complete_service_is_an_update() {
        let (_clock, mut cache, decoder) = setup();
        decoder.augment_cache(&full_response(), &mut cache, &key());

        let mut update = MdnsPacket::authoritative_response();
        update.answers.push(MdnsRecord::new(
            DnsName::try_from(INSTANCE).unwrap(),
            true,
            DEFAULT_LONG_TTL_MS,
            RData::Txt(vec![TxtEntry::new("v", "2")]),
        ));
        let events = decoder.augment_cache(&update, &mut cache, &key());
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, CacheEventKind::Updated);
    }

    #[test]
    fn identical_refresh_is_silent() {
        let (clock, mut cache, decoder) = setup();
        decoder.augment_cache(&full_response(), &mut cache, &key());

        clock.advance(5_000);
        let events = decoder.augment_cache(&full_response(), &mut cache, &key());
        assert!(events.is_empty());
    }

    #[test]
    fn goodbye_ptr_removes_the_service() {
        let (_clock, mut cache, decoder) = setup();
        decoder.augment_cache(&full_response(), &mut cache, &key());

        let mut goodbye = MdnsPacket::authoritative_response();
        goodbye.answers.push(MdnsRecord::new(
            DnsName::try_from(TYPE).unwrap(),
            false,
            0,
            RData::Ptr(DnsName::try_from(INSTANCE).unwrap()),
        ));
        let events = decoder.augment_cache(&goodbye, &mut cache, &key());
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, CacheEventKind::Removed);
        assert!(cache.get(&key(), &DnsName::try_from(INSTANCE).unwrap()).is_none());
    }

    #[test]
    fn queries_are_ignored() {
        let (_clock, mut cache, decoder) = setup();
        let mut query = MdnsPacket::query();
        query
            .questions
            .push(MdnsQuestion::new(DnsName::try_from(TYPE).unwrap(), TYPE_PTR));
        assert!(decoder.augment_cache(&query, &mut cache, &key()).is_empty());
    }

    #[test]
    fn foreign_type_records_are_ignored() {
        let (_clock, mut cache, decoder) = setup();
        let mut packet = MdnsPacket::authoritative_response();
        packet.answers.push(MdnsRecord::new(
            DnsName::try_from("_othertype._udp.local").unwrap(),
            false,
            DEFAULT_LONG_TTL_MS,
            RData::Ptr(DnsName::try_from("X._othertype._udp.local").unwrap()),
        ));
        assert!(decoder.augment_cache(&packet, &mut cache, &key()).is_empty());
    }
}
