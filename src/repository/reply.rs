//! Reply assembly: answer collection, known-answer suppression, additional
//! chasing, destination selection and per-group throttling.
use std::collections::HashSet;
use std::net::SocketAddr;

use log::debug;
use rand::Rng;

use crate::name::DnsName;
use crate::rfc6762::{
    multicast_destination, MdnsPacket, MdnsQuestion, MdnsRecord, RData, DEFAULT_SHORT_TTL_MS,
    TYPE_A, TYPE_AAAA, TYPE_SRV, TYPE_TXT,
};

use super::{nsec_record, RecordInfo, RecordRepository, ServiceRegistration};

/// Minimum spacing between multicast replies to the same destination group
/// (RFC 6762 §6)
const MIN_MULTICAST_REPLY_INTERVAL_MS: u64 = 1_000;

/// Base hold time for a truncated query before replying without its
/// continuation (RFC 6762 §7.2: 400-500 ms)
const TRUNCATED_HOLD_BASE_MS: u64 = 400;

/// An assembled reply plus where and when to send it.
#[derive(Debug, Clone)]
pub struct MdnsReplyInfo {
    pub packet: MdnsPacket,
    pub destination: SocketAddr,
    /// extra delay drawn for shared-name answers, 0 otherwise
    pub send_delay_ms: u64,
}

// Known answers of a truncated query, parked until the continuation packet
// from the same source arrives.
#[derive(Debug)]
pub(crate) struct HeldQuery {
    pub(crate) questions: Vec<MdnsQuestion>,
    pub(crate) known_answers: Vec<MdnsRecord>,
    pub(crate) deadline_ms: u64,
}

// One answer candidate: the owning registration (-1 for the default host)
// and the outgoing record clone with the sender's casing already applied.
struct Candidate {
    owner_id: i32,
    record: MdnsRecord,
    shared: bool,
    question_idx: usize,
}

impl RecordRepository {
    /// Assemble the reply to an inbound query, or `None` when nothing
    /// (currently) warrants one.
    pub fn get_reply(&mut self, packet: &MdnsPacket, src: SocketAddr) -> Option<MdnsReplyInfo> {
        if packet.is_response() {
            return None;
        }
        let now = self.clock.elapsed_ms();
        self.held_queries.retain(|_, h| h.deadline_ms > now);

        // a truncated query promises more known answers; park it
        if packet.is_truncated() {
            let deadline = now + TRUNCATED_HOLD_BASE_MS + rand::thread_rng().gen_range(0..=100);
            let held = self
                .held_queries
                .entry(src.ip())
                .or_insert_with(|| HeldQuery {
                    questions: Vec::new(),
                    known_answers: Vec::new(),
                    deadline_ms: deadline,
                });
            held.questions.extend(packet.questions.iter().cloned());
            held.known_answers.extend(packet.answers.iter().cloned());
            return None;
        }

        let mut questions = packet.questions.clone();
        let mut known_answers = packet.answers.clone();
        if let Some(held) = self.held_queries.remove(&src.ip()) {
            let mut merged_q = held.questions;
            merged_q.extend(questions);
            questions = merged_q;
            let mut merged_ka = held.known_answers;
            merged_ka.extend(known_answers);
            known_answers = merged_ka;
        }
        if questions.is_empty() {
            return None;
        }

        // collect matching owned records, deduplicated by (name, type, rdata)
        let mut candidates: Vec<Candidate> = Vec::new();
        let mut seen: HashSet<(String, u16, String)> = HashSet::new();
        for (owner_id, info) in self.answer_sources() {
            for (qi, q) in questions.iter().enumerate() {
                let rec = &info.record;
                if !rec.name.equals_ignore_case(&q.name) || !q.matches_type(rec.rtype()) {
                    continue;
                }
                if !seen.insert(rec.dedup_key()) {
                    break;
                }
                // answers echo the owner name exactly as queried
                let mut rec = rec.clone();
                rec.name = q.name.clone();
                candidates.push(Candidate {
                    owner_id,
                    record: rec,
                    shared: info.shared,
                    question_idx: qi,
                });
                break;
            }
        }

        // known-answer suppression: equal content whose remaining TTL is at
        // least half of ours needs no repeat (RFC 6762 §7.1)
        if self.features.known_answer_suppression {
            candidates.retain(|c| {
                !known_answers
                    .iter()
                    .any(|ka| ka.same_record(&c.record) && ka.ttl_ms * 2 >= c.record.ttl_ms)
            });
        }
        if candidates.is_empty() {
            return None;
        }

        // unicast only when every question that got an answer asked for it
        let answered: HashSet<usize> = candidates.iter().map(|c| c.question_idx).collect();
        let unicast = self.features.unicast_reply_enabled
            && answered.iter().all(|&qi| questions[qi].unicast_reply);
        let destination = if unicast {
            src
        } else {
            multicast_destination(&src)
        };

        // multicast replies to one group are rate-limited as a whole: the
        // entire reply is dropped inside the window, whatever it carries
        if !unicast {
            if let Some(&last) = self.last_group_reply_ms.get(&destination) {
                if now < last + MIN_MULTICAST_REPLY_INTERVAL_MS {
                    debug!("reply for {} throttled (group {})", src, destination);
                    return None;
                }
            }
            self.last_group_reply_ms.insert(destination, now);
        }

        // shared-name (PTR) answers carry a random 20-120 ms delay
        let send_delay_ms = if candidates.iter().any(|c| c.shared) {
            rand::thread_rng().gen_range(20..=120)
        } else {
            0
        };

        let additionals = self.build_additionals(&candidates, &mut seen, now);

        // every contributing service replied to one more request
        let owners: HashSet<i32> = candidates
            .iter()
            .map(|c| c.owner_id)
            .filter(|id| *id >= 0)
            .collect();
        for id in owners {
            if let Some(reg) = self.services.get_mut(&id) {
                reg.replied_requests += 1;
            }
        }

        let mut reply = MdnsPacket::authoritative_response();
        reply.answers = candidates.into_iter().map(|c| c.record).collect();
        reply.additional = additionals;
        Some(MdnsReplyInfo {
            packet: reply,
            destination,
            send_delay_ms,
        })
    }

    // Chase the additionals of the final answer set: SRV answers pull the
    // target's addresses, PTR answers pull the instance's SRV + TXT +
    // addresses, and NSECs assert completeness per owner.
    fn build_additionals(
        &self,
        candidates: &[Candidate],
        seen: &mut HashSet<(String, u16, String)>,
        now: u64,
    ) -> Vec<MdnsRecord> {
        let mut adds: Vec<MdnsRecord> = Vec::new();
        let mut nsec_instances: Vec<DnsName> = Vec::new();
        let mut nsec_hosts: Vec<DnsName> = Vec::new();

        for c in candidates {
            match &c.record.rdata {
                RData::Srv(srv) => {
                    self.push_host_addresses(&srv.target, &mut adds, seen);
                    push_unique_name(&mut nsec_instances, &c.record.name);
                    push_unique_name(&mut nsec_hosts, &srv.target);
                }
                RData::Txt(_) => {
                    push_unique_name(&mut nsec_instances, &c.record.name);
                }
                RData::Ptr(target) => {
                    let reg = match self.find_service_by_instance(target) {
                        Some(reg) => reg,
                        None => continue,
                    };
                    for info in &reg.records {
                        match info.record.rtype() {
                            TYPE_SRV | TYPE_TXT => push_unique(&mut adds, seen, info.record.clone()),
                            _ => {}
                        }
                    }
                    let host = reg.target_host(&self.hostname).clone();
                    self.push_host_addresses(&host, &mut adds, seen);
                    push_unique_name(&mut nsec_instances, target);
                    push_unique_name(&mut nsec_hosts, &host);
                }
                RData::A(_) | RData::Aaaa(_) => {
                    push_unique_name(&mut nsec_hosts, &c.record.name);
                }
                _ => {}
            }
        }

        for owner in &nsec_instances {
            push_unique(
                &mut adds,
                seen,
                nsec_record(owner, vec![TYPE_TXT, TYPE_SRV], DEFAULT_SHORT_TTL_MS, now),
            );
        }
        for host in &nsec_hosts {
            let types = self.host_address_types(host);
            if !types.is_empty() {
                push_unique(
                    &mut adds,
                    seen,
                    nsec_record(host, types, DEFAULT_SHORT_TTL_MS, now),
                );
            }
        }

        adds
    }

    // All records the responder may answer from, excluding tentative
    // (probing) and withdrawing services.
    fn answer_sources(&self) -> Vec<(i32, &RecordInfo)> {
        let mut out = Vec::new();
        for info in &self.host_records {
            out.push((-1, info));
        }
        let mut ids: Vec<i32> = self.services.keys().copied().collect();
        ids.sort_unstable();
        for id in ids {
            let reg = &self.services[&id];
            if reg.probing || reg.exiting {
                continue;
            }
            for info in reg.records.iter().chain(reg.host_records.iter()) {
                out.push((id, info));
            }
        }
        out
    }

    fn find_service_by_instance(&self, instance: &DnsName) -> Option<&ServiceRegistration> {
        self.services
            .values()
            .find(|reg| !reg.probing && !reg.exiting && reg.instance_name.equals_ignore_case(instance))
    }

    // A/AAAA records advertised for `host`, default or custom.
    fn push_host_addresses(
        &self,
        host: &DnsName,
        adds: &mut Vec<MdnsRecord>,
        seen: &mut HashSet<(String, u16, String)>,
    ) {
        for info in self.host_record_set(host) {
            match info.record.rtype() {
                TYPE_A | TYPE_AAAA => push_unique(adds, seen, info.record.clone()),
                _ => {}
            }
        }
    }

    fn host_address_types(&self, host: &DnsName) -> Vec<u16> {
        let records = self.host_record_set(host);
        let mut types = Vec::new();
        if records.iter().any(|r| r.record.rtype() == TYPE_A) {
            types.push(TYPE_A);
        }
        if records.iter().any(|r| r.record.rtype() == TYPE_AAAA) {
            types.push(TYPE_AAAA);
        }
        types
    }

    fn host_record_set(&self, host: &DnsName) -> &[RecordInfo] {
        if host.equals_ignore_case(&self.hostname) {
            return &self.host_records;
        }
        for reg in self.services.values() {
            if let Some(custom) = &reg.custom_host {
                if custom.equals_ignore_case(host) {
                    return &reg.host_records;
                }
            }
        }
        &[]
    }
}

fn push_unique(
    adds: &mut Vec<MdnsRecord>,
    seen: &mut HashSet<(String, u16, String)>,
    rec: MdnsRecord,
) {
    if seen.insert(rec.dedup_key()) {
        adds.push(rec);
    }
}

fn push_unique_name(names: &mut Vec<DnsName>, name: &DnsName) {
    if !names.iter().any(|n| n.equals_ignore_case(name)) {
        names.push(name.clone());
    }
}
