//! The authoritative store of locally owned names and records.
//!
//! The repository owns every registration, generates the probe, announce,
//! exit, reply and offload packets, and detects conflicts with inbound
//! traffic. It never touches a socket and never sleeps: the timed delivery
//! of its packets is the repeater's job, scheduling is the event loop's.
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::rc::Rc;

use log::{debug, info};

use crate::deps::Clock;
use crate::error::{MdnsError, MdnsResult};
use crate::name::{reverse_dns_name, DnsName};
use crate::network_order::message::write_packet;
use crate::rfc6762::{
    MdnsPacket, MdnsQuestion, MdnsRecord, NsecData, RData, SrvData, TxtEntry, DEFAULT_LONG_TTL_MS,
    DEFAULT_SHORT_TTL_MS, TYPE_A, TYPE_AAAA, TYPE_ANY, TYPE_PTR, TYPE_SRV, TYPE_TXT,
};

mod conflict;
mod reply;

pub use conflict::{CONFLICT_HOST, CONFLICT_SERVICE};
pub use reply::MdnsReplyInfo;

use reply::HeldQuery;

/// Hard cap on simultaneous registrations
const MAX_REGISTRATIONS: usize = 900;

/// What an application registers: the DNS-SD description of one service.
#[derive(Debug, Clone, Default)]
pub struct NsdServiceInfo {
    /// instance label, e.g. `MyTestService`
    pub service_name: String,
    /// type labels without the domain, e.g. `_testservice._tcp`
    pub service_type: DnsName,
    pub port: u16,
    pub txt: Vec<TxtEntry>,
    pub subtypes: Vec<String>,
    /// hostname label(s) without the domain; the default host is used when
    /// absent
    pub custom_hostname: Option<DnsName>,
    /// addresses advertised for the custom hostname
    pub host_addresses: Vec<IpAddr>,
    pub public_key: Option<Vec<u8>>,
}

/// Engine policy toggles, all orthogonal to the registration data.
#[derive(Debug, Clone, Copy)]
pub struct EngineFeatures {
    pub known_answer_suppression: bool,
    pub unicast_reply_enabled: bool,
    /// defend A/AAAA in probe authority sections
    pub probe_addresses: bool,
}

impl Default for EngineFeatures {
    fn default() -> Self {
        Self {
            known_answer_suppression: true,
            unicast_reply_enabled: true,
            probe_addresses: false,
        }
    }
}

/// Probe template for one service: the repeater toggles the unicast bit and
/// paces the three transmissions.
#[derive(Debug, Clone)]
pub struct ProbingInfo {
    pub service_id: i32,
    pub packet: MdnsPacket,
}

/// Announcement (or goodbye) template for one service.
#[derive(Debug, Clone)]
pub struct AnnouncementInfo {
    pub service_id: i32,
    pub packet: MdnsPacket,
}

// One owned record. `shared` marks records whose name is not ours
// exclusively (DNS-SD PTRs), which never carry cache-flush and get jittered
// replies.
#[derive(Debug, Clone)]
pub(crate) struct RecordInfo {
    pub(crate) record: MdnsRecord,
    pub(crate) shared: bool,
}

impl RecordInfo {
    fn new(record: MdnsRecord, shared: bool) -> Self {
        Self { record, shared }
    }
}

#[derive(Debug)]
pub(crate) struct ServiceRegistration {
    pub(crate) id: i32,
    pub(crate) info: NsdServiceInfo,
    pub(crate) ttl_override_ms: Option<u64>,
    pub(crate) instance_name: DnsName,
    pub(crate) type_name: DnsName,
    /// the full custom host name, when one is set
    pub(crate) custom_host: Option<DnsName>,
    pub(crate) records: Vec<RecordInfo>,
    /// reverse-PTR + address records for the custom host only
    pub(crate) host_records: Vec<RecordInfo>,
    pub(crate) replied_requests: u64,
    pub(crate) announcements_sent: u32,
    pub(crate) probing: bool,
    pub(crate) exiting: bool,
}

impl ServiceRegistration {
    pub(crate) fn is_active(&self) -> bool {
        !self.exiting
    }

    /// host name the SRV record points at
    pub(crate) fn target_host<'a>(&'a self, default_host: &'a DnsName) -> &'a DnsName {
        self.custom_host.as_ref().unwrap_or(default_host)
    }

    pub(crate) fn srv_record(&self) -> Option<&RecordInfo> {
        self.records
            .iter()
            .find(|r| r.record.rtype() == TYPE_SRV)
    }
}

pub struct RecordRepository {
    pub(crate) clock: Rc<dyn Clock>,
    pub(crate) features: EngineFeatures,
    /// the default host name, domain included
    pub(crate) hostname: DnsName,
    pub(crate) link_addresses: Vec<IpAddr>,
    /// reverse-PTR + address records for the default host, announcement order
    pub(crate) host_records: Vec<RecordInfo>,
    pub(crate) services: HashMap<i32, ServiceRegistration>,
    pub(crate) held_queries: HashMap<IpAddr, HeldQuery>,
    /// when the last multicast reply went out, per destination group
    pub(crate) last_group_reply_ms: HashMap<SocketAddr, u64>,
}

impl RecordRepository {
    /// `hostname` is the full default host name, e.g. `Android_0F.local`.
    pub fn new(clock: Rc<dyn Clock>, hostname: DnsName, features: EngineFeatures) -> Self {
        Self {
            clock,
            features,
            hostname,
            link_addresses: Vec::new(),
            host_records: Vec::new(),
            services: HashMap::new(),
            held_queries: HashMap::new(),
            last_group_reply_ms: HashMap::new(),
        }
    }

    /// Replace the advertised link addresses and rebuild the default host
    /// record set. The caller drives re-announcing.
    pub fn update_addresses(&mut self, addresses: Vec<IpAddr>) {
        let now = self.clock.elapsed_ms();
        self.host_records = build_address_records(&self.hostname, &addresses, now);
        self.link_addresses = addresses;
        debug!(
            "host {} now advertises {} address(es)",
            self.hostname,
            self.link_addresses.len()
        );
    }

    /// Register a service. Returns `-1` for a fresh name, or the prior id of
    /// an exiting registration with the same name that this call resurrects.
    pub fn add_service(
        &mut self,
        id: i32,
        info: NsdServiceInfo,
        ttl_override_ms: Option<u64>,
    ) -> MdnsResult<i32> {
        if self.services.contains_key(&id) {
            return Err(MdnsError::DuplicateId(id));
        }
        if self.services.len() >= MAX_REGISTRATIONS {
            return Err(MdnsError::QuotaExceeded);
        }

        let type_name = with_local_domain(&info.service_type)?;
        let instance_name = type_name.prepended(&info.service_name)?;

        // invariant: at most one active owner per instance name
        for reg in self.services.values() {
            if reg.is_active() && reg.instance_name.equals_ignore_case(&instance_name) {
                return Err(MdnsError::NameConflict(instance_name.to_string()));
            }
        }

        // a goodbye'd registration with the same name is resurrected: its id
        // is released and reported back to the caller
        let prev_id = self
            .services
            .iter()
            .find(|(_, reg)| {
                reg.exiting && reg.instance_name.equals_ignore_case(&instance_name)
            })
            .map(|(prev_id, _)| *prev_id);
        if let Some(prev_id) = prev_id {
            self.services.remove(&prev_id);
            info!("resurrecting {} (was id {})", instance_name, prev_id);
        }

        let custom_host = match &info.custom_hostname {
            Some(host) => Some(with_local_domain(host)?),
            None => None,
        };

        let now = self.clock.elapsed_ms();
        let mut reg = ServiceRegistration {
            id,
            instance_name,
            type_name,
            custom_host,
            info,
            ttl_override_ms,
            records: Vec::new(),
            host_records: Vec::new(),
            replied_requests: 0,
            announcements_sent: 0,
            probing: false,
            exiting: false,
        };
        reg.records = self.build_service_records(&reg, now)?;
        if let Some(host) = &reg.custom_host {
            reg.host_records = build_address_records(host, &reg.info.host_addresses, now);
        }

        info!("registered {} as service {}", reg.instance_name, id);
        self.services.insert(id, reg);
        Ok(prev_id.unwrap_or(-1))
    }

    /// Replace the subtype set of a registration.
    pub fn update_service(&mut self, id: i32, subtypes: Vec<String>) -> MdnsResult<()> {
        let now = self.clock.elapsed_ms();
        let reg = self.services.get(&id).ok_or(MdnsError::UnknownId(id))?;
        // validate the new subtype labels before touching the registration
        for sub in &subtypes {
            reg.type_name.prepended("_sub")?.prepended(sub)?;
        }
        let reg = self.services.get_mut(&id).unwrap();
        reg.info.subtypes = subtypes;

        let reg = self.services.get(&id).unwrap();
        let rebuilt = self.build_service_records(reg, now)?;
        self.services.get_mut(&id).unwrap().records = rebuilt;
        Ok(())
    }

    /// Mark a registration as probing and produce its probe template: an
    /// `ANY` question for the instance name with the tentative records in
    /// the authority section.
    pub fn set_service_probing(&mut self, id: i32) -> MdnsResult<ProbingInfo> {
        let reg = self.services.get_mut(&id).ok_or(MdnsError::UnknownId(id))?;
        reg.probing = true;

        let reg = self.services.get(&id).unwrap();
        let mut packet = MdnsPacket::query();
        packet
            .questions
            .push(MdnsQuestion::new(reg.instance_name.clone(), TYPE_ANY));

        if let Some(srv) = reg.srv_record() {
            packet.authority.push(srv.record.clone());
        }
        if self.features.probe_addresses {
            let host_records = match &reg.custom_host {
                Some(_) => &reg.host_records,
                None => &self.host_records,
            };
            for info in host_records {
                match info.record.rtype() {
                    TYPE_A | TYPE_AAAA => packet.authority.push(info.record.clone()),
                    _ => {}
                }
            }
        }

        Ok(ProbingInfo {
            service_id: id,
            packet,
        })
    }

    /// Probing completed without a conflict: the registration is no longer
    /// tentative, and this is the announcement to repeat.
    pub fn on_probing_succeeded(&mut self, probing: &ProbingInfo) -> MdnsResult<AnnouncementInfo> {
        let id = probing.service_id;
        {
            let reg = self.services.get_mut(&id).ok_or(MdnsError::UnknownId(id))?;
            reg.probing = false;
        }
        let reg = self.services.get(&id).unwrap();
        Ok(AnnouncementInfo {
            service_id: id,
            packet: self.build_announcement(reg),
        })
    }

    /// The repeater reports how many unsolicited announcements went out.
    pub fn on_advertisement_sent(&mut self, id: i32, sent_packet_count: u32) {
        if let Some(reg) = self.services.get_mut(&id) {
            reg.announcements_sent += sent_packet_count;
        }
    }

    /// Begin withdrawing a service. Returns the goodbye to send, or `None`
    /// when the service was never announced (nothing to take back).
    pub fn exit_service(&mut self, id: i32) -> Option<AnnouncementInfo> {
        let reg = self.services.get_mut(&id)?;
        if reg.exiting {
            return None;
        }
        reg.exiting = true;
        info!("exiting service {} ({})", id, reg.instance_name);
        if reg.announcements_sent == 0 {
            return None;
        }

        // goodbye: the shared PTRs at TTL 0 (RFC 6762 §10.1)
        let reg = self.services.get(&id).unwrap();
        let mut packet = MdnsPacket::authoritative_response();
        for info in &reg.records {
            if let RData::Ptr(_) = info.record.rdata {
                if info.record.name.equals_ignore_case(&enumeration_name()) {
                    continue;
                }
                let mut rec = info.record.clone();
                rec.ttl_ms = 0;
                packet.answers.push(rec);
            }
        }
        Some(AnnouncementInfo {
            service_id: id,
            packet,
        })
    }

    /// Forget a registration entirely, releasing its id.
    pub fn remove_service(&mut self, id: i32) {
        self.services.remove(&id);
    }

    /// Pre-serialized announcement for hardware offload: answers only, no
    /// NSEC, no questions.
    pub fn get_offload_packet(&self, id: i32) -> MdnsResult<Vec<u8>> {
        let reg = self.services.get(&id).ok_or(MdnsError::UnknownId(id))?;

        let mut packet = MdnsPacket::authoritative_response();
        for info in &reg.records {
            match info.record.rtype() {
                TYPE_SRV | TYPE_TXT => packet.answers.push(info.record.clone()),
                _ => {}
            }
        }
        // the service-type PTR, not the subtype or enumeration ones
        for info in &reg.records {
            if info.record.name.equals_ignore_case(&reg.type_name) {
                packet.answers.insert(0, info.record.clone());
            }
        }
        let host_records = match &reg.custom_host {
            Some(_) => &reg.host_records,
            None => &self.host_records,
        };
        for info in host_records {
            match info.record.rtype() {
                TYPE_A | TYPE_AAAA => packet.answers.push(info.record.clone()),
                _ => {}
            }
        }

        write_packet(&packet)
    }

    /// Every service whose SRV targets `hostname` goes back to probing;
    /// returns their probe templates.
    pub fn restart_probing_for_hostname(&mut self, hostname: &DnsName) -> Vec<ProbingInfo> {
        let ids = self.ids_targeting(hostname);
        let mut out = Vec::new();
        for id in ids {
            if let Ok(info) = self.set_service_probing(id) {
                out.push(info);
            }
        }
        out
    }

    /// Every service whose SRV targets `hostname` must re-announce, e.g.
    /// after an address change.
    pub fn restart_announcing_for_hostname(&mut self, hostname: &DnsName) -> Vec<AnnouncementInfo> {
        let ids = self.ids_targeting(hostname);
        let mut out = Vec::new();
        for id in ids {
            let reg = match self.services.get(&id) {
                Some(reg) => reg,
                None => continue,
            };
            out.push(AnnouncementInfo {
                service_id: id,
                packet: self.build_announcement(reg),
            });
        }
        out
    }

    /// Number of replies this service contributed answers to.
    pub fn replied_requests(&self, id: i32) -> Option<u64> {
        self.services.get(&id).map(|reg| reg.replied_requests)
    }

    pub fn is_probing(&self, id: i32) -> bool {
        self.services.get(&id).map(|r| r.probing).unwrap_or(false)
    }

    fn ids_targeting(&self, hostname: &DnsName) -> Vec<i32> {
        let mut ids: Vec<i32> = self
            .services
            .values()
            .filter(|reg| {
                reg.is_active() && reg.target_host(&self.hostname).equals_ignore_case(hostname)
            })
            .map(|reg| reg.id)
            .collect();
        ids.sort_unstable();
        ids
    }

    // Announcement for one service: host records first (reverse-PTR then
    // address, per address), then PTR / subtype PTRs / SRV / TXT / the
    // enumeration PTR; NSECs for every unique owner in the additionals.
    pub(crate) fn build_announcement(&self, reg: &ServiceRegistration) -> MdnsPacket {
        let mut packet = MdnsPacket::authoritative_response();

        let host = reg.target_host(&self.hostname);
        let host_records = match &reg.custom_host {
            Some(_) => &reg.host_records,
            None => &self.host_records,
        };
        for info in host_records {
            packet.answers.push(info.record.clone());
        }
        for info in &reg.records {
            packet.answers.push(info.record.clone());
        }

        // additionals: NSEC per reverse-PTR owner, then host, then instance
        let ttl = short_ttl(reg.ttl_override_ms);
        let now = self.clock.elapsed_ms();
        for info in host_records {
            if let RData::Ptr(_) = info.record.rdata {
                packet
                    .additional
                    .push(nsec_record(&info.record.name, vec![TYPE_PTR], ttl, now));
            }
        }
        let mut host_types = Vec::new();
        if host_records.iter().any(|r| r.record.rtype() == TYPE_A) {
            host_types.push(TYPE_A);
        }
        if host_records.iter().any(|r| r.record.rtype() == TYPE_AAAA) {
            host_types.push(TYPE_AAAA);
        }
        if !host_types.is_empty() {
            packet.additional.push(nsec_record(host, host_types, ttl, now));
        }
        packet
            .additional
            .push(nsec_record(&reg.instance_name, vec![TYPE_TXT, TYPE_SRV], ttl, now));

        packet
    }

    fn build_service_records(
        &self,
        reg: &ServiceRegistration,
        now: u64,
    ) -> MdnsResult<Vec<RecordInfo>> {
        let short = short_ttl(reg.ttl_override_ms);
        let long = long_ttl(reg.ttl_override_ms);
        let mut records = Vec::new();

        // service-type PTR, a shared name
        let mut ptr = MdnsRecord::new(
            reg.type_name.clone(),
            false,
            long,
            RData::Ptr(reg.instance_name.clone()),
        );
        ptr.received_at_ms = now;
        records.push(RecordInfo::new(ptr, true));

        // one shared PTR per subtype: `<sub>._sub.<type>` -> instance
        for sub in &reg.info.subtypes {
            let owner = reg.type_name.prepended("_sub")?.prepended(sub)?;
            let mut rec = MdnsRecord::new(owner, false, long, RData::Ptr(reg.instance_name.clone()));
            rec.received_at_ms = now;
            records.push(RecordInfo::new(rec, true));
        }

        // SRV, unique
        let mut srv = MdnsRecord::new(
            reg.instance_name.clone(),
            true,
            short,
            RData::Srv(SrvData {
                priority: 0,
                weight: 0,
                port: reg.info.port,
                target: reg.target_host(&self.hostname).clone(),
            }),
        );
        srv.received_at_ms = now;
        records.push(RecordInfo::new(srv, false));

        // TXT, unique
        let mut txt = MdnsRecord::new(
            reg.instance_name.clone(),
            true,
            long,
            RData::Txt(reg.info.txt.clone()),
        );
        txt.received_at_ms = now;
        records.push(RecordInfo::new(txt, false));

        // KEY, unique, only when a public key is attached
        if let Some(key) = &reg.info.public_key {
            let mut rec = MdnsRecord::new(
                reg.instance_name.clone(),
                true,
                short,
                RData::Key(key.clone()),
            );
            rec.received_at_ms = now;
            records.push(RecordInfo::new(rec, false));
        }

        // service enumeration PTR (RFC 6763 §9), shared
        let mut meta = MdnsRecord::new(
            enumeration_name(),
            false,
            long,
            RData::Ptr(reg.type_name.clone()),
        );
        meta.received_at_ms = now;
        records.push(RecordInfo::new(meta, true));

        Ok(records)
    }
}

pub(crate) fn short_ttl(override_ms: Option<u64>) -> u64 {
    override_ms.unwrap_or(DEFAULT_SHORT_TTL_MS)
}

pub(crate) fn long_ttl(override_ms: Option<u64>) -> u64 {
    override_ms.unwrap_or(DEFAULT_LONG_TTL_MS)
}

/// `_services._dns-sd._udp.local`
pub fn enumeration_name() -> DnsName {
    DnsName::from_labels_unchecked(vec![
        "_services".to_string(),
        "_dns-sd".to_string(),
        "_udp".to_string(),
        "local".to_string(),
    ])
}

fn with_local_domain(name: &DnsName) -> MdnsResult<DnsName> {
    if name
        .labels()
        .last()
        .map(|l| l.eq_ignore_ascii_case("local"))
        .unwrap_or(false)
    {
        return Ok(name.clone());
    }
    name.appended(&DnsName::from_labels_unchecked(vec!["local".to_string()]))
}

// Reverse-PTR then address record, per address, all cache-flush at the
// short TTL: these names carry the host identity.
fn build_address_records(hostname: &DnsName, addresses: &[IpAddr], now: u64) -> Vec<RecordInfo> {
    let mut out = Vec::new();
    for addr in addresses {
        let mut rev = MdnsRecord::new(
            reverse_dns_name(addr),
            true,
            DEFAULT_SHORT_TTL_MS,
            RData::Ptr(hostname.clone()),
        );
        rev.received_at_ms = now;
        out.push(RecordInfo::new(rev, false));

        let rdata = match addr {
            IpAddr::V4(v4) => RData::A(*v4),
            IpAddr::V6(v6) => RData::Aaaa(*v6),
        };
        let mut rec = MdnsRecord::new(hostname.clone(), true, DEFAULT_SHORT_TTL_MS, rdata);
        rec.received_at_ms = now;
        out.push(RecordInfo::new(rec, false));
    }
    out
}

fn nsec_record(owner: &DnsName, types: Vec<u16>, ttl_ms: u64, now: u64) -> MdnsRecord {
    let mut rec = MdnsRecord::new(
        owner.clone(),
        true,
        ttl_ms,
        RData::Nsec(NsecData {
            next_domain: owner.clone(),
            types,
        }),
    );
    rec.received_at_ms = now;
    rec
}

#[cfg(test)]
mod tests;
