//! Conflict detection against inbound answer/authority records.
//!
//! A conflict exists when another host asserts a record at a name we own
//! with content that differs from ours. Identical assertions are harmless
//! (another responder repeating our data), except while we are still
//! probing, where any third-party claim on the name defeats uniqueness.
use std::collections::{HashMap, HashSet};
use std::net::IpAddr;

use log::warn;

use crate::rfc6762::{MdnsPacket, MdnsRecord, RData};

use super::{RecordRepository, ServiceRegistration};

/// another owner claims our service instance name
pub const CONFLICT_SERVICE: u8 = 1 << 0;

/// another owner claims our custom host name
pub const CONFLICT_HOST: u8 = 1 << 1;

impl RecordRepository {
    /// Scan a packet's answers and authority records for collisions with
    /// locally owned unique names. Returns service id -> conflict kind bits.
    pub fn get_conflicting_services(&self, packet: &MdnsPacket) -> HashMap<i32, u8> {
        // NSEC asserts absence and opaque types assert nothing; neither can
        // collide with ownership
        let records: Vec<&MdnsRecord> = packet
            .answers
            .iter()
            .chain(packet.authority.iter())
            .filter(|r| !matches!(r.rdata, RData::Nsec(_) | RData::Unknown { .. }))
            .collect();
        if records.is_empty() {
            return HashMap::new();
        }

        let mut out = HashMap::new();
        for (id, reg) in &self.services {
            if reg.exiting {
                continue;
            }
            let mut kinds = 0u8;
            for rec in &records {
                if rec.name.equals_ignore_case(&reg.instance_name)
                    && self.instance_conflicts(reg, rec)
                {
                    kinds |= CONFLICT_SERVICE;
                }
            }
            if self.host_conflicts(reg, &records) {
                kinds |= CONFLICT_HOST;
            }
            if kinds != 0 {
                warn!(
                    "conflict (kind {:#x}) detected for service {} ({})",
                    kinds, id, reg.instance_name
                );
                out.insert(*id, kinds);
            }
        }
        out
    }

    fn instance_conflicts(&self, reg: &ServiceRegistration, rec: &MdnsRecord) -> bool {
        // during probing even an identical record defeats name uniqueness
        if reg.probing {
            return true;
        }
        let ours = reg.records.iter().find(|info| {
            !info.shared
                && info.record.rtype() == rec.rtype()
                && info.record.name.equals_ignore_case(&rec.name)
        });
        match ours {
            // identical content never conflicts, whatever its TTL
            Some(info) => !info.record.rdata.same_data(&rec.rdata),
            // a type we do not publish, asserted at a name we own uniquely
            None => true,
        }
    }

    fn host_conflicts(&self, reg: &ServiceRegistration, records: &[&MdnsRecord]) -> bool {
        let host = match &reg.custom_host {
            Some(host) => host,
            None => return false,
        };
        let remote: Vec<&&MdnsRecord> = records
            .iter()
            .filter(|r| r.name.equals_ignore_case(host))
            .collect();
        if remote.is_empty() {
            return false;
        }
        if reg.probing {
            return true;
        }

        // address sets: a subset of what we advertise is another responder
        // echoing us; more addresses than ours or any disagreement is a
        // competing host
        let remote_addrs: HashSet<IpAddr> = remote
            .iter()
            .filter_map(|r| match &r.rdata {
                RData::A(a) => Some(IpAddr::V4(*a)),
                RData::Aaaa(a) => Some(IpAddr::V6(*a)),
                _ => None,
            })
            .collect();
        if !remote_addrs.is_empty() {
            let ours: HashSet<IpAddr> = reg.info.host_addresses.iter().copied().collect();
            if remote_addrs.len() > ours.len()
                || remote_addrs.iter().any(|a| !ours.contains(a))
            {
                return true;
            }
        }

        // KEY: identical public keys coexist, anything else collides
        for r in &remote {
            if let RData::Key(k) = &r.rdata {
                match &reg.info.public_key {
                    Some(ours) if ours == k => {}
                    _ => return true,
                }
            }
        }

        false
    }
}
