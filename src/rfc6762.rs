//! Base structures for mDNS messages. Taken from
//! https://datatracker.ietf.org/doc/html/rfc6762 with the DNS-SD conventions
//! of https://datatracker.ietf.org/doc/html/rfc6763 layered on top.
//!
//! The record hierarchy is a tagged union: one shared header (owner name,
//! cache-flush, TTL, receipt time) plus per-variant rdata. Serialization
//! lives in the network_order module.
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use crate::name::DnsName;

/// mDNS runs on UDP port 5353, both directions
pub const MDNS_PORT: u16 = 5353;

/// IPv4 link-local multicast group (RFC 6762 §3)
pub const MDNS_IPV4_GROUP: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 251);

/// IPv6 link-local multicast group
pub const MDNS_IPV6_GROUP: Ipv6Addr = Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0, 0xfb);

/// Default path MTU budget for outbound packets; larger queries are split
/// with the TC bit (RFC 6762 §7.2)
pub const MAX_MDNS_PACKET_SIZE: usize = 1232;

// Record type codes, straight from the IANA registry. Unknown types are
// carried opaquely, so a plain u16 beats an exhaustive enum here.
pub const TYPE_A: u16 = 1;
pub const TYPE_PTR: u16 = 12;
pub const TYPE_TXT: u16 = 16;
pub const TYPE_KEY: u16 = 25;
pub const TYPE_AAAA: u16 = 28;
pub const TYPE_SRV: u16 = 33;
pub const TYPE_NSEC: u16 = 47;
pub const TYPE_ANY: u16 = 255;

/// the Internet class; mDNS uses nothing else
pub const CLASS_IN: u16 = 1;

/// Top bit of the class field: cache-flush on records, unicast-reply on
/// questions (RFC 6762 §10.2 / §5.4)
pub const CLASS_TOP_BIT: u16 = 0x8000;

// Header flag bits
pub const FLAG_RESPONSE: u16 = 0x8000;
pub const FLAG_AUTHORITATIVE: u16 = 0x0400;
pub const FLAG_TRUNCATED: u16 = 0x0200;

/// flags value of every packet the responder emits
pub const FLAGS_AUTHORITATIVE_RESPONSE: u16 = FLAG_RESPONSE | FLAG_AUTHORITATIVE;

/// flags value of every query
pub const FLAGS_STANDARD_QUERY: u16 = 0x0000;

/// Default TTL for host-name-bearing records: A, AAAA, SRV, reverse PTR
/// (RFC 6762 §10)
pub const DEFAULT_SHORT_TTL_MS: u64 = 120_000;

/// Default TTL for the remaining records: PTR, TXT
pub const DEFAULT_LONG_TTL_MS: u64 = 4_500_000;

/// Multicast destination matching the family of `src`.
pub fn multicast_destination(src: &SocketAddr) -> SocketAddr {
    match src {
        SocketAddr::V4(_) => SocketAddr::new(IpAddr::V4(MDNS_IPV4_GROUP), MDNS_PORT),
        SocketAddr::V6(_) => SocketAddr::new(IpAddr::V6(MDNS_IPV6_GROUP), MDNS_PORT),
    }
}

/// One `key=value` entry of a TXT record (RFC 6763 §6.3). The value may be
/// empty (`key=`) or absent entirely (`key`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxtEntry {
    pub key: String,
    pub value: Option<Vec<u8>>,
}

impl TxtEntry {
    pub fn new(key: &str, value: &str) -> Self {
        Self {
            key: key.to_string(),
            value: Some(value.as_bytes().to_vec()),
        }
    }

    pub fn key_only(key: &str) -> Self {
        Self {
            key: key.to_string(),
            value: None,
        }
    }

    /// Parse one character-string of a TXT rdata.
    ///
    /// ```
    /// use mdnslib::rfc6762::TxtEntry;
    ///
    /// let e = TxtEntry::from_bytes(b"path=/printers");
    /// assert_eq!(e.key, "path");
    /// assert_eq!(e.value.as_deref(), Some(&b"/printers"[..]));
    ///
    /// let e = TxtEntry::from_bytes(b"paperless");
    /// assert!(e.value.is_none());
    /// ```
    pub fn from_bytes(raw: &[u8]) -> Self {
        match raw.iter().position(|&b| b == b'=') {
            Some(eq) => Self {
                key: String::from_utf8_lossy(&raw[..eq]).into_owned(),
                value: Some(raw[eq + 1..].to_vec()),
            },
            None => Self {
                key: String::from_utf8_lossy(raw).into_owned(),
                value: None,
            },
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = self.key.as_bytes().to_vec();
        if let Some(v) = &self.value {
            out.push(b'=');
            out.extend_from_slice(v);
        }
        out
    }
}

/// SRV rdata (RFC 2782)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SrvData {
    pub priority: u16,
    pub weight: u16,
    pub port: u16,
    pub target: DnsName,
}

/// mDNS-flavor NSEC rdata (RFC 6762 §6.1): the types that *do* exist for the
/// owner name; everything else can be assumed absent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NsecData {
    pub next_domain: DnsName,
    pub types: Vec<u16>,
}

/// Per-variant record data
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RData {
    A(Ipv4Addr),
    Aaaa(Ipv6Addr),
    Ptr(DnsName),
    Srv(SrvData),
    Txt(Vec<TxtEntry>),
    Nsec(NsecData),
    Key(Vec<u8>),
    /// Preserved opaquely when forwarding, ignored when interpreting
    Unknown { rtype: u16, rdata: Vec<u8> },
}

// The reader builds records in place, so an inert default is needed
impl Default for RData {
    fn default() -> Self {
        RData::Unknown {
            rtype: 0,
            rdata: Vec::new(),
        }
    }
}

impl RData {
    pub fn rtype(&self) -> u16 {
        match self {
            RData::A(_) => TYPE_A,
            RData::Aaaa(_) => TYPE_AAAA,
            RData::Ptr(_) => TYPE_PTR,
            RData::Srv(_) => TYPE_SRV,
            RData::Txt(_) => TYPE_TXT,
            RData::Nsec(_) => TYPE_NSEC,
            RData::Key(_) => TYPE_KEY,
            RData::Unknown { rtype, .. } => *rtype,
        }
    }

    /// Content equality with ASCII-case-insensitive name comparison, which
    /// is the equality the known-answer and conflict rules run on.
    pub fn same_data(&self, other: &RData) -> bool {
        match (self, other) {
            (RData::Ptr(a), RData::Ptr(b)) => a.equals_ignore_case(b),
            (RData::Srv(a), RData::Srv(b)) => {
                a.priority == b.priority
                    && a.weight == b.weight
                    && a.port == b.port
                    && a.target.equals_ignore_case(&b.target)
            }
            (RData::Nsec(a), RData::Nsec(b)) => {
                a.next_domain.equals_ignore_case(&b.next_domain) && a.types == b.types
            }
            (a, b) => a == b,
        }
    }

    /// Stable text key for dedup maps: variant data with names folded.
    pub fn fold_key(&self) -> String {
        match self {
            RData::A(a) => format!("A:{}", a),
            RData::Aaaa(a) => format!("AAAA:{}", a),
            RData::Ptr(n) => format!("PTR:{}", n.case_fold()),
            RData::Srv(s) => format!(
                "SRV:{}:{}:{}:{}",
                s.priority,
                s.weight,
                s.port,
                s.target.case_fold()
            ),
            RData::Txt(entries) => {
                let mut s = String::from("TXT");
                for e in entries {
                    s.push(':');
                    for b in e.to_bytes() {
                        s.push_str(&format!("{:02x}", b));
                    }
                }
                s
            }
            RData::Nsec(n) => format!("NSEC:{}:{:?}", n.next_domain.case_fold(), n.types),
            RData::Key(k) => {
                let mut s = String::from("KEY:");
                for b in k {
                    s.push_str(&format!("{:02x}", b));
                }
                s
            }
            RData::Unknown { rtype, rdata } => {
                let mut s = format!("U{}:", rtype);
                for b in rdata {
                    s.push_str(&format!("{:02x}", b));
                }
                s
            }
        }
    }
}

/// A resource record: shared header plus tagged rdata. TTLs are transported
/// in seconds but held in milliseconds against the monotonic clock.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MdnsRecord {
    pub name: DnsName,
    pub cache_flush: bool,
    pub ttl_ms: u64,
    /// monotonic receipt (or creation) time
    pub received_at_ms: u64,
    pub rdata: RData,
}

impl MdnsRecord {
    pub fn new(name: DnsName, cache_flush: bool, ttl_ms: u64, rdata: RData) -> Self {
        Self {
            name,
            cache_flush,
            ttl_ms,
            received_at_ms: 0,
            rdata,
        }
    }

    pub fn rtype(&self) -> u16 {
        self.rdata.rtype()
    }

    pub fn expires_at_ms(&self) -> u64 {
        self.received_at_ms.saturating_add(self.ttl_ms)
    }

    pub fn remaining_ttl_ms(&self, now_ms: u64) -> u64 {
        self.expires_at_ms().saturating_sub(now_ms)
    }

    /// TTL=0 is the withdrawal signal (RFC 6762 §10.1)
    pub fn is_goodbye(&self) -> bool {
        self.ttl_ms == 0
    }

    /// Same owner name, type and content, TTL ignored.
    pub fn same_record(&self, other: &MdnsRecord) -> bool {
        self.name.equals_ignore_case(&other.name) && self.rdata.same_data(&other.rdata)
    }

    /// (name, type, rdata) identity used for answer dedup
    pub fn dedup_key(&self) -> (String, u16, String) {
        (self.name.case_fold(), self.rtype(), self.rdata.fold_key())
    }
}

impl fmt::Display for MdnsRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "NAME:{} TYPE:{} TTL:{}ms FLUSH:{}",
            self.name,
            self.rtype(),
            self.ttl_ms,
            self.cache_flush
        )
    }
}

/// A question. Only questions carry the unicast-response bit.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MdnsQuestion {
    pub name: DnsName,
    pub qtype: u16,
    pub unicast_reply: bool,
}

impl MdnsQuestion {
    pub fn new(name: DnsName, qtype: u16) -> Self {
        Self {
            name,
            qtype,
            unicast_reply: false,
        }
    }

    /// `ANY` matches every concrete type (RFC 1035 §3.2.3)
    pub fn matches_type(&self, rtype: u16) -> bool {
        self.qtype == TYPE_ANY || self.qtype == rtype
    }
}

/// A full mDNS message: id, flags, four ordered sections.
#[derive(Debug, Default, Clone)]
pub struct MdnsPacket {
    pub transaction_id: u16,
    pub flags: u16,
    pub questions: Vec<MdnsQuestion>,
    pub answers: Vec<MdnsRecord>,
    pub authority: Vec<MdnsRecord>,
    pub additional: Vec<MdnsRecord>,
}

impl MdnsPacket {
    pub fn query() -> Self {
        Self {
            transaction_id: 0,
            flags: FLAGS_STANDARD_QUERY,
            ..Default::default()
        }
    }

    pub fn authoritative_response() -> Self {
        Self {
            transaction_id: 0,
            flags: FLAGS_AUTHORITATIVE_RESPONSE,
            ..Default::default()
        }
    }

    pub fn is_response(&self) -> bool {
        self.flags & FLAG_RESPONSE != 0
    }

    pub fn is_truncated(&self) -> bool {
        self.flags & FLAG_TRUNCATED != 0
    }

    /// answers, authority and additional chained, in section order
    pub fn all_records(&self) -> impl Iterator<Item = &MdnsRecord> {
        self.answers
            .iter()
            .chain(self.authority.iter())
            .chain(self.additional.iter())
    }
}
