//! DNS name handling: validated label sequences, ASCII case-insensitive
//! comparison, and the reverse-DNS names used for address records.
//!
//! Names are stored with their original casing (replies must echo the
//! sender's casing) but compare and hash case-insensitively, as required by
//! RFC 1035 §2.3.3 and RFC 6762 §16.
use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use crate::error::{MdnsError, MdnsResult};

/// Largest label size on the wire (RFC 1035 §2.3.4)
pub const MAX_LABEL_LENGTH: usize = 63;

/// Largest encoded name size, length bytes and root included
pub const MAX_NAME_LENGTH: usize = 255;

/// An ordered list of labels. The terminal root label is implicit and never
/// stored.
#[derive(Debug, Default, Clone)]
pub struct DnsName {
    labels: Vec<String>,
}

impl DnsName {
    /// Build a name from string labels, validating sizes.
    ///
    /// ```
    /// use mdnslib::name::DnsName;
    ///
    /// let name = DnsName::new(&["MyService", "_http", "_tcp", "local"]).unwrap();
    /// assert_eq!(name.to_string(), "MyService._http._tcp.local");
    /// assert!(DnsName::new(&[""]).is_err());
    /// ```
    pub fn new(labels: &[&str]) -> MdnsResult<Self> {
        Self::from_labels(labels.iter().map(|l| l.to_string()).collect())
    }

    pub fn from_labels(labels: Vec<String>) -> MdnsResult<Self> {
        let mut encoded = 1usize; // root
        for label in &labels {
            if label.is_empty() || label.len() > MAX_LABEL_LENGTH {
                return Err(MdnsError::BadLabel);
            }
            encoded += label.len() + 1;
        }
        if encoded > MAX_NAME_LENGTH {
            return Err(MdnsError::BadLabel);
        }
        Ok(Self { labels })
    }

    /// Used by the wire reader, which enforces the size limits itself.
    pub(crate) fn from_labels_unchecked(labels: Vec<String>) -> Self {
        Self { labels }
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    /// Length of the uncompressed wire encoding, root byte included.
    pub fn encoded_len(&self) -> usize {
        self.labels.iter().map(|l| l.len() + 1).sum::<usize>() + 1
    }

    /// New name with `label` prepended, e.g. instance name from a type name.
    pub fn prepended(&self, label: &str) -> MdnsResult<Self> {
        let mut labels = Vec::with_capacity(self.labels.len() + 1);
        labels.push(label.to_string());
        labels.extend(self.labels.iter().cloned());
        Self::from_labels(labels)
    }

    /// New name with `suffix`'s labels appended.
    pub fn appended(&self, suffix: &DnsName) -> MdnsResult<Self> {
        let mut labels = self.labels.clone();
        labels.extend(suffix.labels.iter().cloned());
        Self::from_labels(labels)
    }

    /// ```
    /// use mdnslib::name::DnsName;
    ///
    /// let a = DnsName::try_from("MyService._http._tcp.local").unwrap();
    /// let b = DnsName::try_from("myservice._HTTP._tcp.LOCAL").unwrap();
    /// assert!(a.equals_ignore_case(&b));
    /// ```
    pub fn equals_ignore_case(&self, other: &DnsName) -> bool {
        self.labels.len() == other.labels.len()
            && self
                .labels
                .iter()
                .zip(other.labels.iter())
                .all(|(a, b)| a.eq_ignore_ascii_case(b))
    }

    /// Case-insensitive suffix test, label-aligned.
    pub fn ends_with(&self, suffix: &DnsName) -> bool {
        if suffix.labels.len() > self.labels.len() {
            return false;
        }
        let skip = self.labels.len() - suffix.labels.len();
        self.labels[skip..]
            .iter()
            .zip(suffix.labels.iter())
            .all(|(a, b)| a.eq_ignore_ascii_case(b))
    }

    /// Lowercased copy, used as a map key where a `DnsName` itself is not
    /// convenient.
    pub fn case_fold(&self) -> String {
        let mut s = String::new();
        for label in &self.labels {
            s.push_str(&label.to_ascii_lowercase());
            s.push('.');
        }
        s
    }
}

// Names compare and hash without case so that a HashMap keyed by DnsName
// honors RFC 6762 §16 directly.
impl PartialEq for DnsName {
    fn eq(&self, other: &Self) -> bool {
        self.equals_ignore_case(other)
    }
}

impl Eq for DnsName {}

impl Hash for DnsName {
    fn hash<H: Hasher>(&self, state: &mut H) {
        for label in &self.labels {
            for b in label.as_bytes() {
                state.write_u8(b.to_ascii_lowercase());
            }
            state.write_u8(0);
        }
    }
}

/// ```
/// use mdnslib::name::DnsName;
///
/// let dn = DnsName::try_from("_services._dns-sd._udp.local").unwrap();
/// assert_eq!(dn.labels().len(), 4);
/// assert!(DnsName::try_from("").is_err());
/// ```
impl TryFrom<&str> for DnsName {
    type Error = MdnsError;

    fn try_from(name: &str) -> Result<Self, Self::Error> {
        let labels: Vec<String> = name
            .split('.')
            .filter(|l| !l.is_empty())
            .map(String::from)
            .collect();
        if labels.is_empty() {
            return Err(MdnsError::BadLabel);
        }
        Self::from_labels(labels)
    }
}

impl fmt::Display for DnsName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.labels.is_empty() {
            return write!(f, ".");
        }
        let mut first = true;
        for label in &self.labels {
            if !first {
                write!(f, ".")?;
            }
            write!(f, "{}", label)?;
            first = false;
        }
        Ok(())
    }
}

/// Reverse-DNS name for an address, used as the owner of the PTR records the
/// responder advertises alongside A/AAAA.
///
/// ```
/// use std::net::IpAddr;
/// use mdnslib::name::reverse_dns_name;
///
/// let v4: IpAddr = "192.0.2.123".parse().unwrap();
/// assert_eq!(reverse_dns_name(&v4).to_string(), "123.2.0.192.in-addr.arpa");
/// ```
pub fn reverse_dns_name(addr: &IpAddr) -> DnsName {
    match addr {
        IpAddr::V4(v4) => reverse_dns_name_v4(v4),
        IpAddr::V6(v6) => reverse_dns_name_v6(v6),
    }
}

fn reverse_dns_name_v4(addr: &Ipv4Addr) -> DnsName {
    let o = addr.octets();
    let mut labels: Vec<String> = o.iter().rev().map(|b| b.to_string()).collect();
    labels.push("in-addr".to_string());
    labels.push("arpa".to_string());
    DnsName::from_labels_unchecked(labels)
}

fn reverse_dns_name_v6(addr: &Ipv6Addr) -> DnsName {
    let o = addr.octets();
    let mut labels = Vec::with_capacity(34);
    for b in o.iter().rev() {
        labels.push(format!("{:x}", b & 0x0f));
        labels.push(format!("{:x}", b >> 4));
    }
    labels.push("ip6".to_string());
    labels.push("arpa".to_string());
    DnsName::from_labels_unchecked(labels)
}
