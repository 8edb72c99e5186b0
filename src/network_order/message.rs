//! mDNS message (de)serialization: names with compression pointers,
//! questions, records, whole packets.
use std::io::Cursor;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::str;

use crate::error::{MdnsError, MdnsResult};
use crate::name::{DnsName, MAX_NAME_LENGTH};
use crate::network_order::{FromNetworkOrder, PacketWriter, ToNetworkOrder};
use crate::rfc6762::{
    MdnsPacket, MdnsQuestion, MdnsRecord, NsecData, RData, SrvData, TxtEntry, CLASS_IN,
    CLASS_TOP_BIT, TYPE_A, TYPE_AAAA, TYPE_KEY, TYPE_NSEC, TYPE_PTR, TYPE_SRV, TYPE_TXT,
};

// DNS packet header: https://datatracker.ietf.org/doc/html/rfc1035#section-4.1.1
#[derive(Debug, Default, PartialEq, Eq)]
pub struct MdnsPacketHeader {
    pub id: u16,
    pub flags: u16,
    pub qd_count: u16, // entries in the question section
    pub an_count: u16, // resource records in the answer section
    pub ns_count: u16, // records in the authority section
    pub ar_count: u16, // records in the additional section
}

impl ToNetworkOrder for MdnsPacketHeader {
    fn to_network_bytes(&self, buffer: &mut PacketWriter) -> MdnsResult<usize> {
        self.id.to_network_bytes(buffer)?;
        self.flags.to_network_bytes(buffer)?;
        self.qd_count.to_network_bytes(buffer)?;
        self.an_count.to_network_bytes(buffer)?;
        self.ns_count.to_network_bytes(buffer)?;
        self.ar_count.to_network_bytes(buffer)?;
        Ok(12)
    }
}

impl FromNetworkOrder for MdnsPacketHeader {
    fn from_network_bytes(&mut self, buffer: &mut Cursor<&[u8]>) -> MdnsResult<()> {
        self.id.from_network_bytes(buffer)?;
        self.flags.from_network_bytes(buffer)?;
        self.qd_count.from_network_bytes(buffer)?;
        self.an_count.from_network_bytes(buffer)?;
        self.ns_count.from_network_bytes(buffer)?;
        self.ar_count.from_network_bytes(buffer)?;
        Ok(())
    }
}

/// Read a possibly-compressed name at the cursor, leaving the cursor just
/// past the name's in-line bytes.
///
/// From RFC 1035, a name is either a sequence of labels ending in a zero
/// octet, a pointer, or a sequence of labels ending with a pointer. Pointer
/// chains are cycle-guarded by capping the number of jumps at the message
/// length.
pub fn read_name(buffer: &mut Cursor<&[u8]>) -> MdnsResult<DnsName> {
    let buf = *buffer.get_ref();
    let len = buf.len();
    let mut pos = buffer.position() as usize;

    let mut labels: Vec<String> = Vec::new();
    let mut end: Option<usize> = None;
    let mut jumps = 0usize;
    let mut decoded = 1usize; // the terminal root byte

    loop {
        if pos >= len {
            return Err(MdnsError::ShortBuffer);
        }
        let b = buf[pos];
        if b & 0xC0 == 0xC0 {
            // two-byte pointer: 0b11 then a 14-bit offset
            if pos + 1 >= len {
                return Err(MdnsError::ShortBuffer);
            }
            let target = (((b & 0x3F) as usize) << 8) | buf[pos + 1] as usize;
            if end.is_none() {
                end = Some(pos + 2);
            }
            jumps += 1;
            if jumps > len || target >= len {
                return Err(MdnsError::BadPointer);
            }
            pos = target;
        } else if b & 0xC0 != 0 {
            // 0b01/0b10 label types are unassigned
            return Err(MdnsError::BadLabel);
        } else if b == 0 {
            if end.is_none() {
                end = Some(pos + 1);
            }
            break;
        } else {
            let l = b as usize;
            if pos + 1 + l > len {
                return Err(MdnsError::ShortBuffer);
            }
            decoded += l + 1;
            if decoded > MAX_NAME_LENGTH {
                return Err(MdnsError::BadLabel);
            }
            labels.push(str::from_utf8(&buf[pos + 1..pos + 1 + l])?.to_string());
            pos += 1 + l;
        }
    }

    buffer.set_position(end.unwrap() as u64);
    Ok(DnsName::from_labels_unchecked(labels))
}

impl ToNetworkOrder for DnsName {
    fn to_network_bytes(&self, buffer: &mut PacketWriter) -> MdnsResult<usize> {
        buffer.write_name(self)
    }
}

impl FromNetworkOrder for DnsName {
    fn from_network_bytes(&mut self, buffer: &mut Cursor<&[u8]>) -> MdnsResult<()> {
        *self = read_name(buffer)?;
        Ok(())
    }
}

impl ToNetworkOrder for MdnsQuestion {
    fn to_network_bytes(&self, buffer: &mut PacketWriter) -> MdnsResult<usize> {
        let start = buffer.len();
        buffer.write_name(&self.name)?;
        self.qtype.to_network_bytes(buffer)?;
        let mut class = CLASS_IN;
        if self.unicast_reply {
            class |= CLASS_TOP_BIT;
        }
        class.to_network_bytes(buffer)?;
        Ok(buffer.len() - start)
    }
}

impl FromNetworkOrder for MdnsQuestion {
    fn from_network_bytes(&mut self, buffer: &mut Cursor<&[u8]>) -> MdnsResult<()> {
        self.name.from_network_bytes(buffer)?;
        self.qtype.from_network_bytes(buffer)?;
        let mut class = 0u16;
        class.from_network_bytes(buffer)?;
        self.unicast_reply = class & CLASS_TOP_BIT != 0;
        Ok(())
    }
}

impl ToNetworkOrder for MdnsRecord {
    fn to_network_bytes(&self, buffer: &mut PacketWriter) -> MdnsResult<usize> {
        let start = buffer.len();
        buffer.write_name(&self.name)?;
        self.rtype().to_network_bytes(buffer)?;
        let mut class = CLASS_IN;
        if self.cache_flush {
            class |= CLASS_TOP_BIT;
        }
        class.to_network_bytes(buffer)?;
        // TTL travels in seconds
        buffer.write_u32((self.ttl_ms / 1000) as u32)?;

        // rdlength is patched once the rdata size is known
        let rdlen_pos = buffer.len();
        buffer.write_u16(0)?;
        let rdata_start = buffer.len();
        write_rdata(&self.rdata, buffer)?;
        let rdlen = buffer.len() - rdata_start;
        buffer.patch_u16(rdlen_pos, rdlen as u16);

        Ok(buffer.len() - start)
    }
}

fn write_rdata(rdata: &RData, buffer: &mut PacketWriter) -> MdnsResult<()> {
    match rdata {
        RData::A(addr) => {
            buffer.write_bytes(&addr.octets())?;
        }
        RData::Aaaa(addr) => {
            buffer.write_bytes(&addr.octets())?;
        }
        RData::Ptr(target) => {
            buffer.write_name(target)?;
        }
        RData::Srv(srv) => {
            srv.priority.to_network_bytes(buffer)?;
            srv.weight.to_network_bytes(buffer)?;
            srv.port.to_network_bytes(buffer)?;
            buffer.write_name(&srv.target)?;
        }
        RData::Txt(entries) => {
            if entries.is_empty() {
                // a TXT record needs at least one (empty) string
                buffer.write_u8(0)?;
            }
            for entry in entries {
                let bytes = entry.to_bytes();
                buffer.write_u8(bytes.len() as u8)?;
                buffer.write_bytes(&bytes)?;
            }
        }
        RData::Nsec(nsec) => {
            buffer.write_name(&nsec.next_domain)?;
            write_nsec_bitmap(&nsec.types, buffer)?;
        }
        RData::Key(bytes) => {
            buffer.write_bytes(bytes)?;
        }
        RData::Unknown { rdata, .. } => {
            buffer.write_bytes(rdata)?;
        }
    }
    Ok(())
}

// RFC 4034 §4.1.2 type bitmaps, one window block per 256-type span
fn write_nsec_bitmap(types: &[u16], buffer: &mut PacketWriter) -> MdnsResult<()> {
    let mut sorted = types.to_vec();
    sorted.sort_unstable();
    sorted.dedup();

    let mut idx = 0usize;
    while idx < sorted.len() {
        let window = sorted[idx] >> 8;
        let mut bitmap = [0u8; 32];
        let mut max_byte = 0usize;
        while idx < sorted.len() && sorted[idx] >> 8 == window {
            let low = (sorted[idx] & 0xFF) as usize;
            bitmap[low / 8] |= 0x80 >> (low % 8);
            max_byte = low / 8;
            idx += 1;
        }
        buffer.write_u8(window as u8)?;
        buffer.write_u8((max_byte + 1) as u8)?;
        buffer.write_bytes(&bitmap[..=max_byte])?;
    }
    Ok(())
}

impl FromNetworkOrder for MdnsRecord {
    fn from_network_bytes(&mut self, buffer: &mut Cursor<&[u8]>) -> MdnsResult<()> {
        self.name.from_network_bytes(buffer)?;
        let mut rtype = 0u16;
        rtype.from_network_bytes(buffer)?;
        let mut class = 0u16;
        class.from_network_bytes(buffer)?;
        self.cache_flush = class & CLASS_TOP_BIT != 0;
        let mut ttl = 0u32;
        ttl.from_network_bytes(buffer)?;
        self.ttl_ms = ttl as u64 * 1000;

        let mut rdlen = 0u16;
        rdlen.from_network_bytes(buffer)?;
        let rdata_end = buffer.position() as usize + rdlen as usize;
        if rdata_end > buffer.get_ref().len() {
            return Err(MdnsError::ShortBuffer);
        }
        self.rdata = read_rdata(buffer, rtype, rdata_end)?;
        if buffer.position() as usize > rdata_end {
            return Err(MdnsError::malformed("rdata overruns its rdlength"));
        }
        buffer.set_position(rdata_end as u64);
        Ok(())
    }
}

fn read_rdata(buffer: &mut Cursor<&[u8]>, rtype: u16, end: usize) -> MdnsResult<RData> {
    let start = buffer.position() as usize;
    let buf = *buffer.get_ref();

    let rdata = match rtype {
        TYPE_A => {
            if end - start != 4 {
                return Err(MdnsError::malformed("A rdata is not 4 bytes"));
            }
            RData::A(Ipv4Addr::new(
                buf[start],
                buf[start + 1],
                buf[start + 2],
                buf[start + 3],
            ))
        }
        TYPE_AAAA => {
            if end - start != 16 {
                return Err(MdnsError::malformed("AAAA rdata is not 16 bytes"));
            }
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&buf[start..end]);
            RData::Aaaa(Ipv6Addr::from(octets))
        }
        TYPE_PTR => RData::Ptr(read_name(buffer)?),
        TYPE_SRV => {
            let mut priority = 0u16;
            priority.from_network_bytes(buffer)?;
            let mut weight = 0u16;
            weight.from_network_bytes(buffer)?;
            let mut port = 0u16;
            port.from_network_bytes(buffer)?;
            let target = read_name(buffer)?;
            RData::Srv(SrvData {
                priority,
                weight,
                port,
                target,
            })
        }
        TYPE_TXT => {
            let mut entries = Vec::new();
            let mut pos = start;
            while pos < end {
                let l = buf[pos] as usize;
                pos += 1;
                if pos + l > end {
                    return Err(MdnsError::ShortBuffer);
                }
                if l > 0 {
                    entries.push(TxtEntry::from_bytes(&buf[pos..pos + l]));
                }
                pos += l;
            }
            RData::Txt(entries)
        }
        TYPE_NSEC => {
            let next_domain = read_name(buffer)?;
            let mut pos = buffer.position() as usize;
            let mut types = Vec::new();
            while pos < end {
                if pos + 2 > end {
                    return Err(MdnsError::ShortBuffer);
                }
                let window = buf[pos] as u16;
                let blen = buf[pos + 1] as usize;
                pos += 2;
                if blen == 0 || blen > 32 || pos + blen > end {
                    return Err(MdnsError::malformed("bad NSEC bitmap window"));
                }
                for (i, byte) in buf[pos..pos + blen].iter().enumerate() {
                    for j in 0..8u16 {
                        if byte & (0x80 >> j) != 0 {
                            types.push((window << 8) | (i as u16 * 8) | j);
                        }
                    }
                }
                pos += blen;
            }
            buffer.set_position(pos as u64);
            RData::Nsec(NsecData { next_domain, types })
        }
        TYPE_KEY => RData::Key(buf[start..end].to_vec()),
        other => RData::Unknown {
            rtype: other,
            rdata: buf[start..end].to_vec(),
        },
    };

    Ok(rdata)
}

impl ToNetworkOrder for MdnsPacket {
    fn to_network_bytes(&self, buffer: &mut PacketWriter) -> MdnsResult<usize> {
        let start = buffer.len();
        let header = MdnsPacketHeader {
            id: self.transaction_id,
            flags: self.flags,
            qd_count: self.questions.len() as u16,
            an_count: self.answers.len() as u16,
            ns_count: self.authority.len() as u16,
            ar_count: self.additional.len() as u16,
        };
        header.to_network_bytes(buffer)?;
        for q in &self.questions {
            q.to_network_bytes(buffer)?;
        }
        for r in self
            .answers
            .iter()
            .chain(self.authority.iter())
            .chain(self.additional.iter())
        {
            r.to_network_bytes(buffer)?;
        }
        Ok(buffer.len() - start)
    }
}

/// Serialize a packet into a fresh unbounded buffer.
pub fn write_packet(packet: &MdnsPacket) -> MdnsResult<Vec<u8>> {
    let mut writer = PacketWriter::new();
    packet.to_network_bytes(&mut writer)?;
    Ok(writer.into_bytes())
}

/// Decode an inbound datagram. Every record is stamped with
/// `received_at_ms`; a decode failure drops the whole packet and mutates
/// nothing.
pub fn parse_packet(buf: &[u8], received_at_ms: u64) -> MdnsResult<MdnsPacket> {
    let mut cursor = Cursor::new(buf);
    let mut header = MdnsPacketHeader::default();
    header.from_network_bytes(&mut cursor)?;

    let mut packet = MdnsPacket {
        transaction_id: header.id,
        flags: header.flags,
        ..Default::default()
    };

    for _ in 0..header.qd_count {
        let mut q = MdnsQuestion::default();
        q.from_network_bytes(&mut cursor)?;
        packet.questions.push(q);
    }
    for section in [
        (&mut packet.answers, header.an_count),
        (&mut packet.authority, header.ns_count),
        (&mut packet.additional, header.ar_count),
    ] {
        let (records, count) = section;
        for _ in 0..count {
            let mut r = MdnsRecord::default();
            r.from_network_bytes(&mut cursor)?;
            r.received_at_ms = received_at_ms;
            records.push(r);
        }
    }

    Ok(packet)
}
