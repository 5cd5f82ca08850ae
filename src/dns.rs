use crate::model::{Key, Record};

/// Header field a packet's counts/flags live in. `set_field` on `Flags` ORs
/// the value in, since a packet may accumulate more than one flag bit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Field {
    Qdcount,
    Ancount,
    Nscount,
    Flags,
}

pub const FLAG_TC: u32 = 0x0200;
pub const FLAG_AA: u32 = 0x0400;

/// The wire-packet collaborator the scheduler packs records into. A real
/// responder implements this over its own DNS codec; `BudgetPacket` tracks
/// only a byte budget and header counts, enough to exercise MTU-bounded
/// coalescing without an actual encoder.
pub trait Packet: std::fmt::Debug {
    fn append_key(&mut self, key: &Key, unicast_response: bool) -> bool;
    fn append_record(&mut self, record: &Record, flush_cache: bool, max_ttl: u32) -> bool;
    fn space(&self) -> usize;
    fn is_empty(&self) -> bool;
    fn set_field(&mut self, field: Field, value: u32);
    fn summary(&self) -> PacketSummary;
    fn as_any(&self) -> &dyn std::any::Any;
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PacketSummary {
    pub qdcount: u32,
    pub ancount: u32,
    pub nscount: u32,
    pub flags: u32,
}

const HEADER_OVERHEAD: usize = 12;

#[derive(Clone, Debug)]
pub struct BudgetPacket {
    remaining: usize,
    authoritative: bool,
    summary: PacketSummary,
    /// Names appended, in append order. Not part of any real wire packet;
    /// exists so tests can assert on coalescing order without an encoder.
    appended: Vec<String>,
}

impl BudgetPacket {
    fn with_budget(mtu: usize, authoritative: bool) -> Self {
        Self {
            remaining: mtu.saturating_sub(HEADER_OVERHEAD),
            authoritative,
            summary: PacketSummary::default(),
            appended: Vec::new(),
        }
    }

    pub fn is_authoritative(&self) -> bool {
        self.authoritative
    }

    pub fn appended(&self) -> &[String] {
        &self.appended
    }
}

pub fn new_query(mtu: usize) -> BudgetPacket {
    BudgetPacket::with_budget(mtu, false)
}

pub fn new_response(mtu: usize, authoritative: bool) -> BudgetPacket {
    BudgetPacket::with_budget(mtu, authoritative)
}

impl Packet for BudgetPacket {
    fn append_key(&mut self, key: &Key, _unicast_response: bool) -> bool {
        let size = key.size_estimate();
        if size > self.remaining {
            return false;
        }
        self.remaining -= size;
        self.appended.push(key.name.to_string());
        true
    }

    fn append_record(&mut self, record: &Record, flush_cache: bool, max_ttl: u32) -> bool {
        let size = record.size_estimate();
        if size > self.remaining {
            return false;
        }
        self.remaining -= size;
        self.appended.push(record.key.name.to_string());
        let _ = (flush_cache, max_ttl);
        true
    }

    fn space(&self) -> usize {
        self.remaining
    }

    fn is_empty(&self) -> bool {
        self.appended.is_empty()
    }

    fn set_field(&mut self, field: Field, value: u32) {
        match field {
            Field::Qdcount => self.summary.qdcount = value,
            Field::Ancount => self.summary.ancount = value,
            Field::Nscount => self.summary.nscount = value,
            Field::Flags => self.summary.flags |= value,
        }
    }

    fn summary(&self) -> PacketSummary {
        self.summary
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DnsClass, RecordType};
    use bytes::Bytes;
    use std::sync::Arc;

    #[test]
    fn budget_shrinks_as_records_are_appended() {
        let mut packet = new_query(128);
        let key = Key::new("example.local", DnsClass::In, RecordType::A);
        let space_before = packet.space();
        assert!(packet.append_key(&key, false));
        assert!(packet.space() < space_before);
    }

    #[test]
    fn oversized_record_is_rejected() {
        let mut packet = new_response(40, true);
        let key = Arc::new(Key::new("example.local", DnsClass::In, RecordType::Txt));
        let record = Record::new(key, 120, Bytes::from(vec![0u8; 256]));
        assert!(!packet.append_record(&record, false, 0));
    }

    #[test]
    fn is_empty_tracks_appended_content_not_header_fields() {
        let mut packet = new_query(128);
        assert!(packet.is_empty());
        packet.set_field(Field::Qdcount, 1);
        assert!(packet.is_empty(), "setting a header field alone must not count as content");

        let key = Key::new("example.local", DnsClass::In, RecordType::A);
        assert!(packet.append_key(&key, false));
        assert!(!packet.is_empty());
    }

    #[test]
    fn flags_accumulate_rather_than_overwrite() {
        let mut packet = new_query(512);
        packet.set_field(Field::Flags, FLAG_TC);
        packet.set_field(Field::Flags, FLAG_AA);
        assert_eq!(packet.summary().flags, FLAG_TC | FLAG_AA);
    }
}
