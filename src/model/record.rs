use std::sync::Arc;

use bytes::Bytes;

use super::key::Key;

/// A resource record: a key plus TTL and opaque rdata. `ttl == 0` marks a
/// goodbye record (an announcement that the record is being withdrawn).
#[derive(Clone, Debug)]
pub struct Record {
    pub key: Arc<Key>,
    pub ttl: u32,
    pub rdata: Bytes,
}

impl Record {
    pub fn new(key: Arc<Key>, ttl: u32, rdata: Bytes) -> Self {
        Self { key, ttl, rdata }
    }

    pub fn is_goodbye(&self) -> bool {
        self.ttl == 0
    }

    /// Equality ignoring TTL: same name/class/type and same rdata.
    pub fn equal_no_ttl(&self, other: &Record) -> bool {
        self.key == other.key && self.rdata == other.rdata
    }

    /// Conservative upper bound on the wire size of this record as a DNS
    /// resource record: key plus TTL/RDLENGTH overhead plus rdata.
    pub fn size_estimate(&self) -> usize {
        self.key.size_estimate() + 4 /* ttl */ + 2 /* rdlength */ + self.rdata.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::key::{DnsClass, RecordType};

    fn key() -> Arc<Key> {
        Arc::new(Key::new("example.local", DnsClass::In, RecordType::A))
    }

    #[test]
    fn equal_no_ttl_ignores_ttl() {
        let a = Record::new(key(), 120, Bytes::from_static(b"\x7f\x00\x00\x01"));
        let b = Record::new(key(), 4500, Bytes::from_static(b"\x7f\x00\x00\x01"));
        assert!(a.equal_no_ttl(&b));
    }

    #[test]
    fn goodbye_is_ttl_zero() {
        let r = Record::new(key(), 0, Bytes::new());
        assert!(r.is_goodbye());
    }
}
