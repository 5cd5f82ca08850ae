use std::sync::Arc;

use tokio::time::Instant;

use crate::dns::{self, Packet, PacketSummary};
use crate::model::{Key, Record};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Protocol {
    V4,
    V6,
}

/// One cache entry as tracked by the interface's record cache, with enough
/// bookkeeping to answer a half-TTL freshness check.
#[derive(Clone, Debug)]
pub struct CacheEntry {
    pub record: Arc<Record>,
    pub original_ttl: u32,
    pub inserted_at: Instant,
}

impl CacheEntry {
    pub fn remaining_ttl(&self, now: Instant) -> u32 {
        let elapsed = now.saturating_duration_since(self.inserted_at).as_secs() as u32;
        self.original_ttl.saturating_sub(elapsed)
    }

    /// True once more than half the original TTL remains, the freshness bar
    /// the known-answer populator uses to decide whether an entry is worth
    /// advertising.
    pub fn more_than_half_fresh(&self, now: Instant) -> bool {
        self.remaining_ttl(now) * 2 > self.original_ttl
    }
}

/// The record cache collaborator: everything the scheduler needs to walk
/// entries matching a (possibly pattern) key.
pub trait Cache {
    fn walk(&self, pattern: &Key) -> Vec<CacheEntry>;
}

/// Reference cache: an unindexed vec is plenty for the entry counts a
/// single mDNS responder ever holds per interface.
#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: Vec<CacheEntry>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, record: Arc<Record>) {
        let entry = CacheEntry { original_ttl: record.ttl, record, inserted_at: Instant::now() };
        self.entries.push(entry);
    }
}

impl Cache for MemoryCache {
    fn walk(&self, pattern: &Key) -> Vec<CacheEntry> {
        self.entries.iter().filter(|e| pattern.matches(&e.record.key)).cloned().collect()
    }
}

/// The interface collaborator: MTU, identity, and the two ways the
/// scheduler ever gets bytes out the door (building a fresh packet, sending
/// a finished one).
pub trait Interface {
    fn mtu(&self) -> usize;
    fn index(&self) -> i32;
    fn protocol(&self) -> Protocol;
    fn cache(&self) -> &dyn Cache;
    fn new_query_packet(&self, mtu: usize) -> Box<dyn Packet>;
    fn new_response_packet(&self, mtu: usize, authoritative: bool) -> Box<dyn Packet>;
    fn send_packet(&mut self, packet: Box<dyn Packet>);
}

/// Reference interface used by tests: records what would have been sent
/// instead of touching a socket.
#[derive(Debug)]
pub struct TestInterface {
    pub mtu: usize,
    pub index: i32,
    pub protocol_kind: Protocol,
    pub cache: MemoryCache,
    pub sent: Vec<PacketSummary>,
    /// Names appended to each sent packet, in append order, for tests that
    /// care about coalescing order rather than just the header counts.
    pub sent_names: Vec<Vec<String>>,
}

impl TestInterface {
    pub fn new(mtu: usize, index: i32) -> Self {
        Self {
            mtu,
            index,
            protocol_kind: Protocol::V4,
            cache: MemoryCache::new(),
            sent: Vec::new(),
            sent_names: Vec::new(),
        }
    }
}

impl Interface for TestInterface {
    fn mtu(&self) -> usize {
        self.mtu
    }

    fn index(&self) -> i32 {
        self.index
    }

    fn protocol(&self) -> Protocol {
        self.protocol_kind
    }

    fn cache(&self) -> &dyn Cache {
        &self.cache
    }

    fn new_query_packet(&self, mtu: usize) -> Box<dyn Packet> {
        Box::new(dns::new_query(mtu))
    }

    fn new_response_packet(&self, mtu: usize, authoritative: bool) -> Box<dyn Packet> {
        Box::new(dns::new_response(mtu, authoritative))
    }

    fn send_packet(&mut self, packet: Box<dyn Packet>) {
        self.sent.push(packet.summary());
        let names = packet
            .as_any()
            .downcast_ref::<dns::BudgetPacket>()
            .map(|bp| bp.appended().to_vec())
            .unwrap_or_default();
        self.sent_names.push(names);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DnsClass, RecordType};
    use bytes::Bytes;

    fn record(name: &str, ttl: u32) -> Arc<Record> {
        let key = Arc::new(Key::new(name, DnsClass::In, RecordType::A));
        Arc::new(Record::new(key, ttl, Bytes::from_static(b"\x7f\x00\x00\x01")))
    }

    #[test]
    fn walk_matches_by_pattern() {
        let mut cache = MemoryCache::new();
        cache.insert(record("host.local", 120));

        let pattern = Key::new("host.local", DnsClass::In, RecordType::Any);
        assert_eq!(cache.walk(&pattern).len(), 1);

        let miss = Key::new("other.local", DnsClass::In, RecordType::Any);
        assert!(cache.walk(&miss).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn half_ttl_freshness() {
        let mut cache = MemoryCache::new();
        cache.insert(record("host.local", 100));
        let entry = cache.walk(&Key::new("host.local", DnsClass::In, RecordType::Any))
            .into_iter()
            .next()
            .unwrap();

        assert!(entry.more_than_half_fresh(Instant::now()));

        tokio::time::advance(std::time::Duration::from_secs(60)).await;
        assert!(!entry.more_than_half_fresh(Instant::now()));
    }
}
