use crate::dns::{self, Field, Packet};
use crate::iface::Interface;
use crate::timer::Instant;

use super::job::{ProbeJobId, QueryJobId, ResponseJobId};
use super::Scheduler;

impl<IF: Interface> Scheduler<IF> {
    pub(super) fn query_elapse(&mut self, id: QueryJobId) {
        let done = match self.queries.get(id) {
            Some(job) => job.done,
            None => return,
        };
        if done {
            self.destroy_query(id);
            return;
        }

        let mtu = self.interface.mtu();
        let mut packet = self.interface.new_query_packet(mtu);
        let mut known_answers = Vec::new();
        let mut n = 0u32;

        // Every not-done query job is opportunistically coalesced into this
        // packet, not just the one whose timer fired — a query due later
        // gets piggybacked early and simply finds itself already done when
        // its own timer eventually fires. Iterating in insertion order (not
        // favouring `id`) keeps coalescing order equal to post order even
        // when two jobs share a deadline.
        for candidate in self.queries.iter_ids().collect::<Vec<_>>() {
            if self.queries.get(candidate).map_or(true, |j| j.done) {
                continue;
            }
            if !self.append_query_job(candidate, packet.as_mut(), &mut known_answers) {
                debug_assert!(
                    candidate != id,
                    "a freshly built packet always fits the job that triggered it"
                );
                break;
            }
            n += 1;
        }

        packet.set_field(Field::Qdcount, n);
        self.send_known_answers(packet, known_answers);
    }

    /// Appends `id`'s key to `packet`; on success marks the job done, rearms
    /// its timer to `QUERY_HISTORY`, and collects the cache's still-fresh
    /// matching entries as known answers.
    fn append_query_job(
        &mut self,
        id: QueryJobId,
        packet: &mut dyn Packet,
        known_answers: &mut Vec<std::sync::Arc<crate::model::Record>>,
    ) -> bool {
        let key = self.queries.get(id).unwrap().key.clone();
        if !packet.append_key(&key, false) {
            return false;
        }

        let now = Instant::now();
        let target = now + self.config.query_history();
        let job = self.queries.get_mut(id).unwrap();
        job.done = true;
        job.delivery = now;
        match job.timer {
            Some(h) => self.timers.update(h, target),
            None => job.timer = Some(self.timers.add(target, super::TimerEvent::Query(id))),
        }

        for entry in self.interface.cache().walk(&key) {
            if entry.more_than_half_fresh(now) {
                known_answers.push(entry.record);
            }
        }
        true
    }

    /// Appends as many known answers as fit in `packet`, spilling overflow
    /// into further packets with TC set on each but the last.
    fn send_known_answers(
        &mut self,
        mut packet: Box<dyn Packet>,
        known_answers: Vec<std::sync::Arc<crate::model::Record>>,
    ) {
        let mut n = 0u32;
        for record in known_answers {
            loop {
                if packet.append_record(&record, false, 0) {
                    n += 1;
                    break;
                }
                debug_assert!(!packet.is_empty(), "a single record does not fit the interface MTU");
                packet.set_field(Field::Ancount, n);
                packet.set_field(Field::Flags, dns::FLAG_TC);
                self.observer.on_truncated(self.interface.index());
                self.interface.send_packet(packet);
                packet = self.interface.new_query_packet(self.interface.mtu());
                n = 0;
            }
        }
        packet.set_field(Field::Ancount, n);
        self.interface.send_packet(packet);
    }

    pub(super) fn response_elapse(&mut self, id: ResponseJobId) {
        let done = match self.responses.get(id) {
            Some(job) => job.done,
            None => return,
        };
        if done {
            self.destroy_response(id);
            return;
        }
        self.send_response_packet(id);
    }

    pub(super) fn send_response_packet(&mut self, trigger: ResponseJobId) {
        let mtu = self.interface.mtu();
        let mut packet = self.interface.new_response_packet(mtu, true);
        let mut n = 0u32;

        // As with queries: every not-done response job is coalesced into
        // this packet in insertion order, not just the one that triggered
        // the send.
        for candidate in self.responses.iter_ids().collect::<Vec<_>>() {
            if self.responses.get(candidate).map_or(true, |j| j.done) {
                continue;
            }
            if !self.append_response_job(candidate, packet.as_mut()) {
                debug_assert!(
                    candidate != trigger,
                    "a freshly built packet always fits the job that triggered it"
                );
                break;
            }
            n += 1;
        }

        packet.set_field(Field::Ancount, n);
        self.interface.send_packet(packet);
    }

    fn append_response_job(&mut self, id: ResponseJobId, packet: &mut dyn Packet) -> bool {
        let (record, flush_cache) = {
            let job = self.responses.get(id).unwrap();
            (job.record.clone(), job.flush_cache)
        };
        if !packet.append_record(&record, flush_cache, 0) {
            return false;
        }

        let now = Instant::now();
        let target = now + self.config.response_history();
        let job = self.responses.get_mut(id).unwrap();
        job.done = true;
        job.delivery = now;
        match job.timer {
            Some(h) => self.timers.update(h, target),
            None => job.timer = Some(self.timers.add(target, super::TimerEvent::Response(id))),
        }
        true
    }

    pub(super) fn probe_elapse(&mut self, id: ProbeJobId) {
        if self.probes.get(id).is_none() {
            return;
        }

        let mtu = self.interface.mtu();
        let mut packet = self.interface.new_query_packet(mtu);

        if !self.try_add_probe(id, packet.as_mut()) {
            let record = self.probes.get(id).unwrap().record.clone();
            self.observer.on_record_too_large(&record);
            self.destroy_probe(id);
            return;
        }

        let mut n = 1u32;
        for candidate in self.probes.iter_ids().collect::<Vec<_>>() {
            if self.probes.get(candidate).map_or(true, |j| j.chosen) {
                continue;
            }
            if !self.try_add_probe(candidate, packet.as_mut()) {
                break;
            }
            n += 1;
        }
        packet.set_field(Field::Qdcount, n);

        let chosen: Vec<ProbeJobId> =
            self.probes.iter_ids().filter(|&pid| self.probes.get(pid).unwrap().chosen).collect();
        let mut ns = 0u32;
        let mut overflow_at = None;
        for (idx, pid) in chosen.iter().enumerate() {
            let record = self.probes.get(*pid).unwrap().record.clone();
            if packet.append_record(&record, false, 0) {
                self.destroy_probe(*pid);
                ns += 1;
            } else {
                self.observer.on_probe_estimate_miss();
                overflow_at = Some(idx);
                break;
            }
        }
        if let Some(idx) = overflow_at {
            for pid in &chosen[idx..] {
                if let Some(job) = self.probes.get_mut(*pid) {
                    job.chosen = false;
                }
            }
        }

        packet.set_field(Field::Nscount, ns);
        self.interface.send_packet(packet);
    }

    /// Appends `id`'s probe question (an ANY question for its name/class),
    /// then opportunistically marks every other not-yet-chosen probe that
    /// shares the same name/class as also covered by this question, as long
    /// as its record estimate still fits.
    fn try_add_probe(&mut self, id: ProbeJobId, packet: &mut dyn Packet) -> bool {
        let (key, size) = {
            let job = self.probes.get(id).unwrap();
            (job.record.key.clone(), job.record.key.size_estimate() + job.record.size_estimate())
        };
        if size > packet.space() {
            return false;
        }

        let any_key = crate::model::Key::new(key.name.clone(), key.class, crate::model::RecordType::Any);
        let appended = packet.append_key(&any_key, false);
        debug_assert!(appended, "size was already checked against the packet's remaining space");

        self.probes.get_mut(id).unwrap().chosen = true;

        for other_id in self.probes.iter_ids().collect::<Vec<_>>() {
            if other_id == id {
                continue;
            }
            let Some(other) = self.probes.get(other_id) else { continue };
            if other.chosen {
                continue;
            }
            if other.record.key.class != key.class
                || !crate::model::Key::domain_equal(&other.record.key.name, &key.name)
            {
                continue;
            }
            if other.record.size_estimate() > packet.space() {
                break;
            }
            self.probes.get_mut(other_id).unwrap().chosen = true;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use bytes::Bytes;

    use crate::iface::TestInterface;
    use crate::model::{DnsClass, Key, Record, RecordType};
    use crate::observer::TracingObserver;
    use crate::Config;

    use super::Scheduler;

    fn scheduler(mtu: usize) -> Scheduler<TestInterface> {
        Scheduler::new(Config::default(), Arc::new(TracingObserver), TestInterface::new(mtu, 1))
    }

    #[tokio::test(start_paused = true)]
    async fn oversized_probe_is_discarded_rather_than_retried() {
        let mut s = scheduler(40);
        let key = Arc::new(Key::new("big.local", DnsClass::In, RecordType::A));
        let record = Arc::new(Record::new(key, 120, Bytes::from(vec![0u8; 64])));

        assert!(s.post_probe(record, true).unwrap());
        assert!(s.tick().await);
        assert!(s.probes.is_empty(), "a probe record too large for the MTU must be dropped, not stuck retrying");
    }

    #[tokio::test(start_paused = true)]
    async fn probes_sharing_a_name_batch_under_one_any_question() {
        let mut s = scheduler(1500);
        let key = Arc::new(Key::new("dup.local", DnsClass::In, RecordType::A));
        let other_key = Arc::new(Key::new("dup.local", DnsClass::In, RecordType::Aaaa));
        let record = Arc::new(Record::new(key, 120, Bytes::from_static(b"\x01")));
        let other_record = Arc::new(Record::new(other_key, 120, Bytes::from_static(b"\x02")));

        assert!(s.post_probe(record, true).unwrap());
        assert!(s.post_probe(other_record, true).unwrap());
        assert!(s.tick().await);

        assert!(s.probes.is_empty(), "both probes sharing a name should have been sent together");
        assert_eq!(s.interface().sent.len(), 1);
        assert_eq!(s.interface().sent[0].qdcount, 1, "one shared ANY question covers both probes");
        assert_eq!(s.interface().sent[0].nscount, 2, "both records go into the authority section");
    }

    #[tokio::test(start_paused = true)]
    async fn probes_that_overflow_the_authority_section_are_unchosen_not_dropped() {
        // Sized so the combined key+record estimate clears the question-phase
        // check for both probes, but the authority section only has room for
        // the first record once both questions have been folded together.
        let mut s = scheduler(60);
        let key = Arc::new(Key::new("dup.local", DnsClass::In, RecordType::A));
        let other_key = Arc::new(Key::new("dup.local", DnsClass::In, RecordType::Aaaa));
        let record = Arc::new(Record::new(key, 120, Bytes::from(vec![0u8; 10])));
        let other_record = Arc::new(Record::new(other_key, 120, Bytes::from(vec![0u8; 10])));

        assert!(s.post_probe(record, true).unwrap());
        assert!(s.post_probe(other_record, true).unwrap());
        assert!(s.tick().await);

        assert_eq!(s.interface().sent.len(), 1);
        assert_eq!(s.interface().sent[0].qdcount, 1);
        assert_eq!(s.interface().sent[0].nscount, 1, "only the first record fit; the second must be un-chosen");
        assert_eq!(s.probes.len(), 1, "the un-chosen probe stays pending for a later retry, not destroyed");
    }
}
