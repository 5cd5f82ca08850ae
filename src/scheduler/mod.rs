mod assembly;
mod job;

use std::sync::Arc;

use rand::Rng;

pub use job::{ProbeJobId, QueryJobId, ResponseJobId};
use job::{JobList, ProbeJob, QueryJob, ResponseJob};

use crate::error::SchedulerError;
use crate::iface::Interface;
use crate::model::{Address, Key, Record};
use crate::observer::SchedulerObserver;
use crate::timer::{Instant, TimeEventQueue, WheelTimeEventQueue};
use crate::Config;

#[derive(Clone, Copy, Debug)]
enum TimerEvent {
    Query(QueryJobId),
    Response(ResponseJobId),
    Probe(ProbeJobId),
}

/// Coalesces posted queries, responses, and probes into MTU-bounded packets,
/// applying duplicate- and known-answer suppression along the way. Owns one
/// interface's worth of scheduling state; an embedding responder runs one
/// `Scheduler` per interface.
pub struct Scheduler<IF: Interface> {
    config: Config,
    observer: Arc<dyn SchedulerObserver>,
    interface: IF,
    timers: WheelTimeEventQueue<TimerEvent>,
    queries: JobList<QueryJobId, QueryJob>,
    responses: JobList<ResponseJobId, ResponseJob>,
    probes: JobList<ProbeJobId, ProbeJob>,
}

impl<IF: Interface> Scheduler<IF> {
    pub fn new(config: Config, observer: Arc<dyn SchedulerObserver>, interface: IF) -> Self {
        Self {
            config,
            observer,
            interface,
            timers: WheelTimeEventQueue::new(),
            queries: JobList::new(),
            responses: JobList::new(),
            probes: JobList::new(),
        }
    }

    pub fn interface(&self) -> &IF {
        &self.interface
    }

    pub fn interface_mut(&mut self) -> &mut IF {
        &mut self.interface
    }

    /// Drives the scheduler for as long as it has outstanding timers. The
    /// only suspension point; everything else here is synchronous.
    pub async fn run(&mut self) {
        while self.tick().await {}
    }

    /// Waits for and processes exactly one elapsed timer. Returns `false`
    /// once nothing is scheduled. Exposed separately from `run` so tests can
    /// drive the scheduler deterministically under a paused clock.
    pub async fn tick(&mut self) -> bool {
        let Some(event) = self.timers.next().await else { return false };
        match event {
            TimerEvent::Query(id) => self.query_elapse(id),
            TimerEvent::Response(id) => self.response_elapse(id),
            TimerEvent::Probe(id) => self.probe_elapse(id),
        }
        true
    }

    fn new_query_job(&mut self, key: Arc<Key>, delivery: Instant) -> QueryJobId {
        let id = self.queries.insert(QueryJob { key, delivery, done: false, timer: None });
        let handle = self.timers.add(delivery, TimerEvent::Query(id));
        self.queries.get_mut(id).unwrap().timer = Some(handle);
        id
    }

    fn destroy_query(&mut self, id: QueryJobId) {
        if let Some(job) = self.queries.remove(id) {
            if let Some(h) = job.timer {
                self.timers.remove(h);
            }
        }
    }

    fn destroy_response(&mut self, id: ResponseJobId) {
        if let Some(job) = self.responses.remove(id) {
            if let Some(h) = job.timer {
                self.timers.remove(h);
            }
        }
    }

    fn destroy_probe(&mut self, id: ProbeJobId) {
        if let Some(job) = self.probes.remove(id) {
            if let Some(h) = job.timer {
                self.timers.remove(h);
            }
        }
    }

    /// Schedules a query for `key`, deferred unless `immediately` is set.
    /// Returns `false` if an existing pending (or recently-sent) job for an
    /// equivalent key suppressed this one.
    pub fn post_query(&mut self, key: Arc<Key>, immediately: bool) -> bool {
        let now = Instant::now();
        let target = now + if immediately { std::time::Duration::ZERO } else { self.config.query_defer() };

        if let Some(id) = self.queries.find(|j| j.key.equal(&key)) {
            let (done, delivery, timer) = {
                let job = self.queries.get(id).unwrap();
                (job.done, job.delivery, job.timer)
            };

            // Matches the source's `timeval_diff(&tv, &delivery)`, where `tv`
            // is the new post's own target time, not "now" — a deferred post
            // is judged against when it would actually go out, not when it
            // was requested.
            let within_history = done && target.saturating_duration_since(delivery) <= self.config.query_history();

            if !done || within_history {
                self.observer.on_duplicate_query_suppressed(&key);
                if !done && target < delivery {
                    let job = self.queries.get_mut(id).unwrap();
                    job.delivery = target;
                    self.timers.update(timer.expect("pending query job always has a timer"), target);
                }
                return false;
            }

            self.destroy_query(id);
        }

        self.new_query_job(key, target);
        true
    }

    /// Records that `key` was just seen on the wire from another responder,
    /// suppressing our own queries for it for `QUERY_HISTORY`.
    pub fn incoming_query(&mut self, key: Arc<Key>) {
        let now = Instant::now();
        let target = now + self.config.query_history();

        let id = self
            .queries
            .find(|j| j.key.equal(&key))
            .unwrap_or_else(|| self.queries.insert(QueryJob { key: key.clone(), delivery: now, done: false, timer: None }));

        let job = self.queries.get_mut(id).unwrap();
        job.done = true;
        job.delivery = now;
        match job.timer {
            Some(h) => self.timers.update(h, target),
            None => job.timer = Some(self.timers.add(target, TimerEvent::Query(id))),
        }
    }

    /// Schedules `record` for announcement. Returns `Err` if `record`'s key
    /// is a pattern key (not answerable). Returns `Ok(false)` if suppressed
    /// by an equivalent pending or recent job.
    pub fn post_response(
        &mut self,
        record: Arc<Record>,
        mut flush_cache: bool,
        immediately: bool,
        mut querier: Option<Address>,
    ) -> Result<bool, SchedulerError> {
        if record.key.is_pattern() {
            return Err(SchedulerError::PatternKeyNotAllowed);
        }

        let now = Instant::now();
        let jitter_ms = if immediately {
            0
        } else {
            let max = self.config.response_jitter().as_millis().max(1) as u64;
            rand::thread_rng().gen_range(0..=max)
        };
        let defer = if immediately { std::time::Duration::ZERO } else { self.config.response_defer() };
        let mut target = now + defer + std::time::Duration::from_millis(jitter_ms);

        if let Some(id) = self.responses.find(|j| j.record.equal_no_ttl(&record)) {
            let existing_goodbye;
            let existing_done;
            let existing_flush;
            let existing_delivery;
            let existing_querier;
            {
                let existing = self.responses.get(id).unwrap();
                existing_goodbye = existing.record.is_goodbye();
                existing_done = existing.done;
                existing_flush = existing.flush_cache;
                existing_delivery = existing.delivery;
                existing_querier = existing.querier;
            }

            let goodbye_equal = existing_goodbye == record.is_goodbye();
            let flush_ok = existing_flush || !flush_cache;
            // As in post_query: the done branch is judged against this
            // post's own target time (the source's `tv`), not "now".
            let timing_overlap = if !existing_done {
                target >= existing_delivery
            } else {
                target.saturating_duration_since(existing_delivery) <= self.config.response_history()
            };

            if goodbye_equal && flush_ok && timing_overlap {
                self.observer.on_duplicate_response_suppressed(&record);
                return Ok(false);
            }

            if !existing_done {
                if existing_delivery < target {
                    target = existing_delivery;
                }
                if existing_flush {
                    flush_cache = true;
                }
                if let Some(q) = querier {
                    if existing_querier != Some(q) {
                        querier = None;
                    }
                }
            }

            self.destroy_response(id);
        }

        let id = self.responses.insert(ResponseJob {
            record,
            delivery: target,
            done: false,
            flush_cache,
            querier,
            timer: None,
        });
        let handle = self.timers.add(target, TimerEvent::Response(id));
        self.responses.get_mut(id).unwrap().timer = Some(handle);

        Ok(true)
    }

    /// Records that an equivalent response was just observed on the wire
    /// from another responder.
    pub fn incoming_response(&mut self, record: Arc<Record>, flush_cache: bool) {
        let now = Instant::now();
        let target = now + self.config.response_history();

        if let Some(id) = self.responses.find(|j| j.record.equal_no_ttl(&record)) {
            let (done, existing_flush, existing_goodbye) = {
                let job = self.responses.get(id).unwrap();
                (job.done, job.flush_cache, job.record.is_goodbye())
            };

            if !done {
                if existing_flush && !flush_cache {
                    return;
                }
                if existing_goodbye != record.is_goodbye() {
                    return;
                }
            }

            let merged_flush = existing_flush || flush_cache;
            let job = self.responses.get_mut(id).unwrap();
            job.record = record;
            job.flush_cache = merged_flush;
            job.done = true;
            job.delivery = now;
            match job.timer {
                Some(h) => self.timers.update(h, target),
                None => job.timer = Some(self.timers.add(target, TimerEvent::Response(id))),
            }
            return;
        }

        let id = self.responses.insert(ResponseJob {
            record,
            delivery: now,
            done: true,
            flush_cache,
            querier: None,
            timer: None,
        });
        let handle = self.timers.add(target, TimerEvent::Response(id));
        self.responses.get_mut(id).unwrap().timer = Some(handle);
    }

    /// A querier just sent a known answer with `record`'s name/class/type at
    /// `record.ttl`. If that TTL is still more than half the one we were
    /// about to announce, our matching pending response to that same
    /// querier is cancelled.
    pub fn incoming_known_answer(&mut self, record: &Record, querier: Address) {
        let Some(id) = self.responses.find(|j| j.record.equal_no_ttl(record)) else { return };

        let job = self.responses.get(id).unwrap();
        if job.done {
            return;
        }
        let Some(q) = job.querier else { return };
        if q != querier {
            return;
        }
        if job.record.is_goodbye() != record.is_goodbye() {
            return;
        }
        if record.ttl <= job.record.ttl / 2 {
            return;
        }

        self.observer.on_known_answer_suppression(&job.record.clone());
        self.destroy_response(id);
    }

    /// Schedules a probe for `record`. Returns `Err` if the key is a pattern
    /// key.
    pub fn post_probe(&mut self, record: Arc<Record>, immediately: bool) -> Result<bool, SchedulerError> {
        if record.key.is_pattern() {
            return Err(SchedulerError::PatternKeyNotAllowed);
        }

        let now = Instant::now();
        let target = now + if immediately { std::time::Duration::ZERO } else { self.config.probe_defer() };

        let id = self.probes.insert(ProbeJob { record, delivery: target, chosen: false, timer: None });
        let handle = self.timers.add(target, TimerEvent::Probe(id));
        self.probes.get_mut(id).unwrap().timer = Some(handle);

        Ok(true)
    }

    /// Sends every pending response job immediately, coalescing where jobs
    /// end up sharing a packet as a side effect of `send_response_packet`.
    pub fn flush_responses(&mut self) {
        for id in self.responses.iter_ids().collect::<Vec<_>>() {
            let pending = self.responses.get(id).map_or(false, |j| !j.done);
            if pending {
                self.send_response_packet(id);
            }
        }
    }
}


impl<IF: Interface> Drop for Scheduler<IF> {
    /// Cancels every outstanding timer. Jobs themselves are reclaimed by the
    /// ordinary field drops that follow, but the timer wheel is cleared
    /// explicitly first so no handle into it outlives the job it names.
    fn drop(&mut self) {
        for id in self.queries.iter_ids().collect::<Vec<_>>() {
            if let Some(h) = self.queries.get(id).and_then(|j| j.timer) {
                self.timers.remove(h);
            }
        }
        for id in self.responses.iter_ids().collect::<Vec<_>>() {
            if let Some(h) = self.responses.get(id).and_then(|j| j.timer) {
                self.timers.remove(h);
            }
        }
        for id in self.probes.iter_ids().collect::<Vec<_>>() {
            if let Some(h) = self.probes.get(id).and_then(|j| j.timer) {
                self.timers.remove(h);
            }
        }
    }
}
