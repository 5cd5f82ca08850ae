use crate::model::{Key, Record};

/// Hook for the events a production responder would want to log or count.
/// All methods default to no-ops so tests can implement only the ones they
/// care about.
pub trait SchedulerObserver: Send + Sync {
    fn on_duplicate_query_suppressed(&self, _key: &Key) {}
    fn on_duplicate_response_suppressed(&self, _record: &Record) {}
    fn on_known_answer_suppression(&self, _record: &Record) {}
    fn on_truncated(&self, _interface_index: i32) {}
    fn on_record_too_large(&self, _record: &Record) {}
    fn on_probe_estimate_miss(&self) {}
}

/// Default observer: routine suppression at `debug`, anything that means
/// the estimators or the MTU budget were wrong at `warn`.
#[derive(Debug, Default)]
pub struct TracingObserver;

impl SchedulerObserver for TracingObserver {
    fn on_duplicate_query_suppressed(&self, key: &Key) {
        tracing::debug!(name = %key.name, "duplicate query suppressed");
    }

    fn on_duplicate_response_suppressed(&self, record: &Record) {
        tracing::debug!(name = %record.key.name, "duplicate response suppressed");
    }

    fn on_known_answer_suppression(&self, record: &Record) {
        tracing::debug!(name = %record.key.name, "response cancelled by known-answer suppression");
    }

    fn on_truncated(&self, interface_index: i32) {
        tracing::warn!(interface_index, "known answers spilled past one packet, set TC");
    }

    fn on_record_too_large(&self, record: &Record) {
        tracing::warn!(name = %record.key.name, "record does not fit the interface MTU, discarding probe");
    }

    fn on_probe_estimate_miss(&self) {
        tracing::warn!("probe authority section estimate was wrong, truncating");
    }
}
