use std::time::Duration;

use serde::Deserialize;

/// Timing constants governing the packet scheduler. The `Default` impl
/// matches the protocol-mandated values; an embedding daemon may deserialize
/// overrides from its own configuration format.
#[derive(Clone, Copy, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    pub query_history_ms: u64,
    pub query_defer_ms: u64,
    pub response_history_ms: u64,
    pub response_defer_ms: u64,
    pub response_jitter_ms: u64,
    pub probe_defer_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            query_history_ms: 100,
            query_defer_ms: 100,
            response_history_ms: 700,
            response_defer_ms: 20,
            response_jitter_ms: 100,
            probe_defer_ms: 70,
        }
    }
}

impl Config {
    pub fn query_history(&self) -> Duration {
        Duration::from_millis(self.query_history_ms)
    }

    pub fn query_defer(&self) -> Duration {
        Duration::from_millis(self.query_defer_ms)
    }

    pub fn response_history(&self) -> Duration {
        Duration::from_millis(self.response_history_ms)
    }

    pub fn response_defer(&self) -> Duration {
        Duration::from_millis(self.response_defer_ms)
    }

    pub fn response_jitter(&self) -> Duration {
        Duration::from_millis(self.response_jitter_ms)
    }

    pub fn probe_defer(&self) -> Duration {
        Duration::from_millis(self.probe_defer_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_protocol_constants() {
        let c = Config::default();
        assert_eq!(c.query_history(), Duration::from_millis(100));
        assert_eq!(c.query_defer(), Duration::from_millis(100));
        assert_eq!(c.response_history(), Duration::from_millis(700));
        assert_eq!(c.response_defer(), Duration::from_millis(20));
        assert_eq!(c.response_jitter(), Duration::from_millis(100));
        assert_eq!(c.probe_defer(), Duration::from_millis(70));
    }
}
