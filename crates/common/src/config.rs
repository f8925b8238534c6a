use serde::{Deserialize, Serialize};

/// Coordinator behavior/configuration knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Time-to-live for in-memory task contexts in milliseconds.
    ///
    /// The expiry sweep runs every `max(task_ttl_ms, 1 minute)`.
    pub task_ttl_ms: u64,
    /// Max workers in the query worker pool.
    pub query_workers: usize,
    /// Idle period after which pool workers exit, in milliseconds.
    ///
    /// `0` keeps workers alive for the pool lifetime.
    pub worker_idle_timeout_ms: u64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            task_ttl_ms: 5_000,
            query_workers: 16,
            worker_idle_timeout_ms: 30_000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::CoordinatorConfig;

    #[test]
    fn default_roundtrips_through_json() {
        let cfg = CoordinatorConfig::default();
        let json = serde_json::to_string(&cfg).expect("encode config");
        let back: CoordinatorConfig = serde_json::from_str(&json).expect("decode config");
        assert_eq!(back.task_ttl_ms, cfg.task_ttl_ms);
        assert_eq!(back.query_workers, cfg.query_workers);
    }
}
