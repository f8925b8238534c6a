use prometheus::{Encoder, IntCounter, IntGauge, Opts, Registry, TextEncoder};

/// Query coordination statistics owned by one task manager instance.
///
/// These counters are the observability contract of the coordinator: the
/// task table sweep, submission flows, and response routing all report
/// through this bundle.
#[derive(Debug, Clone)]
pub struct QueryStatistics {
    /// Live task contexts in the task table.
    pub alive_tasks: IntGauge,
    /// Task contexts ever stored.
    pub created_tasks: IntCounter,
    /// Task contexts evicted by the TTL sweep.
    pub expired_tasks: IntCounter,
    /// Responses dropped because their task id was unknown or evicted.
    pub omitted_responses: IntCounter,
    /// Responses routed to a live task context.
    pub emitted_responses: IntCounter,
    /// Task requests sent successfully.
    pub sent_requests: IntCounter,
    /// Task request send failures.
    pub sent_request_failures: IntCounter,
    /// Task responses sent upstream successfully.
    pub sent_responses: IntCounter,
    /// Task response send failures.
    pub sent_response_failures: IntCounter,
}

impl QueryStatistics {
    /// Create and register the query statistics bundle in `registry`.
    pub fn new(registry: &Registry) -> Self {
        Self {
            alive_tasks: int_gauge(registry, "tsq_query_alive_tasks", "Live task contexts"),
            created_tasks: int_counter(
                registry,
                "tsq_query_created_tasks_total",
                "Task contexts ever stored",
            ),
            expired_tasks: int_counter(
                registry,
                "tsq_query_expired_tasks_total",
                "Task contexts evicted by TTL",
            ),
            omitted_responses: int_counter(
                registry,
                "tsq_query_omitted_responses_total",
                "Responses dropped for unknown task ids",
            ),
            emitted_responses: int_counter(
                registry,
                "tsq_query_emitted_responses_total",
                "Responses routed to live task contexts",
            ),
            sent_requests: int_counter(
                registry,
                "tsq_query_sent_requests_total",
                "Task requests sent",
            ),
            sent_request_failures: int_counter(
                registry,
                "tsq_query_sent_request_failures_total",
                "Task request send failures",
            ),
            sent_responses: int_counter(
                registry,
                "tsq_query_sent_responses_total",
                "Task responses sent upstream",
            ),
            sent_response_failures: int_counter(
                registry,
                "tsq_query_sent_response_failures_total",
                "Task response send failures",
            ),
        }
    }
}

/// Worker pool statistics owned by one pool instance.
#[derive(Debug, Clone)]
pub struct PoolStatistics {
    /// Workers currently alive.
    pub workers_alive: IntGauge,
    /// Workers ever spawned.
    pub workers_created: IntCounter,
    /// Tasks rejected after stop or dropped on cancellation.
    pub tasks_rejected: IntCounter,
}

impl PoolStatistics {
    /// Create and register the pool statistics bundle in `registry`.
    ///
    /// `name` distinguishes multiple pools in one process.
    pub fn new(name: &str, registry: &Registry) -> Self {
        Self {
            workers_alive: int_gauge_named(
                registry,
                name,
                "tsq_pool_workers_alive",
                "Workers currently alive",
            ),
            workers_created: int_counter_named(
                registry,
                name,
                "tsq_pool_workers_created_total",
                "Workers ever spawned",
            ),
            tasks_rejected: int_counter_named(
                registry,
                name,
                "tsq_pool_tasks_rejected_total",
                "Tasks rejected after stop or cancellation",
            ),
        }
    }
}

/// Render every metric registered in `registry` as Prometheus text.
pub fn render_prometheus(registry: &Registry) -> String {
    let metric_families = registry.gather();
    let mut out = Vec::new();
    let enc = TextEncoder::new();
    if enc.encode(&metric_families, &mut out).is_err() {
        return String::new();
    }
    String::from_utf8_lossy(&out).to_string()
}

fn int_counter(registry: &Registry, name: &str, help: &str) -> IntCounter {
    let c = IntCounter::new(name, help).expect("int counter");
    registry
        .register(Box::new(c.clone()))
        .expect("register counter");
    c
}

fn int_gauge(registry: &Registry, name: &str, help: &str) -> IntGauge {
    let g = IntGauge::new(name, help).expect("int gauge");
    registry
        .register(Box::new(g.clone()))
        .expect("register gauge");
    g
}

fn int_counter_named(registry: &Registry, pool: &str, name: &str, help: &str) -> IntCounter {
    let opts = Opts::new(name, help).const_label("pool", pool);
    let c = IntCounter::with_opts(opts).expect("int counter");
    registry
        .register(Box::new(c.clone()))
        .expect("register counter");
    c
}

fn int_gauge_named(registry: &Registry, pool: &str, name: &str, help: &str) -> IntGauge {
    let opts = Opts::new(name, help).const_label("pool", pool);
    let g = IntGauge::with_opts(opts).expect("int gauge");
    registry
        .register(Box::new(g.clone()))
        .expect("register gauge");
    g
}
