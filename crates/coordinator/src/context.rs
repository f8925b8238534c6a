//! Per-query task contexts.
//!
//! Responses from different peers race into one context; each variant
//! serializes observations under its own mutex and drives exactly one
//! outbound channel. Terminal sends never block: if the consumer is gone
//! the event is dropped. The channel closes exactly once.

use std::collections::HashMap;
use std::time::Instant;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tsq_aggregation::{GroupingAggregator, TimeSeriesMergeAggregator};
use tsq_common::error::is_not_found;
use tsq_common::{timeutil, Result, TsqError};
use tsq_models::{LeafNodeStats, Query, QueryStats};
use tsq_protocol::{decode_time_series_list, FieldAggSpec, TaskResponse, TaskType};
use tsq_series::field::AggregatorSpec;
use tsq_series::{AggregateFunc, FieldType, GroupedIterator, TimeSeriesEvent};

/// Which tier registered the context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskRole {
    /// Registered by the root submission flow.
    Root,
    /// Registered on an intermediate node for upstream merging.
    Intermediate,
}

/// Immutable identity shared by every context variant.
#[derive(Debug)]
pub struct TaskHeader {
    task_id: String,
    role: TaskRole,
    parent_task_id: String,
    parent_node: String,
    create_time: i64,
    cancel: CancellationToken,
}

impl TaskHeader {
    fn new(
        task_id: String,
        role: TaskRole,
        parent_task_id: String,
        parent_node: String,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            task_id,
            role,
            parent_task_id,
            parent_node,
            create_time: timeutil::now_millis(),
            cancel,
        }
    }
}

/// Tagged task-context variant; responses are routed here by task id.
pub enum TaskContext {
    /// Root-side intermediate ack tracking.
    IntermediateAck(IntermediateAckTaskContext),
    /// Metric data collection and aggregation.
    Metric(MetricTaskContext),
    /// Raw metadata response forwarding.
    MetaData(MetaDataTaskContext),
}

impl TaskContext {
    fn header(&self) -> &TaskHeader {
        match self {
            TaskContext::IntermediateAck(ctx) => &ctx.header,
            TaskContext::Metric(ctx) => &ctx.header,
            TaskContext::MetaData(ctx) => &ctx.header,
        }
    }

    /// Task id this context is keyed by.
    pub fn task_id(&self) -> &str {
        &self.header().task_id
    }

    /// Tier that registered the context.
    pub fn role(&self) -> TaskRole {
        self.header().role
    }

    /// Parent task id for upstream tracking; empty on root contexts.
    pub fn parent_task_id(&self) -> &str {
        &self.header().parent_task_id
    }

    /// Node to forward merged results to; empty on root contexts.
    pub fn parent_node(&self) -> &str {
        &self.header().parent_node
    }

    /// Cancellation token of the submitting query.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.header().cancel
    }

    /// Returns whether the context outlived `ttl_ms`.
    pub fn expired(&self, ttl_ms: u64) -> bool {
        timeutil::now_millis() - self.header().create_time > ttl_ms as i64
    }

    /// Consume one inbound response.
    pub fn write_response(&self, resp: TaskResponse, from_node: &str) {
        match self {
            TaskContext::IntermediateAck(ctx) => ctx.write_response(resp),
            TaskContext::Metric(ctx) => ctx.write_response(resp, from_node),
            TaskContext::MetaData(ctx) => ctx.write_response(resp),
        }
    }

    /// Returns whether every expected response has been observed.
    pub fn done(&self) -> bool {
        match self {
            TaskContext::IntermediateAck(ctx) => ctx.state.lock().expect_results <= 0,
            TaskContext::Metric(ctx) => ctx.state.lock().expect_results <= 0,
            TaskContext::MetaData(ctx) => ctx.state.lock().expect_results <= 0,
        }
    }
}

/// Tracks how many intermediates have acked the dispatch of a root task.
pub struct IntermediateAckTaskContext {
    header: TaskHeader,
    state: Mutex<AckState>,
}

struct AckState {
    expect_results: i32,
    tx: Option<mpsc::Sender<Result<()>>>,
}

impl IntermediateAckTaskContext {
    /// Build an ack context expecting `expect_results` replies.
    pub fn new(
        task_id: String,
        expect_results: i32,
        tx: mpsc::Sender<Result<()>>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            header: TaskHeader::new(task_id, TaskRole::Root, String::new(), String::new(), cancel),
            state: Mutex::new(AckState {
                expect_results,
                tx: Some(tx),
            }),
        }
    }

    fn write_response(&self, resp: TaskResponse) {
        let mut state = self.state.lock();
        state.expect_results -= 1;
        let Some(tx) = state.tx.as_ref() else {
            return;
        };
        if !resp.err_msg.is_empty() {
            let _ = tx.try_send(Err(TsqError::Server(resp.err_msg)));
        } else if state.expect_results <= 0 {
            let _ = tx.try_send(Ok(()));
        }
        if state.expect_results <= 0 {
            state.tx = None;
        }
    }
}

/// The central collection state machine for one metric query.
pub struct MetricTaskContext {
    header: TaskHeader,
    stmt_query: Query,
    state: Mutex<MetricState>,
}

struct MetricState {
    expect_results: i32,
    // up to expect_results - 1 "not found" replies are tolerable; once the
    // counter hits zero every peer returned not-found and it surfaces
    tolerant_not_founds: i32,
    tx: Option<mpsc::Sender<TimeSeriesEvent>>,
    aggregator_specs: HashMap<String, AggregatorSpec>,
    group_agg: Option<Box<dyn GroupingAggregator>>,
    stats: Option<QueryStats>,
    start_time_ns: i64,
}

impl MetricTaskContext {
    /// Build a metric context expecting `expect_results` responses.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        task_id: String,
        role: TaskRole,
        parent_task_id: String,
        parent_node: String,
        stmt_query: Query,
        expect_results: i32,
        tx: mpsc::Sender<TimeSeriesEvent>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            header: TaskHeader::new(task_id, role, parent_task_id, parent_node, cancel),
            stmt_query,
            state: Mutex::new(MetricState {
                expect_results,
                tolerant_not_founds: expect_results,
                tx: Some(tx),
                aggregator_specs: HashMap::new(),
                group_agg: None,
                stats: None,
                start_time_ns: timeutil::now_nanos(),
            }),
        }
    }

    fn write_response(&self, resp: TaskResponse, from_node: &str) {
        let mut state = self.state.lock();
        state.expect_results -= 1;
        if state.tx.is_none() {
            return;
        }
        if let Err(err) = handle_task_response(&mut state, &self.stmt_query, resp, from_node) {
            let stats = state.stats.take();
            if let Some(tx) = state.tx.take() {
                let _ = tx.try_send(TimeSeriesEvent::Failed { source: err, stats });
            }
            return;
        }
        if state.expect_results > 0 {
            return;
        }
        let series_list = state
            .group_agg
            .as_ref()
            .map(|agg| agg.result_set())
            .unwrap_or_default();
        let aggregator_specs = std::mem::take(&mut state.aggregator_specs);
        let mut stats = state.stats.take();
        if let Some(stats) = stats.as_mut() {
            stats.end = timeutil::now_nanos();
        }
        if let Some(tx) = state.tx.take() {
            let _ = tx.try_send(TimeSeriesEvent::Completed {
                aggregator_specs,
                series_list,
                stats,
            });
        }
    }
}

fn handle_task_response(
    state: &mut MetricState,
    stmt_query: &Query,
    resp: TaskResponse,
    from_node: &str,
) -> Result<()> {
    handle_stats(state, &resp, from_node);

    if check_error(state, &resp)? {
        // tolerable partial not-found
        return Ok(());
    }

    let merge_start = Instant::now();
    let ts_list = decode_time_series_list(&resp.payload)?;
    if ts_list.field_agg_specs.is_empty() {
        // empty leaf result: contributing it would build an empty
        // aggregator and poison subsequent merges
        return Ok(());
    }

    for spec in &ts_list.field_agg_specs {
        state
            .aggregator_specs
            .insert(spec.field_name.clone(), convert_spec(spec)?);
    }

    if state.group_agg.is_none() {
        let specs = state.aggregator_specs.values().cloned().collect();
        // interval ratio is 1 when merging partial results
        state.group_agg = Some(Box::new(TimeSeriesMergeAggregator::new(
            stmt_query.interval,
            1,
            stmt_query.time_range,
            specs,
        )));
    }
    let agg = state.group_agg.as_mut().expect("aggregator just built");

    for ts in ts_list.time_series {
        if ts.fields.is_empty() {
            // no field data: the whole response is ignorable
            return Ok(());
        }
        agg.aggregate(GroupedIterator::new(ts.tags, ts.fields))?;
    }

    if let Some(stats) = state.stats.as_mut() {
        stats.total_cost = merge_start.elapsed().as_nanos() as i64;
    }
    Ok(())
}

fn handle_stats(state: &mut MetricState, resp: &TaskResponse, from_node: &str) {
    if resp.stats.is_empty() {
        return;
    }
    let start_time_ns = state.start_time_ns;
    let stats = state.stats.get_or_insert_with(|| {
        let mut stats = QueryStats::new();
        stats.start = start_time_ns;
        stats
    });
    match resp.task_type() {
        TaskType::Intermediate => {
            let task_stats: QueryStats = serde_json::from_slice(&resp.stats).unwrap_or_default();
            stats.merge_intermediate_task_stats(from_node, task_stats);
        }
        _ => {
            let mut leaf_stats: LeafNodeStats =
                serde_json::from_slice(&resp.stats).unwrap_or_default();
            leaf_stats.net_payload = (resp.stats.len() + resp.payload.len()) as i64;
            stats.merge_leaf_task_stats(from_node, leaf_stats);
        }
    }
}

/// Returns `Ok(true)` when the response should be ignored (tolerable
/// partial not-found), `Ok(false)` when it carries data.
fn check_error(state: &mut MetricState, resp: &TaskResponse) -> Result<bool> {
    if resp.err_msg.is_empty() {
        return Ok(false);
    }
    if resp.not_found || is_not_found(&resp.err_msg) {
        state.tolerant_not_founds -= 1;
        // there may be more responses with real data on the way
        if state.tolerant_not_founds > 0 {
            return Ok(true);
        }
    }
    Err(TsqError::Server(resp.err_msg.clone()))
}

fn convert_spec(spec: &FieldAggSpec) -> Result<AggregatorSpec> {
    Ok(AggregatorSpec {
        field_name: spec.field_name.clone(),
        field_type: FieldType::from_wire(spec.field_type)?,
        functions: spec
            .func_type_list
            .iter()
            .filter_map(|f| AggregateFunc::from_wire(*f))
            .collect(),
    })
}

/// Forwards raw metadata responses one-for-one to its channel.
pub struct MetaDataTaskContext {
    header: TaskHeader,
    state: Mutex<MetaDataState>,
}

struct MetaDataState {
    expect_results: i32,
    tx: Option<mpsc::Sender<TaskResponse>>,
}

impl MetaDataTaskContext {
    /// Build a metadata context expecting `expect_results` responses.
    pub fn new(
        task_id: String,
        expect_results: i32,
        tx: mpsc::Sender<TaskResponse>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            header: TaskHeader::new(task_id, TaskRole::Root, String::new(), String::new(), cancel),
            state: Mutex::new(MetaDataState {
                expect_results,
                tx: Some(tx),
            }),
        }
    }

    fn write_response(&self, resp: TaskResponse) {
        let mut state = self.state.lock();
        state.expect_results -= 1;
        let Some(tx) = state.tx.as_ref() else {
            return;
        };
        let _ = tx.try_send(resp);
        if state.expect_results <= 0 {
            state.tx = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as StdHashMap;
    use tsq_models::{Interval, TimeRange};
    use tsq_protocol::{encode_time_series_list, TimeSeries, TimeSeriesList};
    use tsq_series::field::encode_points;

    fn test_query() -> Query {
        Query {
            metric_name: "cpu.load".to_string(),
            fields: vec!["usage".to_string()],
            group_by: vec!["host".to_string()],
            interval: Interval(10_000),
            time_range: TimeRange {
                start: 0,
                end: 60_000,
            },
        }
    }

    fn metric_context(expect: i32) -> (MetricTaskContext, mpsc::Receiver<TimeSeriesEvent>) {
        let (tx, rx) = mpsc::channel(1);
        let ctx = MetricTaskContext::new(
            "broker-1-1".to_string(),
            TaskRole::Root,
            String::new(),
            String::new(),
            test_query(),
            expect,
            tx,
            CancellationToken::new(),
        );
        (ctx, rx)
    }

    fn leaf_response(task_id: &str, tags: &str, points: &[(i64, f64)]) -> TaskResponse {
        let mut fields = StdHashMap::new();
        fields.insert("usage".to_string(), encode_points(points));
        let list = TimeSeriesList {
            time_series: vec![TimeSeries {
                tags: tags.to_string(),
                fields,
            }],
            field_agg_specs: vec![FieldAggSpec {
                field_name: "usage".to_string(),
                field_type: FieldType::Sum.to_wire(),
                func_type_list: vec![AggregateFunc::Sum.to_wire()],
            }],
        };
        TaskResponse {
            task_id: task_id.to_string(),
            task_type: TaskType::Leaf as i32,
            payload: encode_time_series_list(&list),
            ..TaskResponse::default()
        }
    }

    fn error_response(task_id: &str, err_msg: &str) -> TaskResponse {
        TaskResponse {
            task_id: task_id.to_string(),
            task_type: TaskType::Leaf as i32,
            err_msg: err_msg.to_string(),
            ..TaskResponse::default()
        }
    }

    #[tokio::test]
    async fn ack_context_closes_after_all_acks() {
        let (tx, mut rx) = mpsc::channel(1);
        let ctx = IntermediateAckTaskContext::new(
            "broker-1-1".to_string(),
            2,
            tx,
            CancellationToken::new(),
        );
        ctx.write_response(TaskResponse::default());
        ctx.write_response(TaskResponse::default());
        match rx.recv().await {
            Some(Ok(())) => {}
            other => panic!("expected completion marker, got {other:?}"),
        }
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn ack_context_surfaces_intermediate_error() {
        let (tx, mut rx) = mpsc::channel(1);
        let ctx = IntermediateAckTaskContext::new(
            "broker-1-1".to_string(),
            2,
            tx,
            CancellationToken::new(),
        );
        ctx.write_response(error_response("broker-1-1", "register failed"));
        match rx.recv().await {
            Some(Err(err)) => assert!(err.to_string().contains("register failed")),
            other => panic!("expected error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn metric_context_completion_carries_merged_series() {
        let (ctx, mut rx) = metric_context(2);
        ctx.write_response(leaf_response("broker-1-1", "host=a", &[(0, 1.0)]), "s1");
        assert!(rx.try_recv().is_err());
        ctx.write_response(leaf_response("broker-1-1", "host=b", &[(0, 2.0)]), "s2");
        match rx.recv().await {
            Some(TimeSeriesEvent::Completed {
                series_list,
                aggregator_specs,
                ..
            }) => {
                assert_eq!(series_list.len(), 2);
                assert!(aggregator_specs.contains_key("usage"));
            }
            other => panic!("expected completion, got {other:?}"),
        }
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn partial_not_found_is_tolerated() {
        let (ctx, mut rx) = metric_context(3);
        ctx.write_response(leaf_response("broker-1-1", "host=a", &[(0, 1.0)]), "s1");
        ctx.write_response(error_response("broker-1-1", "tsdb: shard not found"), "s2");
        ctx.write_response(leaf_response("broker-1-1", "host=b", &[(0, 2.0)]), "s3");
        match rx.recv().await {
            Some(TimeSeriesEvent::Completed { series_list, .. }) => {
                assert_eq!(series_list.len(), 2)
            }
            other => panic!("expected completion, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn all_not_found_surfaces_error() {
        let (ctx, mut rx) = metric_context(3);
        for node in ["s1", "s2", "s3"] {
            ctx.write_response(error_response("broker-1-1", "metric not found"), node);
        }
        match rx.recv().await {
            Some(TimeSeriesEvent::Failed { source, .. }) => {
                assert!(source.to_string().contains("not found"))
            }
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn structured_not_found_flag_is_honored() {
        let (ctx, mut rx) = metric_context(2);
        let mut resp = error_response("broker-1-1", "shard 3 missing on this node");
        resp.not_found = true;
        ctx.write_response(resp, "s1");
        ctx.write_response(leaf_response("broker-1-1", "host=a", &[(0, 1.0)]), "s2");
        match rx.recv().await {
            Some(TimeSeriesEvent::Completed { series_list, .. }) => {
                assert_eq!(series_list.len(), 1)
            }
            other => panic!("expected completion, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn other_errors_surface_immediately() {
        let (ctx, mut rx) = metric_context(3);
        ctx.write_response(error_response("broker-1-1", "connection reset"), "s1");
        match rx.recv().await {
            Some(TimeSeriesEvent::Failed { source, .. }) => {
                assert!(source.to_string().contains("connection reset"))
            }
            other => panic!("expected failure, got {other:?}"),
        }
        // channel closed once; later responses are dropped silently
        ctx.write_response(leaf_response("broker-1-1", "host=a", &[(0, 1.0)]), "s2");
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn empty_agg_specs_do_not_poison_the_aggregator() {
        let (ctx, mut rx) = metric_context(2);
        let empty = TaskResponse {
            task_id: "broker-1-1".to_string(),
            task_type: TaskType::Leaf as i32,
            payload: encode_time_series_list(&TimeSeriesList::default()),
            ..TaskResponse::default()
        };
        ctx.write_response(empty, "s1");
        ctx.write_response(leaf_response("broker-1-1", "host=a", &[(0, 1.0)]), "s2");
        match rx.recv().await {
            Some(TimeSeriesEvent::Completed { series_list, .. }) => {
                assert_eq!(series_list.len(), 1)
            }
            other => panic!("expected completion, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn leaf_stats_accumulate_net_payload() {
        let (ctx, mut rx) = metric_context(1);
        let mut resp = leaf_response("broker-1-1", "host=a", &[(0, 1.0)]);
        resp.stats = serde_json::to_vec(&LeafNodeStats {
            total_cost: 5,
            net_payload: 0,
            num_of_series: 1,
        })
        .expect("encode stats");
        let expected_payload = (resp.stats.len() + resp.payload.len()) as i64;
        ctx.write_response(resp, "storage-1:9000");
        match rx.recv().await {
            Some(TimeSeriesEvent::Completed { stats, .. }) => {
                let stats = stats.expect("stats merged");
                assert_eq!(stats.net_payload, expected_payload);
                assert!(stats.leaf_nodes.contains_key("storage-1:9000"));
                assert!(stats.end >= stats.start);
            }
            other => panic!("expected completion, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn metadata_context_forwards_raw_responses() {
        let (tx, mut rx) = mpsc::channel(2);
        let ctx = MetaDataTaskContext::new(
            "broker-1-2".to_string(),
            2,
            tx,
            CancellationToken::new(),
        );
        ctx.write_response(TaskResponse {
            payload: vec![1],
            ..TaskResponse::default()
        });
        ctx.write_response(TaskResponse {
            payload: vec![2],
            ..TaskResponse::default()
        });
        assert_eq!(rx.recv().await.expect("first").payload, vec![1]);
        assert_eq!(rx.recv().await.expect("second").payload, vec![2]);
        assert!(rx.recv().await.is_none());
    }

    #[test]
    fn expiry_tracks_create_time() {
        let (ctx, _rx) = metric_context(1);
        let ctx = TaskContext::Metric(ctx);
        assert!(!ctx.expired(60_000));
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert!(ctx.expired(1));
    }
}
