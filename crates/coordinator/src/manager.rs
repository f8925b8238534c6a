//! Task manager: identifier allocation, outbound dispatch, inbound routing,
//! and TTL cleanup.
//!
//! Submission flows:
//! - [`TaskManager::submit_metric_task`] runs the three-tier protocol: when
//!   intermediates exist, an ack round-trip guarantees every intermediate
//!   has a live context before any leaf learns the root task id;
//! - [`TaskManager::submit_intermediate_metric_task`] registers the
//!   intermediate-side merge context under the root task id;
//! - [`TaskManager::submit_metadata_task`] fans a metadata request out to
//!   every leaf and forwards raw responses.
//!
//! Inbound routing must return promptly: [`TaskManager::receive`] only
//! resolves the context and hands the response to the worker pool.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use tsq_common::{QueryStatistics, Result, TsqError};
use tsq_models::{MetricMetadata, PhysicalPlan, Query, Request, Target};
use tsq_protocol::{RequestType, TaskRequest, TaskResponse, TaskType};
use tsq_series::TimeSeriesEvent;

use crate::context::{
    IntermediateAckTaskContext, MetaDataTaskContext, MetricTaskContext, TaskContext, TaskRole,
};
use crate::pool::{Pool, Task};
use crate::transport::{TaskClientFactory, TaskReceiver, TaskServerFactory};

/// Caller-side query context: cancellation plus request identity.
///
/// Cancellation applies only while the submit call waits on intermediate
/// acks; after submission the TTL sweep is the cleanup path.
#[derive(Debug, Clone, Default)]
pub struct QueryContext {
    cancel: CancellationToken,
    request: Option<Request>,
}

impl QueryContext {
    /// Build a context with no request identity.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a context carrying the caller's request identity.
    pub fn with_request(request: Request) -> Self {
        Self {
            cancel: CancellationToken::new(),
            request: Some(request),
        }
    }

    /// Cancellation token observed by the submit call and pool tasks.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Cancel the context.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Externally assigned request id; empty when absent.
    pub fn request_id(&self) -> &str {
        self.request
            .as_ref()
            .map(|r| r.request_id.as_str())
            .unwrap_or("")
    }
}

/// The single authority for task tracking on one node.
#[derive(Clone)]
pub struct TaskManager {
    inner: Arc<TaskManagerInner>,
}

pub(crate) struct TaskManagerInner {
    current_node: String,
    seq: AtomicI64,
    client_factory: Arc<dyn TaskClientFactory>,
    server_factory: Arc<dyn TaskServerFactory>,
    worker_pool: Pool,
    tasks: DashMap<String, Arc<TaskContext>>,
    ttl_ms: u64,
    statistics: QueryStatistics,
    shutdown: CancellationToken,
}

impl TaskManager {
    /// Create the task manager for `current_node` and start its TTL sweep.
    pub fn new(
        current_node: impl Into<String>,
        client_factory: Arc<dyn TaskClientFactory>,
        server_factory: Arc<dyn TaskServerFactory>,
        worker_pool: Pool,
        ttl_ms: u64,
        statistics: QueryStatistics,
    ) -> Self {
        let inner = Arc::new(TaskManagerInner {
            current_node: current_node.into(),
            seq: AtomicI64::new(0),
            client_factory,
            server_factory,
            worker_pool,
            tasks: DashMap::new(),
            ttl_ms,
            statistics,
            shutdown: CancellationToken::new(),
        });

        let sweep = Arc::clone(&inner);
        tokio::spawn(async move {
            let period = Duration::from_millis(sweep.ttl_ms.max(60_000));
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await; // first tick fires immediately
            loop {
                tokio::select! {
                    _ = sweep.shutdown.cancelled() => return,
                    _ = ticker.tick() => sweep.expire_tasks(),
                }
            }
        });

        Self { inner }
    }

    /// Allocate a process-unique task id: `<node>-<monotonic sequence>`.
    pub fn alloc_task_id(&self) -> String {
        let seq = self.inner.seq.fetch_add(1, Ordering::Relaxed) + 1;
        format!("{}-{}", self.inner.current_node, seq)
    }

    /// Submit a metric query: fan the plan out and return the event channel.
    ///
    /// With intermediates, the ack round-trip completes before any leaf
    /// request is dispatched; storage responses may otherwise overtake the
    /// intermediate registrations and be dropped as unknown tasks.
    pub async fn submit_metric_task(
        &self,
        ctx: &QueryContext,
        plan: &PhysicalPlan,
        query: &Query,
    ) -> Result<mpsc::Receiver<TimeSeriesEvent>> {
        plan.validate()?;
        let root_task_id = self.alloc_task_id();
        let plan_bytes =
            serde_json::to_vec(plan).map_err(|e| TsqError::Decode(e.to_string()))?;
        let payload = query.marshal()?;

        if !plan.intermediates.is_empty() {
            let req = TaskRequest {
                request_id: String::new(),
                parent_task_id: root_task_id.clone(),
                task_type: TaskType::Intermediate as i32,
                request_type: RequestType::Data as i32,
                physical_plan: plan_bytes.clone(),
                payload: payload.clone(),
            };
            self.ensure_intermediate_ack_tasks(ctx, plan, &req).await?;
        }

        // register the context and hand the channel out before dispatching,
        // so an early response always finds a reader
        let (tx, rx) = mpsc::channel(1);
        let metric_ctx = MetricTaskContext::new(
            root_task_id.clone(),
            TaskRole::Root,
            String::new(),
            String::new(),
            query.clone(),
            plan.root.num_of_task,
            tx,
            ctx.cancel_token().clone(),
        );
        self.inner
            .store_task(root_task_id.clone(), Arc::new(TaskContext::Metric(metric_ctx)));

        let req = TaskRequest {
            request_id: ctx.request_id().to_string(),
            parent_task_id: root_task_id.clone(),
            task_type: TaskType::Leaf as i32,
            request_type: RequestType::Data as i32,
            physical_plan: plan_bytes,
            payload,
        };
        let (successes, first_error) = self.fanout(&plan.leaves, &req, ctx.cancel_token()).await;
        if successes == 0 {
            self.inner.evict_task(&root_task_id);
            return Err(first_error
                .unwrap_or_else(|| TsqError::TaskSend("no leaf dispatch succeeded".to_string())));
        }
        if let Some(err) = first_error {
            // responses from the successful subset still complete the task
            warn!(
                task_id = %root_task_id,
                error = %err,
                "partial leaf dispatch failure"
            );
        }
        Ok(rx)
    }

    /// Register the intermediate-side merge context for a root task.
    ///
    /// The context is keyed by `parent_task_id` so leaf responses flowing
    /// up through this node resolve to it directly.
    pub fn submit_intermediate_metric_task(
        &self,
        ctx: &QueryContext,
        plan: &PhysicalPlan,
        query: &Query,
        parent_task_id: &str,
    ) -> mpsc::Receiver<TimeSeriesEvent> {
        let (tx, rx) = mpsc::channel(1);
        let metric_ctx = MetricTaskContext::new(
            parent_task_id.to_string(),
            TaskRole::Intermediate,
            parent_task_id.to_string(),
            plan.root.indicator.clone(),
            query.clone(),
            plan.leaves.len() as i32,
            tx,
            ctx.cancel_token().clone(),
        );
        self.inner.store_task(
            parent_task_id.to_string(),
            Arc::new(TaskContext::Metric(metric_ctx)),
        );
        rx
    }

    /// Fan a metadata suggestion out to every leaf.
    pub async fn submit_metadata_task(
        &self,
        ctx: &QueryContext,
        plan: &PhysicalPlan,
        suggest: &MetricMetadata,
    ) -> Result<mpsc::Receiver<TaskResponse>> {
        let task_id = self.alloc_task_id();
        let req = TaskRequest {
            request_id: ctx.request_id().to_string(),
            parent_task_id: task_id.clone(),
            task_type: TaskType::Leaf as i32,
            request_type: RequestType::Metadata as i32,
            physical_plan: serde_json::to_vec(plan)
                .map_err(|e| TsqError::Decode(e.to_string()))?,
            payload: suggest.marshal()?,
        };

        let expect = plan.root.num_of_task;
        let (tx, rx) = mpsc::channel(expect.max(1) as usize);
        let meta_ctx =
            MetaDataTaskContext::new(task_id.clone(), expect, tx, ctx.cancel_token().clone());
        self.inner
            .store_task(task_id.clone(), Arc::new(TaskContext::MetaData(meta_ctx)));

        let (successes, first_error) = self.fanout(&plan.leaves, &req, ctx.cancel_token()).await;
        if successes == 0 {
            self.inner.evict_task(&task_id);
            return Err(first_error
                .unwrap_or_else(|| TsqError::TaskSend("no leaf dispatch succeeded".to_string())));
        }
        Ok(rx)
    }

    /// Send one task request to `target_node`.
    pub fn send_request(&self, target_node: &str, req: TaskRequest) -> Result<()> {
        self.inner.send_request(target_node, req)
    }

    /// Send one task response upstream to `parent_node`.
    pub fn send_response(&self, parent_node: &str, resp: TaskResponse) -> Result<()> {
        self.inner.send_response(parent_node, resp)
    }

    /// Route an inbound response to its context; processing is async.
    ///
    /// Unknown task ids are counted and dropped: the task may have been
    /// evicted by the TTL sweep before this straggler arrived.
    pub fn receive(&self, resp: TaskResponse, from_node: &str) -> Result<()> {
        let Some(entry) = self.inner.tasks.get(&resp.task_id) else {
            self.inner.statistics.omitted_responses.inc();
            return Err(TsqError::UnknownTask(resp.task_id.clone()));
        };
        let task_ctx = Arc::clone(entry.value());
        drop(entry);
        self.inner.statistics.emitted_responses.inc();

        let inner = Arc::clone(&self.inner);
        let from_node = from_node.to_string();
        let task_id = resp.task_id.clone();
        let cancel = task_ctx.cancel_token().clone();
        self.inner.worker_pool.submit(
            &cancel,
            Task::new(move || {
                task_ctx.write_response(resp, &from_node);
                if task_ctx.done() {
                    // identity-guarded: the id may already name a newer
                    // context registered after an ack-context eviction
                    inner.evict_task_if(&task_id, &task_ctx);
                }
            }),
        );
        Ok(())
    }

    /// Statistics bundle of this manager.
    pub fn statistics(&self) -> &QueryStatistics {
        &self.inner.statistics
    }

    /// Stop the TTL sweep. Outstanding contexts stay until process exit.
    pub fn close(&self) {
        self.inner.shutdown.cancel();
    }

    /// Block until every intermediate has registered a context for the
    /// root task and acked, the context is cancelled, or a dispatch fails.
    async fn ensure_intermediate_ack_tasks(
        &self,
        ctx: &QueryContext,
        plan: &PhysicalPlan,
        req: &TaskRequest,
    ) -> Result<()> {
        let (tx, mut rx) = mpsc::channel::<Result<()>>(1);
        let ack_ctx = IntermediateAckTaskContext::new(
            req.parent_task_id.clone(),
            plan.intermediates.len() as i32,
            tx,
            ctx.cancel_token().clone(),
        );
        self.inner.store_task(
            req.parent_task_id.clone(),
            Arc::new(TaskContext::IntermediateAck(ack_ctx)),
        );

        let result = async {
            let (successes, first_error) =
                self.fanout(&plan.intermediates, req, ctx.cancel_token()).await;
            if let Some(err) = first_error {
                return Err(err);
            }
            if successes < plan.intermediates.len() {
                return Err(TsqError::TaskSend(
                    "intermediate dispatch incomplete".to_string(),
                ));
            }
            tokio::select! {
                maybe = rx.recv() => match maybe {
                    Some(Ok(())) => Ok(()),
                    Some(Err(err)) => Err(err),
                    None => Err(TsqError::MissingIntermediateAcks),
                },
                _ = ctx.cancel_token().cancelled() => Err(TsqError::Timeout),
            }
        }
        .await;
        self.inner.evict_task(&req.parent_task_id);
        result
    }

    /// Parallel-send `req` to every target through the worker pool.
    ///
    /// Returns the success count and the first observed error.
    async fn fanout(
        &self,
        targets: &[Target],
        req: &TaskRequest,
        cancel: &CancellationToken,
    ) -> (usize, Option<TsqError>) {
        if targets.is_empty() {
            return (0, None);
        }
        let (done_tx, mut done_rx) = mpsc::channel::<bool>(targets.len());
        let error_slot: Arc<Mutex<Option<TsqError>>> = Arc::new(Mutex::new(None));
        for target in targets {
            let inner = Arc::clone(&self.inner);
            let req = req.clone();
            let node = target.indicator.clone();
            let done = done_tx.clone();
            let slot = Arc::clone(&error_slot);
            self.inner.worker_pool.submit(
                cancel,
                Task::new(move || {
                    let ok = match inner.send_request(&node, req) {
                        Ok(()) => true,
                        Err(err) => {
                            let mut slot = slot.lock();
                            if slot.is_none() {
                                *slot = Some(err);
                            }
                            false
                        }
                    };
                    let _ = done.try_send(ok);
                }),
            );
        }
        drop(done_tx);

        // rejected or cancelled pool tasks drop their sender without a
        // marker; recv() returning None accounts for them as failures
        let mut successes = 0;
        while let Some(ok) = done_rx.recv().await {
            if ok {
                successes += 1;
            }
        }
        let err = error_slot.lock().take();
        (successes, err)
    }
}

impl TaskReceiver for TaskManager {
    fn receive(&self, resp: TaskResponse, from_node: &str) -> Result<()> {
        TaskManager::receive(self, resp, from_node)
    }
}

impl TaskManagerInner {
    fn store_task(&self, task_id: String, task_ctx: Arc<TaskContext>) {
        if self.tasks.insert(task_id, task_ctx).is_none() {
            self.statistics.alive_tasks.inc();
        }
        self.statistics.created_tasks.inc();
    }

    fn evict_task(&self, task_id: &str) {
        if self.tasks.remove(task_id).is_some() {
            self.statistics.alive_tasks.dec();
        }
    }

    fn evict_task_if(&self, task_id: &str, expected: &Arc<TaskContext>) {
        if self
            .tasks
            .remove_if(task_id, |_, current| Arc::ptr_eq(current, expected))
            .is_some()
        {
            self.statistics.alive_tasks.dec();
        }
    }

    pub(crate) fn expire_tasks(&self) {
        let expired: Vec<String> = self
            .tasks
            .iter()
            .filter(|entry| entry.value().expired(self.ttl_ms))
            .map(|entry| entry.key().clone())
            .collect();
        for task_id in expired {
            if self.tasks.remove(&task_id).is_some() {
                self.statistics.alive_tasks.dec();
                self.statistics.expired_tasks.inc();
                debug!(task_id = %task_id, "evicted expired task");
            }
        }
    }

    fn send_request(&self, target_node: &str, req: TaskRequest) -> Result<()> {
        debug!(target = %target_node, "send query task");
        let Some(client) = self.client_factory.task_client(target_node) else {
            self.statistics.sent_request_failures.inc();
            return Err(TsqError::NoSendStream(target_node.to_string()));
        };
        if client.send(req).is_err() {
            self.statistics.sent_request_failures.inc();
            return Err(TsqError::TaskSend(target_node.to_string()));
        }
        self.statistics.sent_requests.inc();
        Ok(())
    }

    fn send_response(&self, parent_node: &str, resp: TaskResponse) -> Result<()> {
        let Some(stream) = self.server_factory.response_stream(parent_node) else {
            self.statistics.sent_response_failures.inc();
            return Err(TsqError::NoSendStream(parent_node.to_string()));
        };
        if stream.send(resp).is_err() {
            self.statistics.sent_response_failures.inc();
            return Err(TsqError::ResponseSend(parent_node.to_string()));
        }
        self.statistics.sent_responses.inc();
        Ok(())
    }
}

impl TaskManager {
    pub(crate) fn inner(&self) -> &TaskManagerInner {
        &self.inner
    }
}

#[cfg(test)]
#[path = "manager_tests.rs"]
mod manager_tests;
