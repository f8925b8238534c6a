//! Intermediate-side orchestration of inbound task requests.
//!
//! On an `Intermediate`-typed request this node must, in order: register
//! its merge context under the root task id, send exactly one ack back to
//! the root, and later forward the merged terminal event upstream. The
//! registration-before-ack order is what lets the root dispatch leaf
//! requests knowing no leaf response can arrive here unroutable.

use tracing::{debug, warn};
use tsq_common::error::is_not_found;
use tsq_common::{Result, TsqError};
use tsq_models::{PhysicalPlan, Query};
use tsq_protocol::{
    encode_time_series_list, FieldAggSpec, RequestType, TaskRequest, TaskResponse, TaskType,
    TimeSeries, TimeSeriesList,
};
use tsq_series::TimeSeriesEvent;

use crate::manager::{QueryContext, TaskManager};

/// Routes inbound task requests on an aggregation-tier node.
pub struct IntermediateTaskProcessor {
    current_node: String,
    task_manager: TaskManager,
}

impl IntermediateTaskProcessor {
    /// Build a processor for `current_node`.
    pub fn new(current_node: impl Into<String>, task_manager: TaskManager) -> Self {
        Self {
            current_node: current_node.into(),
            task_manager,
        }
    }

    /// Process one inbound request from `from_node`.
    ///
    /// Requests this tier cannot execute are answered with an error
    /// response so the sender's context completes instead of waiting for
    /// the TTL sweep.
    pub async fn process(&self, req: TaskRequest, from_node: &str) -> Result<()> {
        match (req.request_type(), req.task_type()) {
            (RequestType::Data, TaskType::Intermediate) => {
                self.process_intermediate(req, from_node).await
            }
            _ => {
                let err = TsqError::Server(format!(
                    "node {} cannot execute this task type",
                    self.current_node
                ));
                self.respond_error(&req, from_node, &err);
                Err(err)
            }
        }
    }

    async fn process_intermediate(&self, req: TaskRequest, from_node: &str) -> Result<()> {
        let plan: PhysicalPlan = match serde_json::from_slice(&req.physical_plan) {
            Ok(plan) => plan,
            Err(e) => {
                let err = TsqError::Decode(format!("physical plan: {e}"));
                self.respond_error(&req, from_node, &err);
                return Err(err);
            }
        };
        let query: Query = match serde_json::from_slice(&req.payload) {
            Ok(query) => query,
            Err(e) => {
                let err = TsqError::Decode(format!("query payload: {e}"));
                self.respond_error(&req, from_node, &err);
                return Err(err);
            }
        };

        let ctx = QueryContext::new();
        let mut event_rx = self.task_manager.submit_intermediate_metric_task(
            &ctx,
            &plan,
            &query,
            &req.parent_task_id,
        );
        debug!(
            task_id = %req.parent_task_id,
            root = %plan.root.indicator,
            "registered intermediate task"
        );

        // the context is live; ack so the root may release leaf requests
        self.task_manager.send_response(
            from_node,
            TaskResponse {
                task_id: req.parent_task_id.clone(),
                task_type: TaskType::Intermediate as i32,
                ..TaskResponse::default()
            },
        )?;

        let manager = self.task_manager.clone();
        let parent_node = plan.root.indicator.clone();
        let task_id = req.parent_task_id.clone();
        tokio::spawn(async move {
            if let Some(event) = event_rx.recv().await {
                let resp = event_to_response(task_id.clone(), event);
                if let Err(err) = manager.send_response(&parent_node, resp) {
                    warn!(
                        task_id = %task_id,
                        parent = %parent_node,
                        error = %err,
                        "forwarding merged result upstream failed"
                    );
                }
            }
        });
        Ok(())
    }

    fn respond_error(&self, req: &TaskRequest, from_node: &str, err: &TsqError) {
        let resp = TaskResponse {
            task_id: req.parent_task_id.clone(),
            task_type: req.task_type,
            err_msg: err.to_string(),
            ..TaskResponse::default()
        };
        if let Err(send_err) = self.task_manager.send_response(from_node, resp) {
            warn!(
                task_id = %req.parent_task_id,
                error = %send_err,
                "sending error response failed"
            );
        }
    }
}

fn event_to_response(task_id: String, event: TimeSeriesEvent) -> TaskResponse {
    match event {
        TimeSeriesEvent::Completed {
            aggregator_specs,
            series_list,
            stats,
        } => {
            let list = TimeSeriesList {
                time_series: series_list
                    .into_iter()
                    .map(|group| TimeSeries {
                        tags: group.tags().to_string(),
                        fields: group.fields().clone(),
                    })
                    .collect(),
                field_agg_specs: aggregator_specs
                    .into_values()
                    .map(|spec| FieldAggSpec {
                        field_name: spec.field_name,
                        field_type: spec.field_type.to_wire(),
                        func_type_list: spec.functions.iter().map(|f| f.to_wire()).collect(),
                    })
                    .collect(),
            };
            TaskResponse {
                task_id,
                task_type: TaskType::Intermediate as i32,
                payload: encode_time_series_list(&list),
                stats: stats
                    .map(|s| serde_json::to_vec(&s).unwrap_or_default())
                    .unwrap_or_default(),
                ..TaskResponse::default()
            }
        }
        TimeSeriesEvent::Failed { source, stats } => {
            let err_msg = source.to_string();
            TaskResponse {
                task_id,
                task_type: TaskType::Intermediate as i32,
                not_found: is_not_found(&err_msg),
                err_msg,
                stats: stats
                    .map(|s| serde_json::to_vec(&s).unwrap_or_default())
                    .unwrap_or_default(),
                ..TaskResponse::default()
            }
        }
    }
}
