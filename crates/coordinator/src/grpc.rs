//! gRPC glue binding the transport seams to the tonic task service.
//!
//! Each peer pair shares one bidirectional stream: the downstream node
//! dials and sends requests, the upstream node streams responses back.
//! [`GrpcTaskClientFactory`] keeps dialed client streams per peer and pumps
//! inbound responses into the task receiver; [`TaskHandler`] registers
//! server-side response senders as peers connect and routes their requests
//! to the intermediate processor.
//!
//! Node registration is driven by an external membership layer: this
//! module only reacts to `register_node` / `deregister_node` calls.

use std::pin::Pin;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::{Stream, StreamExt};
use tonic::metadata::MetadataValue;
use tonic::{Request, Response, Status, Streaming};
use tracing::{debug, info, warn};
use tsq_common::{Result, TsqError};
use tsq_protocol::{TaskRequest, TaskResponse, TaskService, TaskServiceClient};

use crate::processor::IntermediateTaskProcessor;
use crate::transport::{
    TaskClientFactory, TaskReceiver, TaskRequestSender, TaskResponseSender, TaskServerFactory,
};

/// Metadata key carrying the dialing node's indicator.
pub const NODE_ID_METADATA_KEY: &str = "tsq-node-id";

struct GrpcRequestSender {
    tx: mpsc::UnboundedSender<TaskRequest>,
}

impl TaskRequestSender for GrpcRequestSender {
    fn send(&self, req: TaskRequest) -> std::result::Result<(), ()> {
        self.tx.send(req).map_err(|_| ())
    }
}

struct GrpcResponseSender {
    tx: mpsc::UnboundedSender<TaskResponse>,
}

impl TaskResponseSender for GrpcResponseSender {
    fn send(&self, resp: TaskResponse) -> std::result::Result<(), ()> {
        self.tx.send(resp).map_err(|_| ())
    }
}

/// Client stream registry backed by dialed tonic streams.
pub struct GrpcTaskClientFactory {
    current_node: String,
    receiver: RwLock<Option<Arc<dyn TaskReceiver>>>,
    nodes: DashMap<String, Arc<GrpcRequestSender>>,
}

impl GrpcTaskClientFactory {
    /// Build an empty factory for `current_node`.
    pub fn new(current_node: impl Into<String>) -> Self {
        Self {
            current_node: current_node.into(),
            receiver: RwLock::new(None),
            nodes: DashMap::new(),
        }
    }

    /// Bind the inbound response sink; must happen before peers respond.
    pub fn set_task_receiver(&self, receiver: Arc<dyn TaskReceiver>) {
        *self.receiver.write() = Some(receiver);
    }

    /// Dial `endpoint` and keep a request stream for `indicator`.
    ///
    /// Called by the membership layer when a peer joins.
    pub async fn register_node(&self, indicator: &str, endpoint: &str) -> Result<()> {
        let mut client = TaskServiceClient::connect(endpoint.to_string())
            .await
            .map_err(|e| {
                warn!(node = %indicator, endpoint = %endpoint, error = %e, "dial failed");
                TsqError::NoSendStream(indicator.to_string())
            })?;

        let (tx, rx) = mpsc::unbounded_channel::<TaskRequest>();
        let mut request = Request::new(UnboundedReceiverStream::new(rx));
        let node_id: MetadataValue<_> = self
            .current_node
            .parse()
            .map_err(|_| TsqError::NoSendStream(indicator.to_string()))?;
        request.metadata_mut().insert(NODE_ID_METADATA_KEY, node_id);

        let response = client
            .handle(request)
            .await
            .map_err(|e| {
                warn!(node = %indicator, error = %e, "open task stream failed");
                TsqError::NoSendStream(indicator.to_string())
            })?;
        let mut inbound = response.into_inner();

        let receiver = self.receiver.read().clone();
        let node = indicator.to_string();
        tokio::spawn(async move {
            loop {
                match inbound.message().await {
                    Ok(Some(resp)) => {
                        if let Some(receiver) = receiver.as_ref() {
                            if let Err(err) = receiver.receive(resp, &node) {
                                debug!(node = %node, error = %err, "response dropped");
                            }
                        }
                    }
                    Ok(None) => break,
                    Err(status) => {
                        debug!(node = %node, error = %status, "task stream closed");
                        break;
                    }
                }
            }
        });

        self.nodes
            .insert(indicator.to_string(), Arc::new(GrpcRequestSender { tx }));
        info!(node = %indicator, endpoint = %endpoint, "task stream established");
        Ok(())
    }

    /// Drop the request stream of a departed peer.
    pub fn deregister_node(&self, indicator: &str) {
        self.nodes.remove(indicator);
    }
}

impl TaskClientFactory for GrpcTaskClientFactory {
    fn task_client(&self, target_node: &str) -> Option<Arc<dyn TaskRequestSender>> {
        self.nodes
            .get(target_node)
            .map(|entry| Arc::clone(entry.value()) as Arc<dyn TaskRequestSender>)
    }
}

/// Server stream registry populated as peers connect.
#[derive(Default)]
pub struct GrpcTaskServerFactory {
    streams: DashMap<String, Arc<GrpcResponseSender>>,
}

impl GrpcTaskServerFactory {
    /// Build an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    fn register(&self, node: &str, tx: mpsc::UnboundedSender<TaskResponse>) {
        self.streams
            .insert(node.to_string(), Arc::new(GrpcResponseSender { tx }));
    }

    fn deregister(&self, node: &str) {
        self.streams.remove(node);
    }
}

impl TaskServerFactory for GrpcTaskServerFactory {
    fn response_stream(&self, target_node: &str) -> Option<Arc<dyn TaskResponseSender>> {
        self.streams
            .get(target_node)
            .map(|entry| Arc::clone(entry.value()) as Arc<dyn TaskResponseSender>)
    }
}

/// Tonic service implementation of the task stream endpoint.
pub struct TaskHandler {
    server_factory: Arc<GrpcTaskServerFactory>,
    processor: Arc<IntermediateTaskProcessor>,
}

impl TaskHandler {
    /// Build the handler around the shared server factory and processor.
    pub fn new(
        server_factory: Arc<GrpcTaskServerFactory>,
        processor: Arc<IntermediateTaskProcessor>,
    ) -> Self {
        Self {
            server_factory,
            processor,
        }
    }
}

#[tonic::async_trait]
impl TaskService for TaskHandler {
    type HandleStream =
        Pin<Box<dyn Stream<Item = std::result::Result<TaskResponse, Status>> + Send>>;

    async fn handle(
        &self,
        request: Request<Streaming<TaskRequest>>,
    ) -> std::result::Result<Response<Self::HandleStream>, Status> {
        let peer = request
            .metadata()
            .get(NODE_ID_METADATA_KEY)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        if peer.is_empty() {
            return Err(Status::invalid_argument("missing tsq-node-id metadata"));
        }

        let mut inbound = request.into_inner();
        let (tx, rx) = mpsc::unbounded_channel::<TaskResponse>();
        self.server_factory.register(&peer, tx);
        info!(peer = %peer, "peer task stream connected");

        let processor = Arc::clone(&self.processor);
        let server_factory = Arc::clone(&self.server_factory);
        let peer_for_pump = peer.clone();
        tokio::spawn(async move {
            loop {
                match inbound.message().await {
                    Ok(Some(req)) => {
                        if let Err(err) = processor.process(req, &peer_for_pump).await {
                            warn!(peer = %peer_for_pump, error = %err, "task request failed");
                        }
                    }
                    Ok(None) => break,
                    Err(status) => {
                        debug!(peer = %peer_for_pump, error = %status, "peer stream closed");
                        break;
                    }
                }
            }
            server_factory.deregister(&peer_for_pump);
        });

        let outbound = UnboundedReceiverStream::new(rx).map(Ok);
        Ok(Response::new(Box::pin(outbound)))
    }
}
