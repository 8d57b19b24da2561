use crate::proto::{self, config_stream_client::ConfigStreamClient};
use futures::Stream;
use std::{pin::Pin, time::Duration};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{
    metadata::{AsciiMetadataValue, MetadataValue},
    transport::Endpoint,
    Status,
};

/// The request metadata key that names the connecting worker.
pub const WORKER_HEADER: &str = "ingress-worker";

pub type FeedbackStream = Pin<Box<dyn Stream<Item = Result<proto::Feedback, Status>> + Send>>;

/// Opens configuration streams to a data-plane worker.
#[async_trait::async_trait]
pub trait Connect: Send + Sync + 'static {
    /// Opens a stream that carries every envelope sent on `envelopes` and yields the worker's
    /// feedback.
    async fn connect(
        &self,
        envelopes: mpsc::Receiver<proto::Envelope>,
    ) -> Result<FeedbackStream, Status>;
}

/// Connects to a worker over gRPC.
#[derive(Clone, Debug)]
pub struct GrpcConnector {
    endpoint: Endpoint,
    worker: AsciiMetadataValue,
}

#[derive(Debug, thiserror::Error)]
pub enum ConnectorError {
    #[error("invalid data-plane address: {0}")]
    Address(#[source] tonic::transport::Error),

    #[error("invalid worker name: {0}")]
    Worker(#[source] tonic::metadata::errors::InvalidMetadataValue),
}

// === impl GrpcConnector ===

impl GrpcConnector {
    pub fn new(
        addr: impl Into<String>,
        worker: &str,
        connect_timeout: Duration,
    ) -> Result<Self, ConnectorError> {
        let endpoint = Endpoint::from_shared(addr.into())
            .map_err(ConnectorError::Address)?
            .connect_timeout(connect_timeout)
            .tcp_nodelay(true);
        let worker = MetadataValue::try_from(worker).map_err(ConnectorError::Worker)?;
        Ok(Self { endpoint, worker })
    }
}

#[async_trait::async_trait]
impl Connect for GrpcConnector {
    async fn connect(
        &self,
        envelopes: mpsc::Receiver<proto::Envelope>,
    ) -> Result<FeedbackStream, Status> {
        let channel = self
            .endpoint
            .connect()
            .await
            .map_err(|error| Status::unavailable(error.to_string()))?;

        let mut req = tonic::Request::new(ReceiverStream::new(envelopes));
        req.metadata_mut().insert(WORKER_HEADER, self.worker.clone());

        let rsp = ConfigStreamClient::new(channel).stream(req).await?;
        Ok(Box::pin(rsp.into_inner()))
    }
}
