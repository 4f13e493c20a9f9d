use keel_types::ObjectId;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SdkError {
    #[error("object not found: {0}")]
    ObjectNotFound(ObjectId),

    #[error("graph error: {0}")]
    Graph(#[from] keel_graph::GraphError),

    #[error("transport error: {0}")]
    Transport(#[from] keel_transport::TransportError),
}

pub type SdkResult<T> = Result<T, SdkError>;
