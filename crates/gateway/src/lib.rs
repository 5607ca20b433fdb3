pub mod graph;
pub mod pool;
pub mod runtime;
pub mod streamer;

mod channel;
pub use channel::{Connector, ExecutorChannel, GrpcConnector, Metadata};

mod config;
pub use config::{Addresses, Compression, GatewayConfig, ENV_STREAMER_ARGS};

mod gateway;
pub use gateway::{ExecutorClient, ExecutorError, GatewayStreamer, StreamOptions};

mod handler;
pub mod logging;
mod metrics;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid gRPC endpoint: '{0}'")]
    InvalidEndpoint(String),
    #[error(transparent)]
    Transport(#[from] tonic::transport::Error),
    #[error(transparent)]
    Grpc(#[from] tonic::Status),
    #[error("invalid topology: {0}")]
    Graph(String),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("invalid filter condition: {0}")]
    Condition(String),
    #[error("unknown deployment: '{0}'")]
    UnknownDeployment(String),
    #[error("connection pool is closed")]
    PoolClosed,
    #[error("request was cancelled")]
    Cancelled,
    #[error("request timed out after {0:?}")]
    Timeout(std::time::Duration),
}

impl Error {
    /// Short name under which this error surfaces as a response exception.
    pub fn exception_name(&self) -> &'static str {
        match self {
            Error::Timeout(_) => "Timeout",
            Error::Condition(_) => "ConditionError",
            Error::Cancelled | Error::PoolClosed => "Cancelled",
            Error::Config(_) => "ConfigError",
            _ => "TransportError",
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
