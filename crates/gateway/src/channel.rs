use crate::{Compression, Error, Result};
use proto_gateway::data::{DataRequest, DataResponse};
use proto_gateway::health::{HealthCheckRequest, ServingStatus};
use proto_gateway::{data, health};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tonic::codegen::http::uri::PathAndQuery;
use tonic::metadata::{Ascii, MetadataKey, MetadataValue};

/// Call metadata exchanged with an executor, as string key/value pairs.
pub type Metadata = HashMap<String, String>;

/// A ready channel to a single executor replica.
///
/// Logical executor failures are carried inside the returned [`DataResponse`]
/// status; an `Err` from these methods is a transport-level failure.
#[async_trait::async_trait]
pub trait ExecutorChannel: Send + Sync {
    /// Send one logical call, one or more requests in, one response out.
    async fn process(
        &self,
        requests: Vec<DataRequest>,
        metadata: &Metadata,
    ) -> Result<(DataResponse, Metadata)>;

    /// Probe replica health.
    async fn health(&self, timeout: Duration) -> Result<ServingStatus>;
}

/// Dials [`ExecutorChannel`]s for replica addresses. The production
/// implementation is [`GrpcConnector`]; tests substitute in-process fakes.
#[async_trait::async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, address: &str) -> Result<Arc<dyn ExecutorChannel>>;
}

/// Connector over tonic gRPC channels.
///
/// Channels are dialed lazily and transparently re-establish broken
/// transports; warmup forces the initial connection through a health probe.
pub struct GrpcConnector {
    compression: Option<Compression>,
    connect_timeout: Duration,
}

impl GrpcConnector {
    pub fn new(compression: Option<Compression>) -> Self {
        Self {
            compression,
            connect_timeout: Duration::from_secs(5),
        }
    }
}

#[async_trait::async_trait]
impl Connector for GrpcConnector {
    async fn connect(&self, address: &str) -> Result<Arc<dyn ExecutorChannel>> {
        let uri = if address.contains("://") {
            // Accept grpc:// as an alias for plaintext http://.
            address.replacen("grpc://", "http://", 1)
        } else {
            format!("http://{address}")
        };
        let endpoint = tonic::transport::Endpoint::from_shared(uri)
            .map_err(|_| Error::InvalidEndpoint(address.to_string()))?
            .connect_timeout(self.connect_timeout);

        Ok(Arc::new(GrpcChannel {
            channel: endpoint.connect_lazy(),
            compression: self.compression,
        }))
    }
}

struct GrpcChannel {
    channel: tonic::transport::Channel,
    compression: Option<Compression>,
}

impl GrpcChannel {
    fn grpc(&self) -> tonic::client::Grpc<tonic::transport::Channel> {
        let mut grpc = tonic::client::Grpc::new(self.channel.clone());
        if let Some(compression) = self.compression {
            let encoding = match compression {
                Compression::Gzip => tonic::codec::CompressionEncoding::Gzip,
                Compression::Zstd => tonic::codec::CompressionEncoding::Zstd,
            };
            grpc = grpc.send_compressed(encoding).accept_compressed(encoding);
        }
        grpc
    }
}

#[async_trait::async_trait]
impl ExecutorChannel for GrpcChannel {
    async fn process(
        &self,
        requests: Vec<DataRequest>,
        metadata: &Metadata,
    ) -> Result<(DataResponse, Metadata)> {
        let mut grpc = self.grpc();
        grpc.ready().await.map_err(Error::Transport)?;

        let codec = tonic::codec::ProstCodec::<DataRequest, DataResponse>::default();

        let response = if requests.len() == 1 {
            let mut request = tonic::Request::new(requests.into_iter().next().unwrap());
            attach_metadata(&mut request, metadata)?;
            grpc.unary(
                request,
                PathAndQuery::from_static(data::PROCESS_SINGLE_DATA_PATH),
                codec,
            )
            .await?
        } else {
            let mut request = tonic::Request::new(futures::stream::iter(requests));
            attach_metadata(&mut request, metadata)?;
            grpc.client_streaming(
                request,
                PathAndQuery::from_static(data::PROCESS_DATA_PATH),
                codec,
            )
            .await?
        };

        let mut trailing = Metadata::new();
        for entry in response.metadata().iter() {
            if let tonic::metadata::KeyAndValueRef::Ascii(key, value) = entry {
                if let Ok(value) = value.to_str() {
                    trailing.insert(key.to_string(), value.to_string());
                }
            }
        }
        Ok((response.into_inner(), trailing))
    }

    async fn health(&self, timeout: Duration) -> Result<ServingStatus> {
        let mut grpc = self.grpc();

        let check = async {
            grpc.ready().await.map_err(Error::Transport)?;
            let codec = tonic::codec::ProstCodec::<HealthCheckRequest, _>::default();
            let response: tonic::Response<health::HealthCheckResponse> = grpc
                .unary(
                    tonic::Request::new(HealthCheckRequest::default()),
                    PathAndQuery::from_static(health::CHECK_PATH),
                    codec,
                )
                .await?;
            Ok(response.into_inner().status())
        };

        tokio::time::timeout(timeout, check)
            .await
            .map_err(|_| Error::Timeout(timeout))?
    }
}

fn attach_metadata<T>(request: &mut tonic::Request<T>, metadata: &Metadata) -> Result<()> {
    for (key, value) in metadata {
        let key = MetadataKey::<Ascii>::from_bytes(key.as_bytes())
            .map_err(|_| Error::Config(format!("invalid metadata key '{key}'")))?;
        let value = MetadataValue::<Ascii>::try_from(value.as_str())
            .map_err(|_| Error::Config(format!("invalid metadata value for '{key}'")))?;
        request.metadata_mut().insert(key, value);
    }
    Ok(())
}
