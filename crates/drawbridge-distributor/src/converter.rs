use async_trait::async_trait;
use drawbridge_proto::{ConvertRequest, ConverterServiceClient};
use tonic::transport::Channel;

/// The remote conversion backend as the distributor sees it: one call in,
/// one result filename out.
#[async_trait]
pub trait Converter: Send + Sync {
    async fn convert(&self, input_path: &str, suggested_name: &str) -> anyhow::Result<String>;
}

/// gRPC-backed converter client. The channel reconnects lazily, so a single
/// instance serves the whole worker pool.
pub struct GrpcConverter {
    channel: Channel,
}

impl GrpcConverter {
    pub async fn connect(addr: &str) -> anyhow::Result<Self> {
        let channel = Channel::from_shared(addr.to_string())?
            .connect_lazy();
        Ok(GrpcConverter { channel })
    }
}

#[async_trait]
impl Converter for GrpcConverter {
    async fn convert(&self, input_path: &str, suggested_name: &str) -> anyhow::Result<String> {
        let mut client = ConverterServiceClient::new(self.channel.clone());
        let response = client
            .convert(ConvertRequest {
                input_path: input_path.to_string(),
                suggested_name: suggested_name.to_string(),
            })
            .await?;
        Ok(response.into_inner().pdf_name)
    }
}
