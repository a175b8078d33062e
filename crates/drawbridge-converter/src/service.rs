use crate::mock::MockConverter;
use drawbridge_proto::{ConvertRequest, ConvertResponse, ConverterService};
use std::sync::Arc;
use std::time::Duration;
use tonic::{Request, Response, Status};

/// Hard cap on a single conversion, independent of the caller's deadline.
const CONVERT_TIMEOUT: Duration = Duration::from_secs(30);

pub struct ConverterGrpc {
    converter: Arc<MockConverter>,
}

impl ConverterGrpc {
    pub fn new(converter: Arc<MockConverter>) -> Self {
        ConverterGrpc { converter }
    }
}

#[tonic::async_trait]
impl ConverterService for ConverterGrpc {
    async fn convert(
        &self,
        request: Request<ConvertRequest>,
    ) -> Result<Response<ConvertResponse>, Status> {
        let req = request.into_inner();

        let conversion = self.converter.convert(&req.input_path, &req.suggested_name);
        let pdf_name = match tokio::time::timeout(CONVERT_TIMEOUT, conversion).await {
            Ok(Ok(pdf_name)) => pdf_name,
            Ok(Err(e)) => {
                tracing::error!(
                    input_path = %req.input_path,
                    suggested_name = %req.suggested_name,
                    error = %e,
                    "convert failed"
                );
                return Err(Status::internal(e.to_string()));
            }
            Err(_) => {
                tracing::error!(
                    input_path = %req.input_path,
                    "convert timed out"
                );
                return Err(Status::deadline_exceeded("conversion timed out"));
            }
        };

        tracing::info!(
            pdf_name = %pdf_name,
            input_path = %req.input_path,
            "convert success"
        );

        Ok(Response::new(ConvertResponse { pdf_name }))
    }
}
