//! Wire types for the converter gRPC boundary.
//!
//! `converter.v1.rs` is generated from `proto/converter.proto` with
//! `prost-build`/`tonic-build` and committed, so building the workspace does
//! not require `protoc`. Regenerate after editing the proto file.

#[path = "converter.v1.rs"]
pub mod converter_v1;

pub use converter_v1::converter_service_client::ConverterServiceClient;
pub use converter_v1::converter_service_server::{ConverterService, ConverterServiceServer};
pub use converter_v1::{ConvertRequest, ConvertResponse};
