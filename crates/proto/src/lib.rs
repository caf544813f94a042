//! Wire types and gRPC call helpers for the xgrpc protocol.
//!
//! This crate provides:
//! - The protobuf envelope exchanged on every call ([`proto::Payload`], [`proto::Metadata`])
//! - Thin clients for the two services the backend exposes ([`proto::request_client`],
//!   [`proto::bi_request_stream_client`])
//!
//! # Architecture
//!
//! The protocol carries every message, in both directions, inside the same
//! envelope. The `type` field of the metadata is the only dispatch key: the
//! body is an opaque JSON document the SDK decodes after looking the type up.
//!
//! The schema lives in `proto/xgrpc_grpc_service.proto` and is compiled by the
//! build script. Without `protoc` the checked-in `src/generated/xgrpc.rs` is used.

#![deny(unsafe_code)]
// gRPC calls return tonic::Status (176 bytes) - standard practice for gRPC error handling
#![allow(clippy::result_large_err)]

/// Generated protobuf types and service clients.
pub mod proto {
    #![allow(clippy::all)]
    #![allow(missing_docs)]

    use std::collections::HashMap;

    // Use pre-generated code when the proto file or protoc isn't available
    #[cfg(use_pregenerated_proto)]
    include!("generated/xgrpc.rs");

    // Use build-time generated code in development (the schema has no package)
    #[cfg(not(use_pregenerated_proto))]
    tonic::include_proto!("_");

    impl Payload {
        /// Builds an envelope around an already-serialized body.
        pub fn new(
            message_type: impl Into<String>,
            headers: HashMap<String, String>,
            client_ip: impl Into<String>,
            body: Vec<u8>,
        ) -> Self {
            Self {
                metadata: Some(Metadata {
                    r#type: message_type.into(),
                    client_ip: client_ip.into(),
                    headers,
                }),
                body: Some(::prost_types::Any { type_url: String::new(), value: body }),
            }
        }

        /// Returns the declared message type, or `""` when metadata is missing.
        pub fn message_type(&self) -> &str {
            self.metadata.as_ref().map_or("", |m| m.r#type.as_str())
        }

        /// Returns the raw body bytes, or an empty slice when the body is missing.
        pub fn body_bytes(&self) -> &[u8] {
            self.body.as_ref().map_or(&[], |b| b.value.as_slice())
        }

        /// Returns the metadata headers, if any.
        pub fn headers(&self) -> Option<&HashMap<String, String>> {
            self.metadata.as_ref().map(|m| &m.headers)
        }
    }
}
