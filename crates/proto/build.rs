//! Build script for xgrpc-proto.
//!
//! Compiles the service definition into Rust code using tonic-prost-build.
//! When the proto file or `protoc` is unavailable, the pre-generated code in
//! src/generated/ is used instead.

use std::path::Path;

const PROTO_FILE: &str = "proto/xgrpc_grpc_service.proto";

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Declare custom cfg for conditional compilation
    println!("cargo::rustc-check-cfg=cfg(use_pregenerated_proto)");

    if Path::new(PROTO_FILE).exists() {
        println!("cargo::rerun-if-changed={PROTO_FILE}");

        // Client only: the SDK never serves either service.
        let generated = tonic_prost_build::configure()
            .build_server(false)
            .build_client(true)
            .emit_rerun_if_changed(true)
            .compile_protos(&[PROTO_FILE], &["proto"]);
        match generated {
            Ok(()) => return Ok(()),
            Err(e) => {
                println!("cargo::warning=using pre-generated proto code: {e}");
            },
        }
    }

    // Signal that we're using pre-generated code
    println!("cargo::rustc-cfg=use_pregenerated_proto");
    Ok(())
}
