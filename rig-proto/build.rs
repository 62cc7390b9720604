/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

/// Build script – generates tonic server/client stubs for the rig services.
///
/// The services are declared with `tonic_build::manual` instead of a `.proto`
/// file: every message is a plain serde type from this crate and travels as
/// JSON through [`JsonCodec`](crate::codec::JsonCodec).  No `protoc` is needed.
///
/// Generated files land in `OUT_DIR` as `rig.v1.<Service>.rs` and are pulled
/// into the crate by `src/lib.rs`.
use tonic_build::manual::{Builder, Method, Service};

const PACKAGE: &str = "rig.v1";
const CODEC: &str = "crate::codec::JsonCodec";

fn main() {
    println!("cargo:rerun-if-changed=build.rs");

    // ── Control: one bidirectional session per node ───────────────────────────
    let control = Service::builder()
        .name("Control")
        .package(PACKAGE)
        .method(
            Method::builder()
                .name("session")
                .route_name("Session")
                .input_type("crate::control::NodeMessage")
                .output_type("crate::control::ControllerMessage")
                .codec_path(CODEC)
                .client_streaming()
                .server_streaming()
                .build(),
        )
        .build();

    // ── DeviceRpc: request/response surface of one device ─────────────────────
    let device_rpc = Service::builder()
        .name("DeviceRpc")
        .package(PACKAGE)
        .method(unary("invoke", "Invoke", "InvokeRequest", "RpcReply"))
        .method(unary("get_prop", "GetProp", "GetPropRequest", "RpcReply"))
        .method(unary("set_prop", "SetProp", "SetPropRequest", "RpcReply"))
        .method(unary("interface", "Interface", "Empty", "DeviceInterface"))
        .build();

    // ── DevicePub: heartbeat + property change stream of one device ───────────
    let device_pub = Service::builder()
        .name("DevicePub")
        .package(PACKAGE)
        .method(
            Method::builder()
                .name("subscribe")
                .route_name("Subscribe")
                .input_type("crate::device::Empty")
                .output_type("crate::device::PubMessage")
                .codec_path(CODEC)
                .server_streaming()
                .build(),
        )
        .build();

    Builder::new().compile(&[control, device_rpc, device_pub]);
}

fn unary(name: &str, route: &str, input: &str, output: &str) -> Method {
    Method::builder()
        .name(name)
        .route_name(route)
        .input_type(format!("crate::device::{input}"))
        .output_type(format!("crate::device::{output}"))
        .codec_path(CODEC)
        .build()
}
