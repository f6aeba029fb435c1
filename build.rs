fn main() {
    prost_build::compile_protos(
        &[
            "proto/tracker.proto",
            "proto/peer.proto",
            "proto/control.proto",
        ],
        &["proto/"],
    )
    .expect("failed to compile protobuf schemas");
}
