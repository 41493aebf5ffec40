fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Server side is the proxy's own surface, client side feeds the grpc backend
    tonic_prost_build::configure()
        .build_server(true)
        .build_client(true)
        .compile_protos(&["../proto/csi.proto"], &["../proto"])?;

    Ok(())
}
