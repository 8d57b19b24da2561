fn main() -> Result<(), Box<dyn std::error::Error>> {
    // A protoc from the environment takes precedence over the bundled one.
    if std::env::var_os("PROTOC").is_none() {
        std::env::set_var("PROTOC", protoc_bin_vendored::protoc_bin_path()?);
    }

    tonic_build::configure()
        .build_server(false)
        .compile_protos(&["proto/dataplane.proto"], &["proto"])?;
    Ok(())
}
