/// Builds the gRPC client and server code for the `scatterfeed.proto`
/// definition using `tonic-prost-build`.
///
/// A file descriptor set is written next to the generated code so the server
/// can register it with `tonic-reflection`.
///
/// # Files and Paths
///
/// - Proto file: `proto/scatterfeed.proto`
/// - Includes: `proto/`
///
/// # Output
///
/// Generated code is exposed as `scatterfeed_core::proto`.
use std::env;
use std::path::PathBuf;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let out_dir = PathBuf::from(env::var("OUT_DIR")?);
    let descriptor_path = out_dir.join("scatterfeed_descriptor.bin");

    let mut config = tonic_prost_build::Config::new();
    config.file_descriptor_set_path(&descriptor_path);

    tonic_prost_build::configure().compile_with_config(
        config,
        &["proto/scatterfeed.proto"],
        &["proto"],
    )?;

    println!("cargo:rerun-if-changed=proto/scatterfeed.proto");
    Ok(())
}
