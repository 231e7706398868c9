// Compiles the etcd wire subset and the Netsy file format, and emits a file
// descriptor set for the gRPC reflection service.

use std::env;
use std::path::PathBuf;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    if env::var_os("PROTOC").is_none() {
        env::set_var("PROTOC", protoc_bin_vendored::protoc_bin_path()?);
    }

    let out_dir = PathBuf::from(env::var("OUT_DIR")?);

    tonic_build::configure()
        .file_descriptor_set_path(out_dir.join("netsy_descriptor.bin"))
        .compile_protos(
            &["proto/kv.proto", "proto/rpc.proto", "proto/file.proto"],
            &["proto"],
        )?;

    Ok(())
}
