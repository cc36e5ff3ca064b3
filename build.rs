fn main() -> Result<(), Box<dyn std::error::Error>> {
    tonic_build::compile_protos("proto/rje.proto")?;
    println!("cargo:rerun-if-changed=proto/rje.proto");
    Ok(())
}
