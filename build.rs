fn main() {
    // Rebuild when the build script or the manifest changes
    println!("cargo:rerun-if-changed=build.rs");
    println!("cargo:rerun-if-changed=Cargo.toml");

    // Package name and version end up in every report
    built::write_built_file()
        .expect("Failed to acquire build-time information");
}
