fn main() {
    // Prefer an explicitly configured compiler; otherwise use the bundled one.
    if std::env::var_os("PROTOC").is_none() {
        let protoc = protoc_bin_vendored::protoc_bin_path().expect("protoc must be bundled");
        std::env::set_var("PROTOC", protoc);
    }

    tonic_build::configure()
        .build_client(true)
        .build_server(true)
        .compile_protos(&["proto/pacemaker.proto"], &["proto"])
        .expect("failed to compile pacemaker protocol buffers");

    println!("cargo:rerun-if-changed=build.rs");
}
