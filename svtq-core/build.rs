use std::env;

/// Links the external SSIMULACRA2 library the `metrics` module binds via FFI. The install
/// prefix is read from `SSIMULACRA2_DIR` (falling back to a system-wide install) so this
/// builds both against a locally-built checkout and a packaged library.
fn main() {
    println!("cargo:rerun-if-env-changed=SSIMULACRA2_DIR");

    if let Ok(dir) = env::var("SSIMULACRA2_DIR") {
        println!("cargo:rustc-link-search=native={dir}/lib");
    }

    println!("cargo:rustc-link-lib=dylib=ssimulacra2");
}
