//! Generates `urlfetch.h` from the `extern "C"` surface.

use std::path::PathBuf;

fn main() {
    println!("cargo:rerun-if-changed=src");

    let crate_dir = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    let header = crate_dir.join("urlfetch.h");
    let config = cbindgen::Config {
        language: cbindgen::Language::C,
        include_guard: Some("URLFETCH_H".to_string()),
        cpp_compat: true,
        ..Default::default()
    };

    // A broken header must not break the library build.
    match cbindgen::Builder::new()
        .with_crate(&crate_dir)
        .with_config(config)
        .generate()
    {
        Ok(bindings) => {
            bindings.write_to_file(header);
        }
        Err(err) => println!("cargo:warning=cbindgen failed: {err}"),
    }
}
