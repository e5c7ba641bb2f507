fn main() {
    // Only link a native libmxnet when the `libmxnet` feature is enabled.
    #[cfg(feature = "libmxnet")]
    {
        use std::env;
        use std::path::PathBuf;

        println!("cargo:rerun-if-env-changed=MXNET_LIBRARY_PATH");
        println!("cargo:rerun-if-env-changed=MXNET_SRC");

        let lib_dir = match env::var("MXNET_LIBRARY_PATH") {
            Ok(dir) => PathBuf::from(dir),
            Err(_) => {
                let mxnet_src = env::var("MXNET_SRC").unwrap_or_else(|_| "../../mxnet".to_string());
                let dst = cmake::Config::new(&mxnet_src)
                    .define("CMAKE_BUILD_TYPE", "Release")
                    .define("USE_CUDA", "OFF")
                    .define("USE_OPENCV", "OFF")
                    .build();
                dst.join("lib")
            }
        };

        println!("cargo:rustc-link-search=native={}", lib_dir.display());
        println!("cargo:rustc-link-lib=dylib=mxnet");

        #[cfg(target_os = "macos")]
        println!("cargo:rustc-link-lib=c++");
    }
}
