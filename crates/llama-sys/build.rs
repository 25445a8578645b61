use std::env;
use std::path::{Path, PathBuf};

/// Where the llama.cpp headers and static libraries come from.
enum Source {
    /// `LLAMA_PREBUILT_DIR` points at an install tree (`lib/`, `include/`).
    Prebuilt { lib: PathBuf, include: PathBuf },
    /// Build the vendored source tree with CMake.
    Vendored(PathBuf),
    /// Neither is available: emit empty bindings so the workspace still
    /// resolves. Anything that calls into the library will fail to link.
    Missing,
}

fn main() {
    println!("cargo:rerun-if-env-changed=LLAMA_PREBUILT_DIR");
    println!("cargo:rerun-if-env-changed=LLAMA_CPP_DIR");
    println!("cargo:rerun-if-changed=wrapper.h");

    let out = PathBuf::from(env::var("OUT_DIR").expect("OUT_DIR is set by cargo"));
    let source_dir = source_dir();

    let (lib_dir, include_dir) = match locate(&source_dir) {
        Source::Prebuilt { lib, include } => {
            println!("cargo:warning=Using prebuilt llama.cpp from {}", lib.display());
            (lib, include)
        }
        Source::Vendored(dir) => build_with_cmake(&dir),
        Source::Missing => {
            println!(
                "cargo:warning=llama.cpp not found (set LLAMA_PREBUILT_DIR or LLAMA_CPP_DIR); \
                 generating empty bindings"
            );
            println!("cargo:stub=1");
            std::fs::write(out.join("bindings.rs"), "// llama.cpp unavailable at build time\n")
                .expect("failed to write stub bindings");
            return;
        }
    };

    link(&lib_dir);
    generate_bindings(&include_dir, &source_dir, &out);
}

fn source_dir() -> PathBuf {
    env::var("LLAMA_CPP_DIR").map(PathBuf::from).unwrap_or_else(|_| {
        let manifest_dir = PathBuf::from(env::var("CARGO_MANIFEST_DIR").unwrap_or_default());
        manifest_dir.join("../../third_party/llama.cpp")
    })
}

fn locate(source_dir: &Path) -> Source {
    if let Ok(prebuilt) = env::var("LLAMA_PREBUILT_DIR") {
        let prebuilt = PathBuf::from(prebuilt);
        assert!(
            prebuilt.exists(),
            "LLAMA_PREBUILT_DIR={} does not exist",
            prebuilt.display()
        );
        return Source::Prebuilt {
            lib: lib_subdir(&prebuilt),
            include: prebuilt.join("include"),
        };
    }
    if source_dir.join("CMakeLists.txt").exists() {
        return Source::Vendored(source_dir.to_path_buf());
    }
    Source::Missing
}

fn lib_subdir(root: &Path) -> PathBuf {
    if root.join("lib64").exists() {
        root.join("lib64")
    } else {
        root.join("lib")
    }
}

fn build_with_cmake(dir: &Path) -> (PathBuf, PathBuf) {
    let mut cfg = cmake::Config::new(dir);
    cfg.define("BUILD_SHARED_LIBS", "OFF")
        .define("LLAMA_BUILD_SERVER", "OFF")
        .define("LLAMA_BUILD_TESTS", "OFF")
        .define("LLAMA_BUILD_EXAMPLES", "OFF")
        .define("LLAMA_BUILD_TOOLS", "OFF")
        .define("LLAMA_BUILD_COMMON", "OFF");

    if env::var("CARGO_FEATURE_CUDA").is_ok() {
        cfg.define("GGML_CUDA", "ON");
    }
    if env::var("CARGO_FEATURE_VULKAN").is_ok() {
        cfg.define("GGML_VULKAN", "ON");
    }
    if env::var("CARGO_FEATURE_ROCM").is_ok() {
        let rocm = env::var("ROCM_PATH").unwrap_or_else(|_| "/opt/rocm".into());
        cfg.define("GGML_HIP", "ON")
            .define("CMAKE_HIP_COMPILER_ROCM_ROOT", &rocm);
    }
    if env::var("CARGO_CFG_TARGET_OS").as_deref() == Ok("macos") {
        cfg.define("GGML_METAL", "ON");
    }

    let dst = cfg.build();
    (lib_subdir(&dst), dst.join("include"))
}

fn link(lib_dir: &Path) {
    println!("cargo:rustc-link-search=native={}", lib_dir.display());
    println!("cargo:rustc-link-lib=static=llama");

    for name in ["ggml", "ggml-base", "ggml-cpu"] {
        if lib_dir.join(format!("lib{name}.a")).exists() {
            println!("cargo:rustc-link-lib=static={name}");
        }
    }

    if env::var("CARGO_FEATURE_CUDA").is_ok() && lib_dir.join("libggml-cuda.a").exists() {
        println!("cargo:rustc-link-lib=static=ggml-cuda");
        for lib in ["cuda", "cublas", "culibos", "cudart"] {
            println!("cargo:rustc-link-lib={lib}");
        }
    }
    if env::var("CARGO_FEATURE_VULKAN").is_ok() && lib_dir.join("libggml-vulkan.a").exists() {
        println!("cargo:rustc-link-lib=static=ggml-vulkan");
        println!("cargo:rustc-link-lib=vulkan");
    }
    if env::var("CARGO_FEATURE_ROCM").is_ok() && lib_dir.join("libggml-hip.a").exists() {
        println!("cargo:rustc-link-lib=static=ggml-hip");
        let rocm = env::var("ROCM_PATH").unwrap_or_else(|_| "/opt/rocm".into());
        println!("cargo:rustc-link-search=native={rocm}/lib");
        for lib in ["amdhip64", "hipblas", "rocblas"] {
            println!("cargo:rustc-link-lib={lib}");
        }
    }

    match env::var("CARGO_CFG_TARGET_OS").unwrap_or_default().as_str() {
        "linux" => {
            for lib in ["stdc++", "m", "pthread", "gomp"] {
                println!("cargo:rustc-link-lib={lib}");
            }
        }
        "macos" => {
            if lib_dir.join("libggml-metal.a").exists() {
                println!("cargo:rustc-link-lib=static=ggml-metal");
            }
            for fw in ["Accelerate", "Metal", "MetalKit", "Foundation"] {
                println!("cargo:rustc-link-lib=framework={fw}");
            }
            println!("cargo:rustc-link-lib=c++");
        }
        "windows" => println!("cargo:rustc-link-lib=msvcrt"),
        _ => {}
    }
}

fn generate_bindings(include_dir: &Path, source_dir: &Path, out: &Path) {
    let mut builder = bindgen::Builder::default()
        .header("wrapper.h")
        .clang_arg(format!("-I{}", include_dir.display()));

    let ggml_include = source_dir.join("ggml/include");
    if ggml_include.exists() {
        builder = builder.clang_arg(format!("-I{}", ggml_include.display()));
    }

    builder
        .allowlist_function("llama_.*")
        .allowlist_function("ggml_.*")
        .allowlist_type("llama_.*")
        .allowlist_type("ggml_.*")
        .allowlist_var("LLAMA_.*")
        .allowlist_var("GGML_.*")
        .derive_default(true)
        .size_t_is_usize(true)
        .generate()
        .expect("Failed to generate bindings")
        .write_to_file(out.join("bindings.rs"))
        .expect("Failed to write bindings");
}
