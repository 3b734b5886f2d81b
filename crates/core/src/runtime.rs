//! ONNX Runtime and GPU library discovery.
//!
//! `ort` is built with `load-dynamic`, so the shared library is located at
//! startup and exported through `ORT_DYLIB_PATH`. CUDA, cuDNN and TensorRT
//! libraries found next to it are preloaded globally so the execution
//! providers resolve them without relying on `LD_LIBRARY_PATH`.

use std::collections::HashSet;
use std::env;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

pub const LIB_DIR_ENV: &str = "UPSCALER_LIB_DIR";
const ORT_DYLIB_ENV: &str = "ORT_DYLIB_PATH";

#[cfg(unix)]
const ORT_LIB_NAME: &str = "libonnxruntime.so";
#[cfg(windows)]
const ORT_LIB_NAME: &str = "onnxruntime.dll";

/// What [`setup_runtime_libs`] found.
#[derive(Debug, Default, Clone)]
pub struct RuntimeLibReport {
    pub search_dirs: Vec<PathBuf>,
    pub ort_dylib: Option<PathBuf>,
    pub preloaded: Vec<PathBuf>,
}

/// Directories probed for runtime libraries, in priority order:
/// `$UPSCALER_LIB_DIR`, `<exe_dir>/lib`, `<exe_dir>/../lib`, `<cwd>/lib`,
/// then the system library directories on Unix.
fn candidate_lib_dirs() -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    let mut push = |dir: PathBuf| {
        if !dirs.contains(&dir) {
            dirs.push(dir);
        }
    };

    if let Some(dir) = env::var_os(LIB_DIR_ENV) {
        push(PathBuf::from(dir));
    }
    if let Ok(exe) = env::current_exe().and_then(|p| p.canonicalize()) {
        if let Some(exe_dir) = exe.parent() {
            #[cfg(windows)]
            push(exe_dir.to_path_buf());
            push(exe_dir.join("lib"));
            if let Some(parent) = exe_dir.parent() {
                push(parent.join("lib"));
            }
        }
    }
    if let Ok(cwd) = env::current_dir() {
        push(cwd.join("lib"));
    }
    #[cfg(unix)]
    {
        push(PathBuf::from("/usr/local/lib"));
        push(PathBuf::from("/usr/lib"));
    }
    dirs
}

fn find_ort_dylib(dirs: &[PathBuf]) -> Option<PathBuf> {
    dirs.iter()
        .map(|dir| dir.join(ORT_LIB_NAME))
        .find(|path| path.is_file())
}

/// Load order for GPU runtime libraries; `None` for anything else.
///
///   0 - CUDA runtime and math libraries
///   1 - cuDNN
///   2 - TensorRT
fn load_priority(name: &str) -> Option<u8> {
    let name = name.to_ascii_lowercase();
    let name = name.strip_prefix("lib").unwrap_or(&name);
    if ["cudart", "cublas", "cufft", "curand"]
        .iter()
        .any(|prefix| name.starts_with(prefix))
    {
        Some(0)
    } else if name.starts_with("cudnn") {
        Some(1)
    } else if name.starts_with("nvinfer") || name.starts_with("nvonnxparser") {
        Some(2)
    } else {
        None
    }
}

#[cfg(unix)]
fn is_shared_lib(name: &str, path: &Path) -> bool {
    name.contains(".so") && !path.is_symlink()
}

#[cfg(windows)]
fn is_shared_lib(_name: &str, path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("dll"))
}

/// GPU libraries to preload, deduplicated by file name (first directory
/// wins) and sorted so dependencies come first.
fn preload_plan(dirs: &[PathBuf]) -> Vec<PathBuf> {
    let mut seen = HashSet::new();
    let mut libs: Vec<(u8, String, PathBuf)> = Vec::new();

    for dir in dirs {
        let Ok(entries) = std::fs::read_dir(dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            let name = path
                .file_name()
                .unwrap_or_default()
                .to_string_lossy()
                .to_string();
            if !is_shared_lib(&name, &path) {
                continue;
            }
            let Some(priority) = load_priority(&name) else {
                continue;
            };
            if seen.insert(name.clone()) {
                libs.push((priority, name, path));
            }
        }
    }

    libs.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
    libs.into_iter().map(|(_, _, path)| path).collect()
}

#[cfg(unix)]
unsafe fn load_library(path: &Path) -> bool {
    match libloading::os::unix::Library::open(Some(path), libc::RTLD_LAZY | libc::RTLD_GLOBAL) {
        Ok(lib) => {
            std::mem::forget(lib);
            true
        }
        Err(_) => false,
    }
}

#[cfg(windows)]
unsafe fn load_library(path: &Path) -> bool {
    match libloading::Library::new(path) {
        Ok(lib) => {
            std::mem::forget(lib);
            true
        }
        Err(_) => false,
    }
}

/// Locates ONNX Runtime and preloads GPU libraries.
///
/// Call at the very start of `main()`, before any session is built.
pub fn setup_runtime_libs() -> RuntimeLibReport {
    let search_dirs = candidate_lib_dirs();

    if env::var_os(ORT_DYLIB_ENV).is_none() {
        if let Some(path) = find_ort_dylib(&search_dirs) {
            env::set_var(ORT_DYLIB_ENV, &path);
        }
    }
    let ort_dylib = env::var_os(ORT_DYLIB_ENV).map(PathBuf::from);

    let preloaded = preload_plan(&search_dirs)
        .into_iter()
        // SAFETY: the libraries are vendor GPU runtimes with no load-time
        // side effects beyond symbol registration.
        .filter(|path| unsafe { load_library(path) })
        .collect();

    RuntimeLibReport {
        search_dirs,
        ort_dylib,
        preloaded,
    }
}

/// Logs what [`setup_runtime_libs`] found. Call after tracing is initialized.
pub fn log_runtime_lib_status(report: &RuntimeLibReport) {
    match &report.ort_dylib {
        Some(path) if path.is_file() => info!(path = %path.display(), "ONNX Runtime library"),
        Some(path) => warn!(
            path = %path.display(),
            "ORT_DYLIB_PATH points at a missing file"
        ),
        None => warn!("ORT_DYLIB_PATH not set, ONNX Runtime will use default search paths"),
    }
    for path in &report.preloaded {
        debug!(path = %path.display(), "Preloaded GPU runtime library");
    }
    info!(
        preloaded = report.preloaded.len(),
        search_dirs = report.search_dirs.len(),
        "Runtime library setup complete"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_priority_orders_cuda_before_cudnn_before_trt() {
        assert!(load_priority("libcudart.so.12") < load_priority("libcudnn.so.9"));
        assert!(load_priority("libcublasLt.so.12") < load_priority("libcudnn_ops.so.9"));
        assert!(load_priority("libcudnn.so.9") < load_priority("libnvinfer.so.10"));
        assert_eq!(load_priority("cudart64_12.dll"), Some(0));
    }

    #[test]
    fn load_priority_excludes_ort_and_unknown_libs() {
        assert_eq!(load_priority("libonnxruntime.so.1.23.2"), None);
        assert_eq!(load_priority("libonnxruntime_providers_cuda.so"), None);
        assert_eq!(load_priority("libsomething_else.so"), None);
    }

    #[cfg(unix)]
    #[test]
    fn preload_plan_dedups_and_orders() {
        let first = tempfile::tempdir().unwrap();
        let second = tempfile::tempdir().unwrap();
        for name in ["libnvinfer.so.10", "libcudnn.so.9", "libcudart.so.12", "libpng.so"] {
            std::fs::write(first.path().join(name), b"").unwrap();
        }
        std::fs::write(second.path().join("libcudart.so.12"), b"").unwrap();

        let plan = preload_plan(&[first.path().to_path_buf(), second.path().to_path_buf()]);
        let names: Vec<_> = plan
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["libcudart.so.12", "libcudnn.so.9", "libnvinfer.so.10"]);
        assert!(plan[0].starts_with(first.path()));
    }

    #[test]
    fn find_ort_dylib_checks_dirs_in_order() {
        let empty = tempfile::tempdir().unwrap();
        let with_lib = tempfile::tempdir().unwrap();
        std::fs::write(with_lib.path().join(ORT_LIB_NAME), b"").unwrap();
        let found = find_ort_dylib(&[empty.path().to_path_buf(), with_lib.path().to_path_buf()]);
        assert_eq!(found, Some(with_lib.path().join(ORT_LIB_NAME)));
    }
}
