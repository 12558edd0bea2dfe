use crate::error::{Error, Result};
use std::path::{Path, PathBuf};

use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;

#[cfg(target_os = "windows")]
const ORT_LIBRARY_NAME: &str = "onnxruntime.dll";
#[cfg(target_os = "macos")]
const ORT_LIBRARY_NAME: &str = "libonnxruntime.dylib";
#[cfg(not(any(target_os = "windows", target_os = "macos")))]
const ORT_LIBRARY_NAME: &str = "libonnxruntime.so";

fn ort_candidate_paths() -> Vec<PathBuf> {
    let mut candidates = Vec::new();
    if let Ok(exe) = std::env::current_exe() {
        if let Some(parent) = exe.parent() {
            candidates.push(parent.join(ORT_LIBRARY_NAME));
            candidates.push(parent.join("onnxruntime").join(ORT_LIBRARY_NAME));
        }
    }
    candidates.push(Path::new("/usr/local/lib").join(ORT_LIBRARY_NAME));
    candidates.push(Path::new("/usr/lib").join(ORT_LIBRARY_NAME));
    candidates
}

fn pick_ort_library(candidates: Vec<PathBuf>) -> Option<PathBuf> {
    candidates.into_iter().find(|candidate| candidate.exists())
}

/// Points `ort` at a runtime library when `ORT_DYLIB_PATH` is not already set.
fn resolve_ort_dylib_path() {
    if std::env::var_os("ORT_DYLIB_PATH").is_some() {
        return;
    }
    match pick_ort_library(ort_candidate_paths()) {
        Some(path) => {
            log::info!("Using ONNX Runtime library: {}", path.display());
            std::env::set_var("ORT_DYLIB_PATH", path);
        }
        None => log::warn!(
            "{ORT_LIBRARY_NAME} not found next to the executable; relying on the system loader"
        ),
    }
}

fn ensure_environment() -> Result<()> {
    resolve_ort_dylib_path();
    let committed = ort::init()
        .with_name("face-records")
        .commit()
        .map_err(|e| Error::Init(format!("Failed to init ORT environment: {e}")))?;
    if committed {
        if let Ok(env) = ort::environment::get_environment() {
            env.set_log_level(ort::logging::LogLevel::Warning);
        }
    }
    Ok(())
}

pub fn build_session(model_path: &Path) -> Result<Session> {
    if !model_path.exists() {
        return Err(Error::Init(format!(
            "Model not found: {}",
            model_path.display()
        )));
    }
    ensure_environment()?;

    let build = || -> Result<Session> {
        Session::builder()
            .map_err(|e| Error::Init(format!("{e}")))?
            .with_optimization_level(GraphOptimizationLevel::Level1)
            .map_err(|e| Error::Init(format!("{e}")))?
            .with_parallel_execution(false)
            .map_err(|e| Error::Init(format!("{e}")))?
            .commit_from_file(model_path)
            .map_err(|e| Error::Init(format!("{e}")))
    };
    match std::panic::catch_unwind(std::panic::AssertUnwindSafe(build)) {
        Ok(res) => res,
        Err(_) => Err(Error::Init(
            "ONNX Runtime panicked while building session".into(),
        )),
    }
}
