//! Resource directory resolution for the CLI.
//!
//! Priority for the directory template paths resolve against:
//! 1. `--resource-dir` (explicit override)
//! 2. `$resource_base` declared in the document
//! 3. `PIXELPILOT_RESOURCE_DIR`
//! 4. The directory containing the document

use std::env;
use std::path::{Path, PathBuf};

use pixelpilot_core::pipeline::loader::expand_home;
use pixelpilot_core::pipeline::LoadOptions;

pub const RESOURCE_DIR_ENV: &str = "PIXELPILOT_RESOURCE_DIR";

/// Resource directory from the environment, ignoring an empty value.
pub fn resource_dir_from_env() -> Option<PathBuf> {
    match env::var(RESOURCE_DIR_ENV) {
        Ok(dir) if !dir.trim().is_empty() => Some(expand_home(dir.trim())),
        _ => None,
    }
}

/// Loader options for a document read from `pipeline`.
pub fn load_options(pipeline: &Path, resource_dir: Option<&Path>) -> LoadOptions {
    let base_dir = pipeline
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_default();
    LoadOptions::new(base_dir)
        .with_resource_override(resource_dir.map(override_dir))
        .with_resource_fallback(resource_dir_from_env())
}

/// Loader options for a document submitted over the protocol.
///
/// Without a `base_dir` the server's working directory is used.
pub fn submit_options(base_dir: Option<&str>) -> LoadOptions {
    let base_dir = match base_dir {
        Some(dir) if !dir.is_empty() => expand_home(dir),
        _ => env::current_dir().unwrap_or_default(),
    };
    LoadOptions::new(base_dir).with_resource_fallback(resource_dir_from_env())
}

fn override_dir(dir: &Path) -> PathBuf {
    match dir.to_str() {
        Some(raw) => expand_home(raw),
        None => dir.to_path_buf(),
    }
}
