//! CLI Command Implementations

pub mod build;
pub mod check;
pub mod diff;
pub mod gate;

use anyhow::{Context, Result};
use manifold_core::{ErrorClass, ManifoldConfig, ManifoldError};
use std::path::{Path, PathBuf};

/// Config file if given, else `MANIFOLD_*` environment variables over defaults.
pub fn load_config(path: Option<&Path>) -> Result<ManifoldConfig> {
    match path {
        Some(path) => ManifoldConfig::from_file(path)
            .with_context(|| format!("Failed to load config: {}", path.display())),
        None => ManifoldConfig::from_env().context("Failed to load config from environment"),
    }
}

/// Taxonomy class of the first `ManifoldError` in the chain.
pub fn error_class(err: &anyhow::Error) -> Option<ErrorClass> {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<ManifoldError>())
        .map(ManifoldError::class)
}

/// Machine-readable failure payload.
pub fn failure_payload(err: &anyhow::Error) -> serde_json::Value {
    serde_json::json!({
        "ok": false,
        "class": error_class(err),
        "error": format!("{:#}", err),
    })
}

/// Report `err` and exit non-zero.
pub fn fail(err: &anyhow::Error, json: bool) -> ! {
    if json {
        println!("{}", failure_payload(err));
    } else {
        eprintln!("❌ {:#}", err);
    }
    std::process::exit(1);
}

/// Directory holding the predictive bundle, unless overridden.
pub fn bundle_dir(config: &ManifoldConfig, dir: Option<PathBuf>) -> PathBuf {
    dir.unwrap_or_else(|| config.pipeline.output_dir.join("predictive"))
}
