//! `manifold gate` command implementation

use anyhow::{Context, Result};
use manifold_core::pipeline::ReconciliationPipeline;
use manifold_core::{ManifoldConfig, ManifoldError};
use std::path::PathBuf;

pub fn run(config: ManifoldConfig, dir: Option<PathBuf>, json: bool) -> Result<()> {
    let dir = dir.unwrap_or_else(|| config.pipeline.output_dir.clone());
    let preview_limit = config.report.preview_limit;

    let report = ReconciliationPipeline::new(config)
        .compare_latest(&dir)
        .with_context(|| format!("Drift gate could not run in {}", dir.display()))?;

    if json {
        let mut payload = report.diff.to_json();
        payload["predictive"] = report.predictive.display().to_string().into();
        payload["observed"] = report.observed.display().to_string().into();
        println!("{}", serde_json::to_string_pretty(&payload)?);
    } else {
        print!("{}", report.render(preview_limit));
    }

    if report.diff.is_clean() {
        Ok(())
    } else if json {
        std::process::exit(1);
    } else {
        Err(ManifoldError::Drift {
            summary: report.diff.summary(),
        }
        .into())
    }
}
