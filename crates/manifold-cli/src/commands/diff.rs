//! `manifold diff` command implementation

use anyhow::{Context, Result};
use manifold_core::codehash::{diff, load_snapshot};
use manifold_core::{ManifoldConfig, ManifoldError};
use std::path::PathBuf;

pub fn run(config: &ManifoldConfig, a: PathBuf, b: PathBuf, json: bool) -> Result<()> {
    let map_a = load_snapshot(&a).with_context(|| format!("Failed to load {}", a.display()))?;
    let map_b = load_snapshot(&b).with_context(|| format!("Failed to load {}", b.display()))?;

    let report = diff(&map_a, &map_b);
    if json {
        println!("{}", serde_json::to_string_pretty(&report.to_json())?);
    } else {
        print!(
            "{}",
            report.render(
                &a.display().to_string(),
                &b.display().to_string(),
                config.report.preview_limit
            )
        );
    }

    if report.is_clean() {
        Ok(())
    } else if json {
        // Payload already printed; only the exit status remains.
        std::process::exit(1);
    } else {
        Err(ManifoldError::Drift {
            summary: report.summary(),
        }
        .into())
    }
}
