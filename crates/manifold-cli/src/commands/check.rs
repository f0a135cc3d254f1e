//! `manifold selfcheck` and `manifold checksums` command implementations

use anyhow::{Context, Result};
use manifold_core::artifacts::write_checksums;
use manifold_core::pipeline::{self_check_bundle, verify_bundle_checksums};
use manifold_core::ManifoldConfig;
use std::path::PathBuf;

use super::bundle_dir;

pub fn selfcheck(config: &ManifoldConfig, dir: Option<PathBuf>, json: bool) -> Result<()> {
    let dir = bundle_dir(config, dir);
    let checked = self_check_bundle(&dir)
        .with_context(|| format!("Self-check failed for {}", dir.display()))?;

    if json {
        println!("{}", serde_json::json!({"ok": true, "verifiedProofs": checked}));
    } else {
        println!("✅ Self-check passed: {} proofs verify against the bundle root", checked);
    }
    Ok(())
}

pub fn checksums(config: &ManifoldConfig, dir: Option<PathBuf>, write: bool, json: bool) -> Result<()> {
    let dir = bundle_dir(config, dir);

    if write {
        let path = write_checksums(&dir)
            .with_context(|| format!("Failed to write checksums in {}", dir.display()))?;
        if json {
            println!("{}", serde_json::json!({"ok": true, "written": path.display().to_string()}));
        } else {
            println!("✅ Wrote {}", path.display());
        }
        return Ok(());
    }

    let checked = verify_bundle_checksums(&dir)
        .with_context(|| format!("Checksum verification failed for {}", dir.display()))?;
    if json {
        println!("{}", serde_json::json!({"ok": true, "verifiedFiles": checked}));
    } else {
        println!("✅ {} files match SHA256SUMS", checked);
    }
    Ok(())
}
