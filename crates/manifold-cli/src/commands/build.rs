//! `manifold build` command implementation

use anyhow::{Context, Result};
use manifold_adapters::{CompilerArtifactSource, JsonRpcCodeSource};
use manifold_core::catalog::SelectorCatalog;
use manifold_core::pipeline::{load_address_map, now_ms, AddressMap, PipelineOutput, ReconciliationPipeline};
use manifold_core::{Hash32, ManifoldConfig};
use std::path::PathBuf;
use tracing::info;

pub struct PredictiveArgs {
    pub manifest: PathBuf,
    pub artifacts: Option<PathBuf>,
    pub addresses: Option<PathBuf>,
    pub expected_root: Option<String>,
    pub out: Option<PathBuf>,
}

fn report(output: &PipelineOutput, json: bool) {
    if json {
        println!(
            "{}",
            serde_json::json!({
                "ok": true,
                "mode": output.mode,
                "root": output.root,
                "leafCount": output.leaf_count,
                "verifiedProofs": output.verified_proofs,
                "snapshot": output.snapshot_path.display().to_string(),
                "checksums": output.checksums_path.display().to_string(),
            })
        );
        return;
    }
    println!("✅ {} build complete", output.mode);
    println!("   Root:       {}", output.root);
    println!("   Leaves:     {}", output.leaf_count);
    println!("   Self-check: {} proofs verified", output.verified_proofs);
    println!("   Snapshot:   {}", output.snapshot_path.display());
    println!("   Checksums:  {}", output.checksums_path.display());
}

pub fn predictive(mut config: ManifoldConfig, args: PredictiveArgs, json: bool) -> Result<()> {
    if let Some(out) = args.out {
        config.pipeline.output_dir = out;
    }
    if let Some(dir) = args.artifacts {
        config.pipeline.artifacts_dir = dir;
    }
    if let Some(root) = args.expected_root {
        let root: Hash32 = root.parse().context("Invalid --expected-root")?;
        config.pipeline.expected_root = Some(root);
    }

    let catalog = SelectorCatalog::load(&args.manifest)
        .with_context(|| format!("Failed to load manifest: {}", args.manifest.display()))?;
    info!(selectors = catalog.len(), manifest = %args.manifest.display(), "Loaded selector manifest");
    let addresses = match args.addresses {
        Some(path) => load_address_map(&path)
            .with_context(|| format!("Failed to load addresses: {}", path.display()))?,
        None => AddressMap::new(),
    };
    let source = CompilerArtifactSource::new(
        config.pipeline.artifacts_dir.clone(),
        config.pipeline.facet_suffix.clone(),
    );

    let output = ReconciliationPipeline::new(config)
        .run_predictive(&source, &catalog, &addresses, now_ms()?)
        .context("Predictive build failed")?;
    report(&output, json);
    Ok(())
}

pub fn observed(
    mut config: ManifoldConfig,
    manifest: PathBuf,
    deployed: PathBuf,
    rpc_url: Option<String>,
    out: Option<PathBuf>,
    json: bool,
) -> Result<()> {
    if let Some(out) = out {
        config.pipeline.output_dir = out;
    }
    if let Some(url) = rpc_url {
        config.rpc.url = Some(url);
    }

    let catalog = SelectorCatalog::load(&manifest)
        .with_context(|| format!("Failed to load manifest: {}", manifest.display()))?;
    info!(selectors = catalog.len(), manifest = %manifest.display(), "Loaded selector manifest");
    let deployed_map = load_address_map(&deployed)
        .with_context(|| format!("Failed to load deployed addresses: {}", deployed.display()))?;
    let code = JsonRpcCodeSource::new(&config.rpc).context("Failed to create RPC client")?;

    let output = ReconciliationPipeline::new(config)
        .run_observed(&code, &catalog, &deployed_map, now_ms()?)
        .context("Observed build failed")?;
    report(&output, json);
    Ok(())
}
