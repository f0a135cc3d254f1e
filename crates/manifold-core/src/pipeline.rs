//! Reconciliation pipeline.
//!
//! Predictive flow: build artifacts → predicted identities → tree → self-check → bundle.
//! Observed flow: deployed addresses → observed identities → tree → self-check → bundle.
//! Drift gate: newest predictive vs newest observed snapshot; any difference fails.
//!
//! Each flow writes its bundle under `<output_dir>/<mode>/`:
//! `root.json`, `merkle.json`, `proofs.json`, `codehashes-<mode>-<ms>.json`, `SHA256SUMS`.
//! Snapshots accumulate across runs and stay covered by `SHA256SUMS`; the fixed-name files
//! hold the last run only, so two runs of the same mode must not share an output directory.

use crate::artifacts::{
    read_json, verify_checksums, write_checksums, write_json_atomic, MerkleArtifact,
    ProofPackage, RootArtifact, MERKLE_FILE, PROOFS_FILE, ROOT_FILE,
};
use crate::catalog::SelectorCatalog;
use crate::codehash::{
    diff, latest_snapshot, load_snapshot, observed_identity, predicted_identity, CodehashMap,
    CodehashSnapshot, SnapshotDiff, SnapshotMode,
};
use crate::merkle::{OrderedMerkleTree, RouteLeaf};
use crate::{
    Address, ArtifactSource, CodeSource, Hash32, ManifoldConfig, ManifoldError, Result, Selector,
};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

/// Facet name → deployed (or planned) address.
pub type AddressMap = BTreeMap<String, Address>;

pub fn now_ms() -> Result<u64> {
    let ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|_| ManifoldError::Io("system clock error".into()))?
        .as_millis();
    u64::try_from(ms).map_err(|_| ManifoldError::Io("system clock overflow".into()))
}

/// Load a `{ "<FacetName>": "0x<address>" }` file.
pub fn load_address_map(path: &Path) -> Result<AddressMap> {
    let raw: BTreeMap<String, String> = read_json(path)?;
    raw.into_iter()
        .map(|(name, addr)| {
            let parsed = addr.parse().map_err(|e| {
                ManifoldError::MalformedManifest(format!("{}: facet {name}: {e}", path.display()))
            })?;
            Ok((name, parsed))
        })
        .collect()
}

/// Paths and results of one flow.
#[derive(Clone, Debug)]
pub struct PipelineOutput {
    pub mode: SnapshotMode,
    pub root: Hash32,
    pub leaf_count: usize,
    pub verified_proofs: usize,
    pub bundle_dir: PathBuf,
    pub snapshot_path: PathBuf,
    pub checksums_path: PathBuf,
}

/// Snapshots compared by the drift gate.
#[derive(Clone, Debug)]
pub struct GateReport {
    pub predictive: PathBuf,
    pub observed: PathBuf,
    pub diff: SnapshotDiff,
}

impl GateReport {
    pub fn render(&self, preview_limit: usize) -> String {
        self.diff.render(
            &self.predictive.display().to_string(),
            &self.observed.display().to_string(),
            preview_limit,
        )
    }
}

pub struct ReconciliationPipeline {
    config: ManifoldConfig,
}

impl ReconciliationPipeline {
    pub fn new(config: ManifoldConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ManifoldConfig {
        &self.config
    }

    pub fn bundle_dir(&self, mode: SnapshotMode) -> PathBuf {
        self.config.pipeline.output_dir.join(mode.as_str())
    }

    /// Predictive flow.
    ///
    /// `addresses` supplies planned facet addresses; facets absent from it are bound to the
    /// zero address.
    pub fn run_predictive(
        &self,
        source: &dyn ArtifactSource,
        catalog: &SelectorCatalog,
        addresses: &AddressMap,
        timestamp_ms: u64,
    ) -> Result<PipelineOutput> {
        let artifacts = source.facet_artifacts()?;
        info!(facets = artifacts.len(), "Predictive flow: loaded build artifacts");

        let mut identities = CodehashMap::new();
        let mut compiled: BTreeMap<String, BTreeSet<Selector>> = BTreeMap::new();
        let catalogued = catalog.by_facet();

        for artifact in &artifacts {
            if identities
                .insert(artifact.name.clone(), predicted_identity(&artifact.runtime_code))
                .is_some()
            {
                return Err(ManifoldError::MalformedManifest(format!(
                    "duplicate build artifact for facet {}",
                    artifact.name
                )));
            }
            let selectors = match &artifact.abi_selectors {
                Some(abi) => abi.iter().copied().collect(),
                None => catalogued.get(&artifact.name).cloned().unwrap_or_default(),
            };
            compiled.insert(artifact.name.clone(), selectors);
        }
        catalog.check_parity(&compiled)?;
        debug!("Selector parity ok");

        let leaves = build_leaves(catalog, &identities, |facet| {
            Ok(addresses.get(facet).copied().unwrap_or(Address::ZERO))
        })?;
        let tree = OrderedMerkleTree::build(leaves)?;

        if let Some(expected) = self.config.pipeline.expected_root {
            if expected != tree.root() {
                return Err(ManifoldError::RootMismatch {
                    expected,
                    actual: tree.root(),
                });
            }
        }

        self.finish(SnapshotMode::Predictive, &tree, identities, timestamp_ms)
    }

    /// Observed flow. Every catalogued facet must appear in `deployed`.
    pub fn run_observed(
        &self,
        code: &dyn CodeSource,
        catalog: &SelectorCatalog,
        deployed: &AddressMap,
        timestamp_ms: u64,
    ) -> Result<PipelineOutput> {
        info!(facets = deployed.len(), "Observed flow: reading deployed code");

        let mut identities = CodehashMap::new();
        for (name, address) in deployed {
            let id = observed_identity(code, address)?;
            debug!(facet = %name, %address, identity = %id, "Observed identity");
            identities.insert(name.clone(), id);
        }

        let leaves = build_leaves(catalog, &identities, |facet| {
            deployed
                .get(facet)
                .copied()
                .ok_or_else(|| ManifoldError::MissingFacetIdentity {
                    facet: facet.to_string(),
                })
        })?;
        let tree = OrderedMerkleTree::build(leaves)?;

        self.finish(SnapshotMode::Observed, &tree, identities, timestamp_ms)
    }

    fn finish(
        &self,
        mode: SnapshotMode,
        tree: &OrderedMerkleTree,
        identities: CodehashMap,
        timestamp_ms: u64,
    ) -> Result<PipelineOutput> {
        let verified_proofs = tree.self_check()?;
        info!(%mode, root = %tree.root(), leaves = tree.len(), "Self-check passed");

        let dir = self.bundle_dir(mode);
        let mut snapshot = CodehashSnapshot {
            mode,
            build_or_chain_id: self.config.pipeline.build_or_chain_id.clone(),
            timestamp: timestamp_ms,
            entries: identities,
        };
        let snapshot_path = snapshot.write_unique(&dir)?;

        // Name collisions bump the snapshot timestamp; root.json records the final one.
        write_json_atomic(
            &dir.join(ROOT_FILE),
            &RootArtifact {
                root: tree.root(),
                timestamp: snapshot.timestamp,
                epoch: None,
                leaf_count: tree.len(),
            },
        )?;
        write_json_atomic(&dir.join(MERKLE_FILE), &MerkleArtifact::from_tree(tree)?)?;
        write_json_atomic(&dir.join(PROOFS_FILE), &ProofPackage::from_tree(tree)?)?;
        let checksums_path = write_checksums(&dir)?;

        Ok(PipelineOutput {
            mode,
            root: tree.root(),
            leaf_count: tree.len(),
            verified_proofs,
            bundle_dir: dir,
            snapshot_path,
            checksums_path,
        })
    }

    /// Newest predictive vs newest observed snapshot under `dir`.
    pub fn compare_latest(&self, dir: &Path) -> Result<GateReport> {
        let predictive = find_latest(dir, SnapshotMode::Predictive)?;
        let observed = find_latest(dir, SnapshotMode::Observed)?;
        info!(
            predictive = %predictive.display(),
            observed = %observed.display(),
            "Comparing latest snapshots"
        );

        let diff = diff(&load_snapshot(&predictive)?, &load_snapshot(&observed)?);
        Ok(GateReport {
            predictive,
            observed,
            diff,
        })
    }

    /// Like `compare_latest`, failing with `Drift` on any difference.
    pub fn drift_gate(&self, dir: &Path) -> Result<GateReport> {
        let report = self.compare_latest(dir)?;
        if !report.diff.is_clean() {
            warn!(summary = %report.diff.summary(), "Drift gate failed");
            return Err(ManifoldError::Drift {
                summary: report.diff.summary(),
            });
        }
        Ok(report)
    }
}

fn build_leaves(
    catalog: &SelectorCatalog,
    identities: &CodehashMap,
    address_of: impl Fn(&str) -> Result<Address>,
) -> Result<Vec<RouteLeaf>> {
    catalog
        .records()
        .map(|record| {
            let identity = identities.get(&record.facet_name).copied().ok_or_else(|| {
                ManifoldError::MissingFacetIdentity {
                    facet: record.facet_name.clone(),
                }
            })?;
            Ok(RouteLeaf::new(
                record.selector,
                address_of(&record.facet_name)?,
                identity,
            ))
        })
        .collect()
}

/// `dir/<mode>/` first, then `dir` itself.
fn find_latest(dir: &Path, mode: SnapshotMode) -> Result<PathBuf> {
    if let Some(path) = latest_snapshot(&dir.join(mode.as_str()), mode)? {
        return Ok(path);
    }
    latest_snapshot(dir, mode)?.ok_or_else(|| ManifoldError::MissingSnapshot {
        mode: mode.to_string(),
        dir: dir.display().to_string(),
    })
}

/// Re-verify a written bundle: `root.json`, `merkle.json` and `proofs.json` describe the same
/// root and the same leaf set, and every proof verifies against that root. Returns the number
/// of proofs checked.
pub fn self_check_bundle(dir: &Path) -> Result<usize> {
    let package: ProofPackage = read_json(&dir.join(PROOFS_FILE))?;
    let root: RootArtifact = read_json(&dir.join(ROOT_FILE))?;
    let merkle: MerkleArtifact = read_json(&dir.join(MERKLE_FILE))?;
    let fail = |msg: String| Err(ManifoldError::SelfCheckFailed(msg));

    for (name, other) in [(ROOT_FILE, root.root), (MERKLE_FILE, merkle.root)] {
        if other != package.root {
            return fail(format!(
                "{name} root {other} differs from {PROOFS_FILE} root {}",
                package.root
            ));
        }
    }

    let leaf_count = merkle.leaves.len();
    let distinct: BTreeSet<Selector> = merkle.leaves.iter().map(|l| l.selector).collect();
    if distinct.len() != leaf_count {
        return fail(format!("{MERKLE_FILE} lists a selector more than once"));
    }
    if root.leaf_count != leaf_count
        || package.leaf_count != leaf_count
        || package.proofs.len() != leaf_count
        || merkle.proofs.len() != leaf_count
    {
        return fail(format!(
            "leaf counts disagree: {MERKLE_FILE} lists {leaf_count} leaves and {} paths, \
             {ROOT_FILE} says {}, {PROOFS_FILE} says {} and carries {} proofs",
            merkle.proofs.len(),
            root.leaf_count,
            package.leaf_count,
            package.proofs.len()
        ));
    }

    for leaf in &merkle.leaves {
        let Some(entry) = package.proofs.get(&leaf.selector) else {
            return fail(format!("{PROOFS_FILE} has no proof for {}", leaf.selector));
        };
        let bound = RouteLeaf::new(leaf.selector, entry.facet, entry.code_identity);
        if entry.facet != leaf.facet
            || entry.code_identity != leaf.code_identity
            || bound.leaf_hash() != leaf.leaf_hash
        {
            return fail(format!(
                "leaf {} differs between {MERKLE_FILE} and {PROOFS_FILE}",
                leaf.selector
            ));
        }
        if merkle.proofs.get(&leaf.selector) != Some(&entry.proof) {
            return fail(format!(
                "sibling path for {} differs between {MERKLE_FILE} and {PROOFS_FILE}",
                leaf.selector
            ));
        }
    }

    let checked = package.verify_all()?;
    info!(dir = %dir.display(), proofs = checked, "Bundle self-check passed");
    Ok(checked)
}

/// Verify `dir/SHA256SUMS`.
pub fn verify_bundle_checksums(dir: &Path) -> Result<usize> {
    let checked = verify_checksums(dir)?;
    info!(dir = %dir.display(), files = checked, "Checksums verified");
    Ok(checked)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{Mutability, SelectorRecord};
    use crate::codehash::InMemoryCodeSource;
    use crate::BuildArtifact;

    struct FixedArtifacts(Vec<BuildArtifact>);

    impl ArtifactSource for FixedArtifacts {
        fn facet_artifacts(&self) -> Result<Vec<BuildArtifact>> {
            Ok(self.0.clone())
        }
    }

    fn record(sel: u8, facet: &str) -> SelectorRecord {
        SelectorRecord {
            selector: Selector([sel; 4]),
            facet_name: facet.into(),
            signature: String::new(),
            mutability: Mutability::Unknown,
        }
    }

    fn catalog() -> SelectorCatalog {
        SelectorCatalog::from_records([record(1, "A"), record(2, "A"), record(3, "B")]).unwrap()
    }

    fn artifacts() -> FixedArtifacts {
        FixedArtifacts(vec![
            BuildArtifact {
                name: "A".into(),
                runtime_code: vec![0x60, 0x0a],
                abi_selectors: Some(vec![Selector([1; 4]), Selector([2; 4])]),
            },
            BuildArtifact {
                name: "B".into(),
                runtime_code: vec![0x60, 0x0b],
                abi_selectors: None,
            },
        ])
    }

    fn pipeline(dir: &Path) -> ReconciliationPipeline {
        ReconciliationPipeline::new(
            ManifoldConfig::builder()
                .output_dir(dir)
                .build()
                .unwrap(),
        )
    }

    #[test]
    fn predictive_flow_writes_verifiable_bundle() {
        let dir = tempfile::tempdir().unwrap();
        let p = pipeline(dir.path());

        let out = p
            .run_predictive(&artifacts(), &catalog(), &AddressMap::new(), 1_700_000_000_000)
            .unwrap();

        assert_eq!(out.leaf_count, 3);
        assert_eq!(out.verified_proofs, 3);
        assert!(out.snapshot_path.ends_with("codehashes-predictive-1700000000000.json"));
        assert_eq!(self_check_bundle(&out.bundle_dir).unwrap(), 3);
        assert_eq!(verify_bundle_checksums(&out.bundle_dir).unwrap(), 4);
    }

    #[test]
    fn parity_failure_blocks_build() {
        let dir = tempfile::tempdir().unwrap();
        let mut source = artifacts();
        source.0[0].abi_selectors = Some(vec![Selector([1; 4])]);

        let err = pipeline(dir.path())
            .run_predictive(&source, &catalog(), &AddressMap::new(), 1)
            .unwrap_err();
        assert!(matches!(err, ManifoldError::SelectorParity { .. }));
        assert!(!dir.path().join("predictive").join(ROOT_FILE).exists());
    }

    #[test]
    fn expected_root_mismatch_is_integrity_error() {
        let dir = tempfile::tempdir().unwrap();
        let config = ManifoldConfig::builder()
            .output_dir(dir.path())
            .expected_root(Hash32([0x99; 32]))
            .build()
            .unwrap();

        let err = ReconciliationPipeline::new(config)
            .run_predictive(&artifacts(), &catalog(), &AddressMap::new(), 1)
            .unwrap_err();
        assert!(matches!(err, ManifoldError::RootMismatch { .. }));
    }

    #[test]
    fn missing_artifact_for_catalogued_facet() {
        let dir = tempfile::tempdir().unwrap();
        let mut source = artifacts();
        source.0.pop();

        // B is catalogued but was not built.
        let err = pipeline(dir.path())
            .run_predictive(&source, &catalog(), &AddressMap::new(), 1)
            .unwrap_err();
        assert!(matches!(err, ManifoldError::SelectorParity { missing_in_build: 1, .. }));
    }

    fn deploy(code: &InMemoryCodeSource, tamper_b: bool) -> AddressMap {
        let a = Address([0xa1; 20]);
        let b = Address([0xb1; 20]);
        code.set_code(a, vec![0x60, 0x0a]);
        code.set_code(b, if tamper_b { vec![0xff] } else { vec![0x60, 0x0b] });
        AddressMap::from([("A".to_string(), a), ("B".to_string(), b)])
    }

    #[test]
    fn drift_gate_passes_when_deployment_matches_build() {
        let dir = tempfile::tempdir().unwrap();
        let p = pipeline(dir.path());
        let code = InMemoryCodeSource::new();
        let deployed = deploy(&code, false);

        p.run_predictive(&artifacts(), &catalog(), &deployed, 1_700_000_000_000)
            .unwrap();
        let observed = p.run_observed(&code, &catalog(), &deployed, 1_700_000_000_500).unwrap();

        let report = p.drift_gate(dir.path()).unwrap();
        assert!(report.diff.is_clean());
        assert_eq!(report.observed, observed.snapshot_path);
    }

    #[test]
    fn drift_gate_fails_on_redeployed_facet() {
        let dir = tempfile::tempdir().unwrap();
        let p = pipeline(dir.path());
        let code = InMemoryCodeSource::new();
        let deployed = deploy(&code, true);

        p.run_predictive(&artifacts(), &catalog(), &deployed, 1_700_000_000_000)
            .unwrap();
        p.run_observed(&code, &catalog(), &deployed, 1_700_000_000_500).unwrap();

        let report = p.compare_latest(dir.path()).unwrap();
        assert_eq!(report.diff.mismatches.len(), 1);
        assert_eq!(report.diff.mismatches[0].name, "B");
        assert!(matches!(
            p.drift_gate(dir.path()),
            Err(ManifoldError::Drift { .. })
        ));
    }

    #[test]
    fn gate_without_snapshots_is_data_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = pipeline(dir.path()).drift_gate(dir.path()).unwrap_err();
        assert!(matches!(err, ManifoldError::MissingSnapshot { .. }));
    }

    #[test]
    fn observed_flow_requires_every_facet_deployed() {
        let dir = tempfile::tempdir().unwrap();
        let code = InMemoryCodeSource::new();
        let mut deployed = deploy(&code, false);
        deployed.remove("B");

        let err = pipeline(dir.path())
            .run_observed(&code, &catalog(), &deployed, 1)
            .unwrap_err();
        assert!(matches!(err, ManifoldError::MissingFacetIdentity { .. }));
    }

    #[test]
    fn address_map_loads_and_validates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("addresses.json");
        std::fs::write(&path, format!(r#"{{"A": "0x{}"}}"#, "ab".repeat(20))).unwrap();
        assert_eq!(load_address_map(&path).unwrap()["A"], Address([0xab; 20]));

        std::fs::write(&path, r#"{"A": "0x12"}"#).unwrap();
        assert!(load_address_map(&path).is_err());
    }

    fn predictive_bundle(dir: &Path) -> PathBuf {
        pipeline(dir)
            .run_predictive(&artifacts(), &catalog(), &AddressMap::new(), 1_700_000_000_000)
            .unwrap()
            .bundle_dir
    }

    #[test]
    fn truncated_proof_package_fails_self_check() {
        let dir = tempfile::tempdir().unwrap();
        let bundle = predictive_bundle(dir.path());

        let path = bundle.join(PROOFS_FILE);
        let mut package: ProofPackage = read_json(&path).unwrap();
        package.proofs.remove(&Selector([2; 4]));
        package.proofs.remove(&Selector([3; 4]));
        write_json_atomic(&path, &package).unwrap();

        // The remaining proof still verifies on its own.
        assert_eq!(package.verify_all().unwrap(), 1);
        assert!(matches!(
            self_check_bundle(&bundle),
            Err(ManifoldError::SelfCheckFailed(_))
        ));
    }

    #[test]
    fn leaf_disagreement_between_files_fails_self_check() {
        let dir = tempfile::tempdir().unwrap();
        let bundle = predictive_bundle(dir.path());

        let path = bundle.join(MERKLE_FILE);
        let mut merkle: MerkleArtifact = read_json(&path).unwrap();
        merkle.leaves[0].facet = Address([0xee; 20]);
        write_json_atomic(&path, &merkle).unwrap();

        let err = self_check_bundle(&bundle).unwrap_err();
        assert!(
            matches!(&err, ManifoldError::SelfCheckFailed(m) if m.contains("differs")),
            "{err}"
        );
    }

    #[test]
    fn sibling_path_disagreement_fails_self_check() {
        let dir = tempfile::tempdir().unwrap();
        let bundle = predictive_bundle(dir.path());

        let path = bundle.join(MERKLE_FILE);
        let mut merkle: MerkleArtifact = read_json(&path).unwrap();
        if let Some(siblings) = merkle.proofs.get_mut(&Selector([1; 4])) {
            siblings[0] = Hash32([0xdd; 32]);
        }
        write_json_atomic(&path, &merkle).unwrap();

        assert!(matches!(
            self_check_bundle(&bundle),
            Err(ManifoldError::SelfCheckFailed(_))
        ));
    }

    #[test]
    fn root_timestamp_follows_bumped_snapshot_name() {
        let dir = tempfile::tempdir().unwrap();
        let bundle = dir.path().join("predictive");
        std::fs::create_dir_all(&bundle).unwrap();
        std::fs::write(bundle.join("codehashes-predictive-1700000000000.json"), "{}").unwrap();

        let out = pipeline(dir.path())
            .run_predictive(&artifacts(), &catalog(), &AddressMap::new(), 1_700_000_000_000)
            .unwrap();

        assert!(out.snapshot_path.ends_with("codehashes-predictive-1700000000001.json"));
        let root: RootArtifact = read_json(&bundle.join(ROOT_FILE)).unwrap();
        assert_eq!(root.timestamp, 1_700_000_000_001);
    }
}
