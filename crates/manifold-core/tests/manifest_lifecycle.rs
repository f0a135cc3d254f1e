//! End-to-end: predictive build → commit → delay → audit → activation → proven routes.

use manifold_core::{
    artifacts::{read_json, ProofPackage, PROOFS_FILE},
    catalog::SelectorCatalog,
    codehash::InMemoryCodeSource,
    config::GovernanceConfig,
    governance::{Event, InMemoryAuditRegistry, ManifestStateMachine, ManualClock, RouteBatch},
    hash::keccak256,
    merkle::{OrderedMerkleTree, RouteLeaf},
    pipeline::{AddressMap, ReconciliationPipeline},
    Address, ArtifactSource, BuildArtifact, Hash32, ManifoldConfig, ManifoldError, Result,
    Selector,
};
use std::sync::Arc;

const DELAY: u64 = 3_600;

struct Build(Vec<BuildArtifact>);

impl ArtifactSource for Build {
    fn facet_artifacts(&self) -> Result<Vec<BuildArtifact>> {
        Ok(self.0.clone())
    }
}

fn manifest() -> SelectorCatalog {
    SelectorCatalog::from_manifest_json(
        r#"{
            "version": "1",
            "facets": {
                "PingFacet": { "selectors": ["0xaaaaaaaa", "0xcccccccc"] },
                "PongFacet": { "selectors": ["0xbbbbbbbb"] }
            }
        }"#,
    )
    .unwrap()
}

fn build() -> Build {
    Build(vec![
        BuildArtifact {
            name: "PingFacet".into(),
            runtime_code: b"ping-runtime".to_vec(),
            abi_selectors: None,
        },
        BuildArtifact {
            name: "PongFacet".into(),
            runtime_code: b"pong-runtime".to_vec(),
            abi_selectors: None,
        },
    ])
}

struct World {
    code: Arc<InMemoryCodeSource>,
    clock: Arc<ManualClock>,
    audit: Arc<InMemoryAuditRegistry>,
    sm: ManifestStateMachine,
    addresses: AddressMap,
}

fn world() -> World {
    let code = Arc::new(InMemoryCodeSource::new());
    let ping = Address([0x11; 20]);
    let pong = Address([0x22; 20]);
    code.set_code(ping, b"ping-runtime".to_vec());
    code.set_code(pong, b"pong-runtime".to_vec());

    let clock = Arc::new(ManualClock::new(1_700_000_000));
    let audit = Arc::new(InMemoryAuditRegistry::new());
    let config = GovernanceConfig {
        activation_delay_secs: DELAY,
        max_activation_delay_secs: 10 * DELAY,
    };
    let mut sm = ManifestStateMachine::new(&config, code.clone(), clock.clone());
    sm.set_audit_registry(Address([0xad; 20]), audit.clone()).unwrap();

    World {
        code,
        clock,
        audit,
        sm,
        addresses: AddressMap::from([("PingFacet".into(), ping), ("PongFacet".into(), pong)]),
    }
}

fn batch(package: &ProofPackage) -> RouteBatch {
    let mut batch = RouteBatch::default();
    for selector in package.proofs.keys() {
        let (leaf, proof) = package.entry(selector).unwrap();
        batch.selectors.push(leaf.selector);
        batch.facets.push(leaf.facet);
        batch.code_identities.push(leaf.code_identity);
        batch.proofs.push(proof.siblings);
        batch.positions.push(proof.positions);
    }
    batch
}

#[test]
fn built_manifest_governs_live_routes() {
    let dir = tempfile::tempdir().unwrap();
    let mut w = world();
    let pipeline = ReconciliationPipeline::new(
        ManifoldConfig::builder().output_dir(dir.path()).build().unwrap(),
    );

    let out = pipeline
        .run_predictive(&build(), &manifest(), &w.addresses, 1_700_000_000_000)
        .unwrap();
    let package: ProofPackage = read_json(&out.bundle_dir.join(PROOFS_FILE)).unwrap();
    assert_eq!(package.root, out.root);

    w.sm.commit_manifest(out.root, 1, out.leaf_count as u32).unwrap();
    assert!(matches!(
        w.sm.activate_committed_root(),
        Err(ManifoldError::ActivationNotReady { .. })
    ));

    w.clock.advance(DELAY);
    assert!(matches!(
        w.sm.activate_committed_root(),
        Err(ManifoldError::AuditNotApproved { .. })
    ));

    w.audit.set_status(out.root, true);
    w.sm.activate_committed_root().unwrap();
    assert_eq!(w.sm.active_root(), Some(out.root));

    w.sm.apply_batch(batch(&package)).unwrap();
    let ping_sel: Selector = "0xcccccccc".parse().unwrap();
    assert_eq!(w.sm.get_route(&ping_sel), Some(w.addresses["PingFacet"]));
    assert!(w
        .sm
        .events()
        .iter()
        .any(|e| matches!(e, Event::RouteAdded { selector, .. } if *selector == ping_sel)));
}

#[test]
fn redeployed_facet_is_rejected_at_apply_time() {
    let dir = tempfile::tempdir().unwrap();
    let mut w = world();
    let pipeline = ReconciliationPipeline::new(
        ManifoldConfig::builder().output_dir(dir.path()).build().unwrap(),
    );
    let out = pipeline
        .run_predictive(&build(), &manifest(), &w.addresses, 1)
        .unwrap();
    let package: ProofPackage = read_json(&out.bundle_dir.join(PROOFS_FILE)).unwrap();

    w.sm.commit_manifest(out.root, 1, out.leaf_count as u32).unwrap();
    w.audit.set_status(out.root, true);
    w.clock.advance(DELAY);
    w.sm.activate_committed_root().unwrap();

    w.code.set_code(w.addresses["PongFacet"], b"evil".to_vec());
    assert!(matches!(
        w.sm.apply_batch(batch(&package)),
        Err(ManifoldError::CodehashMismatch { .. })
    ));
    assert!(w.sm.state().routes.is_empty());
}

#[test]
fn maintenance_must_be_disabled_for_audit_to_bind() {
    let mut w = world();
    let facet = Address([0x33; 20]);
    let sel: Selector = "0xdeadbeef".parse().unwrap();

    w.sm.set_dev_registrar_enabled(true).unwrap();
    w.sm.admin_register_unsafe(&[facet], &[vec![sel]]).unwrap();
    assert_eq!(w.sm.get_route(&sel), Some(facet));

    let root = keccak256(b"pending-selector");
    w.sm.commit_root(root, 1).unwrap();
    w.sm.set_dev_registrar_enabled(false).unwrap();
    w.clock.advance(DELAY);

    assert!(matches!(
        w.sm.activate_committed_root(),
        Err(ManifoldError::AuditNotApproved { .. })
    ));
    w.audit.set_status(root, true);
    w.sm.activate_committed_root().unwrap();
    assert_eq!(w.sm.active_root(), Some(root));
    assert_eq!(w.sm.bypass_log().len(), 1);
}

#[test]
fn proofs_from_one_root_fail_under_the_next() {
    let mut w = world();
    let leaves_v1 = OrderedMerkleTree::build([
        RouteLeaf::new(Selector([1; 4]), Address([0x11; 20]), Hash32::ZERO),
        RouteLeaf::new(Selector([2; 4]), Address([0x11; 20]), Hash32::ZERO),
    ])
    .unwrap();
    let proof = leaves_v1.prove_of(&Selector([1; 4])).unwrap();

    let other = keccak256(b"v2");
    w.sm.commit_root(other, 1).unwrap();
    w.audit.set_status(other, true);
    w.clock.advance(DELAY);
    w.sm.activate_committed_root().unwrap();

    assert!(matches!(
        w.sm.apply_routes(
            &[Selector([1; 4])],
            &[Address([0x11; 20])],
            &[Hash32::ZERO],
            &[proof.siblings],
            &[proof.positions],
        ),
        Err(ManifoldError::ProofVerificationFailed { .. })
    ));
}
