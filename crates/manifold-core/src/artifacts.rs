//! On-disk pipeline artifacts.
//!
//! - `root.json`   `{root, timestamp, epoch?, leafCount}`
//! - `merkle.json` `{root, leaves: [{selector, facet, codeIdentity, leafHash}], proofs: {selector: [sibling, ...]}}`
//! - `proofs.json` `{root, leafCount, proofs: {selector: {facet, codeIdentity, proof, positions, leafIndex}}}`
//! - `SHA256SUMS`  `<sha256-hex>  <relative-path>` per produced file, itself excluded
//!
//! A checksum bundle verifies only if it lists exactly the files present under its directory.
//!
//! Fixed-name files are written through a temp file in the same directory and renamed into
//! place, so a reader never observes a partially written artifact.

use crate::hash::sha256;
use crate::merkle::{OrderedMerkleTree, Proof, RouteLeaf};
use crate::{Address, CodeIdentity, Hash32, ManifoldError, Result, Selector};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::io::Write;
use std::path::{Component, Path, PathBuf};
use tracing::debug;

pub const ROOT_FILE: &str = "root.json";
pub const MERKLE_FILE: &str = "merkle.json";
pub const PROOFS_FILE: &str = "proofs.json";
pub const CHECKSUMS_FILE: &str = "SHA256SUMS";

/// Prefix of in-flight temp files; never listed in the checksum bundle.
pub(crate) const TEMP_PREFIX: &str = ".tmp";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RootArtifact {
    pub root: Hash32,
    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub epoch: Option<u64>,
    pub leaf_count: usize,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MerkleLeafEntry {
    pub selector: Selector,
    pub facet: Address,
    pub code_identity: CodeIdentity,
    pub leaf_hash: Hash32,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MerkleArtifact {
    pub root: Hash32,
    pub leaves: Vec<MerkleLeafEntry>,
    pub proofs: BTreeMap<Selector, Vec<Hash32>>,
}

impl MerkleArtifact {
    pub fn from_tree(tree: &OrderedMerkleTree) -> Result<Self> {
        let mut proofs = BTreeMap::new();
        for proof in tree.proofs()? {
            proofs.insert(proof.selector, proof.siblings);
        }
        Ok(Self {
            root: tree.root(),
            leaves: tree
                .leaves()
                .iter()
                .map(|l| MerkleLeafEntry {
                    selector: l.selector,
                    facet: l.facet,
                    code_identity: l.code_identity,
                    leaf_hash: l.leaf_hash(),
                })
                .collect(),
            proofs,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProofEntry {
    pub facet: Address,
    pub code_identity: CodeIdentity,
    pub proof: Vec<Hash32>,
    /// Position bitfield as `0x`-prefixed hex.
    pub positions: String,
    pub leaf_index: usize,
}

/// Per-selector proofs with positions, as consumed by deployment tooling.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProofPackage {
    pub root: Hash32,
    pub leaf_count: usize,
    pub proofs: BTreeMap<Selector, ProofEntry>,
}

fn parse_positions(raw: &str, selector: &Selector) -> Result<u64> {
    let digits = raw.strip_prefix("0x").unwrap_or(raw);
    u64::from_str_radix(digits, 16).map_err(|e| ManifoldError::MalformedProof {
        selector: *selector,
        reason: format!("positions '{raw}': {e}"),
    })
}

impl ProofPackage {
    pub fn from_tree(tree: &OrderedMerkleTree) -> Result<Self> {
        let mut proofs = BTreeMap::new();
        for leaf in tree.leaves() {
            let proof = tree.prove_of(&leaf.selector)?;
            proofs.insert(
                leaf.selector,
                ProofEntry {
                    facet: leaf.facet,
                    code_identity: leaf.code_identity,
                    proof: proof.siblings,
                    positions: format!("0x{:x}", proof.positions),
                    leaf_index: proof.leaf_index,
                },
            );
        }
        Ok(Self {
            root: tree.root(),
            leaf_count: tree.len(),
            proofs,
        })
    }

    /// Leaf and proof for one selector.
    pub fn entry(&self, selector: &Selector) -> Result<(RouteLeaf, Proof)> {
        let e = self
            .proofs
            .get(selector)
            .ok_or(ManifoldError::UnknownSelector {
                selector: *selector,
            })?;
        Ok((
            RouteLeaf::new(*selector, e.facet, e.code_identity),
            Proof {
                selector: *selector,
                leaf_index: e.leaf_index,
                siblings: e.proof.clone(),
                positions: parse_positions(&e.positions, selector)?,
            },
        ))
    }

    /// Re-verify every packaged proof against the packaged root. Returns the number checked.
    pub fn verify_all(&self) -> Result<usize> {
        for selector in self.proofs.keys() {
            let (leaf, proof) = self.entry(selector)?;
            OrderedMerkleTree::verify_checked(&leaf, &proof, &self.root, self.leaf_count)?;
        }
        Ok(self.proofs.len())
    }
}

// =============================================================================
// File IO
// =============================================================================

/// Serialize `value` as pretty JSON and atomically replace `path`.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value)
        .map_err(|e| ManifoldError::Io(format!("serializing {}: {e}", path.display())))?;
    write_atomic(path, &bytes)
}

pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir)
        .map_err(|e| ManifoldError::io(format!("creating {}", dir.display()), e))?;

    let mut tmp = tempfile::Builder::new()
        .prefix(TEMP_PREFIX)
        .tempfile_in(dir)
        .map_err(|e| ManifoldError::io(format!("creating temp file in {}", dir.display()), e))?;
    tmp.write_all(bytes)
        .map_err(|e| ManifoldError::io(format!("writing {}", path.display()), e))?;
    tmp.persist(path)
        .map_err(|e| ManifoldError::io(format!("renaming into {}", path.display()), e.error))?;
    debug!(path = %path.display(), bytes = bytes.len(), "Wrote artifact");
    Ok(())
}

pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let raw = std::fs::read_to_string(path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            ManifoldError::MissingArtifact(path.display().to_string())
        } else {
            ManifoldError::io(format!("reading {}", path.display()), e)
        }
    })?;
    serde_json::from_str(&raw)
        .map_err(|e| ManifoldError::MalformedManifest(format!("{}: {e}", path.display())))
}

fn collect_files(base: &Path, dir: &Path, out: &mut Vec<String>) -> Result<()> {
    let entries = std::fs::read_dir(dir)
        .map_err(|e| ManifoldError::io(format!("listing {}", dir.display()), e))?;
    for entry in entries {
        let entry = entry.map_err(|e| ManifoldError::io(format!("listing {}", dir.display()), e))?;
        let path = entry.path();
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with(TEMP_PREFIX) {
            continue;
        }
        let file_type = entry
            .file_type()
            .map_err(|e| ManifoldError::io(format!("stat {}", path.display()), e))?;
        if file_type.is_dir() {
            collect_files(base, &path, out)?;
        } else if file_type.is_file() {
            let rel = path
                .strip_prefix(base)
                .map_err(|e| ManifoldError::Io(format!("{}: {e}", path.display())))?;
            let rel = rel
                .components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect::<Vec<_>>()
                .join("/");
            if rel != CHECKSUMS_FILE {
                out.push(rel);
            }
        }
    }
    Ok(())
}

fn sha256_file(path: &Path) -> Result<String> {
    let bytes = std::fs::read(path)
        .map_err(|e| ManifoldError::io(format!("reading {}", path.display()), e))?;
    Ok(hex::encode(sha256(&bytes)))
}

/// Hash every file under `dir` (recursively, sorted by relative path) into `dir/SHA256SUMS`.
pub fn write_checksums(dir: &Path) -> Result<PathBuf> {
    let mut files = Vec::new();
    collect_files(dir, dir, &mut files)?;
    files.sort();

    let mut body = String::new();
    for rel in &files {
        body.push_str(&sha256_file(&dir.join(rel))?);
        body.push_str("  ");
        body.push_str(rel);
        body.push('\n');
    }

    let path = dir.join(CHECKSUMS_FILE);
    write_atomic(&path, body.as_bytes())?;
    Ok(path)
}

/// Listed paths must stay inside the bundle.
fn check_listed_path(rel: &str) -> Result<()> {
    let escapes = Path::new(rel).components().any(|c| {
        matches!(c, Component::ParentDir | Component::RootDir | Component::Prefix(_))
    });
    if rel.is_empty() || escapes {
        return Err(ManifoldError::ChecksumBundle(format!(
            "path '{rel}' is not inside the bundle"
        )));
    }
    Ok(())
}

/// Re-hash every file listed in `dir/SHA256SUMS` and require the listing to cover exactly the
/// files under `dir`. Returns the number verified.
pub fn verify_checksums(dir: &Path) -> Result<usize> {
    let sums = dir.join(CHECKSUMS_FILE);
    let raw = std::fs::read_to_string(&sums).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            ManifoldError::MissingArtifact(sums.display().to_string())
        } else {
            ManifoldError::io(format!("reading {}", sums.display()), e)
        }
    })?;

    let mut listed = BTreeSet::new();
    for line in raw.lines().filter(|l| !l.trim().is_empty()) {
        let (expected, rel) = line.split_once("  ").ok_or_else(|| {
            ManifoldError::MalformedManifest(format!("{CHECKSUMS_FILE}: bad line '{line}'"))
        })?;
        check_listed_path(rel)?;
        if !listed.insert(rel.to_string()) {
            return Err(ManifoldError::ChecksumBundle(format!("'{rel}' listed twice")));
        }
        let path = dir.join(rel);
        if !path.is_file() {
            return Err(ManifoldError::MissingArtifact(rel.to_string()));
        }
        if sha256_file(&path)? != expected.to_ascii_lowercase() {
            return Err(ManifoldError::ChecksumMismatch {
                path: rel.to_string(),
            });
        }
    }
    if listed.is_empty() {
        return Err(ManifoldError::ChecksumBundle(format!(
            "{CHECKSUMS_FILE} lists no files"
        )));
    }

    let mut present = Vec::new();
    collect_files(dir, dir, &mut present)?;
    let unlisted: Vec<String> = present.into_iter().filter(|f| !listed.contains(f)).collect();
    if !unlisted.is_empty() {
        return Err(ManifoldError::ChecksumBundle(format!(
            "unlisted files: {}",
            unlisted.join(", ")
        )));
    }
    Ok(listed.len())
}
