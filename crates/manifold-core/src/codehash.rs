//! Code identity oracle.
//!
//! - Predictive identity: Keccak-256 of compiled runtime code.
//! - Observed identity: Keccak-256 of the code deployed at an address.
//! - Snapshot normalization: several historical JSON shapes decode to one canonical
//!   `facet name → identity` map. Unknown shapes are rejected, never coerced to empty.
//! - Diff: names missing on either side plus per-name identity mismatches.

use crate::artifacts::TEMP_PREFIX;
use crate::hash::keccak256;
use crate::{Address, CodeIdentity, CodeSource, Hash32, ManifoldError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt::Write as _;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::time::SystemTime;
use tracing::{debug, info};

/// Canonical snapshot content: facet name → code identity.
pub type CodehashMap = BTreeMap<String, CodeIdentity>;

/// Identity predicted from build output.
pub fn predicted_identity(runtime_code: &[u8]) -> CodeIdentity {
    keccak256(runtime_code)
}

/// Identity of the code currently deployed at `address`.
///
/// Empty code is an error: an undeployed facet has no identity.
pub fn observed_identity(source: &dyn CodeSource, address: &Address) -> Result<CodeIdentity> {
    let code = source.code_at(address)?;
    if code.is_empty() {
        return Err(ManifoldError::NoCodeAtAddress { address: *address });
    }
    Ok(keccak256(&code))
}

// =============================================================================
// In-memory code source
// =============================================================================

/// Code source backed by a map. Used in tests and offline dry runs.
#[derive(Default)]
pub struct InMemoryCodeSource {
    code: RwLock<HashMap<Address, Vec<u8>>>,
}

impl InMemoryCodeSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_code(&self, address: Address, code: impl Into<Vec<u8>>) {
        if let Ok(mut map) = self.code.write() {
            map.insert(address, code.into());
        }
    }
}

impl CodeSource for InMemoryCodeSource {
    fn code_at(&self, address: &Address) -> Result<Vec<u8>> {
        let map = self
            .code
            .read()
            .map_err(|_| ManifoldError::Network("code source lock poisoned".into()))?;
        Ok(map.get(address).cloned().unwrap_or_default())
    }
}

// =============================================================================
// Snapshot shapes
// =============================================================================

#[derive(Deserialize)]
struct RawEntry {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    facet: Option<String>,
    #[serde(default)]
    label: Option<String>,
    #[serde(default)]
    codehash: Option<String>,
    #[serde(default)]
    hash: Option<String>,
}

impl RawEntry {
    fn name(&self) -> Option<&str> {
        self.name
            .as_deref()
            .or(self.facet.as_deref())
            .or(self.label.as_deref())
    }

    fn identity(&self) -> Option<&str> {
        self.codehash.as_deref().or(self.hash.as_deref())
    }
}

#[derive(Deserialize)]
struct ArtifactShape {
    codehashes: Vec<RawEntry>,
}

#[derive(Deserialize)]
struct HashField {
    #[serde(default)]
    codehash: Option<String>,
    #[serde(default)]
    hash: Option<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum MapValue {
    Hex(String),
    Object(HashField),
}

/// Accepted shapes, tried in declaration order.
#[derive(Deserialize)]
#[serde(untagged)]
enum SnapshotShape {
    /// `{ codehashes: [{name, codehash}, ...], ... }`
    Artifact(ArtifactShape),
    /// `[{name|facet|label, codehash|hash}, ...]`
    Entries(Vec<RawEntry>),
    /// `{ name: "0x..." }` or `{ name: { codehash|hash } }`
    Map(BTreeMap<String, MapValue>),
}

fn describe_shape(value: &serde_json::Value) -> String {
    use serde_json::Value;
    match value {
        Value::Null => "null".into(),
        Value::Bool(_) => "boolean".into(),
        Value::Number(_) => "number".into(),
        Value::String(_) => "string".into(),
        Value::Array(items) => match items.first() {
            Some(first) => format!("array of {}", describe_shape(first)),
            None => "empty array".into(),
        },
        Value::Object(map) => {
            let keys: Vec<&str> = map.keys().take(5).map(String::as_str).collect();
            format!("object with keys [{}]", keys.join(", "))
        }
    }
}

fn insert_entry(
    out: &mut CodehashMap,
    source_name: &str,
    name: &str,
    identity: &str,
) -> Result<()> {
    let malformed = |reason: String| ManifoldError::MalformedSnapshot {
        source_name: source_name.to_string(),
        reason,
    };
    if name.is_empty() {
        return Err(malformed("entry with empty name".into()));
    }
    let id: Hash32 = identity
        .parse()
        .map_err(|e| malformed(format!("entry '{name}': {e}")))?;
    if let Some(prev) = out.insert(name.to_string(), id) {
        if prev != id {
            return Err(malformed(format!("entry '{name}' listed twice with different identities")));
        }
    }
    Ok(())
}

fn normalize_entries(entries: &[RawEntry], source_name: &str) -> Result<CodehashMap> {
    let mut out = CodehashMap::new();
    for (i, entry) in entries.iter().enumerate() {
        let (Some(name), Some(id)) = (entry.name(), entry.identity()) else {
            return Err(ManifoldError::MalformedSnapshot {
                source_name: source_name.to_string(),
                reason: format!("entry {i} lacks a name or codehash field"),
            });
        };
        insert_entry(&mut out, source_name, name, id)?;
    }
    Ok(out)
}

/// Decode any accepted snapshot shape into the canonical map.
pub fn normalize(value: &serde_json::Value, source_name: &str) -> Result<CodehashMap> {
    let shape: SnapshotShape = serde_json::from_value(value.clone()).map_err(|_| {
        ManifoldError::UnrecognizedSnapshotShape {
            source_name: source_name.to_string(),
            shape: describe_shape(value),
        }
    })?;

    let (label, map) = match shape {
        SnapshotShape::Artifact(a) => ("artifact", normalize_entries(&a.codehashes, source_name)?),
        SnapshotShape::Entries(e) => ("entries", normalize_entries(&e, source_name)?),
        SnapshotShape::Map(m) => {
            let mut out = CodehashMap::new();
            for (name, v) in &m {
                let id = match v {
                    MapValue::Hex(s) => Some(s.as_str()),
                    MapValue::Object(f) => f.codehash.as_deref().or(f.hash.as_deref()),
                };
                let id = id.ok_or_else(|| ManifoldError::MalformedSnapshot {
                    source_name: source_name.to_string(),
                    reason: format!("entry '{name}' has no codehash field"),
                })?;
                insert_entry(&mut out, source_name, name, id)?;
            }
            ("map", out)
        }
    };

    if map.is_empty() {
        return Err(ManifoldError::MalformedSnapshot {
            source_name: source_name.to_string(),
            reason: "snapshot contains no entries".into(),
        });
    }
    debug!(source = source_name, shape = label, entries = map.len(), "Normalized snapshot");
    Ok(map)
}

/// Read and normalize a snapshot file.
pub fn load_snapshot(path: &Path) -> Result<CodehashMap> {
    let source_name = path.display().to_string();
    let raw = std::fs::read_to_string(path)
        .map_err(|e| ManifoldError::io(format!("reading snapshot {source_name}"), e))?;
    let value: serde_json::Value =
        serde_json::from_str(&raw).map_err(|e| ManifoldError::MalformedSnapshot {
            source_name: source_name.clone(),
            reason: e.to_string(),
        })?;
    normalize(&value, &source_name)
}

// =============================================================================
// Snapshot files
// =============================================================================

/// Which flow produced a snapshot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotMode {
    Predictive,
    Observed,
}

impl SnapshotMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SnapshotMode::Predictive => "predictive",
            SnapshotMode::Observed => "observed",
        }
    }

    fn file_prefix(&self) -> String {
        format!("codehashes-{}-", self.as_str())
    }
}

impl std::fmt::Display for SnapshotMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Serialize, Deserialize)]
struct SnapshotEntry {
    name: String,
    codehash: CodeIdentity,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SnapshotFile {
    build_or_chain_id: String,
    mode: SnapshotMode,
    timestamp: u64,
    codehashes: Vec<SnapshotEntry>,
}

/// A codehash snapshot produced by one pipeline run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CodehashSnapshot {
    pub mode: SnapshotMode,
    pub build_or_chain_id: String,
    /// Milliseconds since the Unix epoch; also the file name suffix.
    pub timestamp: u64,
    pub entries: CodehashMap,
}

impl CodehashSnapshot {
    pub fn file_name(&self) -> String {
        format!("{}{}.json", self.mode.file_prefix(), self.timestamp)
    }

    fn to_json(&self) -> Result<String> {
        let file = SnapshotFile {
            build_or_chain_id: self.build_or_chain_id.clone(),
            mode: self.mode,
            timestamp: self.timestamp,
            codehashes: self
                .entries
                .iter()
                .map(|(name, codehash)| SnapshotEntry {
                    name: name.clone(),
                    codehash: *codehash,
                })
                .collect(),
        };
        serde_json::to_string_pretty(&file)
            .map_err(|e| ManifoldError::Io(format!("serializing snapshot: {e}")))
    }

    /// Write under `dir` without overwriting: on a name collision the timestamp is bumped
    /// until a free name is found. Returns the written path.
    ///
    /// Content is written to a temp file first and linked into place without clobbering, so
    /// a concurrent reader never selects a partially written snapshot.
    pub fn write_unique(&mut self, dir: &Path) -> Result<PathBuf> {
        const MAX_ATTEMPTS: u32 = 1_000;

        std::fs::create_dir_all(dir)
            .map_err(|e| ManifoldError::io(format!("creating {}", dir.display()), e))?;

        for _ in 0..MAX_ATTEMPTS {
            let path = dir.join(self.file_name());
            let mut tmp = tempfile::Builder::new()
                .prefix(TEMP_PREFIX)
                .tempfile_in(dir)
                .map_err(|e| {
                    ManifoldError::io(format!("creating temp file in {}", dir.display()), e)
                })?;
            tmp.write_all(self.to_json()?.as_bytes())
                .map_err(|e| ManifoldError::io(format!("writing {}", path.display()), e))?;

            match tmp.persist_noclobber(&path) {
                Ok(_) => {
                    info!(
                        mode = %self.mode,
                        path = %path.display(),
                        entries = self.entries.len(),
                        "Wrote codehash snapshot"
                    );
                    return Ok(path);
                }
                Err(e) if e.error.kind() == std::io::ErrorKind::AlreadyExists => {
                    self.timestamp += 1;
                }
                Err(e) => {
                    return Err(ManifoldError::io(format!("creating {}", path.display()), e.error));
                }
            }
        }
        Err(ManifoldError::Io(format!(
            "no free snapshot name in {} after {MAX_ATTEMPTS} attempts",
            dir.display()
        )))
    }
}

/// Largest run of ≥10 digits embedded in a file name.
fn embedded_timestamp(file_name: &str) -> Option<u128> {
    file_name
        .split(|c: char| !c.is_ascii_digit())
        .filter(|run| run.len() >= 10)
        .filter_map(|run| run.parse::<u128>().ok())
        .max()
}

/// Newest `codehashes-<mode>-*.json` under `dir`.
///
/// Files with an embedded timestamp win over files without one; ties and unstamped files fall
/// back to modification time.
pub fn latest_snapshot(dir: &Path, mode: SnapshotMode) -> Result<Option<PathBuf>> {
    let prefix = mode.file_prefix();
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(ManifoldError::io(format!("listing {}", dir.display()), e)),
    };

    let mut best: Option<((Option<u128>, SystemTime), PathBuf)> = None;
    for entry in entries {
        let entry = entry.map_err(|e| ManifoldError::io(format!("listing {}", dir.display()), e))?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if !name.starts_with(&prefix) || !name.ends_with(".json") {
            continue;
        }
        let mtime = entry
            .metadata()
            .and_then(|m| m.modified())
            .unwrap_or(SystemTime::UNIX_EPOCH);
        let key = (embedded_timestamp(&name), mtime);
        if best.as_ref().map_or(true, |(k, _)| key > *k) {
            best = Some((key, entry.path()));
        }
    }
    Ok(best.map(|(_, path)| path))
}

// =============================================================================
// Diff
// =============================================================================

/// One name whose identities differ between the two sides.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mismatch {
    pub name: String,
    pub a: CodeIdentity,
    pub b: CodeIdentity,
}

/// Result of comparing two codehash maps.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotDiff {
    /// Names present in `b` but not in `a`.
    pub missing_in_a: Vec<String>,
    /// Names present in `a` but not in `b`.
    pub missing_in_b: Vec<String>,
    pub mismatches: Vec<Mismatch>,
}

/// Compare two maps. Output lists are name-sorted.
pub fn diff(a: &CodehashMap, b: &CodehashMap) -> SnapshotDiff {
    let mut out = SnapshotDiff::default();
    for (name, id_a) in a {
        match b.get(name) {
            None => out.missing_in_b.push(name.clone()),
            Some(id_b) if id_b != id_a => out.mismatches.push(Mismatch {
                name: name.clone(),
                a: *id_a,
                b: *id_b,
            }),
            Some(_) => {}
        }
    }
    out.missing_in_a = b.keys().filter(|k| !a.contains_key(*k)).cloned().collect();
    out
}

impl SnapshotDiff {
    pub fn is_clean(&self) -> bool {
        self.missing_in_a.is_empty() && self.missing_in_b.is_empty() && self.mismatches.is_empty()
    }

    /// One-line summary used in errors and the final report line.
    pub fn summary(&self) -> String {
        format!(
            "{} missing in A, {} missing in B, {} mismatches",
            self.missing_in_a.len(),
            self.missing_in_b.len(),
            self.mismatches.len()
        )
    }

    /// Human-readable report showing at most `preview_limit` entries per list.
    pub fn render(&self, label_a: &str, label_b: &str, preview_limit: usize) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "A: {label_a}");
        let _ = writeln!(out, "B: {label_b}");

        let mut list = |title: &str, items: Vec<String>| {
            if items.is_empty() {
                return;
            }
            let _ = writeln!(out, "{title} ({}):", items.len());
            for item in items.iter().take(preview_limit) {
                let _ = writeln!(out, "  - {item}");
            }
            if items.len() > preview_limit {
                let _ = writeln!(out, "  ... and {} more", items.len() - preview_limit);
            }
        };
        list("Missing in A", self.missing_in_a.clone());
        list("Missing in B", self.missing_in_b.clone());
        list(
            "Mismatches",
            self.mismatches
                .iter()
                .map(|m| format!("{}: {} != {}", m.name, m.a, m.b))
                .collect(),
        );

        if self.is_clean() {
            let _ = writeln!(out, "Codehash parity: PASS");
        } else {
            let _ = writeln!(out, "Codehash parity: FAIL ({})", self.summary());
        }
        out
    }

    /// Machine-readable payload `{ok, missingInA, missingInB, mismatches}`.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "ok": self.is_clean(),
            "missingInA": self.missing_in_a,
            "missingInB": self.missing_in_b,
            "mismatches": self.mismatches,
        })
    }
}
