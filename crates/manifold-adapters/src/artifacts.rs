//! Compiler artifact reader.
//!
//! Scans a compiler output directory for `<Name><suffix>.json` files (debug `.dbg.json` files
//! are ignored), reading `deployedBytecode` and the ABI. Selectors are derived from canonical
//! function signatures with tuple parameters expanded.

use manifold_core::hash::selector_of;
use manifold_core::{ArtifactSource, BuildArtifact, ManifoldError, Result, Selector};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

#[derive(Deserialize)]
struct AbiParam {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    components: Vec<AbiParam>,
}

#[derive(Deserialize)]
struct AbiItem {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    inputs: Vec<AbiParam>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CompilerArtifact {
    #[serde(default)]
    contract_name: Option<String>,
    #[serde(default)]
    abi: Option<Vec<AbiItem>>,
    #[serde(default)]
    deployed_bytecode: Option<DeployedBytecode>,
}

/// Hardhat emits a hex string; Foundry nests it under `object`.
#[derive(Deserialize)]
#[serde(untagged)]
enum DeployedBytecode {
    Hex(String),
    Object { object: String },
}

impl DeployedBytecode {
    fn hex(&self) -> &str {
        match self {
            DeployedBytecode::Hex(s) => s,
            DeployedBytecode::Object { object } => object,
        }
    }
}

fn canonical_type(param: &AbiParam) -> String {
    match param.kind.strip_prefix("tuple") {
        Some(suffix) => {
            let inner: Vec<String> = param.components.iter().map(canonical_type).collect();
            format!("({}){}", inner.join(","), suffix)
        }
        None => param.kind.clone(),
    }
}

fn canonical_signature(item: &AbiItem) -> String {
    let params: Vec<String> = item.inputs.iter().map(canonical_type).collect();
    format!("{}({})", item.name, params.join(","))
}

/// Reads facet artifacts from a compiler output tree.
pub struct CompilerArtifactSource {
    root: PathBuf,
    suffix: String,
}

impl CompilerArtifactSource {
    pub fn new(root: impl Into<PathBuf>, suffix: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            suffix: suffix.into(),
        }
    }

    fn matches(&self, file_name: &str) -> bool {
        if file_name.ends_with(".dbg.json") {
            return false;
        }
        file_name
            .strip_suffix(".json")
            .is_some_and(|stem| stem.len() > self.suffix.len() && stem.ends_with(&self.suffix))
    }

    fn scan(&self, dir: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
        let entries = std::fs::read_dir(dir).map_err(|e| {
            ManifoldError::Io(format!("listing {}: {}", dir.display(), e))
        })?;
        for entry in entries {
            let entry =
                entry.map_err(|e| ManifoldError::Io(format!("listing {}: {}", dir.display(), e)))?;
            let path = entry.path();
            if path.is_dir() {
                self.scan(&path, out)?;
            } else if self.matches(&entry.file_name().to_string_lossy()) {
                out.push(path);
            }
        }
        Ok(())
    }

    fn read_one(&self, path: &Path) -> Result<Option<BuildArtifact>> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| ManifoldError::Io(format!("reading {}: {}", path.display(), e)))?;
        let artifact: CompilerArtifact = serde_json::from_str(&raw).map_err(|e| {
            ManifoldError::MissingArtifact(format!("{}: unreadable artifact: {}", path.display(), e))
        })?;

        let name = match artifact.contract_name {
            Some(name) => name,
            None => path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default(),
        };

        let code_hex = artifact
            .deployed_bytecode
            .as_ref()
            .map(DeployedBytecode::hex)
            .unwrap_or("");
        let digits = code_hex.strip_prefix("0x").unwrap_or(code_hex);
        if digits.is_empty() {
            warn!(facet = %name, path = %path.display(), "Skipping facet with empty deployed bytecode");
            return Ok(None);
        }
        let runtime_code = hex::decode(digits).map_err(|e| {
            ManifoldError::InvalidHex(format!("{}: deployedBytecode: {}", path.display(), e))
        })?;

        let abi_selectors = artifact.abi.map(|items| {
            let mut selectors: Vec<Selector> = items
                .iter()
                .filter(|item| item.kind == "function")
                .map(|item| selector_of(&canonical_signature(item)))
                .collect();
            selectors.sort();
            selectors.dedup();
            selectors
        });

        Ok(Some(BuildArtifact {
            name,
            runtime_code,
            abi_selectors,
        }))
    }
}

impl ArtifactSource for CompilerArtifactSource {
    fn facet_artifacts(&self) -> Result<Vec<BuildArtifact>> {
        let mut paths = Vec::new();
        self.scan(&self.root, &mut paths)?;
        paths.sort();

        let mut by_name: BTreeMap<String, BuildArtifact> = BTreeMap::new();
        for path in paths {
            let Some(artifact) = self.read_one(&path)? else {
                continue;
            };
            debug!(facet = %artifact.name, bytes = artifact.runtime_code.len(), "Loaded artifact");
            if by_name.contains_key(&artifact.name) {
                return Err(ManifoldError::MalformedManifest(format!(
                    "facet {} found twice under {}",
                    artifact.name,
                    self.root.display()
                )));
            }
            by_name.insert(artifact.name.clone(), artifact);
        }

        if by_name.is_empty() {
            return Err(ManifoldError::MissingArtifact(format!(
                "no *{}.json artifacts under {}",
                self.suffix,
                self.root.display()
            )));
        }
        Ok(by_name.into_values().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn write(dir: &Path, rel: &str, value: serde_json::Value) {
        let path = dir.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, serde_json::to_vec(&value).unwrap()).unwrap();
    }

    #[test]
    fn tuple_parameters_are_expanded() {
        let item: AbiItem = serde_json::from_value(json!({
            "type": "function",
            "name": "submit",
            "inputs": [
                {"type": "tuple[]", "components": [{"type": "address"}, {"type": "uint256"}]},
                {"type": "bytes32"}
            ]
        }))
        .unwrap();
        assert_eq!(canonical_signature(&item), "submit((address,uint256)[],bytes32)");
    }

    #[test]
    fn scans_facets_and_derives_selectors() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "contracts/TokenFacet.sol/TokenFacet.json",
            json!({
                "contractName": "TokenFacet",
                "abi": [
                    {"type": "function", "name": "transfer", "inputs": [{"type": "address"}, {"type": "uint256"}]},
                    {"type": "event", "name": "Transfer", "inputs": []}
                ],
                "deployedBytecode": "0x6080"
            }),
        );
        write(dir.path(), "contracts/TokenFacet.sol/TokenFacet.dbg.json", json!({}));
        write(
            dir.path(),
            "contracts/Lib.sol/Lib.json",
            json!({"contractName": "Lib", "deployedBytecode": "0x60"}),
        );
        write(
            dir.path(),
            "contracts/IFacet.sol/IFacet.json",
            json!({"contractName": "IFacet", "abi": [], "deployedBytecode": "0x"}),
        );

        let artifacts = CompilerArtifactSource::new(dir.path(), "Facet")
            .facet_artifacts()
            .unwrap();

        assert_eq!(artifacts.len(), 1);
        assert_eq!(artifacts[0].name, "TokenFacet");
        assert_eq!(artifacts[0].runtime_code, vec![0x60, 0x80]);
        assert_eq!(
            artifacts[0].abi_selectors,
            Some(vec![selector_of("transfer(address,uint256)")])
        );
    }

    #[test]
    fn foundry_object_bytecode_is_accepted() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "out/PingFacet.json",
            json!({"deployedBytecode": {"object": "0x6001"}}),
        );
        let artifacts = CompilerArtifactSource::new(dir.path(), "Facet")
            .facet_artifacts()
            .unwrap();
        assert_eq!(artifacts[0].name, "PingFacet");
        assert_eq!(artifacts[0].abi_selectors, None);
    }

    #[test]
    fn empty_tree_is_missing_artifact() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            CompilerArtifactSource::new(dir.path(), "Facet").facet_artifacts(),
            Err(ManifoldError::MissingArtifact(_))
        ));
    }
}
