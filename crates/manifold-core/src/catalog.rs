//! Selector catalog ingestion.
//!
//! The catalog is produced upstream (by the facet splitter) and only consumed here. Two file
//! shapes are accepted:
//!
//! - the manifest file `{ version, facets: { <name>: { selectors: ["0x........", ...] } } }`
//! - a record list `[{ selector, facet, signature, mutability }]`
//!
//! # Security: Fail-Closed Behavior
//!
//! A selector claimed by two facets, a malformed selector, or a selector that does not match its
//! declared signature rejects the whole catalog.

use crate::hash::selector_of;
use crate::{ManifoldError, Result, Selector};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

/// Maximum entries echoed into a parity error message.
const PARITY_DETAIL_LIMIT: usize = 10;

/// Solidity state mutability of a catalogued function.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mutability {
    Pure,
    View,
    Nonpayable,
    Payable,
    #[default]
    #[serde(other)]
    Unknown,
}

impl Mutability {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "pure" => Mutability::Pure,
            "view" => Mutability::View,
            "nonpayable" => Mutability::Nonpayable,
            "payable" => Mutability::Payable,
            _ => Mutability::Unknown,
        }
    }
}

/// One catalogued function. Immutable once produced.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectorRecord {
    pub selector: Selector,
    pub facet_name: String,
    /// Canonical signature; empty when the source did not carry one.
    pub signature: String,
    pub mutability: Mutability,
}

impl SelectorRecord {
    fn check_signature(&self) -> Result<()> {
        if self.signature.is_empty() {
            return Ok(());
        }
        let derived = selector_of(&self.signature);
        if derived != self.selector {
            return Err(ManifoldError::SelectorSignatureMismatch {
                selector: self.selector,
                signature: self.signature.clone(),
                derived,
            });
        }
        Ok(())
    }
}

#[derive(Deserialize)]
struct ManifestFile {
    #[serde(default)]
    #[allow(dead_code)]
    version: Option<serde_json::Value>,
    facets: BTreeMap<String, ManifestFacet>,
}

#[derive(Deserialize)]
struct ManifestFacet {
    #[serde(default)]
    selectors: Vec<String>,
}

#[derive(Deserialize)]
struct RawRecord {
    selector: String,
    #[serde(alias = "facetName", alias = "facet_name")]
    facet: String,
    #[serde(default)]
    signature: Option<String>,
    #[serde(default, alias = "stateMutability")]
    mutability: Option<String>,
}

/// Strict manifest selector: `0x` followed by exactly 8 hex digits.
fn parse_manifest_selector(raw: &str, facet: &str) -> Result<Selector> {
    let digits = raw.strip_prefix("0x").ok_or_else(|| {
        ManifoldError::MalformedManifest(format!("facet {facet}: selector '{raw}' lacks 0x prefix"))
    })?;
    if digits.len() != 8 || !digits.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(ManifoldError::MalformedManifest(format!(
            "facet {facet}: selector '{raw}' is not 4 bytes of hex"
        )));
    }
    raw.parse()
}

/// Differences between catalogued selectors and selectors found in compiled output.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ParityReport {
    /// `(facet, selector)` present in compiled output but absent from the catalog.
    pub missing_in_manifest: Vec<(String, Selector)>,
    /// `(facet, selector)` present in the catalog but absent from compiled output.
    pub missing_in_build: Vec<(String, Selector)>,
}

impl ParityReport {
    pub fn is_clean(&self) -> bool {
        self.missing_in_manifest.is_empty() && self.missing_in_build.is_empty()
    }

    fn into_error(self) -> ManifoldError {
        let render = |items: &[(String, Selector)]| {
            items
                .iter()
                .take(PARITY_DETAIL_LIMIT)
                .map(|(f, s)| format!("{f}:{s}"))
                .collect::<Vec<_>>()
                .join(", ")
        };
        ManifoldError::SelectorParity {
            missing_in_manifest: self.missing_in_manifest.len(),
            missing_in_build: self.missing_in_build.len(),
            detail: format!(
                "not in manifest [{}]; not in build [{}]",
                render(&self.missing_in_manifest),
                render(&self.missing_in_build)
            ),
        }
    }
}

/// Canonical selector → record mapping.
#[derive(Clone, Debug, Default)]
pub struct SelectorCatalog {
    records: BTreeMap<Selector, SelectorRecord>,
}

impl SelectorCatalog {
    /// Build a catalog, rejecting collisions and signature mismatches.
    pub fn from_records(records: impl IntoIterator<Item = SelectorRecord>) -> Result<Self> {
        let mut out: BTreeMap<Selector, SelectorRecord> = BTreeMap::new();
        for record in records {
            record.check_signature()?;
            if let Some(existing) = out.get(&record.selector) {
                if existing.facet_name != record.facet_name {
                    return Err(ManifoldError::SelectorCollision {
                        selector: record.selector,
                        first: existing.facet_name.clone(),
                        second: record.facet_name,
                    });
                }
                continue;
            }
            out.insert(record.selector, record);
        }
        Ok(Self { records: out })
    }

    /// Parse the manifest file shape.
    pub fn from_manifest_json(raw: &str) -> Result<Self> {
        let file: ManifestFile = serde_json::from_str(raw)
            .map_err(|e| ManifoldError::MalformedManifest(e.to_string()))?;

        let mut records = Vec::new();
        for (facet, entry) in &file.facets {
            for raw_selector in &entry.selectors {
                records.push(SelectorRecord {
                    selector: parse_manifest_selector(raw_selector, facet)?,
                    facet_name: facet.clone(),
                    signature: String::new(),
                    mutability: Mutability::Unknown,
                });
            }
        }
        Self::from_records(records)
    }

    /// Parse a record list.
    pub fn from_record_list_json(raw: &str) -> Result<Self> {
        let raw_records: Vec<RawRecord> = serde_json::from_str(raw)
            .map_err(|e| ManifoldError::MalformedManifest(e.to_string()))?;

        let mut records = Vec::with_capacity(raw_records.len());
        for r in raw_records {
            records.push(SelectorRecord {
                selector: parse_manifest_selector(&r.selector, &r.facet)?,
                signature: r.signature.unwrap_or_default(),
                mutability: r
                    .mutability
                    .as_deref()
                    .map(Mutability::parse)
                    .unwrap_or_default(),
                facet_name: r.facet,
            });
        }
        Self::from_records(records)
    }

    /// Load either shape from disk: a JSON array is a record list, an object is a manifest.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| ManifoldError::io(format!("reading catalog {}", path.display()), e))?;
        if raw.trim_start().starts_with('[') {
            Self::from_record_list_json(&raw)
        } else {
            Self::from_manifest_json(&raw)
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, selector: &Selector) -> Option<&SelectorRecord> {
        self.records.get(selector)
    }

    /// Records in selector order.
    pub fn records(&self) -> impl Iterator<Item = &SelectorRecord> {
        self.records.values()
    }

    /// Facet name → selectors it owns.
    pub fn by_facet(&self) -> BTreeMap<String, BTreeSet<Selector>> {
        let mut out: BTreeMap<String, BTreeSet<Selector>> = BTreeMap::new();
        for record in self.records.values() {
            out.entry(record.facet_name.clone())
                .or_default()
                .insert(record.selector);
        }
        out
    }

    /// Compare against per-facet selector sets found in compiled output.
    pub fn parity(&self, compiled: &BTreeMap<String, BTreeSet<Selector>>) -> ParityReport {
        let mut report = ParityReport::default();
        let catalogued = self.by_facet();
        let empty = BTreeSet::new();

        for (facet, selectors) in compiled {
            let known = catalogued.get(facet).unwrap_or(&empty);
            for selector in selectors.difference(known) {
                report.missing_in_manifest.push((facet.clone(), *selector));
            }
        }
        for (facet, selectors) in &catalogued {
            let built = compiled.get(facet).unwrap_or(&empty);
            for selector in selectors.difference(built) {
                report.missing_in_build.push((facet.clone(), *selector));
            }
        }
        report
    }

    /// Like `parity`, failing with `SelectorParity` on any difference.
    pub fn check_parity(&self, compiled: &BTreeMap<String, BTreeSet<Selector>>) -> Result<()> {
        let report = self.parity(compiled);
        if report.is_clean() {
            Ok(())
        } else {
            Err(report.into_error())
        }
    }
}
