//! Maintenance-mode bypass log.
//!
//! Every check skipped under maintenance mode (unsafe registration, tolerated audit failure,
//! missing audit registry) is appended here. Records are hash-chained:
//! `record_hash = H(domain ‖ version ‖ seq ‖ at ‖ prev_record_hash ‖ kind bytes)`, so a
//! rewritten or dropped entry breaks every later hash.

use crate::hash::{keccak256, BYPASS_RECORD_DOMAIN_V1};
use crate::{Address, Hash32, ManifoldError, Result, Selector};
use serde::{Deserialize, Serialize};

const RECORD_VERSION: u32 = 1;

/// What was bypassed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BypassKind {
    /// Routes written without proof verification.
    UnsafeRegistration {
        facet: Address,
        selectors: Vec<Selector>,
    },
    /// Registry answered "not approved"; activation proceeded.
    AuditNotApproved { root: Hash32 },
    /// Registry call failed; activation proceeded.
    AuditRegistryError { root: Hash32, error: String },
    /// No registry configured; activation proceeded.
    MissingAuditRegistry { root: Hash32 },
}

impl BypassKind {
    fn encode(&self, out: &mut Vec<u8>) {
        match self {
            BypassKind::UnsafeRegistration { facet, selectors } => {
                out.push(0x01);
                out.extend_from_slice(&facet.0);
                out.extend_from_slice(&(selectors.len() as u64).to_le_bytes());
                for s in selectors {
                    out.extend_from_slice(&s.0);
                }
            }
            BypassKind::AuditNotApproved { root } => {
                out.push(0x02);
                out.extend_from_slice(&root.0);
            }
            BypassKind::AuditRegistryError { root, error } => {
                out.push(0x03);
                out.extend_from_slice(&root.0);
                out.extend_from_slice(&(error.len() as u64).to_le_bytes());
                out.extend_from_slice(error.as_bytes());
            }
            BypassKind::MissingAuditRegistry { root } => {
                out.push(0x04);
                out.extend_from_slice(&root.0);
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BypassRecord {
    pub seq: u64,
    /// Ledger time of the bypass (seconds).
    pub at: u64,
    pub prev_record_hash: Hash32,
    pub record_hash: Hash32,
    pub kind: BypassKind,
}

pub fn bypass_record_hash(prev_record_hash: &Hash32, seq: u64, at: u64, kind: &BypassKind) -> Hash32 {
    let mut bytes = Vec::with_capacity(128);
    bytes.extend_from_slice(BYPASS_RECORD_DOMAIN_V1);
    bytes.extend_from_slice(&RECORD_VERSION.to_le_bytes());
    bytes.extend_from_slice(&seq.to_le_bytes());
    bytes.extend_from_slice(&at.to_le_bytes());
    bytes.extend_from_slice(&prev_record_hash.0);
    kind.encode(&mut bytes);
    keccak256(&bytes)
}

/// Append-only, hash-chained list of bypass records. Genesis hash is zero.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BypassLog {
    records: Vec<BypassRecord>,
}

impl BypassLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn head(&self) -> Hash32 {
        self.records
            .last()
            .map(|r| r.record_hash)
            .unwrap_or(Hash32::ZERO)
    }

    pub fn records(&self) -> &[BypassRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn append(&mut self, at: u64, kind: BypassKind) -> &BypassRecord {
        let prev_record_hash = self.head();
        let seq = self.records.len() as u64;
        let record_hash = bypass_record_hash(&prev_record_hash, seq, at, &kind);
        self.records.push(BypassRecord {
            seq,
            at,
            prev_record_hash,
            record_hash,
            kind,
        });
        &self.records[self.records.len() - 1]
    }

    /// Recompute every hash and link.
    pub fn verify_chain(&self) -> Result<()> {
        let mut prev = Hash32::ZERO;
        for (i, r) in self.records.iter().enumerate() {
            if r.seq != i as u64 || r.prev_record_hash != prev {
                return Err(ManifoldError::SelfCheckFailed(format!(
                    "bypass log broken link at record {i}"
                )));
            }
            if bypass_record_hash(&prev, r.seq, r.at, &r.kind) != r.record_hash {
                return Err(ManifoldError::SelfCheckFailed(format!(
                    "bypass log hash mismatch at record {i}"
                )));
            }
            prev = r.record_hash;
        }
        Ok(())
    }
}
