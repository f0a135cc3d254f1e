//! Manifold core: verifiable selector manifests for modular on-chain deployments.
//!
//! A single entry point routes calls by 4-byte selector to independently deployed facets.
//! This crate builds and governs the manifest that makes that routing verifiable:
//!
//! - `merkle`: ordered, domain-separated Merkle tree over `(selector, facet, code identity)`.
//! - `codehash`: predictive/observed code identity, snapshot normalization and diffing.
//! - `governance`: commit → delay → audit gate → activation state machine with a one-way freeze.
//! - `pipeline`: predictive/observed reconciliation flows and the drift gate.
//!
//! All checks fail closed: any guard failure rejects the whole operation without partial writes.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

pub mod artifacts;
pub mod catalog;
pub mod codehash;
pub mod config;
pub mod governance;
pub mod hash;
pub mod maintenance;
pub mod merkle;
pub mod pipeline;

pub use config::ManifoldConfig;

// =============================================================================
// Primitives
// =============================================================================

fn parse_fixed_hex<const N: usize>(input: &str, what: &str) -> Result<[u8; N]> {
    let trimmed = input.trim();
    let digits = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);
    if digits.len() != N * 2 {
        return Err(ManifoldError::InvalidHex(format!(
            "{what} must be {} hex chars, got {} in '{input}'",
            N * 2,
            digits.len()
        )));
    }
    let bytes = hex::decode(digits)
        .map_err(|e| ManifoldError::InvalidHex(format!("{what} '{input}': {e}")))?;
    let mut out = [0u8; N];
    out.copy_from_slice(&bytes);
    Ok(out)
}

macro_rules! hex_newtype {
    ($name:ident, $len:expr, $what:expr) => {
        impl $name {
            pub const LEN: usize = $len;

            pub fn as_bytes(&self) -> &[u8; $len] {
                &self.0
            }

            pub fn is_zero(&self) -> bool {
                self.0.iter().all(|b| *b == 0)
            }

            /// Lower-case hex with `0x` prefix.
            pub fn to_hex(&self) -> String {
                format!("0x{}", hex::encode(self.0))
            }
        }

        impl FromStr for $name {
            type Err = ManifoldError;

            fn from_str(s: &str) -> Result<Self> {
                parse_fixed_hex::<$len>(s, $what).map(Self)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.to_hex())
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.to_hex())
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
                serializer.serialize_str(&self.to_hex())
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                s.parse().map_err(serde::de::Error::custom)
            }
        }
    };
}

/// 32-byte hash (roots, leaf/node hashes, code identities).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Hash32(pub [u8; 32]);

/// 4-byte function selector.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Selector(pub [u8; 4]);

/// 20-byte facet address.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Address(pub [u8; 20]);

hex_newtype!(Hash32, 32, "hash");
hex_newtype!(Selector, 4, "selector");
hex_newtype!(Address, 20, "address");

impl Hash32 {
    pub const ZERO: Hash32 = Hash32([0u8; 32]);
}

impl Address {
    pub const ZERO: Address = Address([0u8; 20]);
}

/// Code identity of a deployed unit (Keccak-256 of its runtime code).
pub type CodeIdentity = Hash32;

// =============================================================================
// Errors
// =============================================================================

/// Taxonomy bucket used for machine-readable failure payloads.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Invariant violation of the manifest protocol; the whole operation is rejected.
    Protocol,
    /// Malformed or missing input; needs operator action.
    Data,
    /// Built or observed state disagrees with what was expected; blocks activation.
    Integrity,
    /// Configuration, filesystem or network failure.
    Environment,
}

/// Unified error type for manifold operations.
#[derive(Debug, Error)]
pub enum ManifoldError {
    // Protocol errors
    #[error("Epoch out of order: expected {expected}, got {got}")]
    EpochOutOfOrder { expected: u64, got: u64 },

    #[error("Activation not ready: pending root activates at {ready_at}, now {now}")]
    ActivationNotReady { ready_at: u64, now: u64 },

    #[error("Audit not approved for root {root}: {reason}")]
    AuditNotApproved { root: Hash32, reason: String },

    #[error("Manifest governance is frozen")]
    FrozenContract,

    #[error("Routing is paused")]
    Paused,

    #[error("No pending root to activate")]
    NoPendingRoot,

    #[error("No active root; routes cannot be proven")]
    NoActiveRoot,

    #[error("Zero root cannot be committed")]
    ZeroRoot,

    #[error("Codehash mismatch for {selector} at {facet}: pinned {pinned}, deployed {deployed}")]
    CodehashMismatch {
        selector: Selector,
        facet: Address,
        pinned: Hash32,
        deployed: Hash32,
    },

    #[error("Proof verification failed for selector {selector}")]
    ProofVerificationFailed { selector: Selector },

    #[error("Malformed proof for selector {selector}: {reason}")]
    MalformedProof { selector: Selector, reason: String },

    #[error("Selector collision: {selector} claimed by {first} and {second}")]
    SelectorCollision {
        selector: Selector,
        first: String,
        second: String,
    },

    #[error("Cannot build a Merkle tree with no leaves")]
    EmptyTree,

    #[error("Selector {selector} is not in the tree")]
    UnknownSelector { selector: Selector },

    #[error("Batch length mismatch: {0}")]
    LengthMismatch(String),

    #[error("Unsafe registration requires maintenance mode")]
    DevRegistrarDisabled,

    #[error("Activation delay {requested}s exceeds maximum {max}s")]
    ActivationDelayOutOfRange { requested: u64, max: u64 },

    #[error("No code at address {address}")]
    NoCodeAtAddress { address: Address },

    // Data errors
    #[error("Invalid hex: {0}")]
    InvalidHex(String),

    #[error("Malformed manifest: {0}")]
    MalformedManifest(String),

    #[error("Malformed snapshot {source_name}: {reason}")]
    MalformedSnapshot { source_name: String, reason: String },

    #[error("Unrecognized snapshot shape in {source_name}: {shape}")]
    UnrecognizedSnapshotShape { source_name: String, shape: String },

    #[error("Missing {mode} snapshot in {dir}")]
    MissingSnapshot { mode: String, dir: String },

    #[error("Missing artifact: {0}")]
    MissingArtifact(String),

    // Integrity errors
    #[error("Root mismatch: expected {expected}, built {actual}")]
    RootMismatch { expected: Hash32, actual: Hash32 },

    #[error("Selector {selector} does not match signature '{signature}' (derived {derived})")]
    SelectorSignatureMismatch {
        selector: Selector,
        signature: String,
        derived: Selector,
    },

    #[error("Selector parity failed: {missing_in_manifest} missing from manifest, {missing_in_build} missing from build")]
    SelectorParity {
        missing_in_manifest: usize,
        missing_in_build: usize,
        detail: String,
    },

    #[error("No code identity for facet {facet}")]
    MissingFacetIdentity { facet: String },

    #[error("Self-check failed: {0}")]
    SelfCheckFailed(String),

    #[error("Checksum mismatch for {path}")]
    ChecksumMismatch { path: String },

    #[error("Checksum bundle rejected: {0}")]
    ChecksumBundle(String),

    #[error("Codehash drift detected: {summary}")]
    Drift { summary: String },

    // Environment errors
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Audit registry error: {0}")]
    AuditRegistry(String),
}

impl ManifoldError {
    pub fn class(&self) -> ErrorClass {
        use ManifoldError::*;
        match self {
            EpochOutOfOrder { .. }
            | ActivationNotReady { .. }
            | AuditNotApproved { .. }
            | FrozenContract
            | Paused
            | NoPendingRoot
            | NoActiveRoot
            | ZeroRoot
            | CodehashMismatch { .. }
            | ProofVerificationFailed { .. }
            | MalformedProof { .. }
            | SelectorCollision { .. }
            | EmptyTree
            | UnknownSelector { .. }
            | LengthMismatch(_)
            | DevRegistrarDisabled
            | ActivationDelayOutOfRange { .. }
            | NoCodeAtAddress { .. } => ErrorClass::Protocol,
            InvalidHex(_)
            | MalformedManifest(_)
            | MalformedSnapshot { .. }
            | UnrecognizedSnapshotShape { .. }
            | MissingSnapshot { .. }
            | MissingArtifact(_) => ErrorClass::Data,
            RootMismatch { .. }
            | SelectorSignatureMismatch { .. }
            | SelectorParity { .. }
            | MissingFacetIdentity { .. }
            | SelfCheckFailed(_)
            | ChecksumMismatch { .. }
            | ChecksumBundle(_)
            | Drift { .. } => ErrorClass::Integrity,
            ConfigError(_) | Io(_) | Network(_) | AuditRegistry(_) => ErrorClass::Environment,
        }
    }

    pub(crate) fn io(context: impl fmt::Display, err: std::io::Error) -> Self {
        ManifoldError::Io(format!("{context}: {err}"))
    }
}

pub type Result<T> = std::result::Result<T, ManifoldError>;

// =============================================================================
// Collaborators
// =============================================================================

/// Reads deployed runtime code.
pub trait CodeSource: Send + Sync {
    /// Preconditions:
    /// - `address` is a 20-byte account address.
    ///
    /// Postconditions:
    /// - Returns the runtime code currently deployed at `address` (possibly empty).
    /// - Network failures surface as `ManifoldError::Network`, never as empty code.
    fn code_at(&self, address: &Address) -> Result<Vec<u8>>;
}

/// Result of an audit registry query.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditStatus {
    pub approved: bool,
    /// Free-form reference to the audit report, if the registry exposes one.
    pub report: Option<String>,
}

/// External audit gate consulted before a pending root may activate.
pub trait AuditRegistry: Send + Sync {
    /// An `Err` is treated as "not approved" unless maintenance bypass is active.
    fn audit_status(&self, root: &Hash32) -> Result<AuditStatus>;
}

/// Authoritative ledger clock (seconds).
pub trait LedgerClock: Send + Sync {
    fn now(&self) -> u64;
}

/// Compiled facet build output consumed by the predictive flow.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BuildArtifact {
    pub name: String,
    pub runtime_code: Vec<u8>,
    /// Selectors exposed by the facet's ABI, when the artifact carries one.
    pub abi_selectors: Option<Vec<Selector>>,
}

/// Provides compiled facet artifacts.
pub trait ArtifactSource {
    /// Postconditions:
    /// - Facet names are unique.
    fn facet_artifacts(&self) -> Result<Vec<BuildArtifact>>;
}
