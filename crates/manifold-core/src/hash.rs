use crate::{Address, Hash32, Selector};
use sha2::Sha256;
use sha3::{Digest, Keccak256};

/// Compute Keccak-256 of a byte slice.
pub fn keccak256(data: &[u8]) -> Hash32 {
    let mut hasher = Keccak256::new();
    hasher.update(data);
    Hash32(hasher.finalize().into())
}

/// Compute SHA-256 of a byte slice (checksum bundles only).
pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

// =============================================================================
// Domain separation
// =============================================================================

/// Tag prefixed to every leaf preimage.
pub const LEAF_DOMAIN_TAG: u8 = 0x00;

/// Tag prefixed to every internal node preimage. Must differ from `LEAF_DOMAIN_TAG`.
pub const NODE_DOMAIN_TAG: u8 = 0x01;

/// Domain tag for maintenance bypass log records.
pub const BYPASS_RECORD_DOMAIN_V1: &[u8] = b"MANIFOLD_BYPASS_RECORD_V1";

/// `H(0x00 ‖ selector ‖ facet ‖ code_identity)`.
pub fn leaf_hash(selector: &Selector, facet: &Address, code_identity: &Hash32) -> Hash32 {
    let mut buf = [0u8; 1 + 4 + 20 + 32];
    buf[0] = LEAF_DOMAIN_TAG;
    buf[1..5].copy_from_slice(&selector.0);
    buf[5..25].copy_from_slice(&facet.0);
    buf[25..].copy_from_slice(&code_identity.0);
    keccak256(&buf)
}

/// `H(0x01 ‖ left ‖ right)`.
pub fn node_hash(left: &Hash32, right: &Hash32) -> Hash32 {
    let mut buf = [0u8; 1 + 32 + 32];
    buf[0] = NODE_DOMAIN_TAG;
    buf[1..33].copy_from_slice(&left.0);
    buf[33..].copy_from_slice(&right.0);
    keccak256(&buf)
}

/// Selector of a canonical function signature, e.g. `transfer(address,uint256)`.
pub fn selector_of(signature: &str) -> Selector {
    let digest = keccak256(signature.as_bytes());
    let mut out = [0u8; 4];
    out.copy_from_slice(&digest.0[..4]);
    Selector(out)
}
