//! Ordered Merkle tree over route leaves.
//!
//! Leaves are `(selector, facet, code_identity)` sorted by selector. Leaf and node hashes use
//! distinct domain tags (`0x00` / `0x01`) so a leaf hash can never be replayed as an internal
//! node. Odd levels pair their last node with itself.
//!
//! Proofs carry one sibling per level plus a position bitfield: bit `i` is set when the running
//! node is the LEFT operand at level `i`.

use crate::hash::{leaf_hash, node_hash};
use crate::{Address, Hash32, ManifoldError, Result, Selector};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Upper bound on proof depth (positions are a `u64` bitfield).
pub const MAX_PROOF_DEPTH: usize = 64;

/// A route binding: selector → facet with its expected code identity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteLeaf {
    pub selector: Selector,
    pub facet: Address,
    pub code_identity: Hash32,
}

impl RouteLeaf {
    pub fn new(selector: Selector, facet: Address, code_identity: Hash32) -> Self {
        Self {
            selector,
            facet,
            code_identity,
        }
    }

    pub fn leaf_hash(&self) -> Hash32 {
        leaf_hash(&self.selector, &self.facet, &self.code_identity)
    }
}

/// Which operand the running node is at one level of a proof.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Position {
    Left,
    Right,
}

/// Inclusion proof for one selector.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Proof {
    pub selector: Selector,
    pub leaf_index: usize,
    /// Sibling hashes, leaf level first.
    pub siblings: Vec<Hash32>,
    /// Bit `i` set ⇔ running node is the left operand at level `i`.
    pub positions: u64,
}

impl Proof {
    pub fn position(&self, level: usize) -> Position {
        if level < MAX_PROOF_DEPTH && self.positions & (1u64 << level) != 0 {
            Position::Left
        } else {
            Position::Right
        }
    }

    pub fn depth(&self) -> usize {
        self.siblings.len()
    }
}

/// `⌈log2(leaf_count)⌉`, the number of siblings every proof must carry.
pub fn expected_depth(leaf_count: usize) -> usize {
    if leaf_count <= 1 {
        0
    } else {
        (usize::BITS - (leaf_count - 1).leading_zeros()) as usize
    }
}

/// Position bits a well-formed proof for `leaf_index` must carry.
pub fn positions_for_index(leaf_index: usize, depth: usize) -> u64 {
    let mut bits = 0u64;
    let mut index = leaf_index;
    for level in 0..depth.min(MAX_PROOF_DEPTH) {
        if index % 2 == 0 {
            bits |= 1u64 << level;
        }
        index /= 2;
    }
    bits
}

/// Replay a proof path from `leaf` towards the root.
pub fn fold_path(leaf: Hash32, siblings: &[Hash32], positions: u64) -> Hash32 {
    let mut current = leaf;
    for (level, sibling) in siblings.iter().enumerate() {
        let is_left = level < MAX_PROOF_DEPTH && positions & (1u64 << level) != 0;
        current = if is_left {
            node_hash(&current, sibling)
        } else {
            node_hash(sibling, &current)
        };
    }
    current
}

/// Reject proofs whose shape cannot belong to a tree of `leaf_count` leaves.
pub fn check_proof_shape(
    selector: Selector,
    sibling_count: usize,
    positions: u64,
    leaf_count: usize,
) -> Result<()> {
    let expected = expected_depth(leaf_count);
    if sibling_count != expected {
        return Err(ManifoldError::MalformedProof {
            selector,
            reason: format!("expected {expected} siblings for {leaf_count} leaves, got {sibling_count}"),
        });
    }
    if expected < MAX_PROOF_DEPTH && positions >> expected != 0 {
        return Err(ManifoldError::MalformedProof {
            selector,
            reason: format!("position bits set beyond depth {expected}"),
        });
    }
    Ok(())
}

/// Ordered, domain-separated Merkle tree.
#[derive(Clone, Debug)]
pub struct OrderedMerkleTree {
    /// Leaves sorted by selector.
    leaves: Vec<RouteLeaf>,

    /// levels[0] = leaf hashes, last level = [root].
    levels: Vec<Vec<Hash32>>,

    index: BTreeMap<Selector, usize>,

    root: Hash32,
}

impl OrderedMerkleTree {
    /// Build a tree from route leaves in any order.
    ///
    /// Identical leaves are deduplicated; two leaves sharing a selector with different
    /// facet or code identity reject the whole build.
    pub fn build(leaves: impl IntoIterator<Item = RouteLeaf>) -> Result<Self> {
        let mut leaves: Vec<RouteLeaf> = leaves.into_iter().collect();
        if leaves.is_empty() {
            return Err(ManifoldError::EmptyTree);
        }

        leaves.sort_by(|a, b| {
            a.selector
                .cmp(&b.selector)
                .then(a.facet.cmp(&b.facet))
                .then(a.code_identity.cmp(&b.code_identity))
        });
        leaves.dedup();
        for w in leaves.windows(2) {
            if w[0].selector == w[1].selector {
                return Err(ManifoldError::SelectorCollision {
                    selector: w[0].selector,
                    first: w[0].facet.to_hex(),
                    second: w[1].facet.to_hex(),
                });
            }
        }

        let mut levels = Vec::with_capacity(expected_depth(leaves.len()) + 1);
        let mut current: Vec<Hash32> = leaves.iter().map(RouteLeaf::leaf_hash).collect();

        while current.len() > 1 {
            let mut next = Vec::with_capacity(current.len().div_ceil(2));
            for pair in current.chunks(2) {
                let left = &pair[0];
                let right = pair.get(1).unwrap_or(left);
                next.push(node_hash(left, right));
            }
            levels.push(current);
            current = next;
        }

        let root = current[0];
        levels.push(current);

        let index = leaves
            .iter()
            .enumerate()
            .map(|(i, leaf)| (leaf.selector, i))
            .collect();

        Ok(Self {
            leaves,
            levels,
            index,
            root,
        })
    }

    pub fn root(&self) -> Hash32 {
        self.root
    }

    pub fn len(&self) -> usize {
        self.leaves.len()
    }

    pub fn is_empty(&self) -> bool {
        self.leaves.is_empty()
    }

    pub fn depth(&self) -> usize {
        self.levels.len() - 1
    }

    /// Leaves in canonical (selector-ascending) order.
    pub fn leaves(&self) -> &[RouteLeaf] {
        &self.leaves
    }

    pub fn levels(&self) -> &[Vec<Hash32>] {
        &self.levels
    }

    pub fn leaf(&self, selector: &Selector) -> Option<&RouteLeaf> {
        self.index.get(selector).map(|&i| &self.leaves[i])
    }

    /// Generate the inclusion proof for `selector`.
    ///
    /// Time: O(log n)
    pub fn prove_of(&self, selector: &Selector) -> Result<Proof> {
        let leaf_index = *self
            .index
            .get(selector)
            .ok_or(ManifoldError::UnknownSelector {
                selector: *selector,
            })?;

        let mut siblings = Vec::with_capacity(self.depth());
        let mut positions = 0u64;
        let mut current = leaf_index;

        for (level, nodes) in self.levels[..self.depth()].iter().enumerate() {
            let sibling_index = if current % 2 == 0 {
                current + 1
            } else {
                current - 1
            };
            // Odd count: the last node is its own sibling.
            let sibling = nodes.get(sibling_index).unwrap_or(&nodes[current]);
            siblings.push(*sibling);
            if current % 2 == 0 {
                positions |= 1u64 << level;
            }
            current /= 2;
        }

        Ok(Proof {
            selector: *selector,
            leaf_index,
            siblings,
            positions,
        })
    }

    /// Proofs for every leaf, in canonical order.
    pub fn proofs(&self) -> Result<Vec<Proof>> {
        self.leaves
            .iter()
            .map(|leaf| self.prove_of(&leaf.selector))
            .collect()
    }

    /// Replay `proof` from `leaf`; true iff the fold reaches `root`.
    ///
    /// Pure: depends only on its arguments.
    pub fn verify(leaf: &RouteLeaf, proof: &Proof, root: &Hash32) -> bool {
        if proof.selector != leaf.selector || proof.siblings.len() > MAX_PROOF_DEPTH {
            return false;
        }
        fold_path(leaf.leaf_hash(), &proof.siblings, proof.positions) == *root
    }

    /// Like `verify`, but also rejects proofs whose shape does not fit `leaf_count`.
    pub fn verify_checked(
        leaf: &RouteLeaf,
        proof: &Proof,
        root: &Hash32,
        leaf_count: usize,
    ) -> Result<()> {
        check_proof_shape(leaf.selector, proof.siblings.len(), proof.positions, leaf_count)?;
        if proof.leaf_index >= leaf_count {
            return Err(ManifoldError::MalformedProof {
                selector: leaf.selector,
                reason: format!("leaf index {} out of range", proof.leaf_index),
            });
        }
        if proof.positions != positions_for_index(proof.leaf_index, proof.siblings.len()) {
            return Err(ManifoldError::MalformedProof {
                selector: leaf.selector,
                reason: "position bits disagree with leaf index".into(),
            });
        }
        if !Self::verify(leaf, proof, root) {
            return Err(ManifoldError::ProofVerificationFailed {
                selector: leaf.selector,
            });
        }
        Ok(())
    }

    /// Verify every generated proof against this tree's root. Returns the number checked.
    pub fn self_check(&self) -> Result<usize> {
        for leaf in &self.leaves {
            let proof = self.prove_of(&leaf.selector)?;
            Self::verify_checked(leaf, &proof, &self.root, self.len()).map_err(|e| {
                ManifoldError::SelfCheckFailed(format!("selector {}: {e}", leaf.selector))
            })?;
        }
        Ok(self.leaves.len())
    }
}
