//! Segment Commitment Builder
//!
//! Builds a deterministic BLAKE3 Merkle tree over the segments of a trip.
//! The root is the externally anchored commitment; recomputing it from the
//! same segment list is how audits detect tampering.
//!
//! # Construction
//! - Leaf: BLAKE3 over [`Segment::canonical_bytes`]
//! - Interior node: BLAKE3(left || right)
//! - Odd trailing node is promoted unchanged to the next level
//! - Leaves keep segment order; they are never sorted

use crate::error::{Classify, ErrorKind};
use crate::types::Segment;
use blake3::Hasher;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// Commitment builder errors
#[derive(Debug, Error)]
pub enum MerkleError {
    #[error("Empty leaf set: cannot build a commitment from zero segments")]
    EmptyLeaves,

    #[error("Invalid leaf index: {index} (tree has {count} leaves)")]
    InvalidLeafIndex { index: usize, count: usize },

    #[error("Proof verification failed: computed root {computed} != expected {expected}")]
    ProofVerificationFailed { computed: String, expected: String },

    #[error("Invalid proof: {0}")]
    InvalidProof(String),
}

impl Classify for MerkleError {
    fn kind(&self) -> ErrorKind {
        match self {
            MerkleError::EmptyLeaves => ErrorKind::InvariantViolation,
            MerkleError::InvalidLeafIndex { .. } | MerkleError::InvalidProof(_) => {
                ErrorKind::ValidationFailure
            }
            MerkleError::ProofVerificationFailed { .. } => ErrorKind::FraudDetected,
        }
    }
}

pub type Result<T> = std::result::Result<T, MerkleError>;

/// A 32-byte hash (BLAKE3)
pub type Hash = [u8; 32];

/// Inclusion proof for a single segment leaf
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MerkleProof {
    /// The leaf hash being proven
    pub leaf_hash: Hash,
    /// Index of the leaf in segment order
    pub leaf_index: usize,
    /// Sibling hashes along the path to root (bottom-up)
    pub sibling_hashes: Vec<Hash>,
    /// Direction bits: true = sibling is on right, false = sibling is on left
    pub direction_bits: Vec<bool>,
    /// The expected root hash
    pub root_hash: Hash,
}

/// Merkle tree over a trip's segments
#[derive(Debug, Clone)]
pub struct CommitmentTree {
    /// All nodes level by level; level 0 holds the leaves
    levels: Vec<Vec<Hash>>,
    root: Hash,
}

impl CommitmentTree {
    /// Build a tree from segments in their time order
    pub fn from_segments(segments: &[Segment]) -> Result<Self> {
        let leaves = segments.iter().map(leaf_hash).collect();
        Self::build(leaves)
    }

    /// Build a tree from precomputed leaf hashes, preserving their order
    pub fn build(leaves: Vec<Hash>) -> Result<Self> {
        if leaves.is_empty() {
            return Err(MerkleError::EmptyLeaves);
        }

        let mut levels = vec![leaves];

        while levels[levels.len() - 1].len() > 1 {
            let next_level: Vec<Hash> = levels[levels.len() - 1]
                .chunks(2)
                .map(|chunk| match chunk {
                    [left, right] => hash_pair(left, right),
                    // Odd node out - promote it unchanged
                    [single] => *single,
                    _ => unreachable!("chunks(2) yields one or two nodes"),
                })
                .collect();
            levels.push(next_level);
        }

        let root = levels[levels.len() - 1][0];

        debug!(
            leaf_count = levels[0].len(),
            depth = levels.len(),
            root = %hex::encode(root),
            "Commitment tree built"
        );

        Ok(Self { levels, root })
    }

    pub fn root(&self) -> Hash {
        self.root
    }

    pub fn root_hex(&self) -> String {
        hex::encode(self.root)
    }

    pub fn leaf_count(&self) -> usize {
        self.levels[0].len()
    }

    /// Generate an inclusion proof for the segment at `leaf_index`
    pub fn generate_proof(&self, leaf_index: usize) -> Result<MerkleProof> {
        let leaves = &self.levels[0];
        if leaf_index >= leaves.len() {
            return Err(MerkleError::InvalidLeafIndex {
                index: leaf_index,
                count: leaves.len(),
            });
        }

        let mut sibling_hashes = Vec::new();
        let mut direction_bits = Vec::new();
        let mut current_index = leaf_index;

        for level_nodes in &self.levels[..self.levels.len() - 1] {
            let is_right_child = current_index % 2 == 1;
            let sibling_index = if is_right_child {
                Some(current_index - 1)
            } else if current_index + 1 < level_nodes.len() {
                Some(current_index + 1)
            } else {
                // Promoted node has no sibling at this level
                None
            };

            if let Some(sibling_index) = sibling_index {
                sibling_hashes.push(level_nodes[sibling_index]);
                direction_bits.push(!is_right_child);
            }

            current_index /= 2;
        }

        Ok(MerkleProof {
            leaf_hash: leaves[leaf_index],
            leaf_index,
            sibling_hashes,
            direction_bits,
            root_hash: self.root,
        })
    }

    /// Verify an inclusion proof against its embedded root
    pub fn verify_proof(proof: &MerkleProof) -> Result<bool> {
        if proof.sibling_hashes.len() != proof.direction_bits.len() {
            return Err(MerkleError::InvalidProof(
                "Sibling hashes and direction bits length mismatch".to_string(),
            ));
        }

        let computed = proof
            .sibling_hashes
            .iter()
            .zip(proof.direction_bits.iter())
            .fold(proof.leaf_hash, |current, (sibling, &sibling_on_right)| {
                if sibling_on_right {
                    hash_pair(&current, sibling)
                } else {
                    hash_pair(sibling, &current)
                }
            });

        if computed == proof.root_hash {
            Ok(true)
        } else {
            Err(MerkleError::ProofVerificationFailed {
                computed: hex::encode(computed),
                expected: hex::encode(proof.root_hash),
            })
        }
    }
}

/// Compute the commitment root for a time-ordered segment list
pub fn commit(segments: &[Segment]) -> Result<Hash> {
    CommitmentTree::from_segments(segments).map(|tree| tree.root())
}

/// Leaf hash of a single segment
pub fn leaf_hash(segment: &Segment) -> Hash {
    *blake3::hash(&segment.canonical_bytes()).as_bytes()
}

fn hash_pair(left: &Hash, right: &Hash) -> Hash {
    let mut hasher = Hasher::new();
    hasher.update(left);
    hasher.update(right);
    *hasher.finalize().as_bytes()
}
