//! # Merkle Engine
//!
//! Deterministic Merkle trees over `(address, uint256)` or `(address)` leaves,
//! laid out exactly like OpenZeppelin's `StandardMerkleTree` so that roots and
//! proofs are accepted by `MerkleProof.verify` on-chain and reproducible by any
//! independent verifier.
//!
//! ## Encoding
//!
//! - leaf hash: `keccak256(keccak256(abi.encode(address[, amount])))`
//! - inner node: `keccak256(min(a, b) ++ max(a, b))` (sorted pair)
//! - leaf hashes are sorted ascending before the tree is laid out, so the root
//!   only depends on the *set* of leaves, never on input order.
//!
//! The tree is stored as a flat array of `2n - 1` nodes: node `i` has children
//! `2i + 1` and `2i + 2`, the root is node `0` and the sorted leaves fill the
//! tail of the array in reverse order.

use crate::error::{PipelineError, Result};
use ethers::abi::{encode, Token};
use ethers::types::{Address, H256, U256};
use ethers::utils::keccak256;
use std::collections::BTreeMap;

/// A tree leaf: an address plus an optional amount.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Leaf {
    pub address: Address,
    pub amount: Option<U256>,
}

impl Leaf {
    /// `(address, uint256)` leaf used by reward and allocation trees.
    pub fn with_amount(address: Address, amount: U256) -> Self {
        Self {
            address,
            amount: Some(amount),
        }
    }

    /// `(address)` leaf used by whitelist trees.
    pub fn membership(address: Address) -> Self {
        Self {
            address,
            amount: None,
        }
    }

    fn encoding(&self) -> LeafEncoding {
        match self.amount {
            Some(_) => LeafEncoding::AddressAmount,
            None => LeafEncoding::Address,
        }
    }

    /// Double keccak of the ABI-encoded leaf values.
    pub fn hash(&self) -> H256 {
        let mut tokens = vec![Token::Address(self.address)];
        if let Some(amount) = self.amount {
            tokens.push(Token::Uint(amount));
        }
        let inner = keccak256(encode(&tokens));
        H256::from(keccak256(inner))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeafEncoding {
    Address,
    AddressAmount,
}

/// Hash of two sibling nodes, order independent.
pub fn hash_pair(a: &H256, b: &H256) -> H256 {
    let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
    let mut buf = [0u8; 64];
    buf[..32].copy_from_slice(lo.as_bytes());
    buf[32..].copy_from_slice(hi.as_bytes());
    H256::from(keccak256(buf))
}

/// Folds `proof` over the leaf hash and compares the result with `root`.
pub fn verify(root: H256, leaf: &Leaf, proof: &[H256]) -> bool {
    process_proof(leaf.hash(), proof) == root
}

pub fn process_proof(leaf_hash: H256, proof: &[H256]) -> H256 {
    proof.iter().fold(leaf_hash, |acc, sibling| hash_pair(&acc, sibling))
}

#[derive(Debug, Clone)]
pub struct MerkleTree {
    nodes: Vec<H256>,
    encoding: LeafEncoding,
    // address -> (leaf, node index)
    leaves: BTreeMap<Address, (Leaf, usize)>,
}

impl MerkleTree {
    /// Builds the tree. Fails on an empty leaf set, on a repeated address and on
    /// leaves mixing the two encodings.
    pub fn build(leaves: impl IntoIterator<Item = Leaf>) -> Result<Self> {
        let mut by_address: BTreeMap<Address, Leaf> = BTreeMap::new();
        let mut encoding: Option<LeafEncoding> = None;

        for leaf in leaves {
            match encoding {
                None => encoding = Some(leaf.encoding()),
                Some(e) if e != leaf.encoding() => {
                    return Err(PipelineError::validation(
                        "merkle leaves mix (address) and (address, amount) encodings",
                    ));
                }
                Some(_) => {}
            }
            if by_address.insert(leaf.address, leaf).is_some() {
                return Err(PipelineError::validation(format!(
                    "duplicate merkle leaf for address {:?}",
                    leaf.address
                )));
            }
        }

        let encoding = encoding.ok_or(PipelineError::EmptyEligibleSet)?;

        let mut hashed: Vec<(H256, Leaf)> = by_address.into_values().map(|l| (l.hash(), l)).collect();
        hashed.sort_by(|a, b| a.0.cmp(&b.0));

        let n = hashed.len();
        let mut nodes = vec![H256::zero(); 2 * n - 1];
        let mut leaves = BTreeMap::new();

        for (i, (hash, leaf)) in hashed.into_iter().enumerate() {
            let index = nodes.len() - 1 - i;
            nodes[index] = hash;
            leaves.insert(leaf.address, (leaf, index));
        }

        for i in (0..nodes.len() - n).rev() {
            nodes[i] = hash_pair(&nodes[2 * i + 1], &nodes[2 * i + 2]);
        }

        Ok(Self {
            nodes,
            encoding,
            leaves,
        })
    }

    pub fn root(&self) -> H256 {
        self.nodes[0]
    }

    pub fn encoding(&self) -> LeafEncoding {
        self.encoding
    }

    pub fn len(&self) -> usize {
        self.leaves.len()
    }

    pub fn is_empty(&self) -> bool {
        self.leaves.is_empty()
    }

    pub fn leaf(&self, address: &Address) -> Option<Leaf> {
        self.leaves.get(address).map(|(leaf, _)| *leaf)
    }

    /// Sibling hashes from the leaf of `address` up to the root.
    pub fn proof(&self, address: &Address) -> Option<Vec<H256>> {
        let (_, mut index) = self.leaves.get(address)?;
        let mut proof = Vec::new();
        while index > 0 {
            let sibling = if index % 2 == 1 { index + 1 } else { index - 1 };
            proof.push(self.nodes[sibling]);
            index = (index - 1) / 2;
        }
        Some(proof)
    }

    /// Leaves with their proofs, ordered by address.
    pub fn entries(&self) -> impl Iterator<Item = (Leaf, Vec<H256>)> + '_ {
        self.leaves.keys().filter_map(move |address| {
            let leaf = self.leaf(address)?;
            let proof = self.proof(address)?;
            Some((leaf, proof))
        })
    }

    /// Re-verifies every leaf against the root.
    pub fn validate(&self) -> Result<()> {
        for (leaf, proof) in self.entries() {
            if !verify(self.root(), &leaf, &proof) {
                return Err(PipelineError::IntegrityMismatch(format!(
                    "proof for {:?} does not verify against root {:?}",
                    leaf.address,
                    self.root()
                )));
            }
        }
        Ok(())
    }
}
