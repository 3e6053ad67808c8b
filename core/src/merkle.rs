//! Settlement Merkle tree.
//!
//! Leaf bytes are the packed encoding the claim contract rebuilds:
//!
//!   wallet (20 bytes) ‖ uint256 period timestamp ‖ uint256 amount
//!
//! hashed with Keccak-256. Leaves are sorted by hash before building, so the
//! root depends only on the leaf set. Interior nodes hash the sorted pair,
//! which lets a proof be a bare list of siblings. An unpaired node at the end
//! of a layer is promoted unchanged, and contributes no proof entry.

use sha3::{Digest, Keccak256};

pub type Hash32 = [u8; 32];

pub const ADDRESS_LEN: usize = 20;
pub const LEAF_LEN: usize = ADDRESS_LEN + 32 + 32;

pub fn keccak256(data: &[u8]) -> Hash32 {
    let mut hasher = Keccak256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Commutative node hash: keccak256(min ‖ max).
pub fn hash_pair(a: &Hash32, b: &Hash32) -> Hash32 {
    let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
    let mut data = [0u8; 64];
    data[..32].copy_from_slice(lo);
    data[32..].copy_from_slice(hi);
    keccak256(&data)
}

/// Parse a `0x`-prefixed 20-byte wallet address, any case.
pub fn parse_address(wallet: &str) -> Result<[u8; ADDRESS_LEN], String> {
    let lowered = wallet.trim().to_ascii_lowercase();
    let digits = lowered
        .strip_prefix("0x")
        .ok_or_else(|| format!("wallet '{wallet}' lacks 0x prefix"))?;
    let bytes = hex::decode(digits).map_err(|e| format!("wallet '{wallet}': {e}"))?;
    bytes
        .try_into()
        .map_err(|b: Vec<u8>| format!("wallet '{wallet}' is {} bytes, expected 20", b.len()))
}

fn uint256(value: u128) -> [u8; 32] {
    let mut out = [0u8; 32];
    out[16..].copy_from_slice(&value.to_be_bytes());
    out
}

/// Convert a cent-precise amount to the token's smallest unit.
pub fn amount_to_units(amount: f64, token_decimals: u32) -> Result<u128, String> {
    if !amount.is_finite() || amount < 0.0 {
        return Err(format!("amount {amount} cannot be encoded"));
    }
    if token_decimals < 2 {
        return Err(format!("token_decimals {token_decimals} is below cent precision"));
    }
    let cents = (amount * 100.0).round() as u128;
    10u128
        .checked_pow(token_decimals - 2)
        .and_then(|scale| cents.checked_mul(scale))
        .ok_or_else(|| format!("amount {amount} overflows at {token_decimals} decimals"))
}

pub fn encode_leaf(address: &[u8; ADDRESS_LEN], period_ts: i64, amount_units: u128) -> Result<[u8; LEAF_LEN], String> {
    let ts = u128::try_from(period_ts).map_err(|_| format!("period timestamp {period_ts} is negative"))?;
    let mut out = [0u8; LEAF_LEN];
    out[..ADDRESS_LEN].copy_from_slice(address);
    out[ADDRESS_LEN..ADDRESS_LEN + 32].copy_from_slice(&uint256(ts));
    out[ADDRESS_LEN + 32..].copy_from_slice(&uint256(amount_units));
    Ok(out)
}

pub fn leaf_hash(address: &[u8; ADDRESS_LEN], period_ts: i64, amount_units: u128) -> Result<Hash32, String> {
    Ok(keccak256(&encode_leaf(address, period_ts, amount_units)?))
}

pub fn to_hex(hash: &Hash32) -> String {
    format!("0x{}", hex::encode(hash))
}

pub fn from_hex(s: &str) -> Result<Hash32, String> {
    let digits = s.strip_prefix("0x").unwrap_or(s);
    let bytes = hex::decode(digits).map_err(|e| format!("hash '{s}': {e}"))?;
    bytes
        .try_into()
        .map_err(|b: Vec<u8>| format!("hash '{s}' is {} bytes, expected 32", b.len()))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MerkleTree {
    /// layers[0] is the sorted leaf layer; the last layer holds the root.
    layers: Vec<Vec<Hash32>>,
}

impl MerkleTree {
    /// Build from leaf hashes in any order. Returns None for an empty set.
    pub fn build(mut leaves: Vec<Hash32>) -> Option<Self> {
        if leaves.is_empty() {
            return None;
        }
        leaves.sort_unstable();

        let mut layers = vec![leaves];
        while layers[layers.len() - 1].len() > 1 {
            let current = &layers[layers.len() - 1];
            let next: Vec<Hash32> = current
                .chunks(2)
                .map(|pair| match pair {
                    [a, b] => hash_pair(a, b),
                    [single] => *single,
                    _ => unreachable!("chunks(2) yields one or two items"),
                })
                .collect();
            layers.push(next);
        }
        Some(Self { layers })
    }

    pub fn root(&self) -> Hash32 {
        self.layers[self.layers.len() - 1][0]
    }

    /// Leaves in canonical (sorted) order.
    pub fn leaves(&self) -> &[Hash32] {
        &self.layers[0]
    }

    /// Sibling path for the leaf at `index` of the sorted leaf layer.
    pub fn proof(&self, mut index: usize) -> Option<Vec<Hash32>> {
        if index >= self.layers[0].len() {
            return None;
        }
        let mut proof = Vec::with_capacity(self.layers.len());
        for layer in &self.layers[..self.layers.len() - 1] {
            let sibling = index ^ 1;
            if sibling < layer.len() {
                proof.push(layer[sibling]);
            }
            index /= 2;
        }
        Some(proof)
    }

    pub fn proof_for(&self, leaf: &Hash32) -> Option<Vec<Hash32>> {
        let index = self.layers[0].binary_search(leaf).ok()?;
        self.proof(index)
    }
}

/// Fold a proof from `leaf` and compare with `root`.
pub fn verify_proof(leaf: &Hash32, proof: &[Hash32], root: &Hash32) -> bool {
    let computed = proof
        .iter()
        .fold(*leaf, |acc, sibling| hash_pair(&acc, sibling));
    &computed == root
}
