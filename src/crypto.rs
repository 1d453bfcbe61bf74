//! # Cryptographic Primitives
//!
//! - **Puzzle hashing**: BLAKE3 with per-stage domain prefixes
//! - **Signatures**: domain-separated Ed25519 signing and verification
//!
//! Domain separation keeps a hash or signature computed for one purpose
//! (identity derivation, static puzzle, dynamic puzzle, handshake proof)
//! from ever being valid for another.

use ed25519_dalek::{Signature, VerifyingKey};

use crate::identity::Keypair;

// ============================================================================
// Domain Separation Prefixes
// ============================================================================

/// Prefix for deriving a peer id from a public key.
pub const ID_HASH_DOMAIN: &[u8] = b"skadnode-id-v1:";

/// Prefix for the static (identity admission) puzzle.
pub const STATIC_PUZZLE_DOMAIN: &[u8] = b"skadnode-static-v1:";

/// Prefix for the dynamic (nonce) puzzle.
pub const DYNAMIC_PUZZLE_DOMAIN: &[u8] = b"skadnode-dynamic-v1:";

/// Prefix for handshake challenge signatures.
pub const HANDSHAKE_SIGNATURE_DOMAIN: &[u8] = b"skadnode-handshake-v1:";

// ============================================================================
// Signature Errors
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureError {
    /// Signature has invalid length (expected 64 bytes for Ed25519).
    InvalidLength,
    /// Cryptographic verification failed.
    VerificationFailed,
    /// The public key is not a valid Ed25519 point.
    InvalidPublicKey,
}

impl std::fmt::Display for SignatureError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignatureError::InvalidLength => write!(f, "signature has invalid length"),
            SignatureError::VerificationFailed => write!(f, "signature verification failed"),
            SignatureError::InvalidPublicKey => write!(f, "invalid public key"),
        }
    }
}

impl std::error::Error for SignatureError {}

// ============================================================================
// Hashing
// ============================================================================

/// BLAKE3 over `domain || parts...`.
#[inline]
pub fn domain_hash(domain: &[u8], parts: &[&[u8]]) -> [u8; 32] {
    let mut hasher = blake3::Hasher::new();
    hasher.update(domain);
    for part in parts {
        hasher.update(part);
    }
    *hasher.finalize().as_bytes()
}

/// Count leading zero bits in a hash.
#[inline]
pub fn count_leading_zeros(hash: &[u8; 32]) -> u32 {
    let mut zeros = 0u32;
    for byte in hash {
        if *byte == 0 {
            zeros += 8;
        } else {
            zeros += byte.leading_zeros();
            break;
        }
    }
    zeros
}

/// Static puzzle: `BLAKE3(STATIC_PUZZLE_DOMAIN || id)` needs `difficulty` leading zeros.
#[inline]
pub fn static_puzzle_holds(id: &[u8; 32], difficulty: u32) -> bool {
    count_leading_zeros(&domain_hash(STATIC_PUZZLE_DOMAIN, &[id])) >= difficulty
}

/// Dynamic puzzle: `BLAKE3(DYNAMIC_PUZZLE_DOMAIN || id || nonce)` needs `difficulty` leading zeros.
#[inline]
pub fn dynamic_puzzle_holds(id: &[u8; 32], nonce: u64, difficulty: u32) -> bool {
    let hash = domain_hash(DYNAMIC_PUZZLE_DOMAIN, &[id, &nonce.to_le_bytes()]);
    count_leading_zeros(&hash) >= difficulty
}

// ============================================================================
// Domain-Separated Signature Helpers
// ============================================================================

/// Sign data with domain separation.
///
/// Prepends the domain prefix to the data before signing, so a signature
/// produced for one protocol step cannot be replayed in another.
pub fn sign_with_domain(keypair: &Keypair, domain: &[u8], data: &[u8]) -> Vec<u8> {
    let mut prefixed = Vec::with_capacity(domain.len() + data.len());
    prefixed.extend_from_slice(domain);
    prefixed.extend_from_slice(data);
    keypair.sign(&prefixed).to_bytes().to_vec()
}

/// Verify a domain-separated signature against a raw Ed25519 public key.
pub fn verify_with_domain(
    public_key: &[u8; 32],
    domain: &[u8],
    data: &[u8],
    signature: &[u8],
) -> Result<(), SignatureError> {
    let verifying_key =
        VerifyingKey::from_bytes(public_key).map_err(|_| SignatureError::InvalidPublicKey)?;

    let sig_bytes: [u8; 64] = signature
        .try_into()
        .map_err(|_| SignatureError::InvalidLength)?;
    let sig = Signature::from_bytes(&sig_bytes);

    let mut prefixed = Vec::with_capacity(domain.len() + data.len());
    prefixed.extend_from_slice(domain);
    prefixed.extend_from_slice(data);

    verifying_key
        .verify_strict(&prefixed, &sig)
        .map_err(|_| SignatureError::VerificationFailed)
}
