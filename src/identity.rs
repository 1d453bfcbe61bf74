//! # Identity and the Two-Stage Puzzle
//!
//! - [`Keypair`]: Ed25519 signing keypair
//! - [`PeerId`]: 32-byte id derived from the public key, the coordinate in XOR space
//! - [`PuzzleParams`]: the static and dynamic difficulties a network agrees on
//! - [`Identity`]: keypair + id + dynamic nonce, owned by the local node
//! - [`PublicIdentity`]: what a node presents to peers; enough to verify, no secrets
//!
//! ## Puzzle (S/Kademlia)
//!
//! ```text
//! id      = BLAKE3("skadnode-id-v1:"      || public_key)
//! static  = BLAKE3("skadnode-static-v1:"  || id)           >= static_difficulty leading zeros
//! dynamic = BLAKE3("skadnode-dynamic-v1:" || id || nonce)  >= dynamic_difficulty leading zeros
//! ```
//!
//! The static stage gates identity creation: keypairs are sampled until their
//! id passes, so an attacker pays for every id they mint. The dynamic stage is
//! a nonce search over a fixed id that peers re-check with a single hash.
//!
//! ## Invariants
//!
//! - `PeerId::from_bytes(b).as_bytes() == b`
//! - XOR distance is symmetric and zero only for equal ids
//! - Verification uses only public material and the two difficulties

use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use rand::RngCore;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};

use crate::crypto::{ID_HASH_DOMAIN, domain_hash, dynamic_puzzle_holds, static_puzzle_holds};
use crate::error::IdentityError;

// ============================================================================
// Puzzle Parameters
// ============================================================================

/// Default static difficulty (~65k keypairs on average).
pub const DEFAULT_STATIC_DIFFICULTY: u32 = 16;

/// Default dynamic difficulty (~65k hashes on average).
pub const DEFAULT_DYNAMIC_DIFFICULTY: u32 = 16;

/// A hash only has 256 bits to be zero.
pub const MAX_DIFFICULTY: u32 = 256;

/// Keypair samples before the static search gives up.
const MAX_KEYPAIR_ATTEMPTS: u64 = 1 << 36;

/// Nonces tried before the dynamic search gives up.
const MAX_NONCE_ATTEMPTS: u64 = 1 << 40;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PuzzleParams {
    pub static_difficulty: u32,
    pub dynamic_difficulty: u32,
}

impl PuzzleParams {
    pub fn new(static_difficulty: u32, dynamic_difficulty: u32) -> Result<Self, IdentityError> {
        let params = Self {
            static_difficulty,
            dynamic_difficulty,
        };
        params.validate()?;
        Ok(params)
    }

    /// Both difficulties must be in `1..=MAX_DIFFICULTY`.
    pub fn validate(&self) -> Result<(), IdentityError> {
        let valid = |d: u32| (1..=MAX_DIFFICULTY).contains(&d);
        if valid(self.static_difficulty) && valid(self.dynamic_difficulty) {
            Ok(())
        } else {
            Err(IdentityError::InvalidDifficulty {
                static_difficulty: self.static_difficulty,
                dynamic_difficulty: self.dynamic_difficulty,
            })
        }
    }
}

impl Default for PuzzleParams {
    fn default() -> Self {
        Self {
            static_difficulty: DEFAULT_STATIC_DIFFICULTY,
            dynamic_difficulty: DEFAULT_DYNAMIC_DIFFICULTY,
        }
    }
}

// ============================================================================
// Keypair
// ============================================================================

#[derive(Clone)]
pub struct Keypair {
    signing_key: SigningKey,
}

impl Keypair {
    /// A fresh keypair with no puzzle attached.
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        Self { signing_key }
    }

    pub fn from_secret_key_bytes(bytes: &[u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(bytes);
        Self { signing_key }
    }

    pub fn secret_key_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }

    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    pub fn peer_id(&self) -> PeerId {
        derive_peer_id(&self.public_key_bytes())
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing_key.sign(message)
    }
}

impl std::fmt::Debug for Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keypair")
            .field("peer_id", &self.peer_id())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// PeerId
// ============================================================================

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PeerId([u8; 32]);

impl PeerId {
    #[inline]
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    #[inline]
    pub fn xor_distance(&self, other: &PeerId) -> [u8; 32] {
        let mut out = [0u8; 32];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        out
    }

    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }

    /// First 8 bytes as hex, for log lines.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..8])
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| hex::FromHexError::InvalidStringLength)?;
        Ok(Self(arr))
    }
}

impl std::fmt::Debug for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PeerId({})", &self.to_hex()[..16])
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl From<[u8; 32]> for PeerId {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for PeerId {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Compare two XOR distances as big-endian integers.
#[inline]
pub fn distance_cmp(a: &[u8; 32], b: &[u8; 32]) -> std::cmp::Ordering {
    a.cmp(b)
}

/// `BLAKE3(ID_HASH_DOMAIN || public_key)`.
#[inline]
pub fn derive_peer_id(public_key: &[u8; 32]) -> PeerId {
    PeerId(domain_hash(ID_HASH_DOMAIN, &[public_key]))
}

// ============================================================================
// Identity
// ============================================================================

/// The public half of an identity, exchanged during the handshake.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicIdentity {
    pub public_key: [u8; 32],
    pub id: PeerId,
    pub nonce: u64,
}

impl PublicIdentity {
    /// Cheap check: two hashes plus one id derivation.
    pub fn verify(&self, params: &PuzzleParams) -> bool {
        self.check(params).is_ok()
    }

    pub fn check(&self, params: &PuzzleParams) -> Result<(), IdentityError> {
        params.validate()?;
        VerifyingKey::from_bytes(&self.public_key).map_err(|_| IdentityError::InvalidKey)?;
        if derive_peer_id(&self.public_key) != self.id {
            return Err(IdentityError::VerificationFailed);
        }
        if !static_puzzle_holds(self.id.as_bytes(), params.static_difficulty) {
            return Err(IdentityError::VerificationFailed);
        }
        if !dynamic_puzzle_holds(self.id.as_bytes(), self.nonce, params.dynamic_difficulty) {
            return Err(IdentityError::VerificationFailed);
        }
        Ok(())
    }
}

/// `Verify(identity, staticDifficulty, dynamicDifficulty)`.
pub fn verify(identity: &PublicIdentity, static_difficulty: u32, dynamic_difficulty: u32) -> bool {
    identity.verify(&PuzzleParams {
        static_difficulty,
        dynamic_difficulty,
    })
}

#[derive(Clone)]
pub struct Identity {
    keypair: Keypair,
    id: PeerId,
    nonce: u64,
}

impl Identity {
    /// Solve both puzzle stages for a fresh keypair.
    ///
    /// CPU-bound and unbounded in wall-clock time for large difficulties;
    /// async callers should run it on a blocking thread.
    pub fn generate(params: PuzzleParams) -> Result<Self, IdentityError> {
        params.validate()?;

        let mut keypair = None;
        for _ in 0..MAX_KEYPAIR_ATTEMPTS {
            let candidate = Keypair::generate();
            if static_puzzle_holds(candidate.peer_id().as_bytes(), params.static_difficulty) {
                keypair = Some(candidate);
                break;
            }
        }
        let Some(keypair) = keypair else {
            return Err(IdentityError::PuzzleExhausted {
                attempts: MAX_KEYPAIR_ATTEMPTS,
                static_difficulty: params.static_difficulty,
                dynamic_difficulty: params.dynamic_difficulty,
            });
        };

        let id = keypair.peer_id();
        let nonce = solve_dynamic(&id, params)?;
        Ok(Self { keypair, id, nonce })
    }

    /// Rebuild an identity from a persisted keypair and nonce.
    pub fn from_parts(keypair: Keypair, nonce: u64, params: PuzzleParams) -> Result<Self, IdentityError> {
        let id = keypair.peer_id();
        let identity = Self { keypair, id, nonce };
        identity.public().check(&params)?;
        Ok(identity)
    }

    pub fn from_secret_key_bytes(
        secret: &[u8; 32],
        nonce: u64,
        params: PuzzleParams,
    ) -> Result<Self, IdentityError> {
        Self::from_parts(Keypair::from_secret_key_bytes(secret), nonce, params)
    }

    /// Take an existing keypair that already passes the static stage and
    /// solve only the dynamic stage for it.
    pub fn from_keypair(keypair: Keypair, params: PuzzleParams) -> Result<Self, IdentityError> {
        params.validate()?;
        let id = keypair.peer_id();
        if !static_puzzle_holds(id.as_bytes(), params.static_difficulty) {
            return Err(IdentityError::VerificationFailed);
        }
        let nonce = solve_dynamic(&id, params)?;
        Ok(Self { keypair, id, nonce })
    }

    pub fn id(&self) -> PeerId {
        self.id
    }

    pub fn nonce(&self) -> u64 {
        self.nonce
    }

    pub fn keypair(&self) -> &Keypair {
        &self.keypair
    }

    pub fn public(&self) -> PublicIdentity {
        PublicIdentity {
            public_key: self.keypair.public_key_bytes(),
            id: self.id,
            nonce: self.nonce,
        }
    }
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity")
            .field("id", &self.id)
            .field("nonce", &self.nonce)
            .finish_non_exhaustive()
    }
}

fn solve_dynamic(id: &PeerId, params: PuzzleParams) -> Result<u64, IdentityError> {
    // Random start so two nodes never walk the same nonce sequence.
    let start = OsRng.next_u64();
    for offset in 0..MAX_NONCE_ATTEMPTS {
        let nonce = start.wrapping_add(offset);
        if dynamic_puzzle_holds(id.as_bytes(), nonce, params.dynamic_difficulty) {
            return Ok(nonce);
        }
    }
    Err(IdentityError::PuzzleExhausted {
        attempts: MAX_NONCE_ATTEMPTS,
        static_difficulty: params.static_difficulty,
        dynamic_difficulty: params.dynamic_difficulty,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn easy() -> PuzzleParams {
        PuzzleParams::new(6, 6).unwrap()
    }

    #[test]
    fn generated_identity_verifies() {
        for (s, d) in [(1, 1), (4, 8), (8, 4), (8, 8)] {
            let params = PuzzleParams::new(s, d).unwrap();
            let identity = Identity::generate(params).unwrap();
            assert!(verify(&identity.public(), s, d), "s={s} d={d}");
        }
    }

    #[test]
    fn mutated_public_key_fails_verification() {
        let params = easy();
        let identity = Identity::generate(params).unwrap();
        let public = identity.public();

        for i in 0..32 {
            let mut tampered = public;
            tampered.public_key[i] ^= 0x01;
            assert!(!tampered.verify(&params), "byte {i} mutation passed");
        }
    }

    #[test]
    fn off_curve_public_key_is_invalid() {
        let params = PuzzleParams::new(1, 1).unwrap();
        // Roughly half of all 32-byte strings do not decompress to a point.
        let public_key = (0..256)
            .map(|_| rand::random::<[u8; 32]>())
            .find(|bytes| VerifyingKey::from_bytes(bytes).is_err())
            .expect("no off-curve key found");
        let public = PublicIdentity {
            public_key,
            id: derive_peer_id(&public_key),
            nonce: 0,
        };
        assert_eq!(public.check(&params), Err(IdentityError::InvalidKey));
    }

    #[test]
    fn mutated_id_or_nonce_fails_verification() {
        let params = PuzzleParams::new(8, 12).unwrap();
        let identity = Identity::generate(params).unwrap();

        let mut bad_id = identity.public();
        let mut bytes = *bad_id.id.as_bytes();
        bytes[31] ^= 0x80;
        bad_id.id = PeerId::from_bytes(bytes);
        assert!(!bad_id.verify(&params));

        // A shifted nonce passes a 12-bit check with probability 2^-12 per try;
        // require at least one of a handful to fail.
        let any_rejected = (1..8u64).any(|delta| {
            let mut bad_nonce = identity.public();
            bad_nonce.nonce = bad_nonce.nonce.wrapping_add(delta);
            !bad_nonce.verify(&params)
        });
        assert!(any_rejected);
    }

    #[test]
    fn non_positive_difficulty_rejected() {
        assert!(matches!(
            PuzzleParams::new(0, 8),
            Err(IdentityError::InvalidDifficulty { .. })
        ));
        assert!(matches!(
            PuzzleParams::new(8, 0),
            Err(IdentityError::InvalidDifficulty { .. })
        ));
        let bogus = PuzzleParams {
            static_difficulty: 0,
            dynamic_difficulty: 0,
        };
        assert!(Identity::generate(bogus).is_err());
        assert!(!verify(&Identity::generate(easy()).unwrap().public(), 0, 6));
    }

    #[test]
    fn verification_against_harder_params_fails() {
        let identity = Identity::generate(PuzzleParams::new(1, 1).unwrap()).unwrap();
        // 64 leading zero bits by accident is not going to happen.
        assert!(!verify(&identity.public(), 64, 64));
    }

    #[test]
    fn from_parts_round_trips_persisted_identity() {
        let params = easy();
        let identity = Identity::generate(params).unwrap();
        let secret = identity.keypair().secret_key_bytes();

        let restored =
            Identity::from_parts(Keypair::from_secret_key_bytes(&secret), identity.nonce(), params)
                .unwrap();
        assert_eq!(restored.id(), identity.id());
        assert_eq!(restored.public(), identity.public());
    }

    #[test]
    fn from_keypair_solves_dynamic_stage() {
        let params = easy();
        let identity = Identity::generate(params).unwrap();
        let resolved = Identity::from_keypair(identity.keypair().clone(), params).unwrap();
        assert_eq!(resolved.id(), identity.id());
        assert!(resolved.public().verify(&params));
    }

    #[test]
    fn peer_id_xor_distance() {
        let a = PeerId::from_bytes([0xFF; 32]);
        let b = PeerId::from_bytes([0x00; 32]);

        assert_eq!(a.xor_distance(&a), [0u8; 32]);
        assert_eq!(a.xor_distance(&b), b.xor_distance(&a));
        assert_eq!(a.xor_distance(&b), [0xFF; 32]);
    }

    #[test]
    fn distance_cmp_orders_big_endian() {
        let mut near = [0u8; 32];
        near[31] = 0xFF;
        let mut far = [0u8; 32];
        far[0] = 0x01;
        assert_eq!(distance_cmp(&near, &far), std::cmp::Ordering::Less);
        assert_eq!(distance_cmp(&far, &far), std::cmp::Ordering::Equal);
    }

    #[test]
    fn peer_id_hex_round_trip() {
        let id = Keypair::generate().peer_id();
        assert_eq!(PeerId::from_hex(&id.to_hex()).unwrap(), id);
        assert!(PeerId::from_hex("abcd").is_err());
        assert_eq!(id.short().len(), 16);
    }
}
