// -*- mode: rust; -*-
//
// This file is part of cosig.
// See LICENSE for licensing information.

//! Schnorr multi-signature primitives.
//!
//! The collective-signing protocol composes plain Schnorr signatures whose
//! key and nonce commitment are sums over the signing set:
//!
//! - commitment: `R_agg = Σ R_i`
//! - key: `K_agg = Σ K_i`
//! - challenge: `c = H(R_agg ‖ K_agg ‖ m)`
//! - response: `s_i = r_i − c·x_i`, aggregated as `s_agg = Σ s_i`
//!
//! Verification of `(c, s)` against `K` recomputes `R' = s·G + c·K` and
//! checks `H(R' ‖ K ‖ m) == c`; the same routine verifies both individual
//! and collective signatures. [`verify_response`] checks a single backup's
//! share before aggregation, since one bad share poisons the sum.

use k256::{
    elliptic_curve::{
        group::Group,
        ops::Reduce,
        sec1::{FromEncodedPoint, ToEncodedPoint},
        Field, PrimeField,
    },
    AffinePoint, EncodedPoint, ProjectivePoint, Scalar, U256,
};
use rand_core::CryptoRngCore;
use sha2::{Digest, Sha256};
use zeroize::Zeroize;

/// Byte width of a canonical scalar encoding.
pub const SCALAR_SIZE: usize = 32;
/// Byte width of a compressed SEC1 point encoding.
pub const POINT_SIZE: usize = 33;
/// Byte width of a serialized signature (`c ‖ s`).
pub const SIGNATURE_SIZE: usize = 2 * SCALAR_SIZE;

/// Domain separator for the Fiat-Shamir hash.
const HASH_DOMAIN: &[u8] = b"CoSig_SchnorrSHA256";

fn decode_point(bytes: &[u8]) -> Option<ProjectivePoint> {
    if bytes.len() != POINT_SIZE {
        return None;
    }
    // A 33-byte encoding can only be a compressed non-identity point, and
    // secp256k1 has cofactor 1, so decoding doubles as the subgroup check.
    let encoded = EncodedPoint::from_bytes(bytes).ok()?;
    Option::<AffinePoint>::from(AffinePoint::from_encoded_point(&encoded))
        .map(ProjectivePoint::from)
}

fn encode_point(point: &ProjectivePoint) -> [u8; POINT_SIZE] {
    let encoded = point.to_affine().to_encoded_point(true);
    let mut bytes = [0u8; POINT_SIZE];
    bytes.copy_from_slice(encoded.as_bytes());
    bytes
}

fn decode_scalar(bytes: &[u8]) -> Option<Scalar> {
    if bytes.len() != SCALAR_SIZE {
        return None;
    }
    let mut repr = k256::FieldBytes::default();
    repr.copy_from_slice(bytes);
    Option::<Scalar>::from(Scalar::from_repr(repr))
}

fn random_nonzero_scalar(rng: &mut dyn CryptoRngCore) -> Scalar {
    loop {
        let candidate = Scalar::random(rng.as_rngcore());
        if !bool::from(candidate.is_zero()) {
            return candidate;
        }
    }
}

/// A participant's long-lived secret key. Zeroized on drop; never leaves
/// the local device through this crate.
#[derive(Clone)]
pub struct PrivKey(Scalar);

impl PrivKey {
    /// Generate a fresh random key.
    pub fn new(rng: &mut dyn CryptoRngCore) -> Self {
        PrivKey(random_nonzero_scalar(rng))
    }

    /// Decode a key from its canonical 32-byte encoding. Returns `None` for
    /// non-canonical encodings and for zero.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let scalar = decode_scalar(bytes)?;
        if bool::from(scalar.is_zero()) {
            return None;
        }
        Some(PrivKey(scalar))
    }

    /// The corresponding public key.
    pub fn pub_key(&self) -> PubKey {
        PubKey(ProjectivePoint::GENERATOR * self.0)
    }
}

impl Drop for PrivKey {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl std::fmt::Debug for PrivKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("PrivKey(..)")
    }
}

/// A participant's public key.
#[derive(Copy, Clone, Eq, PartialEq)]
pub struct PubKey(ProjectivePoint);

impl PubKey {
    /// Decode from a 33-byte compressed SEC1 encoding. Rejects off-curve
    /// and identity encodings.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        decode_point(bytes).map(PubKey)
    }

    /// The 33-byte compressed SEC1 encoding.
    pub fn to_bytes(&self) -> [u8; POINT_SIZE] {
        encode_point(&self.0)
    }
}

impl std::fmt::Debug for PubKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PubKey({:02x?})", self.to_bytes())
    }
}

/// An ephemeral commitment nonce `r`.
///
/// A secret must be used in exactly one aggregate: answering two distinct
/// challenges with the same nonce hands out the private key. The scalar is
/// zeroized on drop.
pub struct CommitSecret(Scalar);

impl CommitSecret {
    /// Sample a fresh nonce.
    pub fn new(rng: &mut dyn CryptoRngCore) -> Self {
        CommitSecret(random_nonzero_scalar(rng))
    }

    /// The public commitment `R = r·G`.
    pub fn commit_point(&self) -> CommitPoint {
        CommitPoint(ProjectivePoint::GENERATOR * self.0)
    }
}

impl Drop for CommitSecret {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl std::fmt::Debug for CommitSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("CommitSecret(..)")
    }
}

/// The group-element half of a Schnorr pre-signature, `R = r·G`.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct CommitPoint(ProjectivePoint);

impl CommitPoint {
    /// Decode from a 33-byte compressed SEC1 encoding.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        decode_point(bytes).map(CommitPoint)
    }

    /// The 33-byte compressed SEC1 encoding.
    pub fn to_bytes(&self) -> [u8; POINT_SIZE] {
        encode_point(&self.0)
    }
}

/// The Fiat-Shamir challenge scalar binding payload, aggregated commitment
/// and aggregated key.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct Challenge(Scalar);

impl Challenge {
    /// Decode from a canonical 32-byte encoding.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        decode_scalar(bytes).map(Challenge)
    }

    /// The canonical 32-byte encoding.
    pub fn to_bytes(&self) -> [u8; SCALAR_SIZE] {
        self.0.to_bytes().into()
    }
}

/// The scalar half of a Schnorr signature, `s = r − c·x`.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct Response(Scalar);

impl Response {
    /// Decode from a canonical 32-byte encoding.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        decode_scalar(bytes).map(Response)
    }

    /// The canonical 32-byte encoding.
    pub fn to_bytes(&self) -> [u8; SCALAR_SIZE] {
        self.0.to_bytes().into()
    }
}

/// A Schnorr signature, individual or collective: the pair `(c, s)`.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct Signature {
    challenge: Scalar,
    response: Scalar,
}

impl Signature {
    /// Decode from the 64-byte `c ‖ s` encoding.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != SIGNATURE_SIZE {
            return None;
        }
        Some(Signature {
            challenge: decode_scalar(&bytes[..SCALAR_SIZE])?,
            response: decode_scalar(&bytes[SCALAR_SIZE..])?,
        })
    }

    /// The 64-byte `c ‖ s` encoding.
    pub fn to_bytes(&self) -> [u8; SIGNATURE_SIZE] {
        let mut bytes = [0u8; SIGNATURE_SIZE];
        bytes[..SCALAR_SIZE].copy_from_slice(&self.challenge.to_bytes());
        bytes[SCALAR_SIZE..].copy_from_slice(&self.response.to_bytes());
        bytes
    }
}

fn hash_to_scalar(commit: &ProjectivePoint, key: &ProjectivePoint, message: &[u8]) -> Scalar {
    let digest: [u8; 32] = Sha256::new()
        .chain_update(HASH_DOMAIN)
        .chain_update(encode_point(commit))
        .chain_update(encode_point(key))
        .chain_update(message)
        .finalize()
        .into();
    <Scalar as Reduce<U256>>::reduce(U256::from_be_slice(&digest))
}

/// Compute the challenge `c = H(R_agg ‖ K_agg ‖ m)`.
pub fn build_challenge(commit: &CommitPoint, key: &PubKey, message: &[u8]) -> Challenge {
    Challenge(hash_to_scalar(&commit.0, &key.0, message))
}

/// Compute a response share `s = r − c·x`.
pub fn generate_response(secret: &CommitSecret, challenge: &Challenge, key: &PrivKey) -> Response {
    Response(secret.0 - challenge.0 * key.0)
}

/// Check a single backup's response share against its published commitment:
/// `s·G + c·K == R`.
pub fn verify_response(
    response: &Response,
    challenge: &Challenge,
    key: &PubKey,
    commit: &CommitPoint,
) -> bool {
    ProjectivePoint::GENERATOR * response.0 + key.0 * challenge.0 == commit.0
}

/// Produce a standard Schnorr signature over `message`.
pub fn sign(rng: &mut dyn CryptoRngCore, message: &[u8], key: &PrivKey, pub_key: &PubKey) -> Signature {
    let secret = CommitSecret::new(rng);
    let challenge = Challenge(hash_to_scalar(
        &secret.commit_point().0,
        &pub_key.0,
        message,
    ));
    let response = generate_response(&secret, &challenge, key);
    Signature {
        challenge: challenge.0,
        response: response.0,
    }
}

/// Verify a signature (individual or collective) over `message`.
pub fn verify(message: &[u8], signature: &Signature, key: &PubKey) -> bool {
    let commit = ProjectivePoint::GENERATOR * signature.response + key.0 * signature.challenge;
    if bool::from(commit.is_identity()) {
        return false;
    }
    hash_to_scalar(&commit, &key.0, message) == signature.challenge
}

fn sum_points(points: impl Iterator<Item = ProjectivePoint>) -> Option<ProjectivePoint> {
    let mut sum = ProjectivePoint::IDENTITY;
    let mut any = false;
    for point in points {
        sum += point;
        any = true;
    }
    if !any || bool::from(sum.is_identity()) {
        return None;
    }
    Some(sum)
}

/// Sum the public keys of the signing set. `None` on empty input or an
/// identity result.
pub fn aggregate_pub_keys(keys: &[PubKey]) -> Option<PubKey> {
    sum_points(keys.iter().map(|k| k.0)).map(PubKey)
}

/// Sum the commit points of the signing set. `None` on empty input or an
/// identity result.
pub fn aggregate_commits(commits: &[CommitPoint]) -> Option<CommitPoint> {
    sum_points(commits.iter().map(|c| c.0)).map(CommitPoint)
}

/// Sum the response shares of the signing set. `None` on empty input.
pub fn aggregate_responses(responses: &[Response]) -> Option<Response> {
    if responses.is_empty() {
        return None;
    }
    let sum = responses
        .iter()
        .fold(Scalar::ZERO, |acc, response| acc + response.0);
    Some(Response(sum))
}

/// Assemble the collective signature `(c, s_agg)`.
pub fn aggregate_sign(challenge: &Challenge, aggregated_response: &Response) -> Signature {
    Signature {
        challenge: challenge.0,
        response: aggregated_response.0,
    }
}
