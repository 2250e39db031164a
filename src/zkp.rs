//! Zero-knowledge proofs, ballot masking, and tally recovery
//!
//! Two proofs drive the protocol:
//!
//! - A **Schnorr proof of key knowledge** bound to the prover's assigned
//!   user id. The challenge is `SHA3-256(be_bytes(user_id)) mod n` where
//!   the id is encoded as its minimal big-endian byte string (`0` encodes
//!   as the single byte `0x00`).
//! - A **1-out-of-2 Chaum–Pedersen proof** (CDS OR-composition) that a
//!   masked ballot `B = Y·x + G·v` commits to `v ∈ {0, 1}` without
//!   revealing which. It runs in three half-rounds: commitments, a
//!   verifier-chosen challenge, responses. The branch holding the real
//!   transcript depends on the vote; the emitted commitment/response pairs
//!   are swapped for `v = 0` so the verifier's equations are vote-agnostic.
//!
//! The module also owns the ballot mask `Y_i` and the small discrete-log
//! search that converts the aggregated ballots back into a yes-count.

use elliptic_curve::{bigint::U256, ops::Reduce, Field};
use rand_core::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};
use sha3::{Digest, Sha3_256};

use crate::{curve, Point, Scalar};

/// A single yes/no ballot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Vote {
    /// "no", committed as 0.
    No,
    /// "yes", committed as 1.
    Yes,
}

impl Vote {
    /// The committed group exponent: 0 or 1.
    pub fn as_scalar(self) -> Scalar {
        match self {
            Vote::No => Scalar::ZERO,
            Vote::Yes => Scalar::ONE,
        }
    }
}

// ============================================================================
// Schnorr proof of key knowledge
// ============================================================================

/// Schnorr transcript `(R, s)` proving knowledge of `x` with `PK = G·x`,
/// bound to the prover's user id. Wire field names follow the protocol.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchnorrProof {
    /// The commitment `R = G·k`.
    #[serde(with = "curve::point_pair")]
    pub signature: Point,
    /// The response `s = k − x·e mod n`.
    #[serde(with = "curve::scalar_dec")]
    pub exponent: Scalar,
}

/// Challenge scalar binding a proof to a participant identity.
fn identity_challenge(user_id: u32) -> Scalar {
    let digest = Sha3_256::digest(minimal_be_bytes(user_id));
    <Scalar as Reduce<U256>>::reduce_bytes(&digest)
}

/// Minimal big-endian encoding; zero is the single byte `0x00`.
fn minimal_be_bytes(value: u32) -> Vec<u8> {
    let bytes = value.to_be_bytes();
    let first = bytes.iter().position(|&b| b != 0).unwrap_or(3);
    bytes[first..].to_vec()
}

/// Prove knowledge of `secret`, binding the transcript to `user_id`.
pub fn schnorr_prove<R: RngCore + CryptoRng>(
    secret: &Scalar,
    user_id: u32,
    rng: &mut R,
) -> SchnorrProof {
    let k = curve::random_scalar(rng);
    let e = identity_challenge(user_id);
    SchnorrProof {
        signature: Point::GENERATOR * k,
        exponent: k - *secret * e,
    }
}

/// Verify a Schnorr transcript: accept iff `R == G·s + PK·e`.
pub fn schnorr_verify(user_id: u32, proof: &SchnorrProof, public_key: &Point) -> bool {
    let e = identity_challenge(user_id);
    proof.signature == Point::GENERATOR * proof.exponent + *public_key * e
}

// ============================================================================
// Ballot mask
// ============================================================================

/// The mask `Y_i = Σ_{j<i} PK_j − Σ_{j>i} PK_j` for the participant at
/// `index`. Either partial sum may be empty and degenerates to the
/// identity. Across all participants `Σ_i x_i·Y_i = 0`.
pub fn ballot_mask(public_keys: &[Point], index: usize) -> Point {
    let before = public_keys[..index]
        .iter()
        .fold(Point::IDENTITY, |acc, pk| acc + pk);
    let after = public_keys[index + 1..]
        .iter()
        .fold(Point::IDENTITY, |acc, pk| acc + pk);
    before - after
}

// ============================================================================
// 1-out-of-2 ballot-validity proof
// ============================================================================

/// First-phase commitments, also carrying the statement: `x` is the
/// prover's public key, `y` the masked ballot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct BallotCommitments {
    #[serde(with = "curve::point_pair")]
    pub x: Point,
    #[serde(with = "curve::point_pair")]
    pub y: Point,
    #[serde(with = "curve::point_pair")]
    pub a1: Point,
    #[serde(with = "curve::point_pair")]
    pub a2: Point,
    #[serde(with = "curve::point_pair")]
    pub b1: Point,
    #[serde(with = "curve::point_pair")]
    pub b2: Point,
}

/// Second-phase responses.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct BallotResponses {
    #[serde(with = "curve::scalar_dec")]
    pub d1: Scalar,
    #[serde(with = "curve::scalar_dec")]
    pub d2: Scalar,
    #[serde(with = "curve::scalar_dec")]
    pub r1: Scalar,
    #[serde(with = "curve::scalar_dec")]
    pub r2: Scalar,
}

/// Prover state persisted between the commitment and response half-rounds.
#[derive(Clone, Copy, Debug)]
pub struct BallotSecrets {
    w: Scalar,
    r: Scalar,
    d: Scalar,
    vote: Vote,
}

/// First half-round: compute the masked ballot `B = Y·x + G·v` and the
/// commitments. For `v = 0` the real and simulated transcript slots are
/// swapped before emission.
pub fn ballot_commit<R: RngCore + CryptoRng>(
    vote: Vote,
    secret: &Scalar,
    mask: &Point,
    rng: &mut R,
) -> (Point, BallotCommitments, BallotSecrets) {
    let g = Point::GENERATOR;
    let (w, r, d) = (
        curve::random_scalar(rng),
        curve::random_scalar(rng),
        curve::random_scalar(rng),
    );

    let x = g * secret;
    let y = *mask * secret + g * vote.as_scalar();
    let a1 = g * r + x * d;
    let a2 = g * w;
    let b1 = *mask * r + (y + g * (vote.as_scalar() - Scalar::ONE)) * d;
    let b2 = *mask * w;

    let commitments = match vote {
        Vote::Yes => BallotCommitments { x, y, a1, a2, b1, b2 },
        Vote::No => BallotCommitments {
            x,
            y,
            a1: a2,
            a2: a1,
            b1: b2,
            b2: b1,
        },
    };
    (y, commitments, BallotSecrets { w, r, d, vote })
}

/// Second half-round: close the real branch against the challenge and
/// emit the responses in the slot order matching the commitments.
pub fn ballot_respond(
    secrets: &BallotSecrets,
    secret_key: &Scalar,
    challenge: &Scalar,
) -> BallotResponses {
    let d2 = *challenge - secrets.d;
    let r2 = secrets.w - *secret_key * d2;
    match secrets.vote {
        Vote::Yes => BallotResponses {
            d1: secrets.d,
            d2,
            r1: secrets.r,
            r2,
        },
        Vote::No => BallotResponses {
            d1: d2,
            d2: secrets.d,
            r1: r2,
            r2: secrets.r,
        },
    }
}

/// Verify a complete ballot transcript against the mask `Y`. Accepts iff
/// the challenge splits as `c = d1 + d2` and all four commitment
/// equations hold; the `b2` equation checks the `v = 1` branch against
/// `y − G`.
pub fn ballot_verify(
    commitments: &BallotCommitments,
    challenge: &Scalar,
    responses: &BallotResponses,
    mask: &Point,
) -> bool {
    let g = Point::GENERATOR;
    if *challenge != responses.d1 + responses.d2 {
        return false;
    }
    if commitments.a1 != g * responses.r1 + commitments.x * responses.d1 {
        return false;
    }
    if commitments.b1 != *mask * responses.r1 + commitments.y * responses.d1 {
        return false;
    }
    if commitments.a2 != g * responses.r2 + commitments.x * responses.d2 {
        return false;
    }
    commitments.b2 == *mask * responses.r2 + (commitments.y - g) * responses.d2
}

// ============================================================================
// Tally recovery
// ============================================================================

/// Aggregate the ballots and search for the unique `t ∈ [0, N]` with
/// `G·t == Σ B_i`. `None` means no count matches — a ballot slipped past
/// verification, which cannot happen in a correct run.
pub fn recover_tally(ballots: &[Point]) -> Option<u32> {
    let total = ballots.iter().fold(Point::IDENTITY, |acc, b| acc + b);
    let mut candidate = Point::IDENTITY;
    for t in 0..=ballots.len() as u32 {
        if candidate == total {
            return Some(t);
        }
        candidate += Point::GENERATOR;
    }
    None
}

#[cfg(test)]
mod tests {
    use rand::rngs::OsRng;

    use super::*;
    use crate::curve::random_scalar;

    fn keypair() -> (Scalar, Point) {
        let secret = random_scalar(&mut OsRng);
        (secret, Point::GENERATOR * secret)
    }

    #[test]
    fn schnorr_accepts_honest_prover() {
        for user_id in [0u32, 1, 5, 1000] {
            let (secret, public_key) = keypair();
            let proof = schnorr_prove(&secret, user_id, &mut OsRng);
            assert!(schnorr_verify(user_id, &proof, &public_key));
        }
    }

    #[test]
    fn schnorr_rejects_tampering() {
        let (secret, public_key) = keypair();
        let proof = schnorr_prove(&secret, 3, &mut OsRng);
        // wrong identity binding
        assert!(!schnorr_verify(4, &proof, &public_key));
        // wrong key
        let (_, other_key) = keypair();
        assert!(!schnorr_verify(3, &proof, &other_key));
        // tampered response
        let tampered = SchnorrProof {
            signature: proof.signature,
            exponent: proof.exponent + Scalar::ONE,
        };
        assert!(!schnorr_verify(3, &tampered, &public_key));
    }

    #[test]
    fn minimal_encoding_of_zero_is_one_zero_byte() {
        assert_eq!(minimal_be_bytes(0), vec![0x00]);
        assert_eq!(minimal_be_bytes(5), vec![0x05]);
        assert_eq!(minimal_be_bytes(0x0102), vec![0x01, 0x02]);
    }

    #[test]
    fn masks_cancel_for_any_key_selection() {
        for n in [2usize, 3, 5] {
            let pairs: Vec<_> = (0..n).map(|_| keypair()).collect();
            let keys: Vec<Point> = pairs.iter().map(|(_, pk)| *pk).collect();
            let combined = pairs
                .iter()
                .enumerate()
                .fold(Point::IDENTITY, |acc, (i, (secret, _))| {
                    acc + ballot_mask(&keys, i) * secret
                });
            assert_eq!(combined, Point::IDENTITY);
        }
    }

    #[test]
    fn ballot_proof_completes_for_both_votes() {
        let (secret, _) = keypair();
        let mask = Point::GENERATOR * random_scalar(&mut OsRng);
        for vote in [Vote::No, Vote::Yes] {
            let (_, commitments, secrets) = ballot_commit(vote, &secret, &mask, &mut OsRng);
            let challenge = random_scalar(&mut OsRng);
            let responses = ballot_respond(&secrets, &secret, &challenge);
            assert!(ballot_verify(&commitments, &challenge, &responses, &mask));
        }
    }

    #[test]
    fn ballot_proof_rejects_out_of_range_vote() {
        // Run the v=1 branch construction with v=2: y = Y·x + G·2.
        let (secret, _) = keypair();
        let mask = Point::GENERATOR * random_scalar(&mut OsRng);
        let g = Point::GENERATOR;
        let (w, r, d) = (
            random_scalar(&mut OsRng),
            random_scalar(&mut OsRng),
            random_scalar(&mut OsRng),
        );
        let two = Scalar::ONE + Scalar::ONE;
        let x = g * secret;
        let y = mask * secret + g * two;
        let commitments = BallotCommitments {
            x,
            y,
            a1: g * r + x * d,
            a2: g * w,
            b1: mask * r + (y + g * (two - Scalar::ONE)) * d,
            b2: mask * w,
        };
        let challenge = random_scalar(&mut OsRng);
        let d2 = challenge - d;
        let responses = BallotResponses {
            d1: d,
            d2,
            r1: r,
            r2: w - secret * d2,
        };
        assert!(!ballot_verify(&commitments, &challenge, &responses, &mask));
    }

    #[test]
    fn ballot_proof_rejects_garbage_responses() {
        let (secret, _) = keypair();
        let mask = Point::GENERATOR * random_scalar(&mut OsRng);
        let (_, commitments, _) = ballot_commit(Vote::Yes, &secret, &mask, &mut OsRng);
        let challenge = random_scalar(&mut OsRng);
        let responses = BallotResponses {
            d1: random_scalar(&mut OsRng),
            d2: random_scalar(&mut OsRng),
            r1: random_scalar(&mut OsRng),
            r2: random_scalar(&mut OsRng),
        };
        assert!(!ballot_verify(&commitments, &challenge, &responses, &mask));
    }

    fn run_election(votes: &[Vote]) -> Option<u32> {
        let pairs: Vec<_> = votes.iter().map(|_| keypair()).collect();
        let keys: Vec<Point> = pairs.iter().map(|(_, pk)| *pk).collect();
        let ballots: Vec<Point> = votes
            .iter()
            .enumerate()
            .map(|(i, &vote)| {
                let mask = ballot_mask(&keys, i);
                let (ballot, commitments, secrets) =
                    ballot_commit(vote, &pairs[i].0, &mask, &mut OsRng);
                let challenge = random_scalar(&mut OsRng);
                let responses = ballot_respond(&secrets, &pairs[i].0, &challenge);
                assert!(ballot_verify(&commitments, &challenge, &responses, &mask));
                ballot
            })
            .collect();
        recover_tally(&ballots)
    }

    #[test]
    fn tally_matches_vote_vectors() {
        use Vote::{No, Yes};
        assert_eq!(run_election(&[Yes, Yes, No]), Some(2));
        assert_eq!(run_election(&[No, No, No]), Some(0));
        assert_eq!(run_election(&[Yes, No, Yes, No, Yes]), Some(3));
        assert_eq!(run_election(&[Yes, No]), Some(1));
        assert_eq!(run_election(&[Yes, Yes, Yes]), Some(3));
    }

    #[test]
    fn tally_sentinel_when_no_count_matches() {
        // A single "ballot" of G·2 exceeds the searchable range [0, 1].
        let two = Scalar::ONE + Scalar::ONE;
        assert_eq!(recover_tally(&[Point::GENERATOR * two]), None);
    }
}
