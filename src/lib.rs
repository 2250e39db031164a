//! Crate root: public surface, core aliases, and protocol-wide invariants
//!
//! `ovnet` implements the Hao–Ryan–Zieliński Open Vote Network for a fixed
//! set of N participants casting a secret yes/no ballot. A coordinating
//! server drives a synchronous three-phase choreography — registration with
//! a proof of key knowledge, ballot submission with a ballot-validity proof,
//! tally broadcast — and every participant recovers the exact yes-count
//! without learning any individual vote.
//!
//! ## Invariants (protocol-wide)
//!
//! - **Group.** All arithmetic happens on NIST P-256 (prime order `n`,
//!   standard base point `G`). Points and scalars that cross the wire are
//!   validated on entry: off-curve coordinate pairs and out-of-range
//!   integers never reach the protocol layer.
//! - **Identity binding.** `user_id`s are assigned densely in login order
//!   and fix the ordering of every aggregate the server broadcasts (the
//!   public-key list and the final ballot list). The ballot-mask formula
//!   depends on that ordering; both sides derive it from the same list.
//! - **Mask cancellation.** With `Y_i = Σ_{j<i} PK_j − Σ_{j>i} PK_j` the
//!   masks satisfy `Σ_i x_i·Y_i = 0`, which is what makes the aggregate
//!   tally `Σ_i B_i = G·(Σ v_i)` recoverable by small discrete-log search.
//! - **Barriers.** No session advances to phase k+1 before every session
//!   has finished phase k. The server wakes barrier waiters on every
//!   registry mutation; there is no polling.
//! - **Randomness.** Every protocol scalar is sampled from the OS CSPRNG,
//!   uniform in `[1, n−1]`.
//!
//! Failure is always a precise error surfaced to the caller; cryptographic
//! rejections are terminal for the offending participant (no retries).

#![forbid(unsafe_code)]
#![deny(missing_docs, rust_2018_idioms)]

/// Client-side protocol driver (linear six-step choreography).
pub mod client;
/// Environment-variable configuration for both processes.
pub mod config;
/// P-256 arithmetic surface and the decimal wire codec.
pub mod curve;
/// Server orchestrator: connection listener and per-session handlers.
pub mod server;
/// Per-participant session state, registry, and phase barriers.
pub mod session;
/// TLS glue: server acceptor and the pinned-certificate client connector.
pub mod tls;
/// Wire message taxonomy, envelope validation, and websocket framing.
pub mod wire;
/// Zero-knowledge proofs, ballot masking, and tally recovery.
pub mod zkp;

// ============================================================================
// Canonical aliases and root-level re-exports (centralization)
// ============================================================================

/// Curve point used across the crate (P-256, projective form).
pub type Point = p256::ProjectivePoint;

/// Scalar modulo the P-256 group order.
pub type Scalar = p256::Scalar;

pub use client::{run_voter, ClientError, VoteOutcome};
pub use config::{ClientConfig, ConfigError, ServerConfig};
pub use curve::CurveError;
pub use server::VoteServer;
pub use wire::{DeserializationError, Envelope, Message, MsgId, WireError};
pub use zkp::Vote;
