//! Client-side protocol driver (linear six-step choreography)
//!
//! The client is entirely server-driven: it generates its secret, logs in,
//! proves key knowledge, answers the question with a masked ballot and its
//! validity proof, and recovers the tally from the final broadcast. Each
//! step waits for exactly one expected server message; anything else is
//! logged at warn level and skipped, matching the server's own tolerance
//! for out-of-phase traffic.
//!
//! Obtaining the vote may block on stdin. That stalls the whole client,
//! which is fine: there is nothing else for it to do.

use futures::stream::{SplitSink, SplitStream};
use futures::StreamExt;
use rand::rngs::OsRng;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::WebSocketStream;
use tracing::{info, warn};

use crate::wire::{self, BallotZkp, Envelope, MaskedBallot, Message, WireError};
use crate::zkp::{self, Vote};
use crate::{curve, Point};

/// Result of a completed protocol run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VoteOutcome {
    /// The id the server assigned to this participant.
    pub user_id: u32,
    /// The number of ballots in the final broadcast.
    pub participants: usize,
    /// The recovered number of yes-votes.
    pub yes_votes: u32,
}

/// Client-side protocol failures.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// Transport or framing failure.
    #[error(transparent)]
    Wire(#[from] WireError),
    /// The server rejected the Schnorr key proof.
    #[error("server rejected the public key proof")]
    KeyProofRejected,
    /// The server rejected the ballot-validity proof.
    #[error("server rejected the ballot proof")]
    BallotProofRejected,
    /// The announced key list disagrees with the configured electorate size.
    #[error("server announced {got} participants, expected {expected}")]
    ParticipantMismatch {
        /// Configured N.
        expected: usize,
        /// Announced key count.
        got: usize,
    },
    /// Our own public key is missing from its slot in the announced list.
    #[error("own public key missing from the announced key list")]
    KeyListMismatch,
    /// No count in `[0, N]` matches the aggregated ballots.
    #[error("no tally in range matches the aggregated ballots")]
    TallyUnrecoverable,
}

/// Parse a vote answer: case-insensitive "yes"/"no", anything else is
/// a reprompt.
pub fn parse_vote(input: &str) -> Option<Vote> {
    let trimmed = input.trim();
    if trimmed.eq_ignore_ascii_case("yes") {
        Some(Vote::Yes)
    } else if trimmed.eq_ignore_ascii_case("no") {
        Some(Vote::No)
    } else {
        None
    }
}

/// Run the full voting choreography over an established websocket.
///
/// `choose` is invoked once with the question text and yields this
/// participant's vote; `expected_participants` (when known from
/// configuration) is checked against the announced key list.
pub async fn run_voter<S>(
    ws: WebSocketStream<S>,
    expected_participants: Option<usize>,
    choose: impl FnOnce(&str) -> Vote,
) -> Result<VoteOutcome, ClientError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut sink, mut source) = ws.split();
    let mut rng = OsRng;

    // 1. Register the public key.
    let secret = curve::random_scalar(&mut rng);
    let public_key = Point::GENERATOR * secret;
    wire::send(
        &mut sink,
        &Envelope::client(
            None,
            Message::UserLogin(wire::UserLogin { public_key }),
        ),
    )
    .await?;
    info!(public_key = %curve::point_digest(&public_key), "login sent");

    // 2. Learn the assigned identity.
    let assigned = expect(&mut source, "SET_USER_ID", |m| match m {
        Message::SetUserId(p) => Ok(p),
        other => Err(other),
    })
    .await?;
    let user_id = assigned.user_id;
    info!(user_id, "user id assigned");

    // 3. Prove knowledge of the secret, bound to the identity.
    let proof = zkp::schnorr_prove(&secret, user_id, &mut rng);
    wire::send(
        &mut sink,
        &Envelope::client(Some(user_id), Message::ZkpForPubKey(proof)),
    )
    .await?;
    let verdict = expect(&mut source, "ZKP_FOR_PUB_KEY_ACC", |m| match m {
        Message::ZkpForPubKeyAcc(p) => Ok(p),
        other => Err(other),
    })
    .await?;
    if !verdict.acceptance {
        return Err(ClientError::KeyProofRejected);
    }
    info!(user_id, "key proof accepted");

    // 4. Receive the question, vote, and commit the masked ballot.
    let question = expect(&mut source, "SEND_QUESTION", |m| match m {
        Message::SendQuestion(p) => Ok(p),
        other => Err(other),
    })
    .await?;
    if let Some(expected) = expected_participants {
        if question.public_keys.len() != expected {
            return Err(ClientError::ParticipantMismatch {
                expected,
                got: question.public_keys.len(),
            });
        }
    }
    let index = user_id as usize;
    if question.public_keys.get(index) != Some(&public_key) {
        return Err(ClientError::KeyListMismatch);
    }

    let vote = choose(&question.the_question);
    let mask = zkp::ballot_mask(&question.public_keys, index);
    let (ballot, commitments, secrets) = zkp::ballot_commit(vote, &secret, &mask, &mut rng);
    wire::send(
        &mut sink,
        &Envelope::client(
            Some(user_id),
            Message::MaskedBallot(MaskedBallot {
                masked_ballot: ballot,
                proof: commitments,
            }),
        ),
    )
    .await?;
    info!(user_id, ballot = %curve::point_digest(&ballot), "masked ballot sent");

    // 5. Close the ballot proof against the server's challenge.
    let challenge = expect(&mut source, "BALLOT_CHALLENGE", |m| match m {
        Message::BallotChallenge(p) => Ok(p),
        other => Err(other),
    })
    .await?;
    let responses = zkp::ballot_respond(&secrets, &secret, &challenge.challenge);
    wire::send(
        &mut sink,
        &Envelope::client(
            Some(user_id),
            Message::BallotZkp(BallotZkp { proof: responses }),
        ),
    )
    .await?;
    let verdict = expect(&mut source, "ZKP_FOR_BALLOT_ACC", |m| match m {
        Message::ZkpForBallotAcc(p) => Ok(p),
        other => Err(other),
    })
    .await?;
    if !verdict.acceptance {
        return Err(ClientError::BallotProofRejected);
    }
    info!(user_id, "ballot proof accepted");

    // 6. Recover the tally from the final broadcast.
    let broadcast = expect(&mut source, "FINAL_BALLOTS", |m| match m {
        Message::FinalBallots(p) => Ok(p),
        other => Err(other),
    })
    .await?;
    let yes_votes =
        zkp::recover_tally(&broadcast.ballots).ok_or(ClientError::TallyUnrecoverable)?;
    info!(user_id, yes_votes, "tally recovered");

    close_quietly(sink, source).await;
    Ok(VoteOutcome {
        user_id,
        participants: broadcast.ballots.len(),
        yes_votes,
    })
}

/// Wait for one expected message, warning about and skipping any other.
async fn expect<S, T>(
    source: &mut SplitStream<WebSocketStream<S>>,
    what: &'static str,
    extract: impl Fn(Message) -> Result<T, Message>,
) -> Result<T, ClientError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        match extract(wire::recv(source).await?.message) {
            Ok(value) => return Ok(value),
            Err(other) => {
                warn!(expected = what, got = ?other.msg_id(), "unexpected message; ignoring")
            }
        }
    }
}

async fn close_quietly<S>(
    sink: SplitSink<WebSocketStream<S>, WsMessage>,
    source: SplitStream<WebSocketStream<S>>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if let Ok(mut ws) = sink.reunite(source) {
        ws.close(None).await.ok();
    }
}
