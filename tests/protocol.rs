//! End-to-end protocol scenarios over loopback websockets.
//!
//! Each test runs the real server and real client drivers in-process over
//! plain TCP (the engine takes an optional TLS acceptor; the binaries
//! always pass one). Votes are assigned by connection order, which is
//! irrelevant to the tally.

use std::net::SocketAddr;
use std::time::Duration;

use futures::StreamExt;
use rand::rngs::OsRng;
use tokio::net::TcpListener;
use tokio::time::timeout;
use tokio_tungstenite::connect_async;

use ovnet::client::ClientError;
use ovnet::curve::random_scalar;
use ovnet::wire::{self, Envelope, Message};
use ovnet::{run_voter, zkp, Point, Vote, VoteOutcome, VoteServer};

const QUESTION: &str = "Pineapple on pizza?";

async fn start_server(participants: usize) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = VoteServer::new(QUESTION, participants);
    tokio::spawn(async move {
        server.serve(listener, None).await.unwrap();
    });
    addr
}

async fn cast(addr: SocketAddr, vote: Vote) -> Result<VoteOutcome, ClientError> {
    let (ws, _) = connect_async(format!("ws://{addr}")).await.unwrap();
    run_voter(ws, None, move |question| {
        assert_eq!(question, QUESTION);
        vote
    })
    .await
}

async fn run_election(votes: &[Vote]) -> Vec<VoteOutcome> {
    let addr = start_server(votes.len()).await;
    let handles: Vec<_> = votes
        .iter()
        .map(|&vote| tokio::spawn(cast(addr, vote)))
        .collect();
    let mut outcomes = Vec::new();
    for handle in handles {
        outcomes.push(handle.await.unwrap().unwrap());
    }
    outcomes
}

fn assert_tally(outcomes: &[VoteOutcome], expected: u32) {
    for outcome in outcomes {
        assert_eq!(outcome.yes_votes, expected);
        assert_eq!(outcome.participants, outcomes.len());
    }
    let mut ids: Vec<u32> = outcomes.iter().map(|o| o.user_id).collect();
    ids.sort_unstable();
    assert_eq!(ids, (0..outcomes.len() as u32).collect::<Vec<_>>());
}

#[tokio::test]
async fn three_voters_two_yes() {
    let outcomes = run_election(&[Vote::Yes, Vote::Yes, Vote::No]).await;
    assert_tally(&outcomes, 2);
}

#[tokio::test]
async fn three_voters_all_no_recovers_identity_tally() {
    let outcomes = run_election(&[Vote::No, Vote::No, Vote::No]).await;
    assert_tally(&outcomes, 0);
}

#[tokio::test]
async fn five_voters_alternating() {
    let outcomes = run_election(&[Vote::Yes, Vote::No, Vote::Yes, Vote::No, Vote::Yes]).await;
    assert_tally(&outcomes, 3);
}

#[tokio::test]
async fn two_voters_degenerate_mask() {
    let outcomes = run_election(&[Vote::Yes, Vote::No]).await;
    assert_tally(&outcomes, 1);
}

#[tokio::test]
async fn three_voters_unanimous_yes() {
    let outcomes = run_election(&[Vote::Yes, Vote::Yes, Vote::Yes]).await;
    assert_tally(&outcomes, 3);
}

/// A participant who sends random second-phase responses. The server must
/// reject the ballot proof and the run must stall at the tally barrier.
#[tokio::test]
async fn malformed_ballot_proof_stalls_the_run() {
    let addr = start_server(3).await;

    let first = tokio::spawn(cast(addr, Vote::Yes));
    let second = tokio::spawn(cast(addr, Vote::No));
    malicious_participant(addr).await;

    // Honest participants never receive FINAL_BALLOTS.
    assert!(timeout(Duration::from_secs(2), first).await.is_err());
    assert!(!second.is_finished());
}

/// Wrong-key Schnorr proof: rejected, connection closed by the server.
#[tokio::test]
async fn bad_key_proof_is_rejected() {
    let addr = start_server(2).await;
    let (ws, _) = connect_async(format!("ws://{addr}")).await.unwrap();
    let (mut sink, mut source) = ws.split();
    let mut rng = OsRng;

    let secret = random_scalar(&mut rng);
    let public_key = Point::GENERATOR * secret;
    wire::send(
        &mut sink,
        &Envelope::client(
            None,
            Message::UserLogin(wire::UserLogin { public_key }),
        ),
    )
    .await
    .unwrap();
    let user_id = match wire::recv(&mut source).await.unwrap().message {
        Message::SetUserId(p) => p.user_id,
        other => panic!("expected SET_USER_ID, got {:?}", other.msg_id()),
    };

    // Prove with a different secret than the registered key.
    let wrong_secret = random_scalar(&mut rng);
    let proof = zkp::schnorr_prove(&wrong_secret, user_id, &mut rng);
    wire::send(
        &mut sink,
        &Envelope::client(Some(user_id), Message::ZkpForPubKey(proof)),
    )
    .await
    .unwrap();

    match wire::recv(&mut source).await.unwrap().message {
        Message::ZkpForPubKeyAcc(verdict) => assert!(!verdict.acceptance),
        other => panic!("expected ZKP_FOR_PUB_KEY_ACC, got {:?}", other.msg_id()),
    }
    // The server closes the connection after the rejection.
    assert!(matches!(
        wire::recv(&mut source).await,
        Err(wire::WireError::Closed { .. })
    ));
}

async fn malicious_participant(addr: SocketAddr) {
    let (ws, _) = connect_async(format!("ws://{addr}")).await.unwrap();
    let (mut sink, mut source) = ws.split();
    let mut rng = OsRng;

    let secret = random_scalar(&mut rng);
    let public_key = Point::GENERATOR * secret;
    wire::send(
        &mut sink,
        &Envelope::client(
            None,
            Message::UserLogin(wire::UserLogin { public_key }),
        ),
    )
    .await
    .unwrap();
    let user_id = match wire::recv(&mut source).await.unwrap().message {
        Message::SetUserId(p) => p.user_id,
        other => panic!("expected SET_USER_ID, got {:?}", other.msg_id()),
    };

    let proof = zkp::schnorr_prove(&secret, user_id, &mut rng);
    wire::send(
        &mut sink,
        &Envelope::client(Some(user_id), Message::ZkpForPubKey(proof)),
    )
    .await
    .unwrap();
    match wire::recv(&mut source).await.unwrap().message {
        Message::ZkpForPubKeyAcc(verdict) => assert!(verdict.acceptance),
        other => panic!("expected ZKP_FOR_PUB_KEY_ACC, got {:?}", other.msg_id()),
    }

    let question = match wire::recv(&mut source).await.unwrap().message {
        Message::SendQuestion(q) => q,
        other => panic!("expected SEND_QUESTION, got {:?}", other.msg_id()),
    };
    let mask = zkp::ballot_mask(&question.public_keys, user_id as usize);
    let (ballot, commitments, _secrets) =
        zkp::ballot_commit(Vote::Yes, &secret, &mask, &mut rng);
    wire::send(
        &mut sink,
        &Envelope::client(
            Some(user_id),
            Message::MaskedBallot(wire::MaskedBallot {
                masked_ballot: ballot,
                proof: commitments,
            }),
        ),
    )
    .await
    .unwrap();
    match wire::recv(&mut source).await.unwrap().message {
        Message::BallotChallenge(_) => {}
        other => panic!("expected BALLOT_CHALLENGE, got {:?}", other.msg_id()),
    }

    // Garbage second-phase responses instead of closing the proof.
    let junk = zkp::BallotResponses {
        d1: random_scalar(&mut rng),
        d2: random_scalar(&mut rng),
        r1: random_scalar(&mut rng),
        r2: random_scalar(&mut rng),
    };
    wire::send(
        &mut sink,
        &Envelope::client(Some(user_id), Message::BallotZkp(wire::BallotZkp { proof: junk })),
    )
    .await
    .unwrap();
    match wire::recv(&mut source).await.unwrap().message {
        Message::ZkpForBallotAcc(verdict) => assert!(!verdict.acceptance),
        other => panic!("expected ZKP_FOR_BALLOT_ACC, got {:?}", other.msg_id()),
    }
}
