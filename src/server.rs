//! Server orchestrator: connection listener and per-session handlers
//!
//! One tokio task per connection. The handler runs the registration
//! handshake inline (login, id assignment, key proof), then forks into the
//! fork-join pair the protocol needs: an upstream handler dispatching
//! client messages into the verifier and an event-driven downstream
//! handler draining the session's outbound queue. Barrier waits happen on
//! the upstream path, so a session that has voted simply parks until the
//! rest of the electorate catches up.
//!
//! Unexpected message ids never change state: they are logged at warn
//! level and dropped.

#![allow(missing_docs)]

use std::net::SocketAddr;
use std::sync::Arc;

use futures::stream::{SplitSink, SplitStream};
use futures::StreamExt;
use rand::rngs::OsRng;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_rustls::TlsAcceptor;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{self, Message as WsMessage};
use tokio_tungstenite::{accept_async, WebSocketStream};
use tracing::{info, warn};

use crate::session::{self, ClientSession, SessionRegistry};
use crate::wire::{
    self, Acceptance, BallotChallenge, BallotZkp, Envelope, FinalBallots, MaskedBallot, Message,
    SendQuestion, SetUserId, WireError,
};
use crate::{curve, zkp};

/// Close code sent when the key proof is rejected.
const AUTH_FAILED: u16 = 3000;

/// Fatal errors of the accept loop.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("accept failed: {0}")]
    Accept(#[from] std::io::Error),
}

/// Errors terminating a single session.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Wire(#[from] WireError),
    #[error("websocket handshake failed: {0}")]
    Handshake(#[source] tungstenite::Error),
    #[error("TLS accept failed: {0}")]
    Tls(#[source] std::io::Error),
    #[error("session state or event queue is gone")]
    Detached,
    #[error("websocket halves out of sync")]
    StreamMismatch,
}

/// The voting server: the session registry plus the question to pose.
pub struct VoteServer {
    registry: SessionRegistry,
    question: String,
}

impl VoteServer {
    /// A server expecting `participants` voters.
    pub fn new(question: impl Into<String>, participants: usize) -> Self {
        VoteServer {
            registry: SessionRegistry::new(participants),
            question: question.into(),
        }
    }

    /// Accept connections forever, one handler task per socket. `tls` is
    /// optional so the protocol engine is exercisable over plain TCP; the
    /// server binary always passes an acceptor.
    pub async fn serve(
        self,
        listener: TcpListener,
        tls: Option<TlsAcceptor>,
    ) -> Result<(), ServerError> {
        let server = Arc::new(self);
        info!(participants = server.registry.participants(), "server ready");
        loop {
            let (stream, peer) = listener.accept().await?;
            let server = Arc::clone(&server);
            let tls = tls.clone();
            tokio::spawn(async move {
                info!(%peer, "accepted connection");
                let outcome = match tls {
                    Some(acceptor) => match acceptor.accept(stream).await {
                        Ok(stream) => server.handle_socket(stream, peer).await,
                        Err(e) => Err(SessionError::Tls(e)),
                    },
                    None => server.handle_socket(stream, peer).await,
                };
                match outcome {
                    Ok(()) => info!(%peer, "session finished"),
                    Err(SessionError::Wire(WireError::Closed { code })) => {
                        info!(%peer, ?code, "connection closed")
                    }
                    Err(e) => warn!(%peer, error = %e, "session ended with error"),
                }
            });
        }
    }

    async fn handle_socket<S>(&self, stream: S, peer: SocketAddr) -> Result<(), SessionError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let ws = accept_async(stream)
            .await
            .map_err(SessionError::Handshake)?;
        self.run_session(ws, peer).await
    }

    /// Registration handshake, then the fork-join handler pair.
    async fn run_session<S>(
        &self,
        ws: WebSocketStream<S>,
        peer: SocketAddr,
    ) -> Result<(), SessionError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let (mut sink, mut source) = ws.split();

        let login = loop {
            match wire::recv(&mut source).await?.message {
                Message::UserLogin(login) => break login,
                other => warn!(%peer, msg_id = ?other.msg_id(), "unexpected message before login"),
            }
        };
        let user_id = self.registry.allocate_user_id();
        info!(
            %peer,
            user_id,
            public_key = %curve::point_digest(&login.public_key),
            "login received"
        );
        wire::send(
            &mut sink,
            &Envelope::server(Message::SetUserId(SetUserId { user_id })),
        )
        .await?;

        let proof = loop {
            match wire::recv(&mut source).await?.message {
                Message::ZkpForPubKey(proof) => break proof,
                other => {
                    warn!(user_id, msg_id = ?other.msg_id(), "unexpected message before key proof")
                }
            }
        };
        let accepted = zkp::schnorr_verify(user_id, &proof, &login.public_key);
        wire::send(
            &mut sink,
            &Envelope::server(Message::ZkpForPubKeyAcc(Acceptance {
                acceptance: accepted,
            })),
        )
        .await?;
        if !accepted {
            warn!(user_id, "key proof rejected; closing connection");
            let mut ws = sink
                .reunite(source)
                .map_err(|_| SessionError::StreamMismatch)?;
            ws.close(Some(CloseFrame {
                code: CloseCode::Library(AUTH_FAILED),
                reason: "Authentication failed".into(),
            }))
            .await
            .ok();
            return Ok(());
        }
        info!(user_id, "key proof accepted");

        let (events, inbox) = session::event_queue();
        self.registry.insert(ClientSession::new(
            user_id,
            peer,
            login.public_key,
            proof,
            events.clone(),
        ));

        let outcome = self
            .drive_session(&mut sink, &mut source, user_id, &events, inbox)
            .await;

        if let Some(removed) = self.registry.remove(user_id) {
            info!(user_id, peer = %removed.peer, "session removed");
        }
        outcome
    }

    async fn drive_session<S>(
        &self,
        sink: &mut SplitSink<WebSocketStream<S>, WsMessage>,
        source: &mut SplitStream<WebSocketStream<S>>,
        user_id: u32,
        events: &mpsc::Sender<Message>,
        inbox: mpsc::Receiver<Message>,
    ) -> Result<(), SessionError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        info!(user_id, "waiting for all participants before sending the question");
        let public_keys = self.registry.all_keys_registered().await;
        events
            .send(Message::SendQuestion(SendQuestion {
                the_question: self.question.clone(),
                public_keys,
            }))
            .await
            .map_err(|_| SessionError::Detached)?;
        info!(user_id, "question queued");

        futures::try_join!(
            self.upstream(source, user_id, events),
            Self::downstream(sink, inbox),
        )
        .map(|_| ())
    }

    /// Upstream traffic: client to server.
    async fn upstream<S>(
        &self,
        source: &mut SplitStream<WebSocketStream<S>>,
        user_id: u32,
        events: &mpsc::Sender<Message>,
    ) -> Result<(), SessionError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        loop {
            let envelope = wire::recv(source).await?;
            match envelope.message {
                Message::MaskedBallot(msg) => self.on_masked_ballot(user_id, msg, events).await?,
                Message::BallotZkp(msg) => self.on_ballot_proof(user_id, msg, events).await?,
                other => {
                    warn!(user_id, msg_id = ?other.msg_id(), "unexpected message; ignoring")
                }
            }
        }
    }

    /// Downstream traffic: drain the event queue to the socket.
    async fn downstream<S>(
        sink: &mut SplitSink<WebSocketStream<S>, WsMessage>,
        mut inbox: mpsc::Receiver<Message>,
    ) -> Result<(), SessionError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        while let Some(message) = inbox.recv().await {
            wire::send(sink, &Envelope::server(message)).await?;
        }
        Ok(())
    }

    async fn on_masked_ballot(
        &self,
        user_id: u32,
        msg: MaskedBallot,
        events: &mpsc::Sender<Message>,
    ) -> Result<(), SessionError> {
        let challenge = curve::random_scalar(&mut OsRng);
        let fresh = self
            .registry
            .with_session(user_id, |session| {
                if session.challenge.is_some() {
                    false
                } else {
                    session.masked_ballot = Some(msg.masked_ballot);
                    session.ballot_commitments = Some(msg.proof);
                    session.challenge = Some(challenge);
                    true
                }
            })
            .ok_or(SessionError::Detached)?;

        if !fresh {
            warn!(user_id, "duplicate masked ballot; ignoring");
            return Ok(());
        }
        info!(
            user_id,
            ballot = %curve::point_digest(&msg.masked_ballot),
            "masked ballot received; issuing challenge"
        );
        events
            .send(Message::BallotChallenge(BallotChallenge { challenge }))
            .await
            .map_err(|_| SessionError::Detached)
    }

    async fn on_ballot_proof(
        &self,
        user_id: u32,
        msg: BallotZkp,
        events: &mpsc::Sender<Message>,
    ) -> Result<(), SessionError> {
        let staged = self
            .registry
            .with_session(user_id, |s| {
                (
                    s.public_key,
                    s.masked_ballot,
                    s.ballot_commitments,
                    s.challenge,
                    s.ballot_accepted,
                )
            })
            .ok_or(SessionError::Detached)?;
        let (public_key, Some(ballot), Some(commitments), Some(challenge), false) = staged else {
            warn!(user_id, "ballot proof without a pending challenge; ignoring");
            return Ok(());
        };

        let (keys, index) = self
            .registry
            .keys_with_index(user_id)
            .ok_or(SessionError::Detached)?;
        let mask = zkp::ballot_mask(&keys, index);
        // The transcript must speak about this session's key and ballot.
        let bound = commitments.x == public_key && commitments.y == ballot;
        let accepted = bound && zkp::ballot_verify(&commitments, &challenge, &msg.proof, &mask);

        if accepted {
            self.registry.record_acceptance(user_id);
            info!(user_id, "ballot proof accepted");
        } else {
            warn!(user_id, "ballot proof rejected");
        }
        events
            .send(Message::ZkpForBallotAcc(Acceptance {
                acceptance: accepted,
            }))
            .await
            .map_err(|_| SessionError::Detached)?;

        if accepted {
            info!(user_id, "waiting for the remaining ballots");
            let ballots = self.registry.all_ballots_accepted().await;
            events
                .send(Message::FinalBallots(FinalBallots { ballots }))
                .await
                .map_err(|_| SessionError::Detached)?;
            info!(user_id, "final ballots queued");
        }
        Ok(())
    }
}
