//! Per-participant session state, registry, and phase barriers
//!
//! The registry is the server's only shared state. It assigns dense
//! `user_id`s in login order, holds one [`ClientSession`] per verified
//! participant, and implements the two rendezvous points of the protocol:
//! all-registered (fires the question broadcast) and all-ballots-accepted
//! (fires the tally broadcast).
//!
//! Locking discipline: a single mutex, held only for the span of one state
//! transition and never across an `.await`. Each session's fields are
//! mutated only from its own handler task; barrier waiters take ordered
//! snapshots under the lock. Every mutation wakes the barrier waiters, so
//! there is no polling.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Mutex;

use tokio::sync::{mpsc, Notify};

use crate::wire::Message;
use crate::zkp::{BallotCommitments, SchnorrProof};
use crate::{Point, Scalar};

/// Capacity of a session's outbound event queue. The protocol sends at
/// most three server messages after registration.
const EVENT_QUEUE_DEPTH: usize = 16;

/// Server-side state for one verified participant.
#[derive(Debug)]
pub struct ClientSession {
    /// Dense login-order id.
    pub user_id: u32,
    /// Remote address, for close logging.
    pub peer: SocketAddr,
    /// Registered public key `PK = G·x`.
    pub public_key: Point,
    /// The accepted key proof, retained for audit.
    pub public_key_proof: SchnorrProof,
    /// The submitted masked ballot, once received.
    pub masked_ballot: Option<Point>,
    /// First-phase ballot proof transcript, held until verification.
    pub ballot_commitments: Option<BallotCommitments>,
    /// Server-chosen challenge for the ballot proof.
    pub challenge: Option<Scalar>,
    /// Whether the ballot proof verified.
    pub ballot_accepted: bool,
    /// Outbound event queue drained by the session's downstream handler.
    pub outbound: mpsc::Sender<Message>,
}

impl ClientSession {
    /// A fresh session entering the question phase.
    pub fn new(
        user_id: u32,
        peer: SocketAddr,
        public_key: Point,
        public_key_proof: SchnorrProof,
        outbound: mpsc::Sender<Message>,
    ) -> Self {
        ClientSession {
            user_id,
            peer,
            public_key,
            public_key_proof,
            masked_ballot: None,
            ballot_commitments: None,
            challenge: None,
            ballot_accepted: false,
            outbound,
        }
    }
}

#[derive(Default)]
struct RegistryState {
    next_user_id: u32,
    sessions: BTreeMap<u32, ClientSession>,
}

/// The session table plus the barrier condition.
pub struct SessionRegistry {
    participants: usize,
    state: Mutex<RegistryState>,
    changed: Notify,
}

impl SessionRegistry {
    /// A registry expecting `participants` voters.
    pub fn new(participants: usize) -> Self {
        SessionRegistry {
            participants,
            state: Mutex::new(RegistryState::default()),
            changed: Notify::new(),
        }
    }

    /// The configured participant count N.
    pub fn participants(&self) -> usize {
        self.participants
    }

    /// Assign the next `user_id` (login order, starting at 0).
    pub fn allocate_user_id(&self) -> u32 {
        let mut state = self.lock();
        let id = state.next_user_id;
        state.next_user_id += 1;
        id
    }

    /// Insert a session after its key proof verified.
    pub fn insert(&self, session: ClientSession) {
        self.lock().sessions.insert(session.user_id, session);
        self.changed.notify_waiters();
    }

    /// Remove a session on connection close. Wakes barrier waiters so a
    /// stalled run at least observes the departure in its logs.
    pub fn remove(&self, user_id: u32) -> Option<ClientSession> {
        let removed = self.lock().sessions.remove(&user_id);
        self.changed.notify_waiters();
        removed
    }

    /// Run a closure against one session under the lock.
    pub fn with_session<T>(
        &self,
        user_id: u32,
        f: impl FnOnce(&mut ClientSession) -> T,
    ) -> Option<T> {
        self.lock().sessions.get_mut(&user_id).map(f)
    }

    /// Mark a session's ballot as accepted and wake barrier waiters.
    pub fn record_acceptance(&self, user_id: u32) {
        if let Some(session) = self.lock().sessions.get_mut(&user_id) {
            session.ballot_accepted = true;
        }
        self.changed.notify_waiters();
    }

    /// The registered public keys ordered by `user_id`, with the position
    /// of `user_id` in that ordering.
    pub fn keys_with_index(&self, user_id: u32) -> Option<(Vec<Point>, usize)> {
        let state = self.lock();
        let index = state.sessions.keys().position(|&id| id == user_id)?;
        let keys = state.sessions.values().map(|s| s.public_key).collect();
        Some((keys, index))
    }

    /// Barrier 1: resolve once all N participants are registered, with the
    /// ordered public keys.
    pub async fn all_keys_registered(&self) -> Vec<Point> {
        self.wait_for(|state| {
            if state.sessions.len() == self.participants {
                Some(state.sessions.values().map(|s| s.public_key).collect())
            } else {
                None
            }
        })
        .await
    }

    /// Barrier 2: resolve once every session's ballot is accepted, with
    /// the ordered masked ballots.
    pub async fn all_ballots_accepted(&self) -> Vec<Point> {
        self.wait_for(|state| {
            if state.sessions.len() != self.participants {
                return None;
            }
            state
                .sessions
                .values()
                .map(|s| {
                    if s.ballot_accepted {
                        s.masked_ballot
                    } else {
                        None
                    }
                })
                .collect()
        })
        .await
    }

    /// Block until `check` yields under the lock. The notified future is
    /// enabled before each check so a wakeup between check and await is
    /// never lost.
    async fn wait_for<T>(&self, check: impl Fn(&RegistryState) -> Option<T>) -> T {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Some(value) = check(&self.lock()) {
                return value;
            }
            notified.await;
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RegistryState> {
        // A poisoned registry mutex means a handler panicked mid-transition;
        // the protocol state is unrecoverable either way.
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Build a session event queue.
pub fn event_queue() -> (mpsc::Sender<Message>, mpsc::Receiver<Message>) {
    mpsc::channel(EVENT_QUEUE_DEPTH)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use rand::rngs::OsRng;

    use super::*;
    use crate::curve::random_scalar;
    use crate::zkp::schnorr_prove;

    fn dummy_session(registry: &SessionRegistry) -> ClientSession {
        let user_id = registry.allocate_user_id();
        let secret = random_scalar(&mut OsRng);
        let (tx, _rx) = event_queue();
        ClientSession::new(
            user_id,
            "127.0.0.1:9".parse().unwrap(),
            Point::GENERATOR * secret,
            schnorr_prove(&secret, user_id, &mut OsRng),
            tx,
        )
    }

    #[test]
    fn user_ids_are_dense_and_login_ordered() {
        let registry = SessionRegistry::new(3);
        assert_eq!(registry.allocate_user_id(), 0);
        assert_eq!(registry.allocate_user_id(), 1);
        assert_eq!(registry.allocate_user_id(), 2);
    }

    #[tokio::test]
    async fn registration_barrier_fires_exactly_at_n() {
        let registry = Arc::new(SessionRegistry::new(2));
        let waiter = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move { registry.all_keys_registered().await })
        };

        registry.insert(dummy_session(&registry));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        registry.insert(dummy_session(&registry));
        let keys = waiter.await.unwrap();
        assert_eq!(keys.len(), 2);
    }

    #[tokio::test]
    async fn ballot_barrier_requires_acceptance_not_presence() {
        let registry = Arc::new(SessionRegistry::new(2));
        let first = dummy_session(&registry);
        let second = dummy_session(&registry);
        let (first_id, second_id) = (first.user_id, second.user_id);
        registry.insert(first);
        registry.insert(second);
        for id in [first_id, second_id] {
            registry.with_session(id, |s| {
                s.masked_ballot = Some(Point::GENERATOR);
            });
        }

        let waiter = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move { registry.all_ballots_accepted().await })
        };

        registry.record_acceptance(first_id);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        registry.record_acceptance(second_id);
        let ballots = waiter.await.unwrap();
        assert_eq!(ballots.len(), 2);
    }
}
