//! Wire message taxonomy, envelope validation, and websocket framing
//!
//! Every message on the wire is a single newline-free JSON text frame of
//! the shape `{"header": {"sender": <id|null>, "msg_id": <int>}, "payload":
//! {…}}`. The taxonomy is a tagged sum keyed by [`MsgId`]; serialization
//! dispatches on the variant and deserialization switches on `msg_id`
//! after validating the header shape, so the compiler enforces coverage of
//! every message in every state.
//!
//! Validation is strict: exactly the two top-level keys, exactly the two
//! header fields, a known (non-reserved) `msg_id`. Anything else is a
//! [`DeserializationError`] and terminal for the connection.

use futures::{Sink, SinkExt, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio_tungstenite::tungstenite::{self, Message as WsMessage};

use crate::{curve, zkp, Point, Scalar};

/// Dense protocol message identifiers. Id 1 is a reserved sentinel that
/// never appears on a well-formed wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u64)]
#[allow(missing_docs)]
pub enum MsgId {
    NoType = 1,
    UserLogin = 2,
    SetUserId = 3,
    ZkpForPubKey = 4,
    ZkpForPubKeyAcc = 5,
    SendQuestion = 6,
    MaskedBallot = 7,
    BallotChallenge = 8,
    BallotZkp = 9,
    ZkpForBallotAcc = 10,
    FinalBallots = 11,
}

impl MsgId {
    fn from_u64(raw: u64) -> Option<MsgId> {
        Some(match raw {
            1 => MsgId::NoType,
            2 => MsgId::UserLogin,
            3 => MsgId::SetUserId,
            4 => MsgId::ZkpForPubKey,
            5 => MsgId::ZkpForPubKeyAcc,
            6 => MsgId::SendQuestion,
            7 => MsgId::MaskedBallot,
            8 => MsgId::BallotChallenge,
            9 => MsgId::BallotZkp,
            10 => MsgId::ZkpForBallotAcc,
            11 => MsgId::FinalBallots,
            _ => return None,
        })
    }

    /// The numeric wire form.
    pub fn as_u64(self) -> u64 {
        self as u64
    }
}

// ============================================================================
// Payloads
// ============================================================================

/// Client registers its public key.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserLogin {
    /// `PK = G·x` for the client's secret `x`.
    #[serde(with = "curve::point_pair")]
    pub public_key: Point,
}

/// Server assigns the dense participant id.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetUserId {
    /// Login-order index in `{0, …, N−1}`.
    pub user_id: u32,
}

/// Server reports a proof verdict (used for both proof phases).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Acceptance {
    /// `true` iff the proof verified.
    pub acceptance: bool,
}

/// Server broadcasts the question and the ordered public keys.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendQuestion {
    /// The question displayed to voters.
    pub the_question: String,
    /// All registered public keys, ordered by `user_id`.
    #[serde(with = "curve::point_list")]
    pub public_keys: Vec<Point>,
}

/// Client submits its masked ballot with first-phase commitments.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaskedBallot {
    /// `B = Y·x + G·v`.
    #[serde(with = "curve::point_pair")]
    pub masked_ballot: Point,
    /// First half-round of the ballot-validity proof.
    pub proof: zkp::BallotCommitments,
}

/// Server challenges the ballot proof.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BallotChallenge {
    /// Verifier-chosen challenge scalar.
    #[serde(with = "curve::scalar_dec")]
    pub challenge: Scalar,
}

/// Client closes the ballot proof.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BallotZkp {
    /// Second half-round of the ballot-validity proof.
    pub proof: zkp::BallotResponses,
}

/// Server broadcasts the ordered masked ballots for tally recovery.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalBallots {
    /// All accepted masked ballots, ordered by `user_id`.
    #[serde(with = "curve::point_list")]
    pub ballots: Vec<Point>,
}

/// The tagged message sum. One variant per non-reserved [`MsgId`].
#[derive(Clone, Debug, PartialEq)]
#[allow(missing_docs)]
pub enum Message {
    UserLogin(UserLogin),
    SetUserId(SetUserId),
    ZkpForPubKey(zkp::SchnorrProof),
    ZkpForPubKeyAcc(Acceptance),
    SendQuestion(SendQuestion),
    MaskedBallot(MaskedBallot),
    BallotChallenge(BallotChallenge),
    BallotZkp(BallotZkp),
    ZkpForBallotAcc(Acceptance),
    FinalBallots(FinalBallots),
}

impl Message {
    /// The wire id of this message.
    pub fn msg_id(&self) -> MsgId {
        match self {
            Message::UserLogin(_) => MsgId::UserLogin,
            Message::SetUserId(_) => MsgId::SetUserId,
            Message::ZkpForPubKey(_) => MsgId::ZkpForPubKey,
            Message::ZkpForPubKeyAcc(_) => MsgId::ZkpForPubKeyAcc,
            Message::SendQuestion(_) => MsgId::SendQuestion,
            Message::MaskedBallot(_) => MsgId::MaskedBallot,
            Message::BallotChallenge(_) => MsgId::BallotChallenge,
            Message::BallotZkp(_) => MsgId::BallotZkp,
            Message::ZkpForBallotAcc(_) => MsgId::ZkpForBallotAcc,
            Message::FinalBallots(_) => MsgId::FinalBallots,
        }
    }
}

/// A framed message: the sender id (null until the server assigns one,
/// and on every server-originated message) plus the typed payload.
#[derive(Clone, Debug, PartialEq)]
pub struct Envelope {
    /// `user_id` stamped by the client's upstream path; `None` otherwise.
    pub sender: Option<u32>,
    /// The typed message.
    pub message: Message,
}

impl Envelope {
    /// A server-originated envelope (no sender id).
    pub fn server(message: Message) -> Self {
        Envelope {
            sender: None,
            message,
        }
    }

    /// A client-originated envelope stamped with its assigned id.
    pub fn client(sender: Option<u32>, message: Message) -> Self {
        Envelope { sender, message }
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Strict-format violations raised while decoding a frame.
#[derive(Debug, thiserror::Error)]
pub enum DeserializationError {
    /// The frame is not valid JSON.
    #[error("JSON deserialization failed")]
    Json,
    /// The top level is not a JSON object.
    #[error("message is not a JSON object")]
    NotAnObject,
    /// A top-level key other than `header`/`payload`.
    #[error("unexpected field: {0}")]
    UnexpectedField(String),
    /// Missing or non-object `header`.
    #[error("no valid header")]
    NoHeader,
    /// A header key other than `sender`/`msg_id`.
    #[error("unexpected header field: {0}")]
    UnexpectedHeaderField(String),
    /// A required header field is absent.
    #[error("header field missing: {0}")]
    MissingHeaderField(&'static str),
    /// `sender` is neither null nor a small nonnegative integer.
    #[error("sender is not a user id or null")]
    BadSender,
    /// `msg_id` is not an integer naming a known message.
    #[error("unknown msg_id: {0}")]
    UnknownMsgId(Value),
    /// `msg_id` 1 is reserved and never valid on the wire.
    #[error("reserved msg_id")]
    ReservedMsgId,
    /// The `payload` key is absent.
    #[error("payload missing")]
    NoPayload,
    /// The payload does not decode as the message's typed payload.
    #[error("malformed payload for msg_id {msg_id:?}: {reason}")]
    Payload {
        /// The message the payload failed to decode as.
        msg_id: MsgId,
        /// Decoder detail.
        reason: String,
    },
    /// A non-text frame where a protocol message was expected.
    #[error("expected a text frame")]
    NotText,
}

/// Errors raised by the framing layer.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    /// The peer sent a malformed frame.
    #[error(transparent)]
    Deserialization(#[from] DeserializationError),
    /// Encoding an outbound message failed (identity point in a payload).
    #[error("message serialization failed: {0}")]
    Serialize(String),
    /// Transport-level failure.
    #[error("websocket transport error: {0}")]
    Transport(#[source] tungstenite::Error),
    /// The peer closed the connection.
    #[error("connection closed (code {code:?})")]
    Closed {
        /// Close code from the peer's close frame, when present.
        code: Option<u16>,
    },
}

// ============================================================================
// Envelope codec
// ============================================================================

/// Encode an envelope as a single-line JSON string.
pub fn serialize(envelope: &Envelope) -> Result<String, WireError> {
    let payload = match &envelope.message {
        Message::UserLogin(p) => serde_json::to_value(p),
        Message::SetUserId(p) => serde_json::to_value(p),
        Message::ZkpForPubKey(p) => serde_json::to_value(p),
        Message::ZkpForPubKeyAcc(p) => serde_json::to_value(p),
        Message::SendQuestion(p) => serde_json::to_value(p),
        Message::MaskedBallot(p) => serde_json::to_value(p),
        Message::BallotChallenge(p) => serde_json::to_value(p),
        Message::BallotZkp(p) => serde_json::to_value(p),
        Message::ZkpForBallotAcc(p) => serde_json::to_value(p),
        Message::FinalBallots(p) => serde_json::to_value(p),
    }
    .map_err(|e| WireError::Serialize(e.to_string()))?;

    let frame = json!({
        "header": {
            "sender": envelope.sender,
            "msg_id": envelope.message.msg_id().as_u64(),
        },
        "payload": payload,
    });
    serde_json::to_string(&frame).map_err(|e| WireError::Serialize(e.to_string()))
}

/// Decode and strictly validate a frame.
pub fn deserialize(text: &str) -> Result<Envelope, DeserializationError> {
    let value: Value = serde_json::from_str(text).map_err(|_| DeserializationError::Json)?;
    let top = value.as_object().ok_or(DeserializationError::NotAnObject)?;

    for key in top.keys() {
        if key != "header" && key != "payload" {
            return Err(DeserializationError::UnexpectedField(key.clone()));
        }
    }

    let header = top
        .get("header")
        .and_then(Value::as_object)
        .ok_or(DeserializationError::NoHeader)?;
    for key in header.keys() {
        if key != "sender" && key != "msg_id" {
            return Err(DeserializationError::UnexpectedHeaderField(key.clone()));
        }
    }

    let sender = match header
        .get("sender")
        .ok_or(DeserializationError::MissingHeaderField("sender"))?
    {
        Value::Null => None,
        other => Some(
            other
                .as_u64()
                .and_then(|v| u32::try_from(v).ok())
                .ok_or(DeserializationError::BadSender)?,
        ),
    };

    let raw_id = header
        .get("msg_id")
        .ok_or(DeserializationError::MissingHeaderField("msg_id"))?;
    let msg_id = raw_id
        .as_u64()
        .and_then(MsgId::from_u64)
        .ok_or_else(|| DeserializationError::UnknownMsgId(raw_id.clone()))?;
    if msg_id == MsgId::NoType {
        return Err(DeserializationError::ReservedMsgId);
    }

    let payload = top
        .get("payload")
        .cloned()
        .ok_or(DeserializationError::NoPayload)?;
    let message = decode_payload(msg_id, payload)?;
    Ok(Envelope { sender, message })
}

fn decode_payload(msg_id: MsgId, payload: Value) -> Result<Message, DeserializationError> {
    fn typed<T: serde::de::DeserializeOwned>(
        msg_id: MsgId,
        payload: Value,
    ) -> Result<T, DeserializationError> {
        serde_json::from_value(payload).map_err(|e| DeserializationError::Payload {
            msg_id,
            reason: e.to_string(),
        })
    }

    Ok(match msg_id {
        MsgId::NoType => return Err(DeserializationError::ReservedMsgId),
        MsgId::UserLogin => Message::UserLogin(typed(msg_id, payload)?),
        MsgId::SetUserId => Message::SetUserId(typed(msg_id, payload)?),
        MsgId::ZkpForPubKey => Message::ZkpForPubKey(typed(msg_id, payload)?),
        MsgId::ZkpForPubKeyAcc => Message::ZkpForPubKeyAcc(typed(msg_id, payload)?),
        MsgId::SendQuestion => Message::SendQuestion(typed(msg_id, payload)?),
        MsgId::MaskedBallot => Message::MaskedBallot(typed(msg_id, payload)?),
        MsgId::BallotChallenge => Message::BallotChallenge(typed(msg_id, payload)?),
        MsgId::BallotZkp => Message::BallotZkp(typed(msg_id, payload)?),
        MsgId::ZkpForBallotAcc => Message::ZkpForBallotAcc(typed(msg_id, payload)?),
        MsgId::FinalBallots => Message::FinalBallots(typed(msg_id, payload)?),
    })
}

// ============================================================================
// Framing over a message-oriented byte channel
// ============================================================================

/// Send one envelope as one text frame.
pub async fn send<S>(sink: &mut S, envelope: &Envelope) -> Result<(), WireError>
where
    S: Sink<WsMessage, Error = tungstenite::Error> + Unpin,
{
    let text = serialize(envelope)?;
    sink.send(WsMessage::Text(text))
        .await
        .map_err(map_transport)
}

/// Receive the next envelope, skipping transport-control frames.
pub async fn recv<S>(stream: &mut S) -> Result<Envelope, WireError>
where
    S: Stream<Item = Result<WsMessage, tungstenite::Error>> + Unpin,
{
    loop {
        match stream.next().await {
            None => return Err(WireError::Closed { code: None }),
            Some(Err(e)) => return Err(map_transport(e)),
            Some(Ok(WsMessage::Text(text))) => return Ok(deserialize(&text)?),
            Some(Ok(WsMessage::Close(frame))) => {
                return Err(WireError::Closed {
                    code: frame.map(|f| u16::from(f.code)),
                })
            }
            Some(Ok(WsMessage::Ping(_) | WsMessage::Pong(_))) => continue,
            Some(Ok(_)) => return Err(DeserializationError::NotText.into()),
        }
    }
}

fn map_transport(error: tungstenite::Error) -> WireError {
    match error {
        tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
            WireError::Closed { code: None }
        }
        other => WireError::Transport(other),
    }
}

#[cfg(test)]
mod tests {
    use rand::rngs::OsRng;

    use super::*;
    use crate::curve::random_scalar;
    use crate::zkp;

    fn sample_point() -> Point {
        Point::GENERATOR * random_scalar(&mut OsRng)
    }

    fn round_trip(envelope: Envelope) {
        let text = serialize(&envelope).unwrap();
        assert!(!text.contains('\n'));
        assert_eq!(deserialize(&text).unwrap(), envelope);
    }

    #[test]
    fn every_message_round_trips() {
        let secret = random_scalar(&mut OsRng);
        let mask = sample_point();
        let (ballot, commitments, secrets) =
            zkp::ballot_commit(zkp::Vote::Yes, &secret, &mask, &mut OsRng);
        let challenge = random_scalar(&mut OsRng);
        let responses = zkp::ballot_respond(&secrets, &secret, &challenge);

        round_trip(Envelope::client(
            None,
            Message::UserLogin(UserLogin {
                public_key: sample_point(),
            }),
        ));
        round_trip(Envelope::server(Message::SetUserId(SetUserId {
            user_id: 0,
        })));
        round_trip(Envelope::client(
            Some(2),
            Message::ZkpForPubKey(zkp::schnorr_prove(&secret, 2, &mut OsRng)),
        ));
        round_trip(Envelope::server(Message::ZkpForPubKeyAcc(Acceptance {
            acceptance: true,
        })));
        round_trip(Envelope::server(Message::SendQuestion(SendQuestion {
            the_question: "Pineapple on pizza?".into(),
            public_keys: vec![sample_point(), sample_point(), sample_point()],
        })));
        round_trip(Envelope::client(
            Some(1),
            Message::MaskedBallot(MaskedBallot {
                masked_ballot: ballot,
                proof: commitments,
            }),
        ));
        round_trip(Envelope::server(Message::BallotChallenge(
            BallotChallenge { challenge },
        )));
        round_trip(Envelope::client(
            Some(1),
            Message::BallotZkp(BallotZkp { proof: responses }),
        ));
        round_trip(Envelope::server(Message::ZkpForBallotAcc(Acceptance {
            acceptance: false,
        })));
        round_trip(Envelope::server(Message::FinalBallots(FinalBallots {
            ballots: vec![sample_point(), sample_point()],
        })));
    }

    #[test]
    fn coordinates_survive_as_exact_integers() {
        let p = sample_point();
        let text = serialize(&Envelope::client(
            None,
            Message::UserLogin(UserLogin { public_key: p }),
        ))
        .unwrap();
        let (x, y) = crate::curve::point_coords(&p).unwrap();
        assert!(text.contains(&x.to_str_radix(10)));
        assert!(text.contains(&y.to_str_radix(10)));
    }

    #[test]
    fn rejects_extra_top_level_key() {
        let text = r#"{"header":{"sender":null,"msg_id":3},"payload":{"user_id":1},"extra":0}"#;
        assert!(matches!(
            deserialize(text),
            Err(DeserializationError::UnexpectedField(_))
        ));
    }

    #[test]
    fn rejects_header_shape_violations() {
        let missing = r#"{"header":{"msg_id":3},"payload":{"user_id":1}}"#;
        assert!(matches!(
            deserialize(missing),
            Err(DeserializationError::MissingHeaderField("sender"))
        ));
        let extra = r#"{"header":{"sender":null,"msg_id":3,"hop":1},"payload":{"user_id":1}}"#;
        assert!(matches!(
            deserialize(extra),
            Err(DeserializationError::UnexpectedHeaderField(_))
        ));
        let headerless = r#"{"payload":{"user_id":1}}"#;
        assert!(matches!(
            deserialize(headerless),
            Err(DeserializationError::NoHeader)
        ));
    }

    #[test]
    fn rejects_unknown_and_reserved_ids() {
        let unknown = r#"{"header":{"sender":null,"msg_id":42},"payload":{}}"#;
        assert!(matches!(
            deserialize(unknown),
            Err(DeserializationError::UnknownMsgId(_))
        ));
        let reserved = r#"{"header":{"sender":null,"msg_id":1},"payload":{}}"#;
        assert!(matches!(
            deserialize(reserved),
            Err(DeserializationError::ReservedMsgId)
        ));
    }

    #[test]
    fn rejects_off_curve_payload_point() {
        let text = r#"{"header":{"sender":null,"msg_id":2},"payload":{"public_key":[1,2]}}"#;
        assert!(matches!(
            deserialize(text),
            Err(DeserializationError::Payload { .. })
        ));
    }

    #[test]
    fn rejects_malformed_json() {
        assert!(matches!(
            deserialize("not json"),
            Err(DeserializationError::Json)
        ));
    }
}
