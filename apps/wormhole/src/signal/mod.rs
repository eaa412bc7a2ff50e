//! Messages exchanged with the rendezvous broker and, through it, the peer.

use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

use crate::code::CodeError;
use crate::crypto::KeyError;
use crate::transport::TransportError;

pub mod minsig;
pub mod rendezvous;

/// Value of the `Sec-WebSocket-Protocol` header the broker expects.
pub const PROTOCOL_VERSION: &str = "4";

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SignalError {
    #[error("broker error: {0}")]
    Broker(String),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("bad key: message from peer could not be opened")]
    BadKey,
    #[error("peer hung up")]
    PeerHungUp,
    #[error("rendezvous closed: {reason}")]
    Closed { code: Option<u16>, reason: String },
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Code(#[from] CodeError),
}

impl From<KeyError> for SignalError {
    fn from(err: KeyError) -> Self {
        SignalError::Protocol(err.to_string())
    }
}

impl From<serde_json::Error> for SignalError {
    fn from(err: serde_json::Error) -> Self {
        SignalError::Protocol(format!("invalid json: {err}"))
    }
}

/// Close codes carried on the rendezvous websocket.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum CloseCode {
    NoSuchSlot = 4000,
    SlotTimedOut = 4001,
    NoMoreSlots = 4002,
    WrongProtocol = 4003,
    PeerHungUp = 4004,
    BadKey = 4005,
    Success = 4006,
    SuccessDirect = 4007,
    SuccessRelay = 4008,
    TransportFailed = 4009,
}

impl CloseCode {
    pub fn code(self) -> u16 {
        self as u16
    }

    pub fn from_code(code: u16) -> Option<Self> {
        Some(match code {
            4000 => CloseCode::NoSuchSlot,
            4001 => CloseCode::SlotTimedOut,
            4002 => CloseCode::NoMoreSlots,
            4003 => CloseCode::WrongProtocol,
            4004 => CloseCode::PeerHungUp,
            4005 => CloseCode::BadKey,
            4006 => CloseCode::Success,
            4007 => CloseCode::SuccessDirect,
            4008 => CloseCode::SuccessRelay,
            4009 => CloseCode::TransportFailed,
            _ => return None,
        })
    }

    pub fn reason(self) -> &'static str {
        match self {
            CloseCode::NoSuchSlot => "no such slot",
            CloseCode::SlotTimedOut => "slot timed out",
            CloseCode::NoMoreSlots => "could not get slot",
            CloseCode::WrongProtocol => "wrong protocol version, must update",
            CloseCode::PeerHungUp => "peer hung up",
            CloseCode::BadKey => "bad key",
            CloseCode::Success => "success",
            CloseCode::SuccessDirect => "success, direct connection",
            CloseCode::SuccessRelay => "success, relayed connection",
            CloseCode::TransportFailed => "transport failed",
        }
    }
}

/// `{type, sdp}` as it appears on the wire, before the type is checked.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DescriptionPayload {
    #[serde(rename = "type")]
    pub kind: String,
    pub sdp: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionDescription {
    Offer(String),
    Answer(String),
}

impl SessionDescription {
    pub fn sdp(&self) -> &str {
        match self {
            SessionDescription::Offer(sdp) | SessionDescription::Answer(sdp) => sdp,
        }
    }

    pub fn to_payload(&self) -> DescriptionPayload {
        let kind = match self {
            SessionDescription::Offer(_) => "offer",
            SessionDescription::Answer(_) => "answer",
        };
        DescriptionPayload {
            kind: kind.to_string(),
            sdp: self.sdp().to_string(),
        }
    }

    pub fn from_payload(payload: DescriptionPayload) -> Result<Self, SignalError> {
        match payload.kind.as_str() {
            "offer" => Ok(SessionDescription::Offer(payload.sdp)),
            "answer" => Ok(SessionDescription::Answer(payload.sdp)),
            other => Err(SignalError::Protocol(format!(
                "unknown description type: {other}"
            ))),
        }
    }
}

/// Connectivity candidate in the JSON shape browsers produce.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CandidateInit {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        default,
        rename = "sdpMLineIndex",
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

/// STUN/TURN server entry. The broker sends Go-style capitalised field names,
/// which are accepted here and normalised to lowercase.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    #[serde(alias = "URLs", alias = "Urls", deserialize_with = "one_or_many")]
    pub urls: Vec<String>,
    #[serde(default, alias = "Username")]
    pub username: String,
    #[serde(default, alias = "Credential")]
    pub credential: String,
}

impl IceServer {
    pub fn url(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            ..Default::default()
        }
    }
}

fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(url) => vec![url],
        OneOrMany::Many(urls) => urls,
    })
}

/// First message from the broker: the slot (creator only) and ICE servers.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
pub struct Announcement {
    #[serde(default, deserialize_with = "slot_field")]
    pub slot: Option<u64>,
    #[serde(default, rename = "iceServers", alias = "iceservers")]
    pub ice_servers: Vec<IceServer>,
}

fn slot_field<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Slot {
        Number(u64),
        Text(String),
    }

    match Option::<Slot>::deserialize(deserializer)? {
        None => Ok(None),
        Some(Slot::Number(slot)) => Ok(Some(slot)),
        Some(Slot::Text(text)) => text
            .trim()
            .parse()
            .map(Some)
            .map_err(serde::de::Error::custom),
    }
}

/// Plaintext of a sealed message once the session key exists.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Signal {
    Description(SessionDescription),
    Candidate(CandidateInit),
    Bye,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum SignalWire {
    Candidate(CandidateInit),
    Typed {
        #[serde(rename = "type")]
        kind: String,
        #[serde(default)]
        sdp: Option<String>,
    },
}

impl Signal {
    pub fn to_json(&self) -> Result<Vec<u8>, SignalError> {
        let bytes = match self {
            Signal::Description(description) => serde_json::to_vec(&description.to_payload())?,
            Signal::Candidate(candidate) => serde_json::to_vec(candidate)?,
            Signal::Bye => serde_json::to_vec(&serde_json::json!({ "type": "bye" }))?,
        };
        Ok(bytes)
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self, SignalError> {
        match serde_json::from_slice::<SignalWire>(bytes)? {
            SignalWire::Candidate(candidate) => Ok(Signal::Candidate(candidate)),
            SignalWire::Typed { kind, .. } if kind == "bye" => Ok(Signal::Bye),
            SignalWire::Typed { kind, sdp } => {
                let sdp = sdp.ok_or_else(|| {
                    SignalError::Protocol(format!("{kind} description without sdp"))
                })?;
                SessionDescription::from_payload(DescriptionPayload { kind, sdp })
                    .map(Signal::Description)
            }
        }
    }
}
