use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::signal::{CandidateInit, IceServer};

pub mod webrtc;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("transport setup failed: {0}")]
    Setup(String),
    #[error("negotiation failed: {0}")]
    Negotiation(String),
    #[error("data channel closed before it opened")]
    ChannelClosed,
    #[error("connection failed: {0}")]
    Failed(String),
}

/// Kind of connectivity candidate at one end of the selected path.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CandidateKind {
    Host,
    ServerReflexive,
    PeerReflexive,
    Relay,
    Unknown,
}

/// How the established connection reaches the peer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PathClass {
    Direct,
    Relay,
    Unknown,
}

pub fn classify(local: CandidateKind, remote: CandidateKind) -> PathClass {
    use CandidateKind::*;
    match (local, remote) {
        (Relay, _) | (_, Relay) => PathClass::Relay,
        (Unknown, _) | (_, Unknown) => PathClass::Unknown,
        _ => PathClass::Direct,
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransportEvent {
    /// A trickled local candidate that should reach the peer.
    LocalCandidate(CandidateInit),
    Connected,
    Failed,
}

/// Connectivity engine behind a session: negotiates descriptions and
/// candidates and reports when its data channel is usable.
#[async_trait]
pub trait TransportProvider: Send + Sync {
    async fn create_offer(&self) -> Result<String, TransportError>;

    /// Applies a remote offer and returns the local answer.
    async fn accept_offer(&self, sdp: &str) -> Result<String, TransportError>;

    async fn accept_answer(&self, sdp: &str) -> Result<(), TransportError>;

    async fn add_candidate(&self, candidate: CandidateInit) -> Result<(), TransportError>;

    /// Event stream for this endpoint. Only the first call returns it.
    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<TransportEvent>>;

    /// Resolves once the data channel opens or the connection fails,
    /// whichever happens first.
    async fn wait_open(&self) -> Result<(), TransportError>;

    /// Best-effort classification of the selected path.
    async fn path_class(&self) -> PathClass;

    async fn close(&self);
}

#[async_trait]
pub trait TransportFactory: Send + Sync {
    type Transport: TransportProvider + 'static;

    /// Builds a fresh endpoint. With `trickle` off, descriptions are returned
    /// only after candidate gathering completes so they carry every candidate.
    async fn create(
        &self,
        ice_servers: &[IceServer],
        trickle: bool,
    ) -> Result<Self::Transport, TransportError>;
}
