//! Rendezvous handshake as an explicit state machine.
//!
//! [`Handshake::handle`] takes one [`Event`] and returns the [`Effect`]s the
//! driver must carry out, in order. It never performs I/O itself, which keeps
//! every state/event combination testable without a broker or a network.
//!
//! The slot joiner starts both exchanges: it sends PAKE message 1 and, once
//! keyed, the session-description offer. The slot creator answers both.
//! Anything a state does not expect moves the session to `Error`, which
//! absorbs all further events.

use std::fmt;
use std::sync::Arc;

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use tracing::{debug, warn};

use crate::code;
use crate::crypto::{KeyExchange, PendingExchange, SessionKey};
use crate::deferred::Deferred;
use crate::signal::{
    Announcement, CandidateInit, CloseCode, IceServer, SessionDescription, Signal, SignalError,
};
use crate::transport::{PathClass, TransportError};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Creator,
    Joiner,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandshakeState {
    Announcing,
    Joining,
    AwaitingPakeMsg1,
    AwaitingPakeMsg2,
    AwaitingOffer,
    Answering,
    Offering,
    AwaitingAnswer,
    AwaitingCandidates,
    Error,
}

impl fmt::Display for HandshakeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HandshakeState::Announcing => "announcing",
            HandshakeState::Joining => "joining",
            HandshakeState::AwaitingPakeMsg1 => "awaiting_pake_msg1",
            HandshakeState::AwaitingPakeMsg2 => "awaiting_pake_msg2",
            HandshakeState::AwaitingOffer => "awaiting_offer",
            HandshakeState::Answering => "answering",
            HandshakeState::Offering => "offering",
            HandshakeState::AwaitingAnswer => "awaiting_answer",
            HandshakeState::AwaitingCandidates => "awaiting_candidates",
            HandshakeState::Error => "error",
        };
        f.write_str(name)
    }
}

#[derive(Debug)]
pub enum Event {
    /// One text message relayed by the broker.
    Inbound(String),
    /// The local transport endpoint has been created and configured.
    TransportReady,
    /// Local description produced by a `CreateOffer` or `AcceptOffer` action.
    LocalDescription(String),
    LocalCandidate(CandidateInit),
    Connected(PathClass),
    TransportFailed,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransportAction {
    CreateOffer,
    AcceptOffer(String),
    AcceptAnswer(String),
    AddCandidate(CandidateInit),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Effect {
    /// Text to relay to the peer through the broker.
    Send(String),
    ShowCode(String),
    ConfigureTransport(Vec<IceServer>),
    Transport(TransportAction),
    ShowFingerprint(String),
    Fail(SignalError),
    Close(CloseCode),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Step {
    AwaitingOffer,
    Answering,
    Offering,
    AwaitingAnswer,
    AwaitingCandidates,
}

impl Step {
    fn description_sent(self) -> bool {
        matches!(self, Step::AwaitingAnswer | Step::AwaitingCandidates)
    }
}

enum Phase {
    Announcing,
    Joining {
        slot: u64,
    },
    AwaitingPakeMsg1 {
        slot: u64,
    },
    AwaitingPakeMsg2 {
        slot: u64,
        pending: Box<dyn PendingExchange>,
    },
    Keyed {
        slot: u64,
        key: SessionKey,
        step: Step,
    },
    Error,
}

impl Phase {
    fn state(&self) -> HandshakeState {
        match self {
            Phase::Announcing => HandshakeState::Announcing,
            Phase::Joining { .. } => HandshakeState::Joining,
            Phase::AwaitingPakeMsg1 { .. } => HandshakeState::AwaitingPakeMsg1,
            Phase::AwaitingPakeMsg2 { .. } => HandshakeState::AwaitingPakeMsg2,
            Phase::Keyed { step, .. } => match step {
                Step::AwaitingOffer => HandshakeState::AwaitingOffer,
                Step::Answering => HandshakeState::Answering,
                Step::Offering => HandshakeState::Offering,
                Step::AwaitingAnswer => HandshakeState::AwaitingAnswer,
                Step::AwaitingCandidates => HandshakeState::AwaitingCandidates,
            },
            Phase::Error => HandshakeState::Error,
        }
    }

    fn key(&self) -> Option<&SessionKey> {
        match self {
            Phase::Keyed { key, .. } => Some(key),
            _ => None,
        }
    }

    fn slot(&self) -> Option<u64> {
        match self {
            Phase::Joining { slot }
            | Phase::AwaitingPakeMsg1 { slot }
            | Phase::AwaitingPakeMsg2 { slot, .. }
            | Phase::Keyed { slot, .. } => Some(*slot),
            Phase::Announcing | Phase::Error => None,
        }
    }
}

type Transition = Result<(Phase, Vec<Effect>), SignalError>;

pub struct Handshake {
    role: Role,
    phase: Phase,
    secret: Vec<u8>,
    oracle: Arc<dyn KeyExchange>,
    deferred: Deferred<TransportAction>,
    outbox: Vec<CandidateInit>,
    closed: bool,
}

impl Handshake {
    /// Side without a code: waits for the broker to assign a slot.
    pub fn creator(secret: Vec<u8>, oracle: Arc<dyn KeyExchange>) -> Self {
        Self::with_phase(Role::Creator, Phase::Announcing, secret, oracle)
    }

    /// Side that was handed a code and joins the slot it names.
    pub fn joiner(code: &str, oracle: Arc<dyn KeyExchange>) -> Result<Self, SignalError> {
        let (slot, secret) = code::decode(code)?;
        Ok(Self::with_phase(
            Role::Joiner,
            Phase::Joining { slot },
            secret,
            oracle,
        ))
    }

    fn with_phase(role: Role, phase: Phase, secret: Vec<u8>, oracle: Arc<dyn KeyExchange>) -> Self {
        Self {
            role,
            phase,
            secret,
            oracle,
            deferred: Deferred::new(),
            outbox: Vec::new(),
            closed: false,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> HandshakeState {
        self.phase.state()
    }

    /// Slot known so far: decoded from the code, or assigned by the broker.
    pub fn slot(&self) -> Option<u64> {
        self.phase.slot()
    }

    #[cfg(test)]
    fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn handle(&mut self, event: Event) -> Vec<Effect> {
        if matches!(self.phase, Phase::Error) {
            debug!(target = "wormhole::handshake", ?event, "dropping event after error");
            return Vec::new();
        }

        let key = self.phase.key().cloned();
        let from = self.phase.state();
        let phase = std::mem::replace(&mut self.phase, Phase::Error);
        match self.step(phase, event) {
            Ok((phase, effects)) => {
                if phase.state() != from {
                    debug!(
                        target = "wormhole::handshake",
                        from = %from,
                        to = %phase.state(),
                        "handshake transition"
                    );
                }
                self.phase = phase;
                effects
            }
            Err(err) => self.fail(from, err, key.as_ref()),
        }
    }

    fn fail(&mut self, from: HandshakeState, err: SignalError, key: Option<&SessionKey>) -> Vec<Effect> {
        warn!(target = "wormhole::handshake", state = %from, error = %err, "handshake failed");
        self.deferred = Deferred::new();
        self.outbox.clear();

        let close = match &err {
            SignalError::PeerHungUp => CloseCode::PeerHungUp,
            SignalError::Transport(_) => CloseCode::TransportFailed,
            _ => CloseCode::BadKey,
        };

        let mut effects = Vec::new();
        if let Some(key) = key {
            if close == CloseCode::BadKey {
                if let Ok(bye) = seal(key, &Signal::Bye) {
                    effects.push(Effect::Send(bye));
                }
            }
        }
        effects.push(Effect::Fail(err));
        if !self.closed {
            self.closed = true;
            effects.push(Effect::Close(close));
        }
        effects
    }

    fn step(&mut self, phase: Phase, event: Event) -> Transition {
        match (phase, event) {
            (Phase::Error, _) => Ok((Phase::Error, Vec::new())),

            (phase, Event::TransportReady) => {
                let effects = self
                    .deferred
                    .fire()
                    .into_iter()
                    .map(Effect::Transport)
                    .collect();
                Ok((phase, effects))
            }

            (phase, Event::Connected(path)) => {
                if self.closed {
                    return Ok((phase, Vec::new()));
                }
                self.closed = true;
                let close = match path {
                    PathClass::Direct => CloseCode::SuccessDirect,
                    PathClass::Relay => CloseCode::SuccessRelay,
                    PathClass::Unknown => CloseCode::Success,
                };
                Ok((phase, vec![Effect::Close(close)]))
            }

            (_, Event::TransportFailed) => Err(SignalError::Transport(TransportError::Failed(
                "connection failed".into(),
            ))),

            (Phase::Announcing, Event::Inbound(text)) => {
                let announcement: Announcement = serde_json::from_str(&text)?;
                let slot = announcement
                    .slot
                    .ok_or_else(|| SignalError::Protocol("announcement without a slot".into()))?;
                let effects = vec![
                    Effect::ShowCode(code::encode(slot, &self.secret)),
                    Effect::ConfigureTransport(announcement.ice_servers),
                ];
                Ok((Phase::AwaitingPakeMsg1 { slot }, effects))
            }

            (Phase::Joining { slot }, Event::Inbound(text)) => {
                let announcement: Announcement = serde_json::from_str(&text)?;
                let (pending, first) = self.oracle.start(&self.secret);
                let effects = vec![
                    Effect::ConfigureTransport(announcement.ice_servers),
                    Effect::Send(URL_SAFE_NO_PAD.encode(first)),
                ];
                Ok((Phase::AwaitingPakeMsg2 { slot, pending }, effects))
            }

            (Phase::AwaitingPakeMsg1 { slot }, Event::Inbound(text)) => {
                let first = decode_pake(&text)?;
                let (key, second) = self.oracle.exchange(&self.secret, &first)?;
                let effects = vec![Effect::Send(URL_SAFE_NO_PAD.encode(second))];
                Ok((
                    Phase::Keyed {
                        slot,
                        key,
                        step: Step::AwaitingOffer,
                    },
                    effects,
                ))
            }

            (Phase::AwaitingPakeMsg2 { slot, pending }, Event::Inbound(text)) => {
                let second = decode_pake(&text)?;
                let key = pending.finish(&second)?;
                let effects = self.defer(TransportAction::CreateOffer);
                Ok((
                    Phase::Keyed {
                        slot,
                        key,
                        step: Step::Offering,
                    },
                    effects,
                ))
            }

            (Phase::Keyed { slot, key, step }, Event::Inbound(text)) => {
                let signal = open(&key, &text)?;
                let (step, effects) = self.on_signal(&key, step, signal)?;
                Ok((Phase::Keyed { slot, key, step }, effects))
            }

            (
                Phase::Keyed {
                    slot,
                    key,
                    step: step @ (Step::Offering | Step::Answering),
                },
                Event::LocalDescription(sdp),
            ) => {
                let (description, next) = match step {
                    Step::Offering => (SessionDescription::Offer(sdp), Step::AwaitingAnswer),
                    _ => (SessionDescription::Answer(sdp), Step::AwaitingCandidates),
                };
                let mut effects = vec![Effect::Send(seal(&key, &Signal::Description(description))?)];
                for candidate in std::mem::take(&mut self.outbox) {
                    effects.push(Effect::Send(seal(&key, &Signal::Candidate(candidate))?));
                }
                if step == Step::Answering {
                    effects.push(Effect::ShowFingerprint(key.fingerprint()));
                }
                Ok((
                    Phase::Keyed {
                        slot,
                        key,
                        step: next,
                    },
                    effects,
                ))
            }

            (Phase::Keyed { slot, key, step }, Event::LocalCandidate(candidate))
                if step.description_sent() =>
            {
                let effects = vec![Effect::Send(seal(&key, &Signal::Candidate(candidate))?)];
                Ok((Phase::Keyed { slot, key, step }, effects))
            }

            (phase, Event::LocalCandidate(candidate)) => {
                self.outbox.push(candidate);
                Ok((phase, Vec::new()))
            }

            (phase, Event::LocalDescription(_)) => Err(SignalError::Protocol(format!(
                "local description while {}",
                phase.state()
            ))),
        }
    }

    fn on_signal(
        &mut self,
        key: &SessionKey,
        step: Step,
        signal: Signal,
    ) -> Result<(Step, Vec<Effect>), SignalError> {
        match (step, signal) {
            (_, Signal::Bye) => Err(SignalError::PeerHungUp),

            (Step::AwaitingOffer, Signal::Description(SessionDescription::Offer(sdp))) => {
                Ok((Step::Answering, self.defer(TransportAction::AcceptOffer(sdp))))
            }

            (Step::AwaitingAnswer, Signal::Description(SessionDescription::Answer(sdp))) => {
                let mut effects = self.defer(TransportAction::AcceptAnswer(sdp));
                effects.push(Effect::ShowFingerprint(key.fingerprint()));
                Ok((Step::AwaitingCandidates, effects))
            }

            (Step::Answering | Step::AwaitingCandidates, Signal::Candidate(candidate)) => {
                Ok((step, self.defer(TransportAction::AddCandidate(candidate))))
            }

            (step, Signal::Description(description)) => Err(SignalError::Protocol(format!(
                "unexpected {} while {:?}",
                description.to_payload().kind,
                step
            ))),

            (step, Signal::Candidate(_)) => Err(SignalError::Protocol(format!(
                "unexpected candidate while {step:?}"
            ))),
        }
    }

    fn defer(&mut self, action: TransportAction) -> Vec<Effect> {
        self.deferred
            .defer(action)
            .map(Effect::Transport)
            .into_iter()
            .collect()
    }
}

fn decode_pake(text: &str) -> Result<Vec<u8>, SignalError> {
    URL_SAFE_NO_PAD
        .decode(text.trim())
        .map_err(|err| SignalError::Protocol(format!("invalid key exchange message: {err}")))
}

fn seal(key: &SessionKey, signal: &Signal) -> Result<String, SignalError> {
    let sealed = key
        .seal(&signal.to_json()?)
        .map_err(|err| SignalError::Protocol(err.to_string()))?;
    Ok(URL_SAFE_NO_PAD.encode(sealed))
}

fn open(key: &SessionKey, text: &str) -> Result<Signal, SignalError> {
    let sealed = URL_SAFE_NO_PAD
        .decode(text.trim())
        .map_err(|_| SignalError::BadKey)?;
    let plain = key.open(&sealed).map_err(|_| SignalError::BadKey)?;
    Signal::from_json(&plain)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Spake2Exchange;

    const CREATOR_ANNOUNCEMENT: &str =
        r#"{"slot":7,"iceServers":[{"URLs":["stun:stun.example.org"]}]}"#;
    const JOINER_ANNOUNCEMENT: &str = r#"{"iceServers":[{"URLs":["stun:stun.example.org"]}]}"#;

    fn oracle() -> Arc<dyn KeyExchange> {
        Arc::new(Spake2Exchange)
    }

    fn sends(effects: &[Effect]) -> Vec<String> {
        effects
            .iter()
            .filter_map(|effect| match effect {
                Effect::Send(text) => Some(text.clone()),
                _ => None,
            })
            .collect()
    }

    fn transport_actions(effects: &[Effect]) -> Vec<TransportAction> {
        effects
            .iter()
            .filter_map(|effect| match effect {
                Effect::Transport(action) => Some(action.clone()),
                _ => None,
            })
            .collect()
    }

    fn only_send(effects: &[Effect]) -> String {
        let sent = sends(effects);
        assert_eq!(sent.len(), 1, "expected one message in {effects:?}");
        sent[0].clone()
    }

    /// Runs both sides through the key exchange and returns them keyed, with
    /// the creator awaiting the offer and the joiner about to make one.
    fn keyed_pair(creator_secret: &[u8], joiner_secret: &[u8]) -> (Handshake, Handshake) {
        let mut creator = Handshake::creator(creator_secret.to_vec(), oracle());
        let joiner_code = code::encode(7, joiner_secret);
        let mut joiner = Handshake::joiner(&joiner_code, oracle()).expect("valid code");

        let effects = creator.handle(Event::Inbound(CREATOR_ANNOUNCEMENT.into()));
        assert!(effects.contains(&Effect::ShowCode(code::encode(7, creator_secret))));
        assert_eq!(creator.state(), HandshakeState::AwaitingPakeMsg1);

        let effects = joiner.handle(Event::Inbound(JOINER_ANNOUNCEMENT.into()));
        assert!(matches!(effects[0], Effect::ConfigureTransport(ref servers) if servers.len() == 1));
        let first = only_send(&effects);
        assert_eq!(joiner.state(), HandshakeState::AwaitingPakeMsg2);

        let second = only_send(&creator.handle(Event::Inbound(first)));
        assert_eq!(creator.state(), HandshakeState::AwaitingOffer);

        let effects = joiner.handle(Event::Inbound(second));
        // Transport not ready yet, so the offer waits.
        assert!(effects.is_empty());
        assert_eq!(joiner.state(), HandshakeState::Offering);
        (creator, joiner)
    }

    #[test]
    fn matching_codes_reach_awaiting_candidates_with_equal_fingerprints() {
        let (mut creator, mut joiner) = keyed_pair(&[0x01, 0x02], &[0x01, 0x02]);

        let effects = joiner.handle(Event::TransportReady);
        assert_eq!(transport_actions(&effects), vec![TransportAction::CreateOffer]);
        let offer = only_send(&joiner.handle(Event::LocalDescription("offer-sdp".into())));
        assert_eq!(joiner.state(), HandshakeState::AwaitingAnswer);

        assert!(creator.handle(Event::TransportReady).is_empty());
        let effects = creator.handle(Event::Inbound(offer));
        assert_eq!(
            transport_actions(&effects),
            vec![TransportAction::AcceptOffer("offer-sdp".into())]
        );
        assert_eq!(creator.state(), HandshakeState::Answering);

        let effects = creator.handle(Event::LocalDescription("answer-sdp".into()));
        let answer = only_send(&effects);
        let creator_fingerprint = effects
            .iter()
            .find_map(|effect| match effect {
                Effect::ShowFingerprint(fp) => Some(fp.clone()),
                _ => None,
            })
            .expect("creator fingerprint");
        assert_eq!(creator.state(), HandshakeState::AwaitingCandidates);

        let effects = joiner.handle(Event::Inbound(answer));
        assert_eq!(
            effects,
            vec![
                Effect::Transport(TransportAction::AcceptAnswer("answer-sdp".into())),
                Effect::ShowFingerprint(creator_fingerprint),
            ]
        );
        assert_eq!(joiner.state(), HandshakeState::AwaitingCandidates);
    }

    #[test]
    fn candidates_before_transport_ready_are_applied_in_order() {
        let (mut creator, mut joiner) = keyed_pair(b"pw", b"pw");
        joiner.handle(Event::TransportReady);
        let offer = only_send(&joiner.handle(Event::LocalDescription("offer-sdp".into())));

        let candidate = |n: u8| CandidateInit {
            candidate: format!("candidate:{n} 1 udp 1 10.0.0.{n} 9 typ host"),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        };
        let c1 = only_send(&joiner.handle(Event::LocalCandidate(candidate(1))));
        let c2 = only_send(&joiner.handle(Event::LocalCandidate(candidate(2))));

        assert!(creator.handle(Event::Inbound(offer)).is_empty());
        assert!(creator.handle(Event::Inbound(c1)).is_empty());
        assert!(creator.handle(Event::Inbound(c2)).is_empty());
        assert_eq!(creator.state(), HandshakeState::Answering);

        let effects = creator.handle(Event::TransportReady);
        assert_eq!(
            transport_actions(&effects),
            vec![
                TransportAction::AcceptOffer("offer-sdp".into()),
                TransportAction::AddCandidate(candidate(1)),
                TransportAction::AddCandidate(candidate(2)),
            ]
        );
    }

    #[test]
    fn local_candidates_wait_for_the_local_description() {
        let (_creator, mut joiner) = keyed_pair(b"pw", b"pw");
        joiner.handle(Event::TransportReady);
        let early = CandidateInit {
            candidate: "candidate:9 1 udp 1 192.0.2.9 9 typ host".into(),
            ..Default::default()
        };
        assert!(joiner.handle(Event::LocalCandidate(early)).is_empty());
        let effects = joiner.handle(Event::LocalDescription("offer-sdp".into()));
        assert_eq!(sends(&effects).len(), 2);
    }

    #[test]
    fn mismatched_codes_end_in_bad_key() {
        let (mut creator, mut joiner) = keyed_pair(&[0x01, 0x02], &[0x01, 0x03]);
        joiner.handle(Event::TransportReady);
        let offer = only_send(&joiner.handle(Event::LocalDescription("offer-sdp".into())));

        let effects = creator.handle(Event::Inbound(offer));
        assert_eq!(creator.state(), HandshakeState::Error);
        assert!(transport_actions(&effects).is_empty());
        assert!(effects.contains(&Effect::Fail(SignalError::BadKey)));
        assert_eq!(effects.last(), Some(&Effect::Close(CloseCode::BadKey)));
        // The creator still holds its own key, so it says goodbye.
        assert_eq!(sends(&effects).len(), 1);
    }

    #[test]
    fn error_absorbs_everything() {
        let mut creator = Handshake::creator(vec![1, 2], oracle());
        let effects = creator.handle(Event::Inbound("not json".into()));
        assert_eq!(creator.state(), HandshakeState::Error);
        assert!(matches!(effects[0], Effect::Fail(SignalError::Protocol(_))));
        assert_eq!(effects[1], Effect::Close(CloseCode::BadKey));

        let later = [
            Event::Inbound(CREATOR_ANNOUNCEMENT.into()),
            Event::TransportReady,
            Event::LocalDescription("sdp".into()),
            Event::LocalCandidate(CandidateInit::default()),
            Event::Connected(PathClass::Direct),
            Event::TransportFailed,
        ];
        for event in later {
            assert!(creator.handle(event).is_empty());
            assert_eq!(creator.state(), HandshakeState::Error);
        }
    }

    #[test]
    fn unexpected_messages_fail_without_touching_the_transport() {
        let (_, mut joiner) = keyed_pair(b"pw", b"pw");
        joiner.handle(Event::TransportReady);
        joiner.handle(Event::LocalDescription("offer-sdp".into()));
        let effects = joiner.handle(Event::Inbound("garbage".into()));
        assert_eq!(joiner.state(), HandshakeState::Error);
        assert!(transport_actions(&effects).is_empty());
        assert!(effects.contains(&Effect::Fail(SignalError::BadKey)));

        // A creator that already answered sees the offer a second time.
        let (mut creator, mut joiner) = keyed_pair(b"pw", b"pw");
        creator.handle(Event::TransportReady);
        joiner.handle(Event::TransportReady);
        let offer = only_send(&joiner.handle(Event::LocalDescription("offer-sdp".into())));
        creator.handle(Event::Inbound(offer.clone()));
        creator.handle(Event::LocalDescription("answer-sdp".into()));
        assert_eq!(creator.state(), HandshakeState::AwaitingCandidates);

        let effects = creator.handle(Event::Inbound(offer));
        assert_eq!(creator.state(), HandshakeState::Error);
        assert!(transport_actions(&effects).is_empty());
        assert!(matches!(effects[1], Effect::Fail(SignalError::Protocol(_))));
    }

    #[test]
    fn joiner_rejects_candidates_before_the_answer() {
        let (mut creator, mut joiner) = keyed_pair(b"pw", b"pw");
        creator.handle(Event::TransportReady);
        joiner.handle(Event::TransportReady);
        let offer = only_send(&joiner.handle(Event::LocalDescription("offer-sdp".into())));
        creator.handle(Event::Inbound(offer));
        // The answer is held back so the candidate reaches the joiner first.
        creator.handle(Event::LocalDescription("answer-sdp".into()));
        let candidate = only_send(&creator.handle(Event::LocalCandidate(CandidateInit {
            candidate: "candidate:1 1 udp 1 10.0.0.1 9 typ host".into(),
            ..Default::default()
        })));

        let effects = joiner.handle(Event::Inbound(candidate));
        assert_eq!(joiner.state(), HandshakeState::Error);
        assert!(transport_actions(&effects).is_empty());
    }

    #[test]
    fn bye_from_peer_closes_with_peer_hung_up() {
        let (mut creator, mut joiner) = keyed_pair(b"pw", b"pw");
        joiner.handle(Event::TransportReady);
        let offer = only_send(&joiner.handle(Event::LocalDescription("offer-sdp".into())));
        // A creator that hits a local error says goodbye.
        creator.handle(Event::TransportReady);
        creator.handle(Event::Inbound(offer));
        creator.handle(Event::LocalDescription("answer-sdp".into()));
        let effects = creator.handle(Event::LocalDescription("again".into()));
        let bye = only_send(&effects);

        let effects = joiner.handle(Event::Inbound(bye));
        assert_eq!(joiner.state(), HandshakeState::Error);
        assert_eq!(
            effects,
            vec![
                Effect::Fail(SignalError::PeerHungUp),
                Effect::Close(CloseCode::PeerHungUp),
            ]
        );
    }

    #[test]
    fn closer_runs_once_with_path_specific_code() {
        let (mut creator, _) = keyed_pair(b"pw", b"pw");
        assert_eq!(
            creator.handle(Event::Connected(PathClass::Relay)),
            vec![Effect::Close(CloseCode::SuccessRelay)]
        );
        assert!(creator.handle(Event::Connected(PathClass::Direct)).is_empty());
        assert!(creator.is_closed());

        let (_, mut joiner) = keyed_pair(b"pw", b"pw");
        assert_eq!(
            joiner.handle(Event::Connected(PathClass::Unknown)),
            vec![Effect::Close(CloseCode::Success)]
        );
    }

    #[test]
    fn transport_failure_closes_with_transport_failed() {
        let (_, mut joiner) = keyed_pair(b"pw", b"pw");
        let effects = joiner.handle(Event::TransportFailed);
        assert_eq!(joiner.state(), HandshakeState::Error);
        assert!(sends(&effects).is_empty());
        assert_eq!(effects.last(), Some(&Effect::Close(CloseCode::TransportFailed)));
    }

    #[test]
    fn creator_announcement_must_carry_a_slot() {
        let mut creator = Handshake::creator(vec![1, 2], oracle());
        creator.handle(Event::Inbound(JOINER_ANNOUNCEMENT.into()));
        assert_eq!(creator.state(), HandshakeState::Error);
        assert_eq!(creator.slot(), None);
    }

    #[test]
    fn malformed_code_is_rejected_up_front() {
        assert!(matches!(
            Handshake::joiner("7-l0l0", oracle()),
            Err(SignalError::Code(_))
        ));
    }
}
