//! PAKE-authenticated rendezvous over a persistent websocket.
//!
//! A single loop owns the socket, the transport endpoint and the
//! [`Handshake`]. Broker messages, transport creation and transport events
//! are turned into handshake events in arrival order, and the effects that
//! come back are carried out before the next event is read.

use std::collections::VecDeque;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::SEC_WEBSOCKET_PROTOCOL;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode as WsCloseCode;
use url::Url;

use super::{CloseCode, IceServer, PROTOCOL_VERSION, SignalError};
use crate::crypto::KeyExchange;
use crate::handshake::{Effect, Event, Handshake, HandshakeState, TransportAction};
use crate::transport::{PathClass, TransportError, TransportEvent, TransportFactory, TransportProvider};

/// Things the user should see while the handshake runs.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Notice {
    /// Code to pass to the other side (slot creator only).
    Code(String),
    /// Value both users can compare to rule out a man in the middle.
    Fingerprint(String),
}

/// Result of a completed rendezvous: a connected transport and the close
/// code that was sent to the broker.
pub struct Established<T> {
    pub transport: Arc<T>,
    pub fingerprint: Option<String>,
    pub close: CloseCode,
}

pub struct Rendezvous<F> {
    broker: String,
    factory: Arc<F>,
    oracle: Arc<dyn KeyExchange>,
    fallback_ice: Vec<IceServer>,
}

impl<F> Rendezvous<F>
where
    F: TransportFactory + 'static,
{
    pub fn new(broker: impl Into<String>, factory: F, oracle: Arc<dyn KeyExchange>) -> Self {
        let mut broker = broker.into();
        if !broker.ends_with('/') {
            broker.push('/');
        }
        Self {
            broker,
            factory: Arc::new(factory),
            oracle,
            fallback_ice: Vec::new(),
        }
    }

    /// ICE servers to use when the broker's announcement carries none.
    pub fn with_fallback_ice(mut self, ice_servers: Vec<IceServer>) -> Self {
        self.fallback_ice = ice_servers;
        self
    }

    /// Asks the broker for a new slot. The code to share arrives as a
    /// [`Notice::Code`] before the peer shows up.
    pub async fn create(
        &self,
        secret: Vec<u8>,
        notices: mpsc::UnboundedSender<Notice>,
    ) -> Result<Established<F::Transport>, SignalError> {
        let handshake = Handshake::creator(secret, self.oracle.clone());
        let url = self.endpoint(None)?;
        self.drive(handshake, url.as_str(), notices).await
    }

    pub async fn join(
        &self,
        code: &str,
        notices: mpsc::UnboundedSender<Notice>,
    ) -> Result<Established<F::Transport>, SignalError> {
        let handshake = Handshake::joiner(code, self.oracle.clone())?;
        let slot = handshake
            .slot()
            .ok_or_else(|| SignalError::Protocol("joiner without a slot".into()))?;
        let url = self.endpoint(Some(slot))?;
        self.drive(handshake, url.as_str(), notices).await
    }

    fn endpoint(&self, slot: Option<u64>) -> Result<Url, SignalError> {
        let base = Url::parse(&self.broker)
            .map_err(|err| SignalError::Broker(format!("invalid broker url: {err}")))?;
        match slot {
            None => Ok(base),
            Some(slot) => base
                .join(&slot.to_string())
                .map_err(|err| SignalError::Broker(format!("invalid broker url: {err}"))),
        }
    }

    async fn drive(
        &self,
        mut handshake: Handshake,
        url: &str,
        notices: mpsc::UnboundedSender<Notice>,
    ) -> Result<Established<F::Transport>, SignalError> {
        let role = handshake.role();
        let mut request = url
            .into_client_request()
            .map_err(|err| SignalError::Broker(err.to_string()))?;
        request.headers_mut().insert(
            SEC_WEBSOCKET_PROTOCOL,
            HeaderValue::from_static(PROTOCOL_VERSION),
        );
        tracing::debug!(target = "wormhole::rendezvous", url, ?role, "connecting to broker");
        let (ws_stream, _) = connect_async(request)
            .await
            .map_err(|err| SignalError::Broker(err.to_string()))?;
        let (mut ws_write, mut ws_read) = ws_stream.split();

        let (created_tx, mut created_rx) = mpsc::unbounded_channel();
        let mut transport: Option<Arc<F::Transport>> = None;
        let mut transport_events: Option<mpsc::UnboundedReceiver<TransportEvent>> = None;
        let mut fingerprint = None;
        let mut failure: Option<SignalError> = None;
        // Set once the broker has gone away after negotiation finished; the
        // transport alone decides the outcome from then on.
        let mut broker_gone: Option<SignalError> = None;

        loop {
            let event = tokio::select! {
                message = ws_read.next(), if broker_gone.is_none() => {
                    let received = match message {
                        Some(Ok(Message::Text(text))) => Ok(Event::Inbound(text)),
                        Some(Ok(Message::Close(frame))) => Err(closed_by_broker(frame)),
                        Some(Ok(_)) => continue,
                        Some(Err(err)) => return Err(SignalError::Broker(err.to_string())),
                        None => Err(SignalError::Closed {
                            code: None,
                            reason: "broker hung up".into(),
                        }),
                    };
                    match received {
                        Ok(event) => event,
                        Err(err) => {
                            if let Some(failure) = failure.take() {
                                return Err(failure);
                            }
                            if !signaling_done(&handshake, transport.is_some())
                                || transport_events.is_none()
                            {
                                return Err(err);
                            }
                            tracing::debug!(
                                target = "wormhole::rendezvous",
                                error = %err,
                                "broker closed after negotiation; waiting for the transport"
                            );
                            broker_gone = Some(err);
                            continue;
                        }
                    }
                },
                created = created_rx.recv(), if transport.is_none() => match created {
                    Some(Ok(created)) => {
                        let created: Arc<F::Transport> = Arc::new(created);
                        transport_events = created.take_events();
                        transport = Some(created);
                        Event::TransportReady
                    }
                    Some(Err(err)) => {
                        tracing::warn!(target = "wormhole::rendezvous", error = %err, "transport setup failed");
                        Event::TransportFailed
                    }
                    None => continue,
                },
                event = next_transport_event(&mut transport_events) => match event {
                    Some(TransportEvent::LocalCandidate(candidate)) => Event::LocalCandidate(candidate),
                    Some(TransportEvent::Connected) => {
                        let path = match &transport {
                            Some(transport) => transport.path_class().await,
                            None => PathClass::Unknown,
                        };
                        tracing::debug!(target = "wormhole::rendezvous", ?path, "transport connected");
                        Event::Connected(path)
                    }
                    Some(TransportEvent::Failed) => Event::TransportFailed,
                    None => {
                        transport_events = None;
                        if let Some(err) = broker_gone.take() {
                            return Err(err);
                        }
                        continue;
                    }
                },
            };

            let mut pending = VecDeque::from([event]);
            while let Some(event) = pending.pop_front() {
                for effect in handshake.handle(event) {
                    match effect {
                        Effect::Send(_) if broker_gone.is_some() => {
                            tracing::debug!(target = "wormhole::rendezvous", "broker gone; dropping outbound message");
                        }
                        Effect::Send(text) => {
                            ws_write
                                .send(Message::Text(text))
                                .await
                                .map_err(|err| SignalError::Broker(err.to_string()))?;
                        }
                        Effect::ShowCode(code) => {
                            let _ = notices.send(Notice::Code(code));
                        }
                        Effect::ShowFingerprint(value) => {
                            fingerprint = Some(value.clone());
                            let _ = notices.send(Notice::Fingerprint(value));
                        }
                        Effect::ConfigureTransport(ice_servers) => {
                            let ice_servers = if ice_servers.is_empty() {
                                self.fallback_ice.clone()
                            } else {
                                ice_servers
                            };
                            let factory = self.factory.clone();
                            let created_tx = created_tx.clone();
                            tokio::spawn(async move {
                                let created = factory.create(&ice_servers, true).await;
                                let _ = created_tx.send(created);
                            });
                        }
                        Effect::Transport(action) => {
                            let Some(transport) = &transport else {
                                // Deferred actions only run once the endpoint exists.
                                continue;
                            };
                            match apply(transport.as_ref(), action).await {
                                Ok(Some(next)) => pending.push_back(next),
                                Ok(None) => {}
                                Err(err) => {
                                    tracing::warn!(target = "wormhole::rendezvous", error = %err, "transport action failed");
                                    pending.push_back(Event::TransportFailed);
                                }
                            }
                        }
                        Effect::Fail(err) => {
                            failure = Some(err);
                        }
                        Effect::Close(code) => {
                            let frame = CloseFrame {
                                code: WsCloseCode::from(code.code()),
                                reason: code.reason().into(),
                            };
                            if broker_gone.is_some() {
                                tracing::debug!(target = "wormhole::rendezvous", "broker gone; close frame not sent");
                            } else if let Err(err) = ws_write.send(Message::Close(Some(frame))).await {
                                tracing::debug!(target = "wormhole::rendezvous", error = %err, "close frame not sent");
                            }
                            tracing::info!(
                                target = "wormhole::rendezvous",
                                code = code.code(),
                                reason = code.reason(),
                                "rendezvous closed"
                            );
                            if let Some(err) = failure.take() {
                                return Err(err);
                            }
                            if let Some(transport) = transport.take() {
                                return Ok(Established {
                                    transport,
                                    fingerprint,
                                    close: code,
                                });
                            }
                            return Err(SignalError::Transport(TransportError::ChannelClosed));
                        }
                    }
                }
                if let Some(err) = failure.take() {
                    return Err(err);
                }
            }
        }
    }
}

/// Negotiation is over once both descriptions have been exchanged and an
/// endpoint exists; later broker traffic only carries extra candidates.
fn signaling_done(handshake: &Handshake, has_transport: bool) -> bool {
    has_transport && handshake.state() == HandshakeState::AwaitingCandidates
}

async fn next_transport_event(
    events: &mut Option<mpsc::UnboundedReceiver<TransportEvent>>,
) -> Option<TransportEvent> {
    match events {
        Some(events) => events.recv().await,
        None => std::future::pending().await,
    }
}

async fn apply<T: TransportProvider + ?Sized>(
    transport: &T,
    action: TransportAction,
) -> Result<Option<Event>, TransportError> {
    match action {
        TransportAction::CreateOffer => Ok(Some(Event::LocalDescription(
            transport.create_offer().await?,
        ))),
        TransportAction::AcceptOffer(sdp) => Ok(Some(Event::LocalDescription(
            transport.accept_offer(&sdp).await?,
        ))),
        TransportAction::AcceptAnswer(sdp) => {
            transport.accept_answer(&sdp).await?;
            Ok(None)
        }
        TransportAction::AddCandidate(candidate) => {
            transport.add_candidate(candidate).await?;
            Ok(None)
        }
    }
}

fn closed_by_broker(frame: Option<CloseFrame<'_>>) -> SignalError {
    match frame {
        Some(frame) => {
            let code = u16::from(frame.code);
            let reason = CloseCode::from_code(code)
                .map(|known| known.reason().to_string())
                .unwrap_or_else(|| frame.reason.to_string());
            SignalError::Closed {
                code: Some(code),
                reason,
            }
        }
        None => SignalError::Closed {
            code: None,
            reason: "broker closed the connection".into(),
        },
    }
}
