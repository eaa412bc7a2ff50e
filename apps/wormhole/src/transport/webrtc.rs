use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{Notify, mpsc, watch};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{API, APIBuilder};
use webrtc::data_channel::RTCDataChannel;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::ice::candidate::{CandidatePairState, CandidateType};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::stats::StatsReportType;

use super::{
    CandidateKind, PathClass, TransportError, TransportEvent, TransportFactory, TransportProvider,
    classify,
};
use crate::config::PipeConfig;
use crate::pump::{Frame, Pipe, PipeChannel, PumpError};
use crate::signal::{CandidateInit, IceServer};

/// Text message that ends one direction of the pipe. Pipe data always
/// travels as binary messages.
///
/// This marker is an addition to the plain rtcpipe wire protocol, which has
/// no half-close: drain drops every text payload as end of stream, and a peer
/// that does not know the marker would copy `eof` into its output. It is kept
/// deliberately, since a zero-length binary message reads as a channel close
/// in webrtc-rs and a channel close would also stop the local send side.
const END_OF_STREAM: &str = "eof";

type OpenState = watch::Sender<Option<Result<(), TransportError>>>;

fn build_api() -> Result<API, TransportError> {
    let mut media_engine = MediaEngine::default();
    media_engine
        .register_default_codecs()
        .map_err(to_setup_error)?;

    let mut registry = Registry::new();
    registry =
        register_default_interceptors(registry, &mut media_engine).map_err(to_setup_error)?;

    Ok(APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build())
}

/// First result wins; later ones are dropped.
fn settle(opened: &OpenState, result: Result<(), TransportError>) {
    opened.send_if_modified(move |state| {
        if state.is_some() {
            return false;
        }
        *state = Some(result);
        true
    });
}

#[derive(Clone, Debug, Default)]
pub struct RtcFactory {
    pipe: PipeConfig,
}

impl RtcFactory {
    pub fn new(pipe: PipeConfig) -> Self {
        Self { pipe }
    }
}

#[async_trait]
impl TransportFactory for RtcFactory {
    type Transport = RtcPeer;

    async fn create(
        &self,
        ice_servers: &[IceServer],
        trickle: bool,
    ) -> Result<RtcPeer, TransportError> {
        RtcPeer::new(ice_servers, trickle, &self.pipe).await
    }
}

/// One WebRTC peer connection carrying a single pre-negotiated data channel.
pub struct RtcPeer {
    pc: Arc<RTCPeerConnection>,
    channel: Arc<RTCDataChannel>,
    trickle: bool,
    opened: Arc<OpenState>,
    events: Mutex<Option<mpsc::UnboundedReceiver<TransportEvent>>>,
    inbound: Mutex<Option<mpsc::UnboundedReceiver<Frame>>>,
    low_water: Arc<Notify>,
    pipe: PipeConfig,
}

impl RtcPeer {
    pub async fn new(
        ice_servers: &[IceServer],
        trickle: bool,
        pipe: &PipeConfig,
    ) -> Result<Self, TransportError> {
        let api = build_api()?;
        let config = RTCConfiguration {
            ice_servers: ice_servers
                .iter()
                .map(|server| RTCIceServer {
                    urls: server.urls.clone(),
                    username: server.username.clone(),
                    credential: server.credential.clone(),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        };
        let pc = Arc::new(
            api.new_peer_connection(config)
                .await
                .map_err(to_setup_error)?,
        );

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (opened, _) = watch::channel(None);
        let opened = Arc::new(opened);
        let low_water = Arc::new(Notify::new());

        let candidate_events = events_tx.clone();
        pc.on_ice_candidate(Box::new(move |candidate| {
            let events = candidate_events.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    return;
                };
                if !trickle {
                    return;
                }
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = events.send(TransportEvent::LocalCandidate(CandidateInit {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                            username_fragment: init.username_fragment,
                        }));
                    }
                    Err(err) => {
                        tracing::warn!(target = "wormhole::webrtc", error = %err, "could not encode local candidate");
                    }
                }
            })
        }));

        let state_events = events_tx;
        let opened_on_failure = opened.clone();
        pc.on_peer_connection_state_change(Box::new(move |state| {
            let events = state_events.clone();
            let opened = opened_on_failure.clone();
            Box::pin(async move {
                tracing::debug!(target = "wormhole::webrtc", ?state, "peer connection state changed");
                match state {
                    RTCPeerConnectionState::Connected => {
                        let _ = events.send(TransportEvent::Connected);
                    }
                    RTCPeerConnectionState::Failed => {
                        let _ = events.send(TransportEvent::Failed);
                        settle(&opened, Err(TransportError::Failed("peer connection failed".into())));
                    }
                    _ => {}
                }
            })
        }));

        let init = RTCDataChannelInit {
            ordered: Some(true),
            negotiated: Some(pipe.channel_id),
            ..Default::default()
        };
        let channel = pc
            .create_data_channel(&pipe.label, Some(init))
            .await
            .map_err(to_setup_error)?;

        let opened_on_open = opened.clone();
        channel.on_open(Box::new(move || {
            let opened = opened_on_open.clone();
            Box::pin(async move {
                tracing::debug!(target = "wormhole::webrtc", "data channel opened");
                settle(&opened, Ok(()));
            })
        }));

        let opened_on_close = opened.clone();
        let close_tx = inbound_tx.clone();
        channel.on_close(Box::new(move || {
            let opened = opened_on_close.clone();
            let inbound = close_tx.clone();
            Box::pin(async move {
                tracing::debug!(target = "wormhole::webrtc", "data channel closed");
                settle(&opened, Err(TransportError::ChannelClosed));
                let _ = inbound.send(Frame::End);
            })
        }));

        let opened_on_error = opened.clone();
        let error_tx = inbound_tx.clone();
        channel.on_error(Box::new(move |err: webrtc::Error| {
            let opened = opened_on_error.clone();
            let inbound = error_tx.clone();
            Box::pin(async move {
                channel_error(&opened, &inbound, &err.to_string());
            })
        }));

        channel.on_message(Box::new(move |msg: DataChannelMessage| {
            let inbound = inbound_tx.clone();
            Box::pin(async move {
                let frame = if msg.is_string {
                    Frame::End
                } else {
                    Frame::Data(msg.data)
                };
                let _ = inbound.send(frame);
            })
        }));

        channel
            .set_buffered_amount_low_threshold(pipe.pump.low_water_mark)
            .await;
        let low_water_signal = low_water.clone();
        channel
            .on_buffered_amount_low(Box::new(move || {
                let notify = low_water_signal.clone();
                Box::pin(async move {
                    notify.notify_one();
                })
            }))
            .await;

        Ok(Self {
            pc,
            channel,
            trickle,
            opened,
            events: Mutex::new(Some(events_rx)),
            inbound: Mutex::new(Some(inbound_rx)),
            low_water,
            pipe: pipe.clone(),
        })
    }

    /// Hands the open data channel to the pump. Only the first call succeeds.
    pub fn take_pipe(&self) -> Result<Pipe<RtcChannel>, TransportError> {
        let inbound = self
            .inbound
            .lock()
            .take()
            .ok_or(TransportError::ChannelClosed)?;
        let channel = RtcChannel {
            channel: self.channel.clone(),
            pc: self.pc.clone(),
        };
        Ok(Pipe::new(
            channel,
            inbound,
            self.low_water.clone(),
            self.pipe.pump.clone(),
        ))
    }

    async fn set_local(&self, description: RTCSessionDescription) -> Result<String, TransportError> {
        let gather = if self.trickle {
            None
        } else {
            Some(self.pc.gathering_complete_promise().await)
        };
        self.pc
            .set_local_description(description)
            .await
            .map_err(to_negotiation_error)?;
        if let Some(mut gather) = gather {
            tracing::trace!(target = "wormhole::webrtc", "waiting for candidate gathering");
            let _ = gather.recv().await;
        }
        self.pc
            .local_description()
            .await
            .map(|description| description.sdp)
            .ok_or_else(|| TransportError::Negotiation("failed to obtain local description".into()))
    }
}

#[async_trait]
impl TransportProvider for RtcPeer {
    async fn create_offer(&self) -> Result<String, TransportError> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(to_negotiation_error)?;
        self.set_local(offer).await
    }

    async fn accept_offer(&self, sdp: &str) -> Result<String, TransportError> {
        let offer = RTCSessionDescription::offer(sdp.to_owned()).map_err(to_negotiation_error)?;
        self.pc
            .set_remote_description(offer)
            .await
            .map_err(to_negotiation_error)?;
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(to_negotiation_error)?;
        self.set_local(answer).await
    }

    async fn accept_answer(&self, sdp: &str) -> Result<(), TransportError> {
        let answer = RTCSessionDescription::answer(sdp.to_owned()).map_err(to_negotiation_error)?;
        self.pc
            .set_remote_description(answer)
            .await
            .map_err(to_negotiation_error)
    }

    async fn add_candidate(&self, candidate: CandidateInit) -> Result<(), TransportError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        };
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(to_negotiation_error)
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<TransportEvent>> {
        self.events.lock().take()
    }

    async fn wait_open(&self) -> Result<(), TransportError> {
        let mut rx = self.opened.subscribe();
        let state = rx
            .wait_for(Option::is_some)
            .await
            .map_err(|_| TransportError::ChannelClosed)?;
        (*state).clone().unwrap_or(Err(TransportError::ChannelClosed))
    }

    async fn path_class(&self) -> PathClass {
        let report = self.pc.get_stats().await;
        let mut kinds = HashMap::new();
        let mut selected: Option<(String, String)> = None;
        for stat in report.reports.values() {
            match stat {
                StatsReportType::LocalCandidate(candidate)
                | StatsReportType::RemoteCandidate(candidate) => {
                    kinds.insert(candidate.id.clone(), candidate_kind(candidate.candidate_type));
                }
                StatsReportType::CandidatePair(pair)
                    if pair.state == CandidatePairState::Succeeded =>
                {
                    if selected.is_none() || pair.nominated {
                        selected = Some((
                            pair.local_candidate_id.clone(),
                            pair.remote_candidate_id.clone(),
                        ));
                    }
                }
                _ => {}
            }
        }

        let Some((local, remote)) = selected else {
            return PathClass::Unknown;
        };
        let kind = |id: &str| kinds.get(id).copied().unwrap_or(CandidateKind::Unknown);
        classify(kind(&local), kind(&remote))
    }

    async fn close(&self) {
        if let Err(err) = self.channel.close().await {
            tracing::debug!(target = "wormhole::webrtc", error = %err, "data channel close failed");
        }
        if let Err(err) = self.pc.close().await {
            tracing::debug!(target = "wormhole::webrtc", error = %err, "peer connection close failed");
        }
    }
}

/// A failed data channel fails a pending open and ends the inbound stream.
fn channel_error(opened: &OpenState, inbound: &mpsc::UnboundedSender<Frame>, err: &str) {
    tracing::warn!(target = "wormhole::webrtc", error = %err, "data channel error");
    settle(
        opened,
        Err(TransportError::Failed(format!("data channel error: {err}"))),
    );
    let _ = inbound.send(Frame::End);
}

fn candidate_kind(candidate_type: CandidateType) -> CandidateKind {
    match candidate_type {
        CandidateType::Host => CandidateKind::Host,
        CandidateType::ServerReflexive => CandidateKind::ServerReflexive,
        CandidateType::PeerReflexive => CandidateKind::PeerReflexive,
        CandidateType::Relay => CandidateKind::Relay,
        _ => CandidateKind::Unknown,
    }
}

/// Send half of an [`RtcPeer`]'s data channel, as driven by the pump.
pub struct RtcChannel {
    channel: Arc<RTCDataChannel>,
    pc: Arc<RTCPeerConnection>,
}

#[async_trait]
impl PipeChannel for RtcChannel {
    async fn write(&self, chunk: Bytes) -> Result<usize, PumpError> {
        self.channel
            .send(&chunk)
            .await
            .map_err(|err| PumpError::Write(err.to_string()))
    }

    async fn finish(&self) -> Result<(), PumpError> {
        self.channel
            .send_text(END_OF_STREAM.to_string())
            .await
            .map(|_| ())
            .map_err(|err| PumpError::Write(err.to_string()))
    }

    async fn buffered_amount(&self) -> usize {
        self.channel.buffered_amount().await
    }

    async fn close_channel(&self) -> Result<(), PumpError> {
        self.channel
            .close()
            .await
            .map_err(|err| PumpError::Write(err.to_string()))
    }

    async fn close_connection(&self) -> Result<(), PumpError> {
        self.pc
            .close()
            .await
            .map_err(|err| PumpError::Write(err.to_string()))
    }
}

fn to_setup_error<E: std::fmt::Display>(err: E) -> TransportError {
    TransportError::Setup(err.to_string())
}

fn to_negotiation_error<E: std::fmt::Display>(err: E) -> TransportError {
    TransportError::Negotiation(err.to_string())
}
