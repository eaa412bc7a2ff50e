//! One-shot signaling for the bulk pipe: post an offer to `<broker><slot>` and
//! read the peer's description from the response.
//!
//! When both sides post offers at the same time the broker hands one of them
//! the other's offer. That side throws its endpoint away, answers the offer
//! with a fresh one, and posts the answer back.

use reqwest::Client;

use super::{DescriptionPayload, IceServer, SessionDescription, SignalError};
use crate::transport::{TransportFactory, TransportProvider};

pub struct MinsigClient {
    http: Client,
    base: String,
}

impl MinsigClient {
    pub fn new(base: impl Into<String>) -> Self {
        Self {
            http: Client::new(),
            base: base.into(),
        }
    }

    fn endpoint(&self, slot: &str) -> String {
        format!("{}{}", self.base, slot)
    }

    /// Exchanges descriptions for `slot` and blocks until the data channel
    /// opens or the connection fails. There is no deadline.
    pub async fn dial<F: TransportFactory>(
        &self,
        factory: &F,
        slot: &str,
        ice_servers: &[IceServer],
    ) -> Result<F::Transport, SignalError> {
        let mut transport = factory.create(ice_servers, false).await?;
        let offer = transport.create_offer().await?;
        let reply = self
            .post(slot, &SessionDescription::Offer(offer).to_payload())
            .await?;
        let reply = reply.ok_or_else(|| {
            SignalError::Protocol("broker returned no description for the offer".into())
        })?;

        match SessionDescription::from_payload(reply)? {
            SessionDescription::Answer(sdp) => {
                tracing::debug!(target = "wormhole::minsig", slot, "received answer");
                transport.accept_answer(&sdp).await?;
            }
            SessionDescription::Offer(sdp) => {
                // No rollback support, so start over with a clean endpoint.
                tracing::debug!(
                    target = "wormhole::minsig",
                    slot,
                    "offer collision; answering the peer's offer instead"
                );
                transport.close().await;
                transport = factory.create(ice_servers, false).await?;
                let answer = transport.accept_offer(&sdp).await?;
                self.post(slot, &SessionDescription::Answer(answer).to_payload())
                    .await?;
            }
        }

        tracing::trace!(target = "wormhole::minsig", slot, await = "wait_open", state = "start");
        let opened = transport.wait_open().await;
        tracing::trace!(
            target = "wormhole::minsig",
            slot,
            await = "wait_open",
            state = "end",
            result = ?opened
        );
        opened?;
        Ok(transport)
    }

    /// Posts one description. The body of a successful response, if any, is
    /// the peer's description.
    async fn post(
        &self,
        slot: &str,
        payload: &DescriptionPayload,
    ) -> Result<Option<DescriptionPayload>, SignalError> {
        let url = self.endpoint(slot);
        tracing::trace!(
            target = "wormhole::minsig",
            url = %url,
            kind = %payload.kind,
            await = "client.send",
            state = "start"
        );
        let send_attempt = self.http.post(&url).json(payload).send().await;
        tracing::trace!(
            target = "wormhole::minsig",
            url = %url,
            await = "client.send",
            state = "end",
            result = ?send_attempt.as_ref().map(reqwest::Response::status)
        );
        let response = send_attempt.map_err(|err| SignalError::Broker(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(SignalError::Broker(format!(
                "unexpected signaling status {status}"
            )));
        }

        let body = response
            .bytes()
            .await
            .map_err(|err| SignalError::Broker(err.to_string()))?;
        if body.iter().all(u8::is_ascii_whitespace) {
            return Ok(None);
        }
        Ok(Some(serde_json::from_slice(&body)?))
    }
}
