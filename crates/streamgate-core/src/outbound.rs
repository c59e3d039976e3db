//! Outbound frame emission with payload overflow
//!
//! Everything written back to the client goes through [`Outbound`]. Frames
//! are serialized here and queued for the single transport writer. Results
//! and stream events whose serialized form exceeds the threshold are parked
//! in the [`PayloadStore`] and replaced by a `largePayloadId` reference.
//! Oversized error frames are abridged instead, so nothing queued here can
//! exceed the transport's frame ceiling.

use bytes::Bytes;
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::{excerpt, GatewayError, Result};
use crate::payload_store::PayloadStore;
use crate::protocol::{Outcome, PushFrame, RequestId, ResponseFrame};

const JSON_CONTENT_TYPE: &str = "application/json";

/// Cloneable handle for queueing frames to the client
#[derive(Clone)]
pub struct Outbound {
    tx: mpsc::Sender<Bytes>,
    payloads: Arc<PayloadStore>,
    threshold: usize,
}

impl Outbound {
    pub fn new(tx: mpsc::Sender<Bytes>, payloads: Arc<PayloadStore>, threshold: usize) -> Self {
        Self {
            tx,
            payloads,
            threshold,
        }
    }

    /// Create a handle together with the receiver the transport writer drains
    pub fn channel(
        depth: usize,
        payloads: Arc<PayloadStore>,
        threshold: usize,
    ) -> (Self, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(depth);
        (Self::new(tx, payloads, threshold), rx)
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    pub fn payloads(&self) -> &Arc<PayloadStore> {
        &self.payloads
    }

    /// Whether a body of this size has to go through the payload store
    pub fn exceeds_threshold(&self, size: usize) -> bool {
        size > self.threshold
    }

    /// Answer a request
    pub async fn respond(&self, id: Option<RequestId>, result: Result<Value>) -> Result<()> {
        let frame = ResponseFrame::from_result(id, result);
        let body = serde_json::to_vec(&frame)?;
        if !self.exceeds_threshold(body.len()) {
            return self.send(body).await;
        }

        let ResponseFrame { id, outcome } = frame;
        match outcome {
            Outcome::Success { result } => {
                let stored = self.divert(&result)?;
                info!(request_id = ?id, payload_id = %stored.0, size = stored.1, "Diverted oversized response");
                self.send_frame(&ResponseFrame::success(id, large_payload_ref(stored)))
                    .await
            }
            Outcome::Failure { error, code } => {
                warn!(request_id = ?id, code, size = body.len(), "Abridging oversized error response");
                self.send_frame(&ResponseFrame {
                    id,
                    outcome: Outcome::Failure {
                        error: excerpt(&error).into_owned(),
                        code,
                    },
                })
                .await
            }
        }
    }

    /// Push an unsolicited subscription frame
    pub async fn push(&self, frame: PushFrame) -> Result<()> {
        let body = serde_json::to_vec(&frame)?;
        if !self.exceeds_threshold(body.len()) {
            return self.send(body).await;
        }

        match frame {
            PushFrame::StreamEvent {
                subscription_id,
                event: Some(event),
                ..
            } => {
                let (payload_id, size) = self.divert(&event)?;
                info!(%subscription_id, %payload_id, size, "Diverted oversized stream event");
                self.send_frame(&PushFrame::StreamEvent {
                    subscription_id,
                    event: None,
                    large_payload_id: Some(payload_id),
                })
                .await
            }
            PushFrame::StreamError {
                subscription_id,
                error,
                code,
            } => {
                warn!(%subscription_id, code, size = body.len(), "Abridging oversized stream error");
                self.send_frame(&PushFrame::StreamError {
                    subscription_id,
                    error: excerpt(&error).into_owned(),
                    code,
                })
                .await
            }
            PushFrame::StreamEnd {
                subscription_id,
                reason,
            } => {
                self.send_frame(&PushFrame::StreamEnd {
                    subscription_id,
                    reason: reason.map(|r| excerpt(&r).into_owned()),
                })
                .await
            }
            frame @ PushFrame::StreamEvent { event: None, .. } => self.send_frame(&frame).await,
        }
    }

    fn divert(&self, value: &Value) -> Result<(String, usize)> {
        let bytes = serde_json::to_vec(value)?;
        let size = bytes.len();
        let id = self.payloads.put_typed(Bytes::from(bytes), JSON_CONTENT_TYPE);
        Ok((id, size))
    }

    async fn send_frame<T: Serialize>(&self, frame: &T) -> Result<()> {
        self.send(serde_json::to_vec(frame)?).await
    }

    async fn send(&self, body: Vec<u8>) -> Result<()> {
        debug!(size = body.len(), "Queueing outbound frame");
        self.tx
            .send(Bytes::from(body))
            .await
            .map_err(|_| GatewayError::transport("outbound writer has shut down"))
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Reference placed in a frame in place of an oversized body
pub fn large_payload_ref((id, size): (String, usize)) -> Value {
    json!({ "largePayloadId": id, "size": size })
}
