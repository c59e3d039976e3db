//! Narrow transport loop
//!
//! Reads length-framed requests from the client and hands them to the
//! [`Router`]; a single writer task drains the outbound queue so frames
//! never interleave. Clean EOF ends the session normally, a framing error
//! ends it with a transport error. Either way the session is shut down.

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use streamgate_core::{FrameCodec, FrameReader, FrameWriter, GatewayError, Result};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::router::Router;
use crate::session::Session;

/// Serve the session over a reader/writer pair until either side closes
pub async fn run<R, W>(
    session: Arc<Session>,
    frames: mpsc::Receiver<Bytes>,
    reader: R,
    writer: W,
) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let transport = &session.config().transport;
    let codec = FrameCodec::new(
        transport.max_inbound_frame_bytes,
        transport.max_outbound_frame_bytes,
    );
    let shutdown = session.shutdown_token();

    let writer_task = tokio::spawn(write_frames(
        FrameWriter::new(writer, codec.clone()),
        frames,
        shutdown.clone(),
    ));

    let mut reader = FrameReader::new(reader, codec);
    let router = Router::new(Arc::clone(&session));
    info!("Transport open");

    let outcome = loop {
        let next = tokio::select! {
            next = reader.next() => next,
            _ = shutdown.cancelled() => {
                break Err(GatewayError::transport("outbound writer stopped"));
            }
        };
        match next {
            Some(Ok(body)) => {
                debug!(size = body.len(), "Inbound frame");
                if let Err(e) = router.dispatch(body).await {
                    break Err(e);
                }
            }
            Some(Err(e)) => {
                error!("Inbound framing error: {e}");
                break Err(e.into());
            }
            None => {
                info!("Client closed the transport");
                break Ok(());
            }
        }
    };

    session.shutdown();
    if let Err(e) = writer_task.await {
        debug!("Writer task ended abnormally: {e}");
    }
    outcome
}

async fn write_frames<W>(
    mut sink: FrameWriter<W>,
    mut frames: mpsc::Receiver<Bytes>,
    shutdown: CancellationToken,
) where
    W: AsyncWrite + Unpin,
{
    loop {
        tokio::select! {
            biased;
            frame = frames.recv() => {
                let Some(frame) = frame else { break };
                if let Err(e) = sink.send(frame).await {
                    error!("Failed to write outbound frame: {e}");
                    break;
                }
            }
            _ = shutdown.cancelled() => break,
        }
    }
    // Wake the reader if the writer is the side that failed
    shutdown.cancel();
}
