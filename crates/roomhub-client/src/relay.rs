//! Bidirectional relay between a TCP stream and a tunnel session.
//!
//! Two tasks pump bytes, one per direction. Whichever direction ends first
//! (EOF, read/write error, session closed) tears down the other: the peer
//! task is aborted, the stream is shut down, and the session is closed once.
//!
//! An empty frame marks end of stream. It is sent to the room just before
//! the session closes, and receiving one ends the session → stream side, so
//! the far relay shuts down too.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tracing::{debug, trace};

use roomhub_core::{HubError, HubResult};

use crate::session::{RendezvousSession, SessionReceiver, SessionSender};

/// Relay tuning.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Largest chunk read from the stream and sent as one frame.
    pub chunk_size: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self { chunk_size: 1500 }
    }
}

/// Which side of the relay stopped first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Stream → session (local end closed or failed).
    StreamToSession,
    /// Session → stream (tunnel closed or failed).
    SessionToStream,
}

/// Summary of a finished relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayReport {
    pub room: String,
    /// Bytes read from the stream and sent into the tunnel.
    pub stream_to_session: u64,
    /// Bytes received from the tunnel and written to the stream.
    pub session_to_stream: u64,
    pub first_ended: Direction,
}

/// Pump bytes both ways until either side ends.
pub async fn relay<S>(stream: S, session: RendezvousSession, config: &RelayConfig) -> RelayReport
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let room = session.room().to_string();
    let (reader, writer) = tokio::io::split(stream);
    let (sender, receiver) = session.into_split();
    let closer = sender.clone();

    let up = Arc::new(AtomicU64::new(0));
    let down = Arc::new(AtomicU64::new(0));
    let chunk_size = config.chunk_size.max(1);

    let mut upstream = tokio::spawn(pump_up(reader, sender, chunk_size, up.clone()));
    let mut downstream = tokio::spawn(pump_down(receiver, writer, down.clone()));

    let (first_ended, outcome) = tokio::select! {
        r = &mut upstream => (Direction::StreamToSession, r),
        r = &mut downstream => (Direction::SessionToStream, r),
    };

    match first_ended {
        Direction::StreamToSession => {
            downstream.abort();
            let _ = downstream.await;
        }
        Direction::SessionToStream => {
            upstream.abort();
            let _ = upstream.await;
        }
    }

    match outcome {
        Ok(Ok(())) => debug!(room = %room, ?first_ended, "relay direction finished"),
        Ok(Err(e)) => debug!(room = %room, ?first_ended, error = %e, "relay direction failed"),
        Err(e) => debug!(room = %room, ?first_ended, error = %e, "relay task failed"),
    }

    let _ = closer.send_frame(&[]).await;
    match closer.close().await {
        Ok(()) | Err(HubError::AlreadyClosed) => {}
        Err(e) => debug!(room = %room, error = %e, "closing tunnel session failed"),
    }

    let report = RelayReport {
        room,
        stream_to_session: up.load(Ordering::SeqCst),
        session_to_stream: down.load(Ordering::SeqCst),
        first_ended,
    };
    debug!(
        room = %report.room,
        up = report.stream_to_session,
        down = report.session_to_stream,
        "relay finished"
    );
    report
}

/// Stream → session. Ends cleanly on EOF.
async fn pump_up<S: AsyncRead>(
    mut reader: ReadHalf<S>,
    sender: SessionSender,
    chunk_size: usize,
    counter: Arc<AtomicU64>,
) -> HubResult<()> {
    let mut buf = vec![0u8; chunk_size];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        trace!(room = %sender.room(), bytes = n, "stream -> tunnel");
        sender.send_frame(&buf[..n]).await?;
        counter.fetch_add(n as u64, Ordering::SeqCst);
    }
}

/// Session → stream. The stream's write side is shut down on exit.
async fn pump_down<S: AsyncWrite>(
    mut receiver: SessionReceiver,
    mut writer: WriteHalf<S>,
    counter: Arc<AtomicU64>,
) -> HubResult<()> {
    let result = copy_frames(&mut receiver, &mut writer, &counter).await;
    let _ = writer.shutdown().await;
    result
}

async fn copy_frames<S: AsyncWrite>(
    receiver: &mut SessionReceiver,
    writer: &mut WriteHalf<S>,
    counter: &AtomicU64,
) -> HubResult<()> {
    loop {
        let frame = receiver.recv_frame().await?;
        if frame.is_empty() {
            debug!(room = %receiver.room(), "peer ended the tunnel");
            return Ok(());
        }
        trace!(room = %receiver.room(), bytes = frame.len(), "tunnel -> stream");
        writer.write_all(&frame).await?;
        counter.fetch_add(frame.len() as u64, Ordering::SeqCst);
    }
}
