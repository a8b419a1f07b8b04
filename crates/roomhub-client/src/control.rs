//! Tunnel control channel.
//!
//! Agent and clients share one long-lived control room. A single reader task
//! owns the receiving half and routes every message: responses go to the
//! waiter registered under their refid, requests go to the agent's queue.
//! Requests from several tasks may be in flight at once; each one gets its
//! own answer.
//!
//! If the link to the hub drops without a closing handshake the reader
//! rejoins the room and swaps in the new sending half. Pending waiters stay
//! registered across the rejoin.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, info, trace, warn};

use roomhub_core::{CloseReason, ControlMessage, HubError, HubResult, RefId, TunnelRequest, TunnelResponse};

use crate::session::{HubClient, RendezvousSession, SessionReceiver, SessionSender};

/// Capacity of the agent's incoming request queue.
const REQUEST_QUEUE_DEPTH: usize = 256;

/// Control channel tuning.
#[derive(Debug, Clone)]
pub struct ControlConfig {
    /// How long `request_tunnel` waits for the agent's answer.
    pub request_timeout: Duration,
    /// Rejoin attempts after an abnormal closure before giving up.
    pub rejoin_attempts: u32,
    /// Pause between rejoin attempts.
    pub rejoin_delay: Duration,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            rejoin_attempts: 3,
            rejoin_delay: Duration::from_secs(1),
        }
    }
}

type PendingTable = HashMap<RefId, oneshot::Sender<TunnelResponse>>;

/// State shared between the channel handle and its reader task.
struct Inner {
    sender: Mutex<SessionSender>,
    pending: Mutex<PendingTable>,
    /// Set (under the `pending` lock) once the reader has stopped for good.
    shut: AtomicBool,
}

impl Inner {
    /// Mark the channel stopped and fail every waiting request.
    async fn shut_down(&self) {
        let mut pending = self.pending.lock().await;
        self.shut.store(true, Ordering::SeqCst);
        if !pending.is_empty() {
            debug!(count = pending.len(), "failing pending tunnel requests");
        }
        pending.clear();
    }
}

/// Handle to a joined control room.
pub struct ControlChannel {
    inner: Arc<Inner>,
    config: ControlConfig,
    reader: std::sync::Mutex<Option<JoinHandle<HubError>>>,
    abort: AbortHandle,
}

impl ControlChannel {
    /// Join the control room as a client. Incoming tunnel requests are ignored.
    pub async fn open(
        client: HubClient,
        room: &str,
        password: &str,
        config: ControlConfig,
    ) -> HubResult<Self> {
        Self::start(client, room, password, config, None).await
    }

    /// Join the control room as an agent; tunnel requests arrive on the
    /// returned queue.
    pub async fn open_with_requests(
        client: HubClient,
        room: &str,
        password: &str,
        config: ControlConfig,
    ) -> HubResult<(Self, mpsc::Receiver<TunnelRequest>)> {
        let (tx, rx) = mpsc::channel(REQUEST_QUEUE_DEPTH);
        let channel = Self::start(client, room, password, config, Some(tx)).await?;
        Ok((channel, rx))
    }

    async fn start(
        client: HubClient,
        room: &str,
        password: &str,
        config: ControlConfig,
        requests: Option<mpsc::Sender<TunnelRequest>>,
    ) -> HubResult<Self> {
        let session = client.join(room, password).await?;
        let (sender, receiver) = session.into_split();

        let inner = Arc::new(Inner {
            sender: Mutex::new(sender),
            pending: Mutex::new(HashMap::new()),
            shut: AtomicBool::new(false),
        });

        let reader = tokio::spawn(read_loop(Reader {
            client,
            room: room.to_string(),
            password: password.to_string(),
            config: config.clone(),
            inner: inner.clone(),
            requests,
        }, receiver));
        let abort = reader.abort_handle();

        info!(room = %room, "control channel ready");
        Ok(Self {
            inner,
            config,
            reader: std::sync::Mutex::new(Some(reader)),
            abort,
        })
    }

    /// Ask the agent for a tunnel to `destination` and wait for its answer.
    pub async fn request_tunnel(&self, destination: &str) -> HubResult<TunnelResponse> {
        let request = TunnelRequest::new(destination);
        let refid = request.refid.clone();
        let (tx, rx) = oneshot::channel();

        {
            let mut pending = self.inner.pending.lock().await;
            if self.inner.shut.load(Ordering::SeqCst) {
                return Err(HubError::Closed(CloseReason::Normal));
            }
            pending.insert(refid.clone(), tx);
        }

        debug!(refid = %refid, destination = %destination, "requesting tunnel");
        let sent = {
            let sender = self.inner.sender.lock().await;
            sender
                .send_message(&ControlMessage::CreateTunnel(request))
                .await
        };
        if let Err(e) = sent {
            self.forget(&refid).await;
            return Err(e);
        }

        match tokio::time::timeout(self.config.request_timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(HubError::Transport("control channel closed".into())),
            Err(_) => {
                self.forget(&refid).await;
                warn!(refid = %refid, "tunnel request timed out");
                Err(HubError::Timeout)
            }
        }
    }

    /// Send an answer (or any control message) to the room.
    pub async fn respond(&self, message: &ControlMessage) -> HubResult<()> {
        let sender = self.inner.sender.lock().await;
        sender.send_message(message).await
    }

    /// Number of requests still waiting for an answer.
    pub async fn pending_requests(&self) -> usize {
        self.inner.pending.lock().await.len()
    }

    /// Wait until the reader stops for good and return why.
    ///
    /// Only the first caller observes the error.
    pub async fn closed(&self) -> HubError {
        let handle = match self.reader.lock() {
            Ok(mut guard) => guard.take(),
            Err(_) => None,
        };
        match handle {
            Some(handle) => handle
                .await
                .unwrap_or_else(|e| HubError::Other(format!("control reader failed: {e}"))),
            None => HubError::Other("control channel already awaited".into()),
        }
    }

    /// Leave the control room and stop the reader. Requests still waiting
    /// for an answer fail right away.
    pub async fn close(&self) -> HubResult<()> {
        self.inner.shut_down().await;
        self.abort.abort();
        let sender = self.inner.sender.lock().await;
        sender.close().await
    }

    async fn forget(&self, refid: &str) {
        self.inner.pending.lock().await.remove(refid);
    }
}

impl Drop for ControlChannel {
    fn drop(&mut self) {
        self.abort.abort();
    }
}

struct Reader {
    client: HubClient,
    room: String,
    password: String,
    config: ControlConfig,
    inner: Arc<Inner>,
    requests: Option<mpsc::Sender<TunnelRequest>>,
}

impl Reader {
    async fn dispatch(&self, message: ControlMessage) {
        match message {
            ControlMessage::CreateTunnel(request) => match &self.requests {
                Some(queue) => {
                    if queue.send(request).await.is_err() {
                        debug!("request queue closed, dropping tunnel request");
                    }
                }
                None => trace!(refid = %request.refid, "ignoring tunnel request from another client"),
            },
            response => {
                let Some((refid, outcome)) = response.into_response() else {
                    return;
                };
                let waiter = self.inner.pending.lock().await.remove(&refid);
                match waiter {
                    Some(tx) => {
                        if tx.send(outcome).is_err() {
                            debug!(refid = %refid, "requester gave up before the answer");
                        }
                    }
                    None => {
                        let e = HubError::CorrelationMismatch(refid);
                        debug!(error = %e, "discarding response");
                    }
                }
            }
        }
    }

    /// Rejoin the control room, retrying up to the configured limit.
    async fn rejoin(&self) -> HubResult<RendezvousSession> {
        let mut last = HubError::Closed(CloseReason::Abnormal);
        for attempt in 1..=self.config.rejoin_attempts {
            if attempt > 1 {
                tokio::time::sleep(self.config.rejoin_delay).await;
            }
            match self.client.join(&self.room, &self.password).await {
                Ok(session) => return Ok(session),
                Err(e) => {
                    warn!(room = %self.room, attempt, error = %e, "rejoin failed");
                    last = e;
                }
            }
        }
        Err(last)
    }
}

async fn read_loop(reader: Reader, mut receiver: SessionReceiver) -> HubError {
    let fatal = loop {
        match receiver.recv_message::<ControlMessage>().await {
            Ok(message) => reader.dispatch(message).await,
            Err(e) if e.is_abnormal_closure() => {
                warn!(room = %reader.room, "control link lost, rejoining");
                match reader.rejoin().await {
                    Ok(session) => {
                        let (sender, fresh) = session.into_split();
                        *reader.inner.sender.lock().await = sender;
                        receiver = fresh;
                        info!(room = %reader.room, "control room rejoined");
                    }
                    Err(e) => break e,
                }
            }
            Err(e @ (HubError::Codec(_) | HubError::Protocol(_))) => {
                warn!(room = %reader.room, error = %e, "malformed control message");
            }
            Err(e) => break e,
        }
    };

    reader.inner.shut_down().await;
    warn!(room = %reader.room, error = %fatal, "control channel stopped");
    fatal
}
