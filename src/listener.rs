//! Long-lived reader for the gateway's status broadcast port.
//!
//! `Disconnected -> Connecting -> Listening -> Disconnected -> ...` until
//! stopped. Every connection loss, failed connect, or silent socket is
//! followed by the same fixed backoff; retries are unbounded.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::codec::Decoder;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::frame::{DecodedFrame, StatusFrameCodec};
use crate::logger::MessageLogger;
use crate::types::ListenerState;

pub const DEFAULT_RECONNECT_BACKOFF: Duration = Duration::from_secs(10);
pub const DEFAULT_INACTIVITY_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

const READ_BUFFER_SIZE: usize = 1024;

#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// Wait between a lost/failed connection and the next attempt.
    pub reconnect_backoff: Duration,
    /// Recycle the connection when no bytes arrive for this long.
    pub inactivity_timeout: Duration,
    pub connect_timeout: Duration,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            reconnect_backoff: DEFAULT_RECONNECT_BACKOFF,
            inactivity_timeout: DEFAULT_INACTIVITY_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

/// Why a listening session ended.
#[derive(Debug)]
enum SessionEnd {
    Stopped,
    Eof,
    Inactive,
    ReceiverGone,
    Io(std::io::Error),
}

pub struct StatusListener {
    addr: String,
    config: ListenerConfig,
    updates: mpsc::Sender<DecodedFrame>,
    state: watch::Sender<ListenerState>,
    cancel: CancellationToken,
    logger: Option<Arc<Mutex<MessageLogger>>>,
}

/// Owner's side of a running listener. Dropping it cancels the task.
pub struct ListenerHandle {
    cancel: CancellationToken,
    state: watch::Receiver<ListenerState>,
    task: Option<JoinHandle<()>>,
}

impl ListenerHandle {
    pub fn state(&self) -> ListenerState {
        *self.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ListenerState::Listening
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ListenerState> {
        self.state.clone()
    }

    /// Cancel the task and wait for it to close its socket.
    pub async fn stop(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take()
            && let Err(e) = task.await
        {
            warn!("status listener task failed: {e}");
        }
    }
}

impl Drop for ListenerHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl StatusListener {
    pub fn new(
        addr: impl Into<String>,
        config: ListenerConfig,
        updates: mpsc::Sender<DecodedFrame>,
    ) -> Self {
        let (state, _) = watch::channel(ListenerState::Disconnected);
        Self {
            addr: addr.into(),
            config,
            updates,
            state,
            cancel: CancellationToken::new(),
            logger: None,
        }
    }

    pub(crate) fn with_logger(mut self, logger: Option<Arc<Mutex<MessageLogger>>>) -> Self {
        self.logger = logger;
        self
    }

    /// Run on the current tokio runtime until the handle stops it.
    pub fn spawn(self) -> ListenerHandle {
        let cancel = self.cancel.clone();
        let state = self.state.subscribe();
        let task = tokio::spawn(self.run());
        ListenerHandle {
            cancel,
            state,
            task: Some(task),
        }
    }

    fn set_state(&self, state: ListenerState) {
        self.state.send_replace(state);
    }

    async fn run(self) {
        info!(addr = %self.addr, "starting status listener");

        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            self.set_state(ListenerState::Connecting);
            let connect = timeout(self.config.connect_timeout, TcpStream::connect(&self.addr));
            let connected = tokio::select! {
                _ = self.cancel.cancelled() => break,
                result = connect => result,
            };

            match connected {
                Ok(Ok(stream)) => {
                    info!(addr = %self.addr, "status listener connected");
                    self.set_state(ListenerState::Listening);
                    match self.listen(stream).await {
                        SessionEnd::Stopped | SessionEnd::ReceiverGone => break,
                        SessionEnd::Eof => debug!(addr = %self.addr, "gateway closed status stream"),
                        SessionEnd::Inactive => warn!(
                            addr = %self.addr,
                            timeout = ?self.config.inactivity_timeout,
                            "no data on status stream, reconnecting"
                        ),
                        SessionEnd::Io(e) => warn!(addr = %self.addr, "status stream error: {e}"),
                    }
                }
                Ok(Err(e)) => warn!(addr = %self.addr, "status listener connect failed: {e}"),
                Err(_) => warn!(addr = %self.addr, "status listener connect timed out"),
            }

            self.set_state(ListenerState::Disconnected);
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(self.config.reconnect_backoff) => {}
            }
        }

        self.set_state(ListenerState::Disconnected);
        info!(addr = %self.addr, "status listener stopped");
    }

    /// Read and decode until the connection ends. The socket and buffer are
    /// dropped on return.
    async fn listen(&self, mut stream: TcpStream) -> SessionEnd {
        let mut buf = BytesMut::with_capacity(READ_BUFFER_SIZE);
        let mut codec = StatusFrameCodec::new();

        loop {
            let read = tokio::select! {
                _ = self.cancel.cancelled() => return SessionEnd::Stopped,
                result = timeout(self.config.inactivity_timeout, stream.read_buf(&mut buf)) => result,
            };

            match read {
                Err(_) => return SessionEnd::Inactive,
                Ok(Ok(0)) => return SessionEnd::Eof,
                Ok(Ok(n)) => trace!(bytes = n, buffered = buf.len(), "status stream read"),
                Ok(Err(e)) => return SessionEnd::Io(e),
            }

            loop {
                let frame = match codec.decode(&mut buf) {
                    Ok(Some(frame)) => frame,
                    Ok(None) => break,
                    Err(e) => return SessionEnd::Io(e),
                };
                trace!(device = %frame.identity, "decoded status frame");
                if let Some(logger) = &self.logger {
                    logger
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .log_frame(frame.identity, &frame.raw);
                }
                if self.updates.send(frame).await.is_err() {
                    return SessionEnd::ReceiverGone;
                }
            }
        }
    }
}
