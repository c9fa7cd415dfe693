use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::{sync::mpsc, task::JoinHandle, time::timeout};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};
use waauth_core::{OutboundMessage, encode_outbound};

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(12);

pub type ConnectionId = u64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEventKind {
    Opened,
    MessageReceived(String),
    Closed(Option<String>),
    Error(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportEvent {
    pub connection: ConnectionId,
    pub kind: TransportEventKind,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("socket is not connected")]
    NotConnected,
    #[error("failed to encode outgoing message: {0}")]
    Encode(String),
}

struct Connection {
    id: ConnectionId,
    open: Arc<AtomicBool>,
    outbound_tx: mpsc::UnboundedSender<Message>,
    task: JoinHandle<()>,
}

/// Owns at most one WebSocket connection to the gateway.
///
/// Lifecycle and inbound frames are reported on the event channel handed to
/// [`Transport::new`]; each connection reports exactly one terminal event.
pub struct Transport {
    events_tx: mpsc::UnboundedSender<TransportEvent>,
    connect_timeout: Duration,
    next_id: ConnectionId,
    current: Option<Connection>,
}

impl Transport {
    pub fn new(events_tx: mpsc::UnboundedSender<TransportEvent>) -> Self {
        Self {
            events_tx,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            next_id: 0,
            current: None,
        }
    }

    #[must_use]
    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    pub fn current_id(&self) -> Option<ConnectionId> {
        self.current.as_ref().map(|conn| conn.id)
    }

    pub fn is_current(&self, id: ConnectionId) -> bool {
        self.current_id() == Some(id)
    }

    pub fn is_open(&self) -> bool {
        self.current
            .as_ref()
            .is_some_and(|conn| conn.open.load(Ordering::SeqCst))
    }

    /// Starts a new connection, closing any previous one first.
    ///
    /// Never fails synchronously; a failed connect is reported as
    /// [`TransportEventKind::Error`].
    pub fn connect(&mut self, url: &str) -> ConnectionId {
        self.close();

        self.next_id += 1;
        let id = self.next_id;
        let open = Arc::new(AtomicBool::new(false));
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel::<Message>();

        info!(connection = id, url = %redact_query(url), "connecting");
        let task = tokio::spawn(run_connection(
            id,
            url.to_owned(),
            self.connect_timeout,
            open.clone(),
            outbound_rx,
            self.events_tx.clone(),
        ));

        self.current = Some(Connection {
            id,
            open,
            outbound_tx,
            task,
        });
        id
    }

    pub fn send(&self, message: &OutboundMessage) -> Result<(), TransportError> {
        let conn = self
            .current
            .as_ref()
            .filter(|conn| conn.open.load(Ordering::SeqCst))
            .ok_or(TransportError::NotConnected)?;
        let text = encode_outbound(message).map_err(|err| TransportError::Encode(err.to_string()))?;
        conn.outbound_tx
            .send(Message::Text(text.into()))
            .map_err(|_| TransportError::NotConnected)
    }

    /// Closes the current connection, if any. Safe to call repeatedly.
    pub fn close(&mut self) {
        let Some(conn) = self.current.take() else {
            return;
        };
        debug!(connection = conn.id, "closing connection");
        conn.open.store(false, Ordering::SeqCst);
        if conn.outbound_tx.send(Message::Close(None)).is_err() {
            conn.task.abort();
            return;
        }
        // Give the close frame a moment to flush before tearing the task down.
        let task = conn.task;
        tokio::spawn(async move {
            let abort = task.abort_handle();
            if timeout(Duration::from_secs(1), task).await.is_err() {
                abort.abort();
            }
        });
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        if let Some(conn) = self.current.take() {
            conn.task.abort();
        }
    }
}

async fn run_connection(
    id: ConnectionId,
    url: String,
    connect_timeout: Duration,
    open: Arc<AtomicBool>,
    mut outbound_rx: mpsc::UnboundedReceiver<Message>,
    events_tx: mpsc::UnboundedSender<TransportEvent>,
) {
    let emit = |kind: TransportEventKind| {
        let _ = events_tx.send(TransportEvent {
            connection: id,
            kind,
        });
    };

    let ws_stream = match timeout(connect_timeout, connect_async(&url)).await {
        Ok(Ok((ws_stream, _))) => ws_stream,
        Ok(Err(err)) => {
            warn!(connection = id, "connect failed: {err}");
            emit(TransportEventKind::Error(format!("connect failed: {err}")));
            return;
        }
        Err(_) => {
            warn!(connection = id, "connect timed out after {:?}", connect_timeout);
            emit(TransportEventKind::Error(format!(
                "connect timed out after {connect_timeout:?}"
            )));
            return;
        }
    };

    let (mut ws_write, mut ws_read) = ws_stream.split();
    open.store(true, Ordering::SeqCst);
    info!(connection = id, "connected");
    emit(TransportEventKind::Opened);

    let terminal = loop {
        tokio::select! {
            outgoing = outbound_rx.recv() => {
                let Some(message) = outgoing else {
                    break TransportEventKind::Closed(None);
                };
                let closing = matches!(message, Message::Close(_));
                if let Err(err) = ws_write.send(message).await {
                    break TransportEventKind::Error(format!("send failed: {err}"));
                }
                if closing {
                    break TransportEventKind::Closed(Some("closed by client".to_owned()));
                }
            }
            incoming = ws_read.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        emit(TransportEventKind::MessageReceived(text.as_str().to_owned()));
                    }
                    Some(Ok(Message::Close(frame))) => {
                        break TransportEventKind::Closed(frame.map(|f| f.reason.as_str().to_owned()));
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        break TransportEventKind::Error(format!("read failed: {err}"));
                    }
                    None => break TransportEventKind::Closed(None),
                }
            }
        }
    };

    open.store(false, Ordering::SeqCst);
    debug!(connection = id, event = ?terminal, "connection finished");
    emit(terminal);
}

/// URL without its query string, for logging.
fn redact_query(url: &str) -> &str {
    url.split('?').next().unwrap_or(url)
}
