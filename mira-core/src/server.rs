//! WebSocket server and per-session control plane.
//!
//! Binds every configured port. `GET /` answers with a plain-text
//! health string; an upgrade on `/ws` becomes a media session. Each
//! session runs two tasks: a writer draining the outbound channel the
//! fan-out publishes into, and this reader, which owns the session's
//! registry entry and parses inbound control messages.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::StreamConfig;
use crate::control::ControlMessage;
use crate::error::MiraError;
use crate::inject::PointerInjector;
use crate::registry::{ClientRegistry, ClientSession, SessionMessage};

/// Body returned for plain HTTP requests on the session ports.
const HEALTH_TEXT: &str = concat!("mira streaming server v", env!("CARGO_PKG_VERSION"), "\n");

/// Path that carries the media session.
const SESSION_PATH: &str = "/ws";

// ── Server ───────────────────────────────────────────────────────

/// Accept loop plus per-session plumbing.
pub struct Server {
    config: StreamConfig,
    registry: Arc<ClientRegistry>,
    injector: Arc<PointerInjector>,
}

impl Server {
    pub fn new(config: StreamConfig, registry: Arc<ClientRegistry>) -> Arc<Self> {
        Arc::new(Self {
            config,
            registry,
            injector: Arc::new(PointerInjector::new()),
        })
    }

    /// Bind the configured ports and serve until cancelled.
    ///
    /// Ports that fail to bind (e.g. 80 without privilege) are logged
    /// and skipped; at least one must bind.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) -> Result<(), MiraError> {
        let mut listeners = Vec::new();
        for port in &self.config.ports {
            match TcpListener::bind(("0.0.0.0", *port)).await {
                Ok(listener) => {
                    info!(port, "listening");
                    listeners.push(listener);
                }
                Err(e) => warn!(port, "bind failed: {e}"),
            }
        }
        if listeners.is_empty() {
            return Err(MiraError::Transport("no port could be bound".into()));
        }

        let mut accept_tasks = Vec::new();
        for listener in listeners {
            let server = Arc::clone(&self);
            let cancel = cancel.clone();
            accept_tasks.push(tokio::spawn(async move {
                server.serve_listener(listener, cancel).await;
            }));
        }

        for task in accept_tasks {
            let _ = task.await;
        }
        Ok(())
    }

    /// Accept sessions from one already-bound listener until cancelled.
    pub async fn serve_listener(self: Arc<Self>, listener: TcpListener, cancel: CancellationToken) {
        self.accept_loop(listener, cancel).await;
    }

    async fn accept_loop(self: &Arc<Self>, listener: TcpListener, cancel: CancellationToken) {
        loop {
            let accepted = tokio::select! {
                accepted = listener.accept() => accepted,
                _ = cancel.cancelled() => break,
            };

            match accepted {
                Ok((stream, peer)) => {
                    debug!(%peer, "connection accepted");
                    let server = Arc::clone(self);
                    tokio::spawn(async move {
                        if let Err(e) = server.handle_connection(stream).await {
                            debug!(%peer, "connection ended: {e}");
                        }
                    });
                }
                Err(e) => {
                    warn!("accept failed: {e}");
                }
            }
        }
    }

    /// Route a fresh TCP connection: health probe or media session.
    async fn handle_connection(self: Arc<Self>, stream: TcpStream) -> Result<(), MiraError> {
        let _ = stream.set_nodelay(true);

        // Peek until the request head is complete so routing never
        // judges a half-arrived handshake.
        let mut head = [0u8; 1024];
        let mut n = 0;
        for _ in 0..50 {
            n = stream.peek(&mut head).await?;
            if n == head.len() || head[..n].windows(4).any(|w| w == b"\r\n\r\n") {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        }
        let request = RequestHead::parse(&head[..n]);

        if !request.websocket_upgrade {
            return serve_health(stream).await;
        }
        if request.path.as_deref() != Some(SESSION_PATH) {
            return serve_not_found(stream).await;
        }

        let ws = tokio_tungstenite::accept_async(stream)
            .await
            .map_err(|e| MiraError::Transport(format!("handshake: {e}")))?;

        let (session, outbound_rx) = match self.registry.register().await {
            Ok(pair) => pair,
            Err(e) => {
                // Over capacity: close cleanly instead of streaming.
                info!("refusing session: {e}");
                let (mut sink, _) = ws.split();
                let _ = sink.close().await;
                return Ok(());
            }
        };

        self.drive_session(ws, session, outbound_rx).await;
        Ok(())
    }

    /// Writer + reader for one admitted session. Returns when the
    /// socket closes or the session is marked for cleanup; the
    /// registry entry is removed here, and only here.
    async fn drive_session(
        self: &Arc<Self>,
        ws: tokio_tungstenite::WebSocketStream<TcpStream>,
        session: Arc<ClientSession>,
        mut outbound_rx: mpsc::Receiver<SessionMessage>,
    ) {
        let (mut sink, mut source) = ws.split();
        let session_id = session.id();

        // Writer: drains the fan-out channel until the socket fails or
        // cleanup is requested.
        let closed = session.closed_token();
        let writer = tokio::spawn(async move {
            loop {
                let msg = tokio::select! {
                    msg = outbound_rx.recv() => msg,
                    _ = closed.cancelled() => None,
                };
                let Some(msg) = msg else { break };

                let frame = match msg {
                    SessionMessage::Media(bytes) => Message::Binary((*bytes).clone()),
                    SessionMessage::Control(text) => Message::Text(text),
                };
                if sink.send(frame).await.is_err() {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        // Reader: the session's single writer of registry state.
        let reader_closed = session.closed_token();
        let mut pointer_errors = 0u32;
        loop {
            let msg = tokio::select! {
                msg = source.next() => msg,
                _ = reader_closed.cancelled() => None,
            };
            match msg {
                Some(Ok(Message::Text(text))) => {
                    self.handle_control(&session, &text, &mut pointer_errors);
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {} // binary/ping/pong from clients: ignored
                Some(Err(e)) => {
                    debug!(session = session_id, "read error: {e}");
                    break;
                }
            }
        }

        session.mark_for_cleanup();
        self.registry.remove(session_id).await;
        let _ = writer.await;
    }

    fn handle_control(
        self: &Arc<Self>,
        session: &Arc<ClientSession>,
        text: &str,
        pointer_errors: &mut u32,
    ) {
        let Some(msg) = ControlMessage::parse(text) else {
            return; // malformed or unknown: dropped silently
        };

        match msg {
            ControlMessage::Hello { client, version } => {
                session.set_version(version);
                info!(session = session.id(), client, version, "hello");
            }
            ControlMessage::RequestKeyframe => {
                self.registry.request_keyframe(session);
            }
            msg @ ControlMessage::Pointer { .. } => {
                if let Err(e) = self.injector.apply(&msg) {
                    if *pointer_errors == 0 {
                        warn!(session = session.id(), "pointer injection failed: {e}");
                    }
                    *pointer_errors = pointer_errors.saturating_add(1);
                }
            }
            ControlMessage::Status { .. } | ControlMessage::Unknown => {}
        }
    }
}

// ── Plain-HTTP responses ─────────────────────────────────────────

async fn serve_health(stream: TcpStream) -> Result<(), MiraError> {
    respond(
        stream,
        &format!(
            "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            HEALTH_TEXT.len(),
            HEALTH_TEXT
        ),
    )
    .await
}

async fn serve_not_found(stream: TcpStream) -> Result<(), MiraError> {
    respond(
        stream,
        "HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
    )
    .await
}

async fn respond(mut stream: TcpStream, response: &str) -> Result<(), MiraError> {
    use tokio::io::AsyncWriteExt;

    // Consume the peeked request before answering.
    let mut sink = [0u8; 1024];
    use tokio::io::AsyncReadExt;
    let _ = stream.read(&mut sink).await;

    stream.write_all(response.as_bytes()).await?;
    stream.shutdown().await?;
    Ok(())
}

// ── RequestHead ──────────────────────────────────────────────────

/// Minimal parse of a peeked HTTP request head: enough to route
/// between the health probe and the WebSocket handshake.
struct RequestHead {
    path: Option<String>,
    websocket_upgrade: bool,
}

impl RequestHead {
    fn parse(head: &[u8]) -> Self {
        let text = String::from_utf8_lossy(head);
        let path = text
            .lines()
            .next()
            .and_then(|line| line.split_whitespace().nth(1))
            .map(str::to_string);
        let websocket_upgrade = text
            .to_ascii_lowercase()
            .lines()
            .any(|line| line.starts_with("upgrade:") && line.contains("websocket"));
        Self {
            path,
            websocket_upgrade,
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_get_is_not_an_upgrade() {
        let head = RequestHead::parse(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n");
        assert_eq!(head.path.as_deref(), Some("/"));
        assert!(!head.websocket_upgrade);
    }

    #[test]
    fn websocket_upgrade_on_session_path() {
        let head = RequestHead::parse(
            b"GET /ws HTTP/1.1\r\nHost: x\r\nConnection: Upgrade\r\nUpgrade: websocket\r\n\r\n",
        );
        assert_eq!(head.path.as_deref(), Some("/ws"));
        assert!(head.websocket_upgrade);
    }

    #[test]
    fn upgrade_header_is_case_insensitive() {
        let head =
            RequestHead::parse(b"GET /ws HTTP/1.1\r\nUPGRADE: WebSocket\r\n\r\n");
        assert!(head.websocket_upgrade);
    }

    #[test]
    fn garbage_head_routes_to_health() {
        let head = RequestHead::parse(&[0xFF, 0x01, 0x02]);
        assert!(!head.websocket_upgrade);
    }
}
