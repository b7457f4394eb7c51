//! Connected-viewer bookkeeping.
//!
//! The registry maps session ids to [`ClientSession`]s behind an async
//! `RwLock`. Each session's inbound socket loop is the only writer for
//! that session's entry; every other component reads atomics on the
//! session or takes a snapshot of the map. Removal is idempotent and
//! tolerated from any component.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::control::ControlMessage;
use crate::error::MiraError;
use crate::stream::encode::KeyframeSignal;

/// Depth of each session's outbound message channel. Small on purpose:
/// a stalled socket fills it quickly and send timeouts start firing
/// instead of memory growing.
const OUTBOUND_DEPTH: usize = 8;

// ── SessionMessage ───────────────────────────────────────────────

/// One message queued for a session's writer task.
#[derive(Debug, Clone)]
pub enum SessionMessage {
    /// A binary media frame, shared across sessions by the fan-out.
    Media(Arc<Vec<u8>>),
    /// A JSON control message (server → client).
    Control(String),
}

// ── ClientSession ────────────────────────────────────────────────

/// One attached viewer.
pub struct ClientSession {
    id: u64,
    /// True from connect (and from an explicit request) until an
    /// I-frame is dispatched to this session.
    needs_keyframe: AtomicBool,
    /// Sequence of the last video frame sent; −1 before the first.
    last_sequence: AtomicI64,
    /// Protocol version from the client's `hello` (0 until seen).
    version: AtomicU64,
    outbound: mpsc::Sender<SessionMessage>,
    /// Cancelled when the session is marked for cleanup; the writer
    /// task observes this and drops the socket, which in turn fails
    /// the inbound reader and removes the registry entry.
    closed: CancellationToken,
}

impl ClientSession {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn needs_keyframe(&self) -> bool {
        self.needs_keyframe.load(Ordering::Acquire)
    }

    /// Arm the per-session keyframe gate.
    pub fn set_needs_keyframe(&self) {
        self.needs_keyframe.store(true, Ordering::Release);
    }

    /// Clear the gate. Called *before* dispatching an I-frame so a
    /// concurrent request during the send still arms another one.
    pub fn clear_needs_keyframe(&self) {
        self.needs_keyframe.store(false, Ordering::Release);
    }

    /// Sequence number of the last video frame sent to this session.
    pub fn last_sequence(&self) -> i64 {
        self.last_sequence.load(Ordering::Acquire)
    }

    pub fn record_sequence(&self, sequence: u64) {
        self.last_sequence.store(sequence as i64, Ordering::Release);
    }

    pub fn set_version(&self, version: u32) {
        self.version.store(version as u64, Ordering::Release);
    }

    pub fn version(&self) -> u32 {
        self.version.load(Ordering::Acquire) as u32
    }

    /// Whether the transport is still considered open.
    pub fn is_open(&self) -> bool {
        !self.closed.is_cancelled()
    }

    /// Mark the session for cleanup. Safe to call repeatedly.
    pub fn mark_for_cleanup(&self) {
        self.closed.cancel();
    }

    /// Token the writer task selects on to notice cleanup.
    pub fn closed_token(&self) -> CancellationToken {
        self.closed.clone()
    }

    /// Queue a media frame, giving the stalled-socket case `timeout`
    /// to drain before reporting failure.
    pub async fn send_media(
        &self,
        frame: Arc<Vec<u8>>,
        timeout: Duration,
    ) -> Result<(), MiraError> {
        if !self.is_open() {
            return Err(MiraError::Transport("session closed".into()));
        }
        self.outbound
            .send_timeout(SessionMessage::Media(frame), timeout)
            .await
            .map_err(|e| match e {
                mpsc::error::SendTimeoutError::Timeout(_) => MiraError::Timeout(timeout),
                mpsc::error::SendTimeoutError::Closed(_) => MiraError::ChannelClosed,
            })
    }

    /// Queue a control message without blocking; best-effort.
    pub fn send_control(&self, msg: &ControlMessage) {
        let _ = self
            .outbound
            .try_send(SessionMessage::Control(msg.to_json()));
    }
}

// ── ClientRegistry ───────────────────────────────────────────────

/// In-memory session table with a hard capacity cap.
pub struct ClientRegistry {
    sessions: RwLock<HashMap<u64, Arc<ClientSession>>>,
    count: AtomicUsize,
    next_id: AtomicU64,
    capacity: usize,
    keyframe: Arc<KeyframeSignal>,
}

impl ClientRegistry {
    pub fn new(capacity: usize, keyframe: Arc<KeyframeSignal>) -> Arc<Self> {
        Arc::new(Self {
            sessions: RwLock::new(HashMap::new()),
            count: AtomicUsize::new(0),
            next_id: AtomicU64::new(1),
            capacity,
            keyframe,
        })
    }

    /// Admit a new session, or refuse beyond the capacity cap.
    ///
    /// Admission arms both the session gate and the process-wide
    /// keyframe request so the new viewer's first frame is decodable.
    pub async fn register(
        &self,
    ) -> Result<(Arc<ClientSession>, mpsc::Receiver<SessionMessage>), MiraError> {
        let mut sessions = self.sessions.write().await;
        if sessions.len() >= self.capacity {
            return Err(MiraError::CapacityReached(self.capacity));
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(OUTBOUND_DEPTH);
        let session = Arc::new(ClientSession {
            id,
            needs_keyframe: AtomicBool::new(true),
            last_sequence: AtomicI64::new(-1),
            version: AtomicU64::new(0),
            outbound: tx,
            closed: CancellationToken::new(),
        });
        sessions.insert(id, Arc::clone(&session));
        self.count.store(sessions.len(), Ordering::Release);
        drop(sessions);

        self.keyframe.request();
        info!(session = id, "client attached");
        Ok((session, rx))
    }

    /// Remove a session. Idempotent; callable from any component.
    pub async fn remove(&self, id: u64) {
        let mut sessions = self.sessions.write().await;
        if let Some(session) = sessions.remove(&id) {
            session.mark_for_cleanup();
            self.count.store(sessions.len(), Ordering::Release);
            drop(sessions);
            info!(session = id, "client detached");
        }
    }

    /// Cheap reader for the capture tick's "anyone attached?" check.
    pub fn client_count(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    /// Current sessions, for one fan-out dispatch round.
    pub async fn snapshot(&self) -> Vec<Arc<ClientSession>> {
        self.sessions.read().await.values().cloned().collect()
    }

    /// Push a control message to every open session.
    pub async fn broadcast_control(&self, msg: &ControlMessage) {
        for session in self.snapshot().await {
            if session.is_open() {
                session.send_control(msg);
            }
        }
    }

    /// Arm every session's keyframe gate plus the encoder latch.
    /// Used by the control plane on `request_keyframe`.
    pub fn request_keyframe(&self, session: &ClientSession) {
        session.set_needs_keyframe();
        self.keyframe.request();
        debug!(session = session.id(), "keyframe requested");
    }
}

// ── Tests ────────────────────────────────────────────────────────
