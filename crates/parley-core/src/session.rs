//! Sessions and the per-node session registry.

use crate::delivery::Delivery;
use dashmap::DashMap;
use parley_protocol::{MessageId, RoomId, ServerEvent, UserId};
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{trace, warn};
use uuid::Uuid;

/// Lifecycle of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    Connecting = 0,
    Authenticated = 1,
    Active = 2,
    Closed = 3,
}

impl SessionState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => SessionState::Connecting,
            1 => SessionState::Authenticated,
            2 => SessionState::Active,
            _ => SessionState::Closed,
        }
    }
}

/// How many recent message ids a session remembers for de-duplication.
const DEDUP_WINDOW: usize = 128;

/// Events queued for one socket.
pub type Outbound = mpsc::Receiver<Arc<ServerEvent>>;

/// One authenticated connection.
///
/// Holds the socket's outbound queue and one forwarding task per channel it
/// listens on. A new message reaching the socket through both its room
/// channel and its personal channel is forwarded once.
#[derive(Debug)]
pub struct Session {
    socket_id: String,
    user_id: UserId,
    state: AtomicU8,
    outbound: mpsc::Sender<Arc<ServerEvent>>,
    joined: DashMap<RoomId, JoinHandle<()>>,
    /// Forwarders for the personal and presence channels.
    personal: Mutex<Vec<JoinHandle<()>>>,
    delivered: Arc<Mutex<VecDeque<MessageId>>>,
}

impl Session {
    /// Create a session and the receiving end of its outbound queue.
    #[must_use]
    pub fn new(user_id: UserId, buffer: usize) -> (Arc<Self>, Outbound) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        let session = Arc::new(Self {
            socket_id: Uuid::new_v4().to_string(),
            user_id,
            state: AtomicU8::new(SessionState::Authenticated as u8),
            outbound: tx,
            joined: DashMap::new(),
            personal: Mutex::new(Vec::new()),
            delivered: Arc::new(Mutex::new(VecDeque::with_capacity(DEDUP_WINDOW))),
        });
        (session, rx)
    }

    #[must_use]
    pub fn socket_id(&self) -> &str {
        &self.socket_id
    }

    #[must_use]
    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn set_state(&self, state: SessionState) {
        self.state.store(state as u8, Ordering::Release);
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state() == SessionState::Closed
    }

    /// Queue an event for this socket only.
    ///
    /// Returns `false` once the socket has gone away.
    pub async fn send(&self, event: ServerEvent) -> bool {
        self.outbound.send(Arc::new(event)).await.is_ok()
    }

    #[must_use]
    pub fn has_joined(&self, room: &RoomId) -> bool {
        self.joined.contains_key(room)
    }

    #[must_use]
    pub fn joined_rooms(&self) -> Vec<RoomId> {
        self.joined.iter().map(|e| *e.key()).collect()
    }

    /// Start forwarding a room channel to this socket.
    pub fn attach_room(&self, room: RoomId, rx: broadcast::Receiver<Arc<Delivery>>) {
        let handle = self.forward(rx);
        if let Some(previous) = self.joined.insert(room, handle) {
            previous.abort();
        }
    }

    /// Stop forwarding a room channel. Returns `false` if not joined.
    pub fn detach_room(&self, room: &RoomId) -> bool {
        match self.joined.remove(room) {
            Some((_, handle)) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    /// Start forwarding a personal or presence channel to this socket.
    pub fn attach_personal(&self, rx: broadcast::Receiver<Arc<Delivery>>) {
        let handle = self.forward(rx);
        match self.personal.lock() {
            Ok(mut handles) => handles.push(handle),
            Err(poisoned) => poisoned.into_inner().push(handle),
        }
    }

    /// Abort every forwarder and mark the session closed.
    pub fn shutdown(&self) {
        self.set_state(SessionState::Closed);
        self.joined.iter().for_each(|e| e.value().abort());
        self.joined.clear();
        let handles = match self.personal.lock() {
            Ok(mut handles) => std::mem::take(&mut *handles),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };
        handles.iter().for_each(JoinHandle::abort);
    }

    fn forward(&self, mut rx: broadcast::Receiver<Arc<Delivery>>) -> JoinHandle<()> {
        let tx = self.outbound.clone();
        let socket_id = self.socket_id.clone();
        let delivered = Arc::clone(&self.delivered);
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(delivery) => {
                        let event = Arc::clone(&delivery.event);
                        if let ServerEvent::NewMessage(message) = event.as_ref() {
                            if !first_delivery(&delivered, message.id) {
                                continue;
                            }
                        }
                        // Typing indicators are dropped rather than queued.
                        if matches!(*event, ServerEvent::Typing(_)) {
                            if let Err(mpsc::error::TrySendError::Closed(_)) = tx.try_send(event) {
                                break;
                            }
                            continue;
                        }
                        if tx.send(event).await.is_err() {
                            break;
                        }
                        trace!(connection = %socket_id, delivery = delivery.id, "Forwarded");
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(connection = %socket_id, lagged = n, "Socket lagged behind channel");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}

/// Record a message id; `false` if it was already delivered.
fn first_delivery(delivered: &Mutex<VecDeque<MessageId>>, id: MessageId) -> bool {
    let mut seen = match delivered.lock() {
        Ok(seen) => seen,
        Err(poisoned) => poisoned.into_inner(),
    };
    if seen.contains(&id) {
        return false;
    }
    if seen.len() == DEDUP_WINDOW {
        seen.pop_front();
    }
    seen.push_back(id);
    true
}

/// Which sockets each user has open on this node.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: DashMap<UserId, HashSet<String>>,
}

impl SessionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a socket. Returns the user's open socket count afterwards.
    pub fn add(&self, user: &UserId, socket_id: &str) -> usize {
        let mut sockets = self.sessions.entry(user.clone()).or_default();
        sockets.insert(socket_id.to_string());
        sockets.len()
    }

    /// Deregister a socket. Returns the user's remaining socket count.
    pub fn remove(&self, user: &UserId, socket_id: &str) -> usize {
        let remaining = match self.sessions.get_mut(user) {
            Some(mut sockets) => {
                sockets.remove(socket_id);
                sockets.len()
            }
            None => return 0,
        };
        if remaining == 0 {
            self.sessions.remove_if(user, |_, sockets| sockets.is_empty());
        }
        remaining
    }

    /// Whether the user has any socket open on this node.
    #[must_use]
    pub fn is_connected(&self, user: &UserId) -> bool {
        self.sessions.get(user).is_some_and(|s| !s.is_empty())
    }

    /// Sockets the user has open on this node.
    #[must_use]
    pub fn connection_count(&self, user: &UserId) -> usize {
        self.sessions.get(user).map_or(0, |s| s.len())
    }

    #[must_use]
    pub fn session_count(&self) -> usize {
        self.sessions.iter().map(|e| e.value().len()).sum()
    }

    #[must_use]
    pub fn user_count(&self) -> usize {
        self.sessions.len()
    }
}
