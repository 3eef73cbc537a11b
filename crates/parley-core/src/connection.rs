//! Connection manager.
//!
//! Owns one [`Session`] per authenticated socket and runs every client
//! operation against the directory, the message store and the notifier.
//! It has no transport of its own: the server feeds decoded
//! [`ClientEvent`]s in and drains each session's outbound queue.

use crate::bus::{Bus, BusError};
use crate::cache::Cache;
use crate::channel::{room_channel, user_channel, PRESENCE_CHANNEL};
use crate::error::{AuthError, ChatError};
use crate::fanout::{FanoutError, Notifier, NotifierConfig};
use crate::identity::{self, Verifier};
use crate::messages::{MessageConfig, MessageStore};
use crate::presence::{PresenceConfig, PresenceTracker};
use crate::rooms::RoomDirectory;
use crate::session::{Outbound, Session, SessionRegistry, SessionState};
use crate::store::{ChatStore, UserStore};
use parley_protocol::{
    ClientEvent, CreateRoom, GetUnreadCount, JoinRoom, LeaveRoom, MarkRead, PresenceStatus, Room,
    RoomId, RoomSelector, SendMessage, ServerEvent, Typing, TypingStatus, UnreadCount, UserId,
};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Tuning for the whole chat service.
#[derive(Debug, Clone)]
pub struct ChatConfig {
    pub notifier: NotifierConfig,
    pub presence: PresenceConfig,
    pub messages: MessageConfig,
    /// Events queued per socket before fan-out waits.
    pub outbound_buffer: usize,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            notifier: NotifierConfig::default(),
            presence: PresenceConfig::default(),
            messages: MessageConfig::default(),
            outbound_buffer: 256,
        }
    }
}

/// Injected collaborators.
pub struct Backends {
    pub verifier: Arc<dyn Verifier>,
    pub users: Arc<dyn UserStore>,
    pub chats: Arc<dyn ChatStore>,
    pub cache: Arc<dyn Cache>,
    pub bus: Option<Arc<dyn Bus>>,
}

/// Live counts for health reporting.
#[derive(Debug, Clone, Copy)]
pub struct ServiceStats {
    pub sessions: usize,
    pub users: usize,
    pub channels: usize,
}

/// Root of the chat service.
pub struct ConnectionManager {
    verifier: Arc<dyn Verifier>,
    directory: Arc<RoomDirectory>,
    messages: Arc<MessageStore>,
    presence: Arc<PresenceTracker>,
    notifier: Arc<Notifier>,
    registry: Arc<SessionRegistry>,
    outbound_buffer: usize,
}

impl ConnectionManager {
    /// Wire the components together.
    #[must_use]
    pub fn new(backends: Backends, config: ChatConfig) -> Self {
        let Backends {
            verifier,
            users,
            chats,
            cache,
            bus,
        } = backends;

        let registry = Arc::new(SessionRegistry::new());
        let presence = Arc::new(PresenceTracker::new(
            Arc::clone(&cache),
            Arc::clone(&registry),
            config.presence,
        ));
        let directory = Arc::new(RoomDirectory::new(
            Arc::clone(&chats),
            users,
            Arc::clone(&cache),
            Arc::clone(&presence),
            config.messages.ttl,
        ));
        let messages = Arc::new(MessageStore::new(chats, cache, config.messages));
        let notifier = Arc::new(match bus {
            Some(bus) => Notifier::with_bus(config.notifier, bus),
            None => Notifier::new(config.notifier),
        });

        Self {
            verifier,
            directory,
            messages,
            presence,
            notifier,
            registry,
            outbound_buffer: config.outbound_buffer,
        }
    }

    /// Start receiving fan-out from other nodes, if a bus is configured.
    ///
    /// # Errors
    ///
    /// Returns an error if the bus subscription fails.
    pub async fn start(&self) -> Result<Option<JoinHandle<()>>, BusError> {
        self.notifier.start_bus_listener().await
    }

    #[must_use]
    pub fn directory(&self) -> &Arc<RoomDirectory> {
        &self.directory
    }

    #[must_use]
    pub fn messages(&self) -> &Arc<MessageStore> {
        &self.messages
    }

    #[must_use]
    pub fn presence(&self) -> &Arc<PresenceTracker> {
        &self.presence
    }

    #[must_use]
    pub fn notifier(&self) -> &Arc<Notifier> {
        &self.notifier
    }

    #[must_use]
    pub fn stats(&self) -> ServiceStats {
        ServiceStats {
            sessions: self.registry.session_count(),
            users: self.registry.user_count(),
            channels: self.notifier.stats().channel_count,
        }
    }

    /// Handshake: verify the `Authorization` header.
    ///
    /// # Errors
    ///
    /// Any [`AuthError`]; the caller must close the transport.
    pub fn authenticate(&self, header: Option<&str>) -> Result<UserId, AuthError> {
        identity::authenticate(self.verifier.as_ref(), header)
    }

    /// Activate a session for an authenticated user.
    ///
    /// Subscribes it to the user's personal channel, the presence channel
    /// and every room the user is in, marks the user online, announces it
    /// when this is their first socket, and queues `userAllChats`.
    ///
    /// # Errors
    ///
    /// Returns an error if the subscriptions cannot be set up. Presence and
    /// room-list failures are reported on the session instead.
    pub async fn open_session(&self, user: UserId) -> Result<(Arc<Session>, Outbound), ChatError> {
        let (session, outbound) = Session::new(user.clone(), self.outbound_buffer);
        let socket = session.socket_id().to_string();

        for channel in [user_channel(&user), PRESENCE_CHANNEL.to_string()] {
            match self.notifier.subscribe(&socket, &channel) {
                Ok(rx) => session.attach_personal(rx),
                Err(e) => {
                    session.shutdown();
                    self.notifier.unsubscribe_all(&socket);
                    return Err(e.into());
                }
            }
        }

        let open = self.registry.add(&user, &socket);
        info!(user = %user, connection = %socket, sessions = open, "Session opened");

        let first = match self.presence.connected(&user).await {
            Ok(first) => first,
            Err(e) => {
                warn!(user = %user, error = %e, "Presence write failed on connect");
                open == 1
            }
        };
        if first {
            self.publish_presence(PresenceStatus {
                user_id: user.clone(),
                is_online: true,
                last_seen: None,
            })
            .await;
        }

        match self.directory.list_user_rooms(&user).await {
            Ok(rooms) => {
                for summary in &rooms {
                    if let Err(e) = self.watch_room(&session, summary.room.id) {
                        warn!(user = %user, room = %summary.room.id, error = %e, "Room subscription skipped");
                        break;
                    }
                }
                session.send(ServerEvent::UserAllChats(rooms)).await;
            }
            Err(e) => self.report(&session, "connect", None, &e).await,
        }

        session.set_state(SessionState::Active);
        Ok((session, outbound))
    }

    /// Run one client operation. Failures go back to this session only.
    pub async fn dispatch(&self, session: &Arc<Session>, event: ClientEvent) {
        let op = event.name();
        let room = event_room(&event);
        debug!(user = %session.user_id(), connection = %session.socket_id(), op, "Dispatching");

        let result = match event {
            ClientEvent::JoinRoom(p) => self.join_room(session, p).await,
            ClientEvent::LeaveRoom(p) => {
                self.leave_room(session, &p);
                Ok(())
            }
            ClientEvent::SendMessage(p) => self.send_message(session, p).await,
            ClientEvent::Typing(p) => self.typing(session, p).await,
            ClientEvent::GetUserList => self.get_user_list(session).await,
            ClientEvent::CreateRoom(p) => self.create_room(session, p).await,
            ClientEvent::MarkRead(p) => self.mark_read(session, p).await,
            ClientEvent::GetUnreadCount(p) => self.get_unread_count(session, p).await,
        };

        if let Err(e) = result {
            self.report(session, op, room, &e).await;
        }
    }

    /// Send an exception to the session, logging infrastructure failures
    /// with enough context to reproduce them.
    pub async fn report(&self, session: &Session, op: &str, room: Option<String>, err: &ChatError) {
        let room = room.unwrap_or_default();
        if err.is_infrastructure() {
            error!(user = %session.user_id(), room = %room, op, error = %err, "Operation failed");
        } else {
            debug!(user = %session.user_id(), room = %room, op, error = %err, "Operation rejected");
        }
        session.send(ServerEvent::Exception(err.to_exception())).await;
    }

    /// Subscribe the session to a room channel. A session closed before or
    /// during the call is left unsubscribed.
    fn watch_room(&self, session: &Session, room: RoomId) -> Result<(), FanoutError> {
        if session.is_closed() || session.has_joined(&room) {
            return Ok(());
        }
        let rx = self.notifier.subscribe(session.socket_id(), &room_channel(&room))?;
        session.attach_room(room, rx);
        if session.is_closed() {
            session.detach_room(&room);
            self.notifier.unsubscribe_all(session.socket_id());
            debug!(user = %session.user_id(), room = %room, "Dropped subscription of closed session");
        }
        Ok(())
    }

    async fn resolve_room(
        &self,
        me: &UserId,
        selector: Option<RoomSelector>,
    ) -> Result<(Room, bool), ChatError> {
        match selector.ok_or(ChatError::MissingTarget)? {
            RoomSelector::Room(id) => Ok((self.directory.get_room(&id).await?, false)),
            RoomSelector::Direct(other) => {
                let direct = self.directory.get_or_create_direct_room(me, &other).await?;
                Ok((direct.room, direct.created))
            }
        }
    }

    /// Join a room: subscribe, mark it read, and push the recent window to
    /// everyone watching the room.
    ///
    /// # Errors
    ///
    /// [`ChatError::RoomNotFound`], [`ChatError::NotAParticipant`] and
    /// direct-room creation errors.
    pub async fn join_room(&self, session: &Session, payload: JoinRoom) -> Result<(), ChatError> {
        let me = session.user_id();
        let (room, created) = self.resolve_room(me, payload.selector()).await?;
        if !room.has_participant(me) {
            return Err(ChatError::NotAParticipant(room.id));
        }

        self.watch_room(session, room.id)?;
        if self.messages.mark_all_read_except(&room.id, me).await? > 0 {
            self.directory
                .invalidate_user_rooms(room.participant_ids.iter())
                .await;
        }
        let recent = self.messages.recent_messages(&room.id).await?;
        self.notifier
            .publish(&room_channel(&room.id), ServerEvent::Messages(recent))
            .await;
        info!(user = %me, room = %room.id, "Joined room");

        let participants: Vec<UserId> = room.participant_ids.iter().cloned().collect();
        let summary = self.directory.summary(room, me).await?;
        session.send(ServerEvent::RoomInfo(summary)).await;

        if created {
            self.push_chat_lists(&participants).await;
        }
        Ok(())
    }

    /// Stop watching a room. Membership is untouched.
    pub fn leave_room(&self, session: &Session, payload: &LeaveRoom) {
        if session.detach_room(&payload.room_id) {
            self.notifier
                .unsubscribe(session.socket_id(), &room_channel(&payload.room_id));
            debug!(user = %session.user_id(), room = %payload.room_id, "Left room");
        }
    }

    /// Append a message and fan it out to the room and to each recipient's
    /// personal channel.
    ///
    /// # Errors
    ///
    /// [`ChatError::EmptyText`] before anything is resolved or written, then
    /// the room resolution and append errors.
    pub async fn send_message(&self, session: &Session, payload: SendMessage) -> Result<(), ChatError> {
        let me = session.user_id();
        self.messages.validate_text(&payload.text)?;
        let (room, created) = self.resolve_room(me, payload.selector()).await?;

        let message = self.messages.append(&room.id, me, &payload.text).await?;
        self.directory
            .invalidate_user_rooms(room.participant_ids.iter())
            .await;

        let event = ServerEvent::NewMessage(message);
        self.notifier.publish(&room_channel(&room.id), event.clone()).await;
        for other in room.others(me) {
            self.notifier.publish(&user_channel(other), event.clone()).await;
        }

        if created {
            let participants: Vec<UserId> = room.participant_ids.iter().cloned().collect();
            self.push_chat_lists(&participants).await;
        }
        Ok(())
    }

    /// Broadcast a typing indicator to a room the session is watching.
    ///
    /// # Errors
    ///
    /// [`ChatError::NotAParticipant`] if the session has not joined the room.
    pub async fn typing(&self, session: &Session, payload: Typing) -> Result<(), ChatError> {
        if !session.has_joined(&payload.room_id) {
            return Err(ChatError::NotAParticipant(payload.room_id));
        }
        let event = ServerEvent::Typing(TypingStatus {
            room_id: payload.room_id,
            user: session.user_id().clone(),
            is_typing: payload.is_typing,
        });
        self.notifier
            .publish(&room_channel(&payload.room_id), event)
            .await;
        Ok(())
    }

    /// Reply with every user and their live presence.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is unavailable.
    pub async fn get_user_list(&self, session: &Session) -> Result<(), ChatError> {
        let users = self.directory.user_list().await?;
        session.send(ServerEvent::UserList(users)).await;
        Ok(())
    }

    /// Create a group room, watch it, and push chat lists to its members.
    ///
    /// # Errors
    ///
    /// [`ChatError::InvalidParticipants`] and friends.
    pub async fn create_room(&self, session: &Session, payload: CreateRoom) -> Result<(), ChatError> {
        let room = self
            .directory
            .create_group_room(session.user_id(), &payload.member_ids, &payload.name)
            .await?;
        self.watch_room(session, room.id)?;
        let participants: Vec<UserId> = room.participant_ids.iter().cloned().collect();
        self.push_chat_lists(&participants).await;
        Ok(())
    }

    /// Mark one message read and reply with the new unread count.
    ///
    /// # Errors
    ///
    /// [`ChatError::MessageNotFound`], [`ChatError::NotAParticipant`],
    /// [`ChatError::OwnMessage`].
    pub async fn mark_read(&self, session: &Session, payload: MarkRead) -> Result<(), ChatError> {
        let me = session.user_id();
        let message = self
            .messages
            .mark_message_read(&payload.message_id, me)
            .await?;
        if let Ok(room) = self.directory.get_room(&message.room_id).await {
            self.directory
                .invalidate_user_rooms(room.participant_ids.iter())
                .await;
        }
        let count = self.messages.unread_count(&message.room_id, me).await?;
        session
            .send(ServerEvent::UnreadCount(UnreadCount {
                room_id: message.room_id,
                count,
            }))
            .await;
        Ok(())
    }

    /// Reply with the unread count of one room.
    ///
    /// # Errors
    ///
    /// [`ChatError::RoomNotFound`] or [`ChatError::NotAParticipant`].
    pub async fn get_unread_count(
        &self,
        session: &Session,
        payload: GetUnreadCount,
    ) -> Result<(), ChatError> {
        let me = session.user_id();
        let room = self.directory.get_room(&payload.room_id).await?;
        if !room.has_participant(me) {
            return Err(ChatError::NotAParticipant(room.id));
        }
        let count = self.messages.unread_count(&room.id, me).await?;
        session
            .send(ServerEvent::UnreadCount(UnreadCount {
                room_id: room.id,
                count,
            }))
            .await;
        Ok(())
    }

    /// Keep the session's presence marker alive.
    pub async fn heartbeat(&self, session: &Session) {
        if let Err(e) = self.presence.touch(session.user_id()).await {
            warn!(user = %session.user_id(), error = %e, "Presence refresh failed");
        }
    }

    /// Tear a session down. Presence goes offline only with the user's last
    /// socket on any node. Closing twice is a no-op.
    pub async fn close_session(&self, session: &Session) {
        if session.is_closed() {
            return;
        }
        let user = session.user_id();
        let socket = session.socket_id();
        session.shutdown();
        self.notifier.unsubscribe_all(socket);

        let remaining = self.registry.remove(user, socket);
        info!(user = %user, connection = %socket, remaining, "Session closed");

        // Offline only once no node holds a socket for the user.
        match self.presence.disconnected(user).await {
            Ok(None) => {}
            Ok(Some(record)) => {
                self.publish_presence(PresenceStatus {
                    user_id: user.clone(),
                    is_online: false,
                    last_seen: Some(record.last_seen),
                })
                .await;
            }
            Err(e) => warn!(user = %user, error = %e, "Presence write failed on disconnect"),
        }
    }

    async fn publish_presence(&self, status: PresenceStatus) {
        self.notifier
            .publish(PRESENCE_CHANNEL, ServerEvent::OnlineStatus(status))
            .await;
    }

    /// Send each user their refreshed chat list on their personal channel.
    async fn push_chat_lists(&self, users: &[UserId]) {
        for user in users {
            match self.directory.list_user_rooms(user).await {
                Ok(rooms) => {
                    self.notifier
                        .publish(&user_channel(user), ServerEvent::ChatList(rooms))
                        .await;
                }
                Err(e) => error!(user = %user, op = "chatList", error = %e, "Chat list refresh failed"),
            }
        }
    }
}

/// Room named by a request, for log context.
fn event_room(event: &ClientEvent) -> Option<String> {
    match event {
        ClientEvent::JoinRoom(p) => p
            .room_id
            .map(|id| id.to_string())
            .or_else(|| p.receiver_id.as_ref().map(|u| format!("direct:{u}"))),
        ClientEvent::SendMessage(p) => p
            .room_id
            .map(|id| id.to_string())
            .or_else(|| p.receiver_id.as_ref().map(|u| format!("direct:{u}"))),
        ClientEvent::LeaveRoom(p) => Some(p.room_id.to_string()),
        ClientEvent::Typing(p) => Some(p.room_id.to_string()),
        ClientEvent::GetUnreadCount(p) => Some(p.room_id.to_string()),
        ClientEvent::MarkRead(_) | ClientEvent::GetUserList | ClientEvent::CreateRoom(_) => None,
    }
}
